//! Descriptor parser for turning input lists into candidates

use crate::error::ParseError;
use crate::proxy::models::Candidate;
use crate::proxy::protocol::codec_for_uri;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Regex pattern to find descriptors embedded in free text (HTML pages, chat dumps)
static DESCRIPTOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:vless|vmess|trojan|ss)://[^\s<>"'`]+"#)
        .expect("Invalid descriptor regex")
});

/// A descriptor that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseFailure {
    /// 1-based line number in the input
    pub line: usize,
    pub input: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: ParseError,
}

fn serialize_display<S: serde::Serializer>(
    error: &ParseError,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Candidates and failures from one parse pass
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub candidates: Vec<Candidate>,
    pub failures: Vec<ParseFailure>,
    /// Number of descriptors skipped because they repeat an earlier one
    pub duplicates: usize,
}

impl ParseOutcome {
    fn admit(&mut self, seen: &mut HashSet<String>, candidate: Candidate) {
        if seen.insert(candidate.uri.clone()) {
            self.candidates.push(candidate);
        } else {
            self.duplicates += 1;
        }
    }

    fn reject(&mut self, line: usize, input: &str, error: ParseError) {
        debug!(line, %error, "unparsable descriptor");
        self.failures.push(ParseFailure {
            line,
            input: input.trim().to_string(),
            error,
        });
    }
}

/// Parser for descriptor lists
pub struct CandidateParser;

impl CandidateParser {
    /// Parse a single descriptor line
    ///
    /// Blank lines and `#` comments yield `Ok(None)`.
    pub fn parse_line(line: &str) -> std::result::Result<Option<Candidate>, ParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let codec = codec_for_uri(line)?;
        codec.parse(line).map(Some)
    }

    /// Parse descriptors from a string (one per line), keeping input order
    pub fn parse_string(content: &str) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();
        let mut seen = HashSet::new();

        for (index, line) in content.lines().enumerate() {
            match Self::parse_line(line) {
                Ok(Some(candidate)) => outcome.admit(&mut seen, candidate),
                Ok(None) => {}
                Err(error) => outcome.reject(index + 1, line, error),
            }
        }

        outcome
    }

    /// Parse free text, taking whole-line descriptors and descriptors embedded
    /// in other lines (HTML pages, chat dumps)
    ///
    /// Lines without anything descriptor-shaped are ignored unless they look
    /// like a URI, which is reported as a failure.
    pub fn parse_text(content: &str) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();
        let mut seen = HashSet::new();

        for (index, line) in content.lines().enumerate() {
            let error = match Self::parse_line(line) {
                Ok(Some(candidate)) => {
                    outcome.admit(&mut seen, candidate);
                    continue;
                }
                Ok(None) => continue,
                Err(error) => error,
            };

            let trimmed = line.trim();
            let embedded = Self::extract_descriptors(trimmed);
            if embedded.is_empty() || embedded == [trimmed] {
                if trimmed.contains("://") {
                    outcome.reject(index + 1, line, error);
                }
                continue;
            }
            for descriptor in embedded {
                match Self::parse_line(descriptor) {
                    Ok(Some(candidate)) => outcome.admit(&mut seen, candidate),
                    Ok(None) => {}
                    Err(error) => outcome.reject(index + 1, descriptor, error),
                }
            }
        }

        outcome
    }

    /// Find all descriptor-looking substrings in text
    pub fn extract_descriptors(content: &str) -> Vec<&str> {
        DESCRIPTOR_REGEX
            .find_iter(content)
            .map(|m| m.as_str())
            .collect()
    }

    /// Parse descriptors from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ParseOutcome> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_text(&content))
    }
}
