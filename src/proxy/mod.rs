//! Candidate descriptors
//!
//! This module provides functionality for:
//! - Parsing VLESS/VMess/Trojan/Shadowsocks URIs into candidates
//! - Describing candidates as protocol engine outbounds
//! - Extracting descriptors embedded in free text
//! - Locating resolved endpoints with a MaxMind database

pub mod geo;
pub mod models;
pub mod parser;
pub mod protocol;

pub use geo::{GeoLocator, GeoTag};
pub use models::{Candidate, Credentials, Protocol, Security, Transport};
pub use parser::{CandidateParser, ParseFailure, ParseOutcome};
pub use protocol::{codec_for, codec_for_uri, ProtocolCodec};
