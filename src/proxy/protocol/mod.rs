//! Per-protocol descriptor codecs
//!
//! Every supported protocol implements [`ProtocolCodec`]: `parse` turns a
//! descriptor URI into a [`Candidate`], `describe` renders the outbound
//! section the protocol engine needs to dial it. Codecs are selected by URI
//! scheme so nothing else in the crate branches on the protocol.

mod shadowsocks;
mod trojan;
mod vless;
mod vmess;

pub use shadowsocks::ShadowsocksCodec;
pub use trojan::TrojanCodec;
pub use vless::VlessCodec;
pub use vmess::VmessCodec;

use crate::error::ParseError;
use crate::proxy::models::{Candidate, Protocol, Security, Transport};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use url::Url;

/// Parse/describe capability implemented once per protocol
pub trait ProtocolCodec: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Parse a full descriptor (scheme included) into a candidate
    fn parse(&self, uri: &str) -> Result<Candidate, ParseError>;

    /// Engine outbound configuration for a candidate of this protocol
    fn describe(&self, candidate: &Candidate) -> Value;
}

static VLESS: VlessCodec = VlessCodec;
static VMESS: VmessCodec = VmessCodec;
static TROJAN: TrojanCodec = TrojanCodec;
static SHADOWSOCKS: ShadowsocksCodec = ShadowsocksCodec;

/// Codec for a protocol
pub fn codec_for(protocol: Protocol) -> &'static dyn ProtocolCodec {
    match protocol {
        Protocol::Vless => &VLESS,
        Protocol::Vmess => &VMESS,
        Protocol::Trojan => &TROJAN,
        Protocol::Shadowsocks => &SHADOWSOCKS,
    }
}

/// Codec selected by the scheme of a descriptor
pub fn codec_for_uri(uri: &str) -> Result<&'static dyn ProtocolCodec, ParseError> {
    let (scheme, _) = split_scheme(uri)?;
    Protocol::from_scheme(scheme)
        .map(codec_for)
        .ok_or_else(|| ParseError::UnsupportedScheme(scheme.to_string()))
}

pub(crate) fn split_scheme(uri: &str) -> Result<(&str, &str), ParseError> {
    let (scheme, rest) = uri.split_once("://").ok_or(ParseError::MissingScheme)?;
    if scheme.is_empty() {
        return Err(ParseError::MissingScheme);
    }
    Ok((scheme, rest))
}

/// Decode base64 in any of the alphabets/padding variants seen in the wild
pub(crate) fn decode_base64(input: &str) -> Result<Vec<u8>, ParseError> {
    let input = input.trim();
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(input) {
            return Ok(bytes);
        }
    }
    Err(ParseError::InvalidBase64)
}

pub(crate) fn decode_base64_str(input: &str) -> Result<String, ParseError> {
    String::from_utf8(decode_base64(input)?).map_err(|_| ParseError::InvalidBase64)
}

pub(crate) fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

pub(crate) fn parse_port(raw: &str) -> Result<u16, ParseError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidPort(raw.to_string())),
    }
}

pub(crate) fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Pieces of an authority-style descriptor (`scheme://user@host:port?query#remark`)
pub(crate) struct AuthorityUri {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub query: HashMap<String, String>,
    pub remark: Option<String>,
}

pub(crate) fn parse_authority(uri: &str, protocol: &'static str) -> Result<AuthorityUri, ParseError> {
    let url = Url::parse(uri).map_err(|e| ParseError::malformed(protocol, e.to_string()))?;

    let host = url
        .host_str()
        .map(strip_brackets)
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingHost)?
        .to_string();

    let port = url
        .port()
        .filter(|p| *p != 0)
        .ok_or_else(|| ParseError::InvalidPort(String::new()))?;

    let query = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let remark = url
        .fragment()
        .map(percent_decode)
        .filter(|r| !r.trim().is_empty());

    Ok(AuthorityUri {
        user: percent_decode(url.username()),
        host,
        port,
        query,
        remark,
    })
}

fn non_empty(query: &HashMap<String, String>, key: &str) -> Option<String> {
    query
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Build transport settings from the query parameters shared by VLESS and Trojan
pub(crate) fn transport_from_query(
    query: &HashMap<String, String>,
    default_security: Security,
) -> Transport {
    let security = query
        .get("security")
        .map(|s| Security::from_param(s))
        .unwrap_or(default_security);

    Transport {
        network: non_empty(query, "type").unwrap_or_else(|| "tcp".to_string()),
        security,
        sni: non_empty(query, "sni").or_else(|| non_empty(query, "peer")),
        fingerprint: non_empty(query, "fp"),
        alpn: non_empty(query, "alpn")
            .map(|a| a.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        path: non_empty(query, "path"),
        host_header: non_empty(query, "host"),
        service_name: non_empty(query, "serviceName"),
        public_key: non_empty(query, "pbk"),
        short_id: non_empty(query, "sid"),
    }
}

/// Render engine `streamSettings` for a candidate's transport
pub(crate) fn stream_settings(candidate: &Candidate) -> Value {
    let transport = &candidate.transport;
    let mut settings = Map::new();
    settings.insert("network".into(), json!(transport.network));

    match transport.security {
        Security::None => {
            settings.insert("security".into(), json!("none"));
        }
        Security::Tls => {
            settings.insert("security".into(), json!("tls"));
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(candidate.server_name()));
            if let Some(fp) = &transport.fingerprint {
                tls.insert("fingerprint".into(), json!(fp));
            }
            if !transport.alpn.is_empty() {
                tls.insert("alpn".into(), json!(transport.alpn));
            }
            settings.insert("tlsSettings".into(), Value::Object(tls));
        }
        Security::Reality => {
            settings.insert("security".into(), json!("reality"));
            settings.insert(
                "realitySettings".into(),
                json!({
                    "serverName": candidate.server_name(),
                    "fingerprint": transport.fingerprint.as_deref().unwrap_or("chrome"),
                    "publicKey": transport.public_key.as_deref().unwrap_or_default(),
                    "shortId": transport.short_id.as_deref().unwrap_or_default(),
                }),
            );
        }
    }

    let path = transport.path.as_deref().unwrap_or("/");
    match transport.network.as_str() {
        "ws" => {
            let mut ws = json!({ "path": path });
            if let Some(host) = &transport.host_header {
                ws["headers"] = json!({ "Host": host });
            }
            settings.insert("wsSettings".into(), ws);
        }
        "grpc" => {
            settings.insert(
                "grpcSettings".into(),
                json!({ "serviceName": transport.service_name.as_deref().unwrap_or_default() }),
            );
        }
        "h2" | "http" => {
            let hosts: Vec<&str> = transport.host_header.as_deref().into_iter().collect();
            settings.insert("httpSettings".into(), json!({ "path": path, "host": hosts }));
        }
        "httpupgrade" => {
            settings.insert(
                "httpupgradeSettings".into(),
                json!({ "path": path, "host": transport.host_header.as_deref().unwrap_or_default() }),
            );
        }
        _ => {}
    }

    Value::Object(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_for_uri_dispatches_by_scheme() {
        let codec = codec_for_uri("trojan://pw@example.com:443").unwrap();
        assert_eq!(codec.protocol(), Protocol::Trojan);
        let codec = codec_for_uri("SS://abc").unwrap();
        assert_eq!(codec.protocol(), Protocol::Shadowsocks);
    }

    #[test]
    fn test_codec_for_uri_rejects_unknown_scheme() {
        assert!(matches!(
            codec_for_uri("http://1.2.3.4:8080"),
            Err(ParseError::UnsupportedScheme(s)) if s == "http"
        ));
        assert_eq!(codec_for_uri("1.2.3.4:8080").err(), Some(ParseError::MissingScheme));
    }

    #[test]
    fn test_decode_base64_variants() {
        assert_eq!(decode_base64_str("YWVzLTEyOC1nY206dGVzdA==").unwrap(), "aes-128-gcm:test");
        assert_eq!(decode_base64_str("YWVzLTEyOC1nY206dGVzdA").unwrap(), "aes-128-gcm:test");
        assert!(decode_base64("***").is_err());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("443").unwrap(), 443);
        assert!(parse_port("0").is_err());
        assert!(parse_port("70000").is_err());
        assert!(parse_port("abc").is_err());
    }

    #[test]
    fn test_transport_from_query() {
        let query: HashMap<String, String> = [
            ("type", "ws"),
            ("security", "tls"),
            ("sni", "cdn.example.com"),
            ("alpn", "h2,http/1.1"),
            ("path", "/ray"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let transport = transport_from_query(&query, Security::None);
        assert_eq!(transport.network, "ws");
        assert_eq!(transport.security, Security::Tls);
        assert_eq!(transport.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(transport.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(transport.path.as_deref(), Some("/ray"));
    }
}
