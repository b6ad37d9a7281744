use super::{decode_base64_str, parse_port, percent_decode, split_scheme, strip_brackets, stream_settings, ProtocolCodec};
use crate::error::ParseError;
use crate::proxy::models::{Candidate, Credentials, Protocol, Transport};
use serde_json::{json, Value};

/// Shadowsocks descriptors in either form:
///
/// - SIP002: `ss://base64(method:password)@host:port#remark`, or with a plain
///   percent-encoded `method:password` userinfo
/// - legacy: `ss://base64(method:password@host:port)#remark`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowsocksCodec;

fn split_method(userinfo: &str) -> Result<(String, String), ParseError> {
    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| ParseError::malformed("shadowsocks", "expected method:password"))?;
    if method.is_empty() || password.is_empty() {
        return Err(ParseError::malformed("shadowsocks", "empty method or password"));
    }
    Ok((method.to_ascii_lowercase(), password.to_string()))
}

fn split_host_port(host_port: &str) -> Result<(String, u16), ParseError> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| ParseError::InvalidPort(String::new()))?;
    let host = strip_brackets(host);
    if host.is_empty() {
        return Err(ParseError::MissingHost);
    }
    Ok((host.to_string(), parse_port(port.trim_end_matches('/'))?))
}

impl ProtocolCodec for ShadowsocksCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Shadowsocks
    }

    fn parse(&self, uri: &str) -> Result<Candidate, ParseError> {
        let (_, rest) = split_scheme(uri)?;
        let (body, remark) = match rest.split_once('#') {
            Some((body, remark)) => (body, Some(percent_decode(remark)).filter(|r| !r.trim().is_empty())),
            None => (rest, None),
        };
        // plugin options are not forwarded to the engine
        let body = body.split('?').next().unwrap_or_default();

        let ((method, password), (host, port)) = match body.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let userinfo = match decode_base64_str(userinfo) {
                    Ok(decoded) if decoded.contains(':') => decoded,
                    _ => percent_decode(userinfo),
                };
                (split_method(&userinfo)?, split_host_port(host_port)?)
            }
            None => {
                let decoded = decode_base64_str(body)?;
                let (userinfo, host_port) = decoded
                    .rsplit_once('@')
                    .ok_or_else(|| ParseError::malformed("shadowsocks", "missing host"))?;
                (split_method(userinfo)?, split_host_port(host_port)?)
            }
        };

        Ok(Candidate {
            host,
            port,
            credentials: Credentials::Shadowsocks { method, password },
            transport: Transport::default(),
            remark,
            uri: uri.to_string(),
        })
    }

    fn describe(&self, candidate: &Candidate) -> Value {
        let (method, password) = match &candidate.credentials {
            Credentials::Shadowsocks { method, password } => (method.as_str(), password.as_str()),
            _ => ("", ""),
        };

        json!({
            "tag": "proxy",
            "protocol": "shadowsocks",
            "settings": {
                "servers": [{
                    "address": candidate.host,
                    "port": candidate.port,
                    "method": method,
                    "password": password,
                }]
            },
            "streamSettings": stream_settings(candidate),
        })
    }
}
