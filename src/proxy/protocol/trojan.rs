use super::{parse_authority, stream_settings, transport_from_query, ProtocolCodec};
use crate::error::ParseError;
use crate::proxy::models::{Candidate, Credentials, Protocol, Security};
use serde_json::{json, Value};

/// `trojan://<password>@<host>:<port>?<params>#<remark>`
///
/// Trojan runs over TLS unless the descriptor says `security=none`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrojanCodec;

impl ProtocolCodec for TrojanCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Trojan
    }

    fn parse(&self, uri: &str) -> Result<Candidate, ParseError> {
        let parts = parse_authority(uri, "trojan")?;
        if parts.user.is_empty() {
            return Err(ParseError::malformed("trojan", "missing password"));
        }

        Ok(Candidate {
            transport: transport_from_query(&parts.query, Security::Tls),
            host: parts.host,
            port: parts.port,
            credentials: Credentials::Trojan {
                password: parts.user,
            },
            remark: parts.remark,
            uri: uri.to_string(),
        })
    }

    fn describe(&self, candidate: &Candidate) -> Value {
        let password = match &candidate.credentials {
            Credentials::Trojan { password } => password.as_str(),
            _ => "",
        };

        json!({
            "tag": "proxy",
            "protocol": "trojan",
            "settings": {
                "servers": [{
                    "address": candidate.host,
                    "port": candidate.port,
                    "password": password,
                }]
            },
            "streamSettings": stream_settings(candidate),
        })
    }
}
