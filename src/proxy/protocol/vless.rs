use super::{parse_authority, stream_settings, transport_from_query, ProtocolCodec};
use crate::error::ParseError;
use crate::proxy::models::{Candidate, Credentials, Protocol, Security};
use serde_json::{json, Value};
use uuid::Uuid;

/// `vless://<uuid>@<host>:<port>?<params>#<remark>`
#[derive(Debug, Clone, Copy, Default)]
pub struct VlessCodec;

impl ProtocolCodec for VlessCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Vless
    }

    fn parse(&self, uri: &str) -> Result<Candidate, ParseError> {
        let parts = parse_authority(uri, "vless")?;
        let id = Uuid::parse_str(&parts.user).map_err(|_| ParseError::InvalidId(parts.user.clone()))?;

        let credentials = Credentials::Vless {
            id,
            flow: parts.query.get("flow").filter(|f| !f.is_empty()).cloned(),
            encryption: parts
                .query
                .get("encryption")
                .filter(|e| !e.is_empty())
                .cloned()
                .unwrap_or_else(|| "none".to_string()),
        };

        Ok(Candidate {
            transport: transport_from_query(&parts.query, Security::None),
            host: parts.host,
            port: parts.port,
            credentials,
            remark: parts.remark,
            uri: uri.to_string(),
        })
    }

    fn describe(&self, candidate: &Candidate) -> Value {
        let user = match &candidate.credentials {
            Credentials::Vless {
                id,
                flow,
                encryption,
            } => json!({
                "id": id.to_string(),
                "encryption": encryption,
                "flow": flow.as_deref().unwrap_or_default(),
            }),
            _ => Value::Null,
        };

        json!({
            "tag": "proxy",
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": candidate.host,
                    "port": candidate.port,
                    "users": [user],
                }]
            },
            "streamSettings": stream_settings(candidate),
        })
    }
}
