use super::{decode_base64_str, parse_port, split_scheme, stream_settings, ProtocolCodec};
use crate::error::ParseError;
use crate::proxy::models::{Candidate, Credentials, Protocol, Security, Transport};
use serde_json::{json, Value};
use uuid::Uuid;

/// `vmess://<base64 json>`
///
/// The payload is the v2rayN share object (`add`, `port`, `id`, `aid`,
/// `net`, `tls`, `sni`, `ps`, ...). Numeric fields show up both as JSON
/// numbers and as strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmessCodec;

fn field(obj: &Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ProtocolCodec for VmessCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Vmess
    }

    fn parse(&self, uri: &str) -> Result<Candidate, ParseError> {
        let (_, payload) = split_scheme(uri)?;
        // Some generators append a remark fragment after the payload
        let payload = payload.split('#').next().unwrap_or_default();
        let json = decode_base64_str(payload)?;
        let obj: Value = serde_json::from_str(&json)
            .map_err(|e| ParseError::malformed("vmess", e.to_string()))?;

        let host = field(&obj, "add").ok_or(ParseError::MissingHost)?;
        let port = parse_port(&field(&obj, "port").unwrap_or_default())?;
        let raw_id = field(&obj, "id").unwrap_or_default();
        let id = Uuid::parse_str(&raw_id).map_err(|_| ParseError::InvalidId(raw_id.clone()))?;
        let alter_id = field(&obj, "aid")
            .map(|a| a.parse::<u16>())
            .transpose()
            .map_err(|_| ParseError::malformed("vmess", "invalid alterId"))?
            .unwrap_or(0);

        let transport = Transport {
            network: field(&obj, "net").unwrap_or_else(|| "tcp".to_string()),
            security: field(&obj, "tls")
                .map(|t| Security::from_param(&t))
                .unwrap_or_default(),
            sni: field(&obj, "sni"),
            fingerprint: field(&obj, "fp"),
            alpn: field(&obj, "alpn")
                .map(|a| a.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            path: field(&obj, "path"),
            host_header: field(&obj, "host"),
            service_name: field(&obj, "path").filter(|_| field(&obj, "net").as_deref() == Some("grpc")),
            public_key: field(&obj, "pbk"),
            short_id: field(&obj, "sid"),
        };

        Ok(Candidate {
            host: super::strip_brackets(&host).to_string(),
            port,
            credentials: Credentials::Vmess {
                id,
                alter_id,
                cipher: field(&obj, "scy").unwrap_or_else(|| "auto".to_string()),
            },
            transport,
            remark: field(&obj, "ps"),
            uri: uri.to_string(),
        })
    }

    fn describe(&self, candidate: &Candidate) -> Value {
        let user = match &candidate.credentials {
            Credentials::Vmess {
                id,
                alter_id,
                cipher,
            } => json!({
                "id": id.to_string(),
                "alterId": alter_id,
                "security": cipher,
            }),
            _ => Value::Null,
        };

        json!({
            "tag": "proxy",
            "protocol": "vmess",
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

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn encode(payload: &Value) -> String {
        format!("vmess://{}", STANDARD.encode(payload.to_string()))
    }

    #[test]
    fn test_parse_vmess_string_port() {
        let uri = encode(&json!({
            "v": "2",
            "ps": "DE-01",
            "add": "vm.example.com",
            "port": "8080",
            "id": "a3482e88-686a-4a58-8126-99c9df64b7bf",
            "aid": "0",
            "net": "ws",
            "path": "/vm",
            "host": "vm.example.com",
            "tls": "tls",
        }));
        let candidate = VmessCodec.parse(&uri).unwrap();
        assert_eq!(candidate.host, "vm.example.com");
        assert_eq!(candidate.port, 8080);
        assert_eq!(candidate.protocol(), Protocol::Vmess);
        assert_eq!(candidate.transport.network, "ws");
        assert_eq!(candidate.transport.security, Security::Tls);
        assert_eq!(candidate.remark.as_deref(), Some("DE-01"));
    }

    #[test]
    fn test_parse_vmess_numeric_port() {
        let uri = encode(&json!({
            "add": "1.2.3.4",
            "port": 443,
            "id": "a3482e88-686a-4a58-8126-99c9df64b7bf",
            "aid": 64,
        }));
        let candidate = VmessCodec.parse(&uri).unwrap();
        assert_eq!(candidate.port, 443);
        assert!(matches!(
            candidate.credentials,
            Credentials::Vmess { alter_id: 64, .. }
        ));
        assert_eq!(candidate.transport.network, "tcp");
    }

    #[test]
    fn test_parse_vmess_invalid_payload() {
        assert_eq!(
            VmessCodec.parse("vmess://!!!").unwrap_err(),
            ParseError::InvalidBase64
        );
        let not_json = format!("vmess://{}", STANDARD.encode("hello"));
        assert!(matches!(
            VmessCodec.parse(&not_json),
            Err(ParseError::Malformed { protocol: "vmess", .. })
        ));
    }

    #[test]
    fn test_parse_vmess_missing_host() {
        let uri = encode(&json!({
            "port": 443,
            "id": "a3482e88-686a-4a58-8126-99c9df64b7bf",
        }));
        assert_eq!(VmessCodec.parse(&uri).unwrap_err(), ParseError::MissingHost);
    }

    #[test]
    fn test_describe_vmess() {
        let uri = encode(&json!({
            "add": "1.2.3.4",
            "port": 443,
            "id": "a3482e88-686a-4a58-8126-99c9df64b7bf",
            "net": "grpc",
            "path": "svc",
        }));
        let candidate = VmessCodec.parse(&uri).unwrap();
        let outbound = VmessCodec.describe(&candidate);
        assert_eq!(outbound["protocol"], "vmess");
        assert_eq!(outbound["settings"]["vnext"][0]["users"][0]["security"], "auto");
        assert_eq!(outbound["streamSettings"]["grpcSettings"]["serviceName"], "svc");
    }
}
