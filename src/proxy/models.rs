//! Candidate data models

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Supported proxy protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
}

impl Protocol {
    /// URI scheme used by descriptors of this protocol
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vless" => Some(Protocol::Vless),
            "vmess" => Some(Protocol::Vmess),
            "trojan" => Some(Protocol::Trojan),
            "ss" => Some(Protocol::Shadowsocks),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vless => write!(f, "VLESS"),
            Protocol::Vmess => write!(f, "VMess"),
            Protocol::Trojan => write!(f, "Trojan"),
            Protocol::Shadowsocks => write!(f, "ShadowSocks"),
        }
    }
}

/// Transport-layer security of the outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn from_param(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "tls" | "xtls" => Security::Tls,
            "reality" => Security::Reality,
            _ => Security::None,
        }
    }
}

/// Stream settings shared by every protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    /// Network type (tcp, ws, grpc, h2, httpupgrade)
    pub network: String,
    pub security: Security,
    pub sni: Option<String>,
    /// uTLS client fingerprint (chrome, firefox, ...)
    pub fingerprint: Option<String>,
    pub alpn: Vec<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
    pub service_name: Option<String>,
    /// REALITY public key
    pub public_key: Option<String>,
    /// REALITY short id
    pub short_id: Option<String>,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            security: Security::None,
            sni: None,
            fingerprint: None,
            alpn: Vec::new(),
            path: None,
            host_header: None,
            service_name: None,
            public_key: None,
            short_id: None,
        }
    }
}

/// Protocol-specific authentication fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Credentials {
    Vless {
        id: Uuid,
        flow: Option<String>,
        encryption: String,
    },
    Vmess {
        id: Uuid,
        alter_id: u16,
        cipher: String,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
}

/// One parsed proxy configuration under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub transport: Transport,
    pub remark: Option<String>,
    /// The descriptor exactly as it appeared in the input
    pub uri: String,
}

impl Candidate {
    pub fn protocol(&self) -> Protocol {
        match self.credentials {
            Credentials::Vless { .. } => Protocol::Vless,
            Credentials::Vmess { .. } => Protocol::Vmess,
            Credentials::Trojan { .. } => Protocol::Trojan,
            Credentials::Shadowsocks { .. } => Protocol::Shadowsocks,
        }
    }

    /// Get the endpoint in HOST:PORT format, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn uses_tls(&self) -> bool {
        self.transport.security != Security::None
    }

    /// Server name presented during the TLS handshake
    pub fn server_name(&self) -> &str {
        self.transport.sni.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol().scheme(), self.address())
    }
}
