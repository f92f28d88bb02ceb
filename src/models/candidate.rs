use serde::{Deserialize, Serialize};

/// Anonymity classification reported by the proxy listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    #[default]
    Unknown,
    Anonymous,
    Elite,
    Transparent,
}

impl AnonymityLevel {
    /// Map a listing label onto a level.
    ///
    /// Only `anonymous` and `elite proxy` (any case) are recognised; every other label is
    /// treated as transparent, since an unclassified proxy cannot be assumed to hide the origin.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "anonymous" => AnonymityLevel::Anonymous,
            "elite proxy" => AnonymityLevel::Elite,
            _ => AnonymityLevel::Transparent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityLevel::Unknown => "unknown",
            AnonymityLevel::Anonymous => "anonymous",
            AnonymityLevel::Elite => "elite",
            AnonymityLevel::Transparent => "transparent",
        }
    }

    pub fn is_transparent(&self) -> bool {
        matches!(self, AnonymityLevel::Transparent)
    }
}

impl std::fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proxy server discovered but not yet validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub ip: String,
    pub port: u16,
    pub country_code: String,
    pub country_name: String,
    pub anonymity: AnonymityLevel,
    pub supports_https: bool,
    /// Echo probe round-trip, set once when the validator accepts the candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ProxyCandidate {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            country_code: String::new(),
            country_name: String::new(),
            anonymity: AnonymityLevel::Unknown,
            supports_https: false,
            latency_ms: None,
        }
    }

    /// Human-readable note: `(code, country: level)`
    pub fn display_note(&self) -> String {
        format!(
            "({}, {}: {})",
            self.country_code, self.country_name, self.anonymity
        )
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        format_addr(&self.ip, self.port)
    }

    /// Configuration entry for this candidate
    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            ip: self.ip.clone(),
            port: self.port,
            note: self.display_note(),
            latency_ms: self.latency_ms,
        }
    }
}

/// A proxy address as carried by the configuration surface (`Proxies`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ProxyEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            note: String::new(),
            latency_ms: None,
        }
    }

    pub fn address(&self) -> String {
        format_addr(&self.ip, self.port)
    }

    /// Plain HTTP forward-proxy URL for this endpoint
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.address())
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.note.is_empty() {
            write!(f, "{}", self.address())
        } else {
            write!(f, "{} {}", self.address(), self.note)
        }
    }
}

fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> ProxyCandidate {
        ProxyCandidate {
            ip: "10.0.0.1".to_string(),
            port: 3128,
            country_code: "SE".to_string(),
            country_name: "Sweden".to_string(),
            anonymity: AnonymityLevel::Elite,
            supports_https: true,
            latency_ms: None,
        }
    }

    #[test]
    fn test_anonymity_label_mapping() {
        assert_eq!(
            AnonymityLevel::from_label("anonymous"),
            AnonymityLevel::Anonymous
        );
        assert_eq!(
            AnonymityLevel::from_label("ANONYMOUS"),
            AnonymityLevel::Anonymous
        );
        assert_eq!(
            AnonymityLevel::from_label("Elite Proxy"),
            AnonymityLevel::Elite
        );
        assert_eq!(
            AnonymityLevel::from_label("transparent"),
            AnonymityLevel::Transparent
        );
        assert_eq!(
            AnonymityLevel::from_label("elite"),
            AnonymityLevel::Transparent
        );
        assert_eq!(AnonymityLevel::from_label(""), AnonymityLevel::Transparent);

        assert!(AnonymityLevel::Transparent.is_transparent());
        assert!(!AnonymityLevel::Unknown.is_transparent());
        assert_eq!(AnonymityLevel::Elite.to_string(), "elite");
    }

    #[test]
    fn test_candidate_note_and_endpoint() {
        let mut c = candidate();
        assert_eq!(c.display_note(), "(SE, Sweden: elite)");
        assert_eq!(c.address(), "10.0.0.1:3128");

        c.latency_ms = Some(120);
        let endpoint = c.endpoint();
        assert_eq!(endpoint.ip, "10.0.0.1");
        assert_eq!(endpoint.port, 3128);
        assert_eq!(endpoint.note, "(SE, Sweden: elite)");
        assert_eq!(endpoint.latency_ms, Some(120));
        assert_eq!(endpoint.proxy_url(), "http://10.0.0.1:3128");
    }

    #[test]
    fn test_endpoint_formats_ipv6() {
        let endpoint = ProxyEndpoint::new("::1", 8080);
        assert_eq!(endpoint.address(), "[::1]:8080");
        assert_eq!(endpoint.proxy_url(), "http://[::1]:8080");
        assert_eq!(endpoint.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_endpoint_deserializes_without_note() {
        let endpoint: ProxyEndpoint =
            serde_json::from_str(r#"{"ip":"1.2.3.4","port":80}"#).unwrap();
        assert_eq!(endpoint, ProxyEndpoint::new("1.2.3.4", 80));
    }
}
