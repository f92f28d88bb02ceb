use serde::{Deserialize, Serialize};

/// Candidate filters and acceptance thresholds for a validation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFilters {
    /// Drop transparent proxies and require the echoed egress IP to match the proxy IP
    pub non_transparent_only: bool,
    /// Country codes to keep, compared case-insensitively (empty = all)
    pub countries: Vec<String>,
    /// Required HTTPS flag (None = either)
    pub https: Option<bool>,
    /// Stop once this many candidates are accepted (0 = probe everything)
    pub required: usize,
    /// Maximum echo round-trip in milliseconds (0 = no limit)
    pub max_latency_ms: u64,
    /// Per-request probe timeout in seconds
    pub probe_timeout_secs: u64,
}

impl Default for ValidationFilters {
    fn default() -> Self {
        Self {
            non_transparent_only: true,
            countries: vec![],
            https: Some(true),
            required: 10,
            max_latency_ms: 1000,
            probe_timeout_secs: 5,
        }
    }
}

/// Probe endpoints and fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Endpoint that reports the caller's public IP
    pub echo_url: String,
    /// CSS selector of the element holding the echoed IP
    pub echo_selector: String,
    /// Independent endpoint used as a second liveness check
    pub liveness_url: String,
    /// Number of candidates probed at once
    pub concurrency: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            echo_url: "http://www.whatismyip.cz/".to_string(),
            echo_selector: "div.ip".to_string(),
            liveness_url: "https://www.google.com/".to_string(),
            concurrency: 16,
        }
    }
}
