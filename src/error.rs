use thiserror::Error;

/// Unified error type for proxyrelay
///
/// Only setup-time and discovery paths return these. The steady-state request path
/// (`HttpProxyClient::get_string`) reports failure as an absent result instead.
#[derive(Error, Debug)]
pub enum ProxyError {
    // Discovery errors
    #[error("Proxy discovery failed: {0}")]
    Discovery(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Proxying is enabled for '{name}' but no proxies are available")]
    MissingProxies { name: String },

    #[error("Found {found} proxies, {required} required")]
    NotEnoughProxies { found: usize, required: usize },

    // Registry errors
    #[error("No client registered under '{0}'")]
    ClientNotRegistered(String),

    #[error("Client index {index} out of range for pool of {size}")]
    ClientIndexOutOfRange { index: usize, size: usize },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxyrelay operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Misconfiguration detected while building clients or pools
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidConfig(_)
                | ProxyError::MissingProxies { .. }
                | ProxyError::NotEnoughProxies { .. }
        )
    }

    /// Failure of the candidate source (unreachable or malformed listing)
    pub fn is_discovery_error(&self) -> bool {
        matches!(self, ProxyError::Discovery(_))
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidProxyAddress(err.to_string())
    }
}
