//! Proxy discovery, validation and retry-aware request execution
//!
//! Data flows leaves first:
//! - [`discovery`] produces candidates
//! - [`validator`] probes and ranks them
//! - [`pool`] publishes the ranked pool and binds one client per slot
//! - [`executor`] runs requests against a selected client with layered retries

pub mod backoff;
pub mod discovery;
pub mod executor;
pub mod pool;
pub mod retry;
pub mod transport;
pub mod validator;

pub use backoff::{BackoffEngine, JitterSource, SeededJitter, ThreadRngJitter};
pub use discovery::{CandidateSource, FreeProxyListSource, StaticSource};
pub use executor::HttpProxyClient;
pub use pool::{ClientRegistry, ProxyPool};
pub use retry::{RetryPolicy, RetryRecorder};
pub use transport::{
    ClientHandle, ClientOptions, FetchError, HttpTransport, ProxyTransport, RetryingClient,
};
pub use validator::{HttpProbe, ProxyProbe, ProxyValidator};
