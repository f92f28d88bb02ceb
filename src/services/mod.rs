//! Background services

pub mod refresh;

pub use refresh::{PoolRefreshHandle, PoolRefreshService, PoolRefresher};
