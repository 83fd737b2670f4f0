//! Filtering HTTP/1.1 forward proxy library.

pub mod config;
pub mod filter;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::schema::ProxyConfig;
pub use filter::FilterEngine;
pub use lifecycle::Shutdown;
pub use proxy::{ProxyServer, TransactionRecord};
