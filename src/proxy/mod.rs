//! Forward proxy core.
//!
//! # Data Flow
//! ```text
//! server.rs (accept, spawn)
//!     → handler.rs (parse → filter → relay, one request per connection)
//!     → relay.rs (403 or upstream round trip)
//!     → transaction.rs (TransactionRecord)
//!     → observability::sink (MetricsSink::record)
//! ```

pub mod handler;
pub mod relay;
pub mod server;
pub mod transaction;

pub use handler::{handle_connection, ProxyContext};
pub use relay::{Relay, RelayError, RelayReport};
pub use server::ProxyServer;
pub use transaction::{Outcome, TransactionBuilder, TransactionRecord};
