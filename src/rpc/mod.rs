//! JSON-RPC access with endpoint failover
//!
//! - `transport`: JSON-RPC 2.0 wire format over HTTP
//! - `endpoint`: endpoint definitions and health bookkeeping
//! - `cache`: TTL response cache with stale fallback
//! - `adapter`: retries, failover, de-duplication and background probes

pub mod adapter;
pub mod cache;
pub mod endpoint;
pub mod transport;

pub use adapter::{CallOptions, ResilientRpcAdapter, RpcAdapterSettings};
pub use cache::{cache_key, CachedResponse, ResponseCache};
pub use endpoint::{EndpointHealth, EndpointHealthSnapshot, RpcEndpoint};
pub use transport::{parse_hex_u128, parse_hex_u64, to_hex_quantity, HttpRpcTransport, RpcTransport};
