//! Implementations of the storage, chain and bridge ports

pub mod bridge;
pub mod chain;
pub mod memory;
pub mod postgres;

pub use bridge::{HttpConfirmationClient, CONFIRMATION_BREAKER};
pub use chain::{native_to_wei, RpcChainClient};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
