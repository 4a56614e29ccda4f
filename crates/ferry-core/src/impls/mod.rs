//! Impls - 実装（開発用・テスト用）
//!
//! In-memory implementations of the ports. Production storage and transport
//! implementations live in their own crates.

pub mod inmem_storage;
pub mod inmem_transport;

pub use self::inmem_storage::{InMemoryBatch, InMemoryConnection, InMemoryOutboxStorage};
pub use self::inmem_transport::InMemoryTransport;
