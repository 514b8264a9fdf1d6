//! Persistence layer: pluggable storage for visitors, tokens, leads and audit records.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;
pub mod vault;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::PipelineStore;
pub use vault::ContactCipher;
