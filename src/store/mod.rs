//! Thread store — the authoritative, append-only home of mirrored threads.

pub mod libsql_backend;
pub mod memory;
pub mod traits;

pub use libsql_backend::LibSqlThreadStore;
pub use memory::MemoryThreadStore;
pub use traits::{MirrorMessage, NewMirrorMessage, ThreadRecord, ThreadStore};
