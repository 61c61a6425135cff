//! In-process implementations of the shared collaborators.
//!
//! These back the tests and the CLI. Multiple limiters sharing one
//! `Arc<MemoryCounterStore>` and one `Arc<MemoryLock>` behave like separate
//! processes pointed at the same store and lock service.

mod lock;
mod memory;

pub use lock::{LockConfig, MemoryLock};
pub use memory::MemoryCounterStore;
