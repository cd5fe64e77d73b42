//! Memory and session store implementations for SnapClaw.
//!
//! - [`InMemoryStore`] / [`InMemorySessionStore`]: ephemeral, for tests and
//!   one-shot CLI runs
//! - [`FileMemoryStore`]: `facts.json` snapshot plus `history.jsonl` log per session
//! - [`FileSessionStore`]: one append-only JSONL log per session
//! - [`NoopMemory`]: remembers nothing

pub mod noop;
pub mod in_memory;
pub mod file_backend;
pub mod session_file;

pub use noop::NoopMemory;
pub use in_memory::{InMemorySessionStore, InMemoryStore};
pub use file_backend::FileMemoryStore;
pub use session_file::FileSessionStore;

use snapclaw_core::session::SessionKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per session key.
///
/// Holding the guard gives exclusive access to that session's section of a
/// store; other sessions proceed in parallel.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
