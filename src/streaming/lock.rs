//! Per-stream content lock
//!
//! A single exclusive token that serializes every mutation of a stream's
//! loaded tiles, dirty set and tile files. The owner is recorded for
//! diagnostics only.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Who currently holds the content lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// Range recompute, unload and load start
    StreamingPass,
    /// A finished tile load inserting itself into the loaded set
    TilePublish,
    /// Dirty tile persistence
    DirtyFlush,
    /// Caller-driven edit of tile content
    Editor,
    /// Final flush and teardown
    Shutdown,
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockOwner::StreamingPass => "streaming pass",
            LockOwner::TilePublish => "tile publish",
            LockOwner::DirtyFlush => "dirty flush",
            LockOwner::Editor => "editor",
            LockOwner::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

struct LockState {
    owner: Mutex<Option<LockOwner>>,
    released: Notify,
}

impl LockState {
    fn owner(&self) -> Option<LockOwner> {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive content lock. Clones refer to the same lock.
#[derive(Clone)]
pub struct ContentLock {
    state: Arc<LockState>,
}

impl ContentLock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LockState {
                owner: Mutex::new(None),
                released: Notify::new(),
            }),
        }
    }

    /// Current owner, `None` when free
    pub fn owner(&self) -> Option<LockOwner> {
        self.state.owner()
    }

    pub fn is_held(&self) -> bool {
        self.owner().is_some()
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self, owner: LockOwner) -> Option<ContentGuard> {
        let mut current = self.state.owner.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            return None;
        }
        *current = Some(owner);
        log::trace!("Content lock acquired by {}", owner);
        Some(ContentGuard {
            state: self.state.clone(),
            owner,
        })
    }

    /// Take the lock, suspending until it is released by its current owner.
    pub async fn acquire(&self, owner: LockOwner) -> ContentGuard {
        loop {
            let notified = self.state.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(guard) = self.try_acquire(owner) {
                return guard;
            }
            notified.await;
        }
    }
}

impl Default for ContentLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContentLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentLock")
            .field("owner", &self.owner())
            .finish()
    }
}

/// Proof of lock ownership. Releasing happens on drop, including on early return.
pub struct ContentGuard {
    state: Arc<LockState>,
    owner: LockOwner,
}

impl ContentGuard {
    pub fn owner(&self) -> LockOwner {
        self.owner
    }
}

impl Drop for ContentGuard {
    fn drop(&mut self) {
        {
            let mut current = self.state.owner.lock().unwrap_or_else(|e| e.into_inner());
            *current = None;
        }
        log::trace!("Content lock released by {}", self.owner);
        self.state.released.notify_waiters();
    }
}

impl fmt::Debug for ContentGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentGuard")
            .field("owner", &self.owner)
            .finish()
    }
}
