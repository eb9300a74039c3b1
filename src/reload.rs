//! Propagation of credential changes to live TLS listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

type ReloadCallback = Box<dyn Fn() + Send + Sync>;

/// Registry of "credentials changed" callbacks.
///
/// The server engine registers a hook that re-derives its TLS context from
/// the credential store; the renewal worker broadcasts after every store
/// mutation. Registration is explicit, there is no ambient listener
/// collection.
#[derive(Default)]
pub struct ReloadNotifier {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, ReloadCallback>>,
}

impl ReloadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback; the returned id unregisters it again.
    pub fn register(&self, callback: impl Fn() + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.callbacks.lock() {
            Ok(mut callbacks) => {
                callbacks.insert(id, Box::new(callback));
            }
            Err(_) => warn!("[reload] listener registry poisoned, dropping registration"),
        }
        id
    }

    /// Removes a previously registered callback. Returns whether it existed.
    pub fn unregister(&self, id: u64) -> bool {
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.remove(&id).is_some(),
            Err(_) => false,
        }
    }

    /// Invokes every registered callback.
    pub fn broadcast(&self) {
        match self.callbacks.lock() {
            Ok(callbacks) => {
                debug!(
                    "[reload] broadcasting credential change to {} listeners",
                    callbacks.len()
                );
                for callback in callbacks.values() {
                    callback();
                }
            }
            Err(_) => warn!("[reload] listener registry poisoned, skipping broadcast"),
        }
    }
}
