//! Handle registry for resolving host objects from native callbacks.
//!
//! Native code never holds pointers to host-side wrappers. Instead a wrapper
//! is stored in a registry under an integer handle, and callbacks arriving
//! from the engine resolve the handle back to the wrapper.
//!
//! Uses DashMap so that insertions from several isolates or threads never
//! serialize on a single lock. A registered entry is a strong reference: it
//! keeps the wrapper alive until it is unregistered.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::{Error, Result};

/// Handle type - an opaque integer identifier for a registered object
pub type Handle = u64;

/// Invalid handle value, never issued by a registry
pub const INVALID_HANDLE: Handle = 0;

pub struct HandleRegistry<T> {
    entries: DashMap<Handle, T>,
    next: AtomicU64,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(INVALID_HANDLE + 1),
        }
    }

    /// Store `value` under a fresh handle
    pub fn register(&self, value: T) -> Handle {
        let handle = self.next.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(handle, value);
        handle
    }

    /// Remove a mapping, returning the stored value if it existed
    pub fn unregister(&self, handle: Handle) -> Option<T> {
        self.entries.remove(&handle).map(|(_, value)| value)
    }

    /// Check if a handle exists
    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Look up a registered value.
    ///
    /// An unknown or removed handle means a callback outlived the object it
    /// refers to, which is reported as `Error::UnknownHandle`.
    pub fn resolve(&self, handle: Handle) -> Result<T> {
        self.entries
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownHandle(handle))
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for HandleRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
