//! Live-updatable values.
//!
//! A [`Refreshable`] holds the current value of something that may change at
//! runtime, such as the client configuration. Readers take a cheap `Arc`
//! snapshot with [`get`](Refreshable::get); writers replace the value
//! wholesale. Background tasks can [`subscribe`](Refreshable::subscribe) to be
//! woken on change.
//!
//! ```text
//! update(new) ──► watch cell ──► get()        (call path, lock-free read)
//!                            └─► subscribe()  (DNS worker, change-driven)
//! ```

use std::{fmt, sync::Arc};

use tokio::sync::watch;

/// Shared, replaceable value.
///
/// Clones observe the same value.
pub struct Refreshable<T> {
    tx: Arc<watch::Sender<Arc<T>>>,
}

impl<T> Clone for Refreshable<T> {
    fn clone(&self) -> Self {
        Self { tx: Arc::clone(&self.tx) }
    }
}

impl<T: Send + Sync + 'static> Refreshable<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(value));
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.tx.borrow())
    }

    /// Replaces the value and notifies subscribers.
    pub fn update(&self, value: T) {
        self.tx.send_replace(Arc::new(value));
    }

    /// Returns a receiver that observes every subsequent update.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

impl<T: Default + Send + Sync + 'static> Default for Refreshable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Refreshable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Refreshable").field(&*self.tx.borrow()).finish()
    }
}

impl<T: Send + Sync + 'static> From<T> for Refreshable<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
