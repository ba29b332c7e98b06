//! Property change notification.
//!
//! Entities that want push-based change tracking embed a [`PropertyNotifier`]
//! and call [`PropertyNotifier::notify`] from their setters. Whoever tracks
//! the entity subscribes a listener and learns about each write without
//! diffing snapshots.
//!
//! ```rust,ignore
//! struct Blog {
//!     id: i32,
//!     name: Option<String>,
//!     notifier: PropertyNotifier,
//! }
//!
//! impl Blog {
//!     fn set_name(&mut self, name: Option<String>) {
//!         if self.name != name {
//!             self.name = name;
//!             self.notifier.notify("name");
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by [`PropertyNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Fan-out of "column changed" events to subscribed listeners.
///
/// Cloning a notifier yields a fresh, empty one: a copied entity is a
/// different instance and must not report into its original's subscriptions.
#[derive(Default)]
pub struct PropertyNotifier {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl PropertyNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener called with the column name on every change.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&'static str) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        tracing::trace!(subscription = id.0, "Property listener subscribed");
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        before != listeners.len()
    }

    /// Report that `column` was written.
    ///
    /// Listeners run outside the internal lock, so a listener may itself
    /// subscribe or unsubscribe.
    pub fn notify(&self, column: &'static str) {
        let listeners: Vec<Listener> = self
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(column);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            // A panicking listener cannot leave the list half-edited.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clone for PropertyNotifier {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
