use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

/// Handle returned by [`Listeners::subscribe`], used to unsubscribe later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of callbacks for one event category
///
/// Callbacks run synchronously on the emitting task, in subscription order.
/// They must return quickly: a slow callback stalls the session loop.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerHandle, Callback<E>)>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

impl<E> Listeners<E> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn subscribe<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, Arc::new(callback)));
        handle
    }

    /// Remove a callback, returns whether it was registered
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(h, _)| *h != handle);
        entries.len() != before
    }

    /// Number of registered callbacks
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no callback is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback with `event`
    pub fn emit(&self, event: &E) {
        // Callbacks may (un)subscribe, so call them outside the lock
        let callbacks: Vec<Callback<E>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let listeners = Listeners::<u8>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            listeners.subscribe(move |event: &u8| seen.lock().unwrap().push((tag, *event)));
        }
        listeners.emit(&7);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let listeners = Listeners::<u8>::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let handle = listeners.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&1);

        assert!(listeners.unsubscribe(handle));
        assert!(!listeners.unsubscribe(handle));
        assert!(listeners.is_empty());

        listeners.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handles_are_distinct() {
        let listeners = Listeners::<()>::new();
        let a = listeners.subscribe(|()| {});
        let b = listeners.subscribe(|()| {});
        assert_ne!(a, b);
        assert_eq!(listeners.len(), 2);
    }
}
