use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

/// Observer registry. Registration hands back a [`Subscription`] capability;
/// fan-out isolates panicking handlers from the rest.
pub struct ListenerRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn register<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let registry: Weak<RegistryInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.handlers.lock().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `value` to every handler and returns how many of them panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Handlers run outside the lock so they may register or unsubscribe.
        let handlers: Vec<Handler<T>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let mut failures = 0;
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                failures += 1;
                warn!(registry = self.inner.name, "listener panicked during delivery");
            }
        }
        failures
    }
}

/// Registration handle. Dropping it unsubscribes; [`Subscription::detach`] keeps
/// the handler registered for the registry's lifetime.
#[must_use = "dropping a subscription unregisters its handler"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn detach(mut self) {
        self.release.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_all_handlers_in_registration_order() {
        let registry = ListenerRegistry::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first_seen = Arc::clone(&seen);
        let _first = registry.register(move |value| first_seen.lock().push(("first", *value)));
        let second_seen = Arc::clone(&seen);
        let _second = registry.register(move |value| second_seen.lock().push(("second", *value)));

        assert_eq!(registry.notify(&7), 0);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let registry = ListenerRegistry::<u32>::new("test");
        let delivered = Arc::new(AtomicUsize::new(0));

        let _bad = registry.register(|_| panic!("listener failure"));
        let counter = Arc::clone(&delivered);
        let _good = registry.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.notify(&1), 1);
        assert_eq!(registry.notify(&2), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let registry = ListenerRegistry::<u32>::new("test");
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&delivered);
        let kept = registry.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let removed = registry.register(|_| panic!("should be unsubscribed"));
        assert_eq!(registry.len(), 2);

        removed.unsubscribe();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.notify(&3), 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        drop(kept);
        assert!(registry.is_empty());
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let registry = ListenerRegistry::<u32>::new("test");
        registry.register(|_| {}).detach();

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let registry = ListenerRegistry::<u32>::new("test");
        let subscription = registry.register(|_| {});
        drop(registry);

        subscription.unsubscribe();
    }
}
