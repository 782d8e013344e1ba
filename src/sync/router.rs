//! Scoped subscriber registries and envelope dispatch.
//!
//! Consumers subscribe either to a whole service (`service scope`) or to one
//! object of a service (`object scope`). Every envelope is delivered to the
//! matching subscribers of both registries, each in registration order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::protocol::{object_scope_key, MessageEnvelope};

/// Callback invoked with every envelope of its scope.
pub type EnvelopeHandler = Arc<dyn Fn(&MessageEnvelope) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    identity: String,
    callback: EnvelopeHandler,
}

type Registry = HashMap<String, Vec<Registration>>;

#[derive(Default)]
struct Registries {
    service: Registry,
    object: Registry,
}

/// Routes decoded envelopes to their subscribers. Cheap to clone.
#[derive(Clone, Default)]
pub struct MessageRouter {
    registries: Arc<RwLock<Registries>>,
    verbose: bool,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log dropped envelopes at debug level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn register_service_scope<F>(&self, service_name: &str, identity: &str, callback: F)
    where
        F: Fn(&MessageEnvelope) -> Result<()> + Send + Sync + 'static,
    {
        let registration = Registration {
            identity: identity.to_string(),
            callback: Arc::new(callback),
        };
        self.registries
            .write()
            .service
            .entry(service_name.to_string())
            .or_default()
            .push(registration);
    }

    pub fn register_object_scope<F>(
        &self,
        service_name: &str,
        object_name: &str,
        identity: &str,
        callback: F,
    ) where
        F: Fn(&MessageEnvelope) -> Result<()> + Send + Sync + 'static,
    {
        let registration = Registration {
            identity: identity.to_string(),
            callback: Arc::new(callback),
        };
        self.registries
            .write()
            .object
            .entry(object_scope_key(service_name, object_name))
            .or_default()
            .push(registration);
    }

    /// Remove every registration of `identity` under `service_name` (service
    /// scope) and under `service_name#object_name` (object scope). Returns
    /// how many were removed.
    pub fn unregister(&self, identity: &str, service_name: &str, object_name: Option<&str>) -> usize {
        let mut registries = self.registries.write();
        let mut removed = remove_identity(&mut registries.service, service_name, identity);
        if let Some(object_name) = object_name {
            let key = object_scope_key(service_name, object_name);
            removed += remove_identity(&mut registries.object, &key, identity);
        }
        removed
    }

    /// Remove `identity` from every key of both registries.
    pub fn unregister_identity(&self, identity: &str) -> usize {
        let mut registries = self.registries.write();
        let Registries { service, object } = &mut *registries;
        let mut removed = 0;
        for registry in [service, object] {
            let keys: Vec<String> = registry.keys().cloned().collect();
            for key in keys {
                removed += remove_identity(registry, &key, identity);
            }
        }
        removed
    }

    /// Deliver `envelope` to its service-scope then object-scope subscribers.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> usize {
        let (service_handlers, object_handlers) = {
            let registries = self.registries.read();
            let key = object_scope_key(envelope.service_name(), envelope.object_name());
            (
                registries
                    .service
                    .get(envelope.service_name())
                    .cloned()
                    .unwrap_or_default(),
                registries.object.get(&key).cloned().unwrap_or_default(),
            )
        };

        let delivered = service_handlers.len() + object_handlers.len();
        if delivered == 0 {
            if self.verbose {
                tracing::debug!(
                    service = envelope.service_name(),
                    object = envelope.object_name(),
                    event = envelope.event_name(),
                    "dropping envelope without subscribers"
                );
            }
            return 0;
        }

        for registration in service_handlers.iter().chain(object_handlers.iter()) {
            let callback = &registration.callback;
            invoke_guarded(&registration.identity, || callback(envelope));
        }
        delivered
    }

    pub fn service_scope_len(&self, service_name: &str) -> usize {
        self.registries
            .read()
            .service
            .get(service_name)
            .map_or(0, Vec::len)
    }

    pub fn object_scope_len(&self, service_name: &str, object_name: &str) -> usize {
        self.registries
            .read()
            .object
            .get(&object_scope_key(service_name, object_name))
            .map_or(0, Vec::len)
    }
}

fn remove_identity(registry: &mut Registry, key: &str, identity: &str) -> usize {
    let Some(registrations) = registry.get_mut(key) else {
        return 0;
    };
    let before = registrations.len();
    registrations.retain(|r| r.identity != identity);
    let removed = before - registrations.len();
    if registrations.is_empty() {
        registry.remove(key);
    }
    removed
}

/// Run a consumer callback, logging its error or panic instead of
/// propagating it.
pub(crate) fn invoke_guarded<F>(name: &str, callback: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(handler = name, error = %err, "handler failed");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(handler = name, panic = %message, "handler panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> impl Fn(&MessageEnvelope) -> Result<()> {
        let log = log.clone();
        let label = label.to_string();
        move |env| {
            log.lock().push(format!("{label}:{}", env.event_name()));
            Ok(())
        }
    }

    fn envelope(service: &str, object: &str) -> MessageEnvelope {
        MessageEnvelope::new(service, object, "Push", json!({}))
    }

    #[test]
    fn test_dispatch_reaches_both_scopes_in_order() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.register_service_scope("Books", "a", recorder(&log, "svc1"));
        router.register_object_scope("Books", "Bookmarks", "a", recorder(&log, "obj1"));
        router.register_service_scope("Books", "b", recorder(&log, "svc2"));
        router.register_object_scope("Books", "Items", "a", recorder(&log, "other"));

        assert_eq!(router.dispatch(&envelope("Books", "Bookmarks")), 3);
        assert_eq!(*log.lock(), vec!["svc1:Push", "svc2:Push", "obj1:Push"]);
    }

    #[test]
    fn test_unregister_removes_only_that_identity() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.register_service_scope("Books", "reader", recorder(&log, "r1"));
        router.register_service_scope("Books", "reader", recorder(&log, "r2"));
        router.register_object_scope("Books", "Bookmarks", "reader", recorder(&log, "r3"));
        router.register_service_scope("Books", "shelf", recorder(&log, "s1"));

        assert_eq!(router.unregister("reader", "Books", Some("Bookmarks")), 3);
        assert_eq!(router.unregister("reader", "Books", Some("Bookmarks")), 0);

        router.dispatch(&envelope("Books", "Bookmarks"));
        assert_eq!(*log.lock(), vec!["s1:Push"]);
        assert_eq!(router.object_scope_len("Books", "Bookmarks"), 0);
    }

    #[test]
    fn test_unregister_identity_everywhere() {
        let router = MessageRouter::new();
        router.register_service_scope("Books", "x", |_| Ok(()));
        router.register_service_scope("Users", "x", |_| Ok(()));
        router.register_object_scope("Books", "Items", "x", |_| Ok(()));
        router.register_object_scope("Books", "Items", "y", |_| Ok(()));

        assert_eq!(router.unregister_identity("x"), 3);
        assert_eq!(router.service_scope_len("Books"), 0);
        assert_eq!(router.object_scope_len("Books", "Items"), 1);
    }

    #[test]
    fn test_unroutable_envelope_is_dropped() {
        let router = MessageRouter::new().verbose(true);
        assert_eq!(router.dispatch(&envelope("Nobody", "Listens")), 0);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_others() {
        let router = MessageRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.register_service_scope("Books", "bad", |_| anyhow::bail!("boom"));
        router.register_service_scope("Books", "worse", |_| panic!("handler panic"));
        router.register_service_scope("Books", "good", recorder(&log, "ok"));

        assert_eq!(router.dispatch(&envelope("Books", "Items")), 3);
        assert_eq!(*log.lock(), vec!["ok:Push"]);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let router = MessageRouter::new();
        let inner = router.clone();
        router.register_service_scope("Books", "once", move |_| {
            inner.unregister("once", "Books", None);
            Ok(())
        });

        assert_eq!(router.dispatch(&envelope("Books", "Items")), 1);
        assert_eq!(router.dispatch(&envelope("Books", "Items")), 0);
    }
}
