//! Model-level change subscriptions.
//!
//! Subscribers are called synchronously, in registration order, after each
//! create, update, or destroy has finished its index maintenance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::record::Record;

/// Identifies a subscription for [`Subscribers::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// The kind of mutation that produced a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Update,
    Destroy,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Create => write!(f, "create"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Destroy => write!(f, "destroy"),
        }
    }
}

/// A committed mutation of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Create {
        record: Record,
        /// Every field of the created record.
        changed_columns: Vec<String>,
    },
    Update {
        old: Record,
        new: Record,
        /// The fields supplied in the update values.
        changed_columns: Vec<String>,
    },
    Destroy {
        old: Record,
        /// Every field of the destroyed record.
        changed_columns: Vec<String>,
    },
}

impl ChangeEvent {
    pub(crate) fn create(record: Record) -> Self {
        let changed_columns = record.keys().cloned().collect();
        ChangeEvent::Create {
            record,
            changed_columns,
        }
    }

    pub(crate) fn update(old: Record, new: Record, values: &Record) -> Self {
        ChangeEvent::Update {
            old,
            new,
            changed_columns: values.keys().cloned().collect(),
        }
    }

    pub(crate) fn destroy(old: Record) -> Self {
        let changed_columns = old.keys().cloned().collect();
        ChangeEvent::Destroy {
            old,
            changed_columns,
        }
    }

    pub fn operation(&self) -> ChangeOperation {
        match self {
            ChangeEvent::Create { .. } => ChangeOperation::Create,
            ChangeEvent::Update { .. } => ChangeOperation::Update,
            ChangeEvent::Destroy { .. } => ChangeOperation::Destroy,
        }
    }

    pub fn changed_columns(&self) -> &[String] {
        match self {
            ChangeEvent::Create {
                changed_columns, ..
            }
            | ChangeEvent::Update {
                changed_columns, ..
            }
            | ChangeEvent::Destroy {
                changed_columns, ..
            } => changed_columns,
        }
    }

    /// The record as it exists after the change, `None` for a destroy.
    pub fn current(&self) -> Option<&Record> {
        match self {
            ChangeEvent::Create { record, .. } => Some(record),
            ChangeEvent::Update { new, .. } => Some(new),
            ChangeEvent::Destroy { .. } => None,
        }
    }

    /// The record as it existed before the change, `None` for a create.
    pub fn previous(&self) -> Option<&Record> {
        match self {
            ChangeEvent::Create { .. } => None,
            ChangeEvent::Update { old, .. } | ChangeEvent::Destroy { old, .. } => Some(old),
        }
    }
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    callback: Callback,
    columns: Option<Vec<String>>,
}

impl Subscription {
    fn wants(&self, event: &ChangeEvent) -> bool {
        match &self.columns {
            None => true,
            Some(columns) => event
                .changed_columns()
                .iter()
                .any(|changed| columns.contains(changed)),
        }
    }
}

/// Registry of change subscribers for one model.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    entries: RwLock<Vec<Subscription>>,
}

impl Subscribers {
    pub(crate) fn subscribe<F>(&self, callback: F, columns: Option<Vec<String>>) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                callback: Arc::new(callback),
                columns,
            });
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|subscription| subscription.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers an event to every interested subscriber.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe; such changes apply from the next event.
    pub(crate) fn notify(&self, event: &ChangeEvent) {
        let callbacks: Vec<Callback> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|subscription| subscription.wants(event))
                .map(|subscription| Arc::clone(&subscription.callback))
                .collect()
        };
        if callbacks.is_empty() {
            return;
        }
        tracing::trace!(operation = %event.operation(), subscribers = callbacks.len(), "notifying");
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn recorder() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.operation().to_string());
        })
    }

    #[test]
    fn should_notify_in_registration_order() {
        // given
        let subscribers = Subscribers::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let order = Arc::clone(&order);
            subscribers.subscribe(move |_| order.lock().unwrap().push(name), None);
        }

        // when
        subscribers.notify(&ChangeEvent::create(record(json!({"id": 1}))));

        // then
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn should_filter_by_changed_columns() {
        // given
        let subscribers = Subscribers::default();
        let (name_seen, on_name) = recorder();
        let (foo_seen, on_foo) = recorder();
        subscribers.subscribe(on_name, Some(vec!["name".to_string()]));
        subscribers.subscribe(on_foo, Some(vec!["foo".to_string()]));
        let old = record(json!({"id": 1, "name": "Old"}));
        let new = record(json!({"id": 1, "name": "New"}));

        // when
        subscribers.notify(&ChangeEvent::update(
            old,
            new,
            &record(json!({"name": "New"})),
        ));

        // then
        assert_eq!(*name_seen.lock().unwrap(), vec!["update"]);
        assert!(foo_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn should_stop_notifying_after_unsubscribe() {
        // given
        let subscribers = Subscribers::default();
        let (seen, callback) = recorder();
        let id = subscribers.subscribe(callback, None);

        // when
        assert!(subscribers.unsubscribe(id));
        subscribers.notify(&ChangeEvent::destroy(record(json!({"id": 1}))));

        // then
        assert!(seen.lock().unwrap().is_empty());
        assert!(!subscribers.unsubscribe(id));
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn should_report_changed_columns_per_operation() {
        let created = ChangeEvent::create(record(json!({"id": 1, "name": "A"})));
        assert_eq!(created.changed_columns(), &["id", "name"]);
        assert_eq!(created.previous(), None);

        let destroyed = ChangeEvent::destroy(record(json!({"id": 1, "name": "A"})));
        assert_eq!(destroyed.changed_columns(), &["id", "name"]);
        assert_eq!(destroyed.current(), None);
        assert_eq!(destroyed.operation().to_string(), "destroy");
    }

    #[test]
    fn should_allow_unsubscribing_from_a_callback() {
        // given
        let subscribers = Arc::new(Subscribers::default());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let id = {
            let registry = Arc::clone(&subscribers);
            let slot = Arc::clone(&slot);
            subscribers.subscribe(
                move |_| {
                    if let Some(id) = slot.lock().unwrap().take() {
                        registry.unsubscribe(id);
                    }
                },
                None,
            )
        };
        *slot.lock().unwrap() = Some(id);

        // when
        subscribers.notify(&ChangeEvent::create(record(json!({"id": 1}))));

        // then
        assert_eq!(subscribers.len(), 0);
    }
}
