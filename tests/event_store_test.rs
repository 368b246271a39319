use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use serde_json::json;
use uuid::Uuid;

use chronik::{
    Aggregate, Event, EventAction, EventMiddleware, EventStore, FieldType, InMemoryPersistenceStrategy,
    Metadata, MetadataMatcher, Operation, StoreError, StreamSelection,
};

fn store() -> EventStore {
    EventStore::builder(InMemoryPersistenceStrategy::new())
        .try_build()
        .expect("store builds")
}

async fn installed_store() -> EventStore {
    let store = store();
    store.install().await.unwrap();
    store
}

#[tokio::test]
async fn install_is_idempotent() {
    let store = store();
    store.install().await.unwrap();
    store.install().await.unwrap();
    store.install().await.unwrap();
}

#[tokio::test]
async fn append_then_load_single_stream() {
    let store = installed_store().await;
    store.create_stream("users").await.unwrap();

    let ev_a = Event::new("registered", json!({"user": "a"}));
    let ev_b = Event::new("registered", json!({"user": "b"}));
    let (uuid_a, uuid_b) = (ev_a.uuid, ev_b.uuid);

    store.append_to("users", vec![ev_a.clone(), ev_b]).await.unwrap();

    let events: Vec<Event> = store.load("users", 1, None).await.unwrap().try_collect().await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!((events[0].no, events[0].uuid), (1, uuid_a));
    assert_eq!((events[1].no, events[1].uuid), (2, uuid_b));

    // Round trip: everything but the assigned number survives unchanged.
    assert_eq!(events[0], ev_a.with_no(1));
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let store = installed_store().await;
    // No stream exists, yet the empty append must not touch the back-end.
    store.append_to("missing", vec![]).await.unwrap();
}

#[tokio::test]
async fn append_to_unknown_stream_surfaces_stream_not_found() {
    let store = installed_store().await;
    let err = store
        .append_to("missing", vec![Event::new("e", json!(null))])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StreamNotFound(name) if name == "missing"));
}

#[tokio::test]
async fn duplicate_stream_creation_is_a_typed_error() {
    let store = installed_store().await;
    store.create_stream("users").await.unwrap();

    let err = store.create_stream("users").await.unwrap_err();
    assert!(matches!(err, StoreError::StreamAlreadyExists(name) if name == "users"));

    // The original stream is untouched by the failed second registration.
    store.append_to("users", vec![Event::new("e", json!(null))]).await.unwrap();
    let events: Vec<Event> = store.load("users", 1, None).await.unwrap().try_collect().await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn deleting_unknown_stream_is_a_typed_error() {
    let store = installed_store().await;
    let err = store.delete_stream("ghost").await.unwrap_err();
    assert!(matches!(err, StoreError::StreamNotFound(_)));
}

#[tokio::test]
async fn delete_stream_removes_registration_and_storage() {
    let store = installed_store().await;
    store.create_stream("tmp").await.unwrap();
    store.delete_stream("tmp").await.unwrap();

    assert!(!store.has_stream("tmp").await.unwrap());
    assert!(store.load("tmp", 1, None).await.is_err());
}

#[tokio::test]
async fn merge_and_load_orders_by_created_at() {
    let store = installed_store().await;
    store.create_stream("s1").await.unwrap();
    store.create_stream("s2").await.unwrap();

    let at = |seconds| Utc.timestamp_opt(seconds, 0).unwrap();
    store
        .append_to(
            "s1",
            vec![
                Event::new("one", json!(null)).with_created_at(at(10)),
                Event::new("three", json!(null)).with_created_at(at(30)),
            ],
        )
        .await
        .unwrap();
    store
        .append_to("s2", vec![Event::new("two", json!(null)).with_created_at(at(20))])
        .await
        .unwrap();

    let merged: Vec<Event> = store
        .merge_and_load(vec![StreamSelection::new("s1", 1), StreamSelection::new("s2", 1)])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let order: Vec<(&str, Option<&str>)> = merged
        .iter()
        .map(|event| (event.name(), event.metadata.stream()))
        .collect();
    assert_eq!(
        order,
        vec![("one", Some("s1")), ("two", Some("s2")), ("three", Some("s1"))]
    );
}

#[tokio::test]
async fn matcher_filters_loaded_events() {
    let store = installed_store().await;
    store.create_stream("orders").await.unwrap();

    let events = (1..=3)
        .map(|version| {
            Event::new("placed", json!({}))
                .with_aggregate_id("order-1")
                .with_version(version)
        })
        .collect();
    store.append_to("orders", events).await.unwrap();

    let matcher = MetadataMatcher::new()
        .with(Metadata::AGGREGATE_VERSION, Operation::GreaterThan, json!(1), FieldType::Metadata)
        .unwrap();

    let filtered: Vec<Event> = store
        .load("orders", 1, Some(matcher))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let versions: Vec<i64> = filtered
        .iter()
        .filter_map(|event| event.metadata.aggregate_version())
        .collect();
    assert_eq!(versions, vec![2, 3]);
}

#[tokio::test]
async fn concurrent_appends_with_same_version_conflict() {
    let store = installed_store().await;
    store.create_stream("agg").await.unwrap();

    let event = || {
        Event::new("changed", json!({}))
            .with_aggregate_id("X")
            .with_version(5)
    };

    let (left, right) = tokio::join!(
        store.append_to("agg", vec![event()]),
        store.append_to("agg", vec![event()])
    );

    assert!(left.is_ok() != right.is_ok(), "exactly one append must win");
    let failure = left.err().or(right.err()).unwrap();
    assert!(matches!(
        failure,
        StoreError::Concurrency { aggregate_id, version: 5 } if aggregate_id == "X"
    ));
}

// Middleware fixtures.

struct Stamp(&'static str);

#[async_trait]
impl EventMiddleware for Stamp {
    async fn apply(&self, event: Event) -> Result<Event, StoreError> {
        Ok(event.with_metadata("stamp", json!(self.0)))
    }
}

struct Reject;

#[async_trait]
impl EventMiddleware for Reject {
    async fn apply(&self, _event: Event) -> Result<Event, StoreError> {
        Err(StoreError::custom(std::io::Error::other("rejected")))
    }
}

#[derive(Clone, Default)]
struct Observer {
    seen: Arc<Mutex<Vec<Uuid>>>,
}

#[async_trait]
impl EventMiddleware for Observer {
    async fn apply(&self, event: Event) -> Result<Event, StoreError> {
        self.seen.lock().unwrap().push(event.uuid);
        Ok(event)
    }
}

struct FailingObserver;

#[async_trait]
impl EventMiddleware for FailingObserver {
    async fn apply(&self, _event: Event) -> Result<Event, StoreError> {
        Err(StoreError::custom(std::io::Error::other("observer down")))
    }
}

#[tokio::test]
async fn pre_append_transformations_are_persisted() {
    let store = EventStore::builder(InMemoryPersistenceStrategy::new())
        .add_middleware(EventAction::PreAppend, Stamp("pre"))
        .try_build()
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("s").await.unwrap();

    store.append_to("s", vec![Event::new("e", json!(null))]).await.unwrap();

    let events: Vec<Event> = store.load("s", 1, None).await.unwrap().try_collect().await.unwrap();
    assert_eq!(events[0].metadata.get("stamp"), Some(&json!("pre")));
}

#[tokio::test]
async fn failing_pre_append_aborts_the_append() {
    let store = EventStore::builder(InMemoryPersistenceStrategy::new())
        .add_middleware(EventAction::PreAppend, Reject)
        .try_build()
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("s").await.unwrap();

    let err = store.append_to("s", vec![Event::new("e", json!(null))]).await.unwrap_err();
    assert!(matches!(err, StoreError::Custom(_)));

    let events: Vec<Event> = store.load("s", 1, None).await.unwrap().try_collect().await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn appended_observers_fire_and_their_failures_are_swallowed() {
    let observer = Observer::default();
    let store = EventStore::builder(InMemoryPersistenceStrategy::new())
        .add_middleware(EventAction::Appended, FailingObserver)
        .add_middleware(EventAction::Appended, observer.clone())
        .try_build()
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("s").await.unwrap();

    let event = Event::new("e", json!(null));
    let uuid = event.uuid;
    store.append_to("s", vec![event]).await.unwrap();

    assert_eq!(*observer.seen.lock().unwrap(), vec![uuid]);
}

#[tokio::test]
async fn append_errored_observers_fire_on_persistence_failure() {
    let observer = Observer::default();
    let store = EventStore::builder(InMemoryPersistenceStrategy::new())
        .add_middleware(EventAction::AppendErrored, observer.clone())
        .try_build()
        .unwrap();
    store.install().await.unwrap();

    // Unknown stream makes the back-end fail after PRE_APPEND.
    let err = store
        .append_to("missing", vec![Event::new("e", json!(null))])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StreamNotFound(_)));
    assert_eq!(observer.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn loaded_middleware_applies_per_pull() {
    let store = EventStore::builder(InMemoryPersistenceStrategy::new())
        .add_middleware(EventAction::Loaded, Stamp("loaded"))
        .try_build()
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("s").await.unwrap();
    store.append_to("s", vec![Event::new("e", json!(null))]).await.unwrap();

    let events: Vec<Event> = store.load("s", 1, None).await.unwrap().try_collect().await.unwrap();
    assert_eq!(events[0].metadata.get("stamp"), Some(&json!("loaded")));
}

// Aggregate repository.

#[derive(Default, Debug)]
struct BankAccount {
    id: String,
    balance: i64,
    version: i64,
    pending: Vec<Event>,
}

impl BankAccount {
    fn open(id: &str) -> Self {
        let mut account = Self::default();
        account.record(Event::new("account_opened", json!({"id": id})));
        account
    }

    fn deposit(&mut self, amount: i64) {
        self.record(Event::new("deposited", json!({"amount": amount})));
    }

    fn record(&mut self, event: Event) {
        self.apply(&event);
        self.pending.push(event);
    }
}

impl Aggregate for BankAccount {
    const NAME: &'static str = "bank_account";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, event: &Event) {
        match event.name() {
            "account_opened" => {
                self.id = event.payload["id"].as_str().unwrap_or_default().to_string();
            }
            "deposited" => {
                self.balance += event.payload["amount"].as_i64().unwrap_or(0);
            }
            _ => {}
        }
    }

    fn drain_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

#[tokio::test]
async fn repository_round_trip() {
    let store = installed_store().await;
    store.create_stream("bank").await.unwrap();
    let repository = store.create_repository::<BankAccount>("bank");

    let mut account = BankAccount::open("acc-1");
    account.deposit(70);
    account.deposit(30);
    repository.save(&mut account).await.unwrap();
    assert_eq!(account.version, 3);
    assert!(account.pending.is_empty());

    let loaded = repository.get("acc-1").await.unwrap();
    assert_eq!(loaded.balance, 100);
    assert_eq!(loaded.version, 3);

    // Version metadata is stamped per event.
    let events: Vec<Event> = store.load("bank", 1, None).await.unwrap().try_collect().await.unwrap();
    let versions: Vec<i64> = events
        .iter()
        .filter_map(|event| event.metadata.aggregate_version())
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(events
        .iter()
        .all(|event| event.metadata.aggregate_type() == Some("bank_account")));
}

#[tokio::test]
async fn repository_load_returns_none_and_get_errors_when_absent() {
    let store = installed_store().await;
    store.create_stream("bank").await.unwrap();
    let repository = store.create_repository::<BankAccount>("bank");

    assert!(repository.load("nobody").await.unwrap().is_none());
    let err = repository.get("nobody").await.unwrap_err();
    assert!(matches!(err, StoreError::AggregateNotFound(id) if id == "nobody"));
}

#[tokio::test]
async fn repository_isolates_aggregates_within_one_stream() {
    let store = installed_store().await;
    store.create_stream("bank").await.unwrap();
    let repository = store.create_repository::<BankAccount>("bank");

    let mut first = BankAccount::open("acc-1");
    first.deposit(10);
    repository.save(&mut first).await.unwrap();

    let mut second = BankAccount::open("acc-2");
    second.deposit(99);
    repository.save(&mut second).await.unwrap();

    assert_eq!(repository.get("acc-1").await.unwrap().balance, 10);
    assert_eq!(repository.get("acc-2").await.unwrap().balance, 99);
}

#[tokio::test]
async fn stale_aggregate_save_conflicts() {
    let store = installed_store().await;
    store.create_stream("bank").await.unwrap();
    let repository = store.create_repository::<BankAccount>("bank");

    let mut account = BankAccount::open("acc-1");
    repository.save(&mut account).await.unwrap();

    let mut copy_a = repository.get("acc-1").await.unwrap();
    let mut copy_b = repository.get("acc-1").await.unwrap();

    copy_a.deposit(1);
    repository.save(&mut copy_a).await.unwrap();

    copy_b.deposit(2);
    let err = repository.save(&mut copy_b).await.unwrap_err();
    assert!(matches!(err, StoreError::Concurrency { version: 2, .. }));

    // The winner's write is intact.
    assert_eq!(repository.get("acc-1").await.unwrap().balance, 1);
}

#[tokio::test]
async fn determinism_same_events_same_state() {
    let store = installed_store().await;
    store.create_stream("bank").await.unwrap();
    let repository = store.create_repository::<BankAccount>("bank");

    let mut account = BankAccount::open("acc-1");
    for amount in [5, 10, 20] {
        account.deposit(amount);
    }
    repository.save(&mut account).await.unwrap();

    let first = repository.get("acc-1").await.unwrap();
    let second = repository.get("acc-1").await.unwrap();
    assert_eq!(first.balance, second.balance);
    assert_eq!(first.version, second.version);
}
