//! Live query registration.
//!
//! Each subscription is a task that evaluates its query, delivers the full
//! ordered result, then waits on the change feed and re-evaluates whenever
//! its collection is written. Results identical to the last delivery are not
//! sent again. Any failure is delivered once as a terminal error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use orbit_db::Database;
use orbit_types::events::{ChangeEvent, GatewayEvent};
use orbit_types::models::Document;
use orbit_types::query::Query;

use crate::GatewayError;
use crate::access::authorize;
use crate::dispatcher::Dispatcher;

/// Where a subscription's events go.
pub type EventSink = mpsc::UnboundedSender<Delivery>;

/// An event on its way to a client, tagged with the registration that
/// produced it. Events a connection emits on its own carry no registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub registration: Option<u64>,
    pub event: GatewayEvent,
}

impl Delivery {
    pub fn unscoped(event: GatewayEvent) -> Self {
        Self {
            registration: None,
            event,
        }
    }
}

/// Cleared on release, so nothing can be delivered afterwards.
type SharedSink = Arc<Mutex<Option<EventSink>>>;

#[derive(Clone)]
pub struct Registrar {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    next_registration: Arc<AtomicU64>,
}

impl Registrar {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            dispatcher,
            next_registration: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Start a live query for `caller`. Events are tagged with
    /// `subscription_id` and a registration number unique to this call, and
    /// sent to `sink` until the returned handle is released or dropped.
    pub fn subscribe(
        &self,
        caller: &str,
        subscription_id: impl Into<String>,
        query: Query,
        sink: EventSink,
    ) -> Subscription {
        let subscription_id = subscription_id.into();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        // Take the receiver before the first evaluation so no write slips between.
        let changes = self.dispatcher.subscribe();
        let sink: SharedSink = Arc::new(Mutex::new(Some(sink)));

        let live = LiveQuery {
            db: self.db.clone(),
            caller: caller.to_string(),
            subscription_id: subscription_id.clone(),
            registration,
            query,
            sink: sink.clone(),
        };
        let task = tokio::spawn(live.run(changes));

        self.dispatcher.track();
        debug!("{} opened live query {}", caller, subscription_id);

        Subscription {
            id: subscription_id,
            registration,
            sink,
            task,
            dispatcher: self.dispatcher.clone(),
        }
    }
}

/// Handle to a registered live query. Dropping it releases the query.
pub struct Subscription {
    id: String,
    registration: u64,
    sink: SharedSink,
    task: JoinHandle<()>,
    dispatcher: Dispatcher,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registration(&self) -> u64 {
        self.registration
    }

    /// Stop the query. No event is delivered once this returns.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let was_live = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some();
        if was_live {
            self.task.abort();
            self.dispatcher.untrack();
            debug!("released live query {}", self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LiveQuery {
    db: Arc<Database>,
    caller: String,
    subscription_id: String,
    registration: u64,
    query: Query,
    sink: SharedSink,
}

impl LiveQuery {
    async fn run(self, mut changes: broadcast::Receiver<ChangeEvent>) {
        if let Err(e) = self.authorize().await {
            warn!("{} live query {} rejected: {}", self.caller, self.subscription_id, e);
            self.fail(e);
            return;
        }

        let mut last: Option<Vec<Document>> = None;
        loop {
            match self.evaluate().await {
                Ok(documents) if last.as_ref() == Some(&documents) => {}
                Ok(documents) => {
                    let event = GatewayEvent::Snapshot {
                        subscription_id: self.subscription_id.clone(),
                        documents: documents.clone(),
                    };
                    if !self.deliver(event) {
                        return;
                    }
                    last = Some(documents);
                }
                Err(e) => {
                    warn!("{} live query {} failed: {}", self.caller, self.subscription_id, e);
                    self.fail(e);
                    return;
                }
            }

            if !self.wait_for_change(&mut changes).await {
                return;
            }
        }
    }

    /// Block until the watched collection changes. False once the feed closes.
    async fn wait_for_change(&self, changes: &mut broadcast::Receiver<ChangeEvent>) -> bool {
        loop {
            match changes.recv().await {
                Ok(change) if change.collection == self.query.collection => return true,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    debug!("live query {} lagged by {} changes", self.subscription_id, n);
                    return true;
                }
                Err(RecvError::Closed) => return false,
            }
        }
    }

    async fn authorize(&self) -> Result<(), GatewayError> {
        let db = self.db.clone();
        let caller = self.caller.clone();
        let query = self.query.clone();
        tokio::task::spawn_blocking(move || authorize(&db, &caller, &query)).await??;
        Ok(())
    }

    async fn evaluate(&self) -> Result<Vec<Document>, GatewayError> {
        let db = self.db.clone();
        let query = self.query.clone();
        Ok(tokio::task::spawn_blocking(move || db.query(&query)).await??)
    }

    /// Send while holding the sink lock. False once released or the
    /// receiving side is gone.
    fn deliver(&self, event: GatewayEvent) -> bool {
        let sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sink.as_ref() {
            Some(tx) => tx
                .send(Delivery {
                    registration: Some(self.registration),
                    event,
                })
                .is_ok(),
            None => false,
        }
    }

    fn fail(&self, error: GatewayError) {
        self.deliver(GatewayEvent::SubscriptionError {
            subscription_id: self.subscription_id.clone(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use orbit_types::api::CreatePostRequest;
    use orbit_types::events::ErrorKind;
    use orbit_types::models::{Collection, User};
    use orbit_types::query::Direction;
    use orbit_types::view::{LiveList, ViewState};
    use orbit_types::models::Post;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    use super::*;

    struct Harness {
        db: Arc<Database>,
        registrar: Registrar,
        alice: User,
        bob: User,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.create_user("alice", "a@example.com", "h").unwrap();
        let bob = db.create_user("bob", "b@example.com", "h").unwrap();
        let registrar = Registrar::new(db.clone(), Dispatcher::default());
        Harness { db, registrar, alice, bob }
    }

    impl Harness {
        fn post(&self, author: &User, title: &str) -> Post {
            let post = self
                .db
                .create_post(
                    &author.id,
                    &CreatePostRequest {
                        title: title.into(),
                        content: "x".into(),
                        tags: vec![],
                        media: None,
                    },
                )
                .unwrap();
            self.registrar.dispatcher().publish_all(&[Collection::Posts, Collection::Tags]);
            post
        }
    }

    fn posts_by(author: &User) -> Query {
        Query::new(Collection::Posts)
            .where_eq("author.id", author.id.as_str())
            .order_by("created_at", Direction::Desc)
    }

    async fn next(rx: &mut UnboundedReceiver<Delivery>) -> GatewayEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("sink closed")
            .event
    }

    async fn assert_quiet(rx: &mut UnboundedReceiver<Delivery>) {
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn empty_result_is_delivered_as_empty_not_loading() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.alice), tx);

        let mut view: LiveList<Post> = LiveList::new("mine");
        assert_eq!(*view.state(), ViewState::Loading);
        assert!(view.apply(&next(&mut rx).await));
        assert_eq!(*view.state(), ViewState::Empty);
    }

    #[tokio::test]
    async fn writes_push_full_snapshots() {
        let h = harness();
        h.post(&h.alice, "first");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.alice), tx);
        let mut view: LiveList<Post> = LiveList::new("mine");
        view.apply(&next(&mut rx).await);
        assert_eq!(view.items().len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        h.post(&h.alice, "second");
        view.apply(&next(&mut rx).await);
        let titles: Vec<_> = view.items().iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn unrelated_writes_do_not_redeliver() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.alice), tx);
        next(&mut rx).await;

        // same collection, outside the filter
        h.post(&h.bob, "not yours");
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn released_subscription_never_delivers_again() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.alice), tx);
        next(&mut rx).await;
        assert_eq!(h.registrar.dispatcher().live_subscriptions(), 1);

        sub.release();
        assert_eq!(h.registrar.dispatcher().live_subscriptions(), 0);

        h.post(&h.alice, "after release");
        // the sink was dropped with the handle, so the channel just ends
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_releases() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let _sub = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.alice), tx);
            next(&mut rx).await;
        }
        assert_eq!(h.registrar.dispatcher().live_subscriptions(), 0);
        h.post(&h.alice, "after drop");
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forbidden_query_gets_one_terminal_error() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let query = Query::new(Collection::Notifications).where_eq("user_id", h.bob.id.as_str());
        let _sub = h.registrar.subscribe(&h.alice.id, "badge", query, tx);

        match next(&mut rx).await {
            GatewayEvent::SubscriptionError { subscription_id, kind, .. } => {
                assert_eq!(subscription_id, "badge");
                assert_eq!(kind, ErrorKind::PermissionDenied);
            }
            other => panic!("expected an error, got {:?}", other),
        }

        h.db.toggle_like(&h.post(&h.bob, "bait").id, &h.alice.id).unwrap();
        h.registrar.dispatcher().publish(Collection::Notifications);
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn each_registration_is_numbered() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.alice), tx.clone());
        let second = h.registrar.subscribe(&h.alice.id, "mine", posts_by(&h.bob), tx);
        assert_ne!(first.registration(), second.registration());

        let mut seen = Vec::new();
        for _ in 0..2 {
            let delivery = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            seen.push(delivery.registration);
        }
        seen.sort();
        let mut expected = vec![Some(first.registration()), Some(second.registration())];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn invalid_query_reports_validation() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let query = Query::new(Collection::Posts).where_eq("bad field", 1);
        let _sub = h.registrar.subscribe(&h.alice.id, "broken", query, tx);

        let event = next(&mut rx).await;
        assert!(matches!(
            event,
            GatewayEvent::SubscriptionError { kind: ErrorKind::Validation, .. }
        ));
    }
}
