use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use orbit_types::events::{ErrorKind, GatewayCommand, GatewayEvent};

use crate::registrar::{Delivery, EventSink, Registrar, Subscription};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Live queries a single socket may hold at once.
const MAX_SUBSCRIPTIONS: usize = 64;

/// Handle a single WebSocket connection: Identify handshake, then live
/// queries until the socket closes. Every live query is released on the way
/// out.
pub async fn handle_connection(socket: WebSocket, registrar: Registrar, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if !send_event(&mut sender, &ready).await {
        return;
    }

    run_connection_loop(sender, receiver, registrar, user_id, username).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    registrar: Registrar,
    user_id: Uuid,
    username: String,
) {
    // All of this socket's live queries write here
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Delivery>();
    let registrations = Registrations::default();
    let outbound = registrations.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                delivery = events_rx.recv() => {
                    let Some(delivery) = delivery else { break };
                    let Some(event) = outbound.admit(delivery) else { continue };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client. The subscription map lives in this task, so
    // aborting or finishing it releases every live query.
    let caller = user_id.to_string();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut session = Session {
            registrar,
            caller,
            events: events_tx,
            subscriptions: HashMap::new(),
            registrations,
        };

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => session.handle_command(cmd),
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Registrations currently bound to a socket. Events still queued from a
/// released registration are dropped on the way out, so a re-subscribe
/// under the same id never shows the client a result from the old query.
#[derive(Clone, Default)]
struct Registrations(Arc<Mutex<HashSet<u64>>>);

impl Registrations {
    fn lock(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self, delivery: Delivery) -> Option<GatewayEvent> {
        match delivery.registration {
            Some(registration) if !self.lock().contains(&registration) => {
                trace!("dropping event from released registration {}", registration);
                None
            }
            _ => Some(delivery.event),
        }
    }
}

/// Per-socket subscription table.
struct Session {
    registrar: Registrar,
    caller: String,
    events: EventSink,
    subscriptions: HashMap<String, Subscription>,
    registrations: Registrations,
}

impl Session {
    fn release(&mut self, subscription_id: &str) -> bool {
        let Some(subscription) = self.subscriptions.remove(subscription_id) else {
            return false;
        };
        self.registrations.lock().remove(&subscription.registration());
        subscription.release();
        true
    }

    fn handle_command(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Identify { .. } => {
                trace!("{} sent Identify twice, ignoring", self.caller);
            }

            GatewayCommand::Subscribe {
                subscription_id,
                query,
            } => {
                // Same id means the filter changed: release the old one first.
                if !self.release(&subscription_id) && self.subscriptions.len() >= MAX_SUBSCRIPTIONS {
                    let _ = self.events.send(Delivery::unscoped(GatewayEvent::SubscriptionError {
                        subscription_id,
                        kind: ErrorKind::Validation,
                        message: format!("at most {} live queries per connection", MAX_SUBSCRIPTIONS),
                    }));
                    return;
                }

                debug!("{} subscribing {} to {}", self.caller, subscription_id, query.collection);
                // Registered before the send task can look at the first snapshot.
                let mut registrations = self.registrations.lock();
                let subscription =
                    self.registrar
                        .subscribe(&self.caller, subscription_id.clone(), query, self.events.clone());
                registrations.insert(subscription.registration());
                drop(registrations);
                self.subscriptions.insert(subscription_id, subscription);
            }

            GatewayCommand::Unsubscribe { subscription_id } => {
                self.release(&subscription_id);
                // Acknowledged even when unknown, so clients can tear down blindly.
                let _ = self
                    .events
                    .send(Delivery::unscoped(GatewayEvent::Unsubscribed { subscription_id }));
            }
        }
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize gateway event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use orbit_types::api::Claims;

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orbit_db::Database;
    use orbit_types::models::Collection;
    use orbit_types::query::Query;
    use tokio::time::timeout;

    use super::*;
    use crate::Dispatcher;

    fn session() -> (Session, mpsc::UnboundedReceiver<Delivery>, Registrar) {
        session_over(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn session_over(db: Arc<Database>) -> (Session, mpsc::UnboundedReceiver<Delivery>, Registrar) {
        let registrar = Registrar::new(db, Dispatcher::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            registrar: registrar.clone(),
            caller: "u1".into(),
            events: tx,
            subscriptions: HashMap::new(),
            registrations: Registrations::default(),
        };
        (session, rx, registrar)
    }

    fn subscribe(id: &str) -> GatewayCommand {
        GatewayCommand::Subscribe {
            subscription_id: id.into(),
            query: Query::new(Collection::Tags),
        }
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_registration() {
        let (mut session, _rx, registrar) = session();
        session.handle_command(subscribe("tags"));
        session.handle_command(subscribe("tags"));
        assert_eq!(session.subscriptions.len(), 1);
        assert_eq!(registrar.dispatcher().live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_releases_and_acks() {
        let (mut session, mut rx, registrar) = session();
        session.handle_command(subscribe("tags"));
        session.handle_command(GatewayCommand::Unsubscribe {
            subscription_id: "tags".into(),
        });
        assert_eq!(registrar.dispatcher().live_subscriptions(), 0);

        // the ack is the last event for that id
        let mut last = None;
        while let Ok(delivery) = rx.try_recv() {
            last = session.registrations.admit(delivery);
        }
        assert_eq!(
            last,
            Some(GatewayEvent::Unsubscribed {
                subscription_id: "tags".into()
            })
        );
    }

    #[tokio::test]
    async fn dropping_the_session_releases_everything() {
        let (mut session, _rx, registrar) = session();
        session.handle_command(subscribe("a"));
        session.handle_command(subscribe("b"));
        assert_eq!(registrar.dispatcher().live_subscriptions(), 2);
        drop(session);
        assert_eq!(registrar.dispatcher().live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn subscription_cap_is_enforced() {
        let (mut session, mut rx, _registrar) = session();
        for i in 0..MAX_SUBSCRIPTIONS {
            session.handle_command(subscribe(&format!("s{}", i)));
        }
        session.handle_command(subscribe("one-too-many"));
        assert_eq!(session.subscriptions.len(), MAX_SUBSCRIPTIONS);

        let mut rejected = false;
        while let Ok(delivery) = rx.try_recv() {
            if let GatewayEvent::SubscriptionError { subscription_id, .. } = delivery.event {
                rejected |= subscription_id == "one-too-many";
            }
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn queued_snapshot_from_a_replaced_filter_is_dropped() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.create_user("alice", "a@example.com", "h").unwrap();
        let (mut session, mut rx, _registrar) = session_over(db);

        let by_name = |name: &str| GatewayCommand::Subscribe {
            subscription_id: "people".into(),
            query: Query::new(Collection::Users).where_eq("username", name),
        };

        session.handle_command(by_name("alice"));
        let stale = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

        // the client narrows the filter while the old snapshot is still queued
        session.handle_command(by_name("nobody"));
        assert_eq!(session.registrations.admit(stale), None);

        let fresh = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match session.registrations.admit(fresh) {
            Some(GatewayEvent::Snapshot { subscription_id, documents }) => {
                assert_eq!(subscription_id, "people");
                assert!(documents.is_empty());
            }
            other => panic!("expected the new snapshot, got {:?}", other),
        }
    }
}
