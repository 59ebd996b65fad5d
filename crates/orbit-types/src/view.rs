//! Client-side mirror of a live query.
//!
//! Every snapshot replaces the displayed list wholesale. There is no merge:
//! an entry disappears only by being absent from the next snapshot.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::events::GatewayEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState<T> {
    /// Registered, nothing delivered yet.
    Loading,
    /// A snapshot arrived and it was empty.
    Empty,
    Ready(Vec<T>),
    /// Terminal. Later snapshots are ignored.
    Failed(String),
    /// Released by its owner. Later snapshots are ignored.
    Released,
}

#[derive(Debug)]
pub struct LiveList<T> {
    subscription_id: String,
    state: ViewState<T>,
}

impl<T: DeserializeOwned> LiveList<T> {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            state: ViewState::Loading,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn state(&self) -> &ViewState<T> {
        &self.state
    }

    pub fn items(&self) -> &[T] {
        match &self.state {
            ViewState::Ready(items) => items.as_slice(),
            _ => &[],
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, ViewState::Failed(_) | ViewState::Released)
    }

    /// Feed a gateway event. Returns true when the displayed state changed.
    pub fn apply(&mut self, event: &GatewayEvent) -> bool {
        if event.subscription_id() != Some(self.subscription_id.as_str()) || !self.is_live() {
            return false;
        }

        match event {
            GatewayEvent::Snapshot { documents, .. } => {
                let decoded: Result<Vec<T>, _> = documents.iter().map(|d| d.decode()).collect();
                self.state = match decoded {
                    Ok(items) if items.is_empty() => ViewState::Empty,
                    Ok(items) => ViewState::Ready(items),
                    Err(e) => {
                        warn!("Snapshot for {} held a malformed document: {}", self.subscription_id, e);
                        ViewState::Failed(format!("malformed document: {}", e))
                    }
                };
                true
            }
            GatewayEvent::SubscriptionError { message, .. } => {
                self.state = ViewState::Failed(message.clone());
                true
            }
            GatewayEvent::Unsubscribed { .. } => {
                self.state = ViewState::Released;
                true
            }
            GatewayEvent::Ready { .. } => false,
        }
    }

    /// Show a locally created item before the store confirms it. The next
    /// snapshot overwrites it either way.
    pub fn echo(&mut self, item: T) {
        match &mut self.state {
            ViewState::Ready(items) => items.push(item),
            ViewState::Loading | ViewState::Empty => self.state = ViewState::Ready(vec![item]),
            ViewState::Failed(_) | ViewState::Released => {}
        }
    }

    pub fn release(&mut self) {
        self.state = ViewState::Released;
    }
}

/// Text for the unread-notifications badge; `None` hides it.
pub fn badge_label(unread: usize) -> Option<String> {
    match unread {
        0 => None,
        n if n > 99 => Some("99+".to_string()),
        n => Some(n.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ErrorKind;
    use crate::models::Document;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: String,
    }

    fn snapshot(sub: &str, ids: &[&str]) -> GatewayEvent {
        GatewayEvent::Snapshot {
            subscription_id: sub.to_string(),
            documents: ids
                .iter()
                .map(|id| Document { id: id.to_string(), data: json!({ "id": id }) })
                .collect(),
        }
    }

    #[test]
    fn empty_snapshot_is_not_loading() {
        let mut view: LiveList<Item> = LiveList::new("feed");
        assert_eq!(view.state(), &ViewState::Loading);
        assert!(view.apply(&snapshot("feed", &[])));
        assert_eq!(view.state(), &ViewState::Empty);
    }

    #[test]
    fn snapshots_replace_wholesale() {
        let mut view: LiveList<Item> = LiveList::new("feed");
        view.apply(&snapshot("feed", &["a", "b"]));
        view.apply(&snapshot("feed", &["c"]));
        assert_eq!(view.items(), &[Item { id: "c".into() }]);
    }

    #[test]
    fn other_subscriptions_are_ignored() {
        let mut view: LiveList<Item> = LiveList::new("feed");
        assert!(!view.apply(&snapshot("inbox", &["a"])));
        assert_eq!(view.state(), &ViewState::Loading);
    }

    #[test]
    fn released_view_ignores_snapshots() {
        let mut view: LiveList<Item> = LiveList::new("feed");
        view.apply(&snapshot("feed", &["a"]));
        view.release();
        assert!(!view.apply(&snapshot("feed", &["a", "b"])));
        assert_eq!(view.state(), &ViewState::Released);
    }

    #[test]
    fn error_is_terminal() {
        let mut view: LiveList<Item> = LiveList::new("badge");
        view.apply(&GatewayEvent::SubscriptionError {
            subscription_id: "badge".into(),
            kind: ErrorKind::PermissionDenied,
            message: "not yours".into(),
        });
        assert!(!view.apply(&snapshot("badge", &["a"])));
        assert_eq!(view.state(), &ViewState::Failed("not yours".into()));
    }

    #[test]
    fn echo_is_overwritten_by_next_snapshot() {
        let mut view: LiveList<Item> = LiveList::new("chat");
        view.apply(&snapshot("chat", &[]));
        view.echo(Item { id: "local".into() });
        assert_eq!(view.items().len(), 1);
        view.apply(&snapshot("chat", &["m1", "m2"]));
        assert_eq!(view.items(), &[Item { id: "m1".into() }, Item { id: "m2".into() }]);
    }

    #[test]
    fn badge_caps_at_99() {
        assert_eq!(badge_label(0), None);
        assert_eq!(badge_label(7).as_deref(), Some("7"));
        assert_eq!(badge_label(150).as_deref(), Some("99+"));
    }
}
