//! The notification bus: an in-process registry of client channels.
//!
//! Each connected WebSocket registers one channel holding its sink, the
//! URL it watches, and optionally the authenticated user and session id.
//! Publishing serializes the event once and sends it to every open channel
//! matching the filter. Delivery is best-effort: a sink that reports
//! failure is unregistered silently; clients treat events as hints to
//! re-read.
//!
//! The transport is abstracted behind [`EventSink`] so the WebSocket layer
//! plugs in an adapter and tests substitute an in-memory recorder.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Operations carried by change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Created,
    Patch,
    Updated,
    Deleted,
    AccessGranted,
    AccessRemoved,
}

/// A change event, serialized once per publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub typ: String,
    pub operation: Operation,
    /// Schema tag of the subject entity.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl Event {
    pub fn new(operation: Operation, kind: impl Into<String>) -> Self {
        Self {
            typ: "event".to_string(),
            operation,
            kind: kind.into(),
            id: None,
            data: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }
}

/// Transport half of a registered channel.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one serialized event. `false` marks the sink dead.
    async fn send(&self, text: &str) -> bool;
    /// Close the underlying transport.
    async fn close(&self);
    fn is_open(&self) -> bool;
}

/// An [`EventSink`] backed by an unbounded queue.
///
/// The WebSocket adapter drains the receiver into the socket; tests read
/// it directly.
pub struct QueueSink {
    tx: mpsc::UnboundedSender<String>,
    open: AtomicBool,
}

impl QueueSink {
    /// A sink and the receiver draining it.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                open: AtomicBool::new(true),
            }),
            rx,
        )
    }
}

#[async_trait]
impl EventSink for QueueSink {
    async fn send(&self, text: &str) -> bool {
        self.is_open() && self.tx.send(text.to_string()).is_ok()
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Predicates a publish narrows its audience with; unset fields match all.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    pub url: Option<String>,
    pub users: Option<Vec<String>>,
    pub sids: Option<Vec<String>>,
}

impl ChannelFilter {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn for_users(mut self, users: Vec<String>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn users(users: Vec<String>) -> Self {
        Self {
            users: Some(users),
            ..Self::default()
        }
    }
}

struct Channel {
    id: u64,
    sink: Arc<dyn EventSink>,
    url: String,
    user: Option<String>,
    sid: Option<String>,
    delivered: AtomicU64,
}

impl Channel {
    fn matches(&self, filter: &ChannelFilter) -> bool {
        if let Some(url) = &filter.url {
            if &self.url != url {
                return false;
            }
        }
        if let Some(users) = &filter.users {
            match &self.user {
                Some(user) if users.iter().any(|u| u == user) => {}
                _ => return false,
            }
        }
        if let Some(sids) = &filter.sids {
            match &self.sid {
                Some(sid) if sids.iter().any(|s| s == sid) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Descriptive snapshot of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub id: u64,
    pub url: String,
    pub user: Option<String>,
    pub delivered: u64,
}

/// In-process channel registry with filtered publish.
pub struct NotificationBus {
    channels: DashMap<u64, Arc<Channel>>,
    next_id: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a channel; the returned id is the unregister handle.
    pub fn register(
        &self,
        sink: Arc<dyn EventSink>,
        url: impl Into<String>,
        user: Option<String>,
        sid: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.channels.insert(
            id,
            Arc::new(Channel {
                id,
                sink,
                url: url.into(),
                user,
                sid,
                delivered: AtomicU64::new(0),
            }),
        );
        id
    }

    /// Drop a channel without closing its transport.
    pub fn unregister(&self, id: u64) {
        self.channels.remove(&id);
    }

    /// Ids of channels matching all set predicates.
    pub fn filter(&self, filter: &ChannelFilter) -> Vec<u64> {
        self.channels
            .iter()
            .filter(|entry| entry.value().matches(filter))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Serialize `event` once and deliver it to every open matching
    /// channel. Dead sinks are unregistered on the way.
    pub async fn notify(&self, event: &Event, filter: &ChannelFilter) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(%err, "failed to serialize event");
                return;
            }
        };
        let targets: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .filter(|entry| entry.value().matches(filter))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let deliveries = targets.into_iter().map(|channel| {
            let text = &text;
            async move {
                let delivered = channel.sink.is_open() && channel.sink.send(text).await;
                (channel, delivered)
            }
        });
        for (channel, delivered) in futures::future::join_all(deliveries).await {
            if delivered {
                channel.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.channels.remove(&channel.id);
            }
        }
    }

    /// Close and unregister every channel at `url`.
    pub async fn close_by_url(&self, url: &str) {
        let doomed: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .filter(|entry| entry.value().url == url)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        futures::future::join_all(doomed.iter().map(|channel| channel.sink.close())).await;
        for channel in doomed {
            self.channels.remove(&channel.id);
        }
    }

    /// Close every channel. Used on shutdown.
    pub async fn close_all(&self) {
        let all: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in all {
            channel.sink.close().await;
            self.channels.remove(&channel.id);
        }
    }

    /// Number of channels at `url`.
    pub fn count(&self, url: &str) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().url == url)
            .count()
    }

    /// Total registered channels.
    pub fn total(&self) -> usize {
        self.channels.len()
    }

    /// Whether `id` has a channel matching the filter.
    pub fn has_user(&self, id: &str, filter: &ChannelFilter) -> bool {
        self.channels.iter().any(|entry| {
            let channel = entry.value();
            channel.user.as_deref() == Some(id) && channel.matches(filter)
        })
    }

    /// The subset of `ids` with at least one matching channel.
    pub fn filter_user_ids(&self, ids: &[String], filter: &ChannelFilter) -> Vec<String> {
        ids.iter()
            .filter(|id| self.has_user(id, filter))
            .cloned()
            .collect()
    }

    /// Snapshots of every channel, for diagnostics.
    pub fn channel_info(&self) -> Vec<ChannelInfo> {
        self.channels
            .iter()
            .map(|entry| {
                let c = entry.value();
                ChannelInfo {
                    id: c.id,
                    url: c.url.clone(),
                    user: c.user.clone(),
                    delivered: c.delivered.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Route URL builders shared by the stores and the transport layer.
pub mod urls {
    /// The files collection.
    pub fn files() -> String {
        "/files".to_string()
    }

    /// One file.
    pub fn file(key: &str) -> String {
        format!("/files/{key}")
    }

    /// The child collection of a folder-like file.
    pub fn file_children(key: &str) -> String {
        format!("/files/{key}/files")
    }

    /// The media representation of a file.
    pub fn file_media(key: &str) -> String {
        format!("/files/{key}?alt=media")
    }

    /// The access listing of a file.
    pub fn file_users(key: &str) -> String {
        format!("/files/{key}/users")
    }

    /// The revision listing of a file.
    pub fn file_revisions(key: &str) -> String {
        format!("/files/{key}/revisions")
    }

    /// The legacy spaces collection.
    pub fn spaces() -> String {
        "/spaces".to_string()
    }

    /// One legacy space.
    pub fn space(key: &str) -> String {
        format!("/spaces/{key}")
    }

    /// The legacy project collection of a space.
    pub fn space_projects(key: &str) -> String {
        format!("/spaces/{key}/projects")
    }

    /// One legacy project.
    pub fn space_project(space: &str, project: &str) -> String {
        format!("/spaces/{space}/projects/{project}")
    }

    /// The app project collection of one app scope.
    pub fn app_projects(app: &str) -> String {
        format!("/app/{app}/projects")
    }

    /// The app request collection of one app scope.
    pub fn app_requests(app: &str) -> String {
        format!("/app/{app}/requests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        Event::new(Operation::Created, "Workspace").with_id("s1")
    }

    #[tokio::test]
    async fn test_notify_filters_by_url() {
        let bus = NotificationBus::new();
        let (sink_a, mut rx_a) = QueueSink::pair();
        let (sink_b, mut rx_b) = QueueSink::pair();
        bus.register(sink_a, "/files", None, None);
        bus.register(sink_b, "/spaces", None, None);

        bus.notify(&event(), &ChannelFilter::url("/files")).await;

        let text = rx_a.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["operation"], "created");
        assert_eq!(value["id"], "s1");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_filters_by_user() {
        let bus = NotificationBus::new();
        let (sink_a, mut rx_a) = QueueSink::pair();
        let (sink_b, mut rx_b) = QueueSink::pair();
        bus.register(sink_a, "/files", Some("u1".to_string()), None);
        bus.register(sink_b, "/files", Some("u2".to_string()), None);

        let filter = ChannelFilter::url("/files").for_users(vec!["u2".to_string()]);
        bus.notify(&event(), &filter).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_anonymous_channel_fails_user_filter() {
        let bus = NotificationBus::new();
        let (sink, mut rx) = QueueSink::pair();
        bus.register(sink, "/files", None, None);

        bus.notify(&event(), &ChannelFilter::users(vec!["u1".to_string()]))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_by_url() {
        let bus = NotificationBus::new();
        let (sink, _rx) = QueueSink::pair();
        let kept = Arc::clone(&sink);
        bus.register(sink, "/files/s1", Some("u1".to_string()), None);
        assert_eq!(bus.count("/files/s1"), 1);

        bus.close_by_url("/files/s1").await;
        assert_eq!(bus.count("/files/s1"), 0);
        assert!(!kept.is_open());
    }

    #[tokio::test]
    async fn test_dead_sink_is_dropped_on_notify() {
        let bus = NotificationBus::new();
        let (sink, rx) = QueueSink::pair();
        sink.close().await;
        drop(rx);
        bus.register(sink, "/files", None, None);

        bus.notify(&event(), &ChannelFilter::url("/files")).await;
        assert_eq!(bus.total(), 0);
    }

    #[tokio::test]
    async fn test_filter_user_ids() {
        let bus = NotificationBus::new();
        let (sink, _rx) = QueueSink::pair();
        bus.register(sink, "/files", Some("u1".to_string()), None);

        let ids = vec!["u1".to_string(), "u2".to_string()];
        let present = bus.filter_user_ids(&ids, &ChannelFilter::url("/files"));
        assert_eq!(present, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_delivery_counter() {
        let bus = NotificationBus::new();
        let (sink, _rx) = QueueSink::pair();
        bus.register(sink, "/files", None, None);
        for _ in 0..3 {
            bus.notify(&event(), &ChannelFilter::url("/files")).await;
        }
        let info = bus.channel_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].delivered, 3);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new(Operation::AccessGranted, "Workspace")
            .with_id("s1")
            .with_data(json!({"role": "reader"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["operation"], "access-granted");
        assert_eq!(value["kind"], "Workspace");
        assert_eq!(value["data"]["role"], "reader");
    }
}
