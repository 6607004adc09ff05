//! The device hub: the single mutable authority for transports,
//! subscriptions, connections and sessions.
//!
//! Client connections, the receiver transport and sessions all hold an
//! `Arc<Device>` and ids; nothing holds references into anything else, so
//! there are no ownership cycles. Writes are serialized behind one coarse
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use castellan_protocol::channel::{BROADCAST_ID, CastMessage};
use castellan_protocol::messages::{
    APP_ANDROID_MIRRORING, APP_BACKDROP, APP_CHROME_MIRRORING, ApplicationStatus, NamespaceEntry,
};
use tokio::sync::{Notify, RwLock, mpsc};
use uuid::Uuid;

use crate::media::{DecodedFrame, VideoDecoder};

/// Identifies one TCP client connection for the life of the process.
pub type ConnId = u64;

/// Depth of the decoded-frame channel to the frame sink.
const FRAME_QUEUE_DEPTH: usize = 16;

/// A registered routing endpoint. Messages forwarded to `id` are queued on
/// `tx` and handled by the transport's own task, in arrival order.
pub struct TransportHandle {
    pub id: String,
    pub namespaces: Vec<String>,
    pub tx: mpsc::UnboundedSender<CastMessage>,
}

/// One `(connection, remote_id)` pair subscribed to a local transport id.
struct Subscription {
    conn: ConnId,
    remote_id: String,
}

/// Bookkeeping for a launched application.
pub struct SessionEntry {
    pub app_id: String,
    pub display_name: String,
    pub session_id: String,
    pub status_text: String,
    pub transport_id: String,
    pub udp_port: u16,
    pub namespaces: Vec<String>,
    /// Signalled to stop the session's UDP reader and transport task.
    pub stop: Arc<Notify>,
    /// Set before `stop` fires so the UDP reader can tell an intended
    /// shutdown from a socket error.
    pub stopping: Arc<AtomicBool>,
}

#[derive(Default)]
struct DeviceState {
    transports: HashMap<String, TransportHandle>,
    subscriptions: HashMap<String, Vec<Subscription>>,
    connections: HashMap<ConnId, mpsc::UnboundedSender<CastMessage>>,
    sessions: HashMap<String, SessionEntry>,
    next_session_number: u64,
}

pub struct Device {
    pub device_model: String,
    pub friendly_name: String,
    /// Stable device id reported over discovery and mDNS.
    pub id: String,
    /// UPnP device name reported in eureka_info.
    pub udn: String,
    available_apps: Vec<String>,
    decoder: Arc<dyn VideoDecoder>,
    frames: mpsc::Sender<DecodedFrame>,
    state: RwLock<DeviceState>,
}

impl Device {
    /// Create the device and the frame channel its sink consumes.
    pub fn new(
        device_model: &str,
        friendly_name: &str,
        decoder: Arc<dyn VideoDecoder>,
    ) -> (Arc<Self>, mpsc::Receiver<DecodedFrame>) {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let device = Arc::new(Self {
            device_model: device_model.to_string(),
            friendly_name: friendly_name.to_string(),
            id: Uuid::new_v4().simple().to_string(),
            udn: Uuid::new_v4().to_string(),
            available_apps: vec![
                APP_BACKDROP.to_string(),
                APP_ANDROID_MIRRORING.to_string(),
                APP_CHROME_MIRRORING.to_string(),
            ],
            decoder,
            frames: frames_tx,
            state: RwLock::new(DeviceState::default()),
        });
        (device, frames_rx)
    }

    pub fn decoder(&self) -> Arc<dyn VideoDecoder> {
        Arc::clone(&self.decoder)
    }

    pub fn frames(&self) -> mpsc::Sender<DecodedFrame> {
        self.frames.clone()
    }

    pub fn is_app_available(&self, app_id: &str) -> bool {
        self.available_apps.iter().any(|a| a == app_id)
    }

    pub async fn register_connection(&self, conn: ConnId, tx: mpsc::UnboundedSender<CastMessage>) {
        let mut state = self.state.write().await;
        state.connections.insert(conn, tx);
    }

    /// Drop a closed connection and every subscription it held.
    pub async fn remove_connection(&self, conn: ConnId) {
        let mut state = self.state.write().await;
        state.connections.remove(&conn);
        for subscribers in state.subscriptions.values_mut() {
            subscribers.retain(|s| s.conn != conn);
        }
    }

    /// Register a transport. An already-registered id keeps its existing
    /// handle and subscription list.
    pub async fn register_transport(&self, handle: TransportHandle) -> bool {
        let mut state = self.state.write().await;
        let id = handle.id.clone();
        state.subscriptions.entry(id.clone()).or_default();
        if state.transports.contains_key(&id) {
            return false;
        }
        state.transports.insert(id, handle);
        true
    }

    pub async fn deregister_transport(&self, id: &str) {
        let mut state = self.state.write().await;
        state.transports.remove(id);
        state.subscriptions.remove(id);
    }

    pub async fn has_transport(&self, id: &str) -> bool {
        self.state.read().await.transports.contains_key(id)
    }

    /// Record that `conn` wants traffic addressed from `local_id` to
    /// `remote_id`. Established by a CONNECT on the connection namespace.
    pub async fn register_subscription(&self, conn: ConnId, remote_id: &str, local_id: &str) {
        let mut state = self.state.write().await;
        let subscribers = state.subscriptions.entry(local_id.to_string()).or_default();
        if subscribers
            .iter()
            .any(|s| s.conn == conn && s.remote_id == remote_id)
        {
            return;
        }
        subscribers.push(Subscription {
            conn,
            remote_id: remote_id.to_string(),
        });
    }

    /// Route a message to the transport named by its destination id.
    pub async fn forward(&self, message: CastMessage) -> bool {
        let state = self.state.read().await;
        match state.transports.get(&message.destination_id) {
            Some(transport) => transport.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Unicast: deliver on every connection subscribed as
    /// `(remote_id = destination_id)` on `local_id = source_id`.
    /// Returns the number of connections reached.
    pub async fn send_utf8(
        &self,
        namespace: &str,
        payload: String,
        source_id: &str,
        destination_id: &str,
    ) -> usize {
        let message = CastMessage::utf8(namespace, source_id, destination_id, payload);
        self.deliver(message, source_id, Some(destination_id)).await
    }

    pub async fn send_binary(
        &self,
        namespace: &str,
        payload: Vec<u8>,
        source_id: &str,
        destination_id: &str,
    ) -> usize {
        let message = CastMessage::binary(namespace, source_id, destination_id, payload);
        self.deliver(message, source_id, Some(destination_id)).await
    }

    /// Broadcast: deliver to every connection subscribed on
    /// `local_id = source_id`, addressed to `*`.
    pub async fn broadcast_utf8(&self, namespace: &str, payload: String, source_id: &str) -> usize {
        let message = CastMessage::utf8(namespace, source_id, BROADCAST_ID, payload);
        self.deliver(message, source_id, None).await
    }

    pub async fn broadcast_binary(
        &self,
        namespace: &str,
        payload: Vec<u8>,
        source_id: &str,
    ) -> usize {
        let message = CastMessage::binary(namespace, source_id, BROADCAST_ID, payload);
        self.deliver(message, source_id, None).await
    }

    async fn deliver(
        &self,
        message: CastMessage,
        local_id: &str,
        remote_id: Option<&str>,
    ) -> usize {
        let state = self.state.read().await;
        let Some(subscribers) = state.subscriptions.get(local_id) else {
            return 0;
        };

        // Several subscriptions can resolve to one connection; send once.
        let mut seen = HashSet::new();
        let mut delivered = 0;
        for subscription in subscribers {
            if let Some(remote_id) = remote_id {
                if subscription.remote_id != remote_id {
                    continue;
                }
            }
            if !seen.insert(subscription.conn) {
                continue;
            }
            if let Some(tx) = state.connections.get(&subscription.conn) {
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Allocate the next session transport id (`pid-1`, `pid-2`, ...).
    pub async fn next_transport_id(&self) -> String {
        let mut state = self.state.write().await;
        state.next_session_number += 1;
        format!("pid-{}", state.next_session_number)
    }

    pub async fn insert_session(&self, entry: SessionEntry) {
        let mut state = self.state.write().await;
        state.sessions.insert(entry.session_id.clone(), entry);
    }

    pub async fn remove_session(&self, session_id: &str) -> Option<SessionEntry> {
        let mut state = self.state.write().await;
        state.sessions.remove(session_id)
    }

    pub async fn app_running(&self, app_id: &str) -> bool {
        let state = self.state.read().await;
        state.sessions.values().any(|s| s.app_id == app_id)
    }

    pub async fn transport_id_for_session(&self, session_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .sessions
            .get(session_id)
            .map(|s| s.transport_id.clone())
    }

    /// Application list for RECEIVER_STATUS.
    pub async fn session_statuses(&self) -> Vec<ApplicationStatus> {
        let state = self.state.read().await;
        let mut statuses: Vec<ApplicationStatus> = state
            .sessions
            .values()
            .map(|s| ApplicationStatus {
                app_id: s.app_id.clone(),
                display_name: s.display_name.clone(),
                namespaces: s
                    .namespaces
                    .iter()
                    .map(|name| NamespaceEntry { name: name.clone() })
                    .collect(),
                session_id: s.session_id.clone(),
                status_text: s.status_text.clone(),
                transport_id: s.transport_id.clone(),
            })
            .collect();
        // Stable output for senders that diff statuses.
        statuses.sort_by(|a, b| a.transport_id.cmp(&b.transport_id));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use castellan_protocol::channel::{NS_RECEIVER, RECEIVER_ID, SENDER_ID};

    use crate::media::NullDecoder;

    use super::*;

    fn new_device() -> (Arc<Device>, mpsc::Receiver<DecodedFrame>) {
        Device::new("test-model", "Test Device", Arc::new(NullDecoder))
    }

    fn fake_connection() -> (
        mpsc::UnboundedSender<CastMessage>,
        mpsc::UnboundedReceiver<CastMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn unicast_delivers_exactly_once() {
        let (device, _frames) = new_device();
        let (tx, mut rx) = fake_connection();
        device.register_connection(1, tx).await;
        device.register_subscription(1, SENDER_ID, RECEIVER_ID).await;

        let delivered = device
            .send_utf8(NS_RECEIVER, "{}".to_string(), RECEIVER_ID, SENDER_ID)
            .await;
        assert_eq!(delivered, 1);

        let message = rx.try_recv().unwrap();
        assert_eq!(message.source_id, RECEIVER_ID);
        assert_eq!(message.destination_id, SENDER_ID);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_filters_by_remote_id() {
        let (device, _frames) = new_device();
        let (tx, mut rx) = fake_connection();
        device.register_connection(1, tx).await;
        device.register_subscription(1, "sender-1", RECEIVER_ID).await;

        let delivered = device
            .send_utf8(NS_RECEIVER, "{}".to_string(), RECEIVER_ID, "sender-2")
            .await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_once() {
        let (device, _frames) = new_device();
        let (tx1, mut rx1) = fake_connection();
        let (tx2, mut rx2) = fake_connection();
        device.register_connection(1, tx1).await;
        device.register_connection(2, tx2).await;
        device.register_subscription(1, SENDER_ID, RECEIVER_ID).await;
        // Two subscriptions resolving to connection 2; it must still get a
        // single copy.
        device.register_subscription(2, "sender-1", RECEIVER_ID).await;
        device.register_subscription(2, "sender-2", RECEIVER_ID).await;

        let delivered = device
            .broadcast_utf8(NS_RECEIVER, "{}".to_string(), RECEIVER_ID)
            .await;
        assert_eq!(delivered, 2);

        assert_eq!(rx1.try_recv().unwrap().destination_id, BROADCAST_ID);
        assert_eq!(rx2.try_recv().unwrap().destination_id, BROADCAST_ID);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_subscription_is_ignored() {
        let (device, _frames) = new_device();
        let (tx, mut rx) = fake_connection();
        device.register_connection(1, tx).await;
        device.register_subscription(1, SENDER_ID, RECEIVER_ID).await;
        device.register_subscription(1, SENDER_ID, RECEIVER_ID).await;

        device
            .send_utf8(NS_RECEIVER, "{}".to_string(), RECEIVER_ID, SENDER_ID)
            .await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_routes_by_destination() {
        let (device, _frames) = new_device();
        let (tx, mut rx) = mpsc::unbounded_channel();
        device
            .register_transport(TransportHandle {
                id: "pid-1".to_string(),
                namespaces: vec![],
                tx,
            })
            .await;

        let message = CastMessage::utf8(NS_RECEIVER, SENDER_ID, "pid-1", "{}".to_string());
        assert!(device.forward(message).await);
        assert_eq!(rx.try_recv().unwrap().destination_id, "pid-1");

        let unroutable = CastMessage::utf8(NS_RECEIVER, SENDER_ID, "pid-9", "{}".to_string());
        assert!(!device.forward(unroutable).await);
    }

    #[tokio::test]
    async fn reregistering_transport_keeps_subscriptions() {
        let (device, _frames) = new_device();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(
            device
                .register_transport(TransportHandle {
                    id: RECEIVER_ID.to_string(),
                    namespaces: vec![],
                    tx: tx.clone(),
                })
                .await
        );
        let (conn_tx, mut conn_rx) = fake_connection();
        device.register_connection(1, conn_tx).await;
        device.register_subscription(1, SENDER_ID, RECEIVER_ID).await;

        // A second connection re-registering the shared receiver transport
        // must not wipe connection 1's subscription.
        assert!(
            !device
                .register_transport(TransportHandle {
                    id: RECEIVER_ID.to_string(),
                    namespaces: vec![],
                    tx,
                })
                .await
        );
        device
            .send_utf8(NS_RECEIVER, "{}".to_string(), RECEIVER_ID, SENDER_ID)
            .await;
        assert!(conn_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closing_connection_drops_its_subscriptions() {
        let (device, _frames) = new_device();
        let (tx, _rx) = fake_connection();
        device.register_connection(1, tx).await;
        device.register_subscription(1, SENDER_ID, RECEIVER_ID).await;
        device.remove_connection(1).await;

        let delivered = device
            .send_utf8(NS_RECEIVER, "{}".to_string(), RECEIVER_ID, SENDER_ID)
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn transport_ids_are_sequential() {
        let (device, _frames) = new_device();
        assert_eq!(device.next_transport_id().await, "pid-1");
        assert_eq!(device.next_transport_id().await, "pid-2");
    }

    #[tokio::test]
    async fn session_bookkeeping() {
        let (device, _frames) = new_device();
        device
            .insert_session(SessionEntry {
                app_id: APP_CHROME_MIRRORING.to_string(),
                display_name: "Chrome Mirroring".to_string(),
                session_id: "abc".to_string(),
                status_text: "Chrome Mirroring".to_string(),
                transport_id: "pid-1".to_string(),
                udp_port: 40000,
                namespaces: vec!["urn:x-cast:com.google.cast.webrtc".to_string()],
                stop: Arc::new(Notify::new()),
                stopping: Arc::new(AtomicBool::new(false)),
            })
            .await;

        assert!(device.app_running(APP_CHROME_MIRRORING).await);
        assert!(!device.app_running(APP_ANDROID_MIRRORING).await);

        let statuses = device.session_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].app_id, APP_CHROME_MIRRORING);
        assert_eq!(statuses[0].transport_id, "pid-1");

        let removed = device.remove_session("abc").await.unwrap();
        assert_eq!(removed.transport_id, "pid-1");
        assert!(device.session_statuses().await.is_empty());
    }
}
