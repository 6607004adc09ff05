//! The platform receiver transport, registered as `receiver-0`.
//!
//! Handles the receiver, heartbeat, discovery and setup namespaces:
//! status queries, app launch/stop, PING/PONG and device info. One
//! instance is shared by every client connection; the first connection
//! registers it.

use std::collections::HashMap;
use std::sync::Arc;

use castellan_protocol::channel::{
    CastMessage, NS_DISCOVERY, NS_HEARTBEAT, NS_RECEIVER, NS_SETUP, RECEIVER_ID,
};
use castellan_protocol::messages::{
    APP_ANDROID_MIRRORING, APP_AVAILABLE, APP_BACKDROP, APP_CHROME_MIRRORING, APP_UNAVAILABLE,
    AppAvailabilityResponse, DEVICE_INFO_TYPE, DeviceInfo, DeviceInfoResponse, DiscoveryRequest,
    EurekaData, EurekaDeviceInfo, EurekaInfoResponse, HeartbeatMessage, RECEIVER_STATUS_TYPE,
    ReceiverRequest, ReceiverStatus, ReceiverStatusMessage, SetupMessage, Volume,
};
use tokio::sync::mpsc;

use crate::device::{Device, TransportHandle};
use crate::session;

/// Human-readable name for a known application id.
pub fn display_name(app_id: &str) -> &'static str {
    match app_id {
        APP_ANDROID_MIRRORING => "Android Mirroring",
        APP_CHROME_MIRRORING => "Chrome Mirroring",
        APP_BACKDROP => "Backdrop",
        _ => "Unknown Application",
    }
}

/// Only the two mirroring apps can be launched; Backdrop is implicit.
fn launchable(app_id: &str) -> bool {
    matches!(app_id, APP_ANDROID_MIRRORING | APP_CHROME_MIRRORING)
}

/// Register the shared receiver transport on the device. Idempotent; the
/// registration that wins spawns the handler task.
pub async fn ensure_registered(device: &Arc<Device>) {
    if device.has_transport(RECEIVER_ID).await {
        return;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let registered = device
        .register_transport(TransportHandle {
            id: RECEIVER_ID.to_string(),
            namespaces: vec![
                NS_RECEIVER.to_string(),
                NS_HEARTBEAT.to_string(),
                NS_DISCOVERY.to_string(),
                NS_SETUP.to_string(),
            ],
            tx,
        })
        .await;
    if registered {
        tokio::spawn(transport_task(Arc::clone(device), rx));
    }
}

async fn transport_task(device: Arc<Device>, mut rx: mpsc::UnboundedReceiver<CastMessage>) {
    while let Some(message) = rx.recv().await {
        match message.namespace.as_str() {
            NS_HEARTBEAT => handle_heartbeat(&device, &message).await,
            NS_RECEIVER => handle_receiver(&device, &message).await,
            NS_DISCOVERY => handle_discovery(&device, &message).await,
            NS_SETUP => handle_setup(&device, &message).await,
            other => {
                tracing::debug!(namespace = other, "unhandled receiver message");
            }
        }
    }
}

async fn handle_heartbeat(device: &Device, message: &CastMessage) {
    let Some(payload) = message.payload_utf8.as_deref() else {
        return;
    };
    match serde_json::from_str::<HeartbeatMessage>(payload) {
        Ok(HeartbeatMessage::Ping) => {
            let pong = match serde_json::to_string(&HeartbeatMessage::Pong) {
                Ok(pong) => pong,
                Err(e) => {
                    tracing::warn!("failed to serialize pong: {e}");
                    return;
                }
            };
            device
                .send_utf8(
                    NS_HEARTBEAT,
                    pong,
                    &message.destination_id,
                    &message.source_id,
                )
                .await;
        }
        Ok(HeartbeatMessage::Pong) => {}
        Err(e) => {
            tracing::warn!("failed to parse heartbeat message: {e}");
        }
    }
}

async fn handle_receiver(device: &Arc<Device>, message: &CastMessage) {
    let Some(payload) = message.payload_utf8.as_deref() else {
        return;
    };
    let request = match serde_json::from_str::<ReceiverRequest>(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("failed to parse receiver message: {e}");
            return;
        }
    };

    match request {
        ReceiverRequest::GetAppAvailability { request_id, app_id } => {
            let availability: HashMap<String, String> = app_id
                .into_iter()
                .map(|app| {
                    let state = if device.is_app_available(&app) {
                        APP_AVAILABLE
                    } else {
                        APP_UNAVAILABLE
                    };
                    (app, state.to_string())
                })
                .collect();
            let response = AppAvailabilityResponse {
                request_id,
                response_type: "GET_APP_AVAILABILITY".to_string(),
                availability,
            };
            match serde_json::to_string(&response) {
                Ok(payload) => {
                    device.broadcast_utf8(NS_RECEIVER, payload, RECEIVER_ID).await;
                }
                Err(e) => tracing::warn!("failed to serialize app availability: {e}"),
            }
        }
        ReceiverRequest::GetStatus { request_id } => {
            broadcast_status(device, request_id).await;
        }
        ReceiverRequest::Launch { request_id, app_id } => {
            if !launchable(&app_id) {
                tracing::warn!(%app_id, "refusing to launch unsupported app");
                return;
            }
            if device.app_running(&app_id).await {
                // Next GET_STATUS reflects the running session.
                tracing::info!(%app_id, "app already running, ignoring launch");
                return;
            }
            match session::launch(Arc::clone(device), &app_id, display_name(&app_id)).await {
                Ok(_) => broadcast_status(device, request_id).await,
                Err(e) => tracing::error!(%app_id, "failed to launch session: {e:#}"),
            }
        }
        ReceiverRequest::Stop {
            request_id,
            session_id,
        } => {
            match session_id {
                Some(session_id) => {
                    if !session::shutdown(device, &session_id).await {
                        tracing::info!(%session_id, "stop for unknown session");
                    }
                }
                None => tracing::info!("stop without session id"),
            }
            broadcast_status(device, request_id).await;
        }
    }
}

/// Broadcast a RECEIVER_STATUS snapshot to every subscriber of
/// `receiver-0`.
pub async fn broadcast_status(device: &Device, request_id: u32) {
    let status = ReceiverStatusMessage {
        message_type: RECEIVER_STATUS_TYPE.to_string(),
        request_id,
        status: ReceiverStatus {
            applications: device.session_statuses().await,
            volume: Volume {
                level: 1.0,
                muted: false,
            },
            is_active_input: true,
        },
    };
    match serde_json::to_string(&status) {
        Ok(payload) => {
            device.broadcast_utf8(NS_RECEIVER, payload, RECEIVER_ID).await;
        }
        Err(e) => tracing::warn!("failed to serialize receiver status: {e}"),
    }
}

async fn handle_discovery(device: &Device, message: &CastMessage) {
    let Some(payload) = message.payload_utf8.as_deref() else {
        return;
    };
    match serde_json::from_str::<DiscoveryRequest>(payload) {
        Ok(DiscoveryRequest::GetDeviceInfo { request_id }) => {
            let response = DeviceInfoResponse {
                message_type: DEVICE_INFO_TYPE.to_string(),
                request_id,
                device_info: DeviceInfo {
                    device_id: device.id.clone(),
                    device_model: device.device_model.clone(),
                    friendly_name: device.friendly_name.clone(),
                    device_capabilities: 4101,
                    control_notifications: 1,
                },
            };
            match serde_json::to_string(&response) {
                Ok(payload) => {
                    device
                        .send_utf8(
                            NS_DISCOVERY,
                            payload,
                            &message.destination_id,
                            &message.source_id,
                        )
                        .await;
                }
                Err(e) => tracing::warn!("failed to serialize device info: {e}"),
            }
        }
        Err(e) => {
            tracing::warn!("failed to parse discovery message: {e}");
        }
    }
}

async fn handle_setup(device: &Device, message: &CastMessage) {
    let Some(payload) = message.payload_utf8.as_deref() else {
        return;
    };
    let setup = match serde_json::from_str::<SetupMessage>(payload) {
        Ok(setup) => setup,
        Err(e) => {
            tracing::warn!("failed to parse setup message: {e}");
            return;
        }
    };
    if setup.message_type != "eureka_info" {
        tracing::debug!(message_type = %setup.message_type, "unhandled setup message");
        return;
    }

    let response = EurekaInfoResponse {
        message_type: "eureka_info".to_string(),
        data: EurekaData {
            device_info: EurekaDeviceInfo {
                ssdp_udn: device.udn.clone(),
            },
            name: device.friendly_name.clone(),
            version: 8,
        },
        response_code: 200,
        response_string: "OK".to_string(),
    };
    match serde_json::to_string(&response) {
        Ok(payload) => {
            device
                .send_utf8(
                    NS_SETUP,
                    payload,
                    &message.destination_id,
                    &message.source_id,
                )
                .await;
        }
        Err(e) => tracing::warn!("failed to serialize eureka info: {e}"),
    }
}
