//! JSON payloads carried inside STRING cast messages, one group per
//! namespace.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default receiver application (idle screen).
pub const APP_BACKDROP: &str = "E8C28D3C";
/// Android screen mirroring.
pub const APP_ANDROID_MIRRORING: &str = "674A0243";
/// Chrome tab/desktop mirroring.
pub const APP_CHROME_MIRRORING: &str = "0F5096E8";

pub const APP_AVAILABLE: &str = "APP_AVAILABLE";
pub const APP_UNAVAILABLE: &str = "APP_UNAVAILABLE";

/// `urn:x-cast:com.google.cast.tp.connection`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionMessage {
    #[serde(rename = "CONNECT", rename_all = "camelCase")]
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        conn_type: Option<u32>,
    },
    #[serde(rename = "CLOSE")]
    Close,
}

/// `urn:x-cast:com.google.cast.tp.heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HeartbeatMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

/// Requests on `urn:x-cast:com.google.cast.receiver`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReceiverRequest {
    #[serde(rename = "GET_APP_AVAILABILITY", rename_all = "camelCase")]
    GetAppAvailability {
        request_id: u32,
        app_id: Vec<String>,
    },
    #[serde(rename = "GET_STATUS", rename_all = "camelCase")]
    GetStatus { request_id: u32 },
    #[serde(rename = "LAUNCH", rename_all = "camelCase")]
    Launch { request_id: u32, app_id: String },
    #[serde(rename = "STOP", rename_all = "camelCase")]
    Stop {
        request_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAvailabilityResponse {
    pub request_id: u32,
    pub response_type: String,
    pub availability: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub level: f64,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub app_id: String,
    pub display_name: String,
    pub namespaces: Vec<NamespaceEntry>,
    pub session_id: String,
    pub status_text: String,
    pub transport_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    pub applications: Vec<ApplicationStatus>,
    pub volume: Volume,
    pub is_active_input: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatusMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_id: u32,
    pub status: ReceiverStatus,
}

pub const RECEIVER_STATUS_TYPE: &str = "RECEIVER_STATUS";

/// Requests on `urn:x-cast:com.google.cast.receiver.discovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryRequest {
    #[serde(rename = "GET_DEVICE_INFO", rename_all = "camelCase")]
    GetDeviceInfo { request_id: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_model: String,
    pub friendly_name: String,
    pub device_capabilities: u32,
    pub control_notifications: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoResponse {
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_id: u32,
    pub device_info: DeviceInfo,
}

pub const DEVICE_INFO_TYPE: &str = "DEVICE_INFO";

/// `urn:x-cast:com.google.cast.setup`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupMessage {
    #[serde(rename = "type")]
    pub message_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EurekaDeviceInfo {
    pub ssdp_udn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EurekaData {
    pub device_info: EurekaDeviceInfo,
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EurekaInfoResponse {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: EurekaData,
    pub response_code: u32,
    pub response_string: String,
}

/// Messages on `urn:x-cast:com.google.cast.webrtc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebRtcMessage {
    #[serde(rename = "OFFER", rename_all = "camelCase")]
    Offer { seq_num: u32, offer: Offer },
    #[serde(rename = "ANSWER", rename_all = "camelCase")]
    Answer {
        seq_num: u32,
        result: String,
        answer: Answer,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cast_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_get_status: Option<bool>,
    #[serde(default)]
    pub supported_streams: Vec<OfferStream>,
}

/// One stream description inside an OFFER. Only `video_source` streams are
/// accepted by this receiver; the AES material is hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferStream {
    #[serde(rename = "type")]
    pub stream_type: String,
    pub index: u32,
    pub ssrc: u32,
    #[serde(default)]
    pub aes_key: String,
    #[serde(default)]
    pub aes_iv_mask: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_delay: Option<u32>,
}

pub const STREAM_TYPE_VIDEO: &str = "video_source";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cast_mode: Option<String>,
    pub udp_port: u16,
    pub send_indexes: Vec<u32>,
    pub ssrcs: Vec<u32>,
    pub receiver_rtcp_event_log: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_get_status: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_from_sender() {
        let json = r#"{"type":"CONNECT","connType":0}"#;
        let msg: ConnectionMessage = serde_json::from_str(json).unwrap();
        match msg {
            ConnectionMessage::Connect { conn_type } => assert_eq!(conn_type, Some(0)),
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    #[test]
    fn ping_pong_tags() {
        let ping: HeartbeatMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(ping, HeartbeatMessage::Ping);
        let pong = serde_json::to_string(&HeartbeatMessage::Pong).unwrap();
        assert_eq!(pong, r#"{"type":"PONG"}"#);
    }

    #[test]
    fn receiver_requests_parse() {
        let get_status: ReceiverRequest =
            serde_json::from_str(r#"{"type":"GET_STATUS","requestId":1}"#).unwrap();
        assert!(matches!(
            get_status,
            ReceiverRequest::GetStatus { request_id: 1 }
        ));

        let launch: ReceiverRequest =
            serde_json::from_str(r#"{"type":"LAUNCH","appId":"0F5096E8","requestId":2}"#).unwrap();
        match launch {
            ReceiverRequest::Launch { request_id, app_id } => {
                assert_eq!(request_id, 2);
                assert_eq!(app_id, APP_CHROME_MIRRORING);
            }
            other => panic!("expected LAUNCH, got {other:?}"),
        }

        let availability: ReceiverRequest = serde_json::from_str(
            r#"{"type":"GET_APP_AVAILABILITY","appId":["0F5096E8","FFFFFFFF"],"requestId":3}"#,
        )
        .unwrap();
        match availability {
            ReceiverRequest::GetAppAvailability { app_id, .. } => assert_eq!(app_id.len(), 2),
            other => panic!("expected GET_APP_AVAILABILITY, got {other:?}"),
        }
    }

    #[test]
    fn receiver_status_shape() {
        let status = ReceiverStatusMessage {
            message_type: RECEIVER_STATUS_TYPE.to_string(),
            request_id: 1,
            status: ReceiverStatus {
                applications: vec![],
                volume: Volume {
                    level: 1.0,
                    muted: false,
                },
                is_active_input: true,
            },
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""type":"RECEIVER_STATUS""#));
        assert!(json.contains(r#""requestId":1"#));
        assert!(json.contains(r#""applications":[]"#));
        assert!(json.contains(r#""isActiveInput":true"#));
        assert!(json.contains(r#""level":1.0"#));
    }

    #[test]
    fn offer_from_sender_parses() {
        let json = r#"{
            "seqNum": 7,
            "type": "OFFER",
            "offer": {
                "castMode": "mirroring",
                "receiverGetStatus": true,
                "supportedStreams": [{
                    "type": "video_source",
                    "index": 0,
                    "ssrc": 12345,
                    "aesKey": "00112233445566778899aabbccddeeff",
                    "aesIvMask": "0f1e2d3c4b5a69788796a5b4c3d2e1f0"
                }]
            }
        }"#;
        let msg: WebRtcMessage = serde_json::from_str(json).unwrap();
        match msg {
            WebRtcMessage::Offer { seq_num, offer } => {
                assert_eq!(seq_num, 7);
                assert_eq!(offer.cast_mode.as_deref(), Some("mirroring"));
                assert_eq!(offer.supported_streams.len(), 1);
                let stream = &offer.supported_streams[0];
                assert_eq!(stream.stream_type, STREAM_TYPE_VIDEO);
                assert_eq!(stream.ssrc, 12345);
                assert_eq!(stream.aes_key.len(), 32);
            }
            other => panic!("expected OFFER, got {other:?}"),
        }
    }

    #[test]
    fn answer_serializes_camel_case() {
        let msg = WebRtcMessage::Answer {
            seq_num: 7,
            result: "ok".to_string(),
            answer: Answer {
                cast_mode: Some("mirroring".to_string()),
                udp_port: 40123,
                send_indexes: vec![0],
                ssrcs: vec![12345],
                receiver_rtcp_event_log: vec![0],
                receiver_get_status: Some(true),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ANSWER""#));
        assert!(json.contains(r#""seqNum":7"#));
        assert!(json.contains(r#""result":"ok""#));
        assert!(json.contains(r#""udpPort":40123"#));
        assert!(json.contains(r#""sendIndexes":[0]"#));
        assert!(json.contains(r#""ssrcs":[12345]"#));
    }

    #[test]
    fn eureka_info_response_shape() {
        let response = EurekaInfoResponse {
            message_type: "eureka_info".to_string(),
            data: EurekaData {
                device_info: EurekaDeviceInfo {
                    ssdp_udn: "ce391871-f16d-4b9c-8bab-05e856297f0a".to_string(),
                },
                name: "Living Room".to_string(),
                version: 8,
            },
            response_code: 200,
            response_string: "OK".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""type":"eureka_info""#));
        assert!(json.contains(r#""ssdp_udn""#));
        assert!(json.contains(r#""version":8"#));
        assert!(json.contains(r#""response_code":200"#));
    }
}
