//! CastV2 channel protobuf types.
//!
//! Hand-written prost derives for the `cast_channel.proto` messages; the
//! schema is stable enough that generated code buys nothing over this.

/// Maximum serialized CastMessage the channel will accept (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_DEVICE_AUTH: &str = "urn:x-cast:com.google.cast.tp.deviceauth";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NS_DISCOVERY: &str = "urn:x-cast:com.google.cast.receiver.discovery";
pub const NS_SETUP: &str = "urn:x-cast:com.google.cast.setup";
pub const NS_DEBUG: &str = "urn:x-cast:com.google.cast.debug";
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";
pub const NS_REMOTING: &str = "urn:x-cast:com.google.cast.remoting";
pub const NS_WEBRTC: &str = "urn:x-cast:com.google.cast.webrtc";

/// Sender id used by the first (implicit) virtual connection.
pub const SENDER_ID: &str = "sender-0";
/// Transport id of the platform receiver.
pub const RECEIVER_ID: &str = "receiver-0";
/// Destination id used for broadcast delivery.
pub const BROADCAST_ID: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Castv210 = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    String = 0,
    Binary = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "ProtocolVersion", tag = "1")]
    pub protocol_version: i32,
    #[prost(string, tag = "2")]
    pub source_id: String,
    #[prost(string, tag = "3")]
    pub destination_id: String,
    #[prost(string, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "PayloadType", tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

impl CastMessage {
    /// Build a STRING-payload message.
    pub fn utf8(
        namespace: &str,
        source_id: &str,
        destination_id: &str,
        payload: String,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210 as i32,
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
            payload_type: PayloadType::String as i32,
            payload_utf8: Some(payload),
            payload_binary: None,
        }
    }

    /// Build a BINARY-payload message.
    pub fn binary(
        namespace: &str,
        source_id: &str,
        destination_id: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210 as i32,
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
            payload_type: PayloadType::Binary as i32,
            payload_utf8: None,
            payload_binary: Some(payload),
        }
    }
}

// Device authentication messages, exchanged as binary payloads on
// `urn:x-cast:com.google.cast.tp.deviceauth`.

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum SignatureAlgorithm {
    Unspecified = 0,
    RsassaPkcs1v15 = 1,
    RsassaPss = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum HashAlgorithm {
    Sha1 = 0,
    Sha256 = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum AuthErrorType {
    InternalError = 0,
    NoTls = 1,
    SignatureAlgorithmUnavailable = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthChallenge {
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "1")]
    pub signature_algorithm: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub sender_nonce: Option<Vec<u8>>,
    #[prost(enumeration = "HashAlgorithm", optional, tag = "3")]
    pub hash_algorithm: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub client_auth_certificate: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub intermediate_certificate: Vec<Vec<u8>>,
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "4")]
    pub signature_algorithm: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub sender_nonce: Option<Vec<u8>>,
    #[prost(enumeration = "HashAlgorithm", optional, tag = "6")]
    pub hash_algorithm: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub crl: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthError {
    #[prost(enumeration = "AuthErrorType", tag = "1")]
    pub error_type: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceAuthMessage {
    #[prost(message, optional, tag = "1")]
    pub challenge: Option<AuthChallenge>,
    #[prost(message, optional, tag = "2")]
    pub response: Option<AuthResponse>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<AuthError>,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn utf8_message_roundtrip() {
        let msg = CastMessage::utf8(
            NS_HEARTBEAT,
            SENDER_ID,
            RECEIVER_ID,
            r#"{"type":"PING"}"#.to_string(),
        );
        let encoded = msg.encode_to_vec();
        let decoded = CastMessage::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded.protocol_version, ProtocolVersion::Castv210 as i32);
        assert_eq!(decoded.source_id, SENDER_ID);
        assert_eq!(decoded.destination_id, RECEIVER_ID);
        assert_eq!(decoded.namespace, NS_HEARTBEAT);
        assert_eq!(decoded.payload_type, PayloadType::String as i32);
        assert_eq!(decoded.payload_utf8.as_deref(), Some(r#"{"type":"PING"}"#));
        assert!(decoded.payload_binary.is_none());
    }

    #[test]
    fn binary_message_roundtrip() {
        let msg = CastMessage::binary(
            NS_DEVICE_AUTH,
            SENDER_ID,
            RECEIVER_ID,
            vec![0x08, 0x01],
        );
        let decoded = CastMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.payload_type, PayloadType::Binary as i32);
        assert_eq!(decoded.payload_binary.as_deref(), Some(&[0x08, 0x01][..]));
        assert!(decoded.payload_utf8.is_none());
    }

    #[test]
    fn auth_challenge_roundtrip() {
        let msg = DeviceAuthMessage {
            challenge: Some(AuthChallenge::default()),
            response: None,
            error: None,
        };
        let decoded = DeviceAuthMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.challenge.is_some());
        assert!(decoded.response.is_none());
    }

    #[test]
    fn auth_response_carries_certificates() {
        let msg = DeviceAuthMessage {
            challenge: None,
            response: Some(AuthResponse {
                signature: vec![1, 2, 3],
                client_auth_certificate: vec![4, 5],
                intermediate_certificate: vec![vec![6, 7]],
                signature_algorithm: Some(SignatureAlgorithm::RsassaPkcs1v15 as i32),
                sender_nonce: None,
                hash_algorithm: Some(HashAlgorithm::Sha256 as i32),
                crl: None,
            }),
            error: None,
        };
        let decoded = DeviceAuthMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        let response = decoded.response.unwrap();
        assert_eq!(response.signature, vec![1, 2, 3]);
        assert_eq!(response.intermediate_certificate, vec![vec![6, 7]]);
        assert_eq!(response.hash_algorithm, Some(HashAlgorithm::Sha256 as i32));
    }
}
