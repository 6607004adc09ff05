//! Cast channel client driving a receiver through the standard sender
//! flow: auth challenge, CONNECT, status, LAUNCH, OFFER.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use castellan_protocol::channel::{
    AuthChallenge, CastMessage, DeviceAuthMessage, NS_CONNECTION, NS_DEVICE_AUTH, NS_RECEIVER,
    NS_WEBRTC, RECEIVER_ID, SENDER_ID,
};
use castellan_protocol::client;
use castellan_protocol::frame::CastChannel;
use castellan_protocol::messages::{Answer, ReceiverStatusMessage, WebRtcMessage};
use prost::Message;
use serde_json::{Value, json};
use tokio::time::Instant;

/// How long a launched app has to show its transport id in a
/// RECEIVER_STATUS broadcast.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SenderClient {
    channel: CastChannel,
    request_id: u32,
}

impl SenderClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let channel = client::dial(host, port)
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        tracing::info!(host, port, "connected");
        Ok(Self::from_channel(channel))
    }

    /// Wrap an established channel; used by tests.
    pub fn from_channel(channel: CastChannel) -> Self {
        Self {
            channel,
            request_id: 0,
        }
    }

    fn next_request_id(&mut self) -> u32 {
        self.request_id += 1;
        self.request_id
    }

    pub fn send_auth_challenge(&self) -> Result<()> {
        let challenge = DeviceAuthMessage {
            challenge: Some(AuthChallenge::default()),
            response: None,
            error: None,
        };
        self.channel
            .send(CastMessage::binary(
                NS_DEVICE_AUTH,
                SENDER_ID,
                RECEIVER_ID,
                challenge.encode_to_vec(),
            ))
            .context("cast channel closed")
    }

    pub fn send_connect(&self, destination: &str) -> Result<()> {
        self.send_json(
            NS_CONNECTION,
            destination,
            json!({"type": "CONNECT", "connType": 0}),
        )
    }

    pub fn send_json(&self, namespace: &str, destination: &str, payload: Value) -> Result<()> {
        self.channel
            .send(CastMessage::utf8(
                namespace,
                SENDER_ID,
                destination,
                payload.to_string(),
            ))
            .context("cast channel closed")
    }

    /// Wait for the device-auth response to a challenge.
    pub async fn wait_for_auth_response(&mut self) -> Result<DeviceAuthMessage> {
        let message = self
            .wait_for(REPLY_TIMEOUT, |m| m.namespace == NS_DEVICE_AUTH)
            .await?;
        let payload = message
            .payload_binary
            .as_deref()
            .context("auth reply has no binary payload")?;
        DeviceAuthMessage::decode(payload).context("failed to decode auth reply")
    }

    /// Request and parse a RECEIVER_STATUS.
    pub async fn request_status(&mut self) -> Result<ReceiverStatusMessage> {
        let request_id = self.next_request_id();
        self.send_json(
            NS_RECEIVER,
            RECEIVER_ID,
            json!({"type": "GET_STATUS", "requestId": request_id}),
        )?;
        let message = self
            .wait_for(REPLY_TIMEOUT, |m| {
                m.namespace == NS_RECEIVER && message_type(m).as_deref() == Some("RECEIVER_STATUS")
            })
            .await?;
        parse_status(&message)
    }

    /// LAUNCH an app and wait for its transport id to appear in a
    /// RECEIVER_STATUS. Returns (session id, transport id).
    pub async fn launch(&mut self, app_id: &str) -> Result<(String, String)> {
        self.launch_with_timeout(app_id, LAUNCH_TIMEOUT).await
    }

    pub async fn launch_with_timeout(
        &mut self,
        app_id: &str,
        timeout: Duration,
    ) -> Result<(String, String)> {
        let request_id = self.next_request_id();
        self.send_json(
            NS_RECEIVER,
            RECEIVER_ID,
            json!({"type": "LAUNCH", "appId": app_id, "requestId": request_id}),
        )?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out waiting for {app_id} to launch");
            }
            let message = self
                .wait_for(remaining, |m| {
                    m.namespace == NS_RECEIVER
                        && message_type(m).as_deref() == Some("RECEIVER_STATUS")
                })
                .await
                .with_context(|| format!("timed out waiting for {app_id} to launch"))?;
            let status = parse_status(&message)?;
            if let Some(app) = status
                .status
                .applications
                .iter()
                .find(|app| app.app_id == app_id)
            {
                return Ok((app.session_id.clone(), app.transport_id.clone()));
            }
        }
    }

    /// CONNECT to a session transport and OFFER one video stream.
    pub async fn offer_stream(
        &mut self,
        transport_id: &str,
        ssrc: u32,
        aes_key: &str,
        aes_iv_mask: &str,
    ) -> Result<Answer> {
        self.send_connect(transport_id)?;
        let seq_num = self.next_request_id();
        self.send_json(
            NS_WEBRTC,
            transport_id,
            json!({
                "seqNum": seq_num,
                "type": "OFFER",
                "offer": {
                    "castMode": "mirroring",
                    "receiverGetStatus": true,
                    "supportedStreams": [{
                        "type": "video_source",
                        "index": 0,
                        "ssrc": ssrc,
                        "aesKey": aes_key,
                        "aesIvMask": aes_iv_mask,
                    }],
                },
            }),
        )?;

        let message = self
            .wait_for(REPLY_TIMEOUT, |m| m.namespace == NS_WEBRTC)
            .await?;
        let payload = message
            .payload_utf8
            .as_deref()
            .context("webrtc reply has no payload")?;
        match serde_json::from_str::<WebRtcMessage>(payload)
            .context("failed to parse webrtc reply")?
        {
            WebRtcMessage::Answer {
                seq_num: answered,
                result,
                answer,
            } => {
                if answered != seq_num {
                    bail!("answer for wrong offer: {answered} != {seq_num}");
                }
                if result != "ok" {
                    bail!("offer rejected: {result}");
                }
                Ok(answer)
            }
            other => bail!("expected ANSWER, got {other:?}"),
        }
    }

    /// Wait for the next message matching `predicate`, skipping others.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut predicate: F) -> Result<CastMessage>
    where
        F: FnMut(&CastMessage) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out waiting for matching message");
            }
            match tokio::time::timeout(remaining, self.channel.recv()).await {
                Ok(Some(message)) => {
                    if predicate(&message) {
                        return Ok(message);
                    }
                    tracing::debug!(namespace = %message.namespace, "skipping message");
                }
                Ok(None) => bail!("receiver closed the channel"),
                Err(_) => bail!("timed out waiting for matching message"),
            }
        }
    }
}

fn message_type(message: &CastMessage) -> Option<String> {
    let payload = message.payload_utf8.as_deref()?;
    let value: Value = serde_json::from_str(payload).ok()?;
    Some(value.get("type")?.as_str()?.to_string())
}

fn parse_status(message: &CastMessage) -> Result<ReceiverStatusMessage> {
    let payload = message
        .payload_utf8
        .as_deref()
        .context("status reply has no payload")?;
    serde_json::from_str(payload).context("failed to parse receiver status")
}
