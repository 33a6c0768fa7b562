//! Bridge message framing
//!
//! Binary = raw PCM16 little-endian, one 20 ms frame per message.
//! Text = JSON with a `type` discriminator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use callweave_core::{AudioFrame, SampleRate};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed control message: {0}")]
    MalformedControl(#[from] serde_json::Error),

    #[error("unsupported sample rate {0}")]
    UnsupportedRate(u32),

    #[error("audio frame has odd byte length {0}")]
    OddFrameLength(usize),
}

/// Opening message of the stream, sent by the bridge as text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeHandshake {
    /// Opaque call id assigned by the bridge
    pub call_id: String,
    pub sample_rate: u32,
    /// Caller identifier (E.164 or trunk-specific)
    pub caller: String,
    /// Tenant the DID is provisioned under
    pub org_id: String,
    /// Agent the PBX routed the call to
    pub agent_id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl BridgeHandshake {
    pub fn sample_rate(&self) -> Result<SampleRate, TransportError> {
        SampleRate::from_u32(self.sample_rate)
            .ok_or(TransportError::UnsupportedRate(self.sample_rate))
    }
}

/// Control messages exchanged after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeControl {
    Hangup,
    Dtmf { digit: char },
    Metadata { data: Value },
}

/// A decoded inbound bridge message
#[derive(Debug, Clone)]
pub enum BridgeMessage {
    Handshake(BridgeHandshake),
    Audio(AudioFrame),
    Control(BridgeControl),
}

impl BridgeMessage {
    /// Decode a text message. The first text message must be the handshake;
    /// afterwards text messages are control.
    pub fn from_text(text: &str, handshaken: bool) -> Result<Self, TransportError> {
        if handshaken {
            Ok(BridgeMessage::Control(serde_json::from_str(text)?))
        } else {
            Ok(BridgeMessage::Handshake(serde_json::from_str(text)?))
        }
    }
}

/// Decode one binary audio message into a frame
pub fn decode_audio_frame(
    bytes: &[u8],
    rate: SampleRate,
    sequence: u64,
) -> Result<AudioFrame, TransportError> {
    if bytes.len() % 2 != 0 {
        return Err(TransportError::OddFrameLength(bytes.len()));
    }
    Ok(AudioFrame::from_pcm16(bytes, rate, sequence))
}

/// Encode a frame for the bridge (PCM16 little-endian)
pub fn encode_audio_frame(frame: &AudioFrame) -> Vec<u8> {
    frame.to_pcm16()
}
