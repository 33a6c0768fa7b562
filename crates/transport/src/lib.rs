//! Telephony bridge protocol
//!
//! The bridge speaks a framed bidirectional stream: binary messages carry
//! 20 ms PCM16 mono frames, text messages carry JSON control. The opening
//! text message is a handshake identifying the call.

mod bridge;

pub use bridge::{
    decode_audio_frame, encode_audio_frame, BridgeControl, BridgeHandshake, BridgeMessage,
    TransportError,
};
