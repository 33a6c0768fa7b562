//! Telephony bridge endpoint
//!
//! One WebSocket per call. The bridge opens with a JSON handshake, then
//! streams 20 ms PCM16 frames as binary messages and control as text;
//! synthesized audio flows back as binary. Closing the socket drains the
//! session and closes the call.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use callweave_core::{AgentId, CallId, CallOutcome};
use callweave_session::{CallRunner, RunnerInput};
use callweave_transport::{
    decode_audio_frame, encode_audio_frame, BridgeControl, BridgeMessage,
};

use crate::state::AppState;

pub async fn bridge_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_bridge(socket, state))
}

async fn handle_bridge(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // First message must be the text handshake
    let handshake = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match BridgeMessage::from_text(&text, false) {
                Ok(BridgeMessage::Handshake(h)) => break h,
                _ => {
                    let _ = sink
                        .send(Message::Text(r#"{"error":"handshake expected"}"#.into()))
                        .await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let Ok(sample_rate) = handshake.sample_rate() else {
        let _ = sink
            .send(Message::Text(r#"{"error":"unsupported sample rate"}"#.into()))
            .await;
        return;
    };

    let Some(org_id) = callweave_core::OrgId::parse(&handshake.org_id) else {
        let _ = sink
            .send(Message::Text(r#"{"error":"malformed org_id"}"#.into()))
            .await;
        return;
    };
    let Some(agent_id) = AgentId::parse(&handshake.agent_id) else {
        let _ = sink
            .send(Message::Text(r#"{"error":"malformed agent_id"}"#.into()))
            .await;
        return;
    };

    // The bridge id is opaque; reuse it when it is already a uuid
    let call_id = CallId::parse(&handshake.call_id).unwrap_or_default();

    let org = match state.persistence.orgs.get(org_id).await {
        Ok(org) if org.active => org,
        Ok(_) => {
            let _ = sink
                .send(Message::Text(r#"{"error":"organization inactive"}"#.into()))
                .await;
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Bridge handshake org lookup failed");
            let _ = sink
                .send(Message::Text(r#"{"error":"unknown organization"}"#.into()))
                .await;
            return;
        }
    };

    let session = match state
        .registry
        .open(&org, agent_id, &handshake.caller, call_id)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Session open refused");
            let _ = sink
                .send(Message::Text(
                    serde_json::json!({ "error": e.to_string() }).to_string(),
                ))
                .await;
            return;
        }
    };

    tracing::info!(
        call_id = %call_id,
        org_id = %org_id,
        caller = %handshake.caller,
        sample_rate = handshake.sample_rate,
        "Bridge connected"
    );

    // Egress pump: synthesized frames back to the bridge as binary
    let (egress_tx, mut egress_rx) = mpsc::channel(256);
    let egress_pump = tokio::spawn(async move {
        while let Some(frame) = egress_rx.recv().await {
            let bytes = encode_audio_frame(&frame);
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
    });

    let runner = CallRunner::new(session.clone(), state.runner_deps.clone(), egress_tx);
    let (input_tx, input_rx) = mpsc::channel(512);
    let run = tokio::spawn(runner.run(input_rx));

    // Inbound pump: bridge messages into the runner
    let mut sequence: u64 = 0;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(bytes)) => match decode_audio_frame(&bytes, sample_rate, sequence) {
                Ok(frame) => {
                    sequence += 1;
                    if input_tx.send(RunnerInput::Audio(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed audio frame dropped");
                }
            },
            Ok(Message::Text(text)) => match BridgeMessage::from_text(&text, true) {
                Ok(BridgeMessage::Control(BridgeControl::Hangup)) => {
                    let _ = input_tx.send(RunnerInput::Hangup).await;
                    break;
                }
                Ok(BridgeMessage::Control(BridgeControl::Dtmf { digit })) => {
                    let _ = input_tx.send(RunnerInput::Dtmf(digit)).await;
                }
                Ok(BridgeMessage::Control(BridgeControl::Metadata { data })) => {
                    let _ = input_tx.send(RunnerInput::Metadata(data)).await;
                }
                Ok(BridgeMessage::Handshake(_)) | Ok(BridgeMessage::Audio(_)) | Err(_) => {
                    tracing::warn!("Malformed control message dropped");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Dropping the sender tells the runner the bridge closed
    drop(input_tx);

    let outcome = match run.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "Runner task failed");
            CallOutcome::Failed
        }
    };

    if let Err(e) = state.registry.close(call_id, outcome).await {
        tracing::error!(call_id = %call_id, error = %e, "Session close failed");
    }

    egress_pump.abort();
    tracing::info!(call_id = %call_id, ?outcome, "Bridge disconnected");
}
