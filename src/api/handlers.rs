use crate::api::models::{HealthResponse, SignalMessage, StreamSummary};
use crate::app::App;
use anyhow::{bail, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use std::sync::Arc;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn list_streams(State(app): State<Arc<App>>) -> Json<Vec<StreamSummary>> {
    let mut streams: Vec<StreamSummary> = app
        .hub
        .status()
        .into_iter()
        .map(|s| StreamSummary {
            name: s.name,
            on_demand: s.on_demand,
            codec_ready: s.codec_ready,
            viewers: s.viewers,
            last_error: s.last_error,
        })
        .collect();
    streams.sort_by(|a, b| a.name.cmp(&b.name));
    Json(streams)
}

/// WebSocket signaling endpoint: one offer in, one answer out, then the
/// socket is parked while media flows over the negotiated peer connection.
pub async fn webrtc_ws(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = serve_viewer(app, &name, socket).await {
            log::warn!("webrtc viewer on stream {name} failed: {e:#}");
        }
    })
}

async fn serve_viewer(app: Arc<App>, name: &str, mut socket: WebSocket) -> Result<()> {
    let offer = match read_offer(&mut socket).await? {
        Some(offer) => offer,
        None => return Ok(()), // client went away before offering
    };

    let codecs = app.wait_for_codecs(name).await?;
    let mut session = app.webrtc.create_session(&codecs).await?;
    let answer = match session.negotiate(offer).await {
        Ok(answer) => answer,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };

    let reply = SignalMessage {
        kind: "webrtc".to_string(),
        sdp: answer,
    };
    let reply = serde_json::to_string(&reply)?;
    if let Err(e) = socket.send(Message::Text(reply)).await {
        session.close().await;
        return Err(e).context("failed to send SDP answer");
    }

    // The answer is on the wire before the first sample can flow.
    let (viewer_id, packets, _) = match app.hub.subscribe(name) {
        Some(subscription) => subscription,
        None => {
            session.close().await;
            bail!("stream disappeared before subscribe");
        }
    };
    log::info!("stream {name}: viewer {viewer_id} connected");

    session.serve(packets).await;

    app.hub.unsubscribe(name, viewer_id);
    log::info!("stream {name}: viewer {viewer_id} disconnected");
    Ok(())
}

async fn read_offer(socket: &mut WebSocket) -> Result<Option<String>> {
    while let Some(message) = socket.recv().await {
        match message.context("websocket receive failed")? {
            Message::Text(text) => {
                let msg: SignalMessage =
                    serde_json::from_str(&text).context("malformed signaling message")?;
                if msg.kind != "webrtc" {
                    bail!("unknown signaling message type {}", msg.kind);
                }
                return Ok(Some(msg.sdp));
            }
            Message::Close(_) => return Ok(None),
            // Pings are answered by axum; anything else is noise.
            _ => continue,
        }
    }
    Ok(None)
}
