//! RTSP ingest: connection transport, playback state machine, RTP
//! depacketization, and the per-stream supervisor that keeps a camera
//! session alive and feeds the hub.

pub mod depacket;
pub mod media;
pub mod message;
pub mod player;
pub mod transport;

use crate::config::SourceConfig;
use crate::hub::StreamHub;
use depacket::Depacketizer;
use parking_lot::Mutex;
use player::Player;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Errors of the RTSP wire layer. Anything above (SDP, codec setup,
/// watchdogs) uses `anyhow` at the session seam.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RTSP {0} timed out")]
    Timeout(&'static str),

    /// A byte that is neither `$` nor the start of an RTSP message; the
    /// connection has lost framing.
    #[error("desync on RTSP connection")]
    Desync,

    #[error("RTSP protocol error: {0}")]
    Protocol(String),

    /// The server rejected credentials twice.
    #[error("RTSP client unauthorized (401)")]
    Unauthorized,

    #[error("invalid RTSP URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Why a stream session ended. Only `NoViewer` stops the supervisor; the
/// rest lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum StreamExit {
    #[error("stream exit: no video on stream")]
    NoVideoOnStream,

    #[error("stream exit: on demand, no viewer")]
    NoViewer,

    #[error("stream exit: rtsp disconnect: {0}")]
    RtspDisconnect(#[source] anyhow::Error),
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
// Generous read timeout: some cameras are slow to start interleaving.
const READ_TIMEOUT: Duration = Duration::from_secs(6);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const KEYFRAME_TIMEOUT: Duration = Duration::from_secs(20);
const VIEWER_CHECK_INTERVAL: Duration = Duration::from_secs(20);

/// Per-stream producer supervisor: runs RTSP sessions in a reconnect loop
/// until cancelled or, for on-demand streams, until nobody is watching.
pub async fn supervise(
    hub: Arc<StreamHub>,
    name: String,
    config: SourceConfig,
    cancel: CancellationToken,
) {
    loop {
        log::info!("stream {name}: connecting to {}", config.url);
        match run_session(&hub, &name, &config, &cancel).await {
            Ok(()) => {}
            Err(exit) => {
                log::warn!("stream {name}: {exit}");
                hub.set_last_error(&name, exit.to_string());
                if matches!(exit, StreamExit::NoViewer) {
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        if config.on_demand && !hub.has_viewer(&name) {
            log::info!("stream {name}: {}", StreamExit::NoViewer);
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    hub.mark_stopped(&name);
    log::info!("stream {name}: supervisor stopped");
}

/// One RTSP session: connect, play, depacketize inline, with a watchdog
/// task enforcing the keyframe and on-demand-viewer rules.
async fn run_session(
    hub: &Arc<StreamHub>,
    name: &str,
    config: &SourceConfig,
    cancel: &CancellationToken,
) -> Result<(), StreamExit> {
    let (url, username, password) =
        transport::parse_url(&config.url).map_err(|e| StreamExit::RtspDisconnect(e.into()))?;
    let mut transport = transport::connect(&url, &username, &password, CONNECT_TIMEOUT)
        .await
        .map_err(|e| StreamExit::RtspDisconnect(e.into()))?;
    transport.read_timeout = READ_TIMEOUT;
    transport.write_timeout = WRITE_TIMEOUT;

    let session_cancel = cancel.child_token();
    let last_keyframe = Arc::new(Mutex::new(Instant::now()));
    let (exit_tx, mut exit_rx) = oneshot::channel();
    let watchdog = tokio::spawn(watchdog(
        hub.clone(),
        name.to_string(),
        config.on_demand,
        last_keyframe.clone(),
        session_cancel.clone(),
        exit_tx,
    ));

    let mut sink = Depacketizer::new(name, hub.clone(), last_keyframe, config.debug);
    let mut player = Player::new(url.as_str(), config.disable_audio);
    let result = player.run(&mut transport, &mut sink, &session_cancel).await;

    session_cancel.cancel();
    let _ = watchdog.await;

    // A watchdog-initiated exit outranks whatever the player reported: the
    // player just sees its session being cancelled.
    if let Ok(exit) = exit_rx.try_recv() {
        return Err(exit);
    }
    result.map_err(StreamExit::RtspDisconnect)
}

/// Cancels the session when no keyframe has been seen for 20 s, or (for
/// on-demand streams) when a 20 s check finds no viewers.
async fn watchdog(
    hub: Arc<StreamHub>,
    name: String,
    on_demand: bool,
    last_keyframe: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    exit_tx: oneshot::Sender<StreamExit>,
) {
    let mut exit_tx = Some(exit_tx);
    let mut viewer_check = tokio::time::interval(VIEWER_CHECK_INTERVAL);
    viewer_check.tick().await; // immediate first tick

    loop {
        let deadline = tokio::time::Instant::from_std(*last_keyframe.lock() + KEYFRAME_TIMEOUT);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                // re-check: a keyframe may have landed while we slept
                if last_keyframe.lock().elapsed() >= KEYFRAME_TIMEOUT {
                    log::warn!("stream {name}: keyframe timeout");
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(StreamExit::NoVideoOnStream);
                    }
                    cancel.cancel();
                    return;
                }
            }
            _ = viewer_check.tick() => {
                if on_demand && !hub.has_viewer(&name) {
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(StreamExit::NoViewer);
                    }
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn test_hub(on_demand: bool) -> (Arc<StreamHub>, SourceConfig) {
        let config = SourceConfig {
            url: "rtsp://cam.local/live".into(),
            on_demand,
            disable_audio: false,
            debug: false,
        };
        let hub = Arc::new(StreamHub::new(16));
        hub.insert_stream("cam", config.clone());
        (hub, config)
    }

    #[tokio::test(start_paused = true)]
    async fn keyframe_watchdog_fires_after_timeout() {
        let (hub, _) = test_hub(false);
        let last_keyframe = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(watchdog(
            hub,
            "cam".into(),
            false,
            last_keyframe,
            cancel.clone(),
            tx,
        ));

        tokio::time::sleep(Duration::from_secs(21)).await;
        handle.await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(StreamExit::NoVideoOnStream)));
    }

    #[tokio::test(start_paused = true)]
    async fn keyframe_resets_defer_expiry() {
        let (hub, _) = test_hub(false);
        let last_keyframe = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(watchdog(
            hub,
            "cam".into(),
            false,
            last_keyframe.clone(),
            cancel.clone(),
            tx,
        ));

        // a keyframe at 19 s defers expiry to 39 s
        tokio::time::sleep(Duration::from_secs(19)).await;
        *last_keyframe.lock() = Instant::now();
        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(!cancel.is_cancelled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(StreamExit::NoVideoOnStream)));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_watchdog_exits_without_viewers() {
        // the hub entry stays non-on-demand so subscribe never spawns a
        // real supervisor under the paused clock
        let (hub, _) = test_hub(false);
        let last_keyframe = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();

        // keep the keyframe deadline from firing first
        let keepalive = last_keyframe.clone();
        let feeder = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                *keepalive.lock() = Instant::now();
            }
        });

        let handle = tokio::spawn(watchdog(
            hub,
            "cam".into(),
            true,
            last_keyframe,
            cancel.clone(),
            tx,
        ));

        tokio::time::sleep(Duration::from_secs(21)).await;
        handle.await.unwrap();
        feeder.abort();
        assert!(matches!(rx.try_recv(), Ok(StreamExit::NoViewer)));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_watchdog_keeps_running_with_viewer() {
        let (hub, _) = test_hub(false);
        let (_id, _rx_pkts, _) = hub.subscribe("cam").unwrap();
        let last_keyframe = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();

        let keepalive = last_keyframe.clone();
        let feeder = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                *keepalive.lock() = Instant::now();
            }
        });

        let handle = tokio::spawn(watchdog(
            hub,
            "cam".into(),
            true,
            last_keyframe,
            cancel.clone(),
            tx,
        ));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(!cancel.is_cancelled());
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
        feeder.abort();
    }
}
