use crate::common::CodecData;
use crate::config::GatewayConfig;
use crate::hub::StreamHub;
use crate::publishers::webrtc::WebRtcManager;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// How long a freshly-started producer gets to learn its codecs before a
/// viewer request gives up.
const CODEC_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const CODEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Top-level wiring: the hub and the WebRTC API, shared by the signaling
/// handlers and the producer supervisors.
pub struct App {
    pub hub: Arc<StreamHub>,
    pub webrtc: WebRtcManager,
}

impl App {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let hub = Arc::new(StreamHub::new(config.viewer_queue));
        for (name, stream) in &config.streams {
            hub.insert_stream(name, stream.clone());
        }
        let webrtc = WebRtcManager::new(&config.webrtc).context("WebRTC init failed")?;
        Ok(Self { hub, webrtc })
    }

    /// Starts the producers for every always-on stream.
    pub fn serve_streams(&self) {
        self.hub.start_all();
    }

    /// Resolves the codec list for a viewer, starting the producer if the
    /// stream is on-demand and waiting briefly for the first parameter sets.
    pub async fn wait_for_codecs(&self, name: &str) -> Result<Vec<CodecData>> {
        if !self.hub.contains(name) {
            bail!("stream {name} not found");
        }
        self.hub.ensure_running(name);

        let deadline = tokio::time::Instant::now() + CODEC_WAIT_TIMEOUT;
        loop {
            if let Some(codecs) = self.hub.codecs(name) {
                if !codecs.is_empty() {
                    return Ok(codecs);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("stream {name} has no codec information yet, try again later");
            }
            tokio::time::sleep(CODEC_POLL_INTERVAL).await;
        }
    }
}
