use serde::{Deserialize, Serialize};

/// The one signaling exchange: `{"type": "webrtc", "sdp": <offer>}` in,
/// the same shape with the answer out.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

#[derive(Debug, Serialize)]
pub struct StreamSummary {
    pub name: String,
    pub on_demand: bool,
    pub codec_ready: bool,
    pub viewers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
