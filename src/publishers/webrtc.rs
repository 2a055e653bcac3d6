//! Per-viewer WebRTC delivery: negotiates a peer connection against the
//! browser's offer, mirrors the stream's codec list as local tracks, and
//! forwards access units as media samples behind a keyframe gate.

use crate::common::nal;
use crate::common::packet::AccessUnit;
use crate::common::CodecData;
use crate::config::WebRtcConfig;
use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub struct WebRtcManager {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcManager {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if config.port_min > 0 && config.port_max > 0 {
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(EphemeralUDP::new(
                config.port_min,
                config.port_max,
            )?));
            log::info!("WebRTC UDP port range {}..{}", config.port_min, config.port_max);
        }
        if !config.host_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(config.host_ips.clone(), RTCIceCandidateType::Host);
            log::info!("WebRTC NAT 1:1 host candidates {:?}", config.host_ips);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            config: config.clone(),
        })
    }

    /// Builds a peer connection with one local track per deliverable codec.
    /// Fails when the codec list yields no track at all.
    pub async fn create_session(&self, codecs: &[CodecData]) -> Result<WebRtcSession> {
        let mut tracks: HashMap<i8, Arc<TrackLocalStaticSample>> = HashMap::new();
        for (idx, codec) in codecs.iter().enumerate() {
            let track = match codec {
                CodecData::H264 { .. } => Some(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        ..Default::default()
                    },
                    "video".to_owned(),
                    "camgate-video".to_owned(),
                )),
                CodecData::H265 { .. } => {
                    log::warn!("H.265 is not deliverable over WebRTC, skipping video track");
                    None
                }
                audio if audio.is_audio() => {
                    match audio.audio_codec().and_then(|c| c.mime_type()) {
                        Some(mime) => Some(TrackLocalStaticSample::new(
                            RTCRtpCodecCapability {
                                mime_type: mime.to_owned(),
                                clock_rate: audio.sample_rate().unwrap_or(8000),
                                channels: u16::from(audio.channels().unwrap_or(1)),
                                ..Default::default()
                            },
                            "audio".to_owned(),
                            "camgate-audio".to_owned(),
                        )),
                        None => {
                            log::warn!("audio codec {codec} is not deliverable over WebRTC, skipping track");
                            None
                        }
                    }
                }
                _ => None,
            };
            if let Some(track) = track {
                tracks.insert(idx as i8, Arc::new(track));
            }
        }
        if tracks.is_empty() {
            bail!("no WebRTC-compatible track available");
        }

        let mut rtc_config = RTCConfiguration::default();
        if !self.config.ice_servers.is_empty() {
            rtc_config.ice_servers.push(RTCIceServer {
                urls: self.config.ice_servers.clone(),
                username: self.config.ice_username.clone(),
                credential: self.config.ice_credential.clone(),
                credential_type: RTCIceCredentialType::Password,
            });
        }

        let pc = self.api.new_peer_connection(rtc_config).await?;

        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = ice_tx.send(state);
            Box::pin(async {})
        }));

        for track in tracks.values() {
            let sender = pc.add_track(track.clone()).await?;
            // RTCP must be drained for the interceptor chain (NACK etc.) to
            // do its work; payloads themselves are discarded.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        Ok(WebRtcSession {
            pc,
            tracks,
            codecs: codecs.to_vec(),
            ice_rx,
        })
    }
}

pub struct WebRtcSession {
    pc: RTCPeerConnection,
    tracks: HashMap<i8, Arc<TrackLocalStaticSample>>,
    codecs: Vec<CodecData>,
    ice_rx: mpsc::UnboundedReceiver<RTCIceConnectionState>,
}

impl WebRtcSession {
    /// SDP negotiation: applies the browser offer, waits out ICE candidate
    /// gathering (aborting on early ICE failure), and returns the answer.
    pub async fn negotiate(&mut self, offer_sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)?;
        self.pc.set_remote_description(offer).await?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;

        loop {
            tokio::select! {
                _ = gather_complete.recv() => break,
                state = self.ice_rx.recv() => match state {
                    Some(
                        RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed,
                    ) => bail!("ICE connection failed during offer/answer"),
                    Some(_) => {}
                    None => bail!("ICE state feed closed during offer/answer"),
                },
            }
        }

        let local = self
            .pc
            .local_description()
            .await
            .context("no local description available")?;
        Ok(local.sdp)
    }

    /// Forwards access units from the hub channel to the peer until the
    /// viewer disconnects or the stream ends, then closes the connection.
    ///
    /// Samples are discarded until the first keyframe so the decoder never
    /// starts mid-GOP.
    pub async fn serve(mut self, mut packets: mpsc::Receiver<AccessUnit>) {
        let mut state = RTCIceConnectionState::New;
        let mut gate = KeyframeGate::default();

        'session: loop {
            match state {
                RTCIceConnectionState::New | RTCIceConnectionState::Checking => {
                    match self.ice_rx.recv().await {
                        Some(next) => state = next,
                        None => break 'session,
                    }
                }
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    tokio::select! {
                        next = self.ice_rx.recv() => match next {
                            Some(next) => state = next,
                            None => break 'session,
                        },
                        pkt = packets.recv() => match pkt {
                            Some(pkt) => {
                                if !gate.admit(&pkt) {
                                    continue;
                                }
                                if let Err(e) = self.write_packet(&pkt).await {
                                    log::warn!("viewer write failed: {e}");
                                    break 'session;
                                }
                            }
                            None => break 'session, // producer went away
                        },
                    }
                }
                RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                    log::info!("viewer ICE connection lost");
                    break 'session;
                }
                other => {
                    log::warn!("unexpected ICE connection state {other}");
                    break 'session;
                }
            }
        }

        self.close().await;
    }

    async fn write_packet(&self, pkt: &AccessUnit) -> Result<()> {
        if pkt.data.len() < 5 {
            return Ok(());
        }
        let Some(track) = self.tracks.get(&pkt.idx) else {
            return Ok(());
        };
        let codec = self
            .codecs
            .get(pkt.idx as usize)
            .context("access unit index out of codec range")?;

        match codec {
            CodecData::H264 { sps, pps } => {
                for data in h264_samples(&pkt.data, sps, pps) {
                    track
                        .write_sample(&Sample {
                            data,
                            duration: pkt.duration,
                            ..Default::default()
                        })
                        .await?;
                }
            }
            CodecData::PcmAlaw { .. } | CodecData::PcmMulaw { .. } | CodecData::Opus { .. } => {
                track
                    .write_sample(&Sample {
                        data: pkt.data.clone(),
                        duration: pkt.duration,
                        ..Default::default()
                    })
                    .await?;
            }
            other => bail!("codec {other} is not deliverable over WebRTC"),
        }
        Ok(())
    }

    /// Closes the peer connection and waits for the ICE feed to settle.
    pub async fn close(mut self) {
        if let Err(e) = self.pc.close().await {
            log::warn!("failed to close peer connection: {e}");
        }
        // Drain ICE states until the Closed transition, bounded in case the
        // agent never ran.
        let drain = async {
            while let Some(state) = self.ice_rx.recv().await {
                if state == RTCIceConnectionState::Closed {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), drain).await;
    }
}

/// Discards samples until the first keyframe so a decoder never starts
/// mid-GOP.
#[derive(Default)]
struct KeyframeGate {
    started: bool,
}

impl KeyframeGate {
    fn admit(&mut self, pkt: &AccessUnit) -> bool {
        if pkt.is_keyframe {
            self.started = true;
        }
        self.started
    }
}

/// Converts an AVCC-framed H.264 access unit into Annex-B samples for the
/// track writer. IDR slices get the cached parameter sets prepended so a
/// freshly gated viewer can decode from its first sample; other NAL types
/// are dropped at this boundary.
fn h264_samples(data: &[u8], sps: &[u8], pps: &[u8]) -> Vec<Bytes> {
    let mut samples = Vec::new();
    for unit in nal::avcc_split(data) {
        match unit.nal_type() {
            5 => samples.push(annex_b_join(&[sps, pps, unit.0])),
            1 => samples.push(annex_b_join(&[unit.0])),
            _ => {}
        }
    }
    samples
}

fn annex_b_join(units: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::new();
    for unit in units {
        if unit.is_empty() {
            continue;
        }
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(unit);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::packet::length_prefixed;

    #[test]
    fn idr_samples_carry_parameter_sets() {
        let sps = [0x67, 0x42, 0x00, 0x1E];
        let pps = [0x68, 0xCE];
        let au = length_prefixed(&[0x65, 0x88, 0x84]);

        let samples = h264_samples(&au, &sps, &pps);
        assert_eq!(samples.len(), 1);
        assert_eq!(
            &samples[0][..],
            &[
                0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, // SPS
                0, 0, 0, 1, 0x68, 0xCE, // PPS
                0, 0, 0, 1, 0x65, 0x88, 0x84, // IDR
            ]
        );
    }

    #[test]
    fn idr_without_cached_parameter_sets_stands_alone() {
        let au = length_prefixed(&[0x65, 0x88]);
        let samples = h264_samples(&au, &[], &[]);
        assert_eq!(&samples[0][..], &[0, 0, 0, 1, 0x65, 0x88]);
    }

    #[test]
    fn non_vcl_units_are_dropped_at_delivery() {
        let mut au = BytesMut::new();
        au.extend_from_slice(&length_prefixed(&[0x67, 0x42, 0x00, 0x1E])); // SPS
        au.extend_from_slice(&length_prefixed(&[0x41, 0x9A])); // non-IDR slice
        let samples = h264_samples(&au, &[], &[]);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0][..], &[0, 0, 0, 1, 0x41, 0x9A]);
    }

    #[test]
    fn keyframe_gate_holds_until_first_idr() {
        use std::time::Duration;
        let au = |keyframe| AccessUnit {
            data: length_prefixed(&[if keyframe { 0x65 } else { 0x41 }, 0x9A]),
            time: Duration::ZERO,
            duration: Duration::from_millis(40),
            composition_time: Duration::from_millis(1),
            idx: 0,
            is_keyframe: keyframe,
        };

        let mut gate = KeyframeGate::default();
        assert!(!gate.admit(&au(false)));
        assert!(!gate.admit(&au(false)));
        assert!(gate.admit(&au(true)), "the keyframe itself is delivered");
        assert!(gate.admit(&au(false)), "everything after it flows");
    }

    #[tokio::test]
    async fn session_requires_a_deliverable_track() {
        let manager = WebRtcManager::new(&WebRtcConfig::default()).unwrap();
        let codecs = vec![CodecData::Pcm { sample_rate: 8000 }];
        assert!(manager.create_session(&codecs).await.is_err());
    }

    #[tokio::test]
    async fn session_builds_tracks_for_h264_and_pcma() {
        let manager = WebRtcManager::new(&WebRtcConfig::default()).unwrap();
        let codecs = vec![
            CodecData::H264 {
                sps: Bytes::new(),
                pps: Bytes::new(),
            },
            CodecData::PcmAlaw { sample_rate: 8000 },
        ];
        let session = manager.create_session(&codecs).await.unwrap();
        assert_eq!(session.tracks.len(), 2);
        assert!(session.tracks.contains_key(&0));
        assert!(session.tracks.contains_key(&1));
        session.close().await;
    }
}
