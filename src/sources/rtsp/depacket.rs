//! Turns the RTP packet stream into access units: reassembles fragmentation
//! units, unpacks aggregates, tracks in-band parameter-set updates, and
//! casts the result into the hub tagged keyframe / non-keyframe.

use super::media::MediaInfo;
use super::player::MediaSink;
use crate::common::nal::{self, Unit};
use crate::common::packet::{length_prefixed, AccessUnit};
use crate::common::rtp::RtpPacket;
use crate::common::{AudioCodec, CodecData, CodecKind, VideoCodec};
use crate::hub::StreamHub;
use anyhow::{bail, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A runaway reassembly buffer means lost framing; reset rather than grow.
const MAX_REASSEMBLY: usize = 4 << 20;

const DEFAULT_AUDIO_CLOCK_RATE: u32 = 8000;

// H.264 nal_unit_type values (RFC 6184 §5.2 for the payload-level types).
const H264_NAL_IDR: u8 = 5;
const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;
const H264_NAL_AUD: u8 = 9;
const H264_NAL_FILLER: u8 = 12;
const H264_NAL_STAP_A: u8 = 24;
const H264_NAL_FU_A: u8 = 28;

// H.265 nal_unit_type values (ITU-T H.265 table 7-1; RFC 7798 §4.4.3 for FU).
const H265_NAL_IDR_W_RADL: u8 = 19;
const H265_NAL_VPS: u8 = 32;
const H265_NAL_SPS: u8 = 33;
const H265_NAL_PPS: u8 = 34;
const H265_NAL_FU: u8 = 49;

pub struct Depacketizer {
    name: String,
    hub: Arc<StreamHub>,
    /// Shared with the supervisor's keyframe watchdog.
    last_keyframe: Arc<Mutex<Instant>>,
    debug: bool,

    reassembly: Vec<u8>,
    codecs: Vec<CodecData>,
    video_idx: i8,
    audio_idx: i8,
    video_codec: Option<VideoCodec>,
    audio_codec: Option<AudioCodec>,
    audio_only: bool,

    sps: Bytes,
    pps: Bytes,
    vps: Bytes,

    audio_clock_rate: u32,
    audio_timeline: Duration,
    prev_video_ts: i64,
    prev_sequence: Option<u16>,
}

impl Depacketizer {
    pub fn new(
        name: &str,
        hub: Arc<StreamHub>,
        last_keyframe: Arc<Mutex<Instant>>,
        debug: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            hub,
            last_keyframe,
            debug,
            reassembly: Vec::new(),
            codecs: Vec::new(),
            video_idx: -1,
            audio_idx: -2,
            video_codec: None,
            audio_codec: None,
            audio_only: false,
            sps: Bytes::new(),
            pps: Bytes::new(),
            vps: Bytes::new(),
            audio_clock_rate: DEFAULT_AUDIO_CLOCK_RATE,
            audio_timeline: Duration::ZERO,
            prev_video_ts: 0,
            prev_sequence: None,
        }
    }

    /// Advances the per-packet video clock: handles the 2^32 timestamp wrap
    /// and yields `(time, duration)` for access units from this packet.
    fn video_times(&mut self, timestamp: u32) -> (Duration, Duration) {
        let ts = timestamp as i64;
        if self.prev_video_ts == 0 {
            self.prev_video_ts = ts;
        }
        if ts - self.prev_video_ts < 0 {
            // Only a previous timestamp within 100 ms of the wrap point is a
            // genuine wraparound; anything else is a stream reset.
            if (u32::MAX as i64) - self.prev_video_ts < 90 * 100 {
                self.prev_video_ts -= (u32::MAX as i64) + 1;
            } else {
                self.prev_video_ts = 0;
            }
        }
        let duration = Duration::from_millis(((ts - self.prev_video_ts) / 90).max(0) as u64);
        let time = Duration::from_millis((ts / 90) as u64);
        (time, duration)
    }

    fn emit_video(
        &mut self,
        nalu: &[u8],
        is_keyframe: bool,
        time: Duration,
        duration: Duration,
        emitted: &mut bool,
    ) {
        if self.debug {
            log::trace!(
                "stream {}: video AU {} bytes keyframe={is_keyframe}",
                self.name,
                nalu.len()
            );
        }
        if is_keyframe {
            *self.last_keyframe.lock() = Instant::now();
        }
        self.hub.cast(
            &self.name,
            AccessUnit {
                data: length_prefixed(nalu),
                time,
                duration,
                composition_time: Duration::from_millis(1),
                idx: self.video_idx,
                is_keyframe,
            },
        );
        *emitted = true;
    }

    fn emit_audio(&mut self, frame: &[u8], duration: Duration) {
        self.audio_timeline += duration;
        self.hub.cast(
            &self.name,
            AccessUnit {
                data: Bytes::copy_from_slice(frame),
                time: self.audio_timeline,
                duration,
                composition_time: Duration::from_millis(1),
                idx: self.audio_idx,
                is_keyframe: false,
            },
        );
    }

    fn h264_unit(&mut self, unit: Unit<'_>, time: Duration, duration: Duration, emitted: &mut bool) {
        match unit.nal_type() {
            1..=4 => self.emit_video(&unit, false, time, duration, emitted),
            H264_NAL_IDR => self.emit_video(&unit, true, time, duration, emitted),
            H264_NAL_SPS => self.update_sps(&unit),
            H264_NAL_PPS => self.update_pps(&unit),
            H264_NAL_STAP_A => {
                let mut rest = unit.payload();
                while rest.len() >= 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    if size == 0 || rest.len() < 2 + size {
                        log::warn!("stream {}: incorrect segment size in STAP-A", self.name);
                        break;
                    }
                    let inner = Unit(&rest[2..2 + size]);
                    match inner.nal_type() {
                        1..=4 => self.emit_video(&inner, false, time, duration, emitted),
                        H264_NAL_IDR => self.emit_video(&inner, true, time, duration, emitted),
                        H264_NAL_SPS => self.update_sps(&inner),
                        H264_NAL_PPS => self.update_pps(&inner),
                        t => log::debug!("stream {}: unsupported NAL type {t} in STAP-A", self.name),
                    }
                    rest = &rest[2 + size..];
                }
            }
            H264_NAL_FU_A => self.h264_fragment(unit, time, duration, emitted),
            t => log::debug!("stream {}: unsupported NAL type {t}", self.name),
        }
    }

    fn h264_fragment(
        &mut self,
        unit: Unit<'_>,
        time: Duration,
        duration: Duration,
        emitted: &mut bool,
    ) {
        if unit.len() < 2 {
            log::debug!("stream {}: truncated FU-A unit", self.name);
            return;
        }
        let indicator = unit[0];
        let header = unit[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            self.reassembly.clear();
            self.reassembly.push((indicator & 0xE0) | (header & 0x1F));
        }
        // An empty buffer here means the start fragment was lost; discard.
        if self.reassembly.is_empty() {
            return;
        }
        self.reassembly.extend_from_slice(&unit[2..]);
        if !end {
            return;
        }

        let buffered = std::mem::take(&mut self.reassembly);
        let first = Unit(&buffered);
        // RFC 6184 does not allow Annex-B inside a fragmented payload, but
        // some cameras emit parameter sets as a byte stream anyway.
        let units = if matches!(first.nal_type(), H264_NAL_SPS | H264_NAL_AUD) {
            nal::annex_b_split(&buffered).0
        } else {
            vec![first]
        };
        for u in units {
            if u.is_empty() {
                continue;
            }
            match u.nal_type() {
                1..=4 => self.emit_video(&u, false, time, duration, emitted),
                H264_NAL_IDR => self.emit_video(&u, true, time, duration, emitted),
                H264_NAL_SPS => self.update_sps(&u),
                H264_NAL_PPS => self.update_pps(&u),
                H264_NAL_FILLER => {}
                t => log::debug!(
                    "stream {}: unsupported NAL type {t} in fragmented unit",
                    self.name
                ),
            }
        }
        self.reassembly = buffered;
        self.reassembly.clear();
    }

    fn h265_unit(&mut self, unit: Unit<'_>, time: Duration, duration: Duration, emitted: &mut bool) {
        if unit.len() < 2 {
            log::debug!("stream {}: truncated H.265 unit", self.name);
            return;
        }
        let nal_type = unit.h265_type();
        match nal_type {
            // Trailing/leading picture slice segments.
            0..=9 => self.emit_video(&unit, false, time, duration, emitted),
            // IRAP pictures decode without references.
            19..=21 => self.emit_video(&unit, true, time, duration, emitted),
            H265_NAL_VPS => self.update_vps(&unit),
            H265_NAL_SPS => self.update_sps(&unit),
            H265_NAL_PPS => self.update_pps(&unit),
            H265_NAL_FU => {
                if unit.len() < 3 {
                    log::debug!("stream {}: truncated H.265 fragmentation unit", self.name);
                    return;
                }
                let fu_header = unit[2];
                let start_end = fu_header >> 6;
                let inner_type = fu_header & 0x3F;
                match start_end {
                    2 => {
                        self.reassembly.clear();
                        self.reassembly.push((unit[0] & 0x81) | (inner_type << 1));
                        self.reassembly.push(unit[1]);
                        self.reassembly.extend_from_slice(&unit[3..]);
                    }
                    1 => {
                        if self.reassembly.is_empty() {
                            return;
                        }
                        self.reassembly.extend_from_slice(&unit[3..]);
                        let buffered = std::mem::take(&mut self.reassembly);
                        self.emit_video(
                            &buffered,
                            inner_type == H265_NAL_IDR_W_RADL,
                            time,
                            duration,
                            emitted,
                        );
                        self.reassembly = buffered;
                        self.reassembly.clear();
                    }
                    _ => {
                        if !self.reassembly.is_empty() {
                            self.reassembly.extend_from_slice(&unit[3..]);
                        }
                    }
                }
            }
            t => log::debug!("stream {}: unsupported NAL type {t}", self.name),
        }
    }

    fn update_sps(&mut self, val: &[u8]) {
        let Some(codec) = self.video_codec else {
            return;
        };
        if self.sps == val {
            return;
        }
        self.sps = Bytes::copy_from_slice(val);
        self.rebuild_video_codec(codec);
    }

    fn update_pps(&mut self, val: &[u8]) {
        let Some(codec) = self.video_codec else {
            return;
        };
        if self.pps == val {
            return;
        }
        self.pps = Bytes::copy_from_slice(val);
        self.rebuild_video_codec(codec);
    }

    fn update_vps(&mut self, val: &[u8]) {
        if self.video_codec != Some(VideoCodec::H265) {
            return;
        }
        if self.vps == val {
            return;
        }
        self.vps = Bytes::copy_from_slice(val);
        self.rebuild_video_codec(VideoCodec::H265);
    }

    /// Rebuilds the derived codec data once the full parameter-set group is
    /// known, replaces the video entry, and publishes the new list.
    fn rebuild_video_codec(&mut self, codec: VideoCodec) {
        let complete = match codec {
            VideoCodec::H264 => !self.sps.is_empty() && !self.pps.is_empty(),
            VideoCodec::H265 => {
                !self.vps.is_empty() && !self.sps.is_empty() && !self.pps.is_empty()
            }
        };
        if !complete {
            return;
        }

        let data = match codec {
            VideoCodec::H264 => CodecData::h264(self.sps.clone(), self.pps.clone()),
            VideoCodec::H265 => {
                CodecData::h265(self.vps.clone(), self.sps.clone(), self.pps.clone())
            }
        };
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                log::warn!("stream {}: parameter set parse failed: {e}", self.name);
                return;
            }
        };

        if self.video_idx >= 0 {
            self.codecs[self.video_idx as usize] = data;
            self.hub.codec_set(&self.name, self.codecs.clone());
        }
    }

    fn aac_packet(&mut self, unit: &[u8]) {
        if unit.len() < 2 {
            log::debug!("stream {}: truncated AAC payload", self.name);
            return;
        }
        // RFC 3640: a bit count of 16-bit AU headers, then the headers, then
        // the concatenated frames.
        let au_headers_length = u16::from_be_bytes([unit[0], unit[1]]) as usize;
        let count = au_headers_length >> 4;
        let headers_end = 2 + count * 2;
        if unit.len() < headers_end {
            log::warn!("stream {}: truncated AAC AU headers", self.name);
            return;
        }

        let mut headers = &unit[2..headers_end];
        let mut frames = &unit[headers_end..];
        let duration = Duration::from_nanos(1_024_000_000_000 / self.audio_clock_rate as u64);
        for _ in 0..count {
            let au_header = u16::from_be_bytes([headers[0], headers[1]]);
            let size = (au_header >> 3) as usize;
            if frames.len() < size {
                log::warn!("stream {}: truncated AAC frame", self.name);
                break;
            }
            let mut frame = &frames[..size];
            headers = &headers[2..];
            frames = &frames[size..];
            if let Some(stripped) = strip_adts_header(frame) {
                frame = stripped;
            }
            self.emit_audio(frame, duration);
        }
    }
}

/// Some encoders wrap each AAC frame in an ADTS header; strip it so the
/// payload is a raw AAC frame.
fn strip_adts_header(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 7 || frame[0] != 0xFF || frame[1] & 0xF0 != 0xF0 {
        return None;
    }
    let protection_absent = frame[1] & 0x01 != 0;
    let header_len = if protection_absent { 7 } else { 9 };
    frame.get(header_len..)
}

impl MediaSink for Depacketizer {
    fn configure(&mut self, video: Option<&MediaInfo>, audio: Option<&MediaInfo>) -> Result<()> {
        if !self.codecs.is_empty() {
            return Ok(());
        }

        if let Some(m) = video {
            let data = match m.codec {
                Some(CodecKind::Video(VideoCodec::H264)) => {
                    self.video_codec = Some(VideoCodec::H264);
                    let mut data = CodecData::H264 {
                        sps: Bytes::new(),
                        pps: Bytes::new(),
                    };
                    if !m.sprop_sps.is_empty() && !m.sprop_pps.is_empty() {
                        match CodecData::h264(m.sprop_sps.clone(), m.sprop_pps.clone()) {
                            Ok(d) => {
                                self.sps = m.sprop_sps.clone();
                                self.pps = m.sprop_pps.clone();
                                data = d;
                            }
                            Err(e) => log::warn!(
                                "stream {}: SDP H.264 parameter sets rejected: {e}",
                                self.name
                            ),
                        }
                    }
                    data
                }
                Some(CodecKind::Video(VideoCodec::H265)) => {
                    self.video_codec = Some(VideoCodec::H265);
                    let mut data = CodecData::H265 {
                        vps: Bytes::new(),
                        sps: Bytes::new(),
                        pps: Bytes::new(),
                    };
                    if !m.sprop_vps.is_empty()
                        && !m.sprop_sps.is_empty()
                        && !m.sprop_pps.is_empty()
                    {
                        match CodecData::h265(
                            m.sprop_vps.clone(),
                            m.sprop_sps.clone(),
                            m.sprop_pps.clone(),
                        ) {
                            Ok(d) => {
                                self.vps = m.sprop_vps.clone();
                                self.sps = m.sprop_sps.clone();
                                self.pps = m.sprop_pps.clone();
                                data = d;
                            }
                            Err(e) => log::warn!(
                                "stream {}: SDP H.265 parameter sets rejected: {e}",
                                self.name
                            ),
                        }
                    }
                    data
                }
                _ => bail!("SDP video codec not supported"),
            };
            self.codecs.push(data);
            self.video_idx = (self.codecs.len() - 1) as i8;
        }

        if let Some(m) = audio {
            let data = match m.codec {
                Some(CodecKind::Audio(AudioCodec::Aac)) => match CodecData::aac(&m.aac_config) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        log::warn!("stream {}: bad AAC config in SDP: {e}", self.name);
                        None
                    }
                },
                Some(CodecKind::Audio(AudioCodec::Opus)) => Some(CodecData::Opus {
                    sample_rate: m.clock_rate,
                    channels: if m.channels == 2 { 2 } else { 1 },
                }),
                Some(CodecKind::Audio(AudioCodec::PcmAlaw)) => Some(CodecData::PcmAlaw {
                    sample_rate: m.clock_rate,
                }),
                Some(CodecKind::Audio(AudioCodec::PcmMulaw)) => Some(CodecData::PcmMulaw {
                    sample_rate: m.clock_rate,
                }),
                Some(CodecKind::Audio(AudioCodec::Pcm)) => Some(CodecData::Pcm {
                    sample_rate: m.clock_rate,
                }),
                _ => {
                    log::warn!("stream {}: SDP audio codec not supported", self.name);
                    None
                }
            };
            if let Some(data) = data {
                self.audio_codec = data.audio_codec();
                if m.clock_rate != 0 {
                    self.audio_clock_rate = m.clock_rate;
                }
                self.codecs.push(data);
                self.audio_idx = (self.codecs.len() - 1) as i8;
                if video.is_none() {
                    self.audio_only = true;
                }
            }
        }

        if !self.codecs.is_empty() {
            // Cheap cameras misreport parameter sets in SDP, so in-band
            // updates always win over this initial seed.
            self.hub
                .codec_set_if_absent(&self.name, self.codecs.clone());
        }
        Ok(())
    }

    fn on_video_packet(&mut self, pkt: &RtpPacket<'_>) -> Result<()> {
        let Some(video_codec) = self.video_codec else {
            return Ok(());
        };

        let (time, duration) = self.video_times(pkt.timestamp);

        if let Some(prev) = self.prev_sequence {
            if pkt.sequence.wrapping_sub(prev) != 1 {
                log::debug!(
                    "stream {}: RTP sequence gap after {prev}, got {}",
                    self.name,
                    pkt.sequence
                );
            }
        }
        self.prev_sequence = Some(pkt.sequence);

        if self.reassembly.len() > MAX_REASSEMBLY {
            log::warn!("stream {}: resetting oversized reassembly buffer", self.name);
            self.reassembly.clear();
        }

        if pkt.payload.is_empty() {
            bail!("empty RTP video payload");
        }

        let mut emitted = false;
        match video_codec {
            VideoCodec::H264 => {
                let first = Unit(pkt.payload);
                // Annex-B byte streams inside a single RTP payload are a
                // cheap-camera quirk; split them apart first.
                if matches!(first.nal_type(), H264_NAL_SPS | H264_NAL_AUD) {
                    let (units, _) = nal::annex_b_split(pkt.payload);
                    for u in units {
                        if u.is_empty() {
                            continue;
                        }
                        self.h264_unit(u, time, duration, &mut emitted);
                    }
                } else {
                    self.h264_unit(first, time, duration, &mut emitted);
                }
            }
            VideoCodec::H265 => self.h265_unit(Unit(pkt.payload), time, duration, &mut emitted),
        }

        if emitted {
            self.prev_video_ts = pkt.timestamp as i64;
        }
        Ok(())
    }

    fn on_audio_packet(&mut self, pkt: &RtpPacket<'_>) -> Result<()> {
        let Some(audio_codec) = self.audio_codec else {
            return Ok(());
        };
        if pkt.payload.is_empty() {
            return Ok(());
        }

        let mut emitted = false;
        for unit in nal::compatible_split(pkt.payload, false) {
            if unit.is_empty() {
                continue;
            }
            match audio_codec {
                AudioCodec::PcmAlaw | AudioCodec::PcmMulaw | AudioCodec::Pcm => {
                    let duration = Duration::from_nanos(
                        unit.len() as u64 * 1_000_000_000 / self.audio_clock_rate as u64,
                    );
                    self.emit_audio(&unit, duration);
                    emitted = true;
                }
                AudioCodec::Opus => {
                    self.emit_audio(&unit, Duration::from_millis(20));
                    emitted = true;
                }
                AudioCodec::Aac => {
                    self.aac_packet(&unit);
                    emitted = true;
                }
            }
        }

        // Audio-only streams have no keyframes to feed the watchdog.
        if emitted && self.audio_only {
            *self.last_keyframe.lock() = Instant::now();
        }
        Ok(())
    }
}
