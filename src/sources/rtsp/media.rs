//! Extracts the per-track facts the gateway needs from an SDP session
//! description: media kind, codec, control URI, declared parameter sets,
//! and audio clock configuration.

use crate::common::{AudioCodec, CodecKind};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use sdp::description::media::MediaDescription;
use sdp::description::session::SessionDescription;
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One SDP media section, reduced to what SETUP and the depacketizer use.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub kind: MediaKind,
    /// None when the rtpmap encoding name is not one we can ingest.
    pub codec: Option<CodecKind>,
    pub control: String,
    pub clock_rate: u32,
    pub channels: u8,
    /// H.264 sprop-parameter-sets / H.265 sprop-vps/sps/pps; empty = absent.
    pub sprop_sps: Bytes,
    pub sprop_pps: Bytes,
    pub sprop_vps: Bytes,
    /// MPEG-4 AudioSpecificConfig from the AAC fmtp `config` parameter.
    pub aac_config: Vec<u8>,
}

/// Parses a DESCRIBE body into the media list, skipping sections that are
/// neither audio nor video.
pub fn parse_media_descriptions(body: &[u8]) -> Result<Vec<MediaInfo>> {
    let session = SessionDescription::unmarshal(&mut Cursor::new(body))
        .context("failed to parse SDP session description")?;

    let mut medias = Vec::new();
    for desc in &session.media_descriptions {
        let kind = match desc.media_name.media.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            _ => continue,
        };
        medias.push(parse_media(kind, desc));
    }
    Ok(medias)
}

fn parse_media(kind: MediaKind, desc: &MediaDescription) -> MediaInfo {
    let format = desc
        .media_name
        .formats
        .first()
        .map(String::as_str)
        .unwrap_or("");

    let mut media = MediaInfo {
        kind,
        // Static payload types carry no rtpmap (RFC 3551)
        codec: match (kind, format) {
            (MediaKind::Audio, "0") => Some(CodecKind::Audio(AudioCodec::PcmMulaw)),
            (MediaKind::Audio, "8") => Some(CodecKind::Audio(AudioCodec::PcmAlaw)),
            _ => None,
        },
        control: String::new(),
        clock_rate: match kind {
            MediaKind::Video => 90000,
            MediaKind::Audio => 8000,
        },
        channels: 1,
        sprop_sps: Bytes::new(),
        sprop_pps: Bytes::new(),
        sprop_vps: Bytes::new(),
        aac_config: Vec::new(),
    };

    for attr in &desc.attributes {
        let value = attr.value.as_deref().unwrap_or("");
        match attr.key.as_str() {
            "control" => media.control = value.to_string(),
            "rtpmap" => parse_rtpmap(&mut media, format, value),
            "fmtp" => parse_fmtp(&mut media, format, value),
            _ => {}
        }
    }

    media
}

/// `rtpmap:96 H264/90000` or `rtpmap:97 MPEG4-GENERIC/44100/2`
fn parse_rtpmap(media: &mut MediaInfo, format: &str, value: &str) {
    let (payload_type, encoding) = match value.split_once(' ') {
        Some(pair) => pair,
        None => return,
    };
    if payload_type.trim() != format {
        return;
    }

    let mut parts = encoding.trim().split('/');
    if let Some(name) = parts.next() {
        media.codec = CodecKind::from_encoding_name(name);
    }
    if let Some(rate) = parts.next().and_then(|r| r.parse().ok()) {
        media.clock_rate = rate;
    }
    if let Some(channels) = parts.next().and_then(|c| c.parse().ok()) {
        media.channels = channels;
    }
}

/// `fmtp:96 packetization-mode=1;sprop-parameter-sets=<sps>,<pps>` and
/// friends. Unknown parameters are ignored.
fn parse_fmtp(media: &mut MediaInfo, format: &str, value: &str) {
    let (payload_type, params) = match value.split_once(' ') {
        Some(pair) => pair,
        None => return,
    };
    if payload_type.trim() != format {
        return;
    }

    for param in params.split(';') {
        let (key, val) = match param.trim().split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "sprop-parameter-sets" => {
                let mut sets = val.split(',');
                if let Some(sps) = sets.next().and_then(decode_base64) {
                    media.sprop_sps = sps;
                }
                if let Some(pps) = sets.next().and_then(decode_base64) {
                    media.sprop_pps = pps;
                }
            }
            "sprop-vps" => {
                if let Some(vps) = decode_base64(val) {
                    media.sprop_vps = vps;
                }
            }
            "sprop-sps" => {
                if let Some(sps) = decode_base64(val) {
                    media.sprop_sps = sps;
                }
            }
            "sprop-pps" => {
                if let Some(pps) = decode_base64(val) {
                    media.sprop_pps = pps;
                }
            }
            "config" => {
                if let Some(config) = decode_hex(val.trim()) {
                    media.aac_config = config;
                }
            }
            _ => {}
        }
    }
}

fn decode_base64(value: &str) -> Option<Bytes> {
    BASE64_STANDARD
        .decode(value.trim())
        .ok()
        .map(Bytes::from)
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VideoCodec;

    const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 10.0.0.10\r\n\
s=Media Presentation\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:track1\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAHtoHgUZA,aM4xUg==\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=control:track2\r\n\
a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n\
a=fmtp:97 streamtype=5;mode=AAC-hbr;config=1210;sizelength=13;indexlength=3\r\n";

    #[test]
    fn parses_video_and_audio_sections() {
        let medias = parse_media_descriptions(SDP.as_bytes()).unwrap();
        assert_eq!(medias.len(), 2);

        let video = &medias[0];
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.codec, Some(CodecKind::Video(VideoCodec::H264)));
        assert_eq!(video.control, "track1");
        assert_eq!(video.clock_rate, 90000);
        assert_eq!(video.sprop_sps[0] & 0x1F, 7);
        assert_eq!(video.sprop_pps[0] & 0x1F, 8);

        let audio = &medias[1];
        assert_eq!(audio.kind, MediaKind::Audio);
        assert_eq!(audio.codec, Some(CodecKind::Audio(AudioCodec::Aac)));
        assert_eq!(audio.clock_rate, 44100);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.aac_config, vec![0x12, 0x10]);
    }

    #[test]
    fn static_payload_types_without_rtpmap() {
        let sdp = "v=0\r\n\
o=- 0 0 IN IP4 10.0.0.10\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 0 RTP/AVP 8\r\n\
a=control:track3\r\n";
        let medias = parse_media_descriptions(sdp.as_bytes()).unwrap();
        assert_eq!(medias[0].codec, Some(CodecKind::Audio(AudioCodec::PcmAlaw)));
        assert_eq!(medias[0].clock_rate, 8000);
    }

    #[test]
    fn unknown_encoding_leaves_codec_unset() {
        let sdp = "v=0\r\n\
o=- 0 0 IN IP4 10.0.0.10\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 VP9/90000\r\n";
        let medias = parse_media_descriptions(sdp.as_bytes()).unwrap();
        assert_eq!(medias[0].codec, None);
    }
}
