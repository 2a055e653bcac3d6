use anyhow::bail;
use bytes::Bytes;
use std::fmt;

pub mod nal;
pub mod packet;
pub mod rtp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::H265 => "video/H265",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Opus,
    PcmAlaw,
    PcmMulaw,
    Pcm,
}

impl AudioCodec {
    /// WebRTC-deliverable MIME type; None for codecs the browser side cannot
    /// take without transcoding.
    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            AudioCodec::Opus => Some("audio/opus"),
            AudioCodec::PcmAlaw => Some("audio/PCMA"),
            AudioCodec::PcmMulaw => Some("audio/PCMU"),
            AudioCodec::Aac | AudioCodec::Pcm => None,
        }
    }
}

/// Codec identity as declared by an SDP rtpmap encoding name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Video(VideoCodec),
    Audio(AudioCodec),
}

impl CodecKind {
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "h264" => Some(CodecKind::Video(VideoCodec::H264)),
            "h265" | "hevc" => Some(CodecKind::Video(VideoCodec::H265)),
            "mpeg4-generic" => Some(CodecKind::Audio(AudioCodec::Aac)),
            "opus" => Some(CodecKind::Audio(AudioCodec::Opus)),
            "pcma" => Some(CodecKind::Audio(AudioCodec::PcmAlaw)),
            "pcmu" => Some(CodecKind::Audio(AudioCodec::PcmMulaw)),
            "l16" => Some(CodecKind::Audio(AudioCodec::Pcm)),
            _ => None,
        }
    }
}

/// Everything a consumer needs to decode one track, cached per stream by the
/// hub. Parameter-set buffers may be empty until in-band updates arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecData {
    H264 { sps: Bytes, pps: Bytes },
    H265 { vps: Bytes, sps: Bytes, pps: Bytes },
    Aac { config: Bytes, sample_rate: u32, channels: u8 },
    Opus { sample_rate: u32, channels: u8 },
    PcmAlaw { sample_rate: u32 },
    PcmMulaw { sample_rate: u32 },
    Pcm { sample_rate: u32 },
}

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

impl CodecData {
    /// Builds H.264 codec data from in-band or sprop parameter sets,
    /// rejecting buffers that are not actually SPS/PPS units.
    pub fn h264(sps: Bytes, pps: Bytes) -> anyhow::Result<Self> {
        if sps.len() < 4 || sps[0] & 0x1F != 7 {
            bail!("not an H.264 SPS");
        }
        if pps.is_empty() || pps[0] & 0x1F != 8 {
            bail!("not an H.264 PPS");
        }
        Ok(CodecData::H264 { sps, pps })
    }

    pub fn h265(vps: Bytes, sps: Bytes, pps: Bytes) -> anyhow::Result<Self> {
        if vps.len() < 2 || (vps[0] >> 1) & 0x3F != 32 {
            bail!("not an H.265 VPS");
        }
        if sps.len() < 2 || (sps[0] >> 1) & 0x3F != 33 {
            bail!("not an H.265 SPS");
        }
        if pps.len() < 2 || (pps[0] >> 1) & 0x3F != 34 {
            bail!("not an H.265 PPS");
        }
        Ok(CodecData::H265 { vps, sps, pps })
    }

    /// Builds AAC codec data from an MPEG-4 AudioSpecificConfig.
    pub fn aac(config: &[u8]) -> anyhow::Result<Self> {
        if config.len() < 2 {
            bail!("AAC config too short");
        }
        let freq_index = (((config[0] & 0x07) << 1) | (config[1] >> 7)) as usize;
        let sample_rate = match AAC_SAMPLE_RATES.get(freq_index) {
            Some(&rate) => rate,
            None => bail!("AAC config uses unsupported frequency index {freq_index}"),
        };
        let channels = match (config[1] >> 3) & 0x0F {
            c @ 1..=6 => c,
            7 => 8,
            c => bail!("AAC config uses unsupported channel configuration {c}"),
        };
        Ok(CodecData::Aac {
            config: Bytes::copy_from_slice(config),
            sample_rate,
            channels,
        })
    }

    pub fn is_video(&self) -> bool {
        matches!(self, CodecData::H264 { .. } | CodecData::H265 { .. })
    }

    pub fn is_audio(&self) -> bool {
        !self.is_video()
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        match self {
            CodecData::H264 { .. } => Some(VideoCodec::H264),
            CodecData::H265 { .. } => Some(VideoCodec::H265),
            _ => None,
        }
    }

    pub fn audio_codec(&self) -> Option<AudioCodec> {
        match self {
            CodecData::Aac { .. } => Some(AudioCodec::Aac),
            CodecData::Opus { .. } => Some(AudioCodec::Opus),
            CodecData::PcmAlaw { .. } => Some(AudioCodec::PcmAlaw),
            CodecData::PcmMulaw { .. } => Some(AudioCodec::PcmMulaw),
            CodecData::Pcm { .. } => Some(AudioCodec::Pcm),
            _ => None,
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        match self {
            CodecData::Aac { sample_rate, .. }
            | CodecData::Opus { sample_rate, .. }
            | CodecData::PcmAlaw { sample_rate }
            | CodecData::PcmMulaw { sample_rate }
            | CodecData::Pcm { sample_rate } => Some(*sample_rate),
            _ => None,
        }
    }

    pub fn channels(&self) -> Option<u8> {
        match self {
            CodecData::Aac { channels, .. } | CodecData::Opus { channels, .. } => Some(*channels),
            CodecData::PcmAlaw { .. } | CodecData::PcmMulaw { .. } | CodecData::Pcm { .. } => {
                Some(1)
            }
            _ => None,
        }
    }
}

impl fmt::Display for CodecData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecData::H264 { .. } => write!(f, "H264"),
            CodecData::H265 { .. } => write!(f, "H265"),
            CodecData::Aac { .. } => write!(f, "AAC"),
            CodecData::Opus { .. } => write!(f, "Opus"),
            CodecData::PcmAlaw { .. } => write!(f, "PCMA"),
            CodecData::PcmMulaw { .. } => write!(f, "PCMU"),
            CodecData::Pcm { .. } => write!(f, "PCM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_codec_data_validates_parameter_sets() {
        let sps = Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]);
        let pps = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        assert!(CodecData::h264(sps.clone(), pps.clone()).is_ok());
        assert!(CodecData::h264(pps.clone(), sps.clone()).is_err());
        assert!(CodecData::h264(Bytes::new(), pps).is_err());
    }

    #[test]
    fn h265_codec_data_validates_parameter_sets() {
        let vps = Bytes::from_static(&[0x40, 0x01, 0x0C]);
        let sps = Bytes::from_static(&[0x42, 0x01, 0x01]);
        let pps = Bytes::from_static(&[0x44, 0x01, 0xC0]);
        assert!(CodecData::h265(vps.clone(), sps.clone(), pps.clone()).is_ok());
        assert!(CodecData::h265(sps, vps, pps).is_err());
    }

    #[test]
    fn aac_config_decodes_rate_and_channels() {
        // AAC-LC, 44100 Hz (index 4), 2 channels
        let data = CodecData::aac(&[0x12, 0x10]).unwrap();
        assert_eq!(data.sample_rate(), Some(44100));
        assert_eq!(data.channels(), Some(2));
    }

    #[test]
    fn aac_config_rejects_garbage() {
        assert!(CodecData::aac(&[0x12]).is_err());
        // frequency index 15 (explicit frequency) is not supported
        assert!(CodecData::aac(&[0x17, 0x80, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn encoding_names_map_to_codecs() {
        assert_eq!(
            CodecKind::from_encoding_name("H264"),
            Some(CodecKind::Video(VideoCodec::H264))
        );
        assert_eq!(
            CodecKind::from_encoding_name("hevc"),
            Some(CodecKind::Video(VideoCodec::H265))
        );
        assert_eq!(
            CodecKind::from_encoding_name("MPEG4-GENERIC"),
            Some(CodecKind::Audio(AudioCodec::Aac))
        );
        assert_eq!(CodecKind::from_encoding_name("speex"), None);
    }
}
