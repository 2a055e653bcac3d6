use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// One decoded access unit: the coded data of a single picture or audio
/// frame, as fanned out by the hub to every viewer of a stream.
///
/// Video payloads are AVCC framed (4-byte big-endian length before each NAL
/// unit); audio payloads are the raw frame bytes. `data` is reference
/// counted, so hub fan-out clones are cheap.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub time: Duration,
    pub duration: Duration,
    pub composition_time: Duration,
    /// Track index into the stream's codec list.
    pub idx: i8,
    pub is_keyframe: bool,
}

/// Frames a NAL unit as AVCC: 4-byte big-endian length followed by the body.
pub fn length_prefixed(nalu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + nalu.len());
    buf.put_u32(nalu.len() as u32);
    buf.put_slice(nalu);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_framing() {
        let framed = length_prefixed(&[0x65, 0xAA, 0xBB]);
        assert_eq!(&framed[..], &[0x00, 0x00, 0x00, 0x03, 0x65, 0xAA, 0xBB]);
    }
}
