/// RTP packet fields per the RFC 3550 fixed header, with the payload
/// borrowed from the buffer the packet was parsed out of.
///
/// The borrow keeps the hot receive path allocation free: a packet is only
/// valid until the transport reads again, so consumers copy out whatever
/// they keep.
#[derive(Debug, Clone)]
pub struct RtpPacket<'a> {
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Marker bit - typically indicates end of frame
    pub marker: bool,
    /// Sequence number (16 bits)
    pub sequence: u16,
    /// Timestamp (32 bits) - media clock, wraps modulo 2^32
    pub timestamp: u32,
    /// Synchronization source identifier (32 bits)
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parses a raw RTP packet. Returns None when the packet is too short,
    /// carries an unexpected version, or its CSRC/extension/padding fields
    /// overrun the data.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        if data[0] >> 6 != 2 {
            return None;
        }

        let csrc_count = (data[0] & 0x0F) as usize;
        let has_extension = data[0] & 0x10 != 0;
        let has_padding = data[0] & 0x20 != 0;

        let mut offset = 12 + 4 * csrc_count;
        if has_extension {
            if data.len() < offset + 4 {
                return None;
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + 4 * words;
        }
        if data.len() < offset {
            return None;
        }

        let mut end = data.len();
        if has_padding {
            let pad = *data.last()? as usize;
            if pad == 0 || end - offset < pad {
                return None;
            }
            end -= pad;
        }

        Some(Self {
            payload_type: data[1] & 0x7F,
            marker: data[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: &data[offset..end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_header(marker: bool, seq: u16, ts: u32, ssrc: u32) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = 0x80;
        buf[1] = (if marker { 0x80 } else { 0 }) | 96;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn parses_fixed_header() {
        let mut data = fixed_header(true, 1234, 90000, 0xDEADBEEF).to_vec();
        data.extend_from_slice(&[1, 2, 3, 4]);

        let p = RtpPacket::parse(&data).unwrap();
        assert_eq!(p.payload_type, 96);
        assert!(p.marker);
        assert_eq!(p.sequence, 1234);
        assert_eq!(p.timestamp, 90000);
        assert_eq!(p.ssrc, 0xDEADBEEF);
        assert_eq!(p.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn skips_csrc_and_extension() {
        let mut data = fixed_header(false, 1, 2, 3).to_vec();
        data[0] = 0x80 | 0x10 | 0x01; // one CSRC, one extension
        data.extend_from_slice(&[0, 0, 0, 9]); // CSRC
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]); // extension header, 1 word
        data.extend_from_slice(&[0, 0, 0, 0]); // extension body
        data.extend_from_slice(&[0xAA, 0xBB]);

        let p = RtpPacket::parse(&data).unwrap();
        assert_eq!(p.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn strips_padding() {
        let mut data = fixed_header(false, 1, 2, 3).to_vec();
        data[0] |= 0x20;
        data.extend_from_slice(&[0xAA, 0xBB, 0x00, 0x00, 0x03]);

        let p = RtpPacket::parse(&data).unwrap();
        assert_eq!(p.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn rejects_short_or_wrong_version() {
        assert!(RtpPacket::parse(&[0x80, 0, 0]).is_none());
        let data = fixed_header(false, 1, 2, 3);
        let mut bad = data.to_vec();
        bad[0] = 0x40;
        assert!(RtpPacket::parse(&bad).is_none());
    }
}
