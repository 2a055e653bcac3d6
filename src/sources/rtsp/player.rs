//! RTSP playback state machine: OPTIONS → DESCRIBE → SETUP (per track) →
//! PLAY → read loop with keep-alive → TEARDOWN. Interleaved frames are
//! parsed as RTP and handed to the [`MediaSink`] inline, so access units
//! leave in arrival order and the hot path stays allocation free.

use super::media::{parse_media_descriptions, MediaInfo, MediaKind};
use super::message::{parse_interleaved, parse_rtp_info, parse_session_id, Response};
use super::transport::{Frame, Transport};
use crate::common::rtp::RtpPacket;
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Some cameras only answer clients they recognize.
pub const DEFAULT_USER_AGENT: &str = "Lavf58.76.100";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Receives the negotiated media set once, then every RTP packet in stream
/// order. Packets borrow the transport read buffer: implementations copy out
/// whatever outlives the call.
pub trait MediaSink {
    fn configure(&mut self, video: Option<&MediaInfo>, audio: Option<&MediaInfo>) -> Result<()>;
    fn on_video_packet(&mut self, pkt: &RtpPacket<'_>) -> Result<()>;
    fn on_audio_packet(&mut self, pkt: &RtpPacket<'_>) -> Result<()>;
}

pub struct Player {
    pub disable_audio: bool,
    pub video_media: Option<MediaInfo>,
    pub audio_media: Option<MediaInfo>,
    pub start_video_ts: i64,
    pub start_audio_ts: i64,
    base: String,
    session: String,
    video_channel: i32,
    audio_channel: i32,
}

impl Player {
    pub fn new(base: &str, disable_audio: bool) -> Self {
        Self {
            disable_audio,
            video_media: None,
            audio_media: None,
            start_video_ts: 0,
            start_audio_ts: 0,
            base: base.to_string(),
            session: String::new(),
            video_channel: -1,
            audio_channel: -2,
        }
    }

    /// Drives the full session. Returns Ok after a cancellation-initiated
    /// TEARDOWN; any protocol or transport failure surfaces as an error.
    pub async fn run<S>(
        &mut self,
        transport: &mut Transport<S>,
        sink: &mut impl MediaSink,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if transport.user_agent.is_empty() {
            transport.user_agent = DEFAULT_USER_AGENT.to_string();
        }

        self.options(transport).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        let medias = self.describe(transport).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut channel = 0u8;
        for media in medias {
            match media.kind {
                MediaKind::Video => {}
                MediaKind::Audio if !self.disable_audio => {}
                MediaKind::Audio => continue,
            }

            let assigned = self.setup(transport, &media, channel).await?;
            match media.kind {
                MediaKind::Video => {
                    self.video_channel = assigned as i32;
                    self.video_media = Some(media);
                }
                MediaKind::Audio => {
                    self.audio_channel = assigned as i32;
                    self.audio_media = Some(media);
                }
            }
            channel = assigned + 2;

            if cancel.is_cancelled() {
                return self.teardown(transport).await;
            }
        }

        if self.video_media.is_none() && self.audio_media.is_none() {
            bail!("no playable media in SDP");
        }
        sink.configure(self.video_media.as_ref(), self.audio_media.as_ref())?;

        // PLAY is not awaited: the server may start interleaving media
        // before its response arrives.
        let play_cseq = transport
            .request(&self.base, "PLAY", &[("Session", self.session.as_str())])
            .await?;
        if cancel.is_cancelled() {
            return self.teardown(transport).await;
        }

        self.run_loop(transport, sink, cancel, play_cseq).await
    }

    async fn run_loop<S>(
        &mut self,
        transport: &mut Transport<S>,
        sink: &mut impl MediaSink,
        cancel: &CancellationToken,
        play_cseq: u32,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut awaiting_play = Some(play_cseq);
        let mut keepalive = Instant::now();

        loop {
            if keepalive.elapsed() > KEEPALIVE_INTERVAL {
                transport
                    .request(&self.base, "OPTIONS", &[("Require", "implicit-play")])
                    .await
                    .context("RTSP keep-alive failed")?;
                keepalive = Instant::now();
            }

            match transport.receive().await.context("receive failed")? {
                Frame::Interleaved(frame) => {
                    if frame.channel as i32 == self.video_channel {
                        let pkt = RtpPacket::parse(frame.payload)
                            .context("malformed RTP packet on video channel")?;
                        sink.on_video_packet(&pkt)?;
                    } else if frame.channel as i32 == self.audio_channel {
                        let pkt = RtpPacket::parse(frame.payload)
                            .context("malformed RTP packet on audio channel")?;
                        sink.on_audio_packet(&pkt)?;
                    }
                    // Other channels are RTCP (RFC 2326 §10.12), not ours to
                    // interpret.
                }
                Frame::Response(resp) => {
                    if let Some(seq) = awaiting_play {
                        if resp.cseq() == Some(seq) {
                            self.record_rtp_info(&resp);
                            awaiting_play = None;
                        }
                    }
                    // Remaining responses are keep-alive acks.
                }
                Frame::Request(req) => {
                    bail!("unexpected server request {} during playback", req.method);
                }
            }

            if cancel.is_cancelled() {
                return self.teardown(transport).await;
            }
        }
    }

    async fn options<S>(&mut self, transport: &mut Transport<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let resp = transport.round_trip(&self.base, "OPTIONS", &[]).await?;
        if resp.status != 200 {
            bail!("unexpected response code {} to OPTIONS", resp.status);
        }
        Ok(())
    }

    async fn describe<S>(&mut self, transport: &mut Transport<S>) -> Result<Vec<MediaInfo>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let resp = transport
            .round_trip(&self.base, "DESCRIBE", &[("Accept", "application/sdp")])
            .await?;
        if resp.status != 200 {
            bail!("unexpected response code {} to DESCRIBE", resp.status);
        }
        if let Some(base) = resp.header("Content-Base") {
            if !base.is_empty() {
                self.base = base.to_string();
            }
        }
        if let Some(ct) = resp.header("Content-Type") {
            if !ct.is_empty() && ct != "application/sdp" {
                bail!("unexpected DESCRIBE Content-Type {ct}");
            }
        }
        parse_media_descriptions(&resp.body)
    }

    async fn setup<S>(
        &mut self,
        transport: &mut Transport<S>,
        media: &MediaInfo,
        channel: u8,
    ) -> Result<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let uri = track_uri(&self.base, &media.control);
        let transport_header = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            channel,
            channel + 1
        );

        let mut headers: Vec<(&str, &str)> = Vec::with_capacity(2);
        if !self.session.is_empty() {
            headers.push(("Session", self.session.as_str()));
        }
        headers.push(("Transport", transport_header.as_str()));

        let resp = transport.round_trip(&uri, "SETUP", &headers).await?;
        if resp.status != 200 {
            bail!("unexpected response code {} to SETUP", resp.status);
        }

        if let Some(session) = resp.header("Session") {
            let id = parse_session_id(session);
            if !id.is_empty() {
                self.session = id.to_string();
            }
        }

        // The server may assign a different channel pair than requested.
        let assigned = resp
            .header("Transport")
            .and_then(parse_interleaved)
            .map(|(lo, _)| lo)
            .unwrap_or(channel);
        Ok(assigned)
    }

    async fn teardown<S>(&mut self, transport: &mut Transport<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let seq = transport
            .request(&self.base, "TEARDOWN", &[("Session", self.session.as_str())])
            .await?;

        loop {
            let resp = match transport.receive().await {
                // Server behavior after TEARDOWN is erratic; missing or
                // broken responses are not an error.
                Err(e) => {
                    log::debug!("ignoring receive error after TEARDOWN: {e}");
                    return Ok(());
                }
                Ok(Frame::Response(resp)) => resp,
                // Drain media frames still in flight.
                Ok(_) => continue,
            };

            match resp.cseq() {
                Some(v) if v == seq => {}
                _ => bail!("mismatch response CSeq to TEARDOWN"),
            }
            if resp.status != 200 {
                bail!("unexpected response code {} to TEARDOWN", resp.status);
            }
            self.session.clear();
            return Ok(());
        }
    }

    /// Records the per-track starting RTP timestamps from `RTP-Info`,
    /// correlating entries by `url=` where the server provides one and
    /// falling back to positional order (video first, then audio).
    fn record_rtp_info(&mut self, resp: &Response) {
        let value = match resp.header("RTP-Info") {
            Some(v) => v,
            None => return,
        };

        let video_uri = self
            .video_media
            .as_ref()
            .map(|m| track_uri(&self.base, &m.control));
        let audio_uri = self
            .audio_media
            .as_ref()
            .map(|m| track_uri(&self.base, &m.control));

        let mut positional = Vec::new();
        for entry in parse_rtp_info(value) {
            let ts = match entry.rtptime {
                Some(ts) => ts,
                None => continue,
            };
            match entry.url.as_deref() {
                Some(url) if matches_track(url, video_uri.as_deref()) => {
                    self.start_video_ts = ts;
                }
                Some(url) if matches_track(url, audio_uri.as_deref()) => {
                    self.start_audio_ts = ts;
                }
                _ => positional.push(ts),
            }
        }

        for ts in positional {
            if self.start_video_ts == 0 {
                self.start_video_ts = ts;
            } else if self.start_audio_ts == 0 {
                self.start_audio_ts = ts;
            }
        }
    }
}

/// Composes a track URI from the session base and a media control attribute.
fn track_uri(base: &str, control: &str) -> String {
    if control.is_empty() || control == "*" {
        return base.to_string();
    }
    if control.contains("rtsp://") || control.contains("rtsps://") {
        return control.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{control}")
    } else {
        format!("{base}/{control}")
    }
}

/// Servers report track URLs with varying hosts and schemes, so compare by
/// suffix of the path rather than full equality.
fn matches_track(reported: &str, expected: Option<&str>) -> bool {
    let expected = match expected {
        Some(e) => e,
        None => return false,
    };
    if reported == expected {
        return true;
    }
    match expected.rsplit_once('/') {
        Some((_, tail)) if !tail.is_empty() => reported.ends_with(tail),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::rtsp::transport::Transport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct RecordingSink {
        configured: bool,
        video_packets: Vec<(u16, Vec<u8>)>,
        audio_packets: usize,
    }

    impl MediaSink for RecordingSink {
        fn configure(
            &mut self,
            video: Option<&MediaInfo>,
            _audio: Option<&MediaInfo>,
        ) -> Result<()> {
            assert!(video.is_some());
            self.configured = true;
            Ok(())
        }

        fn on_video_packet(&mut self, pkt: &RtpPacket<'_>) -> Result<()> {
            self.video_packets.push((pkt.sequence, pkt.payload.to_vec()));
            Ok(())
        }

        fn on_audio_packet(&mut self, _pkt: &RtpPacket<'_>) -> Result<()> {
            self.audio_packets += 1;
            Ok(())
        }
    }

    async fn read_request(server: &mut DuplexStream) -> String {
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            raw.push(byte[0]);
        }
        String::from_utf8(raw).unwrap()
    }

    fn cseq_of(request: &str) -> u32 {
        request
            .lines()
            .find_map(|l| l.strip_prefix("CSeq: "))
            .unwrap()
            .parse()
            .unwrap()
    }

    fn rtp_frame(channel: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut rtp = vec![0x80, 96];
        rtp.extend_from_slice(&seq.to_be_bytes());
        rtp.extend_from_slice(&9000u32.to_be_bytes());
        rtp.extend_from_slice(&7u32.to_be_bytes());
        rtp.extend_from_slice(payload);

        let mut frame = vec![b'$', channel];
        frame.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
        frame.extend_from_slice(&rtp);
        frame
    }

    const TEST_SDP: &str = "v=0\r\no=- 0 0 IN IP4 10.0.0.9\r\ns=-\r\nt=0 0\r\n\
m=video 0 RTP/AVP 96\r\na=control:track1\r\na=rtpmap:96 H264/90000\r\n";

    async fn respond(server: &mut DuplexStream, cseq: u32, extra: &str, body: &str) {
        let resp = format!(
            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra}Content-Length: {}\r\n\r\n{body}",
            body.len()
        );
        server.write_all(resp.as_bytes()).await.unwrap();
    }

    /// Fake camera: full handshake, a PLAY response arriving between media
    /// frames, ten video frames, then a dropped connection.
    async fn run_fake_camera(mut server: DuplexStream) {
        let req = read_request(&mut server).await;
        assert!(req.starts_with("OPTIONS "));
        assert!(req.contains("User-Agent: Lavf58.76.100\r\n"));
        respond(&mut server, cseq_of(&req), "Public: DESCRIBE, SETUP, PLAY\r\n", "").await;

        let req = read_request(&mut server).await;
        assert!(req.starts_with("DESCRIBE "));
        respond(
            &mut server,
            cseq_of(&req),
            "Content-Base: rtsp://cam:554/live/\r\nContent-Type: application/sdp\r\n",
            TEST_SDP,
        )
        .await;

        let req = read_request(&mut server).await;
        assert!(req.starts_with("SETUP rtsp://cam:554/live/track1 "));
        assert!(req.contains("Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n"));
        respond(
            &mut server,
            cseq_of(&req),
            "Session: abc123;timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n",
            "",
        )
        .await;

        let req = read_request(&mut server).await;
        assert!(req.starts_with("PLAY "));
        assert!(req.contains("Session: abc123\r\n"));
        let play_cseq = cseq_of(&req);

        for seq in 0..3u16 {
            let frame = rtp_frame(2, seq, &[0x41, 0x9A]);
            server.write_all(&frame).await.unwrap();
        }
        let resp = format!(
            "RTSP/1.0 200 OK\r\nCSeq: {play_cseq}\r\nRTP-Info: url=rtsp://cam:554/live/track1;seq=0;rtptime=11262089\r\n\r\n"
        );
        server.write_all(resp.as_bytes()).await.unwrap();
        for seq in 3..10u16 {
            let frame = rtp_frame(2, seq, &[0x41, 0x9A]);
            server.write_all(&frame).await.unwrap();
        }
        // Dropping the stream ends the session.
    }

    #[tokio::test]
    async fn plays_interleaved_stream_and_records_rtp_info() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let camera = tokio::spawn(run_fake_camera(server));

        let mut transport = Transport::new(client, "", "");
        let mut player = Player::new("rtsp://cam:554/live", true);
        let mut sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        let result = player.run(&mut transport, &mut sink, &cancel).await;
        assert!(result.is_err(), "connection drop should surface as error");

        assert!(sink.configured);
        assert_eq!(sink.video_packets.len(), 10);
        let sequences: Vec<u16> = sink.video_packets.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
        assert_eq!(player.start_video_ts, 11262089);
        assert_eq!(player.video_channel, 2, "server-assigned pair adopted");

        camera.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_before_setup_skips_teardown() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let camera = tokio::spawn(async move {
            let mut server = server;
            let req = read_request(&mut server).await;
            respond(&mut server, cseq_of(&req), "", "").await;
        });

        let mut transport = Transport::new(client, "", "");
        let mut player = Player::new("rtsp://cam:554/live", false);
        let mut sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        player.run(&mut transport, &mut sink, &cancel).await.unwrap();
        assert!(!sink.configured);
        camera.await.unwrap();
    }

    #[test]
    fn track_uri_composition() {
        assert_eq!(track_uri("rtsp://cam/live", "track1"), "rtsp://cam/live/track1");
        assert_eq!(track_uri("rtsp://cam/live/", "track1"), "rtsp://cam/live/track1");
        assert_eq!(
            track_uri("rtsp://cam/live", "rtsp://cam/live/track9"),
            "rtsp://cam/live/track9"
        );
        assert_eq!(track_uri("rtsp://cam/live", ""), "rtsp://cam/live");
        assert_eq!(track_uri("rtsp://cam/live", "*"), "rtsp://cam/live");
    }
}
