//! RTP media engine (RFC 3550): a UDP socket, a 20 ms send pacer, and
//! symmetric-RTP source learning. One session per call.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::{EventSink, LogLevel};
use crate::g711;

pub const SAMPLE_RATE: u32 = 8000;
pub const PACKET_TIME_MS: u64 = 20;
pub const SAMPLES_PER_PACKET: usize = 160;
pub const RTP_HEADER_LEN: usize = 12;

pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;
pub const PT_TELEPHONE_EVENT: u8 = 101;

/// Outbound blocks queued beyond this are dropped oldest-first (about one
/// second of audio).
const MAX_QUEUED_BLOCKS: usize = 50;

/// RTP packet (RFC 3550). The fixed header is 12 bytes; we never set the
/// marker bit or carry CSRC entries on outbound packets.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        Self {
            payload_type,
            marker: false,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        // V=2, P=0, X=0, CC=0
        bytes.push(0x80);
        bytes.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&self.ssrc.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse an inbound packet. Anything shorter than the fixed header or
    /// not version 2 is invalid; CSRC entries are skipped.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RTP_HEADER_LEN {
            return Err(Error::Media("RTP packet too short".to_string()));
        }
        let version = bytes[0] >> 6;
        if version != 2 {
            return Err(Error::Media(format!("unsupported RTP version {}", version)));
        }
        let csrc_count = (bytes[0] & 0x0F) as usize;
        let header_len = RTP_HEADER_LEN + csrc_count * 4;
        if bytes.len() < header_len {
            return Err(Error::Media("RTP header incomplete".to_string()));
        }
        Ok(Self {
            payload_type: bytes[1] & 0x7F,
            marker: bytes[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            payload: bytes[header_len..].to_vec(),
        })
    }
}

#[derive(Debug)]
struct RtpShared {
    remote: Option<SocketAddr>,
    /// First valid inbound packet pins the true remote endpoint, which may
    /// differ from what the peer's SDP advertised (symmetric RTP).
    learned: bool,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    active: bool,
    muted: bool,
    queue: VecDeque<Vec<u8>>,
}

/// RTP session for one call. Sends exactly one packet every 20 ms while
/// active: a queued microphone block when there is one and we are not
/// muted, the codec's silence byte otherwise.
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    local_port: u16,
    ssrc: u32,
    shared: Arc<Mutex<RtpShared>>,
    events: EventSink,
    closed: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RtpSession {
    /// Bind the media socket on an ephemeral port.
    pub async fn bind(events: EventSink) -> Result<RtpSession> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|err| Error::Media(format!("failed to bind RTP socket: {}", err)))?;
        let local_port = socket
            .local_addr()
            .map_err(|err| Error::Media(format!("failed to read RTP socket address: {}", err)))?
            .port();
        tracing::info!("[RTP] socket bound to 0.0.0.0:{}", local_port);
        Ok(RtpSession {
            socket: Arc::new(socket),
            local_port,
            ssrc: rand::random::<u32>(),
            shared: Arc::new(Mutex::new(RtpShared {
                remote: None,
                learned: false,
                payload_type: PT_PCMU,
                sequence: rand::random::<u16>(),
                timestamp: 0,
                active: false,
                muted: false,
                queue: VecDeque::new(),
            })),
            events,
            closed: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Start streaming toward the negotiated endpoint. Payload types other
    /// than PCMA are sent as PCMU.
    pub async fn start(&self, remote: SocketAddr, payload_type: u8) {
        {
            let mut shared = self.shared.lock().await;
            shared.remote = Some(remote);
            shared.payload_type = payload_type;
            shared.active = true;
        }
        self.events.log(
            LogLevel::Info,
            format!(
                "[RTP] streaming to {} ({})",
                remote,
                codec_label(payload_type)
            ),
        );
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(send_loop(
            self.socket.clone(),
            self.shared.clone(),
            self.events.clone(),
            self.closed.clone(),
            self.ssrc,
        )));
        tasks.push(tokio::spawn(recv_loop(
            self.socket.clone(),
            self.shared.clone(),
            self.events.clone(),
            self.closed.clone(),
        )));
    }

    /// Queue one 16-bit LE PCM block for the next ticks. Blocks should be
    /// 160 samples but any size is accepted; each tick encodes one whole
    /// block.
    pub async fn feed_mic(&self, pcm: &[u8]) {
        let mut shared = self.shared.lock().await;
        if shared.queue.len() >= MAX_QUEUED_BLOCKS {
            shared.queue.pop_front();
            tracing::debug!("[RTP] outbound queue full, dropping oldest block");
        }
        shared.queue.push_back(pcm.to_vec());
    }

    pub async fn set_muted(&self, muted: bool) {
        self.shared.lock().await.muted = muted;
    }

    pub async fn toggle_mute(&self) -> bool {
        let mut shared = self.shared.lock().await;
        shared.muted = !shared.muted;
        shared.muted
    }

    /// Re-point the outbound stream without disturbing seq/ts/SSRC.
    pub async fn update_remote(&self, remote: SocketAddr) {
        let mut shared = self.shared.lock().await;
        shared.remote = Some(remote);
        shared.learned = false;
    }

    /// Stop the pacer and the receiver. Idempotent; no audio or log event
    /// is delivered after this returns.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.lock().await.active = false;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("[RTP] session on port {} closed", self.local_port);
    }
}

fn codec_label(payload_type: u8) -> &'static str {
    match payload_type {
        PT_PCMA => "PCMA",
        PT_PCMU => "PCMU",
        _ => "unknown",
    }
}

fn encode_block(payload_type: u8, pcm: &[u8]) -> Vec<u8> {
    let samples = g711::pcm_from_le_bytes(pcm);
    if payload_type == PT_PCMA {
        g711::encode_alaw(&samples)
    } else {
        g711::encode_mulaw(&samples)
    }
}

fn silence_payload(payload_type: u8) -> Vec<u8> {
    let byte = if payload_type == PT_PCMA {
        g711::ALAW_SILENCE
    } else {
        g711::MULAW_SILENCE
    };
    vec![byte; SAMPLES_PER_PACKET]
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Mutex<RtpShared>>,
    events: EventSink,
    closed: Arc<AtomicBool>,
    ssrc: u32,
) {
    // Tick deadlines are scheduled from the start instant, so a slow tick
    // does not shift the cadence of the ones after it.
    let mut ticker = tokio::time::interval(Duration::from_millis(PACKET_TIME_MS));
    loop {
        ticker.tick().await;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let sendable = {
            let mut shared = shared.lock().await;
            if !shared.active {
                break;
            }
            match shared.remote {
                Some(addr) if !addr.ip().is_unspecified() && addr.port() != 0 => {
                    let block = if shared.muted {
                        None
                    } else {
                        shared.queue.pop_front()
                    };
                    let payload = match block {
                        Some(pcm) => encode_block(shared.payload_type, &pcm),
                        None => silence_payload(shared.payload_type),
                    };
                    let packet = RtpPacket::new(
                        shared.payload_type,
                        shared.sequence,
                        shared.timestamp,
                        ssrc,
                        payload,
                    );
                    shared.sequence = shared.sequence.wrapping_add(1);
                    shared.timestamp = shared.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
                    Some((packet.to_bytes(), addr))
                }
                // Destination not known yet (0.0.0.0 offer waiting on
                // symmetric learning): skip this tick entirely.
                _ => None,
            }
        };
        if let Some((bytes, dest)) = sendable {
            if let Err(err) = socket.send_to(&bytes, dest).await {
                if !closed.load(Ordering::SeqCst) {
                    events.log(LogLevel::Warn, format!("[RTP] send failed: {}", err));
                }
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Mutex<RtpShared>>,
    events: EventSink,
    closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (size, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                tracing::debug!("[RTP] recv error: {}", err);
                continue;
            }
        };
        let packet = match RtpPacket::parse(&buf[..size]) {
            Ok(packet) => packet,
            Err(_) => continue,
        };
        {
            let mut shared = shared.lock().await;
            if !shared.active {
                break;
            }
            if !shared.learned {
                shared.learned = true;
                if shared.remote != Some(source) {
                    shared.remote = Some(source);
                    events.log(
                        LogLevel::Info,
                        format!("[RTP] learned remote endpoint {} (symmetric RTP)", source),
                    );
                }
            }
        }
        let pcm = match packet.payload_type {
            PT_PCMU => g711::decode_mulaw(&packet.payload),
            PT_PCMA => g711::decode_alaw(&packet.payload),
            _ => continue,
        };
        if closed.load(Ordering::SeqCst) {
            break;
        }
        events.remote_audio(g711::pcm_to_le_bytes(&pcm));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const RECV_WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn packet_round_trip() {
        let packet = RtpPacket::new(0, 1234, 5678, 9012, vec![1, 2, 3, 4]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0);
        let parsed = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn parse_rejects_short_and_wrong_version() {
        assert!(RtpPacket::parse(&[0x80; 11]).is_err());
        let mut bytes = RtpPacket::new(0, 1, 2, 3, vec![0xFF]).to_bytes();
        bytes[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&bytes).is_err());
    }

    async fn recv_packet(socket: &UdpSocket) -> RtpPacket {
        let mut buf = [0u8; 2048];
        let (size, _) = timeout(RECV_WAIT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for RTP")
            .unwrap();
        RtpPacket::parse(&buf[..size]).unwrap()
    }

    #[tokio::test]
    async fn paces_mic_blocks_then_silence() {
        let (sink, _events) = EventSink::channel();
        let session = RtpSession::bind(sink).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        session.start(peer.local_addr().unwrap(), PT_PCMU).await;

        let block: Vec<i16> = vec![1000; SAMPLES_PER_PACKET];
        session.feed_mic(&g711::pcm_to_le_bytes(&block)).await;

        let mut packets = Vec::new();
        for _ in 0..4 {
            packets.push(recv_packet(&peer).await);
        }
        session.close().await;

        for pair in packets.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
            assert_eq!(pair[1].timestamp, pair[0].timestamp.wrapping_add(160));
            assert_eq!(pair[1].ssrc, pair[0].ssrc);
            assert_eq!(pair[1].payload_type, PT_PCMU);
        }
        assert_eq!(packets[0].payload, g711::encode_mulaw(&block));
        for packet in &packets[1..] {
            assert_eq!(packet.payload.len(), SAMPLES_PER_PACKET);
            assert!(packet.payload.iter().all(|&b| b == g711::MULAW_SILENCE));
        }
    }

    #[tokio::test]
    async fn muted_session_sends_alaw_silence() {
        let (sink, _events) = EventSink::channel();
        let session = RtpSession::bind(sink).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        session.start(peer.local_addr().unwrap(), PT_PCMA).await;
        assert!(session.toggle_mute().await);

        let block: Vec<i16> = vec![1000; SAMPLES_PER_PACKET];
        session.feed_mic(&g711::pcm_to_le_bytes(&block)).await;

        for _ in 0..3 {
            let packet = recv_packet(&peer).await;
            assert_eq!(packet.payload_type, PT_PCMA);
            assert!(packet.payload.iter().all(|&b| b == g711::ALAW_SILENCE));
        }
        session.close().await;
    }

    #[tokio::test]
    async fn adopts_source_of_first_inbound_packet() {
        let (sink, mut events) = EventSink::channel();
        let session = RtpSession::bind(sink).await.unwrap();
        let session_port = session.local_port();

        // SDP advertised the decoy, but media actually arrives from `peer`.
        let decoy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        session.start(decoy.local_addr().unwrap(), PT_PCMU).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let inbound = RtpPacket::new(PT_PCMU, 7, 160, 42, vec![g711::MULAW_SILENCE; 160]);
        peer.send_to(&inbound.to_bytes(), ("127.0.0.1", session_port))
            .await
            .unwrap();

        // Decoded audio surfaces as an event...
        let audio = timeout(RECV_WAIT, async {
            loop {
                match events.recv().await.unwrap() {
                    crate::events::Event::RemoteAudio { pcm } => break pcm,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(audio.len(), 320);

        // ...and the pacer re-targets the true source.
        let retargeted = recv_packet(&peer).await;
        assert_eq!(retargeted.payload_type, PT_PCMU);
        session.close().await;
    }
}
