//! One transport instance per UA: UDP datagrams, or a TCP/TLS stream with
//! Content-Length framing. Whole messages are pushed upward through a
//! channel; the UA never reads sockets itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;

use crate::config::Transport;
use crate::error::{Error, Result};
use crate::message::find_crlf_crlf;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivered by the reader task. `Closed` is terminal: the stream died and
/// the caller must re-invoke `register()` to get a new transport.
#[derive(Debug)]
pub enum TransportEvent {
    Message { data: Vec<u8>, source: SocketAddr },
    Closed { reason: String },
}

/// Accumulates stream bytes and slices off whole SIP messages:
/// headers up to the blank line, then exactly Content-Length body bytes.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
}

impl StreamFramer {
    pub fn new() -> StreamFramer {
        StreamFramer::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            let Some(header_end) = find_crlf_crlf(&self.buf) else {
                break;
            };
            let content_length = content_length_of(&self.buf[..header_end]);
            let total = header_end + 4 + content_length;
            if self.buf.len() < total {
                break;
            }
            frames.push(self.buf.drain(..total).collect());
        }
        frames
    }

    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }
}

fn content_length_of(header_region: &[u8]) -> usize {
    let text = String::from_utf8_lossy(header_region);
    for line in text.split('\n') {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

enum TransportWriter {
    Udp(Arc<UdpSocket>),
    Tcp(Mutex<OwnedWriteHalf>),
    Tls(Mutex<tokio::io::WriteHalf<TlsStream<TcpStream>>>),
}

pub struct SipTransport {
    kind: Transport,
    peer: SocketAddr,
    local_addr: SocketAddr,
    writer: TransportWriter,
    reader_task: JoinHandle<()>,
}

impl SipTransport {
    /// Open the configured transport toward the server and start the reader
    /// task. TCP/TLS connects are bounded by a 10 s timeout; TLS accepts
    /// whatever certificate the server presents, with SNI set to the
    /// configured server name.
    pub async fn connect(
        kind: Transport,
        peer: SocketAddr,
        server_name: &str,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<SipTransport> {
        match kind {
            Transport::Udp => {
                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                let local_addr = socket.local_addr()?;
                let reader = socket.clone();
                let reader_task = tokio::spawn(async move {
                    let mut buf = vec![0u8; 65535];
                    loop {
                        match reader.recv_from(&mut buf).await {
                            Ok((size, source)) => {
                                let event = TransportEvent::Message {
                                    data: buf[..size].to_vec(),
                                    source,
                                };
                                if inbound.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                // Datagram errors (ICMP unreachable and the
                                // like) are transient; keep listening.
                                tracing::debug!("UDP recv error: {}", err);
                            }
                        }
                    }
                });
                Ok(SipTransport {
                    kind,
                    peer,
                    local_addr,
                    writer: TransportWriter::Udp(socket),
                    reader_task,
                })
            }
            Transport::Tcp => {
                let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
                    .await
                    .map_err(|_| Error::Timeout(format!("connect to {} timed out", peer)))??;
                let local_addr = stream.local_addr()?;
                let (read_half, write_half) = stream.into_split();
                let reader_task = tokio::spawn(run_stream_reader(read_half, peer, inbound));
                Ok(SipTransport {
                    kind,
                    peer,
                    local_addr,
                    writer: TransportWriter::Tcp(Mutex::new(write_half)),
                    reader_task,
                })
            }
            Transport::Tls => {
                let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
                    .await
                    .map_err(|_| Error::Timeout(format!("connect to {} timed out", peer)))??;
                let local_addr = stream.local_addr()?;
                let connector = tls_connector();
                let name = rustls::ServerName::try_from(server_name)
                    .map_err(|_| Error::Transport(format!("bad TLS server name '{}'", server_name)))?;
                let stream = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(name, stream))
                    .await
                    .map_err(|_| Error::Timeout(format!("TLS handshake with {} timed out", peer)))?
                    .map_err(|err| Error::Transport(format!("TLS handshake failed: {}", err)))?;
                let (read_half, write_half) = tokio::io::split(stream);
                let reader_task = tokio::spawn(run_stream_reader(read_half, peer, inbound));
                Ok(SipTransport {
                    kind,
                    peer,
                    local_addr,
                    writer: TransportWriter::Tls(Mutex::new(write_half)),
                    reader_task,
                })
            }
        }
    }

    pub fn kind(&self) -> Transport {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Address the socket is actually bound to; its port goes into Via and
    /// Contact.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        match &self.writer {
            TransportWriter::Udp(socket) => {
                socket.send_to(data, self.peer).await?;
            }
            TransportWriter::Tcp(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await?;
            }
            TransportWriter::Tls(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }

    /// Stop the reader and shut the stream down. Safe to call more than
    /// once.
    pub async fn close(&self) {
        self.reader_task.abort();
        match &self.writer {
            TransportWriter::Udp(_) => {}
            TransportWriter::Tcp(writer) => {
                let _ = writer.lock().await.shutdown().await;
            }
            TransportWriter::Tls(writer) => {
                let _ = writer.lock().await.shutdown().await;
            }
        }
    }
}

async fn run_stream_reader<R>(
    mut reader: R,
    peer: SocketAddr,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = inbound.send(TransportEvent::Closed {
                    reason: "connection closed by server".to_string(),
                });
                break;
            }
            Ok(size) => {
                for frame in framer.push(&buf[..size]) {
                    let event = TransportEvent::Message {
                        data: frame,
                        source: peer,
                    };
                    if inbound.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = inbound.send(TransportEvent::Closed {
                    reason: err.to_string(),
                });
                break;
            }
        }
    }
}

// Registrars in the field overwhelmingly run self-signed certificates, so
// the verifier accepts any chain (the `rejectUnauthorized: false` posture).
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn message_with_body(body_len: usize) -> Vec<u8> {
        let body = vec![b'x'; body_len];
        let mut msg = format!(
            "MESSAGE sip:a@b SIP/2.0\r\nCall-ID: frame-test\r\nContent-Length: {}\r\n\r\n",
            body_len
        )
        .into_bytes();
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn framer_splits_concatenated_messages() {
        let first = message_with_body(1665);
        let second = message_with_body(20);
        let mut wire = first.clone();
        wire.extend_from_slice(&second);
        assert_eq!(wire.len(), 1823);

        // Stress pattern: two tiny reads, one large, then the remainder.
        let mut framer = StreamFramer::new();
        let mut frames = Vec::new();
        let mut offset = 0;
        for chunk in [1usize, 1, 1700, 121] {
            frames.extend(framer.push(&wire[offset..offset + chunk]));
            offset += chunk;
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], first);
        assert_eq!(frames[1], second);
        assert_eq!(framer.residual_len(), 0);
    }

    #[test]
    fn framer_waits_for_full_body() {
        let msg = message_with_body(10);
        let mut framer = StreamFramer::new();
        // everything except the last body byte
        assert!(framer.push(&msg[..msg.len() - 1]).is_empty());
        let frames = framer.push(&msg[msg.len() - 1..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], msg);
        assert_eq!(framer.residual_len(), 0);
    }

    #[test]
    fn framer_defaults_missing_content_length_to_zero() {
        let wire = b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: z\r\n\r\n";
        let mut framer = StreamFramer::new();
        let frames = framer.push(wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(framer.residual_len(), 0);
    }

    #[tokio::test]
    async fn udp_transport_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = SipTransport::connect(Transport::Udp, server_addr, "test", tx)
            .await
            .unwrap();

        transport.send(b"OPTIONS sip:a@b SIP/2.0\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 1024];
        let (size, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(from.port(), transport.local_addr().port());
        assert!(buf[..size].starts_with(b"OPTIONS"));

        server.send_to(b"SIP/2.0 200 OK\r\n\r\n", from).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Message { data, source } => {
                assert!(data.starts_with(b"SIP/2.0 200"));
                assert_eq!(source, server_addr);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        transport.close().await;
    }

    #[tokio::test]
    async fn tcp_transport_frames_and_reports_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = SipTransport::connect(Transport::Tcp, server_addr, "test", tx)
            .await
            .unwrap();
        let (mut server_stream, _) = listener.accept().await.unwrap();

        let first = message_with_body(3);
        let second = message_with_body(0);
        let mut wire = first.clone();
        wire.extend_from_slice(&second);
        // split mid-header to exercise reassembly
        server_stream.write_all(&wire[..10]).await.unwrap();
        server_stream.write_all(&wire[10..]).await.unwrap();

        for expected in [first, second] {
            match rx.recv().await.unwrap() {
                TransportEvent::Message { data, .. } => assert_eq!(data, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        drop(server_stream);
        match rx.recv().await.unwrap() {
            TransportEvent::Closed { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        transport.close().await;
    }
}
