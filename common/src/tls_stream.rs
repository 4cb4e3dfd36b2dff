use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

use rustls::{pki_types::CertificateDer, ClientConnection, Connection, ServerConnection};

use crate::{
    error::RpcError,
    wire::{encode_frame, WireMessage},
};

const LEN_PREFIX: usize = 4;
const PLAINTEXT_CHUNK: usize = 16 * 1024;

fn handshake_io(err: io::Error) -> RpcError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            RpcError::Timeout("TLS handshake did not complete in time".into())
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => RpcError::ConnectionLost(format!("during TLS handshake: {err}")),
        _ => RpcError::Io(err),
    }
}

/// Maps a read/write failure on an established stream into an [`RpcError`].
fn stream_io(err: io::Error) -> RpcError {
    if let Some(tls) = err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return RpcError::Tls(tls.clone());
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            RpcError::Timeout("peer did not answer in time".into())
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => RpcError::ConnectionLost(err.to_string()),
        _ => RpcError::Io(err),
    }
}

/// Synchronous TLS wrapper around a TCP socket, used while negotiating
pub struct TlsStream {
    socket: TcpStream,
    tls:    Connection,
}

impl TlsStream {
    /// Create a new TLS stream from a server connection and complete the
    /// handshake
    pub fn from_server(socket: TcpStream, tls: ServerConnection) -> Result<Self, RpcError> {
        let mut stream = Self {
            socket,
            tls: Connection::Server(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Create a new TLS stream from a client connection and complete the
    /// handshake
    pub fn from_client(socket: TcpStream, tls: ClientConnection) -> Result<Self, RpcError> {
        let mut stream = Self {
            socket,
            tls: Connection::Client(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Complete the TLS handshake
    ///
    /// A certificate rejected by one of our verifiers surfaces as
    /// [`RpcError::Tls`] carrying the verifier's error.
    fn complete_handshake(&mut self) -> Result<(), RpcError> {
        while self.tls.is_handshaking() {
            while self.tls.wants_write() {
                self.tls.write_tls(&mut self.socket).map_err(handshake_io)?;
            }
            if self.tls.wants_read() {
                let n = self.tls.read_tls(&mut self.socket).map_err(handshake_io)?;
                if n == 0 {
                    return Err(RpcError::ConnectionLost(
                        "peer closed the connection during the TLS handshake".into(),
                    ));
                }
                if let Err(e) = self.tls.process_new_packets() {
                    // best effort: let the peer see our alert
                    let _ = self.tls.write_tls(&mut self.socket);
                    return Err(RpcError::Tls(e));
                }
            }
        }
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket).map_err(handshake_io)?;
        }
        Ok(())
    }

    /// End-entity certificate presented by the peer.
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.tls.peer_certificates().and_then(|chain| chain.first())
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.peer_addr().ok()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send a protocol message over the secure connection
    pub fn send_message(&mut self, msg: &WireMessage, max_len: usize) -> Result<(), RpcError> {
        let frame = encode_frame(msg, max_len)?;
        self.write_all(&frame).map_err(stream_io)?;
        self.flush().map_err(stream_io)?;
        Ok(())
    }

    /// Receive one protocol message from the secure connection
    pub fn recv_message(&mut self, max_len: usize) -> Result<WireMessage, RpcError> {
        let mut len_buf = [0u8; LEN_PREFIX];
        self.read_exact(&mut len_buf).map_err(stream_io)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > max_len {
            return Err(RpcError::Protocol(format!(
                "message too large: {len} bytes (max {max_len})"
            )));
        }

        let mut msg_buf = vec![0u8; len];
        self.read_exact(&mut msg_buf).map_err(stream_io)?;

        bincode::deserialize(&msg_buf)
            .map_err(|e| RpcError::Protocol(format!("failed to deserialize message: {e}")))
    }

    /// Splits the negotiated stream into a lockable session used for writing
    /// and a socket handle the reader thread pulls ciphertext from.
    pub fn into_session(self) -> Result<(TlsSession, TcpStream), RpcError> {
        let reader = self.socket.try_clone()?;
        Ok((
            TlsSession {
                socket: self.socket,
                tls:    self.tls,
            },
            reader,
        ))
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Ok(0) here means the peer sent close_notify
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.tls.read_tls(&mut self.socket)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ));
            }
            self.tls
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        self.socket.flush()
    }
}

/// Decrypted output of [`TlsSession::absorb`].
#[derive(Debug, Default)]
pub struct Absorbed {
    pub plaintext:   Vec<u8>,
    /// The peer sent close_notify.
    pub peer_closed: bool,
}

/// An established TLS session shared between a connection's writers and its
/// reader thread.
///
/// The reader thread owns a clone of the socket and feeds raw ciphertext in
/// through [`absorb`](Self::absorb); writers encrypt and flush directly.
pub struct TlsSession {
    socket: TcpStream,
    tls:    Connection,
}

impl TlsSession {
    /// Encrypts and sends an already encoded frame.
    ///
    /// rustls buffers a bounded amount of outgoing data, so large frames go
    /// out piecewise with the buffer flushed to the socket in between.
    pub fn send_frame(&mut self, mut frame: &[u8]) -> Result<(), RpcError> {
        while !frame.is_empty() {
            let written = self.tls.writer().write(frame).map_err(stream_io)?;
            if written == 0 && !self.tls.wants_write() {
                return Err(stream_io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "session accepted no more plaintext",
                )));
            }
            frame = &frame[written..];
            self.flush_tls()?;
        }
        Ok(())
    }

    /// Feeds ciphertext read off the socket into the session and returns
    /// whatever plaintext it yielded.
    pub fn absorb(&mut self, mut ciphertext: &[u8]) -> Result<Absorbed, RpcError> {
        let mut absorbed = Absorbed::default();
        while !ciphertext.is_empty() {
            if self.tls.read_tls(&mut ciphertext).map_err(stream_io)? == 0 {
                break;
            }
            self.tls.process_new_packets()?;
            absorbed.peer_closed |= self.drain_plaintext(&mut absorbed.plaintext)?;
        }
        // post-handshake messages (tickets, key updates) may want a reply
        self.flush_tls()?;
        Ok(absorbed)
    }

    /// Plaintext decrypted during negotiation but not yet consumed.
    pub fn take_buffered_plaintext(&mut self) -> Result<Absorbed, RpcError> {
        let mut plaintext = Vec::new();
        let peer_closed = self.drain_plaintext(&mut plaintext)?;
        Ok(Absorbed {
            plaintext,
            peer_closed,
        })
    }

    /// Sends close_notify and shuts the socket down in both directions,
    /// which also wakes the reader thread.
    pub fn close(&mut self) {
        self.tls.send_close_notify();
        if let Err(e) = self.flush_tls() {
            tracing::debug!("close_notify not delivered: {}", e);
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    fn drain_plaintext(&mut self, out: &mut Vec<u8>) -> Result<bool, RpcError> {
        let mut buf = [0u8; PLAINTEXT_CHUNK];
        loop {
            match self.tls.reader().read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(stream_io(e)),
            }
        }
    }

    fn flush_tls(&mut self) -> Result<(), RpcError> {
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket).map_err(stream_io)?;
        }
        Ok(())
    }
}
