//! One TCP connection to a peer: handshake, initial bitfield receive, and
//! framed send/receive for the lifetime of the connection. Exclusively owned
//! by whichever worker thread holds it.

use crate::bitfield::Bitfield;
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;

const DIAL_DEADLINE: Duration = Duration::from_secs(3);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(3);
const BITFIELD_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),
    #[error("handshake io failed: {0}")]
    HandshakeIo(#[source] std::io::Error),
    #[error(transparent)]
    Handshake(#[from] crate::peer::handshake::HandshakeError),
    #[error("first message after handshake was not Bitfield (got {0:?})")]
    NotBitfield(Message),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Message(#[from] crate::peer::message::MessageError),
}

/// One active connection to a peer, post-handshake and post-initial-bitfield.
pub struct Session {
    addr: SocketAddr,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    pub peer_id: [u8; 20],
    pub bitfield: Bitfield,
    pub choked: bool,
}

impl Session {
    /// Dials `peer`, performs the handshake, and receives the peer's initial
    /// Bitfield — each phase under its own 3-second deadline. Deadlines are
    /// cleared before returning; the caller (the engine) reinstates a
    /// per-piece deadline for the duration of `attempt_download_piece`.
    pub fn new(
        peer: SocketAddr,
        local_id: [u8; 20],
        info_digest: [u8; 20],
        num_pieces: usize,
    ) -> Result<Session, SessionError> {
        let stream = TcpStream::connect_timeout(&peer, DIAL_DEADLINE).map_err(SessionError::Dial)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_DEADLINE))
            .map_err(SessionError::HandshakeIo)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_DEADLINE))
            .map_err(SessionError::HandshakeIo)?;

        let mut writer = stream.try_clone().map_err(SessionError::HandshakeIo)?;
        let mut reader = BufReader::new(stream);

        let req = Handshake::new(info_digest, local_id);
        writer
            .write_all(&req.serialize())
            .map_err(SessionError::HandshakeIo)?;

        let mut resp_buf = [0u8; 68];
        reader
            .read_exact(&mut resp_buf)
            .map_err(SessionError::HandshakeIo)?;
        let resp = Handshake::parse(&resp_buf)?;
        resp.validate(&info_digest)?;

        reader
            .get_ref()
            .set_read_timeout(Some(BITFIELD_DEADLINE))?;
        let frame = read_frame(&mut reader)?;
        let msg = Message::parse(&frame)?;
        let bitfield = match msg {
            Message::Bitfield(bits) => Bitfield::from_bytes(bits, num_pieces),
            other => return Err(SessionError::NotBitfield(other)),
        };

        reader.get_ref().set_read_timeout(None)?;
        reader.get_ref().set_write_timeout(None)?;

        Ok(Session {
            addr: peer,
            writer,
            reader,
            peer_id: resp.peer_id,
            bitfield,
            choked: true,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has(index)
    }

    /// True iff bytes already sit in the read buffer, so a subsequent
    /// `read()` is guaranteed not to touch the network.
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Sets (or clears, with `None`) the read/write deadline on the
    /// underlying connection. Used by the engine to bound a whole piece's
    /// worth of request/response traffic.
    pub fn set_deadline(&self, deadline: Option<Duration>) -> std::io::Result<()> {
        self.reader.get_ref().set_read_timeout(deadline)?;
        self.reader.get_ref().set_write_timeout(deadline)?;
        Ok(())
    }

    pub fn read(&mut self) -> Result<Message, SessionError> {
        let frame = read_frame(&mut self.reader)?;
        Ok(Message::parse(&frame)?)
    }

    fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.writer.write_all(&msg.serialize())?;
        Ok(())
    }

    pub fn send_choke(&mut self) -> Result<(), SessionError> {
        self.send(&Message::Choke)
    }

    pub fn send_unchoke(&mut self) -> Result<(), SessionError> {
        self.send(&Message::Unchoke)
    }

    pub fn send_interested(&mut self) -> Result<(), SessionError> {
        self.send(&Message::Interested)
    }

    pub fn send_not_interested(&mut self) -> Result<(), SessionError> {
        self.send(&Message::NotInterested)
    }

    pub fn send_have(&mut self, index: u32) -> Result<(), SessionError> {
        self.send(&Message::Have(index))
    }

    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), SessionError> {
        self.send(&Message::Request(index, begin, length))
    }
}

/// Reads a full `<len-prefix><id><payload>` frame (or the 4-byte keep-alive
/// frame) off `reader` and returns it with the length prefix included, ready
/// for `Message::parse`.
fn read_frame(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let length = u32::from_be_bytes(len_buf) as usize;
    let mut frame = Vec::with_capacity(4 + length);
    frame.extend_from_slice(&len_buf);
    if length > 0 {
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload)?;
        frame.extend_from_slice(&payload);
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::Message;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::thread;

    /// Spins up a loopback "peer" that completes the handshake, sends one
    /// Bitfield, then hands control to `then` for the rest of the exchange.
    fn spawn_fixture_peer(
        info_digest: [u8; 20],
        bitfield_payload: Vec<u8>,
        then: impl FnOnce(TcpStream) + Send + 'static,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut req = [0u8; 68];
            stream.read_exact(&mut req).unwrap();
            let parsed = Handshake::parse(&req).unwrap();
            assert_eq!(parsed.info_digest, info_digest);

            let resp = Handshake::new(info_digest, [0xAB; 20]);
            stream.write_all(&resp.serialize()).unwrap();

            let bf = Message::Bitfield(bitfield_payload);
            stream.write_all(&bf.serialize()).unwrap();

            then(stream);
        });
        addr
    }

    #[test]
    fn new_completes_handshake_and_receives_bitfield() {
        let info_digest = [7u8; 20];
        let addr = spawn_fixture_peer(info_digest, vec![0b1000_0000], |mut stream| {
            // keep the connection open briefly so the client's post-setup
            // reads (if any) don't race the listener thread's exit.
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf);
        });

        let local_id = [1u8; 20];
        let session = Session::new(addr, local_id, info_digest, 8).unwrap();
        assert!(session.choked);
        assert!(session.has_piece(0));
        assert!(!session.has_piece(1));
    }

    #[test]
    fn new_rejects_wrong_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_digest = [3u8; 20];
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut req = [0u8; 68];
            stream.read_exact(&mut req).unwrap();
            let resp = Handshake::new(info_digest, [0xCD; 20]);
            stream.write_all(&resp.serialize()).unwrap();
            // send Unchoke instead of Bitfield
            stream.write_all(&Message::Unchoke.serialize()).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let result = Session::new(addr, [1u8; 20], info_digest, 8);
        assert!(result.is_err());
    }
}
