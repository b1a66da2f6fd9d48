//! A single TCP connection to a peer: handshake plus length-prefixed
//! message framing. Choke/interested/bitfield bookkeeping for full-content
//! download lives outside this crate's scope; this connection only
//! carries enough state to run the ut_metadata exchange in
//! `peer/metadata.rs`.

use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{Error, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const TOKEN: Token = Token(0);

pub struct Connection {
    pub stream: TcpStream,
    pub poll: Poll,
    pub addr: SocketAddr,
    /// the peer id of the remote peer (recv in handshake)
    pub peer_id: [u8; 20],
    pub info_hash: [u8; 20],
    pub peer_supports_extensions: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("peer_id", &self.peer_id)
            .field("info_hash", &self.info_hash)
            .field("peer_supports_extensions", &self.peer_supports_extensions)
            .finish()
    }
}

impl Connection {
    /// Connects to `peer`, performs the BitTorrent handshake,
    /// and drops the connection if the peer's info_hash doesn't match or
    /// it doesn't advertise the extension protocol.
    pub fn new(
        peer: SocketAddr,
        info_hash: [u8; 20],
        my_id: [u8; 20],
        connect_timeout: Duration,
    ) -> Result<Connection, Error> {
        let poll = Poll::new()?;
        let mut stream = TcpStream::connect(peer)?;

        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)?;
        let mut events = Events::with_capacity(16);
        let handshake = Handshake::new(info_hash, my_id);
        let deadline = Instant::now() + connect_timeout;

        let mut sent = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::new(ErrorKind::TimedOut, "handshake timed out"));
            }
            poll.poll(&mut events, Some(remaining))?;
            for event in events.iter() {
                if event.token() != TOKEN {
                    continue;
                }
                if event.is_writable() && !sent {
                    stream.write_all(&handshake.to_bytes())?;
                    sent = true;
                    poll.registry()
                        .reregister(&mut stream, TOKEN, Interest::READABLE)?;
                }
                if event.is_readable() {
                    let mut buf = vec![0; 68];
                    stream.read_exact(&mut buf)?;
                    let reply = Handshake::from_bytes(&buf)?;

                    if !reply.check(&info_hash) {
                        return Err(Error::new(ErrorKind::InvalidData, "handshake info_hash mismatch"));
                    }
                    if !reply.supports_extension_protocol() {
                        return Err(Error::new(
                            ErrorKind::Unsupported,
                            "peer does not advertise the extension protocol",
                        ));
                    }

                    return Ok(Connection {
                        stream,
                        poll,
                        addr: peer,
                        peer_id: reply.peer_id,
                        info_hash,
                        peer_supports_extensions: true,
                    });
                }
            }
        }
    }

    pub fn send(&mut self, message: &Message) -> Result<(), Error> {
        self.stream.write_all(&message.serialize())?;
        log::debug!("sent message id {} to {}", message.id(), self.addr);
        Ok(())
    }

    /// Reads one length-prefixed frame, polling for readability and
    /// retrying on `WouldBlock` instead of assuming a blocking socket —
    /// `stream` is registered with `mio` and never blocks on its own.
    /// Gives up once `deadline` passes.
    pub fn recv(&mut self, deadline: Instant) -> Result<Message, Error> {
        let mut len_buf = [0u8; 4];
        self.read_exact_polling(&mut len_buf, deadline)?;
        let len = u32::from_be_bytes(len_buf);
        let mut payload = vec![0; len as usize];
        self.read_exact_polling(&mut payload, deadline)?;
        let mut frame = len_buf.to_vec();
        frame.extend_from_slice(&payload);
        Message::deserialize(&frame)
    }

    /// Fills `buf` completely, polling the registered socket for
    /// readability and retrying on `WouldBlock` rather than erroring out on
    /// the first read that arrives before the peer has written anything.
    fn read_exact_polling(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), Error> {
        let mut filled = 0;
        let mut events = Events::with_capacity(4);
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::new(ErrorKind::UnexpectedEof, "peer closed the connection")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::new(ErrorKind::TimedOut, "timed out waiting for peer data"));
                    }
                    self.poll.poll(&mut events, Some(remaining.min(Duration::from_secs(1))))?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn rejects_mismatched_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let wrong_hash = [9u8; 20];

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 68];
            std::io::Read::read_exact(&mut stream, &mut buf).unwrap();
            let reply = Handshake::new(wrong_hash, [2u8; 20]);
            std::io::Write::write_all(&mut stream, &reply.to_bytes()).unwrap();
        });

        let result = Connection::new(addr, info_hash, [1u8; 20], Duration::from_secs(2));
        assert!(result.is_err());
        handle.join().unwrap();
    }
}
