//! Blocking exact-length transfers over the TCP control connection.
//!
//! `read_exact` and `write_all` already retry on `ErrorKind::Interrupted` and turn a short
//! transfer into an error, which is all the handshake needs from its byte channel.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

use super::qp_info::QpInfo;

/// The literal exchanged in both directions once a QP is connected.
pub const SYNC_TOKEN: &[u8; 4] = b"sync";

#[derive(Debug)]
pub struct ControlChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(ControlChannel { stream, peer })
    }

    /// Connect to `host:port`, trying every address the name resolves to.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        Self::new(TcpStream::connect((host, port))?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn send_info(&mut self, info: &QpInfo) -> io::Result<()> {
        self.stream.write_all(&info.to_bytes())
    }

    pub fn recv_info(&mut self) -> io::Result<QpInfo> {
        let mut buf = [0u8; QpInfo::WIRE_LEN];
        self.stream.read_exact(&mut buf)?;
        Ok(QpInfo::from_bytes(&buf))
    }

    /// Write the rendezvous token, then read the peer's. Returns whether the peer sent the
    /// expected literal.
    pub fn sync(&mut self) -> io::Result<bool> {
        self.stream.write_all(SYNC_TOKEN)?;
        let mut buf = [0u8; SYNC_TOKEN.len()];
        self.stream.read_exact(&mut buf)?;
        Ok(&buf == SYNC_TOKEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_info_and_sync_over_localhost() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let info = QpInfo {
            lid: 3,
            qp_num: 0x11,
            rkey: 0x22,
            raddr: 0x7f00_0000_1000,
            rank: 1,
        };

        let peer = thread::spawn(move || -> io::Result<QpInfo> {
            let mut channel = ControlChannel::connect("127.0.0.1", port)?;
            channel.send_info(&info)?;
            let reply = channel.recv_info()?;
            assert!(channel.sync()?);
            Ok(reply)
        });

        let (stream, _) = listener.accept()?;
        let mut channel = ControlChannel::new(stream)?;
        assert_eq!(channel.recv_info()?, info);
        channel.send_info(&QpInfo { rank: 0, ..info })?;
        assert!(channel.sync()?);

        assert_eq!(peer.join().unwrap()?, QpInfo { rank: 0, ..info });
        Ok(())
    }

    #[test]
    fn test_short_read_is_an_error() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();

        let peer = thread::spawn(move || -> io::Result<()> {
            let mut stream = TcpStream::connect(("127.0.0.1", port))?;
            stream.write_all(&[0u8; 5])
        });

        let (stream, _) = listener.accept()?;
        let mut channel = ControlChannel::new(stream)?;
        peer.join().unwrap()?;
        let err = channel.recv_info().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    }
}
