use std::io;
use std::net::SocketAddr;

use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UdpSocket};

use crate::engine::{EngineResult, SocketType};

/// Outcome of a non-blocking socket operation. `WouldBlock` is a wait
/// signal, `Closed` means the peer shut the stream down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Done(usize),
    WouldBlock,
    Closed,
}

/// Thin wrapper over a non-blocking OS socket handle.
///
/// TCP streams come from the manager's listener or an outbound
/// connect; UDP sockets are always connected to a fixed peer so that
/// send/recv mirror the stream calls. Closing is dropping.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Socket {
    pub fn from_tcp(stream: TcpStream) -> Socket {
        Socket::Tcp(stream)
    }

    pub async fn connect(socket_type: SocketType, addr: &str) -> EngineResult<Socket> {
        match socket_type {
            SocketType::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Socket::Tcp(stream))
            }
            SocketType::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(addr).await?;
                Ok(Socket::Udp(socket))
            }
        }
    }

    pub fn try_recv(&self, buf: &mut [u8]) -> EngineResult<IoOutcome> {
        let result = match self {
            Socket::Tcp(stream) => match stream.try_read(buf) {
                Ok(0) => return Ok(IoOutcome::Closed),
                other => other,
            },
            Socket::Udp(socket) => socket.try_recv(buf),
        };
        match result {
            Ok(n) => Ok(IoOutcome::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(IoOutcome::Closed),
            Err(e) => Err(e.into()),
        }
    }

    pub fn try_send(&self, buf: &[u8]) -> EngineResult<IoOutcome> {
        let result = match self {
            Socket::Tcp(stream) => stream.try_write(buf),
            Socket::Udp(socket) => socket.try_send(buf),
        };
        match result {
            Ok(n) => Ok(IoOutcome::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                Ok(IoOutcome::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the socket reports any of `interest`.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            Socket::Tcp(stream) => stream.ready(interest).await,
            Socket::Udp(socket) => socket.ready(interest).await,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(stream) => stream.peer_addr(),
            Socket::Udp(socket) => socket.peer_addr(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(stream) => stream.local_addr(),
            Socket::Udp(socket) => socket.local_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_try_recv_would_block_then_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Socket::connect(SocketType::Tcp, &addr.to_string())
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(client.try_recv(&mut buf).unwrap(), IoOutcome::WouldBlock);

        server.write_all(b"ping").await.unwrap();
        server.flush().await.unwrap();
        client.ready(Interest::READABLE).await.unwrap();
        assert_eq!(client.try_recv(&mut buf).unwrap(), IoOutcome::Done(4));
        assert_eq!(&buf[..4], b"ping");
    }

    #[tokio::test]
    async fn test_try_recv_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Socket::connect(SocketType::Tcp, &addr.to_string())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        client.ready(Interest::READABLE).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.try_recv(&mut buf).unwrap(), IoOutcome::Closed);
    }

    #[tokio::test]
    async fn test_connected_udp_send_recv() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let socket = Socket::connect(SocketType::Udp, &peer_addr.to_string())
            .await
            .unwrap();

        socket.ready(Interest::WRITABLE).await.unwrap();
        assert_eq!(socket.try_send(b"hello").unwrap(), IoOutcome::Done(5));
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, socket.local_addr().unwrap());
    }
}
