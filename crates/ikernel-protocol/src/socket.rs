//! Channel sockets over TCP.
//!
//! Stand-ins for the router/publish socket pair of the original
//! protocol: `RouterSocket` serves the bidirectional request channels
//! (control, shell) with at most one live peer, `PubSocket` serves the
//! one-way output channel with any number of subscribers.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};

use crate::codec::{self, FrameAssembler, ProtocolError};

struct Peer {
    stream: TcpStream,
    assembler: FrameAssembler,
}

impl Peer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            assembler: FrameAssembler::new(),
        }
    }
}

enum Step {
    Data,
    Closed,
    NewPeer(TcpStream),
}

/// Bidirectional request-channel socket.
///
/// A newer connection replaces the current peer; outgoing messages are
/// dropped when no peer is connected.
pub struct RouterSocket {
    listener: TcpListener,
    peer: Option<Peer>,
}

impl RouterSocket {
    /// Bind the socket to the given endpoint.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind(endpoint: &str) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(endpoint).await?;
        Ok(Self {
            listener,
            peer: None,
        })
    }

    /// The locally bound address.
    ///
    /// # Errors
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    /// Receive the next complete frame run.
    ///
    /// Cancellation-safe: partially received frames are retained and
    /// completed on a later call, so this may sit inside a
    /// `tokio::select!` poll loop.
    ///
    /// # Errors
    /// Returns an error for unrecoverable socket failures or a
    /// malformed frame stream (the offending peer is dropped).
    pub async fn recv_frames(&mut self) -> Result<Vec<Bytes>, ProtocolError> {
        loop {
            match self.peer.as_mut().map(|p| p.assembler.next_message()) {
                Some(Ok(Some(frames))) => return Ok(frames),
                Some(Err(e)) => {
                    self.peer = None;
                    return Err(e);
                }
                _ => {}
            }

            let step = match self.peer.as_mut() {
                Some(peer) => tokio::select! {
                    ready = peer.stream.readable() => {
                        ready?;
                        let mut chunk = [0u8; 8192];
                        match peer.stream.try_read(&mut chunk) {
                            Ok(0) => Step::Closed,
                            Ok(n) => {
                                peer.assembler.extend(&chunk[..n]);
                                Step::Data
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Step::Data,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    accepted = self.listener.accept() => {
                        let (stream, addr) = accepted?;
                        tracing::debug!("peer {addr} replaces the current connection");
                        Step::NewPeer(stream)
                    }
                },
                None => {
                    let (stream, addr) = self.listener.accept().await?;
                    tracing::debug!("peer {addr} connected");
                    Step::NewPeer(stream)
                }
            };

            match step {
                Step::Data => {}
                Step::Closed => {
                    tracing::debug!("peer disconnected");
                    self.peer = None;
                }
                Step::NewPeer(stream) => self.peer = Some(Peer::new(stream)),
            }
        }
    }

    /// Send one frame run to the connected peer.
    ///
    /// # Errors
    /// Returns an error if the write fails; the peer is dropped.
    pub async fn send_frames(&mut self, frames: &[Bytes]) -> Result<(), ProtocolError> {
        let result = match self.peer.as_mut() {
            Some(peer) => codec::write_frames(&mut peer.stream, frames).await,
            None => {
                tracing::warn!("no connected peer; dropping outgoing message");
                return Ok(());
            }
        };
        if result.is_err() {
            self.peer = None;
        }
        result
    }
}

/// One-way broadcast socket for the output channel.
pub struct PubSocket {
    listener: TcpListener,
    subscribers: Vec<TcpStream>,
}

impl PubSocket {
    /// Bind the socket to the given endpoint.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind(endpoint: &str) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(endpoint).await?;
        Ok(Self {
            listener,
            subscribers: Vec::new(),
        })
    }

    /// The locally bound address.
    ///
    /// # Errors
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of currently attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn poll_accepts(&mut self) {
        while let Some(Ok((stream, addr))) = self.listener.accept().now_or_never() {
            tracing::debug!("subscriber {addr} attached");
            self.subscribers.push(stream);
        }
    }

    /// Broadcast one frame run to every attached subscriber.
    ///
    /// Pending accepts are drained first; subscribers whose write fails
    /// are pruned.
    pub async fn broadcast(&mut self, frames: &[Bytes]) {
        self.poll_accepts();

        let mut alive = Vec::with_capacity(self.subscribers.len());
        for mut stream in self.subscribers.drain(..) {
            match codec::write_frames(&mut stream, frames).await {
                Ok(()) => alive.push(stream),
                Err(e) => tracing::debug!("dropping subscriber: {e}"),
            }
        }
        self.subscribers = alive;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::message::{Message, Payload};
    use crate::signer::NullSigner;

    fn request(code: &str) -> Message {
        let mut header = Payload::new();
        header.insert("msg_id".into(), json!("id"));
        header.insert("msg_type".into(), json!("execute_request"));
        let mut content = Payload::new();
        content.insert("code".into(), json!(code));
        Message::from_parts(
            Some(Bytes::from_static(b"client")),
            header,
            Payload::new(),
            Payload::new(),
            content,
        )
    }

    async fn read_frames(stream: &mut TcpStream) -> Vec<Bytes> {
        let mut assembler = FrameAssembler::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frames) = assembler.next_message().unwrap() {
                return frames;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a full message arrived");
            assembler.extend(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_router_receives_and_replies() {
        let mut router = RouterSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = router.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frames = codec::encode_message(&request("x = 5"), &NullSigner);
        codec::write_frames(&mut client, &frames).await.unwrap();

        let received = router.recv_frames().await.unwrap();
        assert_eq!(received, frames);

        router.send_frames(&frames).await.unwrap();
        let echoed = read_frames(&mut client).await;
        assert_eq!(echoed, frames);
    }

    #[tokio::test]
    async fn test_router_newer_peer_replaces_older() {
        let mut router = RouterSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = router.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let frames = codec::encode_message(&request("1 + 1"), &NullSigner);
        codec::write_frames(&mut second, &frames).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), router.recv_frames())
            .await
            .expect("message from the new peer should arrive")
            .unwrap();
        assert_eq!(received, frames);
    }

    #[tokio::test]
    async fn test_pub_broadcasts_to_all_subscribers() {
        let mut socket = PubSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = codec::encode_message(&request("output"), &NullSigner);
        socket.broadcast(&frames).await;
        assert_eq!(socket.subscriber_count(), 2);

        assert_eq!(read_frames(&mut first).await, frames);
        assert_eq!(read_frames(&mut second).await, frames);
    }

    #[tokio::test]
    async fn test_pub_prunes_dead_subscribers() {
        let mut socket = PubSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = codec::encode_message(&request("output"), &NullSigner);
        socket.broadcast(&frames).await;
        assert_eq!(socket.subscriber_count(), 1);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Two writes: the first may succeed into the socket buffer, the
        // second observes the reset connection.
        socket.broadcast(&frames).await;
        socket.broadcast(&frames).await;
        assert_eq!(socket.subscriber_count(), 0);
    }
}
