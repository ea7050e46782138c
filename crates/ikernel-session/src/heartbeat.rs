//! Heartbeat channel: a raw byte echo.
//!
//! Liveness probes bypass the message layer entirely; whatever bytes a
//! peer sends come straight back.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

async fn echo(mut stream: TcpStream) {
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Owns the background task answering liveness probes.
pub struct Heartbeat {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Bind the heartbeat endpoint and start answering probes.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind(endpoint: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(endpoint).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("heartbeat peer {peer} connected");
                        tokio::spawn(echo(stream));
                    }
                    Err(e) => {
                        tracing::warn!("heartbeat accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(Self { addr, handle })
    }

    /// The locally bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop answering probes.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}
