//! Streaming hub
//!
//! Exec/Attach/PortForward return a one-time URL with an opaque token; the
//! client reconnects on a streaming transport and the hub maps the token
//! back to the pending operation within a grace window. Tokens are
//! single-use.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{ExecSession, StdStream};
use crate::container::LogRecord;
use crate::error::{DaemonError, Result};

use super::frame::{Channel, Frame};

/// Operations parked behind a token
#[derive(Debug, Clone)]
pub enum PendingOp {
    Exec {
        container_id: String,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    },
    Attach {
        container_id: String,
    },
    PortForward {
        sandbox_id: String,
        port: u16,
    },
}

/// Token registry plus stream bridging
pub struct StreamingHub {
    tokens: DashMap<String, (PendingOp, Instant)>,

    /// Grace window between URL issue and client reconnect
    grace: Duration,

    /// Frames buffered per direction
    buffer: usize,
}

impl StreamingHub {
    pub fn new(grace_secs: u64, buffer: usize) -> Self {
        Self {
            tokens: DashMap::new(),
            grace: Duration::from_secs(grace_secs),
            buffer,
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    /// Park an operation and mint its token
    pub fn register(&self, op: PendingOp) -> String {
        // Expired leftovers go away on the next registration
        let now = Instant::now();
        self.tokens.retain(|_, (_, created)| now - *created < self.grace);

        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(uuid::Uuid::new_v4().as_bytes());
        self.tokens.insert(token.clone(), (op, now));
        token
    }

    /// Claim a token. Single-use: a second claim of the same token fails.
    pub fn claim(&self, token: &str) -> Result<PendingOp> {
        let Some((_, (op, created))) = self.tokens.remove(token) else {
            return Err(DaemonError::invalid_state(
                "claim_stream_token",
                "token consumed or unknown",
            ));
        };

        if created.elapsed() > self.grace {
            return Err(DaemonError::timeout(
                "claim_stream_token",
                "token expired before reconnect",
            ));
        }
        Ok(op)
    }

    /// Bridge an exec session over a websocket.
    ///
    /// Close is two-phase: a client half-close of stdin signals EOF to the
    /// container; the exit notification goes out on the error channel after
    /// output drains, then the socket closes.
    pub async fn serve_exec(&self, socket: WebSocket, mut session: ExecSession) {
        let (mut sink, mut source) = socket.split();

        // Client -> container stdin
        let stdin = session.stdin.take();
        let reader = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(Ok(message)) = source.next().await {
                match message {
                    Message::Binary(data) => {
                        let Some(frame) = Frame::decode(&data) else {
                            continue;
                        };
                        match frame.channel {
                            Channel::Stdin => {
                                if frame.payload.is_empty() {
                                    // Empty stdin frame is the half-close
                                    stdin = None;
                                    continue;
                                }
                                if let Some(tx) = &stdin {
                                    if tx.send(frame.payload).await.is_err() {
                                        stdin = None;
                                    }
                                }
                            }
                            Channel::Resize => {
                                debug!("tty resize request ignored by this backend");
                            }
                            _ => {}
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            // Dropping the sender half-closes stdin in the container
        });

        // Container -> client
        while let Some((stream, chunk)) = session.output.recv().await {
            let channel = match stream {
                StdStream::Stdout => Channel::Stdout,
                StdStream::Stderr => Channel::Stderr,
            };
            if sink
                .send(Message::Binary(Frame::new(channel, chunk).encode()))
                .await
                .is_err()
            {
                break;
            }
        }

        // Exit notification on the error channel, then close
        let status = match session.exit.await {
            Ok(exit) if exit.exit_code == 0 => json!({"status": "Success"}),
            Ok(exit) => json!({
                "status": "Failure",
                "reason": "NonZeroExitCode",
                "exitCode": exit.exit_code,
            }),
            Err(_) => json!({"status": "Failure", "reason": "ConnectionLost"}),
        };
        let _ = sink
            .send(Message::Binary(
                Frame::new(Channel::Error, status.to_string().into_bytes()).encode(),
            ))
            .await;
        let _ = sink.send(Message::Close(None)).await;

        reader.abort();
    }

    /// Bridge an attach: live log records out, optional stdin in
    pub async fn serve_attach(
        &self,
        socket: WebSocket,
        mut output: tokio::sync::broadcast::Receiver<LogRecord>,
        stdin: Option<tokio::sync::mpsc::Sender<Bytes>>,
    ) {
        let (mut sink, mut source) = socket.split();

        let reader = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(Ok(message)) = source.next().await {
                match message {
                    Message::Binary(data) => {
                        if let Some(frame) = Frame::decode(&data) {
                            if frame.channel == Channel::Stdin {
                                if frame.payload.is_empty() {
                                    stdin = None;
                                } else if let Some(tx) = &stdin {
                                    if tx.send(frame.payload).await.is_err() {
                                        stdin = None;
                                    }
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        loop {
            match output.recv().await {
                Ok(record) => {
                    let channel = match record.stream {
                        StdStream::Stdout => Channel::Stdout,
                        StdStream::Stderr => Channel::Stderr,
                    };
                    if sink
                        .send(Message::Binary(
                            Frame::new(channel, record.log.into_bytes()).encode(),
                        ))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("attach client lagged by {} records", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        let _ = sink.send(Message::Close(None)).await;
        reader.abort();
    }

    /// Bridge a port-forward to a local TCP endpoint
    pub async fn serve_port_forward(&self, socket: WebSocket, port: u16) {
        let stream = match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => stream,
            Err(e) => {
                let (mut sink, _) = socket.split();
                let status = json!({"status": "Failure", "reason": e.to_string()});
                let _ = sink
                    .send(Message::Binary(
                        Frame::new(Channel::Error, status.to_string().into_bytes()).encode(),
                    ))
                    .await;
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        };

        let (mut tcp_read, mut tcp_write) = stream.into_split();
        let (mut sink, mut source) = socket.split();

        let inbound = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(Ok(message)) = source.next().await {
                match message {
                    Message::Binary(data) => {
                        if let Some(frame) = Frame::decode(&data) {
                            if frame.channel == Channel::Stdin
                                && tcp_write.write_all(&frame.payload).await.is_err()
                            {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            let _ = tcp_write.shutdown().await;
        });

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 8192];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink
                        .send(Message::Binary(
                            Frame::new(Channel::Stdout, buf[..n].to_vec()).encode(),
                        ))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        let _ = sink.send(Message::Close(None)).await;
        inbound.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> StreamingHub {
        StreamingHub::new(60, 64)
    }

    #[test]
    fn test_token_single_use() {
        let hub = hub();
        let token = hub.register(PendingOp::Attach {
            container_id: "c1".into(),
        });

        let op = hub.claim(&token).unwrap();
        assert!(matches!(op, PendingOp::Attach { container_id } if container_id == "c1"));

        // Reuse is refused
        let err = hub.claim(&token).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn test_unknown_token() {
        let hub = hub();
        assert!(hub.claim("nope").is_err());
    }

    #[test]
    fn test_expired_token() {
        let hub = StreamingHub::new(0, 64);
        let token = hub.register(PendingOp::PortForward {
            sandbox_id: "s1".into(),
            port: 80,
        });

        std::thread::sleep(Duration::from_millis(10));
        let err = hub.claim(&token).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Timeout);
    }

    #[test]
    fn test_tokens_are_unique_and_opaque() {
        let hub = hub();
        let a = hub.register(PendingOp::Attach {
            container_id: "c1".into(),
        });
        let b = hub.register(PendingOp::Attach {
            container_id: "c1".into(),
        });
        assert_ne!(a, b);
        assert!(!a.contains("c1"));
    }
}
