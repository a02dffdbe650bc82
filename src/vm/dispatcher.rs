//! VM agent dispatcher
//!
//! Maintains one persistent connection per VM to the in-guest agent's
//! forwarded port and multiplexes requests over it by correlation id.
//! A single writer task owns the socket; readers are routed by id, so an
//! exec stream never blocks a control operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use super::agent::{AgentMessage, AgentMessageKind, AgentRequest};
use super::provider::{VmError, VmResult};

/// Default deadline for single-reply operations
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered messages per in-flight streaming request
const STREAM_BUFFER: usize = 64;

enum Route {
    /// Single terminal message expected
    Oneshot(tokio::sync::oneshot::Sender<AgentMessage>),

    /// Every message for the id flows through until a terminal one
    Stream(mpsc::Sender<AgentMessage>),
}

struct Shared {
    pending: Mutex<HashMap<String, Route>>,
    writer_tx: mpsc::Sender<String>,
}

/// Multiplexing client for one VM's agent connection
pub struct Dispatcher {
    shared: Arc<Shared>,

    /// Becomes true when the connection drops; consumers treat in-flight
    /// containers as lost
    lost_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Connect to the agent's forwarded loopback port
    pub async fn connect(agent_port: u16) -> VmResult<Self> {
        let addr = format!("127.0.0.1:{}", agent_port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| VmError::Unavailable(format!("agent at {}: {}", addr, e)))?;

        info!("connected to VM agent at {}", addr);
        Ok(Self::from_stream(stream))
    }

    /// Build a dispatcher over an established stream (tests use a local
    /// socket pair)
    pub fn from_stream(stream: TcpStream) -> Self {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(16 * 1024 * 1024));
        let (mut sink, mut source) = framed.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(256);
        let (lost_tx, lost_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            writer_tx,
        });

        // Single writer task owns the sink
        tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    warn!("agent connection write failed: {}", e);
                    break;
                }
            }
        });

        // Reader routes messages by correlation id
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                let line = match next {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("agent connection read failed: {}", e);
                        break;
                    }
                };

                let message: AgentMessage = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("unparseable agent message: {}", e);
                        continue;
                    }
                };

                let terminal = matches!(
                    message.kind,
                    AgentMessageKind::Reply | AgentMessageKind::Exit
                );

                let route = reader_shared.pending.lock().remove(&message.id);
                match route {
                    Some(Route::Oneshot(tx)) => {
                        let _ = tx.send(message);
                    }
                    Some(Route::Stream(tx)) => {
                        // Streams stay routable until their terminal message
                        if !terminal {
                            reader_shared
                                .pending
                                .lock()
                                .insert(message.id.clone(), Route::Stream(tx.clone()));
                        }
                        // Backpressure: the reader stalls when the consumer lags
                        let _ = tx.send(message).await;
                    }
                    None => {
                        debug!("dropping message for unknown correlation id {}", message.id);
                    }
                }
            }

            // Connection gone: fail everything in flight
            let mut pending = reader_shared.pending.lock();
            for (_, route) in pending.drain() {
                match route {
                    Route::Oneshot(tx) => {
                        let _ = tx.send(AgentMessage::error("", "vm connection lost"));
                    }
                    Route::Stream(tx) => {
                        let _ = tx.try_send(AgentMessage::error("", "vm connection lost"));
                    }
                }
            }
            let _ = lost_tx.send(true);
        });

        Self { shared, lost_rx }
    }

    /// Whether the underlying connection has dropped
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves when the connection drops
    pub async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn enqueue(&self, request: &AgentRequest) -> VmResult<()> {
        let line = serde_json::to_string(request)
            .map_err(|e| VmError::Protocol(format!("encode request: {}", e)))?;
        self.shared
            .writer_tx
            .send(line)
            .await
            .map_err(|_| VmError::Unavailable("agent connection closed".into()))
    }

    /// Send a request expecting a single terminal message
    pub async fn request(&self, request: AgentRequest) -> VmResult<AgentMessage> {
        if self.is_lost() {
            return Err(VmError::Unavailable("vm connection lost".into()));
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(request.id.clone(), Route::Oneshot(tx));

        if let Err(e) = self.enqueue(&request).await {
            self.shared.pending.lock().remove(&request.id);
            return Err(e);
        }

        let message = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.shared.pending.lock().remove(&request.id);
                VmError::Timeout
            })?
            .map_err(|_| VmError::Unavailable("vm connection lost".into()))?;

        if !message.ok {
            return Err(VmError::Protocol(
                message.error.unwrap_or_else(|| "agent error".into()),
            ));
        }
        Ok(message)
    }

    /// Send a streaming request; messages arrive in order, terminal last.
    ///
    /// No timeout: streams live as long as the operation (a `wait` can be
    /// open for days). Connection loss terminates the stream with an error
    /// message.
    pub async fn request_stream(
        &self,
        request: AgentRequest,
    ) -> VmResult<mpsc::Receiver<AgentMessage>> {
        if self.is_lost() {
            return Err(VmError::Unavailable("vm connection lost".into()));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.shared
            .pending
            .lock()
            .insert(request.id.clone(), Route::Stream(tx));

        if let Err(e) = self.enqueue(&request).await {
            self.shared.pending.lock().remove(&request.id);
            return Err(e);
        }

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::agent::AgentOp;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal scripted agent: answers ping with a reply, exec with two
    /// stream chunks then exit
    async fn scripted_agent(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let request: AgentRequest = serde_json::from_str(&line).unwrap();
            match &request.op {
                AgentOp::Ping => {
                    let reply =
                        AgentMessage::reply(&request.id, serde_json::json!({"version": "test"}));
                    let mut out = serde_json::to_string(&reply).unwrap();
                    out.push('\n');
                    write_half.write_all(out.as_bytes()).await.unwrap();
                }
                AgentOp::ExecContainer { .. } => {
                    for chunk in [&b"one"[..], &b"two"[..]] {
                        let msg = AgentMessage::stream(
                            &request.id,
                            crate::backend::StdStream::Stdout,
                            chunk,
                        );
                        let mut out = serde_json::to_string(&msg).unwrap();
                        out.push('\n');
                        write_half.write_all(out.as_bytes()).await.unwrap();
                    }
                    let exit = AgentMessage::exit(&request.id, 0, false);
                    let mut out = serde_json::to_string(&exit).unwrap();
                    out.push('\n');
                    write_half.write_all(out.as_bytes()).await.unwrap();
                }
                _ => {}
            }
        }
    }

    async fn connected_pair() -> (Dispatcher, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let agent = tokio::spawn(scripted_agent(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        (Dispatcher::from_stream(stream), agent)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (dispatcher, _agent) = connected_pair().await;

        let reply = dispatcher
            .request(AgentRequest::new(AgentOp::Ping))
            .await
            .unwrap();
        assert_eq!(reply.payload["version"], "test");
    }

    #[tokio::test]
    async fn test_streaming_interleaved_with_control() {
        let (dispatcher, _agent) = connected_pair().await;

        let mut stream = dispatcher
            .request_stream(AgentRequest::new(AgentOp::ExecContainer {
                container_id: "c1".into(),
                command: vec!["echo".into()],
                env: vec![],
                tty: false,
            }))
            .await
            .unwrap();

        // A control request completes while the stream is open
        let reply = dispatcher
            .request(AgentRequest::new(AgentOp::Ping))
            .await
            .unwrap();
        assert!(reply.ok);

        let mut chunks = Vec::new();
        while let Some(message) = stream.recv().await {
            match message.kind {
                AgentMessageKind::Stream => {
                    let (_, data) = message.decode_stream().unwrap();
                    chunks.extend_from_slice(&data);
                }
                AgentMessageKind::Exit => {
                    assert_eq!(message.decode_exit().unwrap().exit_code, 0);
                    break;
                }
                AgentMessageKind::Reply => panic!("unexpected reply on stream"),
            }
        }
        assert_eq!(chunks, b"onetwo");
    }

    #[tokio::test]
    async fn test_connection_loss_flags_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let agent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream); // immediate close
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let dispatcher = Dispatcher::from_stream(stream);
        agent.await.unwrap();

        dispatcher.lost().await;
        assert!(dispatcher.is_lost());

        let err = dispatcher
            .request(AgentRequest::new(AgentOp::Ping))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Unavailable(_)));
    }
}
