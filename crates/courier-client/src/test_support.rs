// In-memory dialer and scripted gateway for engine and pool tests.
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use courier_transport::{BoxedStream, Dial, Endpoint, TransportError};
use courier_wire::{DeviceToken, ErrorResponse, ErrorStatus, Frame, FrameHeader};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// How the fake gateway reacts to incoming frames.
#[derive(Debug, Clone, Default)]
pub(crate) struct GatewayScript {
    /// Frames for these tokens get an error response with this status.
    pub(crate) reject: Vec<(DeviceToken, ErrorStatus)>,
    /// After this many accepted frames in total, answer with a shutdown
    /// response naming the last accepted identifier.
    pub(crate) shutdown_after: Option<usize>,
    /// Reject with an identifier no frame carried.
    pub(crate) misattribute: bool,
    /// Hang up without an error response after this many accepted frames on
    /// the first connection that carries traffic.
    pub(crate) hang_up_after: Option<usize>,
    /// Send a truncated error response on the first connection that carries
    /// traffic.
    pub(crate) garble_first: bool,
}

#[derive(Default)]
struct GatewayState {
    accepted: Vec<u32>,
    rejected: Vec<u32>,
    connections: usize,
    first_active: Option<usize>,
    shutdown_sent: bool,
}

/// Fake gateway listening on the other end of [`MemoryDialer`] streams.
#[derive(Clone)]
pub(crate) struct MockGateway {
    script: Arc<GatewayScript>,
    state: Arc<Mutex<GatewayState>>,
    active: Arc<AtomicUsize>,
}

impl MockGateway {
    fn new(script: GatewayScript) -> Self {
        Self {
            script: Arc::new(script),
            state: Arc::new(Mutex::new(GatewayState::default())),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Identifiers accepted without an error, in arrival order.
    pub(crate) fn accepted(&self) -> Vec<u32> {
        self.lock().accepted.clone()
    }

    pub(crate) fn rejected(&self) -> Vec<u32> {
        self.lock().rejected.clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Wait until every served stream has been hung up.
    pub(crate) async fn wait_idle(&self) {
        for _ in 0..400 {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("gateway streams still open");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        self.state.lock().expect("gateway state")
    }

    fn serve(&self, stream: DuplexStream) {
        let gateway = self.clone();
        let connection = {
            let mut state = self.lock();
            state.connections += 1;
            state.connections
        };
        tokio::spawn(async move {
            gateway.handle(stream, connection).await;
            gateway.active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn handle(&self, mut stream: DuplexStream, connection: usize) {
        let mut accepted_here = 0usize;
        loop {
            let Some(frame) = read_frame(&mut stream).await else {
                return;
            };
            let identifier = frame.identifier.unwrap_or_default();
            let first = *self.lock().first_active.get_or_insert(connection) == connection;
            let status = self
                .script
                .reject
                .iter()
                .find(|(token, _)| *token == frame.token)
                .map(|(_, status)| *status);

            if let Some(status) = status {
                self.lock().rejected.push(identifier);
                let reported = if self.script.misattribute {
                    identifier.wrapping_add(10_000)
                } else {
                    identifier
                };
                if first && self.script.garble_first {
                    let bytes = ErrorResponse::new(status, reported).encode();
                    let _ = stream.write_all(&bytes[..3]).await;
                } else {
                    let bytes = ErrorResponse::new(status, reported).encode();
                    let _ = stream.write_all(&bytes).await;
                }
                let _ = stream.shutdown().await;
                return;
            }

            let shutdown = {
                let mut state = self.lock();
                state.accepted.push(identifier);
                let due = self
                    .script
                    .shutdown_after
                    .is_some_and(|limit| state.accepted.len() == limit);
                if due && !state.shutdown_sent {
                    state.shutdown_sent = true;
                    true
                } else {
                    false
                }
            };
            accepted_here += 1;
            if shutdown {
                let bytes = ErrorResponse::new(ErrorStatus::Shutdown, identifier).encode();
                let _ = stream.write_all(&bytes).await;
                let _ = stream.shutdown().await;
                return;
            }
            if first && self.script.hang_up_after == Some(accepted_here) {
                return;
            }
        }
    }
}

async fn read_frame(stream: &mut DuplexStream) -> Option<Frame> {
    let mut header = [0u8; FrameHeader::LEN];
    stream.read_exact(&mut header).await.ok()?;
    let length = FrameHeader::decode(&header).ok()?.length as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;
    Frame::decode_items(Bytes::from(body)).ok()
}

/// Dialer that hands out in-memory streams served by a [`MockGateway`].
#[derive(Clone)]
pub(crate) struct MemoryDialer {
    endpoint: Endpoint,
    gateway: MockGateway,
    fail_remaining: Arc<AtomicUsize>,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    pub(crate) fn with_gateway(script: GatewayScript) -> (Self, MockGateway) {
        let gateway = MockGateway::new(script);
        let dialer = Self {
            endpoint: Endpoint::new("gateway.test", 2195),
            gateway: gateway.clone(),
            fail_remaining: Arc::new(AtomicUsize::new(0)),
            dials: Arc::new(AtomicUsize::new(0)),
        };
        (dialer, gateway)
    }

    /// Refuse the next `count` dials.
    pub(crate) fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Dial for MemoryDialer {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn dial(&self) -> courier_transport::Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectFailed {
                endpoint: self.endpoint.to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.gateway.active.fetch_add(1, Ordering::SeqCst);
        self.gateway.serve(server);
        Ok(Box::new(client))
    }
}

/// Tokens that differ only in their first byte.
pub(crate) fn token(n: u8) -> DeviceToken {
    let mut bytes = [0xabu8; 32];
    bytes[0] = n;
    DeviceToken::from(bytes)
}

pub(crate) fn rejected_tokens(tokens: &[DeviceToken], status: ErrorStatus) -> Vec<(DeviceToken, ErrorStatus)> {
    tokens.iter().map(|token| (*token, status)).collect()
}

/// True when no item repeats.
pub(crate) fn unique<T: std::hash::Hash + Eq + Clone>(items: &[T]) -> bool {
    items.iter().cloned().collect::<HashSet<_>>().len() == items.len()
}
