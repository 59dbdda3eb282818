//! Local stand-in for the sensor bridge firmware.
//!
//! [`SimBridge`] listens on an ephemeral localhost port and answers the
//! bridge protocol with readings taken from shared, test-controlled state.
//! It can be told to stall (read requests, never answer), to corrupt its
//! next reply, or to report a device error for a winch.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cablebot_protocol::{DeviceFault, Frame, HEADER_LEN, MessageType, Request, Response, TRAILER_LEN};
use cablebot_types::{DistanceReading, ImuReading, WinchReading};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

/// Hall value reported for winches the test never set.  Comfortably above
/// the default safety threshold.
pub const DEFAULT_HALL: u16 = 2000;

#[derive(Default)]
struct BridgeState {
    winches: HashMap<u8, WinchReading>,
    failing: HashMap<u8, u8>,
    stalled: bool,
    corrupt_next: bool,
}

fn lock(state: &Mutex<BridgeState>) -> MutexGuard<'_, BridgeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimBridge {
    addr: SocketAddr,
    state: Arc<Mutex<BridgeState>>,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl SimBridge {
    /// Start serving the given winches on `127.0.0.1:0`.
    pub async fn start(winch_ids: &[u8]) -> io::Result<Self> {
        Self::bind("127.0.0.1:0", winch_ids).await
    }

    pub async fn bind(addr: &str, winch_ids: &[u8]) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let mut state = BridgeState::default();
        for &winch in winch_ids {
            state.winches.insert(
                winch,
                WinchReading {
                    winch,
                    hall_raw: DEFAULT_HALL,
                    bus_mv: 24_000,
                    ..WinchReading::default()
                },
            );
        }
        let state = Arc::new(Mutex::new(state));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            Arc::clone(&connections),
        ));
        debug!(%addr, "simulated sensor bridge listening");

        Ok(Self {
            addr,
            state,
            connections,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn set_hall(&self, winch: u8, value: u16) {
        let mut state = lock(&self.state);
        let reading = state.winches.entry(winch).or_insert_with(|| WinchReading {
            winch,
            ..WinchReading::default()
        });
        reading.hall_raw = value;
    }

    /// Set hall values for the first `values.len()` winches in id order.
    pub fn set_halls(&self, values: &[u16]) {
        let mut ids: Vec<u8> = lock(&self.state).winches.keys().copied().collect();
        ids.sort_unstable();
        for (winch, &value) in ids.into_iter().zip(values) {
            self.set_hall(winch, value);
        }
    }

    pub fn hall(&self, winch: u8) -> Option<u16> {
        lock(&self.state).winches.get(&winch).map(|r| r.hall_raw)
    }

    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    /// Flip the checksum of the next reply.
    pub fn corrupt_next_reply(&self) {
        lock(&self.state).corrupt_next = true;
    }

    /// Answer bundle requests for `winch` with a device error `code`.
    pub fn fail_winch(&self, winch: u8, code: u8) {
        lock(&self.state).failing.insert(winch, code);
    }

    pub fn heal_winch(&self, winch: u8) {
        lock(&self.state).failing.remove(&winch);
    }
}

impl Drop for SimBridge {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<BridgeState>>,
    connections: Arc<AtomicUsize>,
) {
    while let Ok((stream, peer)) = listener.accept().await {
        connections.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, "simulated bridge accepted connection");
        tokio::spawn(serve(stream, Arc::clone(&state)));
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<BridgeState>>) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = match Frame::parse_header(&header) {
            Ok((_, len)) => len,
            Err(_) => return,
        };
        let mut bytes = vec![0u8; HEADER_LEN + len + TRAILER_LEN];
        bytes[..HEADER_LEN].copy_from_slice(&header);
        if stream.read_exact(&mut bytes[HEADER_LEN..]).await.is_err() {
            return;
        }

        // Hold the request until un-stalled, or until the client gives up.
        while lock(&state).stalled {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut reply = respond(&bytes, &state).encode();
        if std::mem::take(&mut lock(&state).corrupt_next) {
            if let Some(crc) = reply.last_mut() {
                *crc ^= 0xFF;
            }
        }
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn respond(bytes: &[u8], state: &Mutex<BridgeState>) -> Response {
    let request = match Request::decode(bytes) {
        Ok(r) => r,
        Err(_) => {
            return Response::Error(DeviceFault {
                orig_type: bytes.first().copied().unwrap_or(0),
                winch: 0,
                code: DeviceFault::BAD_LENGTH,
            });
        }
    };

    let mut state = lock(state);
    match request {
        Request::Ping => Response::Pong,
        Request::Bundle { winch } => {
            if let Some(&code) = state.failing.get(&winch) {
                return Response::Error(DeviceFault {
                    orig_type: MessageType::Bundle.into(),
                    winch,
                    code,
                });
            }
            match state.winches.get_mut(&winch) {
                Some(reading) => {
                    reading.age_ms = 4;
                    reading.cache_age_ms = 1;
                    Response::Bundle(*reading)
                }
                None => Response::Error(DeviceFault {
                    orig_type: MessageType::Bundle.into(),
                    winch,
                    code: DeviceFault::COMPACT_TIMEOUT,
                }),
            }
        }
        Request::Imu => Response::Imu(ImuReading {
            accel: [0.0, 0.0, 9.81],
            temp_c: 31.5,
            cache_age_ms: 2,
            ..ImuReading::default()
        }),
        Request::Distance => Response::Distance(DistanceReading {
            ok: 1,
            dist_mm: 1200,
            strength: 900,
            temp_raw: 2400,
            age_ms: 10,
            cache_age_ms: 3,
        }),
    }
}
