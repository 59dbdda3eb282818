//! [`TelemetryLink`] – TCP session to the sensor bridge.
//!
//! Every exchange is one request frame followed by one response frame,
//! bounded by a timeout.  Any failure closes the session; the next use
//! reconnects with a bounded number of attempts, and repeated failed rounds
//! open an exponential backoff window during which requests fail fast.
//! Nothing in here ever blocks a caller indefinitely.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cablebot_protocol::{DecodeError, Frame, HEADER_LEN, Request, Response, TRAILER_LEN};
use cablebot_types::{DistanceReading, ImuReading, SensorBundle, WinchReading};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Receiving side of the bundle feed.  `None` until the first successful
/// poll.
pub type BundleFeed = watch::Receiver<Option<Arc<SensorBundle>>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("sensor bridge did not answer in time")]
    Timeout,

    #[error("sensor bridge connection lost: {0}")]
    ConnectionLost(String),

    #[error("sensor bridge protocol error: {0}")]
    Protocol(String),
}

impl From<DecodeError> for LinkError {
    fn from(e: DecodeError) -> Self {
        LinkError::Protocol(e.to_string())
    }
}

/// Connection state as last observed by the link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHealth {
    pub connected: bool,
    /// Failed exchanges since the last success.
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bridge address, `host:port`.
    pub addr: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Connect attempts per reconnect round.
    pub reconnect_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: f64,
    /// Winches polled for each bundle, in order.
    pub winch_ids: Vec<u8>,
    pub use_imu: bool,
    pub use_distance: bool,
}

impl LinkConfig {
    pub fn new(addr: impl Into<String>, winch_ids: Vec<u8>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(200),
            reconnect_attempts: 2,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_millis(2000),
            backoff_factor: 1.5,
            winch_ids,
            use_imu: true,
            use_distance: false,
        }
    }
}

struct Session {
    stream: Option<TcpStream>,
    /// While set and in the future, reconnects are not attempted.
    retry_at: Option<Instant>,
    next_backoff: Duration,
}

pub struct TelemetryLink {
    config: LinkConfig,
    session: Mutex<Session>,
    seq: AtomicU64,
    feed: watch::Sender<Option<Arc<SensorBundle>>>,
    health: watch::Sender<LinkHealth>,
}

impl TelemetryLink {
    pub fn new(config: LinkConfig) -> Self {
        let session = Session {
            stream: None,
            retry_at: None,
            next_backoff: config.backoff_initial,
        };
        Self {
            config,
            session: Mutex::new(session),
            seq: AtomicU64::new(0),
            feed: watch::Sender::new(None),
            health: watch::Sender::new(LinkHealth::default()),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Open the session.  A no-op when already connected.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut session = self.session.lock().await;
        self.ensure_connected(&mut session).await
    }

    pub fn is_connected(&self) -> bool {
        self.health.borrow().connected
    }

    /// Most recent bundle, if any poll has succeeded yet.
    pub fn latest(&self) -> Option<Arc<SensorBundle>> {
        self.feed.borrow().clone()
    }

    /// Age of [`latest`](Self::latest).
    pub fn last_bundle_age(&self) -> Option<Duration> {
        self.feed.borrow().as_ref().map(|b| b.age())
    }

    /// A receiver on the bundle feed.
    pub fn subscribe(&self) -> BundleFeed {
        self.feed.subscribe()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<LinkHealth> {
        self.health.subscribe()
    }

    /// One exchange with the configured request timeout.
    pub async fn request(&self, request: Request) -> Result<Response, LinkError> {
        self.request_with_timeout(request, self.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, LinkError> {
        let mut session = self.session.lock().await;
        let result = self.exchange(&mut session, request, timeout).await;
        self.record(&result);
        result
    }

    /// Poll every configured winch (and the IMU / range finder when
    /// enabled), publish the assembled bundle on the feed and return it.
    ///
    /// All-or-nothing: if any exchange fails, nothing is published.
    pub async fn request_bundle(&self) -> Result<Arc<SensorBundle>, LinkError> {
        let result = {
            let mut session = self.session.lock().await;
            self.poll(&mut session).await
        };
        self.record(&result);
        let bundle = Arc::new(result?);
        self.feed.send_replace(Some(Arc::clone(&bundle)));
        Ok(bundle)
    }

    /// Poll the bridge every `interval` on a background task.  Failures are
    /// reflected in [`LinkHealth`]; the task runs until aborted.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, addr = %link.config.addr, "telemetry poller started");
            loop {
                ticker.tick().await;
                if let Err(e) = link.request_bundle().await {
                    debug!(error = %e, "telemetry poll failed");
                }
            }
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // Session handling
    // ────────────────────────────────────────────────────────────────────

    async fn ensure_connected(&self, session: &mut Session) -> Result<(), LinkError> {
        if session.stream.is_some() {
            return Ok(());
        }
        if let Some(at) = session.retry_at {
            let now = Instant::now();
            if now < at {
                return Err(LinkError::ConnectionLost(format!(
                    "reconnect backoff, next attempt in {} ms",
                    (at - now).as_millis()
                )));
            }
        }

        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(&self.config.addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    // Request/response frames are tiny; don't let Nagle hold them.
                    let _ = stream.set_nodelay(true);
                    session.stream = Some(stream);
                    session.retry_at = None;
                    session.next_backoff = self.config.backoff_initial;
                    info!(addr = %self.config.addr, attempt, "connected to sensor bridge");
                    self.health.send_if_modified(|h| !std::mem::replace(&mut h.connected, true));
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            debug!(addr = %self.config.addr, attempt, error = %last_error, "connect attempt failed");
        }

        let backoff = session.next_backoff;
        session.retry_at = Some(Instant::now() + backoff);
        session.next_backoff =
            grow_backoff(backoff, self.config.backoff_factor, self.config.backoff_max);
        warn!(
            addr = %self.config.addr,
            attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %last_error,
            "sensor bridge unreachable"
        );
        Err(LinkError::ConnectionLost(last_error))
    }

    async fn exchange(
        &self,
        session: &mut Session,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, LinkError> {
        self.ensure_connected(session).await?;
        let Some(stream) = session.stream.as_mut() else {
            return Err(LinkError::ConnectionLost("not connected".to_string()));
        };

        let result = match tokio::time::timeout(timeout, round_trip(stream, request)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };
        if result.is_err() {
            // The stream may be mid-frame; resynchronise by reconnecting.
            session.stream = None;
            self.health.send_if_modified(|h| std::mem::replace(&mut h.connected, false));
        }
        result
    }

    async fn poll(&self, session: &mut Session) -> Result<SensorBundle, LinkError> {
        let mut winches = Vec::with_capacity(self.config.winch_ids.len());
        for &winch in &self.config.winch_ids {
            let request = Request::Bundle { winch };
            let response = self
                .exchange(session, request, self.config.request_timeout)
                .await?;
            winches.push(expect_winch(response, winch)?);
        }

        let imu = if self.config.use_imu {
            let response = self
                .exchange(session, Request::Imu, self.config.request_timeout)
                .await?;
            Some(expect_imu(response)?)
        } else {
            None
        };

        let distance = if self.config.use_distance {
            let response = self
                .exchange(session, Request::Distance, self.config.request_timeout)
                .await?;
            Some(expect_distance(response)?)
        } else {
            None
        };

        Ok(SensorBundle {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            captured_at: std::time::Instant::now(),
            winches,
            imu,
            distance,
        })
    }

    fn record<T>(&self, result: &Result<T, LinkError>) {
        match result {
            Ok(_) => {
                let recovered = self.health.borrow().consecutive_failures > 0;
                self.health.send_if_modified(|h| {
                    let changed = !h.connected || h.consecutive_failures != 0;
                    h.connected = true;
                    h.consecutive_failures = 0;
                    changed
                });
                if recovered {
                    info!("sensor bridge link recovered");
                }
            }
            Err(e) => {
                let first = self.health.borrow().consecutive_failures == 0;
                self.health.send_modify(|h| {
                    h.connected = false;
                    h.consecutive_failures = h.consecutive_failures.saturating_add(1);
                    h.total_failures += 1;
                    h.last_error = Some(e.to_string());
                });
                if first {
                    warn!(error = %e, "sensor bridge exchange failed");
                }
            }
        }
    }
}

async fn round_trip(stream: &mut TcpStream, request: Request) -> Result<Response, LinkError> {
    let lost = |e: std::io::Error| LinkError::ConnectionLost(e.to_string());

    stream.write_all(&request.encode()).await.map_err(lost)?;

    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.map_err(lost)?;
    let (_, len) = Frame::parse_header(&header)?;

    let mut bytes = vec![0u8; HEADER_LEN + len + TRAILER_LEN];
    bytes[..HEADER_LEN].copy_from_slice(&header);
    stream
        .read_exact(&mut bytes[HEADER_LEN..])
        .await
        .map_err(lost)?;

    Ok(Response::decode(&bytes)?)
}

fn expect_winch(response: Response, winch: u8) -> Result<WinchReading, LinkError> {
    match response {
        Response::Bundle(r) if r.winch == winch => Ok(r),
        Response::Bundle(r) => Err(LinkError::Protocol(format!(
            "asked for winch {winch}, bridge answered for winch {}",
            r.winch
        ))),
        other => Err(unexpected(other, "bundle")),
    }
}

fn expect_imu(response: Response) -> Result<ImuReading, LinkError> {
    match response {
        Response::Imu(r) => Ok(r),
        other => Err(unexpected(other, "imu")),
    }
}

fn expect_distance(response: Response) -> Result<DistanceReading, LinkError> {
    match response {
        Response::Distance(r) => Ok(r),
        other => Err(unexpected(other, "distance")),
    }
}

fn unexpected(response: Response, wanted: &str) -> LinkError {
    match response {
        Response::Error(fault) => LinkError::Protocol(fault.to_string()),
        other => LinkError::Protocol(format!(
            "expected {wanted} response, got {:?}",
            other.message_type()
        )),
    }
}

/// Next backoff window.  A factor that does not yield a representable
/// duration (infinite, NaN, negative) saturates at `max`.
fn grow_backoff(current: Duration, factor: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * factor)
        .map_or(max, |next| next.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBridge;

    async fn link_to(bridge: &SimBridge) -> TelemetryLink {
        let mut config = LinkConfig::new(bridge.addr().to_string(), vec![1, 2, 3, 4]);
        config.request_timeout = Duration::from_millis(100);
        config.backoff_initial = Duration::from_millis(50);
        TelemetryLink::new(config)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let bridge = SimBridge::start(&[1, 2, 3, 4]).await.unwrap();
        let link = link_to(&bridge).await;
        link.connect().await.unwrap();
        link.connect().await.unwrap();
        assert!(link.is_connected());
        assert_eq!(bridge.connections(), 1);
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let bridge = SimBridge::start(&[1]).await.unwrap();
        let link = link_to(&bridge).await;
        assert_eq!(link.request(Request::Ping).await.unwrap(), Response::Pong);
    }

    #[tokio::test]
    async fn bundle_is_published_on_feed() {
        let bridge = SimBridge::start(&[1, 2, 3, 4]).await.unwrap();
        bridge.set_halls(&[1600, 1550, 1520, 1700]);
        let link = link_to(&bridge).await;
        let mut feed = link.subscribe();
        assert!(link.latest().is_none());

        let bundle = link.request_bundle().await.unwrap();
        assert_eq!(bundle.seq, 1);
        assert_eq!(bundle.hall_values().collect::<Vec<_>>(), vec![1600, 1550, 1520, 1700]);
        assert!(bundle.imu.is_some());
        assert!(bundle.distance.is_none());

        assert!(feed.has_changed().unwrap());
        let published = feed.borrow_and_update().clone().unwrap();
        assert_eq!(published.seq, 1);
        assert!(link.last_bundle_age().unwrap() < Duration::from_secs(1));

        let second = link.request_bundle().await.unwrap();
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn stalled_bridge_times_out_and_recovers() {
        let bridge = SimBridge::start(&[1, 2, 3, 4]).await.unwrap();
        let link = link_to(&bridge).await;
        link.request_bundle().await.unwrap();

        bridge.set_stalled(true);
        assert_eq!(link.request_bundle().await.unwrap_err(), LinkError::Timeout);
        assert!(!link.is_connected());
        // The failed poll left the previous bundle in place.
        assert_eq!(link.latest().unwrap().seq, 1);

        bridge.set_stalled(false);
        let bundle = link.request_bundle().await.unwrap();
        assert_eq!(bundle.seq, 2);
        assert!(link.is_connected());
        assert_eq!(bridge.connections(), 2);
    }

    #[tokio::test]
    async fn corrupted_reply_is_a_protocol_error() {
        let bridge = SimBridge::start(&[1, 2, 3, 4]).await.unwrap();
        let link = link_to(&bridge).await;
        bridge.corrupt_next_reply();
        let err = link.request_bundle().await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)), "{err:?}");
        assert!(link.latest().is_none());
    }

    #[tokio::test]
    async fn device_error_is_a_protocol_error() {
        let bridge = SimBridge::start(&[1, 2, 3, 4]).await.unwrap();
        let link = link_to(&bridge).await;
        bridge.fail_winch(3, cablebot_protocol::DeviceFault::COMPACT_TIMEOUT);
        let err = link.request_bundle().await.unwrap_err();
        match err {
            LinkError::Protocol(msg) => assert!(msg.contains("winch 3"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_bridge_backs_off() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut config = LinkConfig::new(addr.to_string(), vec![1]);
        config.backoff_initial = Duration::from_secs(30);
        let link = TelemetryLink::new(config);

        assert!(matches!(
            link.connect().await,
            Err(LinkError::ConnectionLost(_))
        ));
        match link.connect().await {
            Err(LinkError::ConnectionLost(msg)) => assert!(msg.contains("backoff"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn backoff_grows_and_saturates() {
        let max = Duration::from_millis(2000);
        let grown = grow_backoff(Duration::from_millis(200), 1.5, max);
        assert_eq!(grown.as_millis(), 300);
        assert_eq!(grow_backoff(Duration::from_millis(1800), 1.5, max), max);
        for factor in [f64::INFINITY, f64::NAN, -1.0] {
            assert_eq!(grow_backoff(Duration::from_millis(200), factor, max), max);
        }
    }

    #[tokio::test]
    async fn infinite_backoff_factor_does_not_panic() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut config = LinkConfig::new(addr.to_string(), vec![1]);
        config.backoff_factor = f64::INFINITY;
        let link = TelemetryLink::new(config);
        assert!(matches!(
            link.connect().await,
            Err(LinkError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn health_tracks_failures() {
        let bridge = SimBridge::start(&[1]).await.unwrap();
        let link = link_to(&bridge).await;
        let health = link.subscribe_health();

        link.request_bundle().await.unwrap();
        assert!(health.borrow().connected);

        bridge.set_stalled(true);
        let _ = link.request_bundle().await;
        {
            let h = health.borrow();
            assert!(!h.connected);
            assert_eq!(h.consecutive_failures, 1);
            assert_eq!(h.total_failures, 1);
            assert!(h.last_error.is_some());
        }

        bridge.set_stalled(false);
        link.request_bundle().await.unwrap();
        assert_eq!(health.borrow().consecutive_failures, 0);
        assert_eq!(health.borrow().total_failures, 1);
    }

    #[tokio::test]
    async fn poller_keeps_feed_fresh() {
        let bridge = SimBridge::start(&[1, 2]).await.unwrap();
        let mut config = LinkConfig::new(bridge.addr().to_string(), vec![1, 2]);
        config.use_imu = false;
        let link = Arc::new(TelemetryLink::new(config));
        let mut feed = link.subscribe();

        let poller = link.spawn_poller(Duration::from_millis(10));
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), feed.changed())
                .await
                .unwrap()
                .unwrap();
        }
        poller.abort();
        assert!(link.latest().unwrap().seq >= 3);
    }
}
