// webserver.rs

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use askama::Template;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
pub use axum_macros::debug_handler;
use futures::Stream;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use log::*;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower::ServiceExt as _;

use crate::{
    CacheSnapshot, FW_VERSION, MyState, OperatingMode, PowerState, PublisherReport, Quantity,
    SessionError, SessionId, WakeSource, WallClock,
};

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    refresh_interval_s: u64,
    version: &'static str,
}

/// Router state: the shared context plus the dashboard page, rendered once
/// and served from the same buffer to every client.
#[derive(Clone)]
pub struct WebContext {
    pub state: Arc<MyState>,
    dashboard: Bytes,
}

impl WebContext {
    pub fn new(state: Arc<MyState>) -> anyhow::Result<Self> {
        let page = DashboardTemplate {
            refresh_interval_s: state.config.web.refresh_interval_s,
            version: FW_VERSION,
        }
        .render()
        .context("dashboard template render")?;
        Ok(Self {
            state,
            dashboard: Bytes::from(page),
        })
    }
}

/// Finite, non-restartable chunk producer for one response body.
///
/// Slices the payload into `chunk_size` frames on demand, so the
/// per-connection buffer is one chunk regardless of payload size, and
/// checks the response deadline each time the transport asks for more.
/// Once consumed it cannot be replayed; an abandoned stream is simply
/// dropped with the connection.
pub struct ChunkStream {
    data: Bytes,
    pos: usize,
    chunk_size: usize,
    deadline: Instant,
}

impl ChunkStream {
    pub fn new(data: Bytes, chunk_size: usize, deadline: Instant) -> Self {
        Self {
            data,
            pos: 0,
            chunk_size: chunk_size.max(1),
            deadline,
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.pos >= this.data.len() {
            return Poll::Ready(None);
        }
        if Instant::now() > this.deadline {
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "response timed out",
            ))));
        }
        let end = (this.pos + this.chunk_size).min(this.data.len());
        let chunk = this.data.slice(this.pos..end);
        this.pos = end;
        Poll::Ready(Some(Ok(chunk)))
    }
}

fn chunked_response(
    ctx: &WebContext,
    status: StatusCode,
    content_type: &'static str,
    data: Bytes,
) -> Response {
    let cfg = &ctx.state.config.web;
    let deadline = Instant::now() + Duration::from_secs(cfg.response_timeout_s.max(1));
    let stream = ChunkStream::new(data, cfg.chunk_size, deadline);
    (
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

fn json_response<T: Serialize>(ctx: &WebContext, status: StatusCode, payload: &T) -> Response {
    match serde_json::to_vec(payload) {
        Ok(body) => chunked_response(ctx, status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!("JSON encode error: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "encode error").into_response()
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SensorReport {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub temp_timestamp: Option<i64>,
    pub pm1: Option<f32>,
    pub pm25: Option<f32>,
    pub pm10: Option<f32>,
    pub pm_timestamp: Option<i64>,
    pub tvoc: Option<f32>,
    pub eco2: Option<f32>,
    pub aqi_pm25: Option<f32>,
    pub aqi_tvoc: Option<f32>,
    pub battery_voltage: Option<f32>,
    pub battery_percent: Option<f32>,
    pub battery_timestamp: Option<i64>,
}

impl SensorReport {
    fn from_snapshot(snap: &CacheSnapshot, clock: &WallClock) -> Self {
        let epoch = |q: Quantity| {
            let e = snap.entry(q);
            e.valid.then(|| clock.to_epoch(e.timestamp))
        };
        Self {
            temperature: snap.value(Quantity::Temperature),
            humidity: snap.value(Quantity::Humidity),
            temp_timestamp: epoch(Quantity::Temperature),
            pm1: snap.value(Quantity::Pm1),
            pm25: snap.value(Quantity::Pm25),
            pm10: snap.value(Quantity::Pm10),
            pm_timestamp: epoch(Quantity::Pm25),
            tvoc: snap.value(Quantity::Tvoc),
            eco2: snap.value(Quantity::Eco2),
            aqi_pm25: snap.value(Quantity::AqiPm25),
            aqi_tvoc: snap.value(Quantity::AqiTvoc),
            battery_voltage: snap.value(Quantity::BatteryVoltage),
            battery_percent: snap.value(Quantity::BatteryPercent),
            battery_timestamp: epoch(Quantity::BatteryVoltage),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemReport {
    pub version: &'static str,
    pub mode: OperatingMode,
    pub uptime: u64,
    pub uptime_s: String,
    pub power_state: PowerState,
    pub display_on: bool,
    pub sensor_powered: bool,
    pub idle_s: u64,
    pub clock_synced: bool,
    pub local_time: String,
    pub active_sessions: usize,
    pub free_memory_kb: Option<u64>,
    pub used_memory_kb: Option<u64>,
    pub api_requests: u64,
    pub publisher: PublisherReport,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct WakeReply {
    pub status: &'static str,
    pub session: SessionId,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct HeartbeatReply {
    pub status: &'static str,
    pub active_sessions: usize,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ErrorReply {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub session: SessionId,
}

pub fn router(ctx: WebContext) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route("/api/data", get(get_data))
        .route("/api/system", get(get_system))
        .route("/api/wake", post(post_wake))
        .route("/api/heartbeat", post(post_heartbeat))
        .with_state(ctx)
}

pub async fn get_index(State(ctx): State<WebContext>) -> Response {
    let cnt = ctx.state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_index()");

    chunked_response(
        &ctx,
        StatusCode::OK,
        "text/html; charset=utf-8",
        ctx.dashboard.clone(),
    )
}

pub async fn get_data(State(ctx): State<WebContext>) -> Response {
    let cnt = ctx.state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_data()");

    let report =
        SensorReport::from_snapshot(&ctx.state.cache.snapshot(), &ctx.state.wall_clock);
    json_response(&ctx, StatusCode::OK, &report)
}

pub async fn get_system(State(ctx): State<WebContext>) -> Response {
    let cnt = ctx.state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} get_system()");

    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let now = Instant::now();
    let state = &ctx.state;
    let report = SystemReport {
        version: FW_VERSION,
        mode: state.config.mode,
        uptime: state.uptime().as_secs(),
        uptime_s: format_uptime(state.uptime()),
        power_state: state.power.state(),
        display_on: state.power.display_on(),
        sensor_powered: state.power.sensor_powered(),
        idle_s: state.power.idle_time(now).as_secs(),
        clock_synced: state.wall_clock.is_synced(),
        local_time: state.wall_clock.now_local(),
        active_sessions: state.sessions.active_count(now),
        free_memory_kb: Some(sys.available_memory() / 1024),
        used_memory_kb: Some(sys.used_memory() / 1024),
        api_requests: cnt + 1,
        publisher: state.publisher.report(),
    };
    json_response(&ctx, StatusCode::OK, &report)
}

pub async fn post_wake(
    State(ctx): State<WebContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let cnt = ctx.state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} post_wake() from {addr}");

    let now = Instant::now();
    ctx.state.power.wake(WakeSource::Web, now);
    match ctx.state.sessions.start_session(addr.ip(), now) {
        Ok(session) => json_response(
            &ctx,
            StatusCode::OK,
            &WakeReply {
                status: "ok",
                session,
                timestamp: ctx.state.wall_clock.now_epoch(),
            },
        ),
        Err(SessionError::TableFull) | Err(SessionError::UnknownSession) => {
            warn!("Session table full, rejecting {addr}");
            json_response(
                &ctx,
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorReply {
                    status: "error",
                    message: "session table full",
                },
            )
        }
    }
}

pub async fn post_heartbeat(
    State(ctx): State<WebContext>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    let cnt = ctx.state.api_cnt.fetch_add(1, Ordering::Relaxed);
    info!("#{cnt} post_heartbeat() session {}", req.session);

    let now = Instant::now();
    match ctx.state.sessions.heartbeat(req.session, now) {
        Ok(()) => json_response(
            &ctx,
            StatusCode::OK,
            &HeartbeatReply {
                status: "ok",
                active_sessions: ctx.state.sessions.active_count(now),
                timestamp: ctx.state.wall_clock.now_epoch(),
            },
        ),
        Err(_) => json_response(
            &ctx,
            StatusCode::NOT_FOUND,
            &ErrorReply {
                status: "error",
                message: "unknown session",
            },
        ),
    }
}

fn format_uptime(d: Duration) -> String {
    let total = d.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let (h, rest) = (rest / 3_600, rest % 3_600);
    let (m, s) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

/// Bind and serve until stopped. Disabled config parks the task so the
/// main select loop keeps running.
pub async fn run_webserver(state: Arc<MyState>) -> anyhow::Result<()> {
    if !state.config.web.enabled {
        info!("Web server is disabled.");
        state.stop.wait().await;
        return Ok(());
    }

    let listen = format!("0.0.0.0:{}", state.config.web.port);
    let listener = TcpListener::bind(&listen).await?;
    info!("Web server listening on {listen}");
    serve_connections(state, listener).await
}

/// Accept loop with a hard cap on concurrent connections. At capacity a new
/// connection is dropped on the spot, never queued; each accepted one holds
/// a slot permit for its whole life, so abandonment frees the slot
/// immediately via RAII.
pub async fn serve_connections(state: Arc<MyState>, listener: TcpListener) -> anyhow::Result<()> {
    let app = router(WebContext::new(state.clone())?);
    let max_connections = state.config.web.max_connections.max(1);
    let slots = Arc::new(Semaphore::new(max_connections));
    let timeout = Duration::from_secs(state.config.web.response_timeout_s.max(1));

    loop {
        let (socket, peer) = tokio::select! {
            r = listener.accept() => r?,
            _ = state.stop.wait() => return Ok(()),
        };

        let Ok(permit) = slots.clone().try_acquire_owned() else {
            info!("Connection from {peer} rejected: at capacity ({max_connections})");
            drop(socket);
            continue;
        };

        let app = app.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let io = TokioIo::new(socket);
            let service = hyper::service::service_fn(move |mut req: axum::http::Request<Incoming>| {
                req.extensions_mut().insert(ConnectInfo(peer));
                app.clone().oneshot(req)
            });
            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
            match tokio::time::timeout(timeout, conn).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Connection from {peer} closed: {e}"),
                Err(_) => warn!("Response to {peer} timed out, dropping connection"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostPowerSwitch, MyConfig};
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn chunk_stream_yields_fixed_frames() {
        let data = Bytes::from(vec![7u8; 1300]);
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut stream = ChunkStream::new(data, 512, deadline);

        let mut sizes = Vec::new();
        while let Some(chunk) = stream.next().await {
            sizes.push(chunk.unwrap().len());
        }
        assert_eq!(sizes, vec![512, 512, 276]);

        // non-restartable: a drained stream stays drained
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn chunk_stream_errors_past_deadline() {
        let data = Bytes::from(vec![7u8; 64]);
        let deadline = Instant::now() - Duration::from_secs(1);
        let mut stream = ChunkStream::new(data, 16, deadline);

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    fn test_state(max_connections: usize) -> Arc<MyState> {
        let mut config = MyConfig::default();
        config.web.max_connections = max_connections;
        config.web.response_timeout_s = 5;
        Arc::new(MyState::new(config, Box::new(HostPowerSwitch::new())))
    }

    #[tokio::test]
    async fn third_concurrent_connection_is_rejected() {
        let state = test_state(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_connections(state.clone(), listener));

        // two clients connect and sit on half-written requests
        let mut c1 = TcpStream::connect(addr).await.unwrap();
        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(b"GET / HTT").await.unwrap();
        c2.write_all(b"GET / HTT").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the third is dropped immediately, not queued
        let mut c3 = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), c3.read(&mut buf))
            .await
            .expect("rejection must be immediate")
            .unwrap();
        assert_eq!(n, 0, "rejected connection closes without a response");

        // freeing a slot lets the next client in
        drop(c1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut c4 = TcpStream::connect(addr).await.unwrap();
        c4.write_all(b"GET /api/system HTTP/1.1\r\nhost: t\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), c4.read(&mut buf))
                .await
                .expect("response must arrive")
                .unwrap();
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
            if reply.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&reply);
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        state.stop.stop();
        drop(c2);
        server.await.unwrap().unwrap();
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_uptime(Duration::from_secs(3_661)), "01:01:01");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 01:01:01");
    }
}

// EOF
