//! Resource protection: per-IP connection caps, payload size and memory pressure

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::{PipelineState, client_ip};
use crate::error::ApiError;

#[derive(Debug)]
struct IpSlot {
    in_flight: usize,
    last_seen: Instant,
}

/// In-flight request counts per source IP
#[derive(Clone)]
pub struct ConnectionTracker {
    slots: Arc<Mutex<HashMap<IpAddr, IpSlot>>>,
    max_per_ip: usize,
    max_tracked: usize,
}

fn lock(slots: &Mutex<HashMap<IpAddr, IpSlot>>) -> MutexGuard<'_, HashMap<IpAddr, IpSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionTracker {
    pub fn new(max_per_ip: usize, max_tracked: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip: max_per_ip.max(1),
            max_tracked: max_tracked.max(1),
        }
    }

    /// Reserve an in-flight slot for `ip`. The slot is released when the
    /// returned guard is dropped.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, ApiError> {
        let mut slots = lock(&self.slots);

        if !slots.contains_key(&ip) && slots.len() >= self.max_tracked {
            let before = slots.len();
            slots.retain(|_, slot| slot.in_flight > 0);
            debug!("Evicted {} idle connection entries", before - slots.len());
            if slots.len() >= self.max_tracked {
                warn!("Tracking {} client addresses, rejecting {}", slots.len(), ip);
                return Err(ApiError::ServerBusy);
            }
        }

        let slot = slots.entry(ip).or_insert_with(|| IpSlot {
            in_flight: 0,
            last_seen: Instant::now(),
        });
        if slot.in_flight >= self.max_per_ip {
            warn!(
                "Connection limit reached for {} ({} in flight)",
                ip, slot.in_flight
            );
            return Err(ApiError::TooManyConnections);
        }
        slot.in_flight += 1;
        slot.last_seen = Instant::now();

        Ok(ConnectionGuard {
            slots: Arc::clone(&self.slots),
            ip,
        })
    }

    pub fn in_flight(&self, ip: IpAddr) -> usize {
        lock(&self.slots).get(&ip).map_or(0, |slot| slot.in_flight)
    }

    pub fn tracked_ips(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Drop entries with nothing in flight that have been idle for `max_idle`
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|_, slot| slot.in_flight > 0 || slot.last_seen.elapsed() < max_idle);
        before - slots.len()
    }
}

/// RAII in-flight slot
pub struct ConnectionGuard {
    slots: Arc<Mutex<HashMap<IpAddr, IpSlot>>>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(slot) = lock(&self.slots).get_mut(&self.ip) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            slot.last_seen = Instant::now();
        }
    }
}

/// Source of the process memory usage figure
pub trait MemoryProbe: Send + Sync {
    /// Memory held by this process as a percentage of total, if known
    fn usage_percent(&self) -> Option<f64>;
}

/// Resident set of this process (`/proc/self/status` VmRSS) against
/// `MemTotal`, cached for one second
#[derive(Default)]
pub struct ProcMemoryProbe {
    cached: Mutex<Option<(Instant, Option<f64>)>>,
}

const PROBE_TTL: Duration = Duration::from_secs(1);

impl ProcMemoryProbe {
    fn read() -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        process_usage(&status, &meminfo)
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn usage_percent(&self) -> Option<f64> {
        let mut cached = self.cached.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((at, value)) = *cached
            && at.elapsed() < PROBE_TTL
        {
            return value;
        }
        let value = Self::read();
        *cached = Some((Instant::now(), value));
        value
    }
}

/// `Name:   1234 kB` lookup shared by both proc files
fn kb_field(text: &str, name: &str) -> Option<f64> {
    text.lines()
        .find(|line| line.starts_with(name))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn process_usage(status: &str, meminfo: &str) -> Option<f64> {
    let resident = kb_field(status, "VmRSS:")?;
    let total = kb_field(meminfo, "MemTotal:")?;
    if total <= 0.0 {
        return None;
    }
    Some((resident / total * 100.0).clamp(0.0, 100.0))
}

/// Probe that always reports the same figure
pub struct FixedMemoryProbe(pub Option<f64>);

impl MemoryProbe for FixedMemoryProbe {
    fn usage_percent(&self) -> Option<f64> {
        self.0
    }
}

/// Outermost filter: admission control before any other work is done
pub async fn protect(State(state): State<PipelineState>, req: Request, next: Next) -> Response {
    let ip = client_ip(&req);

    let _guard = match state.connections.try_acquire(ip) {
        Ok(guard) => guard,
        Err(err) => return err.into_response(),
    };

    if let Some(raw) = req.headers().get(CONTENT_LENGTH) {
        let declared = raw.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok());
        match declared {
            None => return ApiError::InvalidContentLength.into_response(),
            Some(len) if len > state.limits.max_payload_bytes as u64 => {
                debug!("Rejecting {} byte payload from {}", len, ip);
                return ApiError::PayloadTooLarge {
                    limit: state.limits.max_payload_bytes,
                }
                .into_response();
            }
            Some(_) => {}
        }
    }

    if let Some(used) = state.memory.usage_percent()
        && used > f64::from(state.limits.memory_threshold_percent)
    {
        warn!(
            "Memory usage {:.1}% above {}%, shedding request",
            used, state.limits.memory_threshold_percent
        );
        return ApiError::MemoryPressure.into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerLimits;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, post};
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_per_ip_cap_and_release() {
        let tracker = ConnectionTracker::new(2, 100);
        let a = tracker.try_acquire(ip(1)).unwrap();
        let _b = tracker.try_acquire(ip(1)).unwrap();
        assert!(matches!(
            tracker.try_acquire(ip(1)),
            Err(ApiError::TooManyConnections)
        ));
        // Other addresses are unaffected
        assert!(tracker.try_acquire(ip(2)).is_ok());

        drop(a);
        assert_eq!(tracker.in_flight(ip(1)), 1);
        assert!(tracker.try_acquire(ip(1)).is_ok());
    }

    #[test]
    fn test_tracked_ip_cap_evicts_idle() {
        let tracker = ConnectionTracker::new(5, 2);
        let held = tracker.try_acquire(ip(1)).unwrap();
        drop(tracker.try_acquire(ip(2)).unwrap());

        // ip(2) is idle and gets evicted to make room
        let _c = tracker.try_acquire(ip(3)).unwrap();
        assert_eq!(tracker.tracked_ips(), 2);

        // Both tracked entries busy: nothing to evict
        assert!(matches!(
            tracker.try_acquire(ip(4)),
            Err(ApiError::ServerBusy)
        ));
        drop(held);
        assert!(tracker.try_acquire(ip(4)).is_ok());
    }

    #[test]
    fn test_evict_idle() {
        let tracker = ConnectionTracker::new(5, 10);
        drop(tracker.try_acquire(ip(1)).unwrap());
        let _busy = tracker.try_acquire(ip(2)).unwrap();
        assert_eq!(tracker.evict_idle(Duration::ZERO), 1);
        assert_eq!(tracker.tracked_ips(), 1);
    }

    #[test]
    fn test_process_usage() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let status = "Name:\tcourier\nVmPeak:\t 9000000 kB\nVmRSS:\t 4000000 kB\n";
        assert_eq!(process_usage(status, meminfo), Some(25.0));
        assert_eq!(process_usage("garbage", meminfo), None);
        assert_eq!(process_usage(status, "MemTotal: 0 kB"), None);
    }

    fn state(limits: ServerLimits, memory: Option<f64>) -> PipelineState {
        PipelineState::new(limits, None).with_memory_probe(Arc::new(FixedMemoryProbe(memory)))
    }

    fn request(method: &str, uri: &str, from: u8) -> Request {
        let mut req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(ip(from), 40000)));
        req
    }

    #[tokio::test]
    async fn test_declared_payload_checks() {
        let limits = ServerLimits {
            max_payload_bytes: 1024,
            ..ServerLimits::default()
        };
        let app = Router::new()
            .route("/upload", post(|| async { "stored" }))
            .layer(from_fn_with_state(state(limits, None), protect));

        let mut req = request("POST", "/upload", 1);
        req.headers_mut().insert(CONTENT_LENGTH, "4096".parse().unwrap());
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut req = request("POST", "/upload", 1);
        req.headers_mut().insert(CONTENT_LENGTH, "lots".parse().unwrap());
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut req = request("POST", "/upload", 1);
        req.headers_mut().insert(CONTENT_LENGTH, "0".parse().unwrap());
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_memory_pressure_sheds_load() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(state(ServerLimits::default(), Some(97.0)), protect));
        let resp = app.clone().oneshot(request("GET", "/", 1)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(state(ServerLimits::default(), None), protect));
        let resp = app.oneshot(request("GET", "/", 1)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_eleventh_connection_rejected_until_one_finishes() {
        let gate = Arc::new(Semaphore::new(0));
        let limits = ServerLimits {
            max_connections_per_ip: 10,
            ..ServerLimits::default()
        };
        let pipeline = state(limits, None);
        let tracker = pipeline.connections.clone();

        let handler_gate = Arc::clone(&gate);
        let app = Router::new()
            .route(
                "/slow",
                get(move || {
                    let gate = Arc::clone(&handler_gate);
                    async move {
                        if let Ok(permit) = gate.acquire().await {
                            permit.forget();
                        }
                        "done"
                    }
                }),
            )
            .layer(from_fn_with_state(pipeline, protect));

        let mut pending = Vec::new();
        for _ in 0..10 {
            let app = app.clone();
            pending.push(tokio::spawn(async move {
                app.oneshot(request("GET", "/slow", 7)).await.unwrap()
            }));
        }
        while tracker.in_flight(ip(7)) < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let resp = app.clone().oneshot(request("GET", "/slow", 7)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Finish one request; the next one is admitted
        gate.add_permits(1);
        while tracker.in_flight(ip(7)) > 9 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let next = {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(request("GET", "/slow", 7)).await.unwrap() })
        };
        gate.add_permits(10);
        assert_eq!(next.await.unwrap().status(), StatusCode::OK);
        for handle in pending {
            assert_eq!(handle.await.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(tracker.in_flight(ip(7)), 0);
    }
}
