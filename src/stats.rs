use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::HeaderMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;

use crate::constants;

const WINDOW_SPAN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub id: u64,
    pub method: String,
    pub uri: String,
    pub range: Option<String>,
    pub started_at: Instant,
}

#[derive(Debug)]
pub struct Stats {
    started_at: Instant,
    total_requests: AtomicU64,
    range_requests: AtomicU64,
    total_bytes: AtomicU64,
    next_id: AtomicU64,
    window: Mutex<VecDeque<(Instant, u64)>>,
    active: Mutex<HashMap<u64, ActiveRequest>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            range_requests: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            window: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(
        self: &Arc<Self>,
        method: &http::Method,
        uri: &http::Uri,
        range: Option<&str>,
    ) -> RequestGuard {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ActiveRequest {
            id,
            method: method.to_string(),
            uri: uri.to_string(),
            range: range.map(|v| v.to_string()),
            started_at: Instant::now(),
        };
        self.active.lock().expect("active table lock").insert(id, entry);
        RequestGuard {
            stats: Arc::clone(self),
            id,
        }
    }

    pub fn record_range_request(&self) {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let now = Instant::now();
        let mut window = self.window.lock().expect("throughput window lock");
        window.push_back((now, bytes));
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > WINDOW_SPAN {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_speed(&self) -> f64 {
        let now = Instant::now();
        let mut window = self.window.lock().expect("throughput window lock");
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > WINDOW_SPAN {
                window.pop_front();
            } else {
                break;
            }
        }
        let Some((oldest, _)) = window.front() else {
            return 0.0;
        };
        let sum: u64 = window.iter().map(|(_, bytes)| bytes).sum();
        let span = now.duration_since(*oldest).as_secs_f64().max(0.001);
        sum as f64 / span
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active table lock").len()
    }

    pub fn snapshot(&self, cache: CacheStats) -> StatsSnapshot {
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let speed = self.current_speed();
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_requests: self.active_count(),
            total_bytes_transferred: total_bytes,
            current_speed: speed,
            range_requests: self.range_requests.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed().as_millis() as u64,
            formatted_speed: format!("{}/s", format_bytes(speed as u64)),
            formatted_total: format_bytes(total_bytes),
            cache,
        }
    }

    fn release(&self, id: u64) {
        self.active.lock().expect("active table lock").remove(&id);
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the active-request entry on drop, on every exit path.
#[derive(Debug)]
pub struct RequestGuard {
    stats: Arc<Stats>,
    id: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.stats.release(self.id);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub active_requests: usize,
    pub total_bytes_transferred: u64,
    pub current_speed: f64,
    pub range_requests: u64,
    pub uptime: u64,
    pub formatted_speed: String,
    pub formatted_total: String,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub metadata_entries: usize,
    pub redirect_entries: usize,
    pub segment_entries: usize,
    pub segment_bytes: u64,
    pub hit_rate: f64,
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
