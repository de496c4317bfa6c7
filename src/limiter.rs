//! Per-client and per-path admission limiters (spec §4.4).
//!
//! Grounded in `original_source/cdn/limits.go` (the canonical, more-correct
//! sibling of `cdn/zone.go`'s duplicate types — this file's reset semantics
//! match the spec exactly, see DESIGN.md) and
//! `cdn/limits/access-limit.go`. Each limiter kind lives in its own
//! zone-wide map; the map mutex is held only for get-or-create, never
//! across the admission check itself (spec §5).

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::{ConnectionLimitConfig, RequestLimitConfig};

struct AccessLimitState {
    expire_time: Option<SystemTime>,
    gone: bool,
    cap_enabled: bool,
    accesses_remaining: u32,
}

/// Per-path object lifecycle, independent of whether the backend still has
/// the object (spec §3, §4.4).
pub struct AccessLimit {
    inner: Mutex<AccessLimitState>,
}

impl AccessLimit {
    pub fn new(ttl: Duration, cap: u32) -> Self {
        let expire_time = if ttl.is_zero() {
            None
        } else {
            Some(SystemTime::now() + ttl)
        };
        Self {
            inner: Mutex::new(AccessLimitState {
                expire_time,
                gone: false,
                cap_enabled: cap != 0,
                accesses_remaining: cap,
            }),
        }
    }

    pub fn is_gone(&self) -> bool {
        self.inner.lock().gone
    }

    /// Monotonic false -> true; never reverts.
    pub fn mark_gone(&self) {
        self.inner.lock().gone = true;
    }

    pub fn is_expired(&self) -> bool {
        match self.inner.lock().expire_time {
            Some(t) => SystemTime::now() >= t,
            None => false,
        }
    }

    pub fn expire_time_absolute(&self) -> Option<SystemTime> {
        self.inner.lock().expire_time
    }

    /// Decrements the remaining-access counter and returns `true` if the
    /// cap was already depleted (the caller should refuse the request).
    /// A disabled cap (0) never reports depletion.
    pub fn consume_access(&self) -> bool {
        let mut state = self.inner.lock();
        if !state.cap_enabled {
            return false;
        }
        if state.accesses_remaining == 0 {
            return true;
        }
        state.accesses_remaining -= 1;
        false
    }
}

struct RequestLimitState {
    expire_time: Instant,
    requests_remaining: u32,
}

/// Token-bucket request-rate limiter (spec §4.4). The window reset is
/// "leaky": it does not wait for a fresh window to begin before admitting
/// the request that triggers the reset — preserved intentionally (spec
/// §9(c)); `cdn/zone.go`'s duplicate of this type additionally forgets to
/// advance `expire_time` on reset, which would make every subsequent
/// request reset the window again. That omission is not replicated here.
pub struct RequestLimit {
    inner: Mutex<RequestLimitState>,
    max_requests: u32,
    interval: Duration,
}

impl RequestLimit {
    pub fn new(max_requests: u32, interval: Duration) -> Self {
        Self {
            inner: Mutex::new(RequestLimitState {
                expire_time: Instant::now() + interval,
                requests_remaining: max_requests,
            }),
            max_requests,
            interval,
        }
    }

    pub fn try_admit(&self) -> bool {
        let mut state = self.inner.lock();
        let now = Instant::now();
        if state.expire_time > now {
            if state.requests_remaining == 0 {
                false
            } else {
                state.requests_remaining -= 1;
                true
            }
        } else {
            state.expire_time = now + self.interval;
            state.requests_remaining = self.max_requests.saturating_sub(1);
            true
        }
    }
}

/// Per-client connection-count limiter with scoped acquisition (spec §4.4):
/// every admitted connection is paired with a release on every exit path,
/// including an early return or a panic, via [`ConnectionGuard`]'s `Drop`.
pub struct ConnectionLimit {
    remaining: Mutex<u32>,
    max_connections: u32,
}

impl ConnectionLimit {
    pub fn new(max_connections: u32) -> Self {
        Self {
            remaining: Mutex::new(max_connections),
            max_connections,
        }
    }

    fn try_open(&self) -> bool {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            false
        } else {
            *remaining -= 1;
            true
        }
    }

    fn close(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining < self.max_connections {
            *remaining += 1;
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        if self.try_open() {
            Some(ConnectionGuard {
                limit: self.clone(),
            })
        } else {
            None
        }
    }
}

pub struct ConnectionGuard {
    limit: Arc<ConnectionLimit>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limit.close();
    }
}

/// Per-zone maps of the three per-client limiter kinds, each get-or-create
/// under its own mutex (spec §5). Entries are never removed except for
/// access limits (purged alongside their object).
pub struct ZoneLimiters {
    access: Mutex<FxHashMap<String, Arc<AccessLimit>>>,
    requests: Mutex<FxHashMap<String, Arc<RequestLimit>>>,
    connections: Mutex<FxHashMap<String, Arc<ConnectionLimit>>>,
}

impl ZoneLimiters {
    pub fn new() -> Self {
        Self {
            access: Mutex::new(FxHashMap::default()),
            requests: Mutex::new(FxHashMap::default()),
            connections: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn access_for(&self, path: &str, ttl: Duration, cap: u32) -> Arc<AccessLimit> {
        let mut map = self.access.lock();
        map.entry(path.to_string())
            .or_insert_with(|| Arc::new(AccessLimit::new(ttl, cap)))
            .clone()
    }

    pub fn drop_access(&self, path: &str) {
        self.access.lock().remove(path);
    }

    pub fn request_for(&self, client_ip: &str, cfg: &RequestLimitConfig) -> Option<Arc<RequestLimit>> {
        if !cfg.is_valid() {
            return None;
        }
        let mut map = self.requests.lock();
        Some(
            map.entry(client_ip.to_string())
                .or_insert_with(|| Arc::new(RequestLimit::new(cfg.max_requests, cfg.request_rate_interval)))
                .clone(),
        )
    }

    pub fn connection_for(&self, client_ip: &str, cfg: &ConnectionLimitConfig) -> Option<Arc<ConnectionLimit>> {
        if !cfg.is_valid() {
            return None;
        }
        let mut map = self.connections.lock();
        Some(
            map.entry(client_ip.to_string())
                .or_insert_with(|| Arc::new(ConnectionLimit::new(cfg.max_connections)))
                .clone(),
        )
    }
}

impl Default for ZoneLimiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_limit_depletes_then_stays_depleted() {
        let limit = AccessLimit::new(Duration::ZERO, 2);
        assert!(!limit.consume_access());
        assert!(!limit.consume_access());
        assert!(limit.consume_access());
        assert!(limit.consume_access());
    }

    #[test]
    fn access_limit_unlimited_never_depletes() {
        let limit = AccessLimit::new(Duration::ZERO, 0);
        for _ in 0..1000 {
            assert!(!limit.consume_access());
        }
    }

    #[test]
    fn access_limit_gone_is_monotonic() {
        let limit = AccessLimit::new(Duration::ZERO, 0);
        assert!(!limit.is_gone());
        limit.mark_gone();
        assert!(limit.is_gone());
        limit.mark_gone();
        assert!(limit.is_gone());
    }

    #[test]
    fn request_limit_admits_up_to_cap_then_refuses() {
        let limit = RequestLimit::new(3, Duration::from_secs(60));
        assert!(limit.try_admit());
        assert!(limit.try_admit());
        assert!(limit.try_admit());
        assert!(!limit.try_admit());
    }

    #[test]
    fn request_limit_resets_after_interval_and_admits_immediately() {
        let limit = RequestLimit::new(1, Duration::from_millis(20));
        assert!(limit.try_admit());
        assert!(!limit.try_admit());
        std::thread::sleep(Duration::from_millis(30));
        // leaky reset: the triggering request is admitted without waiting
        // for a fresh window to complete first.
        assert!(limit.try_admit());
    }

    #[test]
    fn connection_guard_releases_on_drop() {
        let limit = Arc::new(ConnectionLimit::new(1));
        {
            let _g = limit.try_acquire().expect("should admit first connection");
            assert!(limit.try_acquire().is_none());
        }
        assert!(limit.try_acquire().is_some());
    }
}
