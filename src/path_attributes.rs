//! Path attributes snapshot cache (spec §3, §4.6 step 2; "C6").
//!
//! Grounded in `original_source/cdn/zone.go`'s `pathAttributes` map and
//! `cdn/zone-path-attributes.go`. Used exclusively for short-circuit
//! responses while the request-rate limiter is refusing a client: the zone
//! handler needs *some* validators to run the precondition engine against
//! even though it never reached the backend for this request.

use std::sync::Mutex;
use std::time::SystemTime;

use rustc_hash::FxHashMap;

/// Last observed response headers for a path, snapshotted after a successful
/// `GET`/`HEAD` when `requestLimitedCacheCheck` is enabled (spec §3).
#[derive(Clone, Debug)]
pub struct PathAttributes {
    pub last_modified_time: SystemTime,
    pub etag: String,
    pub content_length: u64,
    pub content_type: String,
    pub cache_control: String,
    pub age: String,
    pub expires: String,
    pub not_expunged: bool,
}

/// Per-zone map of [`PathAttributes`], get-or-create under one mutex (spec
/// §5) — entries are small and short-lived enough that a per-entry lock
/// would be overkill, unlike the limiter maps in [`crate::limiter`].
pub struct PathAttributesStore {
    map: Mutex<FxHashMap<String, PathAttributes>>,
}

impl PathAttributesStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, path: &str) -> Option<PathAttributes> {
        self.map.lock().unwrap().get(path).cloned()
    }

    pub fn update(&self, path: &str, attrs: PathAttributes) {
        self.map.lock().unwrap().insert(path.to_string(), attrs);
    }

    /// Marks the entry expunged rather than removing it, so a request that
    /// is simultaneously rate-limited and looking at a just-deleted path
    /// still finds an entry and can tell it is stale (spec §4.6 step 3).
    pub fn mark_expunged(&self, path: &str) {
        if let Some(entry) = self.map.lock().unwrap().get_mut(path) {
            entry.not_expunged = false;
        }
    }
}

impl Default for PathAttributesStore {
    fn default() -> Self {
        Self::new()
    }
}
