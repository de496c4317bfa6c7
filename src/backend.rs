//! Pluggable object-store abstraction a zone reads through (spec §4.1).
//!
//! Grounded in `original_source/cdn/backend.go`'s `Backend` interface — same
//! eight operations, same `NewBackendFromName` dispatch-by-string idea
//! (carried as `backend_settings: HashMap<String, String>` in
//! [`crate::config::ZoneConfig`]). Only the filesystem backend ships today;
//! the trait stays generic so another store could slot in later.

pub mod filesystem;

use std::time::SystemTime;

use crate::error::BackendError;
use crate::writer::ByteSink;

/// Eight operations a zone needs from an object store. Methods are generic
/// over the sink rather than `dyn`-dispatched: there is exactly one
/// implementor in this crate, and a generic `async fn` avoids the ecosystem
/// friction of boxing futures for a trait object nobody needs.
#[allow(async_fn_in_trait)]
pub trait Backend {
    /// `(exists, listable)` — `listable` is true only for a directory whose
    /// listing is permitted as a pseudo-object.
    fn exists(&self, path: &str) -> (bool, bool);

    /// `size < 0` signals "present but not a streamable file" (a directory).
    async fn stats(&self, path: &str) -> Result<(i64, SystemTime), BackendError>;

    /// Empty string means "no opinion", i.e. the zone should not set
    /// `Content-Type` from this backend.
    fn mime_type(&self, path: &str) -> String;

    /// Empty string means the backend has no ETag for `path`; the zone
    /// falls back to [`crate::range::zone_fallback_etag`].
    fn etag(&self, path: &str) -> String;

    async fn write_data<S: ByteSink + Send>(
        &self,
        path: &str,
        sink: &mut S,
    ) -> Result<(), BackendError>;

    async fn write_data_range<S: ByteSink + Send>(
        &self,
        path: &str,
        sink: &mut S,
        start: u64,
        length: u64,
    ) -> Result<(), BackendError>;

    fn purge(&self, path: &str) -> Result<(), BackendError>;

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError>;
}
