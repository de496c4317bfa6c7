//! Zone request handler orchestration (spec §4.6, "C8").
//!
//! Grounded in `original_source/cdn/zone.go`'s `ServeHTTP` and the
//! admission/lifecycle helpers it calls directly (`limits.go`,
//! `access-limit.go`, `utils/*`). This is the thickest component in the
//! spec (31% share) because it is the only one that sequences every other
//! component for a single request: C5 (admission, lifecycle) -> C3/C4
//! (existence, stats, streaming) -> C7 (preconditions, range) -> C2 (output
//! wrapping).

use std::io;
use std::time::SystemTime;

use crate::backend::Backend;
use crate::config::{BandwidthLimitConfig, ZoneConfig};
use crate::error::BackendError;
use crate::http::{normalize_path, reason_phrase, Headers, Method, RequestCtx};
use crate::limiter::ZoneLimiters;
use crate::mime;
use crate::path_attributes::{PathAttributes, PathAttributesStore};
use crate::precondition::{self, PreconditionOutcome, RangePlan, Validators};
use crate::range::{self, ContentRange};
use crate::writer::{BandwidthWriter, ByteSink, CountingWriter};

/// A zone: immutable configuration plus the mutable per-path/per-client
/// state it owns (spec §3 "Owns all mutable per-zone state").
pub struct Zone<B> {
    config: ZoneConfig,
    backend: B,
    limiters: ZoneLimiters,
    path_attributes: PathAttributesStore,
}

fn io_err(e: BackendError) -> io::Error {
    e.into()
}

/// Forwards to either a plain sink or a [`BandwidthWriter`] wrapping it,
/// without making every call site generic over which one applies (spec
/// §4.6 step 8: "wrap the sink with the bandwidth writer if a policy
/// applies for the client").
enum MaybeBandwidth<'s, S> {
    Plain(&'s mut S),
    Throttled(BandwidthWriter<&'s mut S>),
}

impl<S: ByteSink> ByteSink for MaybeBandwidth<'_, S> {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            MaybeBandwidth::Plain(s) => s.send(chunk).await,
            MaybeBandwidth::Throttled(w) => w.send(chunk).await,
        }
    }
}

struct CacheHeaders {
    cache_control: String,
    age: Option<String>,
    expires: Option<String>,
}

impl<B: Backend> Zone<B> {
    pub fn new(config: ZoneConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            limiters: ZoneLimiters::new(),
            path_attributes: PathAttributesStore::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// `true` iff `host` (ignoring any `:port` suffix) is in the zone's
    /// domain allow-list, or the list is empty (spec §3).
    pub fn host_allowed(&self, host: Option<&str>) -> bool {
        if self.config.domains.is_empty() {
            return true;
        }
        let Some(host) = host else { return false };
        let bare = host.split(':').next().unwrap_or(host);
        self.config.domains.iter().any(|d| d.eq_ignore_ascii_case(bare))
    }

    /// Entry point for one request (spec §4.6 pseudostate:
    /// `ADMIT_CONN -> ADMIT_REQ -> EXISTS? -> METHOD_DISPATCH -> VALIDATORS
    /// -> RANGE -> STREAM`).
    pub async fn handle<S: ByteSink + Send>(&self, req: &RequestCtx<'_>, sink: &mut S) -> io::Result<()> {
        let path = normalize_path(&req.path);

        let conn_cfg = self.config.limits.pick_connection(&req.client_ip);
        let _conn_guard = match conn_cfg {
            Some(cfg) => match self.limiters.connection_for(&req.client_ip, cfg) {
                Some(limiter) => match limiter.try_acquire() {
                    Some(guard) => Some(guard),
                    None => return write_simple(sink, 429, "Too Many Connections").await,
                },
                None => None,
            },
            None => None,
        };

        if let Some(cfg) = self.config.limits.pick_request(&req.client_ip) {
            if let Some(limiter) = self.limiters.request_for(&req.client_ip, cfg) {
                if !limiter.try_admit() {
                    return self.handle_rate_limited(req, &path, sink).await;
                }
            }
        }

        self.serve_admitted(req, &path, sink).await
    }

    /// spec §4.6 step 2: a request the rate limiter refuses may still get a
    /// correct `304` off the last successful response's metadata; otherwise
    /// `429` (spec §8 scenario 5).
    async fn handle_rate_limited<S: ByteSink + Send>(
        &self,
        req: &RequestCtx<'_>,
        path: &str,
        sink: &mut S,
    ) -> io::Result<()> {
        if self.config.cache_response.request_limited_cache_check {
            if let Some(attrs) = self.path_attributes.get(path) {
                if attrs.not_expunged {
                    let validators = Validators {
                        if_none_match: req.headers.get("if-none-match"),
                        if_match: req.headers.get("if-match"),
                        if_modified_since: req.headers.get("if-modified-since"),
                        if_unmodified_since: req.headers.get("if-unmodified-since"),
                    };
                    match precondition::evaluate_preconditions(&validators, &attrs.etag, attrs.last_modified_time) {
                        PreconditionOutcome::NotModified => {
                            return write_304(sink, &attrs.etag, attrs.last_modified_time).await;
                        }
                        PreconditionOutcome::PreconditionFailed => {
                            return write_simple(sink, 412, "Precondition Failed").await;
                        }
                        PreconditionOutcome::Continue => {}
                    }
                }
            }
        }
        write_simple(sink, 429, "Too Many Requests").await
    }

    async fn serve_admitted<S: ByteSink + Send>(&self, req: &RequestCtx<'_>, path: &str, sink: &mut S) -> io::Result<()> {
        let (exists, listable) = self.backend.exists(path);
        if !exists {
            self.path_attributes.mark_expunged(path);
            self.limiters.drop_access(path);
            return write_simple(sink, 404, "Object Not Found").await;
        }

        match &req.method {
            Method::Delete => return self.handle_delete(path, sink).await,
            Method::Options => return write_options(sink).await,
            Method::Get | Method::Head => {}
            Method::Other(_) => return write_simple(sink, 403, "Forbidden Method").await,
        }

        let access = self.limiters.access_for(
            path,
            self.config.access_limit.expire_time,
            self.config.access_limit.access_limit,
        );
        if access.is_gone() {
            return write_simple(sink, 410, "Object Gone").await;
        }
        if access.consume_access() {
            return write_simple(sink, 403, "Access Limit Reached").await;
        }
        if access.is_expired() {
            if self.config.access_limit.purge_expired {
                let _ = self.backend.purge(path);
            }
            return write_simple(sink, 410, "Object Expired").await;
        }

        let (size, mtime) = match self.backend.stats(path).await {
            Ok(v) => v,
            Err(_) => return write_simple(sink, 500, "Internal Server Error").await,
        };

        let mut etag = self.backend.etag(path);
        if etag.is_empty() {
            etag = range::zone_fallback_etag(mtime, size);
        }

        let content_type = if size < 0 {
            "text/plain; charset=utf-8".to_string()
        } else {
            let mt = self.backend.mime_type(path);
            if mt.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mt
            }
        };

        let validators = Validators {
            if_none_match: req.headers.get("if-none-match"),
            if_match: req.headers.get("if-match"),
            if_modified_since: req.headers.get("if-modified-since"),
            if_unmodified_since: req.headers.get("if-unmodified-since"),
        };
        match precondition::evaluate_preconditions(&validators, &etag, mtime) {
            PreconditionOutcome::NotModified => return write_304(sink, &etag, mtime).await,
            PreconditionOutcome::PreconditionFailed => return write_simple(sink, 412, "Precondition Failed").await,
            PreconditionOutcome::Continue => {}
        }

        // Directories are not byte-streamable (spec §4.1 `size < 0`), so
        // range handling never applies to a listing.
        let allow_range = self.config.allow_range && size >= 0;
        let range_plan = precondition::evaluate_range(
            allow_range,
            req.headers.get("range"),
            req.headers.get("if-range"),
            &etag,
            mtime,
            size.max(0) as u64,
        );
        if matches!(range_plan, RangePlan::Unsatisfiable) {
            return write_416(sink, size.max(0) as u64).await;
        }

        let head_only = req.method == Method::Head;
        let cache_headers = self.cache_headers(access.expire_time_absolute(), mtime);
        let bandwidth_cfg = self.config.limits.pick_bandwidth(&req.client_ip);

        let result = if listable && size < 0 {
            self.write_listing(path, &etag, mtime, &cache_headers, head_only, sink).await
        } else {
            self.write_object(
                path,
                size.max(0) as u64,
                &etag,
                mtime,
                &content_type,
                &cache_headers,
                &range_plan,
                head_only,
                bandwidth_cfg,
                sink,
            )
            .await
        };

        if result.is_ok() && self.config.cache_response.request_limited_cache_check {
            self.path_attributes.update(
                path,
                PathAttributes {
                    last_modified_time: mtime,
                    etag: etag.clone(),
                    content_length: size.max(0) as u64,
                    content_type: content_type.clone(),
                    cache_control: cache_headers.cache_control.clone(),
                    age: cache_headers.age.clone().unwrap_or_default(),
                    expires: cache_headers.expires.clone().unwrap_or_default(),
                    not_expunged: true,
                },
            );
        }
        result
    }

    async fn handle_delete<S: ByteSink + Send>(&self, path: &str, sink: &mut S) -> io::Result<()> {
        match self.backend.purge(path) {
            Ok(()) => {
                self.path_attributes.mark_expunged(path);
                self.limiters.drop_access(path);
                write_simple(sink, 200, "OK").await
            }
            Err(e) => write_simple(sink, 500, &format!("Purge Error: {e}")).await,
        }
    }

    /// spec §4.6 step 6. `expire_time` zero (`None`) selects the
    /// `max-age`+`Age` family; a configured per-path expiry selects
    /// `Expires` instead.
    fn cache_headers(&self, expire_time: Option<SystemTime>, mtime: SystemTime) -> CacheHeaders {
        let max_age = self.config.cache_response.max_age;
        match expire_time {
            None => {
                let mut cache_control = format!("max-age={max_age}, must-revalidate");
                if self.config.cache_response.private_cache {
                    cache_control.push_str(", private");
                }
                let now = SystemTime::now();
                let delta = now
                    .duration_since(mtime)
                    .unwrap_or_else(|e| e.duration());
                let age_secs = if max_age > 0 { delta.as_secs() % max_age as u64 } else { delta.as_secs() };
                CacheHeaders {
                    cache_control,
                    age: Some(age_secs.to_string()),
                    expires: None,
                }
            }
            Some(expires_at) => {
                let cache_control = if self.config.cache_response.private_cache {
                    "private".to_string()
                } else {
                    String::new()
                };
                CacheHeaders {
                    cache_control,
                    age: None,
                    expires: Some(httpdate::fmt_http_date(expires_at)),
                }
            }
        }
    }

    fn content_disposition(&self, path: &str, content_type: &str) -> String {
        let mut filename = if self.config.download_response.output_filename {
            path.rsplit('/').next().unwrap_or(path).to_string()
        } else {
            String::new()
        };
        if self.config.download_response.set_extension_if_missing
            && !filename.is_empty()
            && !filename.contains('.')
        {
            if let Some(ext) = mime::extension_for_mime(content_type) {
                filename.push_str(ext);
            }
        }
        if filename.is_empty() {
            "attachment".to_string()
        } else {
            format!("attachment; filename=\"{filename}\"")
        }
    }

    fn wrap_bandwidth<'s, S: ByteSink>(
        &self,
        sink: &'s mut S,
        cfg: Option<&BandwidthLimitConfig>,
    ) -> MaybeBandwidth<'s, S> {
        match cfg {
            Some(c) if c.is_valid() => MaybeBandwidth::Throttled(BandwidthWriter::new(sink, c.bytes, c.interval)),
            _ => MaybeBandwidth::Plain(sink),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_object<S: ByteSink + Send>(
        &self,
        path: &str,
        size: u64,
        etag: &str,
        mtime: SystemTime,
        content_type: &str,
        cache: &CacheHeaders,
        plan: &RangePlan,
        head_only: bool,
        bandwidth_cfg: Option<&BandwidthLimitConfig>,
        sink: &mut S,
    ) -> io::Result<()> {
        match plan {
            RangePlan::Full => {
                let mut headers = Headers::new();
                headers.push("Content-Type", content_type);
                headers.push("Content-Length", size.to_string());
                headers.push("Last-Modified", httpdate::fmt_http_date(mtime));
                headers.push("ETag", etag);
                headers.push("Cache-Control", cache.cache_control.clone());
                if let Some(age) = &cache.age {
                    headers.push("Age", age.clone());
                }
                if let Some(expires) = &cache.expires {
                    headers.push("Expires", expires.clone());
                }
                if self.config.allow_range {
                    headers.push("Accept-Ranges", "bytes");
                }
                if self.config.download_response.output_disposition {
                    headers.push("Content-Disposition", self.content_disposition(path, content_type));
                }
                write_head(sink, 200, &headers).await?;
                if !head_only {
                    let mut bw = self.wrap_bandwidth(sink, bandwidth_cfg);
                    self.backend.write_data(path, &mut bw).await.map_err(io_err)?;
                }
                Ok(())
            }
            RangePlan::Single(r) => {
                let mut headers = Headers::new();
                headers.push("Content-Type", content_type);
                headers.push("Content-Length", r.length.to_string());
                headers.push("Content-Range", r.to_field(size));
                headers.push("Last-Modified", httpdate::fmt_http_date(mtime));
                headers.push("ETag", etag);
                headers.push("Accept-Ranges", "bytes");
                write_head(sink, 206, &headers).await?;
                if !head_only {
                    let mut bw = self.wrap_bandwidth(sink, bandwidth_cfg);
                    self.backend
                        .write_data_range(path, &mut bw, r.start, r.length)
                        .await
                        .map_err(io_err)?;
                }
                Ok(())
            }
            RangePlan::Multi(ranges) => {
                self.write_multipart(path, ranges, size, etag, mtime, content_type, !head_only, bandwidth_cfg, sink)
                    .await
            }
            RangePlan::Unsatisfiable => unreachable!("filtered by the caller before dispatch"),
        }
    }

    /// `multipart/byteranges` body (spec §4.5 "two or more valid ranges").
    /// `Content-Length` is computed by dry-running the same framing over a
    /// [`CountingWriter`] before the real write, per spec §4.5 — no
    /// buffering of the whole body in memory.
    #[allow(clippy::too_many_arguments)]
    async fn write_multipart<S: ByteSink + Send>(
        &self,
        path: &str,
        ranges: &[ContentRange],
        total: u64,
        etag: &str,
        mtime: SystemTime,
        content_type: &str,
        with_body: bool,
        bandwidth_cfg: Option<&BandwidthLimitConfig>,
        sink: &mut S,
    ) -> io::Result<()> {
        let boundary = multipart_boundary();
        let part_heads: Vec<String> = ranges
            .iter()
            .map(|r| format!("--{boundary}\r\nContent-Type: {content_type}\r\nContent-Range: {}\r\n\r\n", r.to_field(total)))
            .collect();
        let final_boundary = format!("--{boundary}--\r\n");

        let mut counting = CountingWriter::default();
        for (head, r) in part_heads.iter().zip(ranges.iter()) {
            counting.send(head.as_bytes()).await?;
            counting.length += r.length;
            counting.send(b"\r\n").await?;
        }
        counting.send(final_boundary.as_bytes()).await?;

        let mut headers = Headers::new();
        headers.push("Content-Type", format!("multipart/byteranges; boundary={boundary}"));
        headers.push("Content-Length", counting.length.to_string());
        headers.push("Last-Modified", httpdate::fmt_http_date(mtime));
        headers.push("ETag", etag);
        headers.push("Accept-Ranges", "bytes");
        write_head(sink, 206, &headers).await?;

        if with_body {
            let mut bw = self.wrap_bandwidth(sink, bandwidth_cfg);
            for (head, r) in part_heads.iter().zip(ranges.iter()) {
                bw.send(head.as_bytes()).await?;
                self.backend
                    .write_data_range(path, &mut bw, r.start, r.length)
                    .await
                    .map_err(io_err)?;
                bw.send(b"\r\n").await?;
            }
            bw.send(final_boundary.as_bytes()).await?;
        }
        Ok(())
    }

    async fn write_listing<S: ByteSink + Send>(
        &self,
        path: &str,
        etag: &str,
        mtime: SystemTime,
        cache: &CacheHeaders,
        head_only: bool,
        sink: &mut S,
    ) -> io::Result<()> {
        let names = self.backend.list(path).map_err(io_err)?;
        let body = names.join("\r\n");
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain; charset=utf-8");
        headers.push("Content-Length", body.len().to_string());
        headers.push("Last-Modified", httpdate::fmt_http_date(mtime));
        headers.push("ETag", etag);
        headers.push("Cache-Control", cache.cache_control.clone());
        if let Some(age) = &cache.age {
            headers.push("Age", age.clone());
        }
        if let Some(expires) = &cache.expires {
            headers.push("Expires", expires.clone());
        }
        write_head(sink, 200, &headers).await?;
        if !head_only {
            sink.send(body.as_bytes()).await?;
        }
        Ok(())
    }
}

fn multipart_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("zoneboundary{nanos:x}")
}

async fn write_head<S: ByteSink>(sink: &mut S, status: u16, headers: &Headers) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    sink.send(head.as_bytes()).await
}

/// Terminal, non-caching plain-text response (spec §4.6: most error paths
/// "switch to non-caching headers": drop `Last-Modified`/`Age`/`Expires`/
/// `ETag`, set `Cache-Control: no-store...`, `Pragma: no-cache`).
async fn write_simple<S: ByteSink>(sink: &mut S, status: u16, message: &str) -> io::Result<()> {
    let body = message.as_bytes();
    let mut headers = Headers::new();
    headers.push("Content-Type", "text/plain; charset=utf-8");
    headers.push("Content-Length", body.len().to_string());
    headers.push("X-Content-Type-Options", "nosniff");
    headers.push("Cache-Control", "no-store, no-cache, must-revalidate");
    headers.push("Pragma", "no-cache");
    write_head(sink, status, &headers).await?;
    sink.send(body).await
}

async fn write_304<S: ByteSink>(sink: &mut S, etag: &str, mtime: SystemTime) -> io::Result<()> {
    let mut headers = Headers::new();
    if !etag.is_empty() {
        headers.push("ETag", etag);
    }
    headers.push("Last-Modified", httpdate::fmt_http_date(mtime));
    write_head(sink, 304, &headers).await
}

async fn write_416<S: ByteSink>(sink: &mut S, size: u64) -> io::Result<()> {
    let mut headers = Headers::new();
    headers.push("Content-Range", format!("bytes */{size}"));
    headers.push("Content-Length", "0");
    headers.push("Cache-Control", "no-store, no-cache, must-revalidate");
    headers.push("Pragma", "no-cache");
    write_head(sink, 416, &headers).await
}

async fn write_options<S: ByteSink>(sink: &mut S) -> io::Result<()> {
    let mut headers = Headers::new();
    headers.push("Allow", "OPTIONS, GET, HEAD, DELETE");
    headers.push("Content-Length", "0");
    write_head(sink, 200, &headers).await
}
