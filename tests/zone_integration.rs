//! End-to-end scenarios against the library surface (spec §8), driven
//! through `Zone::handle` with an in-memory `Vec<u8>` sink and a real
//! filesystem backend over a `tempfile` directory — no live socket needed.

use std::collections::HashMap;
use std::time::Duration;

use edgezone::backend::filesystem::{FilesystemBackend, FsBackendConfig};
use edgezone::config::{AccessLimitConfig, CacheSettings, DownloadSettings, LimitsConfig, ZoneConfig};
use edgezone::http::{Headers, Method, RequestCtx};
use edgezone::Zone;

fn fs_config(dir: &std::path::Path) -> FsBackendConfig {
    FsBackendConfig {
        directory_path: dir.to_path_buf(),
        cached_header_bytes: 16,
        exists_check_can_file_open: false,
        watch_modified: true,
        mime_type_by_extension: true,
        list_directories: true,
        directory_modified_time_check: false,
        calculate_etags: true,
    }
}

fn zone(dir: &std::path::Path, cfg: ZoneConfig) -> Zone<FilesystemBackend> {
    Zone::new(cfg, FilesystemBackend::new(fs_config(dir)))
}

fn default_zone_config(name: &str) -> ZoneConfig {
    ZoneConfig {
        name: name.to_string(),
        domains: vec![],
        allow_range: true,
        cache_response: CacheSettings::default(),
        download_response: DownloadSettings::default(),
        access_limit: AccessLimitConfig::default(),
        limits: LimitsConfig::default(),
        backend: "filesystem".to_string(),
        backend_settings: HashMap::new(),
    }
}

fn request<'a>(method: Method, path: &str, headers: Headers) -> RequestCtx<'a> {
    RequestCtx::new(method, path.to_string(), headers, "203.0.113.7".to_string())
}

fn status(resp: &[u8]) -> u16 {
    std::str::from_utf8(resp)
        .unwrap()
        .lines()
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap()
}

fn header<'a>(resp: &'a [u8], name: &str) -> Option<&'a str> {
    std::str::from_utf8(resp).unwrap().lines().find_map(|line| {
        line.split_once(": ").and_then(|(k, v)| k.eq_ignore_ascii_case(name).then_some(v))
    })
}

fn body_of(resp: &[u8]) -> &[u8] {
    let marker = b"\r\n\r\n";
    let pos = resp
        .windows(marker.len())
        .position(|w| w == marker)
        .expect("response must contain a header/body separator");
    &resp[pos + marker.len()..]
}

#[tokio::test]
async fn scenario_conditional_hit_by_etag() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), b"<html>hi</html>").unwrap();
    let z = zone(dir.path(), default_zone_config("assets"));

    let mut first = Vec::new();
    z.handle(&request(Method::Get, "/page.html", Headers::new()), &mut first).await.unwrap();
    assert_eq!(status(&first), 200);
    let etag = header(&first, "ETag").unwrap().to_string();

    let mut h = Headers::new();
    h.push("If-None-Match", etag.clone());
    let mut second = Vec::new();
    z.handle(&request(Method::Get, "/page.html", h), &mut second).await.unwrap();
    assert_eq!(status(&second), 304);
    assert!(body_of(&second).is_empty());
}

#[tokio::test]
async fn scenario_single_range_request() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("movie.bin"), vec![7u8; 1000]).unwrap();
    let z = zone(dir.path(), default_zone_config("assets"));

    let mut h = Headers::new();
    h.push("Range", "bytes=100-199");
    let mut out = Vec::new();
    z.handle(&request(Method::Get, "/movie.bin", h), &mut out).await.unwrap();
    assert_eq!(status(&out), 206);
    assert_eq!(header(&out, "Content-Range"), Some("bytes 100-199/1000"));
    assert_eq!(body_of(&out).len(), 100);
}

#[tokio::test]
async fn scenario_multipart_range_request() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("movie.bin"), (0u16..255).map(|b| b as u8).collect::<Vec<u8>>()).unwrap();
    let z = zone(dir.path(), default_zone_config("assets"));

    let mut h = Headers::new();
    h.push("Range", "bytes=0-9,20-29,40-49");
    let mut out = Vec::new();
    z.handle(&request(Method::Get, "/movie.bin", h), &mut out).await.unwrap();
    assert_eq!(status(&out), 206);
    assert!(header(&out, "Content-Type").unwrap().starts_with("multipart/byteranges; boundary="));
    let declared_len: u64 = header(&out, "Content-Length").unwrap().parse().unwrap();
    assert_eq!(body_of(&out).len() as u64, declared_len);
}

#[tokio::test]
async fn scenario_unsatisfiable_range_request() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("small.txt"), b"short").unwrap();
    let z = zone(dir.path(), default_zone_config("assets"));

    let mut h = Headers::new();
    h.push("Range", "bytes=50-60");
    let mut out = Vec::new();
    z.handle(&request(Method::Get, "/small.txt", h), &mut out).await.unwrap();
    assert_eq!(status(&out), 416);
    assert_eq!(header(&out, "Content-Range"), Some("bytes */5"));
}

#[tokio::test]
async fn scenario_request_rate_limit_refusal_with_cached_headers() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hot.txt"), b"popular").unwrap();
    let mut cfg = default_zone_config("assets");
    cfg.cache_response.request_limited_cache_check = true;
    cfg.limits.request_limits = vec![edgezone::config::RequestLimitConfig {
        remote_addresses: vec![],
        max_requests: 1,
        request_rate_interval: Duration::from_secs(60),
    }];
    let z = zone(dir.path(), cfg);

    let mut first = Vec::new();
    z.handle(&request(Method::Get, "/hot.txt", Headers::new()), &mut first).await.unwrap();
    assert_eq!(status(&first), 200);
    let etag = header(&first, "ETag").unwrap().to_string();

    let mut second = Vec::new();
    z.handle(&request(Method::Get, "/hot.txt", Headers::new()), &mut second).await.unwrap();
    assert_eq!(status(&second), 429);

    let mut h = Headers::new();
    h.push("If-None-Match", etag);
    let mut third = Vec::new();
    z.handle(&request(Method::Get, "/hot.txt", h), &mut third).await.unwrap();
    assert_eq!(status(&third), 304);
}

#[tokio::test]
async fn scenario_delete_purges_object() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("gone-soon.txt"), b"x").unwrap();
    let z = zone(dir.path(), default_zone_config("assets"));

    let mut del_out = Vec::new();
    z.handle(&request(Method::Delete, "/gone-soon.txt", Headers::new()), &mut del_out).await.unwrap();
    assert_eq!(status(&del_out), 200);

    std::fs::remove_file(dir.path().join("gone-soon.txt")).unwrap();
    let mut get_out = Vec::new();
    z.handle(&request(Method::Get, "/gone-soon.txt", Headers::new()), &mut get_out).await.unwrap();
    assert_eq!(status(&get_out), 404);
}

#[tokio::test]
async fn connection_limit_admits_within_cap() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
    let mut cfg = default_zone_config("assets");
    cfg.limits.connection_limits = vec![edgezone::config::ConnectionLimitConfig {
        remote_addresses: vec![],
        max_connections: 1,
    }];
    let z = zone(dir.path(), cfg);

    // The admission guard is held only for the duration of one `handle`
    // call, so sequential requests each see the slot free again afterward;
    // true saturation under concurrent hold is covered in limiter.rs.
    let mut first = Vec::new();
    z.handle(&request(Method::Get, "/a.txt", Headers::new()), &mut first).await.unwrap();
    assert_eq!(status(&first), 200);

    let mut second = Vec::new();
    z.handle(&request(Method::Get, "/a.txt", Headers::new()), &mut second).await.unwrap();
    assert_eq!(status(&second), 200);
}

#[tokio::test]
async fn host_allowlist_rejects_unlisted_domain() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = default_zone_config("assets");
    cfg.domains = vec!["cdn.example.com".to_string()];
    let z = zone(dir.path(), cfg);

    assert!(z.host_allowed(Some("cdn.example.com")));
    assert!(z.host_allowed(Some("cdn.example.com:443")));
    assert!(!z.host_allowed(Some("evil.example.com")));
    assert!(!z.host_allowed(None));
}

#[tokio::test]
async fn directory_listing_is_returned_as_plain_text() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("pics")).unwrap();
    std::fs::write(dir.path().join("pics/a.png"), b"x").unwrap();
    std::fs::write(dir.path().join("pics/b.png"), b"y").unwrap();
    let z = zone(dir.path(), default_zone_config("assets"));

    let mut out = Vec::new();
    z.handle(&request(Method::Get, "/pics", Headers::new()), &mut out).await.unwrap();
    assert_eq!(status(&out), 200);
    let body = String::from_utf8_lossy(body_of(&out));
    assert!(body.contains("a.png"));
    assert!(body.contains("b.png"));
}
