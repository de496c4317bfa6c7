use std::path::Path;

/// Optimized MIME type system using enum indices instead of HashMap lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MimeType {
    Html = 0,
    Css = 1,
    Javascript = 2,
    Json = 3,
    Xml = 4,
    PlainText = 5,
    Icon = 6,
    Png = 7,
    Jpeg = 8,
    Gif = 9,
    Svg = 10,
    Pdf = 11,
    Woff = 12,
    Woff2 = 13,
    Ttf = 14,
    Eot = 15,
    Webp = 16,
    Mp4 = 17,
    Webm = 18,
    Wasm = 19,
    OctetStream = 20, // Default for unknown files
}

impl MimeType {
    // Static array for O(1) lookup - much faster than HashMap
    const MIME_STRINGS: [&'static str; 21] = [
        "text/html; charset=utf-8",        // Html
        "text/css; charset=utf-8",         // Css
        "text/javascript; charset=utf-8",  // Javascript
        "application/json; charset=utf-8", // Json
        "application/xml; charset=utf-8",  // Xml
        "text/plain; charset=utf-8",       // PlainText
        "image/x-icon",                    // Icon
        "image/png",                       // Png
        "image/jpeg",                      // Jpeg
        "image/gif",                       // Gif
        "image/svg+xml",                   // Svg
        "application/pdf",                 // Pdf
        "font/woff",                       // Woff
        "font/woff2",                      // Woff2
        "font/ttf",                        // Ttf
        "application/vnd.ms-fontobject",   // Eot
        "image/webp",                      // Webp
        "video/mp4",                       // Mp4
        "video/webm",                      // Webm
        "application/wasm",                // Wasm
        "application/octet-stream",        // OctetStream
    ];

    // Convert enum to MIME string - zero allocation, O(1) lookup
    pub fn as_str(self) -> &'static str {
        Self::MIME_STRINGS[self as usize]
    }
}

// Fast MIME type detection - optimized internal implementation
pub fn get_mime_type_enum(file_path: &Path) -> MimeType {
    if let Some(extension) = file_path.extension().and_then(|s| s.to_str()) {
        // Use direct string matching instead of HashMap lookup - much faster
        match extension.to_ascii_lowercase().as_str() {
            "html" | "htm" => MimeType::Html,
            "css" => MimeType::Css,
            "js" | "mjs" => MimeType::Javascript,
            "json" => MimeType::Json,
            "xml" => MimeType::Xml,
            "txt" => MimeType::PlainText,
            "ico" => MimeType::Icon,
            "png" => MimeType::Png,
            "jpg" | "jpeg" => MimeType::Jpeg,
            "gif" => MimeType::Gif,
            "svg" => MimeType::Svg,
            "pdf" => MimeType::Pdf,
            "woff" => MimeType::Woff,
            "woff2" => MimeType::Woff2,
            "ttf" => MimeType::Ttf,
            "eot" => MimeType::Eot,
            "webp" => MimeType::Webp,
            "mp4" => MimeType::Mp4,
            "webm" => MimeType::Webm,
            "wasm" => MimeType::Wasm,
            _ => MimeType::OctetStream,
        }
    } else {
        MimeType::OctetStream
    }
}

/// Public API - maintains a plain string-based interface for callers that
/// only have a path, not a `Path`.
pub fn get_mime_type(file_path: &str) -> &'static str {
    get_mime_type_enum(Path::new(file_path)).as_str()
}

/// Reverse lookup used by download-disposition filename synthesis (spec
/// §4.6): picks a plausible extension for a `Content-Type` value, ignoring
/// any `; charset=...` suffix.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let base = mime.split(';').next().unwrap_or(mime).trim();
    Some(match base {
        "text/html" => ".html",
        "text/css" => ".css",
        "text/javascript" => ".js",
        "application/json" => ".json",
        "application/xml" => ".xml",
        "text/plain" => ".txt",
        "image/x-icon" => ".ico",
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "application/pdf" => ".pdf",
        "font/woff" => ".woff",
        "font/woff2" => ".woff2",
        "font/ttf" => ".ttf",
        "application/vnd.ms-fontobject" => ".eot",
        "image/webp" => ".webp",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "application/wasm" => ".wasm",
        _ => return None,
    })
}
