//! Zone engine library: pluggable-backend, per-client-limited, range- and
//! precondition-aware object serving (spec §0).
//!
//! `main.rs` is the thin A2 binary (config load, listener loop, request
//! parsing); everything request-shaped lives here so it can be driven
//! directly from tests without a live socket.

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod mime;
pub mod path_attributes;
pub mod precondition;
pub mod range;
pub mod writer;
pub mod zone;

pub use backend::Backend;
pub use config::Config;
pub use error::{BackendError, ConfigError, ZoneError};
pub use http::{Headers, Method, RequestCtx};
pub use mime::{get_mime_type, get_mime_type_enum, MimeType};
pub use writer::ByteSink;
pub use zone::Zone;
