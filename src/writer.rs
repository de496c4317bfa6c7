//! Output wrapper chain for streamed response bodies (spec §4.3).
//!
//! Grounded in `original_source/cdn/limits/limited-bandwidth-writer.go`,
//! `partial-range-writer.go`, and `cdn/utils/counting-writer.go`. Rather than
//! `tokio::io::AsyncWrite` these compose over a small local [`ByteSink`]
//! trait, letting the wrappers own (not borrow) whatever they wrap and chain
//! freely without juggling poll-based `Future`s by hand.

use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::range::ContentRange;

/// A destination that accepts byte chunks one at a time, in order. The
/// live connection type and the wrappers in this module all implement it,
/// so they compose; tests use a plain `Vec<u8>`.
#[allow(async_fn_in_trait)]
pub trait ByteSink {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()>;
}

impl ByteSink for TcpStream {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk).await
    }
}

impl ByteSink for Vec<u8> {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

impl<T: ByteSink + ?Sized> ByteSink for &mut T {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        (**self).send(chunk).await
    }
}

/// Throttles forwarded bytes to `bytes_per_interval` per `interval`,
/// sleeping between windows (spec §4.3, `LimitedBandwidthWriter`). A zero
/// `bytes_per_interval` disables throttling entirely.
pub struct BandwidthWriter<S> {
    inner: S,
    bytes_per_interval: u64,
    interval: Duration,
    passed: u64,
}

impl<S: ByteSink> BandwidthWriter<S> {
    pub fn new(inner: S, bytes_per_interval: u64, interval: Duration) -> Self {
        Self {
            inner,
            bytes_per_interval,
            interval,
            passed: 0,
        }
    }
}

impl<S: ByteSink> ByteSink for BandwidthWriter<S> {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.bytes_per_interval == 0 {
            return self.inner.send(chunk).await;
        }
        let mut offset = 0usize;
        while offset < chunk.len() {
            let remaining_in_window = (self.bytes_per_interval - self.passed) as usize;
            let take = remaining_in_window.min(chunk.len() - offset);
            self.inner.send(&chunk[offset..offset + take]).await?;
            offset += take;
            self.passed += take as u64;
            if self.passed >= self.bytes_per_interval {
                self.passed -= self.bytes_per_interval;
                tokio::time::sleep(self.interval).await;
            }
        }
        Ok(())
    }
}

/// Feeds a sink the bytes of a virtual `[start, start+length)` window over
/// an object, while being handed the object's bytes unchanged from position
/// zero — bytes outside the window are discarded, the virtual cursor still
/// advances by the full chunk regardless (spec §4.3, `PartialRangeWriter`).
pub struct PartialRangeWriter<S> {
    inner: S,
    position: u64,
    start: u64,
    end_exclusive: u64,
}

impl<S: ByteSink> PartialRangeWriter<S> {
    pub fn new(inner: S, range: ContentRange) -> Self {
        Self {
            inner,
            position: 0,
            start: range.start,
            end_exclusive: range.start + range.length,
        }
    }
}

impl<S: ByteSink> ByteSink for PartialRangeWriter<S> {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        let buf_start = self.position;
        let buf_end = self.position + chunk.len() as u64;
        self.position = buf_end;

        let lo = self.start.max(buf_start);
        let hi = self.end_exclusive.min(buf_end);
        if lo < hi {
            let slice_start = (lo - buf_start) as usize;
            let slice_end = (hi - buf_start) as usize;
            self.inner.send(&chunk[slice_start..slice_end]).await?;
        }
        Ok(())
    }
}

/// Counts bytes without forwarding them anywhere; used to size a
/// multipart/byteranges body before committing to the real write (spec
/// §4.5, `CountingWriter`).
#[derive(Default)]
pub struct CountingWriter {
    pub length: u64,
}

impl ByteSink for CountingWriter {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.length += chunk.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bandwidth_writer_forwards_all_bytes() {
        let mut out = Vec::new();
        let mut bw = BandwidthWriter::new(&mut out, 4, Duration::from_millis(0));
        bw.send(b"hello world").await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn bandwidth_writer_disabled_passthrough() {
        let mut out = Vec::new();
        let mut bw = BandwidthWriter::new(&mut out, 0, Duration::from_secs(1));
        bw.send(b"abc").await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn partial_range_writer_extracts_window() {
        let mut out = Vec::new();
        let mut prw = PartialRangeWriter::new(&mut out, ContentRange { start: 2, length: 3 });
        prw.send(b"0123456789").await.unwrap();
        assert_eq!(out, b"234");
    }

    #[tokio::test]
    async fn partial_range_writer_across_chunks() {
        let mut out = Vec::new();
        let mut prw = PartialRangeWriter::new(&mut out, ContentRange { start: 3, length: 4 });
        prw.send(b"012").await.unwrap();
        prw.send(b"345").await.unwrap();
        prw.send(b"678").await.unwrap();
        assert_eq!(out, b"3456");
    }

    #[tokio::test]
    async fn counting_writer_counts_without_storing() {
        let mut cw = CountingWriter::default();
        cw.send(b"hello").await.unwrap();
        cw.send(b" world").await.unwrap();
        assert_eq!(cw.length, 11);
    }
}
