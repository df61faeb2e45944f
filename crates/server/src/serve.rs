//! Range-aware streaming of resource files.
//!
//! Serves GET and HEAD over an open reader, including files that are still
//! being written by a download task. The body stream polls the download's
//! completion handle: a short read before the download has finished means
//! more bytes are coming, so the reader sleeps briefly and retries instead
//! of terminating the response. Handlers that stop reading simply drop the
//! stream; the download itself is never aborted on their behalf.

use axum::body::Body;
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
};
use axum::http::{Response as HttpResponse, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use depot_cache::PinnedEntry;
use depot_fetch::CompletionHandle;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Reusable read buffer for body transfer.
const READ_BUF: usize = 2 * 1024 * 1024;

/// Sleep while waiting for the start byte to exist in a growing file.
const SEEK_WAIT: Duration = Duration::from_millis(10);

/// Sleep between read retries when the download is still in progress.
const READ_RETRY: Duration = Duration::from_millis(1);

/// Everything needed to serve one resource file.
pub struct ServeParams {
    /// Resource key, for logging only.
    pub resource: String,
    /// Declared total length of the (compressed) file.
    pub content_length: u64,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    /// Present when the file may still be growing.
    pub completion: Option<CompletionHandle>,
    /// Opened instead when the primary path has already been renamed into
    /// the cache.
    pub fallback_path: Option<PathBuf>,
    /// Cache pin released when the response stream is dropped.
    pub pin: Option<PinnedEntry>,
}

/// Serve a resource file, honoring a single `bytes=` range.
///
/// Invalid or unparseable ranges are ignored and the full file is served
/// with status 200; a valid range yields 206 with `Content-Range`.
pub fn serve_file(
    path: PathBuf,
    head_only: bool,
    range_header: Option<String>,
    params: ServeParams,
) -> Response {
    let total = params.content_length;
    let range = range_header
        .as_deref()
        .and_then(|header| parse_range(header, total));
    let (status, start, end) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
        None => (StatusCode::OK, 0, total.saturating_sub(1)),
    };
    let declared = if total == 0 { 0 } else { end - start + 1 };

    let mut builder = HttpResponse::builder()
        .status(status)
        .header(CONTENT_LENGTH, declared)
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_TYPE, params.content_type);
    if params.content_encoding != "identity" {
        builder = builder.header(CONTENT_ENCODING, params.content_encoding);
    }
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(CONTENT_RANGE, format!("bytes {start}-{end}/{total}"));
    }

    if head_only {
        return builder
            .body(Body::empty())
            .expect("static response construction");
    }

    let ServeParams {
        resource,
        completion,
        fallback_path,
        pin,
        ..
    } = params;

    let stream = async_stream::try_stream! {
        let _pin = pin;
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && fallback_path.is_some() => {
                // The staging file was renamed into the cache before we got
                // here; the committed copy has the same bytes.
                File::open(fallback_path.as_ref().expect("checked above")).await?
            }
            Err(e) => Err(e)?,
        };

        // Wait until the requested start byte exists. Supports serving a
        // range from a file the downloader is still appending to.
        loop {
            let len = file.metadata().await?.len();
            if len > start {
                break;
            }
            match &completion {
                Some(handle) if !handle.is_done() => tokio::time::sleep(SEEK_WAIT).await,
                _ => break,
            }
        }
        file.seek(SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; READ_BUF];
        let mut remaining = declared;
        let mut sent: u64 = 0;
        while remaining > 0 {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                if let Some(handle) = &completion {
                    if !handle.is_done() {
                        tokio::time::sleep(READ_RETRY).await;
                        continue;
                    }
                }
                // Download complete (or file truncated); nothing more comes.
                break;
            }
            let take = (n as u64).min(remaining) as usize;
            crate::metrics::PAYLOAD_BYTES_SERVED.inc_by(take as u64);
            sent += take as u64;
            remaining -= take as u64;
            yield Bytes::copy_from_slice(&buf[..take]);
        }
        if sent != declared {
            tracing::error!(
                resource = %resource,
                sent,
                declared,
                "transfer ended short of declared length"
            );
        }
    };
    let stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = std::io::Result<Bytes>> + Send>,
    > = Box::pin(stream);

    builder
        .body(Body::from_stream(stream))
        .expect("static response construction")
}

/// Parse a single `bytes=a-b` / `bytes=a-` / `bytes=-b` range.
///
/// Returns `None` when the full file should be served instead: the header
/// is unparseable (logged), the range is inverted, or the start lies past
/// the end of the file.
fn parse_range(header: &str, content_length: u64) -> Option<(u64, u64)> {
    if content_length == 0 {
        return None;
    }
    let Some(range) = header.strip_prefix("bytes=") else {
        tracing::debug!(header, "ignoring unparseable range header");
        return None;
    };
    if range.contains(',') {
        tracing::debug!(header, "ignoring multi-range header");
        return None;
    }
    let Some((start_s, end_s)) = range.split_once('-') else {
        tracing::debug!(header, "ignoring unparseable range header");
        return None;
    };

    let last = content_length - 1;
    match (start_s.is_empty(), end_s.is_empty()) {
        // bytes=a-b
        (false, false) => {
            let (Ok(start), Ok(end)) = (start_s.parse::<u64>(), end_s.parse::<u64>()) else {
                tracing::debug!(header, "ignoring unparseable range header");
                return None;
            };
            if start > end || start > last {
                return None;
            }
            Some((start, end.min(last)))
        }
        // bytes=a-
        (false, true) => {
            let Ok(start) = start_s.parse::<u64>() else {
                tracing::debug!(header, "ignoring unparseable range header");
                return None;
            };
            if start > last {
                return None;
            }
            Some((start, last))
        }
        // bytes=-b : final b bytes, start clamped to 0
        (true, false) => {
            let Ok(suffix) = end_s.parse::<u64>() else {
                tracing::debug!(header, "ignoring unparseable range header");
                return None;
            };
            if suffix == 0 {
                return None;
            }
            Some((content_length.saturating_sub(suffix), last))
        }
        (true, true) => {
            tracing::debug!(header, "ignoring unparseable range header");
            None
        }
    }
}
