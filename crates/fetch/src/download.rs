//! Streaming download pipeline.
//!
//! One pass over the upstream GET body does three things at once: the
//! compressed bytes are appended to the staging file, fed through a gzip
//! decoder, and the decoded tar stream is tree-hashed under both
//! conventions. The handoff to the decoder is a bounded channel, so the
//! slowest consumer applies backpressure all the way to the HTTP body.
//!
//! ```text
//! HTTP body ──► tee ──► staging file
//!                 └──► gzip decoder ──► tree-hash (skip-empty + canonical)
//! ```
//!
//! Verification happens before any commit is visible: the staged file is
//! renamed into the cache only after a hash matched.

use crate::error::{FetchError, FetchResult};
use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use depot_cache::{AtomicWriter, DiskCache, StagedFile};
use depot_core::{ResourceKey, TarTreeHasher, TreeHashPair};
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Chunks buffered between the network tee and the decompressor. Reqwest
/// yields chunks of at most 1 MiB, bounding the pipeline at 16 MiB.
const PIPELINE_DEPTH: usize = 16;

/// Decoded-side read buffer.
const DECODE_BUF: usize = 64 * 1024;

/// Download `key` from `server`, verify, and install into the cache.
///
/// On the archaic case, where the bytes match the key's hash under the
/// skip-empty convention only, a second entry is installed under the
/// canonical hash by copying the committed file, so future lookups under
/// either address hit.
pub(crate) async fn run(
    client: &reqwest::Client,
    server: &str,
    key: &ResourceKey,
    mut staged: StagedFile,
    cache: &Arc<DiskCache>,
    writer: &AtomicWriter,
    bytes_fetched: &AtomicU64,
) -> FetchResult<PathBuf> {
    let pair = match transfer(client, server, key, &mut staged, bytes_fetched).await {
        Ok(pair) => pair,
        Err(e) => {
            staged.discard().await;
            return Err(e);
        }
    };

    let expected = key.hash();
    if pair.no_skip == expected {
        return Ok(staged.commit(cache, key).await?);
    }

    if pair.skip_empty == expected {
        let dest = staged.commit(cache, key).await?;
        let canonical = key.with_hash(pair.no_skip);
        if !cache.contains(&canonical) {
            let src = dest.clone();
            writer
                .write_atomic(cache, &canonical, |_path, mut file| async move {
                    let mut committed = tokio::fs::File::open(&src).await?;
                    tokio::io::copy(&mut committed, &mut file).await?;
                    Ok(file)
                })
                .await?;
            tracing::debug!(
                resource = %key,
                canonical = %canonical,
                "installed skip-empty tarball under its canonical hash too"
            );
        }
        return Ok(dest);
    }

    staged.discard().await;
    Err(FetchError::HashMismatch {
        key: key.to_string(),
        skip_empty: pair.skip_empty.to_hex(),
        no_skip: pair.no_skip.to_hex(),
    })
}

/// Stream the GET body into the staging file while hashing the decoded tar.
async fn transfer(
    client: &reqwest::Client,
    server: &str,
    key: &ResourceKey,
    staged: &mut StagedFile,
    bytes_fetched: &AtomicU64,
) -> FetchResult<TreeHashPair> {
    let url = format!("{server}{key}");
    let resp = client.get(&url).send().await?;
    if resp.status() != StatusCode::OK {
        return Err(FetchError::Upstream {
            server: server.to_string(),
            status: resp.status().as_u16(),
        });
    }

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(PIPELINE_DEPTH);
    let hasher = tokio::spawn(hash_tar_stream(rx));

    let file = staged.writer()?;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        bytes_fetched.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        if tx.send(Ok(chunk)).await.is_err() {
            // The hasher bailed; its error surfaces below.
            break;
        }
    }
    drop(tx);
    file.flush().await?;

    hasher
        .await
        .map_err(|e| FetchError::Io(std::io::Error::other(e)))?
}

/// Decode gzip from the channel and feed the dual tree hasher.
async fn hash_tar_stream(rx: mpsc::Receiver<std::io::Result<Bytes>>) -> FetchResult<TreeHashPair> {
    let chunks = async_stream::stream! {
        let mut rx = rx;
        while let Some(item) = rx.recv().await {
            yield item;
        }
    };
    let mut decoder = GzipDecoder::new(StreamReader::new(Box::pin(chunks)));
    let mut hasher = TarTreeHasher::new();
    let mut buf = vec![0u8; DECODE_BUF];
    loop {
        let n = decoder.read(&mut buf).await.map_err(FetchError::Decode)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
    }
    Ok(hasher.finalize()?)
}
