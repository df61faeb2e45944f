//! Upstream selection by concurrent HEAD probing.
//!
//! Every candidate storage server is probed at once; the first to answer
//! 200 wins and the remaining probes are abandoned. Selecting by response
//! latency among servers that actually hold the resource routes around slow
//! or partitioned upstreams without static priority configuration.

use depot_core::ResourceKey;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use std::time::Duration;

/// A storage server that confirmed it holds the resource.
#[derive(Clone, Debug)]
pub struct ProbeHit {
    /// Base URL of the winning server.
    pub server: String,
    /// Content length reported by its HEAD response.
    pub content_length: u64,
}

/// Probe `servers` for `key` and return the first 200 response.
///
/// Non-200 responses are silently skipped; a probe that errors or times out
/// is retried up to `retries` times and then treated as non-200. Returns
/// `None` when no server answers 200.
pub async fn select_upstream(
    client: &reqwest::Client,
    key: &ResourceKey,
    servers: &[String],
    timeout: Duration,
    retries: u32,
) -> Option<ProbeHit> {
    let mut probes: FuturesUnordered<_> = servers
        .iter()
        .map(|server| probe(client, server, key, timeout, retries))
        .collect();

    while let Some(result) = probes.next().await {
        if let Some(hit) = result {
            return Some(hit);
        }
    }
    None
}

async fn probe(
    client: &reqwest::Client,
    server: &str,
    key: &ResourceKey,
    timeout: Duration,
    retries: u32,
) -> Option<ProbeHit> {
    let url = format!("{server}{key}");
    for attempt in 0..=retries {
        match client.head(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                let content_length = resp
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                match content_length {
                    Some(content_length) => {
                        return Some(ProbeHit {
                            server: server.to_string(),
                            content_length,
                        });
                    }
                    None => {
                        tracing::debug!(server, resource = %key, "200 probe without content-length, skipping");
                        return None;
                    }
                }
            }
            Ok(_) => return None,
            Err(e) => {
                tracing::debug!(server, resource = %key, attempt, error = %e, "probe failed");
            }
        }
    }
    None
}
