//! Registry tracking.
//!
//! Registries are the only resources whose "current" hash moves over time.
//! The tracker periodically asks every storage server which registry
//! tarballs it advertises, cross-probes the rest, verifies candidates with
//! the registry's origin, and publishes the preferred hash per UUID plus a
//! plain-text index file.
//!
//! A hash advertised by fewer servers is preferred: new registry versions
//! propagate through the storage fleet gradually, so scarcity is the best
//! available freshness signal. A rogue storage server cannot inject an
//! arbitrary tarball because every candidate must also exist at the
//! registry's configured origin.

use depot_cache::DiskCache;
use depot_core::config::{AppConfig, RegistryConfig};
use depot_core::{ResourceKey, ResourceKind, TreeHash};
use depot_fetch::{FetchCoordinator, FetchOutcome};
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Periodic registry tracker.
pub struct RegistryTracker {
    client: reqwest::Client,
    cache: Arc<DiskCache>,
    coordinator: Arc<FetchCoordinator>,
    servers: Vec<String>,
    registries: Vec<RegistryConfig>,
    probe_timeout: Duration,
    index_path: PathBuf,
    latest: RwLock<BTreeMap<Uuid, TreeHash>>,
}

impl RegistryTracker {
    /// Create a tracker over the configured registries and storage servers.
    pub fn new(
        client: reqwest::Client,
        cache: Arc<DiskCache>,
        coordinator: Arc<FetchCoordinator>,
        config: &AppConfig,
    ) -> Self {
        Self {
            client,
            cache,
            coordinator,
            servers: config.upstream.servers.clone(),
            registries: config.registries.clone(),
            probe_timeout: config.upstream.probe_timeout(),
            index_path: config.cache.static_dir().join("registries"),
            latest: RwLock::new(BTreeMap::new()),
        }
    }

    /// The current verified hash for a registry, if one has been published.
    pub async fn latest_hash(&self, uuid: Uuid) -> Option<TreeHash> {
        self.latest.read().await.get(&uuid).copied()
    }

    /// Run ticks forever at the configured interval.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// One tracking pass over every configured registry.
    ///
    /// A published hash has always passed origin verification, and its
    /// tarball is cached or its download has been awaited, before any
    /// reader can observe it.
    pub async fn tick(&self) {
        if self.registries.is_empty() {
            return;
        }

        let hash_info = self.collect_advertisements().await;
        let hash_info = self.cross_probe(hash_info).await;

        let mut changed = false;
        for registry in &self.registries {
            let Some(hashes) = hash_info.get(&registry.uuid) else {
                continue;
            };

            // Ascending advertiser count prefers the newest hash (advertised
            // by fewest servers); the hash itself makes ties deterministic.
            let mut candidates: Vec<(usize, TreeHash)> = hashes
                .iter()
                .map(|(hash, servers)| (servers.len(), *hash))
                .collect();
            candidates.sort();

            for (_, hash) in candidates {
                if self.adopt_candidate(registry, hash).await {
                    let mut latest = self.latest.write().await;
                    if latest.insert(registry.uuid, hash) != Some(hash) {
                        changed = true;
                        tracing::info!(
                            registry = %registry.uuid,
                            hash = %hash,
                            "registry moved to new hash"
                        );
                    }
                    break;
                }
            }
        }

        if changed || !self.index_path.exists() {
            if let Err(e) = self.publish_index().await {
                tracing::error!(error = %e, "failed to publish registries index");
            }
        }
    }

    /// Ask every storage server for its `/registries` index and collect
    /// which servers advertise which hash, keyed by configured UUID.
    async fn collect_advertisements(
        &self,
    ) -> HashMap<Uuid, HashMap<TreeHash, HashSet<String>>> {
        let configured: HashSet<Uuid> = self.registries.iter().map(|r| r.uuid).collect();
        let mut hash_info: HashMap<Uuid, HashMap<TreeHash, HashSet<String>>> = HashMap::new();

        for server in &self.servers {
            let url = format!("{server}/registries");
            let text = match self
                .client
                .get(&url)
                .timeout(self.probe_timeout)
                .send()
                .await
            {
                Ok(resp) if resp.status() == StatusCode::OK => match resp.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(server, error = %e, "failed to read registries index");
                        continue;
                    }
                },
                Ok(resp) => {
                    tracing::warn!(server, status = %resp.status(), "registries index unavailable");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(server, error = %e, "failed to reach storage server");
                    continue;
                }
            };

            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match ResourceKey::parse(line) {
                    Ok(key) if key.kind() == ResourceKind::Registry => {
                        let uuid = key.uuid().expect("registry keys carry a uuid");
                        if !configured.contains(&uuid) {
                            continue;
                        }
                        hash_info
                            .entry(uuid)
                            .or_default()
                            .entry(key.hash())
                            .or_default()
                            .insert(server.clone());
                    }
                    _ => {
                        tracing::debug!(server, line, "skipping unrecognized index line");
                    }
                }
            }
        }
        hash_info
    }

    /// HEAD-probe every server that did not advertise a hash; servers that
    /// turn out to hold it count as advertisers too.
    async fn cross_probe(
        &self,
        mut hash_info: HashMap<Uuid, HashMap<TreeHash, HashSet<String>>>,
    ) -> HashMap<Uuid, HashMap<TreeHash, HashSet<String>>> {
        for (uuid, hashes) in hash_info.iter_mut() {
            for (hash, advertisers) in hashes.iter_mut() {
                let key = ResourceKey::registry(*uuid, *hash);
                for server in &self.servers {
                    if advertisers.contains(server) {
                        continue;
                    }
                    let url = format!("{server}{key}");
                    match self
                        .client
                        .head(&url)
                        .timeout(self.probe_timeout)
                        .send()
                        .await
                    {
                        Ok(resp) if resp.status() == StatusCode::OK => {
                            advertisers.insert(server.clone());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(server, resource = %key, error = %e, "cross-probe failed");
                        }
                    }
                }
            }
        }
        hash_info
    }

    /// A candidate becomes adoptable once its origin confirms the hash and
    /// its tarball is cached (downloading it now if needed).
    async fn adopt_candidate(&self, registry: &RegistryConfig, hash: TreeHash) -> bool {
        if !self.origin_verified(registry, hash).await {
            return false;
        }

        let key = ResourceKey::registry(registry.uuid, hash);
        if self.cache.contains(&key) {
            return true;
        }
        match self.coordinator.fetch(&key, &self.servers).await {
            FetchOutcome::Download(state) => {
                state.handle().wait().await;
                self.cache.contains(&key)
            }
            FetchOutcome::NoUpstream | FetchOutcome::Failed => false,
        }
    }

    /// HEAD the origin archive derived from the registry's URL template.
    async fn origin_verified(&self, registry: &RegistryConfig, hash: TreeHash) -> bool {
        let url = registry.origin_archive_url(&hash);
        match self
            .client
            .head(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                tracing::warn!(
                    registry = %registry.uuid,
                    hash = %hash,
                    status = %resp.status(),
                    "origin rejected registry hash, skipping this tick"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    registry = %registry.uuid,
                    hash = %hash,
                    error = %e,
                    "origin unreachable, skipping this tick"
                );
                false
            }
        }
    }

    /// Atomically rewrite the published index: one line per known UUID,
    /// sorted by UUID, `/registry/{uuid}/{hash}` each.
    async fn publish_index(&self) -> std::io::Result<()> {
        let latest = self.latest.read().await;
        let mut contents = String::new();
        for (uuid, hash) in latest.iter() {
            contents.push_str(&format!("/registry/{uuid}/{hash}\n"));
        }
        drop(latest);

        let tmp = self
            .index_path
            .with_file_name(format!("registries.{}.tmp", Uuid::new_v4()));
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, contents.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        tracing::info!(path = %self.index_path.display(), "published registries index");
        Ok(())
    }
}
