//! Tarball fixtures for end-to-end tests.

use depot_core::{ResourceKey, TarTreeHasher, TreeHashPair};
use httpmock::Method::{GET, HEAD};
use httpmock::MockServer;
use tokio::io::AsyncWriteExt;

const BLOCK: usize = 512;

fn header(name: &str, size: u64, typeflag: u8) -> [u8; BLOCK] {
    let mut block = [0u8; BLOCK];
    block[..name.len()].copy_from_slice(name.as_bytes());
    let size_field = format!("{size:011o}\0");
    block[124..124 + size_field.len()].copy_from_slice(size_field.as_bytes());
    block[156] = typeflag;
    block[257..262].copy_from_slice(b"ustar");
    block[148..156].copy_from_slice(b"        ");
    block
}

/// A tar with one regular file and optionally one directory entry.
#[allow(dead_code)]
pub fn tar_fixture(with_dir: bool, content: &[u8]) -> Vec<u8> {
    let mut tar = Vec::new();
    if with_dir {
        tar.extend_from_slice(&header("pkg/empty/", 0, b'5'));
    }
    tar.extend_from_slice(&header("pkg/data.bin", content.len() as u64, b'0'));
    tar.extend_from_slice(content);
    tar.extend_from_slice(&vec![0u8; (BLOCK - content.len() % BLOCK) % BLOCK]);
    tar.extend_from_slice(&[0u8; BLOCK * 2]);
    tar
}

/// Both tree hashes of a tar byte stream.
#[allow(dead_code)]
pub fn hashes_of(tar: &[u8]) -> TreeHashPair {
    let mut hasher = TarTreeHasher::new();
    hasher.update(tar).unwrap();
    hasher.finalize().unwrap()
}

/// Gzip-compress a byte stream.
#[allow(dead_code)]
pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = async_compression::tokio::write::GzipEncoder::new(Vec::new());
    encoder.write_all(data).await.unwrap();
    encoder.shutdown().await.unwrap();
    encoder.into_inner()
}

/// A gzipped artifact tarball addressed by its canonical hash.
#[allow(dead_code)]
pub async fn artifact_fixture(content: &[u8]) -> (ResourceKey, Vec<u8>) {
    let tar = tar_fixture(false, content);
    let gz = gzip(&tar).await;
    (ResourceKey::artifact(hashes_of(&tar).no_skip), gz)
}

/// Mock a storage server holding one resource (HEAD + GET).
#[allow(dead_code)]
pub fn mock_resource(server: &MockServer, key: &ResourceKey, gz: &[u8]) {
    let path = key.to_string();
    server.mock(|when, then| {
        when.method(HEAD).path(&path);
        then.status(200)
            .header("content-length", gz.len().to_string());
    });
    server.mock(|when, then| {
        when.method(GET).path(&path);
        then.status(200).body(gz.to_vec());
    });
}
