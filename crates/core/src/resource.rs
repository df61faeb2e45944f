//! Content-addressed resource identities.
//!
//! Every resource depot serves is immutable and identified by a path of one
//! of three forms:
//!
//! - `/registry/{uuid}/{hash}`
//! - `/package/{uuid}/{hash}`
//! - `/artifact/{hash}`
//!
//! where `uuid` is a lowercase UUID and `hash` is a 40-character lowercase
//! hex tree hash. The same path always refers to identical bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A 160-bit tree hash represented as 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeHash([u8; 20]);

impl TreeHash {
    /// Create a new TreeHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse from a 40-character lowercase hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 40 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 40 hex chars, got {}",
                s.len()
            )));
        }
        if s.bytes().any(|b| !matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(crate::Error::InvalidHash(format!(
                "expected lowercase hex: {s}"
            )));
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The three resource namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Registry,
    Package,
    Artifact,
}

impl ResourceKind {
    /// The path segment naming this namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Package => "package",
            Self::Artifact => "artifact",
        }
    }
}

/// A validated, content-addressed resource key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    kind: ResourceKind,
    uuid: Option<Uuid>,
    hash: TreeHash,
}

impl ResourceKey {
    /// Build a registry key.
    pub fn registry(uuid: Uuid, hash: TreeHash) -> Self {
        Self {
            kind: ResourceKind::Registry,
            uuid: Some(uuid),
            hash,
        }
    }

    /// Build a package key.
    pub fn package(uuid: Uuid, hash: TreeHash) -> Self {
        Self {
            kind: ResourceKind::Package,
            uuid: Some(uuid),
            hash,
        }
    }

    /// Build an artifact key.
    pub fn artifact(hash: TreeHash) -> Self {
        Self {
            kind: ResourceKind::Artifact,
            uuid: None,
            hash,
        }
    }

    /// Parse a resource path of the form `/registry/{uuid}/{hash}`,
    /// `/package/{uuid}/{hash}`, or `/artifact/{hash}`.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| crate::Error::InvalidResourcePath(path.to_string()))?;
        let mut segments = rest.split('/');

        let kind = match segments.next() {
            Some("registry") => ResourceKind::Registry,
            Some("package") => ResourceKind::Package,
            Some("artifact") => ResourceKind::Artifact,
            _ => return Err(crate::Error::InvalidResourcePath(path.to_string())),
        };

        let uuid = if kind == ResourceKind::Artifact {
            None
        } else {
            let seg = segments
                .next()
                .ok_or_else(|| crate::Error::InvalidResourcePath(path.to_string()))?;
            Some(parse_lowercase_uuid(seg)?)
        };

        let hash_seg = segments
            .next()
            .ok_or_else(|| crate::Error::InvalidResourcePath(path.to_string()))?;
        let hash = TreeHash::from_hex(hash_seg)?;

        if segments.next().is_some() {
            return Err(crate::Error::InvalidResourcePath(path.to_string()));
        }

        Ok(Self { kind, uuid, hash })
    }

    /// The namespace of this key.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The UUID component (absent for artifacts).
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    /// The tree hash component.
    pub fn hash(&self) -> TreeHash {
        self.hash
    }

    /// The same key addressed under a different tree hash.
    pub fn with_hash(&self, hash: TreeHash) -> Self {
        Self {
            kind: self.kind,
            uuid: self.uuid,
            hash,
        }
    }

    /// The on-disk relative path for this key (the resource path without
    /// its leading slash).
    pub fn storage_key(&self) -> String {
        self.to_string().split_off(1)
    }
}

/// UUIDs in resource paths must be the canonical lowercase 8-4-4-4-12 form;
/// `Uuid::parse_str` is laxer than that.
fn parse_lowercase_uuid(s: &str) -> crate::Result<Uuid> {
    let shape_ok = s.len() == 36
        && s.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => matches!(b, b'0'..=b'9' | b'a'..=b'f'),
        });
    if !shape_ok {
        return Err(crate::Error::InvalidResourcePath(format!(
            "malformed uuid segment: {s}"
        )));
    }
    Uuid::parse_str(s).map_err(|e| crate::Error::InvalidResourcePath(e.to_string()))
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uuid {
            Some(uuid) => write!(f, "/{}/{}/{}", self.kind.as_str(), uuid, self.hash),
            None => write!(f, "/{}/{}", self.kind.as_str(), self.hash),
        }
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceKey({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
    const UUID: &str = "01234567-89ab-4def-8123-456789abcdef";

    #[test]
    fn tree_hash_roundtrip() {
        let hash = TreeHash::from_hex(HASH).unwrap();
        assert_eq!(hash.to_hex(), HASH);
        assert_eq!(TreeHash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    #[test]
    fn tree_hash_rejects_bad_input() {
        assert!(TreeHash::from_hex("deadbeef").is_err());
        assert!(TreeHash::from_hex(&HASH.to_uppercase()).is_err());
        assert!(TreeHash::from_hex(&"g".repeat(40)).is_err());
    }

    #[test]
    fn parse_artifact() {
        let key = ResourceKey::parse(&format!("/artifact/{HASH}")).unwrap();
        assert_eq!(key.kind(), ResourceKind::Artifact);
        assert_eq!(key.uuid(), None);
        assert_eq!(key.hash().to_hex(), HASH);
        assert_eq!(key.to_string(), format!("/artifact/{HASH}"));
    }

    #[test]
    fn parse_registry_and_package() {
        for kind in ["registry", "package"] {
            let path = format!("/{kind}/{UUID}/{HASH}");
            let key = ResourceKey::parse(&path).unwrap();
            assert_eq!(key.uuid().unwrap().to_string(), UUID);
            assert_eq!(key.to_string(), path);
            assert_eq!(key.storage_key(), &path[1..]);
        }
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        assert!(ResourceKey::parse("/artifact").is_err());
        assert!(ResourceKey::parse(&format!("artifact/{HASH}")).is_err());
        assert!(ResourceKey::parse(&format!("/bundle/{HASH}")).is_err());
        assert!(ResourceKey::parse(&format!("/artifact/{HASH}/extra")).is_err());
        assert!(ResourceKey::parse(&format!("/registry/{HASH}")).is_err());
        assert!(ResourceKey::parse(&format!("/registry/{}/{HASH}", UUID.to_uppercase())).is_err());
        // Uuid::parse_str accepts the urn: form; resource paths must not.
        assert!(ResourceKey::parse(&format!("/registry/urn:uuid:{UUID}/{HASH}")).is_err());
    }

    #[test]
    fn with_hash_keeps_namespace() {
        let other = TreeHash::from_bytes([7u8; 20]);
        let key = ResourceKey::parse(&format!("/package/{UUID}/{HASH}")).unwrap();
        let moved = key.with_hash(other);
        assert_eq!(moved.kind(), ResourceKind::Package);
        assert_eq!(moved.uuid(), key.uuid());
        assert_eq!(moved.hash(), other);
    }
}
