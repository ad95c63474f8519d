//! Write-once artifact cache shared by concurrently running variants.

use crate::error::PackagingError;
use crate::repair::RepairedArtifact;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Entries {
    by_signature: HashMap<String, Arc<RepairedArtifact>>,
    locations: HashMap<PathBuf, String>,
}

/// Published artifacts keyed by variant signature. Entries are never
/// replaced or mutated once published.
#[derive(Clone, Default)]
pub struct ArtifactCache {
    entries: Arc<RwLock<Entries>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an artifact. Fails if the signature already has an entry or
    /// another variant owns the location.
    pub async fn publish(&self, artifact: RepairedArtifact) -> Result<Arc<RepairedArtifact>, PackagingError> {
        let mut entries = self.entries.write().await;
        let signature = artifact.descriptor.signature.clone();
        if entries.by_signature.contains_key(&signature) {
            return Err(PackagingError::AlreadyPublished(artifact.descriptor.variant_id.clone()));
        }
        let location = artifact.descriptor.location.clone();
        if let Some(owner) = entries.locations.get(&location) {
            if owner != &signature {
                return Err(PackagingError::LocationCollision(location.display().to_string()));
            }
        }

        let artifact = Arc::new(artifact);
        entries.locations.insert(location, signature.clone());
        entries.by_signature.insert(signature, artifact.clone());
        Ok(artifact)
    }

    pub async fn get(&self, signature: &str) -> Option<Arc<RepairedArtifact>> {
        self.entries.read().await.by_signature.get(signature).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_signature.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::ArtifactDescriptor;

    fn artifact(signature: &str, location: &str) -> RepairedArtifact {
        RepairedArtifact {
            descriptor: ArtifactDescriptor {
                variant_id: signature.to_string(),
                signature: signature.to_string(),
                abi_tag: "cp311".to_string(),
                platform_tag: "linux_x86_64".to_string(),
                accelerated: false,
                location: PathBuf::from(location),
                file_name: location.to_string(),
                content_digest: "0".repeat(64),
            },
            needed: Vec::new(),
            vendored: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_is_write_once() {
        let cache = ArtifactCache::new();
        cache.publish(artifact("runtime=3.11", "/dist/a")).await.unwrap();
        let err = cache.publish(artifact("runtime=3.11", "/dist/b")).await.unwrap_err();
        assert!(matches!(err, PackagingError::AlreadyPublished(_)));

        let stored = cache.get("runtime=3.11").await.unwrap();
        assert_eq!(stored.descriptor.location, PathBuf::from("/dist/a"));
    }

    #[tokio::test]
    async fn test_location_collision_between_variants() {
        let cache = ArtifactCache::new();
        cache.publish(artifact("runtime=3.11", "/dist/a")).await.unwrap();
        let err = cache.publish(artifact("runtime=3.12", "/dist/a")).await.unwrap_err();
        assert!(matches!(err, PackagingError::LocationCollision(_)));
        assert_eq!(cache.len().await, 1);
    }
}
