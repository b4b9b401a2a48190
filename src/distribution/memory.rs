use crate::{
    distribution::{distribution_sources, is_manifest_key, ContentWriter, Fetcher, Pusher, Registry},
    error::*,
    image::{Descriptor, DescriptorEx},
    Digest, ImageName,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Blob {
    media_type: String,
    data: Bytes,
}

/// Blobs and tags keyed by digest strings
#[derive(Debug, Default)]
struct Repository {
    blobs: HashMap<String, Blob>,
    tags: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Store {
    /// Keyed by `hostname[:port]/name`
    repositories: HashMap<String, Repository>,
    uploads: Vec<String>,
    mounts: Vec<(String, String)>,
}

/// Registry kept in memory, shared between its clones
///
/// Serves any number of hosts and repositories.
/// Cross-repository mount is emulated within the same hostname.
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use imagetools::{distribution::{MemoryRegistry, Registry}, ImageName};
///
/// let registry = MemoryRegistry::new();
/// let name = ImageName::parse("localhost:5000/demo:v1").unwrap();
/// let desc = registry
///     .insert(&name, "application/vnd.oci.image.index.v1+json", br#"{"schemaVersion":2}"#)
///     .await;
/// assert_eq!(registry.resolve(&name).await.unwrap(), desc);
/// # })
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    store: Arc<RwLock<Store>>,
}

fn repository_key(name: &ImageName) -> String {
    name.trimmed().to_string()
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` into the repository of `name`, and tag it if `name` has a tag
    pub async fn insert(&self, name: &ImageName, media_type: &str, data: &[u8]) -> Descriptor {
        let desc = Descriptor::from_bytes(media_type, data);
        let mut store = self.store.write().await;
        let repo = store.repositories.entry(repository_key(name)).or_default();
        repo.blobs.insert(
            desc.digest().clone(),
            Blob {
                media_type: media_type.to_string(),
                data: Bytes::copy_from_slice(data),
            },
        );
        if let Some(tag) = &name.tag {
            repo.tags.insert(tag.clone(), desc.digest().clone());
        }
        desc
    }

    /// Content of `digest` in the repository of `name`
    pub async fn get(&self, name: &ImageName, digest: &str) -> Option<Bytes> {
        let store = self.store.read().await;
        store
            .repositories
            .get(&repository_key(name))?
            .blobs
            .get(digest)
            .map(|blob| blob.data.clone())
    }

    /// Digest the tag of `name` points to
    pub async fn tagged(&self, name: &ImageName) -> Option<String> {
        let tag = name.tag.as_ref()?;
        let store = self.store.read().await;
        store
            .repositories
            .get(&repository_key(name))?
            .tags
            .get(tag.as_str())
            .cloned()
    }

    /// Reference keys of the committed contents, in commit order
    pub async fn uploads(&self) -> Vec<String> {
        self.store.read().await.uploads.clone()
    }

    /// Blobs mounted from other repositories, with the destination repository
    pub async fn mounts(&self) -> Vec<(String, String)> {
        self.store.read().await.mounts.clone()
    }
}

/// Fixtures of images for tests
#[cfg(test)]
impl MemoryRegistry {
    /// Store a single platform image with a config and a layer, and return the manifest descriptor
    pub(crate) async fn insert_image(
        &self,
        name: &ImageName,
        manifest_type: &str,
        os: &str,
        arch: &str,
        variant: &str,
    ) -> Descriptor {
        use crate::media_types::*;
        let repo = name.trimmed();
        let (config_type, layer_type) = if is_docker(manifest_type) {
            (DOCKER_CONFIG.to_string(), DOCKER_LAYER_GZIP.to_string())
        } else {
            (oci_config(), "application/vnd.oci.image.layer.v1.tar+gzip".to_string())
        };
        let mut config = serde_json::json!({ "architecture": arch, "os": os, "rootfs": {} });
        if !variant.is_empty() {
            config["variant"] = variant.into();
        }
        let config = self
            .insert(&repo, &config_type, config.to_string().as_bytes())
            .await;
        let layer = self
            .insert(&repo, &layer_type, format!("{}/{}/{}", os, arch, variant).as_bytes())
            .await;
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": manifest_type,
            "config": config,
            "layers": [layer],
        });
        self.insert(name, manifest_type, manifest.to_string().as_bytes())
            .await
    }

    /// Store an index of `manifests`
    pub(crate) async fn insert_index(
        &self,
        name: &ImageName,
        index_type: &str,
        manifests: Vec<Descriptor>,
    ) -> Descriptor {
        use crate::image::{write_index, ImageIndexBuilder, MediaType, SCHEMA_VERSION};
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::from(index_type))
            .manifests(manifests)
            .build()
            .expect("all fields are set");
        let buf = write_index(&index).expect("index is serializable");
        self.insert(name, index_type, &buf).await
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn resolve(&self, name: &ImageName) -> Result<Descriptor> {
        let store = self.store.read().await;
        let not_found = || Error::NotFound(name.to_string());
        let repo = store
            .repositories
            .get(&repository_key(name))
            .ok_or_else(not_found)?;
        let digest = match (&name.digest, &name.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => repo.tags.get(tag.as_str()).cloned().ok_or_else(not_found)?,
            (None, None) => repo
                .tags
                .get(crate::image_name::DEFAULT_TAG)
                .cloned()
                .ok_or_else(not_found)?,
        };
        let blob = repo.blobs.get(&digest).ok_or_else(not_found)?;
        let mut desc = Descriptor::from_bytes(&blob.media_type, &blob.data);
        desc.set_digest(digest);
        Ok(desc)
    }

    async fn fetcher(&self, name: &ImageName) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(MemoryFetcher {
            store: self.store.clone(),
            repository: repository_key(name),
        }))
    }

    async fn pusher(&self, name: &ImageName) -> Result<Box<dyn Pusher>> {
        Ok(Box::new(MemoryPusher {
            store: self.store.clone(),
            hostname: name.hostname.clone(),
            repository: repository_key(name),
            tag: name.tag.clone(),
        }))
    }
}

struct MemoryFetcher {
    store: Arc<RwLock<Store>>,
    repository: String,
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, desc: &Descriptor) -> Result<Bytes> {
        let store = self.store.read().await;
        store
            .repositories
            .get(&self.repository)
            .and_then(|repo| repo.blobs.get(desc.digest()))
            .map(|blob| blob.data.clone())
            .ok_or_else(|| Error::NotFound(format!("{}@{}", self.repository, desc.digest())))
    }
}

struct MemoryPusher {
    store: Arc<RwLock<Store>>,
    hostname: String,
    repository: String,
    tag: Option<String>,
}

#[async_trait]
impl Pusher for MemoryPusher {
    async fn push(&self, ref_key: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        let manifest = is_manifest_key(ref_key);
        let tag = if manifest { self.tag.clone() } else { None };

        let mut store = self.store.write().await;
        let exists = match store.repositories.get(&self.repository) {
            Some(repo) => match &tag {
                Some(tag) => repo.tags.get(tag) == Some(desc.digest()),
                None => repo.blobs.contains_key(desc.digest()),
            },
            None => false,
        };
        if exists {
            return Err(Error::AlreadyExists(ref_key.to_string()));
        }

        if !manifest {
            let mount = distribution_sources(desc)
                .filter(|(host, _)| *host == self.hostname)
                .find_map(|(host, path)| {
                    let from = store.repositories.keys().find(|key| {
                        key.split_once('/')
                            .map(|(domain, name)| {
                                name == path && domain.split(':').next() == Some(host)
                            })
                            .unwrap_or(false)
                    })?;
                    store.repositories[from].blobs.get(desc.digest()).cloned()
                });
            if let Some(blob) = mount {
                store
                    .repositories
                    .entry(self.repository.clone())
                    .or_default()
                    .blobs
                    .insert(desc.digest().clone(), blob);
                store
                    .mounts
                    .push((self.repository.clone(), desc.digest().clone()));
                return Err(Error::AlreadyExists(ref_key.to_string()));
            }
        }

        Ok(Box::new(MemoryWriter {
            store: self.store.clone(),
            repository: self.repository.clone(),
            tag,
            ref_key: ref_key.to_string(),
            media_type: desc.media_type().to_string(),
            buf: Vec::new(),
        }))
    }
}

struct MemoryWriter {
    store: Arc<RwLock<Store>>,
    repository: String,
    tag: Option<String>,
    ref_key: String,
    media_type: String,
    buf: Vec<u8>,
}

#[async_trait]
impl ContentWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn commit(self: Box<Self>, size: i64, expected: &Digest) -> Result<()> {
        let MemoryWriter {
            store,
            repository,
            tag,
            ref_key,
            media_type,
            buf,
        } = *self;
        let actual = buf.len() as i64;
        if actual != size {
            return Err(Error::SizeMismatch {
                digest: expected.to_string(),
                expected: size,
                actual,
            });
        }
        expected.verify(&buf)?;

        let digest = expected.to_string();
        let mut store = store.write().await;
        let repo = store.repositories.entry(repository).or_default();
        if tag.is_none() && repo.blobs.contains_key(&digest) {
            return Err(Error::AlreadyExists(ref_key));
        }
        repo.blobs.insert(
            digest.clone(),
            Blob {
                media_type,
                data: Bytes::from(buf),
            },
        );
        if let Some(tag) = tag {
            repo.tags.insert(tag, digest);
        }
        store.uploads.push(ref_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        distribution::{content_copy, DISTRIBUTION_SOURCE_PREFIX},
        media_types::*,
    };

    fn rejected(result: Result<Box<dyn ContentWriter>>) -> Error {
        match result {
            Ok(_) => panic!("push is expected to be rejected"),
            Err(err) => err,
        }
    }

    #[tokio::test]
    async fn push_and_fetch() -> Result<()> {
        let registry = MemoryRegistry::new();
        let name = ImageName::parse("localhost:5000/test:v1")?;
        let buf = br#"{"schemaVersion":2}"#;
        let desc = Descriptor::from_bytes(&oci_index(), buf);

        let pusher = registry.pusher(&name).await?;
        let key = format!("index-{}", desc.digest());
        let writer = pusher.push(&key, &desc).await?;
        content_copy(writer, buf, desc.size(), &desc.content_digest()?).await?;

        assert_eq!(registry.resolve(&name).await?, desc);
        assert_eq!(registry.tagged(&name).await.as_ref(), Some(desc.digest()));
        let fetched = registry.fetcher(&name).await?.fetch(&desc).await?;
        assert_eq!(fetched.as_ref(), buf);
        assert_eq!(registry.uploads().await, vec![key.clone()]);

        // Tag already points the same digest
        assert!(rejected(pusher.push(&key, &desc).await).is_already_exists());
        Ok(())
    }

    #[tokio::test]
    async fn retag() -> Result<()> {
        let registry = MemoryRegistry::new();
        let v1 = ImageName::parse("localhost:5000/test:v1")?;
        let v2 = ImageName::parse("localhost:5000/test:v2")?;
        let buf = br#"{"schemaVersion":2}"#;
        let desc = registry.insert(&v1, &oci_index(), buf).await;

        let key = format!("index-{}", desc.digest());
        let writer = registry.pusher(&v2).await?.push(&key, &desc).await?;
        content_copy(writer, buf, desc.size(), &desc.content_digest()?).await?;
        assert_eq!(registry.tagged(&v2).await.as_ref(), Some(desc.digest()));
        Ok(())
    }

    #[tokio::test]
    async fn blob_exists() -> Result<()> {
        let registry = MemoryRegistry::new();
        let name = ImageName::parse("localhost:5000/test:v1")?;
        let desc = registry.insert(&name.trimmed(), DOCKER_LAYER_GZIP, b"layer").await;
        let pusher = registry.pusher(&name).await?;
        let err = rejected(pusher.push(&format!("layer-{}", desc.digest()), &desc).await);
        assert!(err.is_already_exists());
        assert!(registry.uploads().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn mount() -> Result<()> {
        let registry = MemoryRegistry::new();
        let from = ImageName::parse("localhost:5000/from")?;
        let to = ImageName::parse("localhost:5000/to:v1")?;
        let mut desc = registry.insert(&from, DOCKER_LAYER_GZIP, b"layer").await;
        desc.insert_annotation(&format!("{}localhost", DISTRIBUTION_SOURCE_PREFIX), "from");

        let pusher = registry.pusher(&to).await?;
        let err = rejected(pusher.push(&format!("layer-{}", desc.digest()), &desc).await);
        assert!(err.is_already_exists());
        assert_eq!(
            registry.get(&to, desc.digest()).await.as_deref(),
            Some(&b"layer"[..])
        );
        assert_eq!(
            registry.mounts().await,
            vec![("localhost:5000/to".to_string(), desc.digest().clone())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn not_found() -> Result<()> {
        let registry = MemoryRegistry::new();
        let name = ImageName::parse("localhost:5000/test:v1")?;
        assert!(registry.resolve(&name).await.unwrap_err().is_not_found());
        let desc = Descriptor::from_bytes(DOCKER_CONFIG, b"{}");
        let err = registry.fetcher(&name).await?.fetch(&desc).await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_content_is_rejected() -> Result<()> {
        let registry = MemoryRegistry::new();
        let name = ImageName::parse("localhost:5000/test:v1")?;
        let desc = Descriptor::from_bytes(DOCKER_CONFIG, b"{}");
        let writer = registry
            .pusher(&name)
            .await?
            .push(&format!("config-{}", desc.digest()), &desc)
            .await?;
        let err = content_copy(writer, b"{ }", 3, &desc.content_digest()?)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(registry.get(&name, desc.digest()).await.is_none());
        Ok(())
    }
}
