//! Compose an image index from manifests and indexes stored in registries

use crate::{
    distribution::{fetch_verified, MediaTypePrefixes, Registry},
    error::*,
    image::*,
    media_types, ImageName,
};
use bytes::Bytes;
use futures::future::try_join_all;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Manifest or index in a registry, to be put into a composed index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: ImageName,
    /// Media type and platform may be empty,
    /// and are filled by [Resolver::combine].
    pub desc: Descriptor,
}

/// Compose, push, and copy images through a [Registry]
pub struct Resolver<R: Registry> {
    registry: R,
    pub(crate) prefixes: MediaTypePrefixes,
}

impl<R: Registry> Resolver<R> {
    pub fn new(registry: R) -> Self {
        Resolver {
            registry,
            prefixes: MediaTypePrefixes::default().with(media_types::IN_TOTO, "intoto"),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Ask the registry the descriptor `name` points to
    pub async fn source(&self, name: &ImageName) -> Result<Source> {
        let desc = self.registry.resolve(name).await?;
        Ok(Source {
            name: name.clone(),
            desc,
        })
    }

    /// Fetch the content `desc` points to from the repository of `name`
    ///
    /// The content is verified by the digest and size of `desc`.
    pub async fn get_descriptor(&self, name: &ImageName, desc: &Descriptor) -> Result<Bytes> {
        let fetch = async {
            let fetcher = self.registry.fetcher(name).await?;
            fetch_verified(&*fetcher, desc).await
        };
        fetch.await.map_err(|e| Error::SourceFetchFailed {
            reference: name.to_string(),
            digest: desc.digest().clone(),
            source: Box::new(e),
        })
    }

    /// Fill unknown OS, architecture, and variant of `platform`
    /// by the configuration blob of the manifest `buf`
    ///
    /// Fields already set are kept.
    pub async fn load_platform(
        &self,
        platform: &mut Platform,
        name: &ImageName,
        buf: &[u8],
    ) -> Result<()> {
        let load = async {
            let manifest = ImageManifest::from_reader(buf)?;
            let config = self.get_descriptor(name, manifest.config()).await?;
            let record: PlatformRecord =
                serde_json::from_slice(&config).map_err(Error::MalformedManifest)?;
            Ok::<_, Error>(record.into_platform())
        };
        let found = load
            .await
            .map_err(|e| Error::PlatformInferenceFailed {
                reference: name.to_string(),
                source: Box::new(e),
            })?;

        if platform.architecture().to_string().is_empty() {
            platform.set_architecture(found.architecture().clone());
            if platform.variant().as_deref().unwrap_or_default().is_empty() {
                platform.set_variant(found.variant().clone());
            }
        }
        if platform.os().to_string().is_empty() {
            platform.set_os(found.os().clone());
        }
        Ok(())
    }

    /// Fetch the source, and fill its media type and platform
    async fn resolve_source(&self, src: &mut Source) -> Result<Bytes> {
        let buf = self.get_descriptor(&src.name, &src.desc).await?;
        let mut media_type = src.desc.media_type().to_string();
        if media_type.is_empty() {
            media_type = media_types::detect(&buf)?;
            log::debug!("Detected {} for {}", media_type, src.name);
            src.desc.set_media_type(MediaType::from(media_type.as_str()));
        }

        if media_types::is_schema1(&media_type) {
            return Err(Error::Schema1NotAllowed);
        }
        if media_types::is_manifest(&media_type) {
            let mut platform = src.desc.platform().clone().unwrap_or_else(Platform::unknown);
            if platform.is_incomplete() {
                self.load_platform(&mut platform, &src.name, &buf).await?;
                log::debug!("Inferred platform {} for {}", platform.format(), src.name);
            }
            src.desc.set_platform(Some(platform));
        }
        Ok(buf)
    }

    /// Combine sources into an index
    ///
    /// Sources are fetched concurrently, and the first failure aborts others.
    /// `annotations` are given as `type[platform]:key` to value, see [crate::image::annotations].
    ///
    /// Returns the serialized index and its descriptor.
    /// A single index source without annotations is returned as is.
    pub async fn combine(
        &self,
        srcs: &mut [Source],
        annotations: &BTreeMap<String, String>,
    ) -> Result<(Bytes, Descriptor)> {
        let mut bufs = try_join_all(srcs.iter_mut().map(|src| self.resolve_source(src))).await?;

        let is_index = |src: &Source| media_types::is_index(&src.desc.media_type().to_string());
        if srcs.len() == 1 && annotations.is_empty() && is_index(&srcs[0]) {
            return Ok((bufs.remove(0), srcs[0].desc.clone()));
        }

        let mut set = DescriptorSet::default();
        for (src, buf) in srcs.iter().zip(bufs.iter()) {
            if is_index(src) {
                for desc in ImageIndex::from_reader(&buf[..])?.manifests() {
                    set.add(desc.clone());
                }
            } else {
                set.add(src.desc.clone());
            }
        }
        let mut manifests = set.descs;

        let media_type = if manifests
            .iter()
            .all(|desc| media_types::is_docker(&desc.media_type().to_string()))
        {
            media_types::DOCKER_MANIFEST_LIST.to_string()
        } else {
            media_types::oci_index()
        };

        let parsed = parse_annotations(annotations)?;
        let mut index_annotations = HashMap::new();
        if media_type == media_types::oci_index() {
            for (key, value) in &parsed.index {
                index_annotations.insert(key.key.clone(), value.clone());
            }
            for (key, value) in &parsed.manifest_descriptor {
                for desc in manifests.iter_mut() {
                    if key.matches(desc.platform().as_ref()) {
                        desc.insert_annotation(&key.key, value);
                    }
                }
            }
        } else if !parsed.is_empty() {
            return Err(Error::AnnotationsOnDockerList);
        }

        let mut builder = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::from(media_type.as_str()))
            .manifests(manifests);
        if !index_annotations.is_empty() {
            builder = builder.annotations(index_annotations);
        }
        let index = builder.build()?;
        let buf = write_index(&index)?;
        let desc = Descriptor::from_bytes(&media_type, &buf);
        log::debug!(
            "Composed {} with {} manifests: {}",
            media_type,
            index.manifests().len(),
            desc.digest()
        );
        Ok((Bytes::from(buf), desc))
    }
}

/// Descriptors unique by digest, in the order of first appearance
#[derive(Debug, Default)]
struct DescriptorSet {
    descs: Vec<Descriptor>,
    positions: HashMap<String, usize>,
}

impl DescriptorSet {
    /// Add a descriptor, or overlay it onto the one having the same digest
    fn add(&mut self, desc: Descriptor) {
        match self.positions.get(desc.digest()) {
            Some(&i) => {
                let old = &mut self.descs[i];
                if old.media_type().to_string().is_empty() {
                    old.set_media_type(desc.media_type().clone());
                }
                if desc.platform().is_some() {
                    old.set_platform(desc.platform().clone());
                }
                for (key, value) in desc.annotations().iter().flatten() {
                    old.insert_annotation(key, value);
                }
            }
            None => {
                self.positions.insert(desc.digest().clone(), self.descs.len());
                self.descs.push(desc);
            }
        }
    }
}

/// Platform fields of an image configuration
#[derive(Deserialize)]
struct PlatformRecord {
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    variant: Option<String>,
}

impl PlatformRecord {
    fn into_platform(self) -> Platform {
        Platform::from_parts(
            &self.os.unwrap_or_default(),
            &self.architecture.unwrap_or_default(),
            &self.variant.unwrap_or_default(),
        )
        .normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        distribution::{Fetcher, MemoryRegistry, Pusher},
        media_types::*,
        Digest,
    };
    use async_trait::async_trait;
    use maplit::{btreemap, hashmap};
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    fn name(input: &str) -> ImageName {
        ImageName::parse(input).unwrap()
    }

    fn source(name: &ImageName, desc: &Descriptor) -> Source {
        Source {
            name: name.clone(),
            desc: desc.clone(),
        }
    }

    fn no_annotations() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn two_platforms() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let arm64 = name("localhost:5000/app:arm64");
        let a = registry
            .insert_image(&amd64, &oci_manifest(), "linux", "amd64", "")
            .await;
        let b = registry
            .insert_image(&arm64, &oci_manifest(), "linux", "arm64", "")
            .await;

        let resolver = Resolver::new(registry);
        let mut srcs = vec![source(&amd64, &a), source(&arm64, &b)];
        let (buf, desc) = resolver.combine(&mut srcs, &no_annotations()).await?;

        assert_eq!(desc.media_type(), &MediaType::ImageIndex);
        assert_eq!(desc.size(), buf.len() as i64);
        assert_eq!(desc.content_digest()?, Digest::from_buf_sha256(&buf));

        let index = ImageIndex::from_reader(&buf[..])?;
        assert_eq!(index.media_type(), &Some(MediaType::ImageIndex));
        assert!(index.annotations().is_none());
        let digests: Vec<_> = index.manifests().iter().map(|d| d.digest().clone()).collect();
        assert_eq!(digests, vec![a.digest().clone(), b.digest().clone()]);
        assert_eq!(
            index.manifests()[0].platform(),
            &Some(Platform::from_parts("linux", "amd64", ""))
        );
        assert_eq!(
            index.manifests()[1].platform(),
            &Some(Platform::from_parts("linux", "arm64", ""))
        );

        // Sources are completed as a side effect
        assert_eq!(
            srcs[1].desc.platform(),
            &Some(Platform::from_parts("linux", "arm64", ""))
        );
        Ok(())
    }

    #[tokio::test]
    async fn retag_index_as_is() -> Result<()> {
        let registry = MemoryRegistry::new();
        let app = name("localhost:5000/app:v1");
        let a = registry
            .insert_image(&name("localhost:5000/app:amd64"), &oci_manifest(), "linux", "amd64", "")
            .await;
        let mut index = registry.insert_index(&app, &oci_index(), vec![a]).await;
        let stored = registry.get(&app, index.digest()).await.unwrap();

        // Media type is detected from the content
        index.set_media_type(MediaType::from(""));
        let resolver = Resolver::new(registry);
        let mut srcs = vec![source(&app, &index)];
        let (buf, desc) = resolver.combine(&mut srcs, &no_annotations()).await?;
        assert_eq!(buf, stored);
        assert_eq!(desc.digest(), index.digest());
        assert_eq!(desc.media_type(), &MediaType::ImageIndex);
        Ok(())
    }

    #[tokio::test]
    async fn compose_twice_is_identical() -> Result<()> {
        let registry = MemoryRegistry::new();
        let mut srcs = Vec::new();
        for arch in ["amd64", "arm64", "ppc64le"] {
            let n = name(&format!("localhost:5000/app:{}", arch));
            let desc = registry
                .insert_image(&n, &oci_manifest(), "linux", arch, "")
                .await;
            srcs.push(source(&n, &desc));
        }
        let resolver = Resolver::new(registry.clone());
        let (first, desc) = resolver.combine(&mut srcs, &no_annotations()).await?;

        let out = name("localhost:5000/app:multi");
        registry
            .insert(&out, &desc.media_type().to_string(), &first)
            .await;
        let mut srcs = vec![source(&out, &desc)];
        let (second, _) = resolver.combine(&mut srcs, &no_annotations()).await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn infer_platform() -> Result<()> {
        let registry = MemoryRegistry::new();
        let n = name("localhost:5000/app:x86");
        let desc = registry
            .insert_image(&n, &oci_manifest(), "Linux", "x86_64", "")
            .await;
        assert!(desc.platform().is_none());

        let resolver = Resolver::new(registry);
        let mut srcs = vec![source(&n, &desc)];
        let (buf, _) = resolver.combine(&mut srcs, &no_annotations()).await?;
        let index = ImageIndex::from_reader(&buf[..])?;
        assert_eq!(
            index.manifests()[0].platform().as_ref().map(Platform::format).as_deref(),
            Some("linux/amd64")
        );
        Ok(())
    }

    #[tokio::test]
    async fn known_platform_fields_win() -> Result<()> {
        let registry = MemoryRegistry::new();
        let n = name("localhost:5000/app:arm");
        let mut desc = registry
            .insert_image(&n, &oci_manifest(), "linux", "arm", "v6")
            .await;
        desc.set_platform(Some(Platform::from_parts("", "arm", "v5")));

        let resolver = Resolver::new(registry);
        let mut srcs = vec![source(&n, &desc)];
        resolver.combine(&mut srcs, &no_annotations()).await?;
        assert_eq!(
            srcs[0].desc.platform(),
            &Some(Platform::from_parts("linux", "arm", "v5"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn platform_inference_failure() -> Result<()> {
        let registry = MemoryRegistry::new();
        let n = name("localhost:5000/app:broken");
        let config = Descriptor::from_bytes(&oci_config(), b"{}");
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": oci_manifest(),
            "config": config,
            "layers": [],
        });
        // config blob is not stored
        let desc = registry
            .insert(&n, &oci_manifest(), manifest.to_string().as_bytes())
            .await;
        let resolver = Resolver::new(registry);
        let err = resolver
            .combine(&mut [source(&n, &desc)], &no_annotations())
            .await
            .unwrap_err();
        match err {
            Error::PlatformInferenceFailed { source, .. } => assert!(source.is_not_found()),
            e => panic!("unexpected error: {}", e),
        }
        Ok(())
    }

    #[tokio::test]
    async fn annotations() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let arm64 = name("localhost:5000/app:arm64");
        let a = registry
            .insert_image(&amd64, &oci_manifest(), "linux", "amd64", "")
            .await;
        let b = registry
            .insert_image(&arm64, &oci_manifest(), "linux", "arm64", "")
            .await;
        let resolver = Resolver::new(registry);

        let annotations = btreemap! {
            "index:foo".to_string() => "bar".to_string(),
            "index:bar".to_string() => "baz".to_string(),
            "manifest-descriptor:foo".to_string() => "bar".to_string(),
            "manifest-descriptor[linux/amd64]:bar".to_string() => "baz".to_string(),
        };
        let mut srcs = vec![source(&amd64, &a), source(&arm64, &b)];
        let (buf, _) = resolver.combine(&mut srcs, &annotations).await?;
        let index = ImageIndex::from_reader(&buf[..])?;
        assert_eq!(
            index.annotations(),
            &Some(hashmap! {
                "foo".to_string() => "bar".to_string(),
                "bar".to_string() => "baz".to_string(),
            })
        );
        assert_eq!(
            index.manifests()[0].annotations(),
            &Some(hashmap! {
                "foo".to_string() => "bar".to_string(),
                "bar".to_string() => "baz".to_string(),
            })
        );
        assert_eq!(
            index.manifests()[1].annotations(),
            &Some(hashmap! { "foo".to_string() => "bar".to_string() })
        );
        Ok(())
    }

    #[tokio::test]
    async fn scoped_annotation_wins() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let a = registry
            .insert_image(&amd64, &oci_manifest(), "linux", "amd64", "")
            .await;
        let resolver = Resolver::new(registry);
        let annotations = btreemap! {
            "manifest-descriptor[linux/amd64]:foo".to_string() => "amd64".to_string(),
            "manifest-descriptor:foo".to_string() => "any".to_string(),
        };
        let (buf, _) = resolver
            .combine(&mut [source(&amd64, &a)], &annotations)
            .await?;
        let index = ImageIndex::from_reader(&buf[..])?;
        assert_eq!(index.manifests()[0].annotation("foo"), Some("amd64"));
        Ok(())
    }

    #[tokio::test]
    async fn docker_stays_docker() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let arm64 = name("localhost:5000/app:arm64");
        let a = registry
            .insert_image(&amd64, DOCKER_MANIFEST_SCHEMA2, "linux", "amd64", "")
            .await;
        let b = registry
            .insert_image(&arm64, DOCKER_MANIFEST_SCHEMA2, "linux", "arm64", "")
            .await;
        let resolver = Resolver::new(registry);

        let mut srcs = vec![source(&amd64, &a), source(&arm64, &b)];
        let (buf, desc) = resolver.combine(&mut srcs, &no_annotations()).await?;
        assert_eq!(desc.media_type().to_string(), DOCKER_MANIFEST_LIST);
        let index = ImageIndex::from_reader(&buf[..])?;
        assert_eq!(index.media_type(), &Some(MediaType::from(DOCKER_MANIFEST_LIST)));
        assert!(index.annotations().is_none());

        let err = resolver
            .combine(
                &mut srcs,
                &btreemap! { "index:foo".to_string() => "bar".to_string() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AnnotationsOnDockerList));
        Ok(())
    }

    #[tokio::test]
    async fn mixed_becomes_oci() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let arm64 = name("localhost:5000/app:arm64");
        let a = registry
            .insert_image(&amd64, DOCKER_MANIFEST_SCHEMA2, "linux", "amd64", "")
            .await;
        let b = registry
            .insert_image(&arm64, &oci_manifest(), "linux", "arm64", "")
            .await;
        let resolver = Resolver::new(registry);
        let (_, desc) = resolver
            .combine(&mut [source(&amd64, &a), source(&arm64, &b)], &no_annotations())
            .await?;
        assert_eq!(desc.media_type(), &MediaType::ImageIndex);
        Ok(())
    }

    #[tokio::test]
    async fn schema1_is_rejected() -> Result<()> {
        let registry = MemoryRegistry::new();
        let n = name("localhost:5000/app:old");
        let buf = br#"{"schemaVersion": 1, "name": "app", "tag": "old", "fsLayers": [{"blobSum": "sha256:5b0bcabd1ed22e9fb1310cf6c2dec7cdef19f0ad69efa1f392e94a4333501270"}]}"#;
        let desc = registry.insert(&n, "", buf).await;
        assert_eq!(desc.media_type().to_string(), "");
        let resolver = Resolver::new(registry);
        let err = resolver
            .combine(&mut [source(&n, &desc)], &no_annotations())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema1NotAllowed));
        Ok(())
    }

    #[tokio::test]
    async fn bad_annotation_surfaces() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let a = registry
            .insert_image(&amd64, DOCKER_MANIFEST_SCHEMA2, "linux", "amd64", "")
            .await;
        let resolver = Resolver::new(registry);
        let err = resolver
            .combine(
                &mut [source(&amd64, &a)],
                &btreemap! { "layer:foo".to_string() => "bar".to_string() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAnnotationType(_)));
        Ok(())
    }

    #[tokio::test]
    async fn dedup_overlay() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let arm64 = name("localhost:5000/app:arm64");
        let a = registry
            .insert_image(&amd64, &oci_manifest(), "linux", "amd64", "")
            .await;
        let b = registry
            .insert_image(&arm64, &oci_manifest(), "linux", "arm64", "")
            .await;

        let mut a_in_index = a.clone();
        a_in_index.set_platform(Some(Platform::from_parts("linux", "amd64", "")));
        a_in_index.insert_annotation("from", "index");
        a_in_index.insert_annotation("keep", "index");
        let index_name = name("localhost:5000/app:index");
        let index = registry
            .insert_index(&index_name, &oci_index(), vec![a_in_index, b.clone()])
            .await;

        let mut a_again = a.clone();
        a_again.set_platform(Some(Platform::from_parts("linux", "amd64", "v3")));
        a_again.insert_annotation("from", "source");

        let resolver = Resolver::new(registry);
        let mut srcs = vec![source(&index_name, &index), source(&amd64, &a_again)];
        let (buf, _) = resolver.combine(&mut srcs, &no_annotations()).await?;
        let merged = ImageIndex::from_reader(&buf[..])?;
        assert_eq!(merged.manifests().len(), 2);
        assert_eq!(merged.manifests()[0].digest(), a.digest());
        assert_eq!(merged.manifests()[1].digest(), b.digest());
        assert_eq!(
            merged.manifests()[0].platform(),
            &Some(Platform::from_parts("linux", "amd64", "v3"))
        );
        assert_eq!(
            merged.manifests()[0].annotations(),
            &Some(hashmap! {
                "from".to_string() => "source".to_string(),
                "keep".to_string() => "index".to_string(),
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn first_error_aborts() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let a = registry
            .insert_image(&amd64, &oci_manifest(), "linux", "amd64", "")
            .await;
        let missing = name("localhost:5000/app:missing");
        let ghost = Descriptor::from_bytes(&oci_manifest(), b"{}");

        let resolver = Resolver::new(registry);
        let err = resolver
            .combine(
                &mut [source(&amd64, &a), source(&missing, &ghost)],
                &no_annotations(),
            )
            .await
            .unwrap_err();
        match &err {
            Error::SourceFetchFailed {
                reference, digest, ..
            } => {
                assert_eq!(reference, "localhost:5000/app:missing");
                assert_eq!(digest, ghost.digest());
            }
            e => panic!("unexpected error: {}", e),
        }
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_source() -> Result<()> {
        let registry = MemoryRegistry::new();
        let n = name("localhost:5000/app:amd64");
        let mut desc = registry
            .insert_image(&n, &oci_manifest(), "linux", "amd64", "")
            .await;
        desc.set_size(desc.size() + 1);
        let resolver = Resolver::new(registry);
        let err = resolver
            .combine(&mut [source(&n, &desc)], &no_annotations())
            .await
            .unwrap_err();
        match err {
            Error::SourceFetchFailed { source, .. } => {
                assert!(matches!(*source, Error::SizeMismatch { .. }))
            }
            e => panic!("unexpected error: {}", e),
        }
        Ok(())
    }

    /// Registry whose fetches of `stalled` never complete
    struct StalledRegistry {
        inner: MemoryRegistry,
        stalled: String,
        dropped: Arc<AtomicBool>,
    }

    struct StalledFetcher {
        inner: Box<dyn Fetcher>,
        stalled: String,
        dropped: Arc<AtomicBool>,
    }

    /// Set the flag when the future holding it is dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Registry for StalledRegistry {
        async fn resolve(&self, name: &ImageName) -> Result<Descriptor> {
            self.inner.resolve(name).await
        }

        async fn fetcher(&self, name: &ImageName) -> Result<Box<dyn Fetcher>> {
            Ok(Box::new(StalledFetcher {
                inner: self.inner.fetcher(name).await?,
                stalled: self.stalled.clone(),
                dropped: self.dropped.clone(),
            }))
        }

        async fn pusher(&self, name: &ImageName) -> Result<Box<dyn Pusher>> {
            self.inner.pusher(name).await
        }
    }

    #[async_trait]
    impl Fetcher for StalledFetcher {
        async fn fetch(&self, desc: &Descriptor) -> Result<Bytes> {
            if desc.digest() == &self.stalled {
                let _flag = DropFlag(self.dropped.clone());
                futures::future::pending::<()>().await;
            }
            self.inner.fetch(desc).await
        }
    }

    #[tokio::test]
    async fn failure_cancels_pending_fetches() -> Result<()> {
        let registry = MemoryRegistry::new();
        let amd64 = name("localhost:5000/app:amd64");
        let a = registry
            .insert_image(&amd64, &oci_manifest(), "linux", "amd64", "")
            .await;
        let missing = name("localhost:5000/app:missing");
        let ghost = Descriptor::from_bytes(&oci_manifest(), b"{}");

        let dropped = Arc::new(AtomicBool::new(false));
        let resolver = Resolver::new(StalledRegistry {
            inner: registry,
            stalled: a.digest().clone(),
            dropped: dropped.clone(),
        });
        let mut srcs = [source(&amd64, &a), source(&missing, &ghost)];
        let combined = tokio::time::timeout(
            Duration::from_secs(10),
            resolver.combine(&mut srcs, &no_annotations()),
        )
        .await
        .expect("combine must not wait for the stalled source");
        assert!(combined.unwrap_err().is_not_found());
        assert!(dropped.load(Ordering::SeqCst));
        Ok(())
    }
}
