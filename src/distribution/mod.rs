//! Pull and push contents from/to registries based on [OCI distribution specification](https://github.com/opencontainers/distribution-spec)
//!
//! Composing and copying images only requires the [Registry] trait,
//! which is implemented by the HTTP [Client] and the in-process [MemoryRegistry].

mod auth;
mod client;
mod memory;

pub use auth::*;
pub use client::{Client, ClientOptions};
pub use memory::MemoryRegistry;

use crate::{
    error::*,
    image::{Descriptor, DescriptorEx},
    media_types, Digest, ImageName,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// Prefix of the annotation telling where the blob is distributed from,
/// `containerd.io/distribution.source.<hostname>` with repository path as its value.
///
/// Registries use it for cross-repository blob mount.
pub const DISTRIBUTION_SOURCE_PREFIX: &str = "containerd.io/distribution.source.";

/// Read contents of a repository
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Read the whole content `desc` points to
    async fn fetch(&self, desc: &Descriptor) -> Result<Bytes>;
}

/// Write a content into a repository, created by [Pusher::push]
#[async_trait]
pub trait ContentWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Finish writing. Returns [Error::AlreadyExists] if someone else has committed the same content.
    async fn commit(self: Box<Self>, size: i64, expected: &Digest) -> Result<()>;
}

/// Write contents into a repository
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Open a writer for `desc`
    ///
    /// Returns [Error::AlreadyExists] if the repository already has the content.
    /// `ref_key` is made by [MediaTypePrefixes::ref_key].
    async fn push(&self, ref_key: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>>;
}

/// Registry serving repositories
#[async_trait]
pub trait Registry: Send + Sync {
    /// Get descriptor of the manifest `name` points to, by its digest if exists, or by tag.
    async fn resolve(&self, name: &ImageName) -> Result<Descriptor>;

    /// Reader for the repository of `name`
    async fn fetcher(&self, name: &ImageName) -> Result<Box<dyn Fetcher>>;

    /// Writer for the repository of `name`, manifests are tagged by the tag of `name`
    async fn pusher(&self, name: &ImageName) -> Result<Box<dyn Pusher>>;
}

/// Write `buf` through `writer` after checking it is the expected content
///
/// Surfaces [Error::AlreadyExists] from the writer as is,
/// and callers decide if it is an error.
pub async fn content_copy(
    mut writer: Box<dyn ContentWriter>,
    buf: &[u8],
    size: i64,
    expected: &Digest,
) -> Result<()> {
    let actual = buf.len() as i64;
    if actual != size {
        return Err(Error::SizeMismatch {
            digest: expected.to_string(),
            expected: size,
            actual,
        });
    }
    expected.verify(buf)?;
    writer.write(buf).await?;
    writer.commit(size, expected).await
}

/// Read the content `desc` points to, and verify its size and digest
pub async fn fetch_verified(fetcher: &dyn Fetcher, desc: &Descriptor) -> Result<Bytes> {
    let buf = fetcher.fetch(desc).await?;
    desc.verify(&buf)?;
    Ok(buf)
}

/// Custom prefixes of reference keys for media types
/// which are not manifests, indexes, layers, or configs
///
/// ```
/// use imagetools::{distribution::MediaTypePrefixes, image::{Descriptor, DescriptorEx}};
///
/// let prefixes = MediaTypePrefixes::default().with("application/vnd.in-toto+json", "intoto");
/// let desc = Descriptor::from_bytes("application/vnd.in-toto+json", b"{}");
/// assert_eq!(prefixes.ref_key(&desc), format!("intoto-{}", desc.digest()));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaTypePrefixes(HashMap<String, String>);

impl MediaTypePrefixes {
    pub fn with(mut self, media_type: &str, prefix: &str) -> Self {
        self.0.insert(media_type.to_string(), prefix.to_string());
        self
    }

    /// Key to track a pushed content, `<kind>-<digest>`
    pub fn ref_key(&self, desc: &Descriptor) -> String {
        let key = match desc.annotation(oci_spec::image::ANNOTATION_REF_NAME) {
            Some(name) => format!("{}@{}", name, desc.digest()),
            None => desc.digest().clone(),
        };
        let mt = desc.media_type().to_string();
        if let Some(prefix) = self.0.get(&mt) {
            return format!("{}-{}", prefix, key);
        }
        let mt = mt.as_str();
        let kind = if media_types::is_manifest(mt) || media_types::is_schema1(mt) {
            "manifest"
        } else if media_types::is_index(mt) {
            "index"
        } else if media_types::is_layer(mt) {
            "layer"
        } else if media_types::is_config(mt) {
            "config"
        } else {
            "unknown"
        };
        format!("{}-{}", kind, key)
    }
}

/// Reference key is of a manifest or an index, which is pushed to `/v2/<name>/manifests/`
pub fn is_manifest_key(ref_key: &str) -> bool {
    ref_key.starts_with("manifest-") || ref_key.starts_with("index-")
}

/// `hostname` of the `containerd.io/distribution.source.<hostname>` annotations of `desc`,
/// paired with the repository path
pub fn distribution_sources(desc: &Descriptor) -> impl Iterator<Item = (&str, &str)> {
    desc.annotations().iter().flatten().filter_map(|(key, value)| {
        key.strip_prefix(DISTRIBUTION_SOURCE_PREFIX)
            .map(|host| (host, value.as_str()))
    })
}
