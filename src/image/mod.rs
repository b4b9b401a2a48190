//! Descriptors, manifests and indexes based on [OCI image specification](https://github.com/opencontainers/image-spec)
//!
//! The data model is [oci_spec::image]. Docker schema2 manifests and manifest lists
//! share the same shape, and are read by the same types.

pub mod annotations;

mod platform;

pub use annotations::{parse_annotation_args, parse_annotations, AnnotationKey, AnnotationKind};
pub use oci_spec::image::{
    Arch, Descriptor, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType, Os, Platform,
    SCHEMA_VERSION,
};
pub use platform::PlatformEx;

use crate::{error::*, Digest};
use serde::{ser::SerializeMap, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

/// Helpers on [Descriptor] where the digest is kept as a plain string
pub trait DescriptorEx {
    /// Descriptor of `buf` with SHA-256 digest
    fn from_bytes(media_type: &str, buf: &[u8]) -> Self;

    /// Parsed digest
    fn content_digest(&self) -> Result<Digest>;

    /// Verify `buf` is the content this descriptor points to
    fn verify(&self, buf: &[u8]) -> Result<()>;

    fn annotation(&self, key: &str) -> Option<&str>;

    fn insert_annotation(&mut self, key: &str, value: &str);
}

impl DescriptorEx for Descriptor {
    fn from_bytes(media_type: &str, buf: &[u8]) -> Self {
        Descriptor::new(
            MediaType::from(media_type),
            buf.len() as i64,
            Digest::from_buf_sha256(buf).to_string(),
        )
    }

    fn content_digest(&self) -> Result<Digest> {
        self.digest().parse()
    }

    fn verify(&self, buf: &[u8]) -> Result<()> {
        let actual = buf.len() as i64;
        if actual != self.size() {
            return Err(Error::SizeMismatch {
                digest: self.digest().clone(),
                expected: self.size(),
                actual,
            });
        }
        self.content_digest()?.verify(buf)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    fn insert_annotation(&mut self, key: &str, value: &str) {
        let mut annotations = self.annotations().clone().unwrap_or_default();
        annotations.insert(key.to_string(), value.to_string());
        self.set_annotations(Some(annotations));
    }
}

/// Serialize an index with two-space indent
///
/// Annotation maps are written in key order so that the same index always has the same digest.
pub fn write_index(index: &ImageIndex) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(&SortedIndex(index)).map_err(Error::SerializationFailed)
}

fn sorted(annotations: &Option<HashMap<String, String>>) -> Option<BTreeMap<&str, &str>> {
    annotations
        .as_ref()
        .filter(|annotations| !annotations.is_empty())
        .map(|annotations| {
            annotations
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect()
        })
}

struct SortedIndex<'a>(&'a ImageIndex);

impl Serialize for SortedIndex<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let index = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("schemaVersion", &index.schema_version())?;
        if let Some(media_type) = index.media_type() {
            map.serialize_entry("mediaType", media_type)?;
        }
        let manifests: Vec<_> = index.manifests().iter().map(SortedDescriptor).collect();
        map.serialize_entry("manifests", &manifests)?;
        if let Some(annotations) = sorted(index.annotations()) {
            map.serialize_entry("annotations", &annotations)?;
        }
        map.end()
    }
}

struct SortedDescriptor<'a>(&'a Descriptor);

impl Serialize for SortedDescriptor<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let desc = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("mediaType", desc.media_type())?;
        map.serialize_entry("digest", desc.digest())?;
        map.serialize_entry("size", &desc.size())?;
        if let Some(urls) = desc.urls() {
            map.serialize_entry("urls", urls)?;
        }
        if let Some(annotations) = sorted(desc.annotations()) {
            map.serialize_entry("annotations", &annotations)?;
        }
        if let Some(platform) = desc.platform() {
            map.serialize_entry("platform", platform)?;
        }
        map.end()
    }
}
