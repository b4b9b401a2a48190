//! Media types of manifests and blobs, and detection of them from raw manifest bytes

use crate::error::*;
use oci_spec::image::MediaType;
use serde::Deserialize;

pub const DOCKER_MANIFEST_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_MANIFEST_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// in-toto attestation payloads, pushed with `intoto-` reference keys
pub const IN_TOTO: &str = "application/vnd.in-toto+json";

const DOCKER_PREFIX: &str = "application/vnd.docker.";

/// `application/vnd.oci.image.manifest.v1+json`
pub fn oci_manifest() -> String {
    MediaType::ImageManifest.to_string()
}

/// `application/vnd.oci.image.index.v1+json`
pub fn oci_index() -> String {
    MediaType::ImageIndex.to_string()
}

/// `application/vnd.oci.image.config.v1+json`
pub fn oci_config() -> String {
    MediaType::ImageConfig.to_string()
}

/// Docker media types start with `application/vnd.docker.`
pub fn is_docker(media_type: &str) -> bool {
    media_type.starts_with(DOCKER_PREFIX)
}

/// Docker manifest list or OCI image index
pub fn is_index(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || media_type == oci_index()
}

/// Single-platform manifest, i.e. Docker schema2 manifest or OCI image manifest
pub fn is_manifest(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_SCHEMA2 || media_type == oci_manifest()
}

pub fn is_schema1(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_SCHEMA1 || media_type == DOCKER_MANIFEST_SCHEMA1_SIGNED
}

/// Image configuration blob, Docker or OCI
pub fn is_config(media_type: &str) -> bool {
    media_type == DOCKER_CONFIG || media_type == oci_config()
}

/// Filesystem layer blob, Docker or OCI, compressed or not
pub fn is_layer(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.oci.image.layer.")
        || media_type.starts_with("application/vnd.docker.image.rootfs.")
}

/// Layers which registries must not redistribute, and then never copied
pub fn is_non_distributable(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.docker.image.rootfs.foreign.")
        || media_type.starts_with("application/vnd.oci.image.layer.nondistributable.")
}

/// Loose shape of any manifest used for media type detection
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LooseManifest {
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    fs_layers: Vec<serde_json::Value>,
    #[serde(default)]
    manifests: Vec<LooseChild>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LooseChild {
    #[serde(default)]
    media_type: String,
}

/// Detect media type of a manifest which does not declare it in its descriptor
///
/// - `mediaType` field of the body is used if exists.
/// - A body with `config` is a Docker schema2 manifest.
/// - A body with non-empty `fsLayers` is a Docker schema1 manifest.
/// - Otherwise it is a manifest list. This is the Docker manifest list
///   unless some entry in `manifests` is not a Docker media type,
///   since a Docker list cannot hold them.
///
/// ```
/// use imagetools::media_types::*;
///
/// let mt = detect(br#"{"schemaVersion": 2, "config": {}, "layers": []}"#).unwrap();
/// assert_eq!(mt, DOCKER_MANIFEST_SCHEMA2);
/// ```
pub fn detect(buf: &[u8]) -> Result<String> {
    let loose: LooseManifest = serde_json::from_slice(buf).map_err(Error::MalformedManifest)?;
    if !loose.media_type.is_empty() {
        return Ok(loose.media_type);
    }
    if loose.config.is_some() {
        return Ok(DOCKER_MANIFEST_SCHEMA2.to_string());
    }
    if !loose.fs_layers.is_empty() {
        return Ok(DOCKER_MANIFEST_SCHEMA1.to_string());
    }
    if loose
        .manifests
        .iter()
        .any(|child| !child.media_type.is_empty() && !is_docker(&child.media_type))
    {
        return Ok(oci_index());
    }
    Ok(DOCKER_MANIFEST_LIST.to_string())
}
