//! Annotations given by users as `type[platform]:key=value`
//!
//! | type                  | target                                      |
//! |:----------------------|:--------------------------------------------|
//! | `index`               | the created index itself                    |
//! | `manifest-descriptor` | descriptors of the manifests in the index   |
//!
//! `manifest-descriptor` annotations with platform, e.g.
//! `manifest-descriptor[linux/amd64]:key=value`, are only applied to
//! the descriptors of the matching platform.

use crate::{
    error::*,
    image::{Platform, PlatformEx},
};
use regex::Regex;
use std::{cmp::Ordering, collections::BTreeMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationKind {
    /// `index`
    Index,
    /// `manifest-descriptor`
    ManifestDescriptor,
    /// `manifest`, not supported since manifests are never rewritten
    Manifest,
    /// `index-descriptor`, no descriptor points the index while creating it
    IndexDescriptor,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Index => "index",
            AnnotationKind::ManifestDescriptor => "manifest-descriptor",
            AnnotationKind::Manifest => "manifest",
            AnnotationKind::IndexDescriptor => "index-descriptor",
        }
    }
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AnnotationKind {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input {
            "index" => Ok(AnnotationKind::Index),
            "manifest-descriptor" => Ok(AnnotationKind::ManifestDescriptor),
            "manifest" => Ok(AnnotationKind::Manifest),
            "index-descriptor" => Ok(AnnotationKind::IndexDescriptor),
            _ => Err(Error::UnknownAnnotationType(input.to_string())),
        }
    }
}

/// Parsed `type[platform]:key` part of an annotation
///
/// Ordered so that annotations without platform come first within a kind.
#[derive(Debug, Clone)]
pub struct AnnotationKey {
    pub kind: AnnotationKind,
    pub platform: Option<Platform>,
    pub key: String,
}

impl AnnotationKey {
    /// Canonical `os/arch[/variant]` of the platform filter
    pub fn platform_string(&self) -> Option<String> {
        self.platform.as_ref().map(Platform::canonical)
    }

    fn sort_key(&self) -> (AnnotationKind, Option<String>, &str) {
        (self.kind, self.platform_string(), &self.key)
    }

    /// Whether this annotation is applied to a descriptor of `platform`
    ///
    /// Annotations without platform match any descriptor,
    /// and descriptors without platform only match them.
    pub fn matches(&self, platform: Option<&Platform>) -> bool {
        match (&self.platform, platform) {
            (None, _) => true,
            (Some(want), Some(platform)) => want.canonical() == platform.canonical(),
            (Some(_), None) => false,
        }
    }
}

impl PartialEq for AnnotationKey {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for AnnotationKey {}

impl PartialOrd for AnnotationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnnotationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Annotations accepted while creating an index, split by their target
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Annotations {
    pub index: BTreeMap<AnnotationKey, String>,
    pub manifest_descriptor: BTreeMap<AnnotationKey, String>,
}

impl Annotations {
    pub fn is_empty(&self) -> bool {
        self.index.is_empty() && self.manifest_descriptor.is_empty()
    }
}

lazy_static::lazy_static! {
    static ref ANNOTATION_RE: Regex =
        Regex::new(r"^([a-z-]+)(?:\[([A-Za-z0-9_/-]+)\])?:(\S+)$").unwrap();
}

/// Parse annotations given as `type[platform]:key` to value map
///
/// ```
/// use imagetools::image::*;
/// use std::collections::BTreeMap;
///
/// let mut input = BTreeMap::new();
/// input.insert("index:org.opencontainers.image.title".to_string(), "demo".to_string());
/// input.insert("manifest-descriptor[linux/arm64]:foo".to_string(), "bar".to_string());
/// let annotations = parse_annotations(&input).unwrap();
/// assert_eq!(annotations.index.len(), 1);
/// let (key, value) = annotations.manifest_descriptor.iter().next().unwrap();
/// assert_eq!(key.platform_string().as_deref(), Some("linux/arm64"));
/// assert_eq!(value, "bar");
/// ```
pub fn parse_annotations(input: &BTreeMap<String, String>) -> Result<Annotations> {
    let mut annotations = Annotations::default();
    for (k, v) in input {
        let captures = ANNOTATION_RE
            .captures(k)
            .ok_or_else(|| Error::BadAnnotationSyntax(k.clone()))?;
        let ty = &captures[1];
        let platform = captures
            .get(2)
            .map(|platform| Platform::parse(platform.as_str()))
            .transpose()?;
        let key = captures[3].to_string();

        let kind: AnnotationKind = ty.parse()?;
        let bucket = match kind {
            AnnotationKind::Index => &mut annotations.index,
            AnnotationKind::ManifestDescriptor => &mut annotations.manifest_descriptor,
            AnnotationKind::Manifest => {
                return Err(Error::UnsupportedAnnotationType(ty.to_string()))
            }
            AnnotationKind::IndexDescriptor => {
                return Err(Error::InvalidAtCreateTime(ty.to_string()))
            }
        };
        bucket.insert(
            AnnotationKey {
                kind,
                platform,
                key,
            },
            v.clone(),
        );
    }
    Ok(annotations)
}

/// Split `type[platform]:key=value` flags at the first `=`
///
/// The same key given twice keeps the last value.
pub fn parse_annotation_args(args: &[impl AsRef<str>]) -> Result<BTreeMap<String, String>> {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| Error::BadAnnotationSyntax(arg.to_string()))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
