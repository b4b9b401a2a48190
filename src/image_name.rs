use crate::{error::*, Digest};
use regex::Regex;
use std::fmt;
use url::Url;

/// Registry used when the reference does not start with a hostname
pub const DEFAULT_HOSTNAME: &str = "docker.io";
/// Tag attached to references carrying neither tag nor digest
pub const DEFAULT_TAG: &str = "latest";

lazy_static::lazy_static! {
    // Repository path, e.g. `library/ubuntu`
    static ref PATH_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$").unwrap();
    // At most 128 characters
    static ref TAG_RE: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap();
}

fn validate_path(path: &str) -> Result<String> {
    if PATH_RE.is_match(path) {
        Ok(path.to_string())
    } else {
        Err(Error::InvalidName(path.to_string()))
    }
}

fn validate_tag(tag: &str) -> Result<String> {
    if TAG_RE.is_match(tag) {
        Ok(tag.to_string())
    } else {
        Err(Error::InvalidReference(tag.to_string()))
    }
}

/// Reference to an image in a registry, `hostname[:port]/name[:tag][@digest]`
///
/// ```
/// use imagetools::ImageName;
///
/// let name = ImageName::parse("localhost:5000/buildx/imtools:latest").unwrap();
/// assert_eq!(name.hostname, "localhost");
/// assert_eq!(name.port, Some(5000));
/// assert_eq!(name.name, "buildx/imtools");
/// assert_eq!(name.tag.as_deref(), Some("latest"));
/// assert!(name.digest.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub hostname: String,
    pub port: Option<u16>,
    /// Repository path, e.g. `library/ubuntu`
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain(), self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageName {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        ImageName::parse(input)
    }
}

impl ImageName {
    pub fn parse(input: &str) -> Result<Self> {
        let (rest, digest) = match input.rsplit_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::new(digest)?)),
            None => (input, None),
        };

        // The first component is a hostname only if it looks like one,
        // e.g. `ubuntu` or `termoshtt/ocipkg` are repositories on Docker Hub.
        let (domain, path) = match rest.split_once('/') {
            Some((head, tail))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head, tail)
            }
            _ => (DEFAULT_HOSTNAME, rest),
        };
        let (hostname, port) = if let Some((hostname, port)) = domain.split_once(':') {
            (hostname, Some(str::parse(port)?))
        } else {
            (domain, None)
        };

        let (path, tag) = match path.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, Some(validate_tag(tag)?)),
            _ => (path, None),
        };
        let path = if hostname == DEFAULT_HOSTNAME && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path.to_string()
        };
        if hostname.is_empty() {
            return Err(Error::InvalidReference(input.to_string()));
        }

        Ok(ImageName {
            hostname: hostname.to_string(),
            port,
            name: validate_path(&path)?,
            tag,
            digest,
        })
    }

    /// `hostname[:port]`
    pub fn domain(&self) -> String {
        if let Some(port) = self.port {
            format!("{}:{}", self.hostname, port)
        } else {
            self.hostname.clone()
        }
    }

    /// Attach the default tag if neither tag nor digest is given
    pub fn with_default_tag(&self) -> Self {
        let mut name = self.clone();
        if name.tag.is_none() && name.digest.is_none() {
            name.tag = Some(DEFAULT_TAG.to_string());
        }
        name
    }

    /// Drop tag and digest, leaving `hostname[:port]/name`
    pub fn trimmed(&self) -> Self {
        ImageName {
            tag: None,
            digest: None,
            ..self.clone()
        }
    }

    /// Same repository with a digest reference
    pub fn with_digest(&self, digest: &Digest) -> Self {
        ImageName {
            tag: None,
            digest: Some(digest.clone()),
            ..self.clone()
        }
    }

    /// Whether two names point to the same repository, ignoring tag and digest
    pub fn same_repository(&self, other: &ImageName) -> bool {
        self.hostname == other.hostname && self.port == other.port && self.name == other.name
    }

    /// The `<reference>` part of `/v2/<name>/manifests/<reference>`
    ///
    /// Digest is preferred since it is immutable.
    pub fn manifest_reference(&self) -> String {
        if let Some(digest) = &self.digest {
            digest.to_string()
        } else if let Some(tag) = &self.tag {
            tag.clone()
        } else {
            DEFAULT_TAG.to_string()
        }
    }

    /// URL of the registry API server
    pub fn registry_url(&self) -> Result<Url> {
        let url = if self.hostname == "localhost" || self.hostname == "127.0.0.1" {
            format!("http://{}", self.domain())
        } else if self.hostname == DEFAULT_HOSTNAME {
            "https://registry-1.docker.io".to_string()
        } else {
            format!("https://{}", self.domain())
        };
        Ok(Url::parse(&url)?)
    }
}
