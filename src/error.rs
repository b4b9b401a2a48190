use crate::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid name for repository: {0}")]
    InvalidName(String),
    #[error(transparent)]
    InvalidPort(#[from] std::num::ParseIntError),
    #[error("Invalid reference to image: {0}")]
    InvalidReference(String),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error("Invalid annotation format, expected <type>:<key>=<value>, got {0:?}")]
    BadAnnotationSyntax(String),
    #[error("Invalid platform {platform:?}: {reason}")]
    BadPlatform { platform: String, reason: String },
    #[error("{0:?} annotations are not supported yet")]
    UnsupportedAnnotationType(String),
    #[error("{0:?} annotations are invalid while creating an image")]
    InvalidAtCreateTime(String),
    #[error("Unknown annotation type {0:?}")]
    UnknownAnnotationType(String),
    #[error("Annotations cannot be attached to a Docker manifest list, use OCI media types for the sources")]
    AnnotationsOnDockerList,

    //
    // Invalid container image
    //
    #[error("Malformed manifest: {0}")]
    MalformedManifest(#[source] serde_json::Error),
    #[error("Schema1 manifests are not allowed in manifest lists")]
    Schema1NotAllowed,
    #[error("Failed to infer platform of {reference}: {source}")]
    PlatformInferenceFailed {
        reference: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to serialize index: {0}")]
    SerializationFailed(#[source] serde_json::Error),
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: i64,
        actual: i64,
    },
    #[error("Digest algorithm {0:?} cannot be verified")]
    UnsupportedDigestAlgorithm(String),
    #[error("Invalid OCI content: {0}")]
    InvalidOciContent(String),

    //
    // Error from OCI registry
    //
    #[error("Failed to fetch {digest} from {reference}: {source}")]
    SourceFetchFailed {
        reference: String,
        digest: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    RegistryError(#[from] oci_spec::distribution::ErrorResponse),
    #[error("Unexpected response from registry: {status} {url}")]
    UnexpectedStatus { status: u16, url: url::Url },
    #[error(transparent)]
    NetworkError(#[from] reqwest::Error),
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(url::Url),
    #[error("Unsupported WWW-Authentication header: {0}")]
    UnSupportedAuthHeader(String),
    #[error("Location header is lacked in OCI registry response: {0}")]
    MissingLocation(url::Url),

    //
    // System error
    //
    #[error("No valid home directory path could be retrieved from the operating system.")]
    NoValidHomeDirectory,
    #[error("Malformed credential file: {0}")]
    MalformedCredentials(#[source] serde_json::Error),
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<oci_spec::OciSpecError> for Error {
    fn from(e: oci_spec::OciSpecError) -> Self {
        match e {
            oci_spec::OciSpecError::SerDe(e) => Error::MalformedManifest(e),
            oci_spec::OciSpecError::Io(e) => Error::UnknownIo(e),
            oci_spec::OciSpecError::Builder(e) => Error::InvalidOciContent(e.to_string()),
            oci_spec::OciSpecError::Other(e) => Error::InvalidOciContent(e),
        }
    }
}

impl Error {
    /// Registry reported the content is already present at the destination
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::SourceFetchFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
