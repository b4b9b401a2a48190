use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::distribution::ErrorResponse;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE},
    RequestBuilder, Response, StatusCode,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    distribution::*,
    error::*,
    image::{Descriptor, DescriptorEx, MediaType},
    media_types, Digest, ImageName,
};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Settings of [Client]
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Hosts accessed by plain HTTP in addition to `localhost`, as `hostname` or `hostname:port`
    pub insecure: Vec<String>,
    /// Credentials used for token requests and basic authentication
    pub auth: StoredAuth,
}

/// A client for `/v2/` API endpoints of registries
///
/// Tokens obtained via WWW-Authentication challenges are cached per repository,
/// and shared between clones.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    auth: StoredAuth,
    insecure: Vec<String>,
    /// `Authorization` header value for each `hostname[:port]/name`
    tokens: Mutex<HashMap<String, String>>,
}

impl Client {
    /// Client with credentials stored by docker, podman, and this crate
    pub fn new() -> Result<Self> {
        Ok(Self::with_options(ClientOptions {
            auth: StoredAuth::load_all()?,
            ..Default::default()
        }))
    }

    pub fn with_options(options: ClientOptions) -> Self {
        Client {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                auth: options.auth,
                insecure: options.insecure,
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// URL of the registry serving `name`
    pub fn registry_url(&self, name: &ImageName) -> Result<Url> {
        let domain = name.domain();
        if self
            .inner
            .insecure
            .iter()
            .any(|host| *host == name.hostname || *host == domain)
        {
            return Ok(Url::parse(&format!("http://{}", domain))?);
        }
        name.registry_url()
    }

    fn repository(&self, name: &ImageName) -> Result<Repository> {
        Ok(Repository {
            inner: self.inner.clone(),
            url: self.registry_url(name)?,
            name: name.clone(),
        })
    }
}

#[async_trait]
impl Registry for Client {
    async fn resolve(&self, name: &ImageName) -> Result<Descriptor> {
        let repo = self.repository(name)?;
        let reference = name.manifest_reference();
        if let Some(desc) = repo.head_manifest(&reference).await? {
            return Ok(desc);
        }
        // Some registries do not return digest for HEAD
        let (media_type, buf) = repo.get_manifest(&reference).await?;
        Ok(Descriptor::from_bytes(&media_type, &buf))
    }

    async fn fetcher(&self, name: &ImageName) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(RemoteFetcher {
            repo: self.repository(name)?,
        }))
    }

    async fn pusher(&self, name: &ImageName) -> Result<Box<dyn Pusher>> {
        Ok(Box::new(RemotePusher {
            repo: self.repository(name)?,
            tag: name.tag.as_ref().map(|tag| tag.to_string()),
        }))
    }
}

/// `/v2/<name>/` endpoints of a repository
#[derive(Clone)]
struct Repository {
    inner: Arc<Inner>,
    /// URL to registry server
    url: Url,
    name: ImageName,
}

impl Repository {
    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.url.join(&format!("/v2/{}/{}", self.name.name, path))?)
    }

    fn get(&self, url: &Url) -> RequestBuilder {
        log::info!("GET {}", url);
        self.inner.http.get(url.clone())
    }

    fn head(&self, url: &Url) -> RequestBuilder {
        log::info!("HEAD {}", url);
        self.inner.http.head(url.clone())
    }

    fn put(&self, url: &Url) -> RequestBuilder {
        log::info!("PUT {}", url);
        self.inner.http.put(url.clone())
    }

    fn post(&self, url: &Url) -> RequestBuilder {
        log::info!("POST {}", url);
        self.inner.http.post(url.clone())
    }

    /// Send request, and retry once with a token if the registry requires authorization
    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let key = self.name.trimmed().to_string();
        let retry = req.try_clone();
        let cached = self.inner.tokens.lock().await.get(&key).cloned();
        let req = match cached {
            Some(authorization) => req.header(AUTHORIZATION, authorization),
            None => req,
        };
        let res = req.send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }
        let retry = match retry {
            Some(retry) => retry,
            None => return Ok(res),
        };

        let url = res.url().clone();
        let header = res
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::AuthorizationFailed(url.clone()))?;
        let authorization = match AuthChallenge::from_header(header)? {
            challenge @ AuthChallenge::Bearer { .. } => {
                let token = self
                    .inner
                    .auth
                    .challenge(&self.inner.http, &challenge)
                    .await?;
                format!("Bearer {}", token)
            }
            AuthChallenge::Basic => {
                let auth = self
                    .inner
                    .auth
                    .get(&self.name.domain())
                    .or_else(|| self.inner.auth.get(&self.name.hostname))
                    .ok_or_else(|| Error::AuthorizationFailed(url.clone()))?;
                format!("Basic {}", auth)
            }
        };
        self.inner
            .tokens
            .lock()
            .await
            .insert(key, authorization.clone());

        let res = retry.header(AUTHORIZATION, authorization).send().await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthorizationFailed(url));
        }
        Ok(res)
    }

    /// Location header of a response, which may be relative to the registry URL
    fn location(&self, res: &Response) -> Result<Url> {
        let loc = res
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::MissingLocation(res.url().clone()))?;
        Ok(Url::parse(loc).or_else(|_| self.url.join(loc))?)
    }

    /// HEAD the manifest
    ///
    /// ```text
    /// HEAD /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Returns `None` if not found, or the registry does not tell the digest.
    async fn head_manifest(&self, reference: &str) -> Result<Option<Descriptor>> {
        let url = self.endpoint(&format!("manifests/{}", reference))?;
        let res = self
            .send(self.head(&url).header(ACCEPT, manifest_accept()))
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(error_response(res).await);
        }
        let digest = match header_str(&res, DOCKER_CONTENT_DIGEST) {
            Some(digest) => Digest::new(digest)?,
            None => return Ok(None),
        };
        let size: i64 = match header_str(&res, CONTENT_LENGTH.as_str()).and_then(|len| len.parse().ok()) {
            Some(size) => size,
            None => return Ok(None),
        };
        let media_type = header_str(&res, CONTENT_TYPE.as_str()).unwrap_or_default();
        Ok(Some(Descriptor::new(
            MediaType::from(declared_manifest_type(media_type).as_str()),
            size,
            digest.to_string(),
        )))
    }

    /// Get manifest with its media type
    ///
    /// ```text
    /// GET /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pulling-manifests) for detail.
    async fn get_manifest(&self, reference: &str) -> Result<(String, Bytes)> {
        let url = self.endpoint(&format!("manifests/{}", reference))?;
        let res = self
            .send(self.get(&url).header(ACCEPT, manifest_accept()))
            .await?;
        if !res.status().is_success() {
            return Err(error_response(res).await);
        }
        let media_type = header_str(&res, CONTENT_TYPE.as_str())
            .map(declared_manifest_type)
            .unwrap_or_default();
        Ok((media_type, res.bytes().await?))
    }

    /// Get blob for given digest
    ///
    /// ```text
    /// GET /v2/<name>/blobs/<digest>
    /// ```
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pulling-blobs) for detail.
    async fn get_blob(&self, digest: &str) -> Result<Bytes> {
        let url = self.endpoint(&format!("blobs/{}", digest))?;
        let res = self.send(self.get(&url)).await?;
        if !res.status().is_success() {
            return Err(error_response(res).await);
        }
        Ok(res.bytes().await?)
    }

    /// ```text
    /// HEAD /v2/<name>/blobs/<digest>
    /// ```
    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let url = self.endpoint(&format!("blobs/{}", digest))?;
        let res = self.send(self.head(&url)).await?;
        match res.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_response(res).await),
        }
    }

    /// Mount blob from another repository of the same registry
    ///
    /// ```text
    /// POST /v2/<name>/blobs/uploads/?mount=<digest>&from=<other_name>
    /// ```
    ///
    /// Returns `None` if mounted, or the upload location if the registry
    /// started an usual upload session instead.
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#mounting-a-blob-from-another-repository) for detail.
    async fn mount_blob(&self, digest: &str, from: &str) -> Result<Option<Url>> {
        let url = self.endpoint("blobs/uploads/")?;
        let res = self
            .send(
                self.post(&url)
                    .query(&[("mount", digest), ("from", from)]),
            )
            .await?;
        match res.status() {
            StatusCode::CREATED => Ok(None),
            StatusCode::ACCEPTED => Ok(Some(self.location(&res)?)),
            _ => Err(error_response(res).await),
        }
    }

    /// Start upload session
    ///
    /// ```text
    /// POST /v2/<name>/blobs/uploads/
    /// ```
    async fn start_upload(&self) -> Result<Url> {
        let url = self.endpoint("blobs/uploads/")?;
        let res = self.send(self.post(&url)).await?;
        if !res.status().is_success() {
            return Err(error_response(res).await);
        }
        self.location(&res)
    }

    /// Finish upload session by the monolithic `PUT` to URL obtained by `POST`.
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pushing-blobs) for detail.
    async fn finish_upload(&self, location: &Url, digest: &Digest, blob: Vec<u8>) -> Result<()> {
        let res = self
            .send(
                self.put(location)
                    .query(&[("digest", digest.to_string())])
                    .header(CONTENT_LENGTH, blob.len())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(blob),
            )
            .await?;
        if !res.status().is_success() {
            return Err(error_response(res).await);
        }
        Ok(())
    }

    /// Push manifest to registry
    ///
    /// ```text
    /// PUT /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Manifest must be pushed after blobs are updated.
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pushing-manifests) for detail.
    async fn put_manifest(&self, reference: &str, media_type: &str, buf: Vec<u8>) -> Result<()> {
        let url = self.endpoint(&format!("manifests/{}", reference))?;
        let res = self
            .send(self.put(&url).header(CONTENT_TYPE, media_type).body(buf))
            .await?;
        if !res.status().is_success() {
            return Err(error_response(res).await);
        }
        Ok(())
    }
}

fn header_str<'a>(res: &'a Response, name: &str) -> Option<&'a str> {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

fn manifest_accept() -> String {
    [
        media_types::oci_index(),
        media_types::oci_manifest(),
        media_types::DOCKER_MANIFEST_LIST.to_string(),
        media_types::DOCKER_MANIFEST_SCHEMA2.to_string(),
        media_types::DOCKER_MANIFEST_SCHEMA1_SIGNED.to_string(),
        media_types::DOCKER_MANIFEST_SCHEMA1.to_string(),
    ]
    .join(", ")
}

/// `Content-Type` of a manifest response, or empty if it is not a manifest type,
/// e.g. `application/json` returned by old registries.
fn declared_manifest_type(content_type: &str) -> String {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if media_types::is_index(media_type)
        || media_types::is_manifest(media_type)
        || media_types::is_schema1(media_type)
    {
        media_type.to_string()
    } else {
        String::new()
    }
}

async fn error_response(res: Response) -> Error {
    let status = res.status();
    let url = res.url().clone();
    if status == StatusCode::NOT_FOUND {
        return Error::NotFound(url.to_string());
    }
    match res.bytes().await {
        Ok(body) => match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(err) => Error::RegistryError(err),
            Err(_) => Error::UnexpectedStatus {
                status: status.as_u16(),
                url,
            },
        },
        Err(e) => Error::NetworkError(e),
    }
}

struct RemoteFetcher {
    repo: Repository,
}

#[async_trait]
impl Fetcher for RemoteFetcher {
    async fn fetch(&self, desc: &Descriptor) -> Result<Bytes> {
        let mt = desc.media_type().to_string();
        let mt = mt.as_str();
        if mt.is_empty()
            || media_types::is_index(mt)
            || media_types::is_manifest(mt)
            || media_types::is_schema1(mt)
        {
            let (_, buf) = self.repo.get_manifest(desc.digest()).await?;
            Ok(buf)
        } else {
            self.repo.get_blob(desc.digest()).await
        }
    }
}

struct RemotePusher {
    repo: Repository,
    tag: Option<String>,
}

#[async_trait]
impl Pusher for RemotePusher {
    async fn push(&self, ref_key: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        if is_manifest_key(ref_key) {
            let reference = self
                .tag
                .clone()
                .unwrap_or_else(|| desc.digest().clone());
            if let Some(existing) = self.repo.head_manifest(&reference).await? {
                if existing.digest() == desc.digest() {
                    return Err(Error::AlreadyExists(ref_key.to_string()));
                }
            }
            return Ok(Box::new(RemoteWriter {
                repo: self.repo.clone(),
                target: Target::Manifest {
                    reference,
                    media_type: desc.media_type().to_string(),
                },
                buf: Vec::new(),
            }));
        }

        if self.repo.blob_exists(desc.digest()).await? {
            return Err(Error::AlreadyExists(ref_key.to_string()));
        }
        let mut location = None;
        for (host, path) in distribution_sources(desc) {
            if host != self.repo.name.hostname {
                continue;
            }
            match self.repo.mount_blob(desc.digest(), path).await {
                Ok(None) => {
                    log::info!("Mounted {} from {}", desc.digest(), path);
                    return Err(Error::AlreadyExists(ref_key.to_string()));
                }
                Ok(Some(upload)) => {
                    location = Some(upload);
                    break;
                }
                Err(e) => log::warn!("Failed to mount {} from {}: {}", desc.digest(), path, e),
            }
        }
        Ok(Box::new(RemoteWriter {
            repo: self.repo.clone(),
            target: Target::Blob { location },
            buf: Vec::new(),
        }))
    }
}

enum Target {
    Manifest { reference: String, media_type: String },
    /// Upload session may be already started by a mount request
    Blob { location: Option<Url> },
}

struct RemoteWriter {
    repo: Repository,
    target: Target,
    buf: Vec<u8>,
}

#[async_trait]
impl ContentWriter for RemoteWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn commit(self: Box<Self>, size: i64, expected: &Digest) -> Result<()> {
        let RemoteWriter { repo, target, buf } = *self;
        let actual = buf.len() as i64;
        if actual != size {
            return Err(Error::SizeMismatch {
                digest: expected.to_string(),
                expected: size,
                actual,
            });
        }
        match target {
            Target::Manifest {
                reference,
                media_type,
            } => repo.put_manifest(&reference, &media_type, buf).await,
            Target::Blob { location } => {
                let location = match location {
                    Some(location) => location,
                    None => repo.start_upload().await?,
                };
                repo.finish_upload(&location, expected, buf).await
            }
        }
    }
}
