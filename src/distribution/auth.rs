use crate::{config, error::*};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, io, path::*};
use url::Url;

/// Docker Hub credentials are stored with this key by `docker login`
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// Authentication info stored in filesystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredAuth {
    #[serde(default)]
    auths: HashMap<String, Auth>,
}

impl StoredAuth {
    /// Load authentication info with docker and podman setting
    pub fn load_all() -> Result<Self> {
        let mut auth = StoredAuth::default();
        for path in config::auth_paths()? {
            match Self::from_path(&path) {
                Ok(new) => auth.append(new),
                Err(e) => log::warn!("Skip credentials in {}: {}", path.display(), e),
            }
        }
        Ok(auth)
    }

    /// Register base64 encoded `username:password`
    pub fn insert(&mut self, domain: &str, octet: String) {
        self.auths
            .insert(domain.to_string(), Auth { auth: Some(octet) });
    }

    pub fn add(&mut self, domain: &str, username: &str, password: &str) {
        self.insert(
            domain,
            base64::encode(format!("{}:{}", username, password)),
        );
    }

    /// Base64 encoded `username:password` for `domain`
    pub fn get(&self, domain: &str) -> Option<&str> {
        let lookup = |key: &str| self.auths.get(key).and_then(|auth| auth.auth.as_deref());
        lookup(domain).or_else(|| match domain {
            "docker.io" | "registry-1.docker.io" | "index.docker.io" => {
                lookup(DOCKER_HUB_AUTH_KEY).or_else(|| lookup("docker.io"))
            }
            _ => None,
        })
    }

    /// Get token based on WWW-Authentication header
    ///
    /// Only `Bearer` challenges are answered with a token.
    pub async fn challenge(
        &self,
        client: &reqwest::Client,
        challenge: &AuthChallenge,
    ) -> Result<String> {
        let (url, service, scope) = match challenge {
            AuthChallenge::Bearer {
                url,
                service,
                scope,
            } => (url, service, scope),
            AuthChallenge::Basic => return Err(Error::UnSupportedAuthHeader("Basic".to_string())),
        };
        let token_url = Url::parse(url)?;
        let domain = token_url.host_str().unwrap_or_default().to_string();

        let mut query = vec![("service", service.as_str())];
        if let Some(scope) = scope {
            query.push(("scope", scope.as_str()));
        }
        let mut req = client
            .get(token_url.clone())
            .header("Accept", "application/json")
            .query(&query);
        if let Some(auth) = self.get(&domain).or_else(|| self.get(service)) {
            req = req.header("Authorization", format!("Basic {}", auth));
        }
        log::info!("GET {}", token_url);
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(Error::AuthorizationFailed(token_url));
        }
        let token = res.json::<Token>().await?;
        token
            .token
            .or(token.access_token)
            .ok_or(Error::AuthorizationFailed(token_url))
    }

    pub fn append(&mut self, other: Self) {
        for (key, value) in other.auths.into_iter() {
            self.auths.insert(key, value);
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        if path.is_file() {
            let f = fs::File::open(path)?;
            serde_json::from_reader(io::BufReader::new(f)).map_err(Error::MalformedCredentials)
        } else {
            Ok(Self::default())
        }
    }
}

/// Entries written by credential helpers have no `auth` field
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Auth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
}

/// WWW-Authentication challenge
///
/// ```
/// use imagetools::distribution::AuthChallenge;
///
/// let auth = AuthChallenge::from_header(
///   r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:termoshtt/ocipkg/rust-lib:pull""#,
/// ).unwrap();
///
/// assert_eq!(auth, AuthChallenge::Bearer {
///   url: "https://ghcr.io/token".to_string(),
///   service: "ghcr.io".to_string(),
///   scope: Some("repository:termoshtt/ocipkg/rust-lib:pull".to_string()),
/// });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        url: String,
        service: String,
        scope: Option<String>,
    },
    Basic,
}

impl AuthChallenge {
    pub fn from_header(header: &str) -> Result<Self> {
        let err = || Error::UnSupportedAuthHeader(header.to_string());
        let (ty, realm) = header.split_once(' ').unwrap_or((header, ""));
        if ty.eq_ignore_ascii_case("Basic") {
            return Ok(AuthChallenge::Basic);
        }
        if !ty.eq_ignore_ascii_case("Bearer") {
            return Err(err());
        }

        let mut url = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in split_params(realm) {
            match key.as_str() {
                "realm" => url = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => continue,
            }
        }
        Ok(AuthChallenge::Bearer {
            url: url.ok_or_else(err)?,
            service: service.unwrap_or_default(),
            scope,
        })
    }
}

/// Split `key="value",key="value"` where values may contain commas,
/// e.g. `scope="repository:a:pull,push"`
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while let Some((key, tail)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let (value, tail) = match tail.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, tail)) => (value, tail),
                None => (quoted, ""),
            },
            None => tail.split_once(',').unwrap_or((tail, "")),
        };
        params.push((key, value.to_string()));
        rest = tail.trim_start_matches(',').trim();
    }
    params
}

#[derive(Deserialize)]
struct Token {
    token: Option<String>,
    access_token: Option<String>,
}
