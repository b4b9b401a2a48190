//! Locations of registry credential files

use crate::error::*;
use directories::{BaseDirs, ProjectDirs};
use std::{env, path::*};

pub const PROJECT_NAME: &str = "imagetools";

/// Credentials owned by this crate
///
/// `$XDG_RUNTIME_DIR/imagetools/auth.json`, or `~/.imagetools/config.json`
/// when the runtime directory is not available as in most containers.
pub fn auth_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", PROJECT_NAME)
        .and_then(|dirs| Some(dirs.runtime_dir()?.join("auth.json")))
        .or_else(|| {
            let dirs = BaseDirs::new()?;
            Some(dirs.home_dir().join(format!(".{}/config.json", PROJECT_NAME)))
        })
}

/// `$DOCKER_CONFIG/config.json` or `~/.docker/config.json`
pub fn docker_auth_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    let dirs = BaseDirs::new()?;
    Some(dirs.home_dir().join(".docker/config.json"))
}

/// `$REGISTRY_AUTH_FILE` or `$XDG_RUNTIME_DIR/containers/auth.json`
pub fn podman_auth_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os("REGISTRY_AUTH_FILE") {
        return Some(PathBuf::from(path));
    }
    let dirs = ProjectDirs::from("", "", "containers")?;
    Some(dirs.runtime_dir()?.join("auth.json"))
}

/// Credential files to be read, latter ones take precedence
pub fn auth_paths() -> Result<Vec<PathBuf>> {
    if BaseDirs::new().is_none() {
        return Err(Error::NoValidHomeDirectory);
    }
    Ok([docker_auth_path(), podman_auth_path(), auth_path()]
        .into_iter()
        .flatten()
        .collect())
}
