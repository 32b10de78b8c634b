// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-paths
//!
//! The on-disk filesystem layout shared by the package index, the
//! publisher, the installer and the app registry. Nothing here is
//! algorithmic; it is the single place that knows the shape of `$D`:
//!
//! ```text
//! $D/apps/<appid>/<version>/
//! $D/apps/<appid>/.inst_history
//! $D/apps/<appid>/.dist_history
//! $D/apps/.venv/<appid>/<version>/
//! $D/apps/.bin/<appid>.(exe|sh)
//! $D/pypi/downloads/<name>/<archive>
//! $D/pypi/installed/<name>/<version>/
//! $D/pypi/index/id_2_paths.json
//! $D/pypi/index/name_2_vers.json
//! ```

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

/// Root of a depsland installation (`$D` in the layout above).
#[derive(Debug, Clone)]
pub struct DepslandPaths {
    root: PathBuf,
}

impl DepslandPaths {
    /// Anchor the layout at `root`, canonicalizing it if it already exists.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self { root }
    }

    /// The root directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -- apps ----------------------------------------------------------

    /// `$D/apps`
    pub fn apps_root(&self) -> PathBuf {
        self.root.join("apps")
    }

    /// `$D/apps/<appid>`
    pub fn app_root(&self, appid: &str) -> PathBuf {
        self.apps_root().join(appid)
    }

    /// `$D/apps/<appid>/<version>`
    pub fn app_version_dir(&self, appid: &str, version: &str) -> PathBuf {
        self.app_root(appid).join(version)
    }

    /// `$D/apps/<appid>/<version>/manifest.pkl`
    pub fn app_manifest_file(&self, appid: &str, version: &str) -> PathBuf {
        self.app_version_dir(appid, version).join("manifest.pkl")
    }

    /// `$D/apps/<appid>/.inst_history`
    pub fn inst_history_file(&self, appid: &str) -> PathBuf {
        self.app_root(appid).join(".inst_history")
    }

    /// `$D/apps/<appid>/.dist_history`
    pub fn dist_history_file(&self, appid: &str) -> PathBuf {
        self.app_root(appid).join(".dist_history")
    }

    /// `$D/apps/.venv/<appid>/<version>` — the per-version library view
    /// the installer links shared package installs into.
    pub fn library_view_dir(&self, appid: &str, version: &str) -> PathBuf {
        self.apps_root().join(".venv").join(appid).join(version)
    }

    /// `$D/apps/.bin/<appid>` (extension left to the caller; platform-specific).
    pub fn bin_stem(&self, appid: &str) -> PathBuf {
        self.apps_root().join(".bin").join(appid)
    }

    // -- pypi ------------------------------------------------------------

    /// `$D/pypi`
    pub fn pypi_root(&self) -> PathBuf {
        self.root.join("pypi")
    }

    /// `$D/pypi/downloads`
    pub fn pypi_downloads_dir(&self) -> PathBuf {
        self.pypi_root().join("downloads")
    }

    /// `$D/pypi/downloads/<name>`
    pub fn pypi_download_dir(&self, name: &str) -> PathBuf {
        self.pypi_downloads_dir().join(name)
    }

    /// `$D/pypi/installed`
    pub fn pypi_installed_dir(&self) -> PathBuf {
        self.pypi_root().join("installed")
    }

    /// `$D/pypi/installed/<name>/<version>`
    pub fn pypi_install_dir(&self, name: &str, version: &str) -> PathBuf {
        self.pypi_installed_dir().join(name).join(version)
    }

    /// `$D/pypi/index`
    pub fn pypi_index_dir(&self) -> PathBuf {
        self.pypi_root().join("index")
    }

    /// `$D/pypi/index/id_2_paths.json`
    pub fn pypi_index_id_file(&self) -> PathBuf {
        self.pypi_index_dir().join("id_2_paths.json")
    }

    /// `$D/pypi/index/name_2_vers.json`
    pub fn pypi_index_name_file(&self) -> PathBuf {
        self.pypi_index_dir().join("name_2_vers.json")
    }
}

/// Recursively create `path` and its parents, removing anything already
/// there first.
pub fn create_clean_dir(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)
}

/// Create the parent directories of `path` if they don't already exist.
pub fn ensure_parent_dir(path: impl AsRef<Path>) -> io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_spec() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DepslandPaths::new(tmp.path());
        assert_eq!(
            paths.app_version_dir("hello_app", "1.0.0"),
            paths.root().join("apps/hello_app/1.0.0")
        );
        assert_eq!(
            paths.pypi_install_dir("requests", "2.31.0"),
            paths.root().join("pypi/installed/requests/2.31.0")
        );
        assert_eq!(
            paths.library_view_dir("hello_app", "1.0.0"),
            paths.root().join("apps/.venv/hello_app/1.0.0")
        );
    }

    #[test]
    fn create_clean_dir_removes_stale_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("stale");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("leftover.txt"), b"old").unwrap();

        create_clean_dir(&target).unwrap();

        assert!(target.is_dir());
        assert!(!target.join("leftover.txt").exists());
    }
}
