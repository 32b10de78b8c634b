// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-index
//!
//! A process-local, on-disk index of the third-party packages a host has
//! downloaded and installed, shared by every app that depends on them.
//! `downloads/<archive>` -> `installed/<name>/<version>` is recorded by
//! id so a later install can reuse an already-unpacked package instead of
//! re-fetching it.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading, mutating or persisting the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A filesystem operation failed.
    #[error("I/O error at {0}: {1}")]
    Io(PathBuf, io::Error),
    /// An index file on disk failed to parse.
    #[error("failed to parse {0}: {1}")]
    Json(PathBuf, serde_json::Error),
    /// A path handed to `add_to_index`/`update_index` isn't recognizable
    /// as an archive filename or a `<name>/<version>` install directory.
    #[error("unrecognized package path: {0}")]
    UnrecognizedPath(PathBuf),
    /// `download` is not rooted under `<root>/downloads`.
    #[error("{0} is not under the downloads directory")]
    OutsideDownloads(PathBuf),
    /// `install` is not rooted under `<root>/installed`.
    #[error("{0} is not under the installed directory")]
    OutsideInstalled(PathBuf),
    /// An install was recorded with no matching stashed download.
    #[error("no stashed download for package id {0}")]
    Inconsistency(String),
    /// The requested package id has no index entry.
    #[error("package id {0} is not indexed")]
    NotFound(String),
}

/// Which half of a download-then-install pair `add_to_index` is recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `path` is a freshly fetched archive under `<root>/downloads`.
    Download,
    /// `path` is a freshly unpacked `<root>/installed/<name>/<version>` directory.
    Install,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnDisk {
    #[serde(default)]
    id_to_paths: BTreeMap<String, (PathBuf, PathBuf)>,
    #[serde(default)]
    name_to_versions: BTreeMap<String, Vec<String>>,
}

/// The shared package index rooted at a pypi-style directory tree
/// (`downloads/`, `installed/`, `index/`).
pub struct PackageIndex {
    root: PathBuf,
    id_to_paths: BTreeMap<String, (PathBuf, PathBuf)>,
    name_to_versions: BTreeMap<String, Vec<String>>,
    stash: HashMap<String, PathBuf>,
    dirty: HashSet<String>,
}

impl PackageIndex {
    fn id_paths_file(root: &Path) -> PathBuf {
        root.join("index").join("id_2_paths.json")
    }

    fn name_vers_file(root: &Path) -> PathBuf {
        root.join("index").join("name_2_vers.json")
    }

    /// Load the index rooted at `root`, defaulting to empty maps on a
    /// first run where the index files don't exist yet.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let root = root.into();
        let id_to_paths = read_json_or_default(&Self::id_paths_file(&root))?;
        let name_to_versions = read_json_or_default(&Self::name_vers_file(&root))?;
        Ok(Self {
            root,
            id_to_paths,
            name_to_versions,
            stash: HashMap::new(),
            dirty: HashSet::new(),
        })
    }

    /// Whether `id` has a recorded download+install pair.
    pub fn has_id(&self, id: &str) -> bool {
        self.id_to_paths.contains_key(id)
    }

    /// Whether any version of `name` is indexed.
    pub fn has_name(&self, name: &str) -> bool {
        self.name_to_versions
            .get(name)
            .is_some_and(|versions| !versions.is_empty())
    }

    /// All known versions of `name`, in index order (descending once saved).
    pub fn versions_of(&self, name: &str) -> &[String] {
        self.name_to_versions
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve `id` to its absolute `(download_path, install_path)`.
    pub fn get(&self, id: &str) -> Result<(PathBuf, PathBuf), IndexError> {
        let (download, install) = self
            .id_to_paths
            .get(id)
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?;
        Ok((self.root.join(download), self.root.join(install)))
    }

    /// Record one half of a download-then-install pair.
    ///
    /// A [`EntryKind::Download`] stashes the archive's path by its parsed
    /// package id. A [`EntryKind::Install`] parses the id from the
    /// install directory's last two path components (`<name>/<version>`),
    /// pops the matching stash entry and commits both paths via
    /// [`update_index`](Self::update_index).
    pub fn add_to_index(&mut self, path: &Path, kind: EntryKind) -> Result<(), IndexError> {
        match kind {
            EntryKind::Download => {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| IndexError::UnrecognizedPath(path.to_path_buf()))?;
                let (name, version) = depsland_content::parse_archive_filename(filename)
                    .map_err(|_| IndexError::UnrecognizedPath(path.to_path_buf()))?;
                let id = depsland_content::package_id(&name, &version);
                self.stash.insert(id, path.to_path_buf());
                Ok(())
            }
            EntryKind::Install => {
                let version = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| IndexError::UnrecognizedPath(path.to_path_buf()))?;
                let name = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| IndexError::UnrecognizedPath(path.to_path_buf()))?;
                let id = depsland_content::package_id(name, version);
                let download = self
                    .stash
                    .remove(&id)
                    .ok_or_else(|| IndexError::Inconsistency(id.clone()))?;
                self.update_index(&id, &download, path, false)
            }
        }
    }

    /// Commit a `(download, install)` pair for `id`, validating both
    /// paths are rooted under `<root>/downloads` and `<root>/installed`
    /// respectively (compared case-insensitively, matching the upstream
    /// implementation's Windows-path caveat).
    pub fn update_index(
        &mut self,
        id: &str,
        download: &Path,
        install: &Path,
        force: bool,
    ) -> Result<(), IndexError> {
        let downloads_root = self.root.join("downloads");
        let installed_root = self.root.join("installed");

        if strip_prefix_ci(download, &downloads_root).is_none() {
            return Err(IndexError::OutsideDownloads(download.to_path_buf()));
        }
        if strip_prefix_ci(install, &installed_root).is_none() {
            return Err(IndexError::OutsideInstalled(install.to_path_buf()));
        }
        let download_rel = strip_prefix_ci(download, &self.root)
            .ok_or_else(|| IndexError::OutsideDownloads(download.to_path_buf()))?;
        let install_rel = strip_prefix_ci(install, &self.root)
            .ok_or_else(|| IndexError::OutsideInstalled(install.to_path_buf()))?;

        if self.id_to_paths.contains_key(id) && !force {
            tracing::debug!(id, "re-indexing already-indexed package id");
        }

        let name = id
            .rsplit_once('-')
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| id.to_string());
        let version = id
            .rsplit_once('-')
            .map(|(_, version)| version.to_string())
            .unwrap_or_default();

        self.id_to_paths
            .insert(id.to_string(), (download_rel, install_rel));
        let versions = self.name_to_versions.entry(name.clone()).or_default();
        if !versions.contains(&version) {
            versions.push(version);
        }
        self.dirty.insert(name);
        Ok(())
    }

    /// Persist both maps via write-then-rename. Idempotent; re-sorts only
    /// the names mutated since the last save. Logs a warning if the
    /// download stash still has unmatched entries (a download recorded
    /// with no corresponding install).
    pub fn save(&mut self) -> Result<(), IndexError> {
        for name in self.dirty.drain().collect::<Vec<_>>() {
            if let Some(versions) = self.name_to_versions.get_mut(&name) {
                depsland_version::sort_versions(versions, true);
            }
        }

        let index_dir = self.root.join("index");
        fs::create_dir_all(&index_dir).map_err(|e| IndexError::Io(index_dir.clone(), e))?;

        write_json_atomic(&Self::id_paths_file(&self.root), &self.id_to_paths)?;
        write_json_atomic(&Self::name_vers_file(&self.root), &self.name_to_versions)?;

        if !self.stash.is_empty() {
            tracing::warn!(
                count = self.stash.len(),
                "package index saved with unresolved downloads in the stash"
            );
        }
        Ok(())
    }
}

impl Drop for PackageIndex {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            tracing::error!(error = %e, "failed to save package index on drop");
        }
    }
}

fn strip_prefix_ci(path: &Path, prefix: &Path) -> Option<PathBuf> {
    let path_str = path.to_string_lossy().to_lowercase();
    let prefix_str = prefix.to_string_lossy().to_lowercase();
    if path_str.starts_with(&prefix_str) {
        path.strip_prefix(prefix).ok().map(Path::to_path_buf)
    } else {
        None
    }
}

fn read_json_or_default<T: Default + for<'de> Deserialize<'de>>(
    path: &Path,
) -> Result<T, IndexError> {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).map_err(|e| IndexError::Json(path.to_path_buf(), e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(IndexError::Io(path.to_path_buf(), e)),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), IndexError> {
    let parent = path
        .parent()
        .ok_or_else(|| IndexError::UnrecognizedPath(path.to_path_buf()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| IndexError::Io(parent.to_path_buf(), e))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| IndexError::Json(path.to_path_buf(), e))?;
    tmp.persist(path)
        .map_err(|e| IndexError::Io(path.to_path_buf(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("downloads")).unwrap();
        fs::create_dir_all(dir.path().join("installed")).unwrap();
        dir
    }

    #[test]
    fn add_then_save_produces_descending_versions() {
        let dir = prepare_root();
        let mut index = PackageIndex::load(dir.path()).unwrap();

        for version in ["1.0.0", "2.0.0", "1.5.0"] {
            let download = dir.path().join("downloads").join(format!("requests-{version}.tar.gz"));
            fs::write(&download, b"x").unwrap();
            index.add_to_index(&download, EntryKind::Download).unwrap();

            let install = dir.path().join("installed").join("requests").join(version);
            fs::create_dir_all(&install).unwrap();
            index.add_to_index(&install, EntryKind::Install).unwrap();
        }

        index.save().unwrap();
        assert_eq!(
            index.versions_of("requests"),
            &["2.0.0".to_string(), "1.5.0".to_string(), "1.0.0".to_string()]
        );
        assert!(index.stash.is_empty());
    }

    #[test]
    fn install_without_stashed_download_is_inconsistent() {
        let dir = prepare_root();
        let mut index = PackageIndex::load(dir.path()).unwrap();
        let install = dir.path().join("installed").join("requests").join("1.0.0");
        fs::create_dir_all(&install).unwrap();
        let err = index.add_to_index(&install, EntryKind::Install).unwrap_err();
        assert!(matches!(err, IndexError::Inconsistency(_)));
    }

    #[test]
    fn download_without_install_leaves_stash_nonempty() {
        let dir = prepare_root();
        let mut index = PackageIndex::load(dir.path()).unwrap();
        let download = dir.path().join("downloads").join("requests-1.0.0.tar.gz");
        fs::write(&download, b"x").unwrap();
        index.add_to_index(&download, EntryKind::Download).unwrap();
        assert!(!index.stash.is_empty());
    }

    #[test]
    fn get_resolves_absolute_paths() {
        let dir = prepare_root();
        let mut index = PackageIndex::load(dir.path()).unwrap();
        let download = dir.path().join("downloads").join("requests-1.0.0.tar.gz");
        fs::write(&download, b"x").unwrap();
        index.add_to_index(&download, EntryKind::Download).unwrap();
        let install = dir.path().join("installed").join("requests").join("1.0.0");
        fs::create_dir_all(&install).unwrap();
        index.add_to_index(&install, EntryKind::Install).unwrap();

        let (got_download, got_install) = index.get("requests-1.0.0").unwrap();
        assert_eq!(got_download, download);
        assert_eq!(got_install, install);
    }
}
