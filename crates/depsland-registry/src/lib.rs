// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-registry
//!
//! Per-machine bookkeeping of which versions of an app have been
//! installed or distributed, backed by two newest-first, one-version-
//! per-line history files alongside the app's version directories.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use depsland_paths::DepslandPaths;
use thiserror::Error;

/// Errors raised while reading or mutating the app registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A history file operation failed.
    #[error("I/O error at {0:?}: {1}")]
    Io(std::path::PathBuf, io::Error),
}

/// Which history file an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryKind {
    Installation,
    Distribution,
}

/// Per-machine record of installed/distributed versions, one set of
/// history files per appid, rooted at a [`DepslandPaths`] layout.
pub struct AppRegistry {
    paths: DepslandPaths,
}

impl AppRegistry {
    /// Open the registry rooted at `paths`.
    pub fn new(paths: DepslandPaths) -> Self {
        Self { paths }
    }

    fn history_file(&self, appid: &str, kind: HistoryKind) -> std::path::PathBuf {
        match kind {
            HistoryKind::Installation => self.paths.inst_history_file(appid),
            HistoryKind::Distribution => self.paths.dist_history_file(appid),
        }
    }

    /// All recorded installed versions of `appid`, newest first.
    pub fn installation_history(&self, appid: &str) -> Result<Vec<String>, RegistryError> {
        read_history(&self.history_file(appid, HistoryKind::Installation))
    }

    /// All recorded distributed versions of `appid`, newest first.
    pub fn distribution_history(&self, appid: &str) -> Result<Vec<String>, RegistryError> {
        read_history(&self.history_file(appid, HistoryKind::Distribution))
    }

    /// The most recently installed version of `appid`, if any.
    pub fn last_installed_version(&self, appid: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.installation_history(appid)?.into_iter().next())
    }

    /// The most recently distributed version of `appid`, if any.
    pub fn last_distributed_version(&self, appid: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.distribution_history(appid)?.into_iter().next())
    }

    /// Record a newly installed version of `appid`, deduplicating against
    /// the current head (a no-op if `version` is already most recent).
    pub fn prepend_installed(&self, appid: &str, version: &str) -> Result<(), RegistryError> {
        self.prepend(appid, HistoryKind::Installation, version)
    }

    /// Record a newly distributed version of `appid`, deduplicating
    /// against the current head.
    pub fn prepend_distributed(&self, appid: &str, version: &str) -> Result<(), RegistryError> {
        self.prepend(appid, HistoryKind::Distribution, version)
    }

    fn prepend(&self, appid: &str, kind: HistoryKind, version: &str) -> Result<(), RegistryError> {
        let path = self.history_file(appid, kind);
        let mut history = read_history(&path)?;
        if history.first().map(String::as_str) == Some(version) {
            return Ok(());
        }
        history.insert(0, version.to_string());
        write_history(&path, &history)
    }
}

fn read_history(path: &Path) -> Result<Vec<String>, RegistryError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(RegistryError::Io(path.to_path_buf(), e)),
    }
}

fn write_history(path: &Path, history: &[String]) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RegistryError::Io(parent.to_path_buf(), e))?;
    }
    let mut file =
        fs::File::create(path).map_err(|e| RegistryError::Io(path.to_path_buf(), e))?;
    for version in history {
        writeln!(file, "{version}").map_err(|e| RegistryError::Io(path.to_path_buf(), e))?;
    }
    Ok(())
}
