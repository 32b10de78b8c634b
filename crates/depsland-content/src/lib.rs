// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-content
//!
//! Content addressing primitives: a stable file hash, asset/package
//! identifier formatting, and the archive filename grammar used to recover
//! `(name, version)` from a downloaded wheel or sdist filename.

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while computing content addresses.
#[derive(Debug, Error)]
pub enum ContentError {
    /// Reading the file to hash failed.
    #[error("failed to read {0}: {1}")]
    Io(std::path::PathBuf, io::Error),
    /// The filename didn't match the wheel/sdist archive grammar.
    #[error("unrecognized archive filename: {0}")]
    UnrecognizedFilename(String),
}

const CHUNK_SIZE: usize = 64 * 1024;

/// Stream `path` through SHA-256 and return its lowercase hex digest.
pub fn hash_file(path: &Path) -> Result<String, ContentError> {
    let file = File::open(path).map_err(|e| ContentError::Io(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| ContentError::Io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash raw bytes directly, for callers that already have the content in
/// memory (e.g. an in-flight download buffer).
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The content identifier of a directory asset: the directory's last
/// modification time, as a string. Directories are re-packaged whenever
/// any mtime changes — a deliberate precision-for-cheapness tradeoff (see
/// the manifest schema notes).
pub fn dir_uid(updated_time: i64) -> String {
    updated_time.to_string()
}

/// `"{normalized_name}-{exact_version}"`.
pub fn package_id(name: &str, version: &str) -> String {
    format!("{}-{}", depsland_version::normalize_name(name), version)
}

/// Recover `(name, version)` from a wheel or sdist archive filename.
///
/// - wheel: `name-version-...*.whl` — split on the first two `-`.
/// - sdist: `name-version.tar.gz` / `name-version.zip` — split on the last `-`.
pub fn parse_archive_filename(filename: &str) -> Result<(String, String), ContentError> {
    let stem = if let Some(s) = filename.strip_suffix(".whl") {
        let mut parts = s.splitn(3, '-');
        let name = parts
            .next()
            .ok_or_else(|| ContentError::UnrecognizedFilename(filename.to_string()))?;
        let version = parts
            .next()
            .ok_or_else(|| ContentError::UnrecognizedFilename(filename.to_string()))?;
        return Ok((depsland_version::normalize_name(name), version.to_string()));
    } else if let Some(s) = filename.strip_suffix(".tar.gz") {
        s
    } else if let Some(s) = filename.strip_suffix(".zip") {
        s
    } else {
        return Err(ContentError::UnrecognizedFilename(filename.to_string()));
    };

    let (name, version) = stem
        .rsplit_once('-')
        .ok_or_else(|| ContentError::UnrecognizedFilename(filename.to_string()))?;
    Ok((depsland_version::normalize_name(name), version.to_string()))
}
