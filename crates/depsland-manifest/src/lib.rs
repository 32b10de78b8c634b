// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-manifest
//!
//! The typed, validated snapshot of one app release: which files and
//! directories it ships (`assets`), which third-party packages it depends
//! on (`dependencies`), and the opaque configuration consumed by the
//! (out-of-scope) launcher emitter.
//!
//! Two on-wire forms are supported: a human-authored `manifest.json`
//! (assets as `relpath -> scheme`, dependencies as `name -> version`) and
//! the fully-populated `manifest.pkl` release form, encoded with
//! MessagePack. [`load_manifest`] accepts either, filling in any asset
//! fields the JSON form omits by scanning the filesystem.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading, validating or dumping a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// I/O failure reading the manifest file or scanning its assets.
    #[error("I/O error at {0}: {1}")]
    Io(PathBuf, io::Error),
    /// The `.json` authoring form failed to parse.
    #[error("failed to parse {0} as manifest.json: {1}")]
    Json(PathBuf, serde_json::Error),
    /// The `.pkl` release form failed to decode.
    #[error("failed to decode {0} as manifest.pkl: {1}")]
    MessagePack(PathBuf, rmp_serde::decode::Error),
    /// The `.pkl` release form failed to encode.
    #[error("failed to encode manifest.pkl: {0}")]
    MessagePackEncode(#[from] rmp_serde::encode::Error),
    /// An asset key is not a valid relative path under `start_directory`.
    #[error("asset {0:?} is not a relative path rooted under start_directory")]
    InvalidAssetPath(String),
    /// An asset's declared scheme token isn't one of the known schemes.
    #[error("asset {0:?} has unknown scheme {1:?}")]
    UnknownScheme(String, String),
    /// A dependency's version string doesn't parse as a pinned exact version.
    #[error("dependency {0:?} has unresolved version {1:?}: {2}")]
    UnpinnedDependency(String, String, depsland_version::VersionError),
    /// The manifest file has no recognized extension (`.json` or `.pkl`).
    #[error("unrecognized manifest file extension: {0}")]
    UnrecognizedExtension(PathBuf),
    /// Content addressing failed while enriching an asset.
    #[error(transparent)]
    Content(#[from] depsland_content::ContentError),
}

/// Whether an asset is a single file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// A single file.
    File,
    /// A directory.
    Dir,
}

/// What part of a directory asset gets packaged/restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// The path is only a mount point; contents are not packaged.
    Root,
    /// The entire tree, files and subdirs, recursively.
    All,
    /// The directory skeleton only, no files.
    AllDirs,
    /// Immediate children: files and one-level subdir skeletons.
    Top,
    /// Only immediate files.
    TopFiles,
    /// Only immediate subdirectory names (skeleton).
    TopDirs,
}

impl Scheme {
    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "root" => Self::Root,
            "all" => Self::All,
            "all_dirs" => Self::AllDirs,
            "top" => Self::Top,
            "top_files" => Self::TopFiles,
            "top_dirs" => Self::TopDirs,
            _ => return None,
        })
    }
}

/// Everything the differ/publisher/installer need to know about one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// File or directory.
    pub kind: AssetKind,
    /// What part of a directory asset is packaged.
    pub scheme: Scheme,
    /// Epoch seconds of the asset's last observed modification.
    pub updated_time: i64,
    /// Content hash, present for files, `None` for directories.
    pub hash: Option<String>,
    /// The content identifier: `hash` for files, `updated_time` (as a
    /// string) for directories.
    pub uid: String,
}

/// An override for where a package's archive is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PackageAppendix {
    /// A custom source URL, bypassing the default package index layout.
    pub custom_url: Option<String>,
}

/// A pinned dependency of one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// `"{name}-{version}"`.
    pub id: String,
    /// Normalized package name.
    pub name: String,
    /// Exact, pinned version.
    pub version: String,
    /// Child package ids, for dependency-graph traversal.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional source override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appendix: Option<PackageAppendix>,
}

/// Opaque configuration consumed by the (out-of-scope) launcher emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LauncherInfo {
    /// The command line to run the app.
    #[serde(default)]
    pub command: String,
    /// Path to an icon file.
    #[serde(default)]
    pub icon: Option<String>,
    /// Whether to show a console window (Windows).
    #[serde(default)]
    pub show_console: bool,
    /// Whether to generate a CLI entry point under `apps/.bin`.
    #[serde(default)]
    pub enable_cli: bool,
    /// Whether to add a desktop shortcut.
    #[serde(default)]
    pub add_to_desktop: bool,
    /// Whether to add a start menu entry.
    #[serde(default)]
    pub add_to_start_menu: bool,
}

/// An immutable snapshot of one release of one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Stable, lowercase, underscore-separated app identifier.
    pub appid: String,
    /// Human display name.
    pub name: String,
    /// Strictly increasing (across releases of the same `appid`) semantic version.
    pub version: String,
    /// Absolute path this manifest is rooted at. Rewritten on every load,
    /// never trusted from the serialized form.
    #[serde(skip, default)]
    pub start_directory: PathBuf,
    /// Relative path -> asset info.
    pub assets: BTreeMap<String, AssetInfo>,
    /// Normalized package name -> pinned dependency.
    pub dependencies: BTreeMap<String, PackageInfo>,
    /// Launcher configuration, opaque to the core.
    pub launcher: LauncherInfo,
}

impl Manifest {
    /// Validate the three manifest invariants from the data model: asset
    /// keys are relative paths, dependencies are pinned to an exact
    /// version, and the appid is itself normalized.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if depsland_version::normalize_name(&self.appid) != self.appid {
            return Err(ManifestError::InvalidAssetPath(self.appid.clone()));
        }
        for key in self.assets.keys() {
            if Path::new(key).is_absolute() || key.split('/').any(|part| part == "..") {
                return Err(ManifestError::InvalidAssetPath(key.clone()));
            }
        }
        for (name, info) in &self.dependencies {
            if let Err(e) = depsland_version::parse_version(&info.version) {
                return Err(ManifestError::UnpinnedDependency(
                    name.clone(),
                    info.version.clone(),
                    e,
                ));
            }
        }
        Ok(())
    }
}

/// The human-authored `manifest.json` form: assets are `relpath -> scheme`
/// tokens and dependencies are `name -> exact version`, both enriched by
/// [`load_manifest`] into the fully-typed [`Manifest`].
#[derive(Debug, Deserialize)]
struct RawManifest {
    appid: String,
    name: String,
    version: String,
    #[serde(default)]
    assets: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    launcher: LauncherInfo,
}

/// Build the synthetic empty manifest used as "old manifest" on a first
/// publish or install, pinned at version `0.0.0`.
pub fn init_manifest(appid: &str, name: &str) -> Manifest {
    Manifest {
        appid: depsland_version::normalize_name(appid),
        name: name.to_string(),
        version: "0.0.0".to_string(),
        start_directory: PathBuf::new(),
        assets: BTreeMap::new(),
        dependencies: BTreeMap::new(),
        launcher: LauncherInfo::default(),
    }
}

/// Load a manifest from either a `.json` authoring form or a `.pkl`
/// release form, rewriting `start_directory` to `path`'s absolute parent
/// directory and validating all invariants before returning.
pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let start_directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let start_directory = fs::canonicalize(&start_directory).unwrap_or(start_directory);

    let manifest = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => load_json_manifest(path, &start_directory)?,
        Some("pkl") => load_pkl_manifest(path)?,
        _ => return Err(ManifestError::UnrecognizedExtension(path.to_path_buf())),
    };

    let mut manifest = manifest;
    manifest.start_directory = start_directory;
    manifest.validate()?;
    Ok(manifest)
}

fn load_pkl_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let bytes = fs::read(path).map_err(|e| ManifestError::Io(path.to_path_buf(), e))?;
    rmp_serde::from_slice(&bytes).map_err(|e| ManifestError::MessagePack(path.to_path_buf(), e))
}

fn load_json_manifest(path: &Path, start_directory: &Path) -> Result<Manifest, ManifestError> {
    let text = fs::read_to_string(path).map_err(|e| ManifestError::Io(path.to_path_buf(), e))?;
    let raw: RawManifest =
        serde_json::from_str(&text).map_err(|e| ManifestError::Json(path.to_path_buf(), e))?;

    let mut assets = BTreeMap::new();
    for (relpath, scheme_token) in raw.assets {
        let scheme = Scheme::from_token(&scheme_token)
            .ok_or_else(|| ManifestError::UnknownScheme(relpath.clone(), scheme_token.clone()))?;
        let info = enrich_asset(start_directory, &relpath, scheme)?;
        assets.insert(relpath, info);
    }

    let mut dependencies = BTreeMap::new();
    for (raw_name, version) in raw.dependencies {
        let name = depsland_version::normalize_name(&raw_name);
        let id = depsland_content::package_id(&name, &version);
        dependencies.insert(
            name.clone(),
            PackageInfo {
                id,
                name,
                version,
                dependencies: Vec::new(),
                appendix: None,
            },
        );
    }

    Ok(Manifest {
        appid: depsland_version::normalize_name(&raw.appid),
        name: raw.name,
        version: raw.version,
        start_directory: start_directory.to_path_buf(),
        assets,
        dependencies,
        launcher: raw.launcher,
    })
}

/// Scan `start_directory/relpath` on disk to fill in `updated_time`,
/// `hash` and `uid` for an asset whose scheme was declared in the
/// authoring form but whose content fields weren't.
fn enrich_asset(
    start_directory: &Path,
    relpath: &str,
    scheme: Scheme,
) -> Result<AssetInfo, ManifestError> {
    let abs_path = start_directory.join(relpath);
    let metadata = fs::metadata(&abs_path).map_err(|e| ManifestError::Io(abs_path.clone(), e))?;
    let updated_time = mtime_epoch_seconds(&metadata, &abs_path)?;

    if metadata.is_dir() {
        Ok(AssetInfo {
            kind: AssetKind::Dir,
            scheme,
            updated_time,
            hash: None,
            uid: depsland_content::dir_uid(updated_time),
        })
    } else {
        let hash = depsland_content::hash_file(&abs_path)?;
        Ok(AssetInfo {
            kind: AssetKind::File,
            scheme,
            updated_time,
            uid: hash.clone(),
            hash: Some(hash),
        })
    }
}

fn mtime_epoch_seconds(metadata: &fs::Metadata, path: &Path) -> Result<i64, ManifestError> {
    let modified = metadata
        .modified()
        .map_err(|e| ManifestError::Io(path.to_path_buf(), e))?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(secs)
}

/// Write the fully-typed `.pkl` release form (MessagePack-encoded).
pub fn dump_manifest(manifest: &Manifest, path: &Path) -> Result<(), ManifestError> {
    let bytes = rmp_serde::to_vec(manifest)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| ManifestError::Io(parent.to_path_buf(), e))?;
        }
    }
    fs::write(path, bytes).map_err(|e| ManifestError::Io(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(start_directory: PathBuf) -> Manifest {
        let mut assets = BTreeMap::new();
        assets.insert(
            "main.py".to_string(),
            AssetInfo {
                kind: AssetKind::File,
                scheme: Scheme::All,
                updated_time: 1000,
                hash: Some("deadbeef".to_string()),
                uid: "deadbeef".to_string(),
            },
        );
        let mut dependencies = BTreeMap::new();
        dependencies.insert(
            "requests".to_string(),
            PackageInfo {
                id: "requests-2.31.0".to_string(),
                name: "requests".to_string(),
                version: "2.31.0".to_string(),
                dependencies: vec![],
                appendix: None,
            },
        );
        Manifest {
            appid: "hello_app".to_string(),
            name: "Hello App".to_string(),
            version: "1.0.0".to_string(),
            start_directory,
            assets,
            dependencies,
            launcher: LauncherInfo {
                command: "py main.py".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn round_trips_through_pkl() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest(dir.path().to_path_buf());
        let pkl_path = dir.path().join("manifest.pkl");
        dump_manifest(&manifest, &pkl_path).unwrap();

        let loaded = load_manifest(&pkl_path).unwrap();
        let mut expected = manifest.clone();
        expected.start_directory = loaded.start_directory.clone();
        assert_eq!(loaded, expected);
    }

    #[test]
    fn json_form_is_enriched_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), b"print(1)").unwrap();
        let json = r#"{
            "appid": "hello_app",
            "name": "Hello App",
            "version": "1.0.0",
            "assets": { "main.py": "all" },
            "dependencies": { "Requests": "2.31.0" },
            "launcher": { "command": "py main.py" }
        }"#;
        let manifest_path = dir.path().join("manifest.json");
        fs::write(&manifest_path, json).unwrap();

        let manifest = load_manifest(&manifest_path).unwrap();
        assert_eq!(manifest.appid, "hello_app");
        let asset = manifest.assets.get("main.py").unwrap();
        assert_eq!(asset.kind, AssetKind::File);
        assert!(asset.hash.is_some());
        assert_eq!(asset.uid, asset.hash.clone().unwrap());

        let dep = manifest.dependencies.get("requests").unwrap();
        assert_eq!(dep.id, "requests-2.31.0");
    }

    #[test]
    fn rejects_absolute_asset_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path().to_path_buf());
        manifest
            .assets
            .insert("/etc/passwd".to_string(), manifest.assets["main.py"].clone());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn init_manifest_is_synthetic_v0() {
        let m = init_manifest("Hello-App", "Hello App");
        assert_eq!(m.appid, "hello_app");
        assert_eq!(m.version, "0.0.0");
        assert!(m.assets.is_empty());
    }
}
