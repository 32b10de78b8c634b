// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-installer
//!
//! Materializes one version of an app on a host machine: fetches the
//! blobs it doesn't already have, reuses the files it does, installs and
//! links its third-party dependencies through the shared package index,
//! and hands off to an externally supplied launcher emitter.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use depsland_blobstore::{asset_key, manifest_key, package_key, BlobStore, BlobStoreError};
use depsland_differ::{diff, Action};
use depsland_index::{EntryKind, IndexError, PackageIndex};
use depsland_manifest::{AssetKind, Manifest, ManifestError, Scheme};
use depsland_paths::DepslandPaths;
use depsland_registry::{AppRegistry, RegistryError};
use thiserror::Error;

/// Where the manifest to install comes from.
pub enum ManifestSource {
    /// Download `manifest.pkl` from the blob store.
    Remote,
    /// Caller already has a loaded manifest (e.g. a local install against
    /// a colocated mock blob store).
    Local(Manifest),
}

/// One install request.
pub struct InstallRequest {
    /// The app being installed.
    pub appid: String,
    /// Where to get the new manifest from.
    pub manifest_source: ManifestSource,
    /// Whether to proceed when a strictly newer version is available.
    pub upgrade: bool,
    /// Whether to wipe and reinstall when the requested version is
    /// already the installed one.
    pub reinstall: bool,
}

/// What `install` did.
#[derive(Debug)]
pub enum InstallOutcome {
    /// A new per-version directory was materialized at this path.
    Installed(PathBuf),
    /// The requested version is already installed; nothing was done.
    UpToDate,
    /// A newer version exists but `upgrade` was not set; nothing was done.
    NewVersionAvailable(String),
}

/// Errors raised while installing an app.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The target per-version directory already exists.
    #[error("target directory already exists: {0}")]
    TargetExists(PathBuf),
    /// A referenced blob could not be found in the store.
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    /// The shared package index is in an inconsistent state.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// A manifest operation failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A filesystem operation failed.
    #[error("I/O error at {0:?}: {1}")]
    Io(PathBuf, io::Error),
    /// A blob store operation failed.
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    /// A history file operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A version string failed to parse.
    #[error(transparent)]
    Version(#[from] depsland_version::VersionError),
    /// Extracting a downloaded archive failed.
    #[error("failed to extract archive {0:?}: {1}")]
    Zip(PathBuf, zip::result::ZipError),
    /// The launcher emitter failed.
    #[error("launcher emission failed: {0}")]
    Launcher(String),
}

/// The external hook that turns an installed manifest into a runnable
/// launcher (desktop shortcut, start menu entry, CLI shim). Not
/// implemented here; callers supply one.
pub trait LauncherEmitter {
    /// Emit whatever launcher artifacts `manifest.launcher` describes for
    /// the app materialized at `target_dir`.
    fn emit(&self, manifest: &Manifest, target_dir: &Path) -> Result<(), InstallError>;
}

/// A [`LauncherEmitter`] that does nothing, for tests and for callers
/// that don't need launcher artifacts.
pub struct NullLauncherEmitter;

impl LauncherEmitter for NullLauncherEmitter {
    fn emit(&self, _manifest: &Manifest, _target_dir: &Path) -> Result<(), InstallError> {
        Ok(())
    }
}

const MAX_PACKAGE_WORKERS: usize = 8;

/// Install `req.appid` per the nine-step algorithm: resolve manifests,
/// gate on version/flags, provision the target directory, reuse-or-fetch
/// assets, fetch-and-link dependencies through the shared index, emit
/// the launcher, then record history.
pub fn install(
    req: InstallRequest,
    blobs: &dyn BlobStore,
    registry: &AppRegistry,
    index: &Mutex<PackageIndex>,
    paths: &DepslandPaths,
    launcher: &dyn LauncherEmitter,
) -> Result<InstallOutcome, InstallError> {
    let new = resolve_new_manifest(&req, blobs)?;
    let old = resolve_old_manifest(&req.appid, registry, paths)?;

    let new_version = depsland_version::parse_version(&new.version)?;
    let old_version = depsland_version::parse_version(&old.version)?;

    let effective_old = if new_version == old_version && req.reinstall {
        let old_dir = paths.app_version_dir(&req.appid, &old.version);
        if old_dir.exists() {
            fs::remove_dir_all(&old_dir).map_err(|e| InstallError::Io(old_dir.clone(), e))?;
        }
        depsland_manifest::init_manifest(&req.appid, &new.name)
    } else if new_version > old_version && req.upgrade {
        old
    } else if new_version > old_version {
        return Ok(InstallOutcome::NewVersionAvailable(new.version.clone()));
    } else {
        return Ok(InstallOutcome::UpToDate);
    };

    let target_dir = paths.app_version_dir(&req.appid, &new.version);
    if target_dir.exists() {
        return Err(InstallError::TargetExists(target_dir));
    }
    provision_skeleton(&target_dir, &new)?;

    let result = diff(&new, &effective_old);

    install_assets(&req.appid, &effective_old, &result.assets, blobs, paths, &target_dir)?;
    install_packages(&req.appid, &result.dependencies, blobs, paths, index)?;
    link_library_view(&req.appid, &new, &effective_old, &result.dependencies, paths)?;

    launcher.emit(&new, &target_dir)?;

    depsland_manifest::dump_manifest(&new, &target_dir.join("manifest.pkl"))?;
    registry.prepend_installed(&req.appid, &new.version)?;
    index.lock().expect("index mutex poisoned").save()?;

    tracing::info!(appid = %req.appid, version = %new.version, "installed");
    Ok(InstallOutcome::Installed(target_dir))
}

fn resolve_new_manifest(req: &InstallRequest, blobs: &dyn BlobStore) -> Result<Manifest, InstallError> {
    match &req.manifest_source {
        ManifestSource::Local(manifest) => Ok(manifest.clone()),
        ManifestSource::Remote => {
            let staging = tempfile::tempdir().map_err(|e| InstallError::Io(PathBuf::from("<tempdir>"), e))?;
            let tmp_path = staging.path().join("manifest.pkl");
            let key = manifest_key(&req.appid);
            match blobs.download(&key, &tmp_path) {
                Ok(()) => {}
                Err(BlobStoreError::NotFound(_)) => return Err(InstallError::BlobNotFound(key)),
                Err(e) => return Err(e.into()),
            }
            let manifest = depsland_manifest::load_manifest(&tmp_path)?;
            Ok(manifest)
        }
    }
}

fn resolve_old_manifest(
    appid: &str,
    registry: &AppRegistry,
    paths: &DepslandPaths,
) -> Result<Manifest, InstallError> {
    match registry.last_installed_version(appid)? {
        Some(version) => {
            let manifest_path = paths.app_manifest_file(appid, &version);
            match depsland_manifest::load_manifest(&manifest_path) {
                Ok(m) => Ok(m),
                Err(_) => Ok(depsland_manifest::init_manifest(appid, appid)),
            }
        }
        None => Ok(depsland_manifest::init_manifest(appid, appid)),
    }
}

fn provision_skeleton(target_dir: &Path, new: &Manifest) -> Result<(), InstallError> {
    fs::create_dir_all(target_dir).map_err(|e| InstallError::Io(target_dir.to_path_buf(), e))?;
    for (relpath, info) in &new.assets {
        let path = target_dir.join(relpath);
        match info.kind {
            AssetKind::Dir => {
                fs::create_dir_all(&path).map_err(|e| InstallError::Io(path.clone(), e))?;
            }
            AssetKind::File => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| InstallError::Io(parent.to_path_buf(), e))?;
                }
            }
        }
    }
    Ok(())
}

fn install_assets(
    appid: &str,
    old: &Manifest,
    changes: &[depsland_differ::Change<depsland_manifest::AssetInfo>],
    blobs: &dyn BlobStore,
    paths: &DepslandPaths,
    target_dir: &Path,
) -> Result<(), InstallError> {
    let old_version_dir = (old.version != "0.0.0").then(|| paths.app_version_dir(appid, &old.version));

    for change in changes {
        let new_info = match &change.new {
            Some(info) => info,
            None => continue,
        };
        if new_info.scheme == Scheme::Root {
            continue;
        }
        let target_path = target_dir.join(&change.key);

        match change.action {
            Action::Ignore => {
                let source = old_version_dir
                    .as_ref()
                    .map(|dir| dir.join(&change.key));
                match source {
                    Some(source) if source.exists() => {
                        reuse_asset(&source, &target_path, new_info.kind)?;
                    }
                    _ => {
                        tracing::warn!(key = %change.key, "ignore source missing, promoting to append");
                        fetch_asset(appid, new_info, &change.key, blobs, &target_path)?;
                    }
                }
            }
            Action::Append | Action::Update => {
                fetch_asset(appid, new_info, &change.key, blobs, &target_path)?;
            }
            Action::Delete => {}
        }
    }
    Ok(())
}

fn reuse_asset(source: &Path, target: &Path, kind: AssetKind) -> Result<(), InstallError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| InstallError::Io(parent.to_path_buf(), e))?;
    }
    match kind {
        AssetKind::File => {
            fs::copy(source, target).map_err(|e| InstallError::Io(source.to_path_buf(), e))?;
        }
        AssetKind::Dir => {
            copy_tree(source, target)?;
        }
    }
    Ok(())
}

fn fetch_asset(
    appid: &str,
    info: &depsland_manifest::AssetInfo,
    relpath: &str,
    blobs: &dyn BlobStore,
    target: &Path,
) -> Result<(), InstallError> {
    let staging = tempfile::tempdir().map_err(|e| InstallError::Io(PathBuf::from("<tempdir>"), e))?;
    let key = asset_key(appid, &info.uid);

    match info.kind {
        AssetKind::File => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| InstallError::Io(parent.to_path_buf(), e))?;
            }
            match blobs.download(&key, target) {
                Ok(()) => Ok(()),
                Err(BlobStoreError::NotFound(_)) => Err(InstallError::BlobNotFound(key)),
                Err(e) => Err(e.into()),
            }
        }
        AssetKind::Dir => {
            let archive = staging.path().join(format!("{}.zip", info.uid));
            match blobs.download(&key, &archive) {
                Ok(()) => {}
                Err(BlobStoreError::NotFound(_)) => return Err(InstallError::BlobNotFound(key)),
                Err(e) => return Err(e.into()),
            }
            if !matches!(info.scheme, Scheme::Root) {
                fs::create_dir_all(target).map_err(|e| InstallError::Io(target.to_path_buf(), e))?;
                extract_zip(&archive, target)?;
            }
            let _ = relpath;
            Ok(())
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(dest).map_err(|e| InstallError::Io(dest.to_path_buf(), e))?;
    for entry in walkdir_iter(src)? {
        let rel = entry.strip_prefix(src).expect("entry under src");
        let target = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| InstallError::Io(target.clone(), e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| InstallError::Io(parent.to_path_buf(), e))?;
            }
            fs::copy(&entry, &target).map_err(|e| InstallError::Io(entry.clone(), e))?;
        }
    }
    Ok(())
}

fn walkdir_iter(root: &Path) -> Result<Vec<PathBuf>, InstallError> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                out.push(path.clone());
                walk(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, &mut out).map_err(|e| InstallError::Io(root.to_path_buf(), e))?;
    Ok(out)
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = fs::File::open(archive).map_err(|e| InstallError::Io(archive.to_path_buf(), e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| InstallError::Zip(archive.to_path_buf(), e))?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| InstallError::Zip(archive.to_path_buf(), e))?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let dest_path = dest.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&dest_path).map_err(|e| InstallError::Io(dest_path.clone(), e))?;
            continue;
        }
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| InstallError::Io(parent.to_path_buf(), e))?;
        }
        let mut out = fs::File::create(&dest_path).map_err(|e| InstallError::Io(dest_path.clone(), e))?;
        io::copy(&mut entry, &mut out).map_err(|e| InstallError::Io(dest_path.clone(), e))?;
    }
    Ok(())
}

fn install_packages(
    appid: &str,
    changes: &[depsland_differ::Change<depsland_manifest::PackageInfo>],
    blobs: &dyn BlobStore,
    paths: &DepslandPaths,
    index: &Mutex<PackageIndex>,
) -> Result<(), InstallError> {
    let tasks: Vec<&depsland_manifest::PackageInfo> = changes
        .iter()
        .filter(|c| matches!(c.action, Action::Append | Action::Update))
        .filter_map(|c| c.new.as_ref())
        .collect();

    for chunk in tasks.chunks(MAX_PACKAGE_WORKERS) {
        std::thread::scope(|scope| -> Result<(), InstallError> {
            let handles: Vec<_> = chunk
                .iter()
                .copied()
                .map(|info| {
                    scope.spawn(move || install_one_package(appid, info, blobs, paths, index))
                })
                .collect();
            for handle in handles {
                handle.join().expect("package worker panicked")?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn install_one_package(
    appid: &str,
    info: &depsland_manifest::PackageInfo,
    blobs: &dyn BlobStore,
    paths: &DepslandPaths,
    index: &Mutex<PackageIndex>,
) -> Result<(), InstallError> {
    {
        let guard = index.lock().expect("index mutex poisoned");
        if guard.has_id(&info.id) {
            tracing::debug!(id = %info.id, "package already indexed, reusing");
            return Ok(());
        }
    }

    let key = package_key(appid, &info.id);
    let download_dir = paths.pypi_download_dir(&info.name);
    fs::create_dir_all(&download_dir).map_err(|e| InstallError::Io(download_dir.clone(), e))?;
    let download_path = download_dir.join(format!("{}.zip", info.id));
    match blobs.download(&key, &download_path) {
        Ok(()) => {}
        Err(BlobStoreError::NotFound(_)) => return Err(InstallError::BlobNotFound(key)),
        Err(e) => return Err(e.into()),
    }

    let install_path = paths.pypi_install_dir(&info.name, &info.version);
    fs::create_dir_all(&install_path).map_err(|e| InstallError::Io(install_path.clone(), e))?;
    extract_zip(&download_path, &install_path)?;

    let mut guard = index.lock().expect("index mutex poisoned");
    guard.add_to_index(&download_path, EntryKind::Download)?;
    guard.add_to_index(&install_path, EntryKind::Install)?;
    Ok(())
}

fn link_library_view(
    appid: &str,
    new: &Manifest,
    old: &Manifest,
    dependency_changes: &[depsland_differ::Change<depsland_manifest::PackageInfo>],
    paths: &DepslandPaths,
) -> Result<(), InstallError> {
    let view_dir = paths.library_view_dir(appid, &new.version);
    let all_unchanged = dependency_changes.iter().all(|c| c.action == Action::Ignore);

    if all_unchanged && old.version != "0.0.0" {
        let old_view = paths.library_view_dir(appid, &old.version);
        if old_view.exists() {
            if let Some(parent) = view_dir.parent() {
                fs::create_dir_all(parent).map_err(|e| InstallError::Io(parent.to_path_buf(), e))?;
            }
            return link_dir(&old_view, &view_dir);
        }
    }

    fs::create_dir_all(&view_dir).map_err(|e| InstallError::Io(view_dir.clone(), e))?;
    for info in new.dependencies.values() {
        let install_dir = paths.pypi_install_dir(&info.name, &info.version);
        let link_path = view_dir.join(&info.name);
        if link_path.exists() {
            continue;
        }
        link_dir(&install_dir, &link_path)?;
    }
    Ok(())
}

fn link_dir(src: &Path, dest: &Path) -> Result<(), InstallError> {
    #[cfg(unix)]
    std::os::unix::fs::symlink(src, dest).map_err(|e| InstallError::Io(dest.to_path_buf(), e))?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(src, dest).map_err(|e| InstallError::Io(dest.to_path_buf(), e))?;
    #[cfg(not(any(unix, windows)))]
    copy_tree(src, dest)?;
    Ok(())
}
