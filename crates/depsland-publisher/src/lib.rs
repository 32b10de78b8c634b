// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-publisher
//!
//! Diffs a new manifest against the previous release, packages every
//! changed asset and dependency into a blob, and uploads them in the one
//! order that keeps the remote store crash-safe: assets, then
//! dependencies, then the manifest last.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use depsland_blobstore::{asset_key, manifest_key, package_key, BlobStore, BlobStoreError};
use depsland_differ::{diff, Action};
use depsland_manifest::{AssetKind, Manifest, ManifestError, PackageInfo, Scheme};
use depsland_registry::{AppRegistry, RegistryError};
use thiserror::Error;

/// Errors raised while publishing a release.
#[derive(Debug, Error)]
pub enum PublishError {
    /// `new.appid != old.appid`.
    #[error("manifest appid mismatch: new={0} old={1}")]
    AppIdMismatch(String, String),
    /// `new.version` is not strictly greater than `old.version`.
    #[error("new version {0} does not exceed current version {1}")]
    VersionNotIncreasing(String, String),
    /// A blob store operation failed.
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    /// A filesystem operation failed while staging an asset or package.
    #[error("I/O error at {0:?}: {1}")]
    Io(PathBuf, io::Error),
    /// A manifest operation failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A version string failed to parse during the increase check.
    #[error(transparent)]
    Version(#[from] depsland_version::VersionError),
    /// A dependency's installed files were not found under `library_root`.
    #[error("package {0} has no installed files under the library root")]
    MissingPackageFiles(String),
    /// Zip archive creation failed.
    #[error("failed to write archive {0:?}: {1}")]
    Zip(PathBuf, zip::result::ZipError),
    /// Walking a directory tree while staging or archiving failed.
    #[error("failed to walk {0:?}: {1}")]
    Walk(PathBuf, walkdir::Error),
}

/// Diff `new` against `old`, package every changed asset/dependency, and
/// upload them via `blobs` in the crash-safe order required by the
/// publish ordering guarantee: asset blobs, then dependency blobs, then
/// the manifest last.
pub fn publish(
    new: &Manifest,
    old: &Manifest,
    blobs: &dyn BlobStore,
    library_root: &Path,
    registry: &AppRegistry,
) -> Result<(), PublishError> {
    if new.appid != old.appid {
        return Err(PublishError::AppIdMismatch(new.appid.clone(), old.appid.clone()));
    }
    let new_version = depsland_version::parse_version(&new.version)?;
    let old_version = depsland_version::parse_version(&old.version)?;
    if new_version <= old_version {
        return Err(PublishError::VersionNotIncreasing(
            new.version.clone(),
            old.version.clone(),
        ));
    }

    let result = diff(new, old);
    let staging = tempfile::tempdir().map_err(|e| PublishError::Io(PathBuf::from("<tempdir>"), e))?;

    for change in &result.assets {
        let new_info = change.new.as_ref();
        if matches!(new_info, Some(info) if info.scheme == Scheme::Root) {
            continue;
        }
        match change.action {
            Action::Append | Action::Update => {
                let info = new_info.expect("append/update has a new side");
                let staged = stage_asset(&new.start_directory, &change.key, info.kind, info.scheme, staging.path())?;
                let archive = compress_asset(&staged, info.kind, &info.uid, staging.path())?;
                blobs.upload(&archive, &asset_key(&new.appid, &info.uid))?;
                if change.action == Action::Update {
                    if let Some(old_info) = &change.old {
                        delete_if_present(blobs, &asset_key(&old.appid, &old_info.uid))?;
                    }
                }
            }
            Action::Delete => {
                if let Some(old_info) = &change.old {
                    delete_if_present(blobs, &asset_key(&old.appid, &old_info.uid))?;
                }
            }
            Action::Ignore => {}
        }
    }

    for change in &result.dependencies {
        match change.action {
            Action::Append | Action::Update => {
                let info = change.new.as_ref().expect("append/update has a new side");
                let archive = stage_package(info, library_root, staging.path())?;
                blobs.upload(&archive, &package_key(&new.appid, &info.id))?;
                if change.action == Action::Update {
                    if let Some(old_info) = &change.old {
                        delete_if_present(blobs, &package_key(&old.appid, &old_info.id))?;
                    }
                }
            }
            Action::Delete => {
                if let Some(old_info) = &change.old {
                    delete_if_present(blobs, &package_key(&old.appid, &old_info.id))?;
                }
            }
            Action::Ignore => {}
        }
    }

    let manifest_path = staging.path().join("manifest.pkl");
    depsland_manifest::dump_manifest(new, &manifest_path)?;
    blobs.upload(&manifest_path, &manifest_key(&new.appid))?;

    registry.prepend_distributed(&new.appid, &new.version)
        .map_err(registry_io_err)?;

    tracing::info!(appid = %new.appid, version = %new.version, "published release");
    Ok(())
}

fn delete_if_present(blobs: &dyn BlobStore, key: &str) -> Result<(), PublishError> {
    match blobs.delete(key) {
        Ok(()) | Err(BlobStoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn registry_io_err(e: RegistryError) -> PublishError {
    match e {
        RegistryError::Io(path, io_err) => PublishError::Io(path, io_err),
    }
}

/// Materialize `relpath` under `manifest_root` into `staging` according
/// to `scheme`, mirroring the original implementation's per-scheme asset
/// copy: `All` copies the whole tree, `AllDirs` clones only the
/// directory skeleton, `Top`/`TopFiles`/`TopDirs` copy one level, and
/// `Root` is a packaging no-op (callers filter it out before staging).
fn stage_asset(
    manifest_root: &Path,
    relpath: &str,
    kind: AssetKind,
    scheme: Scheme,
    staging: &Path,
) -> Result<PathBuf, PublishError> {
    let src = manifest_root.join(relpath);
    let dest = staging.join(relpath);

    if kind == AssetKind::File {
        copy_file(&src, &dest)?;
        return Ok(dest);
    }

    match scheme {
        Scheme::Root => unreachable!("root scheme is filtered out before staging"),
        Scheme::All => copy_tree(&src, &dest)?,
        Scheme::AllDirs => copy_dir_skeleton(&src, &dest)?,
        Scheme::Top | Scheme::TopFiles | Scheme::TopDirs => {
            copy_top_level(&src, &dest, scheme)?;
        }
    }
    Ok(dest)
}

fn copy_file(src: &Path, dest: &Path) -> Result<(), PublishError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PublishError::Io(parent.to_path_buf(), e))?;
    }
    fs::copy(src, dest).map_err(|e| PublishError::Io(src.to_path_buf(), e))?;
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), PublishError> {
    fs::create_dir_all(dest).map_err(|e| PublishError::Io(dest.to_path_buf(), e))?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| PublishError::Walk(src.to_path_buf(), e))?;
        let rel = entry.path().strip_prefix(src).expect("entry under src");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| PublishError::Io(target.clone(), e))?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_dir_skeleton(src: &Path, dest: &Path) -> Result<(), PublishError> {
    fs::create_dir_all(dest).map_err(|e| PublishError::Io(dest.to_path_buf(), e))?;
    for entry in walkdir::WalkDir::new(src).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_dir() {
            let rel = entry.path().strip_prefix(src).expect("entry under src");
            fs::create_dir_all(dest.join(rel)).map_err(|e| PublishError::Io(dest.join(rel), e))?;
        }
    }
    Ok(())
}

fn copy_top_level(src: &Path, dest: &Path, scheme: Scheme) -> Result<(), PublishError> {
    fs::create_dir_all(dest).map_err(|e| PublishError::Io(dest.to_path_buf(), e))?;
    let entries = fs::read_dir(src).map_err(|e| PublishError::Io(src.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PublishError::Io(src.to_path_buf(), e))?;
        let file_type = entry.file_type().map_err(|e| PublishError::Io(entry.path(), e))?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            if matches!(scheme, Scheme::Top | Scheme::TopDirs) {
                fs::create_dir_all(&target).map_err(|e| PublishError::Io(target.clone(), e))?;
            }
        } else if matches!(scheme, Scheme::Top | Scheme::TopFiles) {
            copy_file(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Compress a staged asset into the blob that gets uploaded: a directory
/// becomes a `.zip`, a single file only gets a raw copy with a `.fzip`
/// extension since zipping a lone file buys nothing.
fn compress_asset(staged: &Path, kind: AssetKind, uid: &str, staging: &Path) -> Result<PathBuf, PublishError> {
    match kind {
        AssetKind::File => {
            let dest = staging.join(format!("{uid}.fzip"));
            fs::copy(staged, &dest).map_err(|e| PublishError::Io(staged.to_path_buf(), e))?;
            Ok(dest)
        }
        AssetKind::Dir => {
            let dest = staging.join(format!("{uid}.zip"));
            zip_dir(staged, &dest)?;
            Ok(dest)
        }
    }
}

/// Collect a package's installed files from `library_root` and archive
/// them as `<package_id>.zip`.
fn stage_package(info: &PackageInfo, library_root: &Path, staging: &Path) -> Result<PathBuf, PublishError> {
    let install_dir = library_root.join(&info.name).join(&info.version);
    if !install_dir.exists() {
        return Err(PublishError::MissingPackageFiles(info.id.clone()));
    }
    let staged = staging.join(&info.id);
    copy_tree(&install_dir, &staged)?;
    let archive = staging.join(format!("{}.zip", info.id));
    zip_dir(&staged, &archive)?;
    Ok(archive)
}

fn zip_dir(src: &Path, dest: &Path) -> Result<(), PublishError> {
    let file = fs::File::create(dest).map_err(|e| PublishError::Io(dest.to_path_buf(), e))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(src).into_iter().filter_map(Result::ok) {
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("entry under src")
            .to_string_lossy()
            .replace('\\', "/");
        if rel.is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{rel}/"), options)
                .map_err(|e| PublishError::Zip(entry.path().to_path_buf(), e))?;
        } else {
            writer
                .start_file(rel, options)
                .map_err(|e| PublishError::Zip(entry.path().to_path_buf(), e))?;
            let mut f = fs::File::open(entry.path()).map_err(|e| PublishError::Io(entry.path().to_path_buf(), e))?;
            io::copy(&mut f, &mut writer).map_err(|e| PublishError::Io(entry.path().to_path_buf(), e))?;
        }
    }
    writer
        .finish()
        .map_err(|e| PublishError::Zip(dest.to_path_buf(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depsland_blobstore::FakeBlobStore;
    use depsland_manifest::{init_manifest, AssetInfo};
    use depsland_paths::DepslandPaths;

    fn manifest_root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn file_asset(root: &Path, relpath: &str, content: &[u8]) -> AssetInfo {
        let path = root.join(relpath);
        fs::write(&path, content).unwrap();
        let hash = depsland_content::hash_bytes(content);
        AssetInfo {
            kind: AssetKind::File,
            scheme: Scheme::All,
            updated_time: 0,
            hash: Some(hash.clone()),
            uid: hash,
        }
    }

    #[test]
    fn first_publish_uploads_assets_before_manifest() {
        let root = manifest_root();
        let mut new = init_manifest("hello_app", "Hello App");
        new.version = "1.0.0".into();
        new.start_directory = root.path().to_path_buf();
        new.assets.insert(
            "main.py".to_string(),
            file_asset(root.path(), "main.py", b"print(1)"),
        );

        let old = init_manifest("hello_app", "Hello App");
        let blobs = FakeBlobStore::new().unwrap();
        let registry = AppRegistry::new(DepslandPaths::new(tempfile::tempdir().unwrap().path()));

        publish(&new, &old, &blobs, Path::new("/nonexistent"), &registry).unwrap();

        let uid = &new.assets["main.py"].uid;
        assert!(blobs.exists(&asset_key("hello_app", uid)).unwrap());
        assert!(blobs.exists(&manifest_key("hello_app")).unwrap());
        assert_eq!(
            registry.last_distributed_version("hello_app").unwrap(),
            Some("1.0.0".to_string())
        );
    }

    #[test]
    fn downgrade_is_rejected() {
        let root = manifest_root();
        let mut new = init_manifest("hello_app", "Hello App");
        new.version = "0.5.0".into();
        new.start_directory = root.path().to_path_buf();

        let mut old = init_manifest("hello_app", "Hello App");
        old.version = "1.0.0".into();

        let blobs = FakeBlobStore::new().unwrap();
        let registry = AppRegistry::new(DepslandPaths::new(tempfile::tempdir().unwrap().path()));
        let err = publish(&new, &old, &blobs, Path::new("/nonexistent"), &registry).unwrap_err();
        assert!(matches!(err, PublishError::VersionNotIncreasing(_, _)));
    }

    #[test]
    fn no_op_republish_uploads_only_manifest() {
        let root = manifest_root();
        let asset = file_asset(root.path(), "main.py", b"print(1)");

        let mut old = init_manifest("hello_app", "Hello App");
        old.version = "1.0.0".into();
        old.assets.insert("main.py".to_string(), asset.clone());

        let mut new = old.clone();
        new.version = "1.0.1".into();
        new.start_directory = root.path().to_path_buf();

        let blobs = FakeBlobStore::new().unwrap();
        blobs
            .upload(&root.path().join("main.py"), &asset_key("hello_app", &asset.uid))
            .unwrap();
        let registry = AppRegistry::new(DepslandPaths::new(tempfile::tempdir().unwrap().path()));

        publish(&new, &old, &blobs, Path::new("/nonexistent"), &registry).unwrap();
        assert!(blobs.exists(&manifest_key("hello_app")).unwrap());
        assert!(blobs.exists(&asset_key("hello_app", &asset.uid)).unwrap());
    }
}
