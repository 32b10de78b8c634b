// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-blobstore
//!
//! A [`BlobStore`] is the one place the publisher and installer touch the
//! outside world: a flat key space (`apps/<appid>/manifest.pkl`,
//! `apps/<appid>/assets/<uid>`, `apps/<appid>/pypi/<package_id>`) backed by
//! either a local directory, a throwaway temp directory (tests), or a
//! remote HTTP endpoint.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Errors raised by any [`BlobStore`] implementation.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// A local filesystem operation failed.
    #[error("I/O error on blob {0:?}: {1}")]
    Io(String, io::Error),
    /// The requested key has no blob.
    #[error("no such blob: {0}")]
    NotFound(String),
    /// The remote backend's HTTP call failed.
    #[error("transport error for {0}: {1}")]
    Transport(String, reqwest::Error),
    /// The remote backend returned a non-success status.
    #[error("unexpected status {1} for {0}")]
    UnexpectedStatus(String, reqwest::StatusCode),
    /// The configured base URL could not be parsed.
    #[error("invalid base url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A content-addressed object store keyed by the flat layout described at
/// the module level. Implementations overwrite on `upload` and must treat
/// a missing key on `download`/`delete` as [`BlobStoreError::NotFound`].
pub trait BlobStore: Send + Sync {
    /// Upload the local file at `local` to `key`, overwriting any existing blob.
    fn upload(&self, local: &Path, key: &str) -> Result<(), BlobStoreError>;
    /// Fetch the blob at `key` into the local file `local`.
    fn download(&self, key: &str, local: &Path) -> Result<(), BlobStoreError>;
    /// Remove the blob at `key`.
    fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
    /// Whether a blob exists at `key`, without fetching it.
    fn exists(&self, key: &str) -> Result<bool, BlobStoreError>;
}

/// Build the canonical key for an app's release manifest.
pub fn manifest_key(appid: &str) -> String {
    format!("apps/{appid}/manifest.pkl")
}

/// Build the canonical key for an asset blob, addressed by its uid.
pub fn asset_key(appid: &str, uid: &str) -> String {
    format!("apps/{appid}/assets/{uid}")
}

/// Build the canonical key for a pinned package archive.
pub fn package_key(appid: &str, package_id: &str) -> String {
    format!("apps/{appid}/pypi/{package_id}")
}

/// A [`BlobStore`] backed by a directory on the local filesystem, mirroring
/// the remote key layout one-to-one below `root`.
///
/// `symlink` toggles an experimental mode, carried over from the original
/// implementation, where `upload`/`download` link instead of copy when the
/// source and destination are both on the local store; this only makes
/// sense when the "remote" and the install target share a filesystem.
pub struct LocalBlobStore {
    root: PathBuf,
    symlink: bool,
}

impl LocalBlobStore {
    /// Root the store at `root`, creating it if missing.
    pub fn new(root: impl Into<PathBuf>, symlink: bool) -> Result<Self, BlobStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root, symlink })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl BlobStore for LocalBlobStore {
    fn upload(&self, local: &Path, key: &str) -> Result<(), BlobStoreError> {
        let dest = self.blob_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        link_or_copy(local, &dest, self.symlink)?;
        tracing::debug!(key, "blob uploaded");
        Ok(())
    }

    fn download(&self, key: &str, local: &Path) -> Result<(), BlobStoreError> {
        let src = self.blob_path(key);
        if !src.exists() {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        link_or_copy(&src, local, self.symlink)?;
        tracing::debug!(key, "blob downloaded");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.blob_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(io_err(&path, e)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.blob_path(key).exists())
    }
}

fn link_or_copy(src: &Path, dest: &Path, symlink: bool) -> Result<(), BlobStoreError> {
    if dest.exists() {
        fs::remove_file(dest).map_err(|e| io_err(dest, e))?;
    }
    if symlink {
        if same_file(src, dest) {
            return Ok(());
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(src, dest).map_err(|e| io_err(dest, e))?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(src, dest).map_err(|e| io_err(dest, e))?;
        #[cfg(not(any(unix, windows)))]
        fs::copy(src, dest).map_err(|e| io_err(dest, e))?;
    } else {
        fs::copy(src, dest).map_err(|e| io_err(dest, e))?;
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn io_err(path: &Path, e: io::Error) -> BlobStoreError {
    BlobStoreError::Io(path.display().to_string(), e)
}

/// A [`LocalBlobStore`] rooted in a temp directory it owns, for tests.
pub struct FakeBlobStore {
    inner: LocalBlobStore,
    _dir: tempfile::TempDir,
}

impl FakeBlobStore {
    /// Create a fresh, empty fake store.
    pub fn new() -> Result<Self, BlobStoreError> {
        let dir = tempfile::tempdir().map_err(|e| io_err(Path::new("<tempdir>"), e))?;
        let inner = LocalBlobStore::new(dir.path(), false)?;
        Ok(Self { inner, _dir: dir })
    }
}

impl BlobStore for FakeBlobStore {
    fn upload(&self, local: &Path, key: &str) -> Result<(), BlobStoreError> {
        self.inner.upload(local, key)
    }

    fn download(&self, key: &str, local: &Path) -> Result<(), BlobStoreError> {
        self.inner.download(key, local)
    }

    fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        self.inner.exists(key)
    }
}

/// A [`BlobStore`] backed by a remote HTTP endpoint: `PUT`/`GET`/`DELETE`
/// against `{base_url}/{key}`. Deliberately minimal: no retries, no
/// multipart, a single optional bearer token. The real remote protocol
/// (signed URLs, multi-part uploads, CDN invalidation) is out of scope.
pub struct RemoteBlobStore {
    base_url: url::Url,
    client: reqwest::blocking::Client,
    bearer_token: Option<String>,
}

impl RemoteBlobStore {
    /// Point the store at `base_url`, optionally authenticating with a
    /// bearer token on every request.
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Result<Self, BlobStoreError> {
        Ok(Self {
            base_url: url::Url::parse(base_url)?,
            client: reqwest::blocking::Client::new(),
            bearer_token,
        })
    }

    fn url_for(&self, key: &str) -> Result<url::Url, BlobStoreError> {
        self.base_url.join(key).map_err(BlobStoreError::from)
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl BlobStore for RemoteBlobStore {
    fn upload(&self, local: &Path, key: &str) -> Result<(), BlobStoreError> {
        let bytes = fs::read(local).map_err(|e| io_err(local, e))?;
        let url = self.url_for(key)?;
        let resp = self
            .authed(self.client.put(url))
            .body(bytes)
            .send()
            .map_err(|e| BlobStoreError::Transport(key.to_string(), e))?;
        if !resp.status().is_success() {
            return Err(BlobStoreError::UnexpectedStatus(key.to_string(), resp.status()));
        }
        tracing::debug!(key, "blob uploaded to remote");
        Ok(())
    }

    fn download(&self, key: &str, local: &Path) -> Result<(), BlobStoreError> {
        let url = self.url_for(key)?;
        let resp = self
            .authed(self.client.get(url))
            .send()
            .map_err(|e| BlobStoreError::Transport(key.to_string(), e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BlobStoreError::UnexpectedStatus(key.to_string(), resp.status()));
        }
        let bytes = resp
            .bytes()
            .map_err(|e| BlobStoreError::Transport(key.to_string(), e))?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::write(local, bytes).map_err(|e| io_err(local, e))?;
        tracing::debug!(key, "blob downloaded from remote");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let url = self.url_for(key)?;
        let resp = self
            .authed(self.client.delete(url))
            .send()
            .map_err(|e| BlobStoreError::Transport(key.to_string(), e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BlobStoreError::UnexpectedStatus(key.to_string(), resp.status()));
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        let url = self.url_for(key)?;
        let resp = self
            .authed(self.client.head(url))
            .send()
            .map_err(|e| BlobStoreError::Transport(key.to_string(), e))?;
        Ok(resp.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn key_layout_matches_spec() {
        assert_eq!(manifest_key("hello_app"), "apps/hello_app/manifest.pkl");
        assert_eq!(asset_key("hello_app", "abc123"), "apps/hello_app/assets/abc123");
        assert_eq!(package_key("hello_app", "requests-2.31.0"), "apps/hello_app/pypi/requests-2.31.0");
    }

    #[test]
    fn local_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), false).unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("payload.bin");
        fs::write(&src, b"hello world").unwrap();

        store.upload(&src, "apps/demo/assets/abc").unwrap();
        assert!(store.exists("apps/demo/assets/abc").unwrap());

        let dest = src_dir.path().join("out.bin");
        store.download("apps/demo/assets/abc", &dest).unwrap();
        let mut got = Vec::new();
        fs::File::open(&dest).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, b"hello world");

        store.delete("apps/demo/assets/abc").unwrap();
        assert!(!store.exists("apps/demo/assets/abc").unwrap());
    }

    #[test]
    fn local_store_download_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), false).unwrap();
        let err = store
            .download("apps/demo/assets/missing", Path::new("/tmp/doesnt-matter"))
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[test]
    fn fake_store_is_isolated() {
        let a = FakeBlobStore::new().unwrap();
        let b = FakeBlobStore::new().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("f.bin");
        fs::write(&src, b"x").unwrap();
        a.upload(&src, "apps/demo/assets/x").unwrap();
        assert!(a.exists("apps/demo/assets/x").unwrap());
        assert!(!b.exists("apps/demo/assets/x").unwrap());
    }

    #[test]
    fn remote_store_round_trips_against_mock_server() {
        use std::sync::{Arc, Mutex};

        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr();
        let blob: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));

        let server_handle = {
            let server = Arc::clone(&server);
            let blob = Arc::clone(&blob);
            std::thread::spawn(move || {
                for _ in 0..2 {
                    let mut request = match server.recv_timeout(std::time::Duration::from_secs(5)) {
                        Ok(Some(r)) => r,
                        _ => break,
                    };
                    match request.method() {
                        tiny_http::Method::Put => {
                            let mut body = Vec::new();
                            request.as_reader().read_to_end(&mut body).unwrap();
                            *blob.lock().unwrap() = Some(body);
                            request
                                .respond(tiny_http::Response::empty(200))
                                .unwrap();
                        }
                        tiny_http::Method::Get => {
                            let body = blob.lock().unwrap().clone().unwrap_or_default();
                            request
                                .respond(tiny_http::Response::from_data(body))
                                .unwrap();
                        }
                        _ => {
                            request
                                .respond(tiny_http::Response::empty(404))
                                .unwrap();
                        }
                    }
                }
            })
        };

        let base_url = format!("http://127.0.0.1:{}/", addr.port());
        let store = RemoteBlobStore::new(&base_url, None).unwrap();

        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("f.bin");
        fs::write(&src, b"remote payload").unwrap();
        store.upload(&src, "apps/demo/assets/remote").unwrap();

        let dest = src_dir.path().join("out.bin");
        store.download("apps/demo/assets/remote", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"remote payload");

        server_handle.join().unwrap();
    }
}
