//! Local cache of downloaded chunks.
//!
//! Entries are stored sealed, exactly as the backend returned them, under
//! `<dir>/<first two hex chars>/<fingerprint>`. Reads are lock-free; a
//! download and its cache write happen under the chunk's lock so one chunk
//! is never fetched twice at the same time.

use std::io;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::locks::{KeyGuard, KeyedLocks};
use crate::state::Fingerprint;

#[derive(Debug)]
pub struct ChunkCache {
    dir: PathBuf,
    locks: KeyedLocks<Fingerprint>,
}

impl ChunkCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: KeyedLocks::new(),
        }
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.dir.join(&hex[..2]).join(hex)
    }

    pub async fn lock(&self, fingerprint: &Fingerprint) -> KeyGuard {
        self.locks.lock(fingerprint).await
    }

    /// Cached sealed bytes, if present.
    pub async fn read(&self, fingerprint: &Fingerprint) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.entry_path(fingerprint)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store sealed bytes. Caller holds the chunk's lock.
    pub async fn write(&self, fingerprint: &Fingerprint, sealed: &[u8]) -> io::Result<()> {
        let path = self.entry_path(fingerprint);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(sealed).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, &path).await
    }

    pub async fn evict(&self, fingerprint: &Fingerprint) -> io::Result<()> {
        match fs::remove_file(self.entry_path(fingerprint)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
