//! Content fingerprinting and chunk manifests.
//!
//! A single streaming pass hashes the whole file and every chunk. Files up to
//! the threshold form one chunk; larger files are cut at fixed `chunk_size`
//! boundaries so unchanged regions keep their fingerprints across versions.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::state::{ChunkRef, Fingerprint};

const READ_BUF: usize = 64 * 1024;

/// How files are cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Files of at most this many bytes are a single chunk.
    pub threshold: u64,
    pub chunk_size: u32,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            threshold: 8 * 1024 * 1024,
            chunk_size: 4 * 1024 * 1024,
        }
    }
}

impl ChunkPolicy {
    /// Chunk length used for a file of `size` bytes.
    fn chunk_len(&self, size: u64) -> u64 {
        if size <= self.threshold {
            size.max(1)
        } else {
            u64::from(self.chunk_size.max(1))
        }
    }
}

/// Result of scanning a file's content.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentScan {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub manifest: Vec<ChunkRef>,
}

/// Hash `path` and build its manifest in one pass. Blocking.
pub fn scan_file(path: &Path, policy: ChunkPolicy) -> io::Result<ContentScan> {
    let mut file = File::open(path)?;
    let expected = file.metadata()?.len();
    let chunk_len = policy.chunk_len(expected);

    let mut whole = Sha256::new();
    let mut current = Sha256::new();
    let mut current_start = 0u64;
    let mut current_len = 0u64;
    let mut manifest = Vec::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        whole.update(&buf[..n]);

        let mut data = &buf[..n];
        while !data.is_empty() {
            let room = (chunk_len - current_len) as usize;
            let take = room.min(data.len());
            current.update(&data[..take]);
            current_len += take as u64;
            data = &data[take..];
            if current_len == chunk_len {
                manifest.push(ChunkRef {
                    fingerprint: Fingerprint(std::mem::take(&mut current).finalize().into()),
                    offset: current_start,
                    length: current_len as u32,
                });
                current_start += current_len;
                current_len = 0;
            }
        }
        total += n as u64;
    }

    if current_len > 0 {
        manifest.push(ChunkRef {
            fingerprint: Fingerprint(current.finalize().into()),
            offset: current_start,
            length: current_len as u32,
        });
    }

    Ok(ContentScan {
        fingerprint: Fingerprint(whole.finalize().into()),
        size: total,
        manifest,
    })
}

/// Read one chunk back from its source file. Blocking.
///
/// Returns `UnexpectedEof` if the file shrank below the chunk's extent.
pub fn read_chunk(path: &Path, chunk: &ChunkRef) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(chunk.offset))?;
    let mut bytes = vec![0u8; chunk.length as usize];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_policy() -> ChunkPolicy {
        ChunkPolicy {
            threshold: 16,
            chunk_size: 8,
        }
    }

    #[test]
    fn test_small_file_is_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small");
        std::fs::write(&path, b"hello world").unwrap();

        let scan = scan_file(&path, small_policy()).unwrap();
        assert_eq!(scan.size, 11);
        assert_eq!(scan.fingerprint, Fingerprint::of(b"hello world"));
        assert_eq!(scan.manifest.len(), 1);
        assert_eq!(scan.manifest[0].fingerprint, scan.fingerprint);
        assert_eq!(scan.manifest[0].length, 11);
    }

    #[test]
    fn test_large_file_is_split_at_fixed_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large");
        let data: Vec<u8> = (0..20u8).collect();
        std::fs::write(&path, &data).unwrap();

        let scan = scan_file(&path, small_policy()).unwrap();
        assert_eq!(scan.fingerprint, Fingerprint::of(&data));
        let lengths: Vec<u32> = scan.manifest.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![8, 8, 4]);
        assert_eq!(scan.manifest[1].offset, 8);
        assert_eq!(scan.manifest[1].fingerprint, Fingerprint::of(&data[8..16]));
        assert_eq!(scan.manifest[2].fingerprint, Fingerprint::of(&data[16..]));
    }

    #[test]
    fn test_chunks_span_read_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let data: Vec<u8> = (0..(READ_BUF * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let policy = ChunkPolicy {
            threshold: 1024,
            chunk_size: 100_000,
        };

        let scan = scan_file(&path, policy).unwrap();
        let mut offset = 0usize;
        for chunk in &scan.manifest {
            let end = offset + chunk.length as usize;
            assert_eq!(chunk.offset as usize, offset);
            assert_eq!(chunk.fingerprint, Fingerprint::of(&data[offset..end]));
            offset = end;
        }
        assert_eq!(offset, data.len());
    }

    #[test]
    fn test_empty_file_has_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let scan = scan_file(&path, small_policy()).unwrap();
        assert_eq!(scan.size, 0);
        assert!(scan.manifest.is_empty());
        assert_eq!(scan.fingerprint, Fingerprint::of(b""));
    }

    #[test]
    fn test_read_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789abcdefghij").unwrap();
        let scan = scan_file(&path, small_policy()).unwrap();

        let second = read_chunk(&path, &scan.manifest[1]).unwrap();
        assert_eq!(second, b"89abcdef");

        std::fs::write(&path, b"short").unwrap();
        let err = read_chunk(&path, &scan.manifest[2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_missing_file() {
        let err = scan_file(Path::new("/definitely/not/here"), small_policy()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
