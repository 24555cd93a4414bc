use std::io;
use std::path::Path;

use gphotos_core::ContentHash;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("hashing cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashProgress {
    pub hashed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDigest {
    pub hash: ContentHash,
    pub size: u64,
}

/// Streams `path` through SHA-1 one chunk at a time. Cancellation is checked
/// between chunks.
pub async fn hash_file<F>(
    path: &Path,
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<FileDigest, HashError>
where
    F: FnMut(HashProgress),
{
    let mut file = tokio::fs::File::open(path).await?;
    let total = file.metadata().await?.len();
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut hashed = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(HashError::Cancelled);
        }
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        hashed += read as u64;
        progress(HashProgress { hashed, total });
    }

    let digest: [u8; gphotos_core::SHA1_LEN] = hasher.finalize().into();
    Ok(FileDigest {
        hash: ContentHash::from_bytes(digest),
        size: hashed,
    })
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_bytes(Sha1::digest(data).into())
}
