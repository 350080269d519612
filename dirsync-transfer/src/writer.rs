//! Applies received changes under the serve root.
//!
//! ## Receiving a body
//!
//! 1. Check the filename is a plain name (no separators, not `.`/`..`).
//! 2. Stream exactly `size` bytes into `.dirsync-<pid>-<n>.part` in the root.
//! 3. Flush and rename onto the final name (atomic on POSIX).
//!
//! The part file is removed on every failure path, including the session
//! task being dropped mid-transfer, so a short transfer never leaves a
//! file that looks complete. When the disk write fails the rest of the body
//! is still read off the socket so the session stays framed.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{io_err, stream_err, TransferError};
use crate::protocol::CHUNK_SIZE;

static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Filename safety
// ---------------------------------------------------------------------------

/// Accept only a single normal path component.
pub fn validate_name(name: &str) -> Result<(), TransferError> {
    let unsafe_name = || TransferError::UnsafeName(name.to_string());
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(unsafe_name());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(unsafe_name()),
    }
}

// ---------------------------------------------------------------------------
// Part file guard
// ---------------------------------------------------------------------------

/// Removes the part file on drop unless it was renamed into place.
struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    fn new(root: &Path) -> Self {
        let n = PART_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            path: root.join(format!(".dirsync-{}-{n}.part", std::process::id())),
            armed: true,
        }
    }

    async fn commit(mut self, target: &Path) -> Result<(), TransferError> {
        tokio::fs::rename(&self.path, target)
            .await
            .map_err(|e| io_err(target, e))?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// ServeRoot
// ---------------------------------------------------------------------------

/// The directory the transfer server writes into.
#[derive(Debug, Clone)]
pub struct ServeRoot {
    root: PathBuf,
}

impl ServeRoot {
    /// Create the directory if needed and resolve it.
    pub fn open(root: &Path) -> Result<Self, TransferError> {
        std::fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        let root = std::fs::canonicalize(root).map_err(|e| io_err(root, e))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, TransferError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Receive a Create/Modify body of exactly `size` bytes from `body` and
    /// store it as `name`. Returns the stored path.
    pub async fn receive<R>(&self, name: &str, size: u64, body: &mut R) -> Result<PathBuf, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let target = match self.resolve(name) {
            Ok(target) => target,
            Err(err) => {
                drain(body, size).await?;
                return Err(err);
            }
        };

        let part = PartFile::new(&self.root);
        let mut file = match tokio::fs::File::create(&part.path).await {
            Ok(file) => Some(file),
            Err(err) => {
                drain(body, size).await?;
                return Err(io_err(&part.path, err));
            }
        };

        let mut write_error: Option<TransferError> = None;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        while received < size {
            let want = (size - received).min(CHUNK_SIZE as u64) as usize;
            let n = body.read(&mut buf[..want]).await.map_err(stream_err)?;
            if n == 0 {
                return Err(TransferError::ShortTransfer {
                    expected: size,
                    received,
                });
            }
            received += n as u64;

            if let Some(out) = file.as_mut() {
                if let Err(err) = out.write_all(&buf[..n]).await {
                    write_error = Some(io_err(&part.path, err));
                    file = None;
                }
            }
        }

        if let Some(err) = write_error {
            return Err(err);
        }
        if let Some(mut out) = file {
            out.flush().await.map_err(|e| io_err(&part.path, e))?;
            out.sync_all().await.map_err(|e| io_err(&part.path, e))?;
        }
        part.commit(&target).await?;
        tracing::debug!(path = %target.display(), bytes = size, "stored file");
        Ok(target)
    }

    /// Remove `name`. A missing file is an error.
    pub async fn remove(&self, name: &str) -> Result<PathBuf, TransferError> {
        let target = self.resolve(name)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| io_err(&target, e))?;
        tracing::debug!(path = %target.display(), "removed file");
        Ok(target)
    }
}

/// Discard exactly `size` body bytes.
async fn drain<R>(body: &mut R, size: u64) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut body.take(size), &mut tokio::io::sink())
        .await
        .map_err(stream_err)?;
    if copied < size {
        return Err(TransferError::ShortTransfer {
            expected: size,
            received: copied,
        });
    }
    Ok(())
}

/// True when `err` means the named file was not there.
pub fn is_not_found(err: &TransferError) -> bool {
    matches!(err, TransferError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
}
