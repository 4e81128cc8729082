//! Resumable blob download.
//!
//! One stream per blob; bytes are buffered in memory and flushed to the
//! object store in large appends, with the per-hash progress record updated
//! after every flush. A dropped connection leaves the progress advanced so
//! the next tick resumes from where it stopped.

use tokio::io::AsyncReadExt;

use super::{SyncClient, SyncError, SyncState};
use crate::crypto::Hash32;
use crate::db;
use crate::objects::ObjectStoreError;

/// In-memory buffer between the network stream and disk.
const DOWNLOAD_BUFFER_SIZE: usize = 20 * 1024 * 1024;

/// A blob that still needs fetching: content hash plus ciphertext size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Download {
    pub value_hash: Hash32,
    pub size: u64,
}

/// Fetch the missing range of a blob from a peer.
///
/// Progress equal to the size means the blob is complete. On a short read
/// the progress stays advanced and the error is a warning for the caller;
/// on a hash mismatch after completion the blob is deleted and progress
/// reset to zero.
pub async fn download_file(
    state: &SyncState,
    client: &dyn SyncClient,
    download: Download,
) -> Result<(), SyncError> {
    let Download { value_hash, size } = download;

    let mut progress = state.db.download_progress(&value_hash).await?;
    if progress >= size {
        return Ok(());
    }

    // Reconcile the progress record with what is actually on disk. An
    // interrupted flush can leave the file ahead of or behind the record;
    // the file is truncated to the smaller of the two so appends line up.
    let on_disk = if state.objects.exists(&value_hash) {
        state.objects.len(&value_hash)?
    } else {
        0
    };
    if on_disk != progress {
        let resume_from = on_disk.min(progress);
        state.objects.truncate(&value_hash, resume_from)?;
        db::data::set_download_progress(state.db.pool(), &value_hash, resume_from).await?;
        progress = resume_from;
    }
    if progress >= size {
        return finalize(state, &value_hash).await;
    }

    let requested = size - progress;
    tracing::info!(blob = %value_hash, offset = progress, length = requested, "downloading blob");

    let mut stream = client.fetch_file_data(&value_hash, progress, requested).await?;
    let buffer_size = DOWNLOAD_BUFFER_SIZE.min(requested as usize);
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut received = 0u64;

    'outer: loop {
        let mut filled = 0usize;
        while filled < buffer.len() {
            let n = stream.read(&mut buffer[filled..]).await?;
            if n == 0 {
                if filled > 0 {
                    flush(state, &value_hash, &buffer[..filled], &mut progress).await?;
                    received += filled as u64;
                }
                break 'outer;
            }
            filled += n;
        }
        if filled == buffer.len() {
            flush(state, &value_hash, &buffer[..filled], &mut progress).await?;
            received += filled as u64;
            if received >= requested {
                break;
            }
        }
    }

    if received != requested {
        return Err(SyncError::ShortRead {
            expected: requested,
            got: received,
        });
    }

    finalize(state, &value_hash).await
}

async fn flush(
    state: &SyncState,
    value_hash: &Hash32,
    bytes: &[u8],
    progress: &mut u64,
) -> Result<(), SyncError> {
    state.objects.append(value_hash, bytes)?;
    *progress += bytes.len() as u64;
    db::data::set_download_progress(state.db.pool(), value_hash, *progress).await?;
    Ok(())
}

async fn finalize(state: &SyncState, value_hash: &Hash32) -> Result<(), SyncError> {
    match state.objects.validate_or_remove(value_hash) {
        Ok(()) => {
            tracing::info!(blob = %value_hash, "blob download complete");
            Ok(())
        }
        Err(e @ ObjectStoreError::Invalid { .. }) => {
            db::data::set_download_progress(state.db.pool(), value_hash, 0).await?;
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
