//! Receiver: reassembles one file per session from ordered chunks.
//!
//! Chunks are appended as they arrive and merged into a single buffer on
//! `file-complete`. Anything that would produce a file of the wrong size is
//! an error, never a silent success.

use super::{FileInfo, DEFAULT_MIME_TYPE};
use crate::core::error::TransferError;
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scheme prefix for delivery URLs of reassembled files.
pub const OBJECT_URL_PREFIX: &str = "blob:peerlink/";

/// A fully reassembled file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
    /// Handle under which the embedder can expose `data`; revoked on the
    /// next delivery or on teardown.
    pub object_url: String,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveProgress {
    pub received: u64,
    pub total: u64,
    pub percent: u8,
}

#[derive(Debug)]
struct IncomingTransfer {
    info: FileInfo,
    chunks: Vec<Bytes>,
    received: u64,
    last_percent: Option<u8>,
}

/// `min(round(received / total * 100), 100)`; an empty file is complete.
pub fn receive_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (received as f64 / total as f64 * 100.0).round();
    pct.min(100.0) as u8
}

#[derive(Debug)]
pub struct FileReceiver {
    current: Option<IncomingTransfer>,
    max_file_size: u64,
}

impl FileReceiver {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            current: None,
            max_file_size,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn expected(&self) -> Option<&FileInfo> {
        self.current.as_ref().map(|t| &t.info)
    }

    pub fn received_bytes(&self) -> u64 {
        self.current.as_ref().map_or(0, |t| t.received)
    }

    /// Number of chunks currently held.
    pub fn buffered_chunks(&self) -> usize {
        self.current.as_ref().map_or(0, |t| t.chunks.len())
    }

    /// Drop any partial transfer.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Start tracking a new file. A transfer still in progress is discarded.
    pub fn on_file_info(&mut self, mut info: FileInfo) -> Result<&FileInfo, TransferError> {
        if let Some(prev) = self.current.take() {
            warn!(
                event = "receive_overwritten",
                previous = %prev.info.name,
                received = prev.received,
                "New file-info replaced an unfinished transfer"
            );
        }
        if info.size > self.max_file_size {
            return Err(TransferError::FileTooLarge {
                size: info.size,
                limit: self.max_file_size,
            });
        }
        if info.mime_type.is_empty() {
            info.mime_type = DEFAULT_MIME_TYPE.to_string();
        }
        info!(event = "receive_started", name = %info.name, size = info.size, "Receiving file");
        let transfer = self.current.insert(IncomingTransfer {
            info,
            chunks: Vec::new(),
            received: 0,
            last_percent: None,
        });
        Ok(&transfer.info)
    }

    /// Append a chunk. Returns progress when the whole-percent value moved.
    ///
    /// Chunks with no transfer in progress are stray and ignored.
    pub fn on_chunk(&mut self, chunk: Bytes) -> Result<Option<ReceiveProgress>, TransferError> {
        let Some(t) = self.current.as_mut() else {
            debug!(event = "stray_chunk", len = chunk.len(), "Chunk without file-info");
            return Ok(None);
        };

        let received = t.received + chunk.len() as u64;
        if received > t.info.size {
            let expected = t.info.size;
            self.current = None;
            return Err(TransferError::Overflow { received, expected });
        }
        t.received = received;
        t.chunks.push(chunk);

        let percent = receive_percent(received, t.info.size);
        if t.last_percent == Some(percent) {
            return Ok(None);
        }
        t.last_percent = Some(percent);
        Ok(Some(ReceiveProgress {
            received,
            total: t.info.size,
            percent,
        }))
    }

    /// Merge the buffered chunks into the finished file.
    ///
    /// The transfer state is cleared whatever the outcome. `Ok(None)` means
    /// there was nothing to complete.
    pub fn on_complete(&mut self) -> Result<Option<ReceivedFile>, TransferError> {
        let Some(t) = self.current.take() else {
            debug!(event = "stray_complete", "file-complete without file-info");
            return Ok(None);
        };

        if t.received < t.info.size {
            return Err(TransferError::Truncated {
                received: t.received,
                expected: t.info.size,
            });
        }

        let expected = usize::try_from(t.info.size)
            .map_err(|_| TransferError::FinalizeFailed("file exceeds address space".into()))?;
        let mut merged: Vec<u8> = Vec::new();
        merged
            .try_reserve_exact(expected)
            .map_err(|e| TransferError::FinalizeFailed(e.to_string()))?;
        for chunk in &t.chunks {
            merged.extend_from_slice(chunk);
        }
        if merged.len() as u64 != t.info.size {
            return Err(TransferError::SizeMismatch {
                actual: merged.len() as u64,
                expected: t.info.size,
            });
        }

        let file = ReceivedFile {
            object_url: format!("{OBJECT_URL_PREFIX}{}", Uuid::new_v4()),
            name: t.info.name,
            mime_type: t.info.mime_type,
            data: Bytes::from(merged),
        };
        info!(event = "receive_complete", name = %file.name, size = file.size(), "File reassembled");
        Ok(Some(file))
    }

    /// Peer cancelled. Returns the abandoned transfer's metadata, if any.
    pub fn on_cancelled(&mut self) -> Option<FileInfo> {
        let t = self.current.take()?;
        info!(
            event = "receive_cancelled",
            name = %t.info.name,
            received = t.received,
            "Peer cancelled transfer"
        );
        Some(t.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MAX_FILE_SIZE;

    fn info(name: &str, size: u64) -> FileInfo {
        FileInfo {
            name: name.into(),
            mime_type: "text/plain".into(),
            size,
        }
    }

    fn chunk(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_progress_and_reconstruction() {
        let mut rx = FileReceiver::new(MAX_FILE_SIZE);
        rx.on_file_info(info("a.txt", 40960)).unwrap();

        let mut percents = Vec::new();
        for (len, fill) in [(16384, 1u8), (16384, 2), (8192, 3)] {
            if let Some(p) = rx.on_chunk(chunk(len, fill)).unwrap() {
                percents.push(p.percent);
            }
        }
        assert_eq!(percents, vec![40, 80, 100]);

        let file = rx.on_complete().unwrap().unwrap();
        assert_eq!(file.size(), 40960);
        assert_eq!(file.mime_type, "text/plain");
        assert!(file.object_url.starts_with(OBJECT_URL_PREFIX));
        assert_eq!(file.data[0], 1);
        assert_eq!(file.data[16384], 2);
        assert_eq!(file.data[40959], 3);
        assert!(!rx.is_active());
    }

    #[test]
    fn test_truncated_transfer_is_error() {
        let mut rx = FileReceiver::new(MAX_FILE_SIZE);
        rx.on_file_info(info("a", 300)).unwrap();
        rx.on_chunk(chunk(100, 0)).unwrap();
        let err = rx.on_complete().unwrap_err();
        assert!(matches!(err, TransferError::Truncated { received: 100, expected: 300 }));
        assert!(!rx.is_active());
        assert_eq!(rx.buffered_chunks(), 0);
    }

    #[test]
    fn test_overflow_resets() {
        let mut rx = FileReceiver::new(MAX_FILE_SIZE);
        rx.on_file_info(info("a", 10)).unwrap();
        rx.on_chunk(chunk(8, 0)).unwrap();
        assert!(matches!(
            rx.on_chunk(chunk(8, 0)),
            Err(TransferError::Overflow { received: 16, expected: 10 })
        ));
        assert!(!rx.is_active());
    }

    #[test]
    fn test_cancel_then_fresh_transfer() {
        let mut rx = FileReceiver::new(MAX_FILE_SIZE);
        rx.on_file_info(info("first", 300)).unwrap();
        rx.on_chunk(chunk(100, 0)).unwrap();
        assert_eq!(rx.on_cancelled().unwrap().name, "first");
        assert_eq!(rx.buffered_chunks(), 0);
        assert_eq!(rx.received_bytes(), 0);

        rx.on_file_info(info("second", 5)).unwrap();
        rx.on_chunk(chunk(5, 9)).unwrap();
        assert_eq!(rx.on_complete().unwrap().unwrap().name, "second");
    }

    #[test]
    fn test_new_file_info_discards_previous() {
        let mut rx = FileReceiver::new(MAX_FILE_SIZE);
        rx.on_file_info(info("old", 100)).unwrap();
        rx.on_chunk(chunk(50, 0)).unwrap();
        rx.on_file_info(info("new", 20)).unwrap();
        assert_eq!(rx.received_bytes(), 0);
        assert_eq!(rx.expected().unwrap().name, "new");
    }

    #[test]
    fn test_stray_frames_ignored() {
        let mut rx = FileReceiver::new(MAX_FILE_SIZE);
        assert_eq!(rx.on_chunk(chunk(3, 0)).unwrap(), None);
        assert!(rx.on_complete().unwrap().is_none());
        assert!(rx.on_cancelled().is_none());
    }

    #[test]
    fn test_size_limit_and_empty_file() {
        let mut rx = FileReceiver::new(100);
        assert!(matches!(
            rx.on_file_info(info("big", 101)),
            Err(TransferError::FileTooLarge { .. })
        ));
        assert!(!rx.is_active());

        let mut empty = info("empty", 0);
        empty.mime_type.clear();
        rx.on_file_info(empty).unwrap();
        let file = rx.on_complete().unwrap().unwrap();
        assert_eq!(file.size(), 0);
        assert_eq!(file.mime_type, DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(receive_percent(1, 3), 33);
        assert_eq!(receive_percent(2, 3), 67);
        assert_eq!(receive_percent(0, 0), 100);
        assert_eq!(receive_percent(5, 5), 100);
    }
}
