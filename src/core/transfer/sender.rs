//! Sender: file-info, flow-controlled chunks, completion marker.
//!
//! Chunks are read sequentially and queued on the channel until its
//! buffered amount would pass the high-water mark; the sender then parks
//! until the channel signals it drained to the low-water mark. Cancellation
//! is cooperative: the channel stays open and a `transfer-cancelled` marker
//! tells the peer to drop its partial buffer.

use super::{ControlMessage, FileInfo, DEFAULT_MIME_TYPE};
use crate::core::config::TransferLimits;
use crate::core::connection::DataChannel;
use crate::core::error::TransferError;
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

// ── Source ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Disk { path: PathBuf, size: u64 },
}

/// A file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub source: FileSource,
}

impl OutgoingFile {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            source: FileSource::Memory(data),
        }
    }

    /// Describe a file on disk. Only metadata is read here.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::ReadFailed(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(TransferError::ReadFailed(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            mime_type: guess_mime_type(&name).to_string(),
            name,
            source: FileSource::Disk {
                path: path.to_path_buf(),
                size: meta.len(),
            },
        })
    }

    pub fn size(&self) -> u64 {
        match &self.source {
            FileSource::Memory(data) => data.len() as u64,
            FileSource::Disk { size, .. } => *size,
        }
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            mime_type: if self.mime_type.is_empty() {
                DEFAULT_MIME_TYPE.to_string()
            } else {
                self.mime_type.clone()
            },
            size: self.size(),
        }
    }
}

/// Media type from the file extension; the receiver only uses it as a label.
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => DEFAULT_MIME_TYPE,
    }
}

enum ChunkReader {
    Memory { data: Bytes, offset: usize },
    Disk(tokio::fs::File),
}

impl ChunkReader {
    async fn open(source: &FileSource) -> Result<Self, TransferError> {
        match source {
            FileSource::Memory(data) => Ok(Self::Memory {
                data: data.clone(),
                offset: 0,
            }),
            FileSource::Disk { path, .. } => tokio::fs::File::open(path)
                .await
                .map(Self::Disk)
                .map_err(|e| TransferError::ReadFailed(format!("{}: {e}", path.display()))),
        }
    }

    async fn read(&mut self, len: usize) -> Result<Bytes, TransferError> {
        match self {
            Self::Memory { data, offset } => {
                let end = (*offset + len).min(data.len());
                let chunk = data.slice(*offset..end);
                *offset = end;
                Ok(chunk)
            }
            Self::Disk(file) => {
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| TransferError::ReadFailed(e.to_string()))?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

// ── Progress ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendProgress {
    pub sent: u64,
    pub total: u64,
    pub percent: u8,
}

/// Emits only when the whole-percent value changes.
#[derive(Debug)]
pub struct ProgressThrottle {
    total: u64,
    last: Option<u8>,
}

impl ProgressThrottle {
    pub fn new(total: u64) -> Self {
        Self { total, last: None }
    }

    pub fn update(&mut self, sent: u64) -> Option<SendProgress> {
        let percent = if self.total == 0 {
            100
        } else {
            (sent.saturating_mul(100) / self.total).min(100) as u8
        };
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(SendProgress {
            sent,
            total: self.total,
            percent,
        })
    }
}

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Park until `next_msg_size` more bytes fit under `high_water`.
///
/// A chunk is always allowed onto an empty queue, so an oversized chunk
/// cannot stall the transfer forever. The low-threshold signal only fires
/// when the buffer crosses `low_water` on the way down, so the sender only
/// parks on it from above that mark.
async fn wait_for_buffer_space(
    dc: &dyn DataChannel,
    next_msg_size: usize,
    high_water: usize,
    low_water: usize,
    sos: &SignalOfStop,
) -> Result<(), TransferError> {
    loop {
        if sos.cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !dc.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        let buffered = dc.buffered_amount().await;
        if buffered == 0 || buffered + next_msg_size <= high_water {
            return Ok(());
        }
        if buffered <= low_water {
            tokio::task::yield_now().await;
            continue;
        }
        debug!(
            event = "send_backpressure",
            channel = dc.label(),
            buffered,
            next_msg = next_msg_size,
            high_watermark = high_water,
            "Waiting for data channel to drain"
        );
        tokio::select! {
            _ = dc.wait_buffered_low() => {}
            _ = sos.wait() => return Err(TransferError::Cancelled),
        }
    }
}

// ── Send ─────────────────────────────────────────────────────────────────────

async fn send_control(dc: &dyn DataChannel, msg: &ControlMessage) -> Result<(), TransferError> {
    let text = msg
        .encode()
        .map_err(|e| TransferError::FinalizeFailed(e.to_string()))?;
    dc.send_text(&text)
        .await
        .map_err(|_| TransferError::ChannelClosed)
}

/// Tell the peer to drop its partial buffer. Best-effort.
async fn send_cancel_marker(dc: &dyn DataChannel) {
    if dc.is_open() {
        if let Err(e) = send_control(dc, &ControlMessage::TransferCancelled).await {
            warn!(event = "cancel_marker_failed", error = %e, "Could not send transfer-cancelled");
        }
    }
}

/// Send one file over `dc`. Returns the number of payload bytes sent.
///
/// On local cancellation, or any failure after `file-info` went out, a
/// `transfer-cancelled` marker is sent before returning the error.
pub async fn send_file<F>(
    dc: &dyn DataChannel,
    file: &OutgoingFile,
    limits: TransferLimits,
    sos: &SignalOfStop,
    mut on_progress: F,
) -> Result<u64, TransferError>
where
    F: FnMut(SendProgress) + Send,
{
    if !dc.is_open() {
        return Err(TransferError::ChannelNotOpen);
    }
    let total = file.size();
    if total > limits.max_file_size {
        return Err(TransferError::FileTooLarge {
            size: total,
            limit: limits.max_file_size,
        });
    }
    let mut reader = ChunkReader::open(&file.source).await?;
    let chunk_size = limits.chunk_size.max(1);

    dc.set_buffered_low_threshold(limits.low_water).await;
    send_control(
        dc,
        &ControlMessage::FileInfo {
            file_info: file.info(),
        },
    )
    .await?;
    info!(event = "send_started", name = %file.name, size = total, "Sending file");

    match send_chunks(dc, &mut reader, total, chunk_size, &limits, sos, &mut on_progress).await {
        Ok(()) => {}
        Err(e) => {
            send_cancel_marker(dc).await;
            warn!(event = "send_aborted", name = %file.name, error = %e, "File send stopped");
            return Err(e);
        }
    }

    send_control(dc, &ControlMessage::FileComplete).await?;
    info!(event = "send_complete", name = %file.name, size = total, "File sent");
    Ok(total)
}

async fn send_chunks<F>(
    dc: &dyn DataChannel,
    reader: &mut ChunkReader,
    total: u64,
    chunk_size: usize,
    limits: &TransferLimits,
    sos: &SignalOfStop,
    on_progress: &mut F,
) -> Result<(), TransferError>
where
    F: FnMut(SendProgress) + Send,
{
    let mut throttle = ProgressThrottle::new(total);
    let mut offset = 0u64;

    if total == 0 {
        if let Some(p) = throttle.update(0) {
            on_progress(p);
        }
        return Ok(());
    }

    while offset < total {
        let len = (chunk_size as u64).min(total - offset) as usize;
        let chunk = reader.read(len).await?;
        wait_for_buffer_space(dc, chunk.len(), limits.high_water, limits.low_water, sos).await?;
        dc.send_binary(chunk)
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        offset += len as u64;
        if let Some(p) = throttle.update(offset) {
            on_progress(p);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::{MemoryChannelTap, MemoryDataChannel};
    use crate::core::connection::ChannelFrame;
    use crate::core::transfer::DataFrame;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    async fn collect(tap: &mut MemoryChannelTap) -> Vec<DataFrame> {
        let mut frames = Vec::new();
        while let Some(f) = tap.try_next() {
            frames.push(DataFrame::decode(f).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_frames_in_order() {
        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        let file = OutgoingFile::from_bytes("a.bin", "", pattern(40 * 1024));
        let sos = SignalOfStop::new();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = progress.clone();

        let sent = send_file(dc.as_ref(), &file, TransferLimits::default(), &sos, move |sp| {
            p.lock().unwrap().push(sp.percent)
        })
        .await
        .unwrap();
        assert_eq!(sent, 40960);

        let frames = collect(&mut tap).await;
        assert_eq!(frames.len(), 5);
        match &frames[0] {
            DataFrame::Control(ControlMessage::FileInfo { file_info }) => {
                assert_eq!(file_info.size, 40960);
                assert_eq!(file_info.mime_type, DEFAULT_MIME_TYPE);
            }
            other => panic!("unexpected {other:?}"),
        }
        let sizes: Vec<usize> = frames[1..4]
            .iter()
            .map(|f| match f {
                DataFrame::Chunk(b) => b.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![16384, 16384, 8192]);
        assert_eq!(frames[4], DataFrame::Control(ControlMessage::FileComplete));
        assert_eq!(*progress.lock().unwrap(), vec![40, 80, 100]);
    }

    #[tokio::test]
    async fn test_buffered_never_exceeds_high_water() {
        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        let limits = TransferLimits {
            chunk_size: 1000,
            high_water: 4000,
            low_water: 2000,
            max_file_size: 1 << 20,
        };
        let data = pattern(50_000);
        let file = OutgoingFile::from_bytes("b.bin", "application/x-test", data.clone());
        let sos = SignalOfStop::new();

        let sender_dc = dc.clone();
        let task = tokio::spawn(async move {
            send_file(sender_dc.as_ref(), &file, limits, &sos, |_| {}).await
        });

        let mut received = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), tap.next())
                .await
                .unwrap()
                .unwrap();
            match DataFrame::decode(frame).unwrap() {
                DataFrame::Chunk(b) => received.extend_from_slice(&b),
                DataFrame::Control(ControlMessage::FileComplete) => break,
                DataFrame::Control(_) => {}
            }
            // The file-info text frame is queued outside the chunk budget.
            assert!(dc.buffered_amount().await <= limits.high_water + 200);
            tokio::task::yield_now().await;
        }

        assert_eq!(task.await.unwrap().unwrap(), 50_000);
        assert_eq!(Bytes::from(received), data);
        assert!(dc.peak_buffered() <= limits.high_water + 200);
    }

    #[tokio::test]
    async fn test_chunk_wider_than_watermark_gap_still_drains() {
        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        // One chunk already puts the buffer past the low mark, so the
        // low-threshold signal never fires on the way down.
        let limits = TransferLimits {
            chunk_size: 2500,
            high_water: 4000,
            low_water: 3000,
            max_file_size: 1 << 20,
        };
        let file = OutgoingFile::from_bytes("w.bin", "", pattern(10_000));
        let sos = SignalOfStop::new();

        let sender_dc = dc.clone();
        let task = tokio::spawn(async move {
            send_file(sender_dc.as_ref(), &file, limits, &sos, |_| {}).await
        });

        let mut chunks = 0;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(3), tap.next())
                .await
                .expect("sender stalled")
                .unwrap();
            match DataFrame::decode(frame).unwrap() {
                DataFrame::Chunk(_) => chunks += 1,
                DataFrame::Control(ControlMessage::FileComplete) => break,
                DataFrame::Control(_) => {}
            }
        }
        assert_eq!(chunks, 4);
        let sent = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_cancel_sends_marker_and_keeps_channel() {
        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        let limits = TransferLimits {
            chunk_size: 100,
            high_water: 300,
            low_water: 100,
            max_file_size: 1 << 20,
        };
        let file = OutgoingFile::from_bytes("c.bin", "", pattern(10_000));
        let sos = SignalOfStop::new();

        let sender_dc = dc.clone();
        let sender_sos = sos.clone();
        let task = tokio::spawn(async move {
            send_file(sender_dc.as_ref(), &file, limits, &sender_sos, |_| {}).await
        });

        // Nobody drains, so the sender parks on backpressure.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sos.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TransferError::Cancelled)));

        let frames = collect(&mut tap).await;
        assert_eq!(
            frames.last(),
            Some(&DataFrame::Control(ControlMessage::TransferCancelled))
        );
        assert!(dc.is_open());
    }

    #[tokio::test]
    async fn test_closed_channel_and_size_limit() {
        let (dc, _tap) = MemoryDataChannel::loopback("t");
        let sos = SignalOfStop::new();
        let limits = TransferLimits {
            max_file_size: 10,
            ..TransferLimits::default()
        };
        let big = OutgoingFile::from_bytes("d", "", pattern(11));
        assert!(matches!(
            send_file(dc.as_ref(), &big, limits, &sos, |_| {}).await,
            Err(TransferError::FileTooLarge { size: 11, limit: 10 })
        ));

        dc.close().await.unwrap();
        let small = OutgoingFile::from_bytes("e", "", pattern(5));
        assert!(matches!(
            send_file(dc.as_ref(), &small, TransferLimits::default(), &sos, |_| {}).await,
            Err(TransferError::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_missing_disk_file_fails_before_file_info() {
        let dir = std::env::temp_dir().join("peerlink_test_sender");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(format!("{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let file = OutgoingFile::from_path(&path).await.unwrap();
        assert_eq!(file.size(), 11);
        assert_eq!(file.mime_type, "text/plain");
        tokio::fs::remove_file(&path).await.unwrap();

        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        let res = send_file(dc.as_ref(), &file, TransferLimits::default(), &SignalOfStop::new(), |_| {}).await;
        assert!(matches!(res, Err(TransferError::ReadFailed(_))));
        assert!(tap.try_next().is_none());
    }

    #[tokio::test]
    async fn test_disk_file_round_trip() {
        let dir = std::env::temp_dir().join("peerlink_test_sender");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(format!("{}.bin", uuid::Uuid::new_v4()));
        let data = pattern(3000);
        tokio::fs::write(&path, &data).await.unwrap();

        let file = OutgoingFile::from_path(&path).await.unwrap();
        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        let limits = TransferLimits {
            chunk_size: 1024,
            ..TransferLimits::default()
        };
        send_file(dc.as_ref(), &file, limits, &SignalOfStop::new(), |_| {})
            .await
            .unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        let mut out = Vec::new();
        while let Some(frame) = tap.try_next() {
            if let ChannelFrame::Binary(b) = frame {
                out.extend_from_slice(&b);
            }
        }
        assert_eq!(Bytes::from(out), data);
    }

    #[test]
    fn test_progress_throttle() {
        let mut t = ProgressThrottle::new(1000);
        assert_eq!(t.update(1).map(|p| p.percent), Some(0));
        assert!(t.update(5).is_none());
        assert_eq!(t.update(10).map(|p| p.percent), Some(1));
        assert_eq!(t.update(1000).map(|p| p.percent), Some(100));
        assert!(t.update(1000).is_none());

        let mut empty = ProgressThrottle::new(0);
        assert_eq!(empty.update(0).map(|p| p.percent), Some(100));
    }
}
