//! Transfer protocol engine.
//!
//! Two message shapes share the data channel: one JSON metadata message
//! per file, then raw binary frames of at most [`CHUNK_SIZE`] bytes. The
//! receive side is an explicit state machine ([`TransferReceiver`]) so
//! tests can drive it with synthetic frames and no transport.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, Mutex};
use tokio_util::bytes::Bytes;
use tracing::{info, warn};

use crate::error::Error;

/// Data frame payload ceiling. The final frame of a file may be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Files above this are rejected before a transfer starts, and metadata
/// declaring a larger size is rejected on receive.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Minimum spacing between progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Structured messages sent as text on the data channel. Binary payloads
/// are always raw file chunks; everything else is JSON tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileMetadata { name: String, size: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub file_name: String,
    pub bytes_moved: u64,
    pub total_bytes: u64,
    pub percentage: f32,
    /// MB/s over the elapsed transfer time.
    pub throughput_mbps: f64,
}

/// Completed inbound artifact: the reassembled bytes plus timing.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub data: Vec<u8>,
    pub elapsed_secs: f64,
    pub throughput_mbps: f64,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    SendStarted {
        file_name: String,
        total_bytes: u64,
    },
    SendProgress(TransferProgress),
    SendCompleted {
        file_name: String,
        total_bytes: u64,
        elapsed_secs: f64,
        throughput_mbps: f64,
    },
    ReceiveStarted {
        file_name: String,
        total_bytes: u64,
    },
    ReceiveProgress(TransferProgress),
    ReceiveCompleted(ReceivedFile),
    /// An in-flight transfer was aborted; partial state was discarded.
    TransferFailed {
        file_name: Option<String>,
        error: String,
    },
    /// A malformed or out-of-place message was discarded. The channel
    /// stays usable for a subsequent well-formed transfer.
    ProtocolViolation { reason: String },
}

/// Outbound half of the channel as the engine sees it. The engine never
/// owns the channel lifecycle; it only checks `is_open` between steps.
#[async_trait]
pub trait FrameSink: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<(), Error>;
    async fn send_frame(&self, frame: Bytes) -> Result<(), Error>;
}

/// A file handle for the sending path: name, total length, and a
/// slice-reader so only one chunk is ever in memory at a time.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn file_name(&self) -> &str;
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    async fn read_window(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error>;
}

/// Iterator over `(offset, len)` chunk windows covering `total` bytes.
/// Yields nothing for an empty file.
pub struct ChunkWindows {
    total: u64,
    chunk: usize,
    offset: u64,
}

impl ChunkWindows {
    pub fn new(total: u64, chunk: usize) -> Self {
        assert!(chunk > 0, "chunk size must be non-zero");
        Self {
            total,
            chunk,
            offset: 0,
        }
    }
}

impl Iterator for ChunkWindows {
    type Item = (u64, usize);

    fn next(&mut self) -> Option<(u64, usize)> {
        if self.offset >= self.total {
            return None;
        }
        let remaining = self.total - self.offset;
        let len = remaining.min(self.chunk as u64) as usize;
        let window = (self.offset, len);
        self.offset += len as u64;
        Some(window)
    }
}

/// Rate limiter for progress reports. The first call passes immediately;
/// later calls pass once [`PROGRESS_INTERVAL`] has elapsed. Completion
/// reports bypass it.
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn throughput_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / elapsed_secs
}

fn progress_of(name: &str, moved: u64, total: u64, started: Instant) -> TransferProgress {
    let elapsed = started.elapsed().as_secs_f64();
    TransferProgress {
        file_name: name.to_string(),
        bytes_moved: moved,
        total_bytes: total,
        percentage: if total == 0 {
            100.0
        } else {
            (moved as f64 / total as f64 * 100.0) as f32
        },
        throughput_mbps: throughput_mbps(moved, elapsed),
    }
}

/// Send one file over the channel: metadata first, then chunk frames.
///
/// Validation failures (size ceiling, channel not open) return before
/// anything is sent. Once streaming, failures are also emitted as
/// [`TransferEvent::TransferFailed`] since callers typically observe the
/// event stream rather than this future.
pub async fn send_file<S, C>(
    sink: &S,
    source: &C,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<(), Error>
where
    S: FrameSink + ?Sized,
    C: ChunkSource + ?Sized,
{
    let total = source.len();
    let name = source.file_name().to_string();
    if total > MAX_FILE_SIZE {
        return Err(Error::FileTooLarge {
            size: total,
            limit: MAX_FILE_SIZE,
        });
    }
    if !sink.is_open() {
        return Err(Error::Channel("data channel is not open".to_string()));
    }

    match stream_windows(sink, source, &name, total, events).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("send of {} failed: {}", name, e);
            let _ = events
                .send(TransferEvent::TransferFailed {
                    file_name: Some(name),
                    error: e.to_string(),
                })
                .await;
            Err(e)
        }
    }
}

async fn stream_windows<S, C>(
    sink: &S,
    source: &C,
    name: &str,
    total: u64,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<(), Error>
where
    S: FrameSink + ?Sized,
    C: ChunkSource + ?Sized,
{
    let metadata = ControlMessage::FileMetadata {
        name: name.to_string(),
        size: total,
    };
    sink.send_text(serde_json::to_string(&metadata)?).await?;
    let _ = events
        .send(TransferEvent::SendStarted {
            file_name: name.to_string(),
            total_bytes: total,
        })
        .await;
    info!("sending {} ({} bytes)", name, total);

    let started = Instant::now();
    let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);
    let mut sent: u64 = 0;

    for (offset, len) in ChunkWindows::new(total, CHUNK_SIZE) {
        if !sink.is_open() {
            return Err(Error::Channel(format!(
                "data channel closed at {} of {} bytes",
                sent, total
            )));
        }
        let window = source.read_window(offset, len).await?;
        sink.send_frame(Bytes::from(window)).await?;
        sent += len as u64;

        if sent < total && throttle.ready() {
            let _ = events
                .send(TransferEvent::SendProgress(progress_of(
                    name, sent, total, started,
                )))
                .await;
        }
        // One discrete step per window so close and error callbacks get
        // observed between chunks, never only at the end.
        tokio::task::yield_now().await;
    }

    let elapsed = started.elapsed().as_secs_f64();
    let mbps = throughput_mbps(total, elapsed);
    info!("sent {} ({} bytes, {:.2} MB/s)", name, total, mbps);
    let _ = events
        .send(TransferEvent::SendCompleted {
            file_name: name.to_string(),
            total_bytes: total,
            elapsed_secs: elapsed,
            throughput_mbps: mbps,
        })
        .await;
    Ok(())
}

struct ReceiveState {
    file_name: String,
    expected: u64,
    buffers: Vec<Bytes>,
    bytes_moved: u64,
    started: Instant,
    throttle: ProgressThrottle,
}

/// Per-channel receive state machine. At most one transfer is in flight;
/// a new metadata message supersedes an incomplete one.
pub struct TransferReceiver {
    state: Option<ReceiveState>,
    events: mpsc::Sender<TransferEvent>,
}

impl TransferReceiver {
    pub fn new(events: mpsc::Sender<TransferEvent>) -> Self {
        Self {
            state: None,
            events,
        }
    }

    /// A text message arrived on the channel: expected to be metadata.
    pub async fn handle_text(&mut self, text: &str) {
        let metadata = match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::FileMetadata { name, size }) => (name, size),
            Err(e) => {
                warn!("discarding malformed metadata message: {}", e);
                self.violation(format!("malformed metadata message: {}", e))
                    .await;
                return;
            }
        };
        let (name, size) = metadata;

        if size > MAX_FILE_SIZE {
            self.violation(format!(
                "declared size {} exceeds the {} byte transfer limit",
                size, MAX_FILE_SIZE
            ))
            .await;
            return;
        }

        if let Some(prev) = self.state.take() {
            warn!(
                "metadata for {} supersedes incomplete receive of {} ({} of {} bytes)",
                name, prev.file_name, prev.bytes_moved, prev.expected
            );
        }

        info!("receiving {} ({} bytes)", name, size);
        let _ = self
            .events
            .send(TransferEvent::ReceiveStarted {
                file_name: name.clone(),
                total_bytes: size,
            })
            .await;

        let started = Instant::now();
        if size == 0 {
            // Nothing further will arrive for an empty file.
            let _ = self
                .events
                .send(TransferEvent::ReceiveCompleted(ReceivedFile {
                    name,
                    data: Vec::new(),
                    elapsed_secs: 0.0,
                    throughput_mbps: 0.0,
                }))
                .await;
            return;
        }

        self.state = Some(ReceiveState {
            file_name: name,
            expected: size,
            buffers: Vec::new(),
            bytes_moved: 0,
            started,
            throttle: ProgressThrottle::new(PROGRESS_INTERVAL),
        });
    }

    /// A binary frame arrived on the channel.
    pub async fn handle_frame(&mut self, frame: Bytes) {
        let Some(mut state) = self.state.take() else {
            self.violation("data frame received with no preceding metadata".to_string())
                .await;
            return;
        };

        state.bytes_moved += frame.len() as u64;
        state.buffers.push(frame);

        if state.bytes_moved > state.expected {
            self.violation(format!(
                "received {} bytes but {} declared {}",
                state.bytes_moved, state.file_name, state.expected
            ))
            .await;
            return;
        }

        if state.bytes_moved == state.expected {
            let mut data = Vec::with_capacity(state.expected as usize);
            for buffer in &state.buffers {
                data.extend_from_slice(buffer);
            }
            let elapsed = state.started.elapsed().as_secs_f64();
            let mbps = throughput_mbps(state.expected, elapsed);
            info!(
                "received {} ({} bytes, {:.2} MB/s)",
                state.file_name, state.expected, mbps
            );
            let _ = self
                .events
                .send(TransferEvent::ReceiveCompleted(ReceivedFile {
                    name: state.file_name,
                    data,
                    elapsed_secs: elapsed,
                    throughput_mbps: mbps,
                }))
                .await;
            return;
        }

        if state.throttle.ready() {
            let progress = progress_of(
                &state.file_name,
                state.bytes_moved,
                state.expected,
                state.started,
            );
            let _ = self
                .events
                .send(TransferEvent::ReceiveProgress(progress))
                .await;
        }
        self.state = Some(state);
    }

    /// The channel closed or errored: abort any in-flight receive and
    /// discard its partial buffers.
    pub async fn handle_close(&mut self) {
        if let Some(state) = self.state.take() {
            warn!(
                "data channel closed mid-receive of {} ({} of {} bytes)",
                state.file_name, state.bytes_moved, state.expected
            );
            let _ = self
                .events
                .send(TransferEvent::TransferFailed {
                    file_name: Some(state.file_name),
                    error: format!(
                        "data channel closed at {} of {} bytes",
                        state.bytes_moved, state.expected
                    ),
                })
                .await;
        }
    }

    async fn violation(&mut self, reason: String) {
        warn!("protocol violation: {}", reason);
        let _ = self
            .events
            .send(TransferEvent::ProtocolViolation { reason })
            .await;
    }
}

/// [`ChunkSource`] over a file on disk. Reads one window at a time.
pub struct FileSource {
    name: String,
    len: u64,
    file: Mutex<fs::File>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        Ok(Self {
            name,
            len,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    async fn read_window(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut window = vec![0u8; len];
        file.read_exact(&mut window).await?;
        Ok(window)
    }
}

/// [`ChunkSource`] over an in-memory buffer.
pub struct MemorySource {
    name: String,
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_window(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("window {}+{} out of bounds", offset, len),
                )
            })?;
        Ok(self.data[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_count(total: u64, chunk: usize) -> usize {
        ChunkWindows::new(total, chunk).count()
    }

    #[test]
    fn chunk_windows_cover_exactly() {
        assert_eq!(window_count(0, 16384), 0);
        assert_eq!(window_count(1, 16384), 1);
        assert_eq!(window_count(16384, 16384), 1);
        assert_eq!(window_count(16385, 16384), 2);
        assert_eq!(window_count(40000, 16384), 3);

        let windows: Vec<_> = ChunkWindows::new(40000, 16384).collect();
        assert_eq!(windows, vec![(0, 16384), (16384, 16384), (32768, 7232)]);
    }

    #[test]
    fn chunk_windows_match_ceil_division() {
        for &chunk in &[1usize, 7, 1024, 16384] {
            for &size in &[0u64, 1, 100, 16384, 16385, 100_000] {
                let expected = (size as usize).div_ceil(chunk);
                assert_eq!(window_count(size, chunk), expected, "s={} c={}", size, chunk);
            }
        }
    }

    #[test]
    fn throttle_passes_first_then_spaces() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(500));
        assert!(throttle.ready());
        assert!(!throttle.ready());

        let mut immediate = ProgressThrottle::new(Duration::ZERO);
        assert!(immediate.ready());
        assert!(immediate.ready());
    }

    #[test]
    fn metadata_wire_format() {
        let msg = ControlMessage::FileMetadata {
            name: "photo.jpg".to_string(),
            size: 40000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "file-metadata");
        assert_eq!(value["name"], "photo.jpg");
        assert_eq!(value["size"], 40000);
    }

    #[tokio::test]
    async fn frame_without_metadata_is_a_violation() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut receiver = TransferReceiver::new(tx);
        receiver.handle_frame(Bytes::from_static(b"abc")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ProtocolViolation { .. }
        ));
    }

    #[tokio::test]
    async fn oversized_declared_size_is_rejected() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut receiver = TransferReceiver::new(tx);
        let metadata = format!(
            r#"{{"type":"file-metadata","name":"big.bin","size":{}}}"#,
            MAX_FILE_SIZE + 1
        );
        receiver.handle_text(&metadata).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ProtocolViolation { .. }
        ));
        // No receive context was created.
        receiver.handle_frame(Bytes::from_static(b"x")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ProtocolViolation { .. }
        ));
    }

    #[tokio::test]
    async fn zero_size_file_completes_on_metadata_alone() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut receiver = TransferReceiver::new(tx);
        receiver
            .handle_text(r#"{"type":"file-metadata","name":"empty.txt","size":0}"#)
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ReceiveStarted { .. }
        ));
        match rx.recv().await.unwrap() {
            TransferEvent::ReceiveCompleted(file) => {
                assert_eq!(file.name, "empty.txt");
                assert!(file.data.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn overshoot_resets_receive_state() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut receiver = TransferReceiver::new(tx);
        receiver
            .handle_text(r#"{"type":"file-metadata","name":"a.bin","size":2}"#)
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ReceiveStarted { .. }
        ));
        receiver.handle_frame(Bytes::from_static(b"abc")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ProtocolViolation { .. }
        ));
        // State was discarded; another frame has no context.
        receiver.handle_frame(Bytes::from_static(b"x")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::ProtocolViolation { .. }
        ));
    }

    #[tokio::test]
    async fn close_mid_receive_never_completes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut receiver = TransferReceiver::new(tx);
        receiver
            .handle_text(r#"{"type":"file-metadata","name":"a.bin","size":10}"#)
            .await;
        receiver.handle_frame(Bytes::from_static(b"12345")).await;
        receiver.handle_close().await;

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::ReceiveCompleted(_) => panic!("must not complete"),
                TransferEvent::TransferFailed { .. } => saw_failure = true,
                _ => {}
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn second_metadata_discards_prior_buffers() {
        let (tx, mut rx) = mpsc::channel(32);
        let mut receiver = TransferReceiver::new(tx);
        receiver
            .handle_text(r#"{"type":"file-metadata","name":"old.bin","size":10}"#)
            .await;
        receiver.handle_frame(Bytes::from_static(b"OLDDATA")).await;

        receiver
            .handle_text(r#"{"type":"file-metadata","name":"new.bin","size":4}"#)
            .await;
        receiver.handle_frame(Bytes::from_static(b"NEW!")).await;

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let TransferEvent::ReceiveCompleted(file) = event {
                completed = Some(file);
            }
        }
        let file = completed.expect("new transfer completed");
        assert_eq!(file.name, "new.bin");
        assert_eq!(file.data, b"NEW!");
    }

    #[tokio::test]
    async fn file_source_reads_windows() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello chunked world").unwrap();
        tmp.flush().unwrap();

        let source = FileSource::open(tmp.path()).await.unwrap();
        assert_eq!(source.len(), 19);
        assert_eq!(source.read_window(6, 7).await.unwrap(), b"chunked");
        assert_eq!(source.read_window(0, 5).await.unwrap(), b"hello");
    }
}
