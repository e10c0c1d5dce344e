//! Chunked file sender.
//!
//! ```text
//! begin:  [metadata] ──► link
//! step:   [chunk 0] ──► link   Continue / AwaitDrain
//!         [chunk 1] ──► link   ...
//!         [chunk n] ──► link   Complete (buffer released)
//! ```
//!
//! One chunk per `step`. The caller yields between steps and parks on
//! `AwaitDrain` until the link reports `LinkEvent::Drained`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tether_types::TransferMetadata;
use uuid::Uuid;

use crate::config::{Framing, TransferConfig};
use crate::error::{ProtocolViolation, TransferError};
use crate::link::PeerLink;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol;
use crate::throughput::{ThroughputMeter, TransferProgress};

const COMPONENT: &str = "sender";

/// What the caller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    /// Yield, then call `step` again
    Continue,
    /// Link buffer is full; wait for a drain notice
    AwaitDrain,
    Complete,
    Cancelled,
}

/// Cancels a running send from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct TransferSender {
    transfer_id: Uuid,
    metadata: TransferMetadata,
    /// Dropped as soon as the transfer ends
    data: Option<Bytes>,
    offset: u64,
    chunk_size: usize,
    framing: Framing,
    abort_notice: bool,
    cancel: CancelHandle,
    chunks_sent: u64,
    meter: ThroughputMeter,
    started: Option<Instant>,
    outcome: Option<SendStep>,
    logger: Arc<dyn TransferLogger>,
}

impl TransferSender {
    pub fn new(
        transfer_id: Uuid,
        name: impl Into<String>,
        data: Bytes,
        config: &TransferConfig,
        logger: Arc<dyn TransferLogger>,
    ) -> Result<Self, TransferError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TransferError::EmptyFileName);
        }
        Ok(Self {
            transfer_id,
            metadata: TransferMetadata::new(name, data.len() as u64),
            data: Some(data),
            offset: 0,
            chunk_size: config.chunk_size.max(1),
            framing: config.framing,
            abort_notice: config.abort_notice,
            cancel: CancelHandle::default(),
            chunks_sent: 0,
            meter: ThroughputMeter::default(),
            started: None,
            outcome: None,
            logger,
        })
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            transferred: self.offset,
            total: self.metadata.size,
            bytes_per_sec: self.meter.bytes_per_sec(),
        }
    }

    /// Write the metadata frame. Must precede every chunk.
    pub fn begin<L: PeerLink + ?Sized>(
        &mut self,
        link: &mut L,
        now: Instant,
    ) -> Result<SendStep, TransferError> {
        if self.started.is_some() {
            return Err(TransferError::TransferInProgress);
        }
        if !link.is_open() {
            return Err(TransferError::NotConnected);
        }

        let frame = protocol::encode_metadata(self.framing, &self.metadata)
            .map_err(|e| ProtocolViolation::Malformed(e.to_string()))?;
        let can_continue = link.send(frame)?;
        self.started = Some(now);
        self.meter.reset();
        self.log(TransferEvent::Started {
            name: self.metadata.name.clone(),
            size: self.metadata.size,
        });

        if self.metadata.size == 0 {
            return Ok(self.finish(now));
        }
        Ok(if can_continue {
            SendStep::Continue
        } else {
            SendStep::AwaitDrain
        })
    }

    /// Write the next chunk, or wind down on cancellation.
    pub fn step<L: PeerLink + ?Sized>(
        &mut self,
        link: &mut L,
        now: Instant,
    ) -> Result<SendStep, TransferError> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        if self.cancel.is_cancelled() {
            return Ok(self.abort(link));
        }
        if self.started.is_none() {
            return self.begin(link, now);
        }
        let Some(data) = self.data.as_ref() else {
            return Ok(self.finish(now));
        };

        let start = self.offset as usize;
        let end = (start + self.chunk_size).min(data.len());
        let chunk = data.slice(start..end);
        let frame = protocol::encode_chunk(self.framing, &chunk);
        let can_continue = link.send(frame)?;

        self.offset = end as u64;
        self.log(TransferEvent::ChunkSent {
            index: self.chunks_sent,
            size: chunk.len(),
            offset: self.offset,
        });
        self.chunks_sent += 1;
        if let Some(rate) = self.meter.record(chunk.len() as u64, now) {
            self.log(TransferEvent::Rate { bytes_per_sec: rate });
        }

        if self.offset >= self.metadata.size {
            return Ok(self.finish(now));
        }
        if can_continue {
            Ok(SendStep::Continue)
        } else {
            self.log(TransferEvent::Backpressure {
                buffered_chunks: self.chunks_sent,
            });
            Ok(SendStep::AwaitDrain)
        }
    }

    fn abort<L: PeerLink + ?Sized>(&mut self, link: &mut L) -> SendStep {
        if self.abort_notice
            && self.started.is_some()
            && let Some(frame) = protocol::encode_abort(self.framing)
            && let Err(e) = link.send(frame)
        {
            tracing::debug!("Abort notice not delivered: {}", e);
        }
        self.data = None;
        self.meter.reset();
        self.log(TransferEvent::Cancelled { sent_bytes: self.offset });
        self.outcome = Some(SendStep::Cancelled);
        SendStep::Cancelled
    }

    fn finish(&mut self, now: Instant) -> SendStep {
        self.data = None;
        self.offset = self.metadata.size;
        self.meter.reset();
        let duration_ms = self
            .started
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0);
        self.log(TransferEvent::TransferComplete {
            total_bytes: self.metadata.size,
            chunks: self.chunks_sent,
            duration_ms,
        });
        self.outcome = Some(SendStep::Complete);
        SendStep::Complete
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            transfer_id: self.transfer_id,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_types::SignalPayload;

    use super::*;
    use crate::error::{LinkError, SignalingError};
    use crate::link::{LinkId, Role};
    use crate::logging::NullLogger;
    use crate::protocol::{Frame, decode_frame};

    /// Records frames; reports backpressure every `high_water` frames.
    struct RecordingLink {
        frames: Vec<Bytes>,
        open: bool,
        high_water: Option<usize>,
    }

    impl RecordingLink {
        fn new() -> Self {
            Self { frames: Vec::new(), open: true, high_water: None }
        }

        fn decoded(&self, framing: Framing) -> Vec<Frame> {
            self.frames
                .iter()
                .map(|f| decode_frame(framing, f.clone()).unwrap())
                .collect()
        }
    }

    impl PeerLink for RecordingLink {
        fn id(&self) -> LinkId {
            LinkId(1)
        }
        fn role(&self) -> Role {
            Role::Initiator
        }
        fn apply_signal(&mut self, _signal: &SignalPayload) -> Result<(), SignalingError> {
            Ok(())
        }
        fn send(&mut self, frame: Bytes) -> Result<bool, LinkError> {
            if !self.open {
                return Err(LinkError::NotOpen);
            }
            self.frames.push(frame);
            Ok(self.high_water.is_none_or(|n| self.frames.len() % n != 0))
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn destroy(&mut self) {
            self.open = false;
        }
    }

    fn sender(name: &str, len: usize, config: &TransferConfig) -> TransferSender {
        let data = Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        TransferSender::new(Uuid::new_v4(), name, data, config, Arc::new(NullLogger)).unwrap()
    }

    fn run(sender: &mut TransferSender, link: &mut RecordingLink) -> Vec<SendStep> {
        let now = Instant::now();
        let mut steps = vec![sender.begin(link, now).unwrap()];
        while !sender.is_finished() {
            steps.push(sender.step(link, now).unwrap());
        }
        steps
    }

    #[test]
    fn test_chunks_partition_file() {
        let config = TransferConfig::default();
        let mut s = sender("report.pdf", 150_000, &config);
        let mut link = RecordingLink::new();
        let steps = run(&mut s, &mut link);

        assert_eq!(steps.last(), Some(&SendStep::Complete));
        let frames = link.decoded(Framing::Tagged);
        assert_eq!(frames[0], Frame::Metadata(TransferMetadata::new("report.pdf", 150_000)));
        let sizes: Vec<usize> = frames[1..]
            .iter()
            .map(|f| match f {
                Frame::Chunk(c) => c.len(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![65_536, 65_536, 18_928]);
        assert_eq!(s.progress().percent(), 100.0);
        assert_eq!(s.chunks_sent(), 3);
    }

    #[test]
    fn test_rate_cleared_when_done() {
        let config = TransferConfig::default();
        let mut s = sender("clip.mov", 200_000, &config);
        let mut link = RecordingLink::new();
        let mut now = Instant::now();
        s.begin(&mut link, now).unwrap();

        let mut sampled = false;
        while !s.is_finished() {
            now += Duration::from_millis(600);
            s.step(&mut link, now).unwrap();
            if !s.is_finished() {
                sampled |= s.progress().bytes_per_sec > 0.0;
            }
        }
        assert!(sampled);
        assert_eq!(s.progress().bytes_per_sec, 0.0);
        assert_eq!(s.progress().percent(), 100.0);
    }

    #[test]
    fn test_rate_cleared_on_cancel() {
        let config = TransferConfig::default().with_chunk_size(16_384);
        let mut s = sender("clip.mov", 200_000, &config);
        let mut link = RecordingLink::new();
        let mut now = Instant::now();
        s.begin(&mut link, now).unwrap();
        for _ in 0..3 {
            now += Duration::from_millis(600);
            s.step(&mut link, now).unwrap();
        }
        assert!(s.progress().bytes_per_sec > 0.0);

        s.cancel();
        assert_eq!(s.step(&mut link, now).unwrap(), SendStep::Cancelled);
        assert_eq!(s.progress().bytes_per_sec, 0.0);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let config = TransferConfig::default();
        let mut s = sender("a.bin", 131_072, &config);
        let mut link = RecordingLink::new();
        run(&mut s, &mut link);
        assert_eq!(link.frames.len(), 3);
    }

    #[test]
    fn test_empty_file_sends_metadata_only() {
        let config = TransferConfig::default();
        let mut s = sender("empty.txt", 0, &config);
        let mut link = RecordingLink::new();
        assert_eq!(s.begin(&mut link, Instant::now()).unwrap(), SendStep::Complete);
        assert_eq!(link.frames.len(), 1);
        assert_eq!(s.progress().percent(), 100.0);
    }

    #[test]
    fn test_backpressure_pauses_without_skipping() {
        let config = TransferConfig::default().with_chunk_size(16_384);
        let mut s = sender("big.bin", 100_000, &config);
        let mut link = RecordingLink::new();
        link.high_water = Some(3);
        let steps = run(&mut s, &mut link);

        assert!(steps.contains(&SendStep::AwaitDrain));
        let total: usize = link.decoded(Framing::Tagged)[1..]
            .iter()
            .map(|f| match f {
                Frame::Chunk(c) => c.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 100_000);
    }

    #[test]
    fn test_cancel_sends_abort_and_stops() {
        let config = TransferConfig::default().with_chunk_size(16_384);
        let mut s = sender("big.bin", 100_000, &config);
        let mut link = RecordingLink::new();
        let now = Instant::now();
        s.begin(&mut link, now).unwrap();
        s.step(&mut link, now).unwrap();

        s.cancel_handle().cancel();
        assert_eq!(s.step(&mut link, now).unwrap(), SendStep::Cancelled);
        assert_eq!(s.step(&mut link, now).unwrap(), SendStep::Cancelled);
        assert_eq!(link.decoded(Framing::Tagged).last(), Some(&Frame::Abort));
        assert_eq!(link.frames.len(), 3);
    }

    #[test]
    fn test_legacy_cancel_is_silent() {
        let config = TransferConfig { framing: Framing::Legacy, ..TransferConfig::default() };
        let mut s = sender("big.bin", 100_000, &config);
        let mut link = RecordingLink::new();
        let now = Instant::now();
        s.begin(&mut link, now).unwrap();
        s.cancel();
        assert_eq!(s.step(&mut link, now).unwrap(), SendStep::Cancelled);
        assert_eq!(link.frames.len(), 1);
    }

    #[test]
    fn test_preconditions() {
        let config = TransferConfig::default();
        let logger = Arc::new(NullLogger);
        let err = TransferSender::new(Uuid::new_v4(), "  ", Bytes::new(), &config, logger);
        assert!(matches!(err, Err(TransferError::EmptyFileName)));

        let mut s = sender("a.bin", 10, &config);
        let mut link = RecordingLink::new();
        link.open = false;
        assert!(matches!(s.begin(&mut link, Instant::now()), Err(TransferError::NotConnected)));
    }
}
