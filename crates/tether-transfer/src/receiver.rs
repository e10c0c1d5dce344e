use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tether_types::TransferMetadata;
use uuid::Uuid;

use crate::config::Framing;
use crate::error::ProtocolViolation;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{self, Frame};
use crate::throughput::{ThroughputMeter, TransferProgress};

const COMPONENT: &str = "receiver";

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Bytes,
    /// Hex SHA-256 of `bytes`
    pub sha256: String,
    pub chunk_count: u64,
}

impl Artifact {
    fn assemble(name: String, chunks: Vec<Bytes>) -> Self {
        let total = chunks.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        let mut hasher = Sha256::new();
        for chunk in &chunks {
            hasher.update(chunk);
            buf.extend_from_slice(chunk);
        }
        Self {
            file_name: name,
            bytes: buf.freeze(),
            sha256: hex::encode(hasher.finalize()),
            chunk_count: chunks.len() as u64,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// Metadata accepted. `superseded` names a violation when an
    /// unfinished transfer was thrown away to make room.
    Started {
        metadata: TransferMetadata,
        superseded: Option<ProtocolViolation>,
    },
    Progress(TransferProgress),
    /// Last chunk arrived; the file is at 100%
    Complete(Artifact),
    /// Sender cancelled; the partial file was discarded
    Aborted { file_name: String, received: u64 },
    /// Frame dropped
    Ignored(ProtocolViolation),
}

struct Assembly {
    transfer_id: Uuid,
    started: Instant,
    metadata: TransferMetadata,
    chunks: Vec<Bytes>,
    received: u64,
}

/// Reassembles files from data-channel frames, one transfer at a time.
pub struct TransferReceiver {
    framing: Framing,
    active: Option<Assembly>,
    meter: ThroughputMeter,
    logger: Arc<dyn TransferLogger>,
}

impl TransferReceiver {
    pub fn new(framing: Framing, logger: Arc<dyn TransferLogger>) -> Self {
        Self {
            framing,
            active: None,
            meter: ThroughputMeter::default(),
            logger,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.active.is_some()
    }

    pub fn progress(&self) -> Option<TransferProgress> {
        self.active.as_ref().map(|a| TransferProgress {
            transferred: a.received,
            total: a.metadata.size,
            bytes_per_sec: self.meter.bytes_per_sec(),
        })
    }

    pub fn on_frame(&mut self, payload: Bytes, now: Instant) -> ReceiveOutcome {
        let frame = match protocol::decode_frame(self.framing, payload) {
            Ok(frame) => frame,
            Err(e) => return self.violation(ProtocolViolation::Malformed(e.to_string())),
        };
        match frame {
            Frame::Metadata(metadata) => self.on_metadata(metadata, now),
            Frame::Chunk(chunk) => self.on_chunk(chunk, now),
            Frame::Abort => match self.active.take() {
                Some(assembly) => {
                    self.meter.reset();
                    self.log(
                        assembly.transfer_id,
                        TransferEvent::Aborted { received_bytes: assembly.received },
                    );
                    ReceiveOutcome::Aborted {
                        file_name: assembly.metadata.name,
                        received: assembly.received,
                    }
                }
                None => self.violation(ProtocolViolation::AbortWithoutTransfer),
            },
        }
    }

    /// The link went away; whatever was partially received is void.
    pub fn on_link_lost(&mut self) -> Option<TransferMetadata> {
        let assembly = self.active.take()?;
        self.meter.reset();
        self.log(
            assembly.transfer_id,
            TransferEvent::Aborted { received_bytes: assembly.received },
        );
        Some(assembly.metadata)
    }

    fn on_metadata(&mut self, metadata: TransferMetadata, now: Instant) -> ReceiveOutcome {
        if metadata.name.trim().is_empty() {
            return self.violation(ProtocolViolation::EmptyFileName);
        }

        let superseded = self.active.take().map(|previous| {
            let violation = ProtocolViolation::MetadataMidTransfer {
                previous: previous.metadata.name,
                incoming: metadata.name.clone(),
            };
            self.log(
                previous.transfer_id,
                TransferEvent::Violation { message: violation.to_string() },
            );
            violation
        });
        self.meter.reset();

        let transfer_id = Uuid::new_v4();
        tracing::info!(
            transfer_id = %transfer_id,
            "Receiving {:?} ({} bytes)",
            metadata.name,
            metadata.size
        );

        if metadata.size == 0 {
            let artifact = Artifact::assemble(metadata.name, Vec::new());
            self.log(
                transfer_id,
                TransferEvent::TransferComplete { total_bytes: 0, chunks: 0, duration_ms: 0 },
            );
            return ReceiveOutcome::Complete(artifact);
        }

        self.active = Some(Assembly {
            transfer_id,
            started: now,
            metadata: metadata.clone(),
            chunks: Vec::new(),
            received: 0,
        });
        ReceiveOutcome::Started { metadata, superseded }
    }

    fn on_chunk(&mut self, chunk: Bytes, now: Instant) -> ReceiveOutcome {
        let Some(assembly) = self.active.as_mut() else {
            return self.violation(ProtocolViolation::ChunkWithoutMetadata);
        };

        let received = assembly.received + chunk.len() as u64;
        if received > assembly.metadata.size {
            let expected = assembly.metadata.size;
            self.active = None;
            self.meter.reset();
            return self.violation(ProtocolViolation::SizeMismatch { expected, received });
        }

        let index = assembly.chunks.len() as u64;
        let size = chunk.len();
        assembly.received = received;
        assembly.chunks.push(chunk);
        let transfer_id = assembly.transfer_id;
        self.log(transfer_id, TransferEvent::ChunkReceived { index, size, received });
        if let Some(rate) = self.meter.record(size as u64, now) {
            self.log(transfer_id, TransferEvent::Rate { bytes_per_sec: rate });
        }

        let total = self.active.as_ref().map_or(0, |a| a.metadata.size);
        if received < total {
            return ReceiveOutcome::Progress(TransferProgress {
                transferred: received,
                total,
                bytes_per_sec: self.meter.bytes_per_sec(),
            });
        }

        let Some(assembly) = self.active.take() else {
            return self.violation(ProtocolViolation::ChunkWithoutMetadata);
        };
        self.meter.reset();
        let duration_ms = now.saturating_duration_since(assembly.started).as_millis() as u64;
        let artifact = Artifact::assemble(assembly.metadata.name, assembly.chunks);
        self.log(
            transfer_id,
            TransferEvent::TransferComplete {
                total_bytes: artifact.size(),
                chunks: artifact.chunk_count,
                duration_ms,
            },
        );
        ReceiveOutcome::Complete(artifact)
    }

    fn violation(&self, violation: ProtocolViolation) -> ReceiveOutcome {
        let transfer_id = self.active.as_ref().map_or(Uuid::nil(), |a| a.transfer_id);
        self.log(transfer_id, TransferEvent::Violation { message: violation.to_string() });
        ReceiveOutcome::Ignored(violation)
    }

    fn log(&self, transfer_id: Uuid, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            transfer_id,
            event,
        });
    }
}
