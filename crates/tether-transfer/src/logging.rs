//! Structured transfer logging.
//!
//! Sender and receiver report lifecycle and per-chunk events through a
//! `TransferLogger`, so hosts can route them to tracing or drop them.

use std::fmt;

use uuid::Uuid;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: Uuid,
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: metadata frame written
    Started { name: String, size: u64 },
    /// Sender: chunk written to the link
    ChunkSent { index: u64, size: usize, offset: u64 },
    /// Receiver: chunk appended to the assembly
    ChunkReceived { index: u64, size: usize, received: u64 },
    /// Sender paused until the link drains
    Backpressure { buffered_chunks: u64 },
    /// Throughput sample taken
    Rate { bytes_per_sec: f64 },
    TransferComplete { total_bytes: u64, chunks: u64, duration_ms: u64 },
    Cancelled { sent_bytes: u64 },
    Aborted { received_bytes: u64 },
    Violation { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { name, size } => write!(f, "started name={:?} size={}", name, size),
            Self::ChunkSent { index, size, offset } => {
                write!(f, "chunk_sent idx={} size={} offset={}", index, size, offset)
            }
            Self::ChunkReceived { index, size, received } => {
                write!(f, "chunk_received idx={} size={} received={}", index, size, received)
            }
            Self::Backpressure { buffered_chunks } => {
                write!(f, "backpressure after={} chunks", buffered_chunks)
            }
            Self::Rate { bytes_per_sec } => write!(f, "rate {:.0} B/s", bytes_per_sec),
            Self::TransferComplete { total_bytes, chunks, duration_ms } => write!(
                f,
                "transfer_complete bytes={} chunks={} duration_ms={}",
                total_bytes, chunks, duration_ms
            ),
            Self::Cancelled { sent_bytes } => write!(f, "cancelled sent={}", sent_bytes),
            Self::Aborted { received_bytes } => write!(f, "aborted received={}", received_bytes),
            Self::Violation { message } => write!(f, "protocol_violation: {}", message),
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::ChunkSent { .. }
            | TransferEvent::ChunkReceived { .. }
            | TransferEvent::Backpressure { .. }
            | TransferEvent::Rate { .. } => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Violation { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
