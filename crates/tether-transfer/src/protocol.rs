//! Data-channel frame format for file transfer.
//!
//! Tagged framing (default):
//!
//! ```text
//! [0]    Tag: 0x01 metadata, 0x02 chunk, 0x03 abort
//! [1..]  Metadata JSON {"type":"metadata","name":..,"size":..}
//!        or raw chunk bytes, or nothing for abort
//! ```
//!
//! Legacy framing sends the metadata JSON bare and chunks untagged. The
//! receiver treats any frame that parses as a metadata record as metadata.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tether_types::TransferMetadata;

use crate::config::Framing;

/// Default chunk size: 64 KiB, the largest message data channels carry reliably.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size accepted from configuration.
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size accepted from configuration.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

pub const TAG_METADATA: u8 = 0x01;
pub const TAG_CHUNK: u8 = 0x02;
pub const TAG_ABORT: u8 = 0x03;

const METADATA_KIND: &str = "metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Metadata(TransferMetadata),
    Chunk(Bytes),
    Abort,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("bad metadata record: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Metadata as it appears on the wire.
#[derive(Serialize, Deserialize)]
struct MetadataRecord {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    size: u64,
}

fn metadata_json(metadata: &TransferMetadata) -> Result<Vec<u8>, FrameError> {
    let record = MetadataRecord {
        kind: METADATA_KIND.to_string(),
        name: metadata.name.clone(),
        size: metadata.size,
    };
    Ok(serde_json::to_vec(&record)?)
}

fn parse_metadata(json: &[u8]) -> Result<TransferMetadata, FrameError> {
    let record: MetadataRecord = serde_json::from_slice(json)?;
    Ok(TransferMetadata::new(record.name, record.size))
}

pub fn encode_metadata(framing: Framing, metadata: &TransferMetadata) -> Result<Bytes, FrameError> {
    let json = metadata_json(metadata)?;
    Ok(match framing {
        Framing::Legacy => Bytes::from(json),
        Framing::Tagged => {
            let mut buf = BytesMut::with_capacity(1 + json.len());
            buf.put_u8(TAG_METADATA);
            buf.put_slice(&json);
            buf.freeze()
        }
    })
}

pub fn encode_chunk(framing: Framing, chunk: &Bytes) -> Bytes {
    match framing {
        Framing::Legacy => chunk.clone(),
        Framing::Tagged => {
            let mut buf = BytesMut::with_capacity(1 + chunk.len());
            buf.put_u8(TAG_CHUNK);
            buf.put_slice(chunk);
            buf.freeze()
        }
    }
}

/// Abort notice, or `None` when the framing cannot express one.
pub fn encode_abort(framing: Framing) -> Option<Bytes> {
    match framing {
        Framing::Tagged => Some(Bytes::from_static(&[TAG_ABORT])),
        Framing::Legacy => None,
    }
}

pub fn decode_frame(framing: Framing, payload: Bytes) -> Result<Frame, FrameError> {
    match framing {
        Framing::Tagged => {
            let Some(&tag) = payload.first() else {
                return Err(FrameError::Empty);
            };
            match tag {
                TAG_METADATA => Ok(Frame::Metadata(parse_metadata(&payload[1..])?)),
                TAG_CHUNK => Ok(Frame::Chunk(payload.slice(1..))),
                TAG_ABORT => Ok(Frame::Abort),
                other => Err(FrameError::UnknownTag(other)),
            }
        }
        Framing::Legacy => {
            if payload.is_empty() {
                return Err(FrameError::Empty);
            }
            match serde_json::from_slice::<MetadataRecord>(&payload) {
                Ok(record) if record.kind == METADATA_KIND => {
                    Ok(Frame::Metadata(TransferMetadata::new(record.name, record.size)))
                }
                _ => Ok(Frame::Chunk(payload)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_metadata() {
        let meta = TransferMetadata::new("report.pdf", 150_000);
        let frame = encode_metadata(Framing::Tagged, &meta).unwrap();
        assert_eq!(frame[0], TAG_METADATA);
        let json: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["size"], 150_000);
        assert_eq!(decode_frame(Framing::Tagged, frame).unwrap(), Frame::Metadata(meta));
    }

    #[test]
    fn test_tagged_chunk_that_looks_like_metadata() {
        // Tagged framing carries this as a chunk; legacy would misread it.
        let raw = Bytes::from_static(br#"{"type":"metadata","name":"x","size":1}"#);
        let frame = encode_chunk(Framing::Tagged, &raw);
        assert_eq!(decode_frame(Framing::Tagged, frame).unwrap(), Frame::Chunk(raw.clone()));
        assert!(matches!(decode_frame(Framing::Legacy, raw).unwrap(), Frame::Metadata(_)));
    }

    #[test]
    fn test_legacy_chunk_passthrough() {
        let raw = Bytes::from_static(&[0xff, 0x00, 0x7b]);
        assert_eq!(encode_chunk(Framing::Legacy, &raw), raw);
        assert_eq!(decode_frame(Framing::Legacy, raw.clone()).unwrap(), Frame::Chunk(raw));

        // Valid JSON that is not a metadata record is still a chunk.
        let json_chunk = Bytes::from_static(br#"{"type":"other","name":"x","size":1}"#);
        assert!(matches!(decode_frame(Framing::Legacy, json_chunk).unwrap(), Frame::Chunk(_)));
    }

    #[test]
    fn test_abort_and_errors() {
        let abort = encode_abort(Framing::Tagged).unwrap();
        assert_eq!(decode_frame(Framing::Tagged, abort).unwrap(), Frame::Abort);
        assert!(encode_abort(Framing::Legacy).is_none());

        assert!(matches!(decode_frame(Framing::Tagged, Bytes::new()), Err(FrameError::Empty)));
        assert!(matches!(
            decode_frame(Framing::Tagged, Bytes::from_static(&[0x09, 1])),
            Err(FrameError::UnknownTag(0x09))
        ));
        assert!(matches!(
            decode_frame(Framing::Tagged, Bytes::from_static(&[TAG_METADATA, b'{'])),
            Err(FrameError::Metadata(_))
        ));
    }
}
