//! Record log frames.
//!
//! Frame layout:
//!
//! ```text
//! magic (4) | payload length u32 LE (4) | checksum (4) | CBOR payload
//! ```
//!
//! The checksum is the first four bytes of the SHA-256 digest of the payload.

use crate::error::{StoreError, StoreResult};
use casesync_protocol::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"CSLG";

/// Bytes before the payload.
pub const FRAME_HEADER_SIZE: usize = 12;

/// One logged store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Insert or replace a record.
    Put {
        /// Table name.
        table: String,
        /// Record key.
        key: String,
        /// Full record content.
        content: Value,
    },
    /// Remove a record.
    Delete {
        /// Table name.
        table: String,
        /// Record key.
        key: String,
    },
    /// Remove every record of a table.
    DropTable {
        /// Table name.
        table: String,
    },
    /// Remove every record.
    Clear,
}

impl LogRecord {
    /// Encodes the record as a complete frame.
    pub fn encode_frame(&self) -> StoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(StoreError::codec)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::invalid("record too large for one frame"))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&checksum(&payload));
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Result of scanning a log.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    /// Records of every valid frame, in order.
    pub records: Vec<LogRecord>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Bytes after the valid prefix.
    pub torn_bytes: u64,
}

/// Decodes frames until the end of the log or the first invalid frame.
///
/// A short header, short payload, or checksum mismatch ends the scan: the
/// store treats everything after the last good frame as a torn tail. A frame
/// whose checksum matches but whose payload does not decode is corruption.
pub(crate) fn scan(data: &[u8]) -> StoreResult<Replay> {
    let mut replay = Replay::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < FRAME_HEADER_SIZE || rest[..4] != FRAME_MAGIC {
            break;
        }
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = FRAME_HEADER_SIZE.saturating_add(len);
        if rest.len() < end {
            break;
        }
        let payload = &rest[FRAME_HEADER_SIZE..end];
        if checksum(payload) != rest[8..12] {
            break;
        }
        let record: LogRecord = ciborium::from_reader(payload)
            .map_err(|e| StoreError::Corrupted(format!("frame at offset {pos}: {e}")))?;
        replay.records.push(record);
        pos += end;
    }

    replay.valid_len = pos as u64;
    replay.torn_bytes = (data.len() - pos) as u64;
    Ok(replay)
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str) -> LogRecord {
        LogRecord::Put {
            table: "case".into(),
            key: key.into(),
            content: Value::object([("name", Value::from(key))]),
        }
    }

    #[test]
    fn scan_reads_every_frame() {
        let mut log = Vec::new();
        for record in [put("a"), put("b"), LogRecord::Clear] {
            log.extend(record.encode_frame().unwrap());
        }
        let replay = scan(&log).unwrap();
        assert_eq!(replay.records, vec![put("a"), put("b"), LogRecord::Clear]);
        assert_eq!(replay.valid_len, log.len() as u64);
        assert_eq!(replay.torn_bytes, 0);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let mut log = put("a").encode_frame().unwrap();
        let good = log.len();
        let second = put("b").encode_frame().unwrap();
        log.extend_from_slice(&second[..second.len() - 3]);

        let replay = scan(&log).unwrap();
        assert_eq!(replay.records, vec![put("a")]);
        assert_eq!(replay.valid_len, good as u64);
        assert_eq!(replay.torn_bytes, (second.len() - 3) as u64);
    }

    #[test]
    fn checksum_mismatch_ends_the_scan() {
        let mut log = put("a").encode_frame().unwrap();
        let last = log.len() - 1;
        log[last] ^= 0xFF;
        let replay = scan(&log).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn record_references_survive_cbor() {
        let record = LogRecord::Put {
            table: "creditor".into(),
            key: "k".into(),
            content: Value::object([(
                "case",
                Value::Record(casesync_protocol::RecordId::new("case", "c1")),
            )]),
        };
        let frame = record.encode_frame().unwrap();
        assert_eq!(scan(&frame).unwrap().records, vec![record]);
    }
}
