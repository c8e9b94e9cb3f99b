//! Binary frame format for the history on-disk log (§6).
//!
//! Each frame is `[magic:4][len:u32][msgid bytes][kind:u8][shard len:u16][shard bytes][key:u64][crc32:u32]`.
//! `len` covers everything between itself and the CRC (exclusive of magic/len/crc).
//! A trailing frame with a short read or a CRC mismatch is a torn write from a
//! crash mid-append and is discarded, not treated as corruption.

use std::io::{self, Read, Write};

use crc32fast::Hasher as Crc32;

use crate::config::HISTORY_LOG_MAGIC;
use crate::error::HistoryError;
use crate::history::{Location, StorageKind};

pub struct LogRecord {
    pub msgid: String,
    pub location: Location,
}

pub fn encode(record: &LogRecord) -> Vec<u8> {
    let msgid_bytes = record.msgid.as_bytes();
    let shard_bytes = record.location.shard.as_bytes();

    let mut body = Vec::with_capacity(msgid_bytes.len() + shard_bytes.len() + 16);
    body.extend_from_slice(&(msgid_bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(msgid_bytes);
    body.push(record.location.kind as u8);
    body.extend_from_slice(&(shard_bytes.len() as u16).to_le_bytes());
    body.extend_from_slice(shard_bytes);
    body.extend_from_slice(&record.location.key.to_le_bytes());

    let mut crc = Crc32::new();
    crc.update(&body);
    let checksum = crc.finalize();

    let mut frame = Vec::with_capacity(body.len() + 12);
    frame.extend_from_slice(&HISTORY_LOG_MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

pub fn append<W: Write>(w: &mut W, record: &LogRecord) -> io::Result<()> {
    w.write_all(&encode(record))
}

/// Read one frame from `r`. Returns `Ok(None)` on clean EOF, `Ok(Some(..))` on a
/// valid record, and `Err` only for a short/corrupt trailing frame, which the
/// caller should treat as "stop replay here", not propagate as fatal.
pub fn read_one<R: Read>(r: &mut R) -> Result<Option<LogRecord>, HistoryError> {
    let mut magic = [0u8; 4];
    match r.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HistoryError::Io(e)),
    }
    if magic != HISTORY_LOG_MAGIC {
        return Err(HistoryError::CorruptLog {
            offset: 0,
            detail: "bad magic".into(),
        });
    }

    let mut len_buf = [0u8; 4];
    if r.read_exact(&mut len_buf).is_err() {
        return Ok(None); // torn write: length header never landed
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    if r.read_exact(&mut body).is_err() {
        return Ok(None); // torn write: body truncated
    }

    let mut crc_buf = [0u8; 4];
    if r.read_exact(&mut crc_buf).is_err() {
        return Ok(None); // torn write: checksum never landed
    }
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut crc = Crc32::new();
    crc.update(&body);
    if crc.finalize() != stored_crc {
        return Ok(None); // torn/corrupt trailing record, discard per §4.1
    }

    decode_body(&body).map(Some)
}

fn decode_body(body: &[u8]) -> Result<LogRecord, HistoryError> {
    let mut pos = 0usize;
    let read_u32 = |b: &[u8], p: &mut usize| -> Result<u32, HistoryError> {
        let v = b
            .get(*p..*p + 4)
            .ok_or_else(|| corrupt("truncated u32"))?;
        *p += 4;
        Ok(u32::from_le_bytes(v.try_into().unwrap()))
    };

    let msgid_len = read_u32(body, &mut pos)? as usize;
    let msgid_bytes = body
        .get(pos..pos + msgid_len)
        .ok_or_else(|| corrupt("truncated msgid"))?;
    let msgid = String::from_utf8(msgid_bytes.to_vec())
        .map_err(|_| corrupt("msgid not valid utf8"))?;
    pos += msgid_len;

    let kind_byte = *body.get(pos).ok_or_else(|| corrupt("truncated kind"))?;
    pos += 1;
    let kind = StorageKind::from_u8(kind_byte).ok_or_else(|| corrupt("unknown storage kind"))?;

    let shard_len = *body
        .get(pos..pos + 2)
        .ok_or_else(|| corrupt("truncated shard len"))?;
    let shard_len = u16::from_le_bytes(shard_len.try_into().unwrap()) as usize;
    pos += 2;
    let shard_bytes = body
        .get(pos..pos + shard_len)
        .ok_or_else(|| corrupt("truncated shard"))?;
    let shard = String::from_utf8(shard_bytes.to_vec())
        .map_err(|_| corrupt("shard not valid utf8"))?;
    pos += shard_len;

    let key_bytes = body
        .get(pos..pos + 8)
        .ok_or_else(|| corrupt("truncated key"))?;
    let key = u64::from_le_bytes(key_bytes.try_into().unwrap());

    Ok(LogRecord {
        msgid,
        location: Location { kind, shard, key },
    })
}

fn corrupt(detail: &str) -> HistoryError {
    HistoryError::CorruptLog {
        offset: 0,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_record() {
        let record = LogRecord {
            msgid: "<a@x>".to_string(),
            location: Location {
                kind: StorageKind::GroupShard,
                shard: "comp.lang.rust".to_string(),
                key: 42,
            },
        };
        let frame = encode(&record);
        let mut cursor = std::io::Cursor::new(frame);
        let decoded = read_one(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.msgid, record.msgid);
        assert_eq!(decoded.location.shard, record.location.shard);
        assert_eq!(decoded.location.key, record.location.key);
    }

    #[test]
    fn torn_trailing_frame_is_discarded_not_fatal() {
        let record = LogRecord {
            msgid: "<b@x>".to_string(),
            location: Location {
                kind: StorageKind::GroupShard,
                shard: "comp.lang.go".to_string(),
                key: 1,
            },
        };
        let mut frame = encode(&record);
        frame.truncate(frame.len() - 3); // chop off part of the CRC
        let mut cursor = std::io::Cursor::new(frame);
        let result = read_one(&mut cursor).unwrap();
        assert!(result.is_none());
    }
}
