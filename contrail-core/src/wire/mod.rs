//! Byte level codec for broker-transported envelopes.
//!
//! The layout is an exact contract between all binaries of a deployment:
//!
//! ```text
//! [kind: 1 byte][recordCount: 4 bytes BE][record]*
//! record = [fieldCount: 4 bytes BE][(keyLen: 4 BE, key: UTF-8, valueLen: 4 BE, value)*]
//! ```
//!
//! Integers are big-endian two's complement, floats big-endian IEEE-754.
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use thiserror::Error;

use crate::types::{Envelope, EnvelopeKind, Record};

/// Error decoding an envelope from its wire representation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The kind tag does not map to any known [EnvelopeKind]
    #[error("unknown envelope kind tag {0}")]
    UnknownKind(u8),
    /// The payload ended before the advertised structure was complete
    #[error("envelope payload is truncated")]
    Truncated,
    /// A field key is not valid UTF-8
    #[error("field key is not valid UTF-8")]
    KeyUtf8,
}

/// Encode an envelope into its wire representation
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    // PANIC: writing into a Vec can not fail
    #[allow(clippy::unwrap_used)]
    {
        buf.write_u8(envelope.kind.tag()).unwrap();
        buf.write_u32::<BigEndian>(envelope.records.len() as u32)
            .unwrap();
        for record in &envelope.records {
            buf.write_u32::<BigEndian>(record.len() as u32).unwrap();
            for (key, value) in record.iter() {
                buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
                buf.extend_from_slice(key.as_bytes());
                buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
                buf.extend_from_slice(value);
            }
        }
    }
    buf
}

/// Decode an envelope from its wire representation
pub fn decode(payload: &[u8]) -> Result<Envelope, WireError> {
    let mut cursor = Cursor::new(payload);
    let tag = cursor.read_u8().map_err(|_| WireError::Truncated)?;
    let kind = EnvelopeKind::from_tag(tag).ok_or(WireError::UnknownKind(tag))?;
    let record_count = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| WireError::Truncated)?;

    let mut records = Vec::new();
    for _ in 0..record_count {
        records.push(decode_record(&mut cursor)?);
    }
    Ok(Envelope { kind, records })
}

fn decode_record(cursor: &mut Cursor<&[u8]>) -> Result<Record, WireError> {
    let field_count = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| WireError::Truncated)?;
    let mut fields = IndexMap::new();
    for _ in 0..field_count {
        let key = read_chunk(cursor)?;
        let key = String::from_utf8(key).map_err(|_| WireError::KeyUtf8)?;
        let value = read_chunk(cursor)?;
        fields.insert(key, value);
    }
    Ok(Record::new(fields))
}

/// Read a 4-byte big-endian length followed by that many bytes
fn read_chunk(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, WireError> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| WireError::Truncated)? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(WireError::Truncated);
    }
    let mut chunk = vec![0u8; len];
    cursor
        .read_exact(&mut chunk)
        .map_err(|_| WireError::Truncated)?;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        let mut record = Record::default();
        record.set_str("startingAirport", "FRA");
        record.set_int("totalStopovers", 2);
        record.set_float("totalFare", 512.25);
        record
    }

    #[test]
    fn roundtrip_data_rows() {
        let envelope = Envelope::data(vec![sample_record(), sample_record()]);
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn roundtrip_empty_envelope() {
        let envelope = Envelope::data(vec![]);
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn roundtrip_termination_token() {
        let mut record = Record::default();
        record.set_int("prevSent", 1337);
        let envelope = Envelope::termination(record);
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::TerminationToken);
        assert_eq!(decoded.first_record().unwrap().get_int("prevSent"), Ok(1337));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut payload = encode(&Envelope::data(vec![]));
        payload[0] = 0xAB;
        assert_eq!(decode(&payload), Err(WireError::UnknownKind(0xAB)));
    }

    #[test]
    fn rejects_truncated_payload() {
        let payload = encode(&Envelope::data(vec![sample_record()]));
        for cut in [0, 1, 5, payload.len() - 1] {
            assert_eq!(decode(&payload[..cut]), Err(WireError::Truncated));
        }
    }

    /// A value length pointing past the end of the payload must not panic
    /// or allocate the advertised amount
    #[test]
    fn rejects_overlong_length_prefix() {
        let mut payload = vec![0u8; 9];
        payload[0] = EnvelopeKind::DataRows.tag();
        payload[4] = 1; // one record
        payload[8] = 1; // one field
        payload.extend_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(decode(&payload), Err(WireError::Truncated));
    }
}
