//! Shard key hashing.
//!
//! Multi-column shard keys are hashed by concatenating a type-tagged binary
//! encoding of each key value and computing xxHash3-64 over the result.
//! Integer widths share one encoding so a key routes identically whether it
//! arrived as `INT` or `BIGINT`.

use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::types::ColumnId;
use xxhash_rust::xxh3::xxh3_64;

/// Compute the shard hash for a row given its shard key columns.
pub fn compute_shard_hash(row: &OwnedRow, shard_key: &[ColumnId]) -> u64 {
    if shard_key.is_empty() {
        return 0;
    }
    let mut buf = Vec::with_capacity(64);
    for col in shard_key {
        match row.get(col.index()) {
            Some(datum) => encode_datum_for_hash(&mut buf, datum),
            None => buf.push(0x00),
        }
    }
    xxh3_64(&buf)
}

/// Compute the shard hash from key values given in shard key order.
pub fn compute_shard_hash_from_datums(datums: &[&Datum]) -> u64 {
    if datums.is_empty() {
        return 0;
    }
    let mut buf = Vec::with_capacity(64);
    for datum in datums {
        encode_datum_for_hash(&mut buf, datum);
    }
    xxh3_64(&buf)
}

/// Node slot for a hash value.
pub fn slot_for_hash(hash: u64, num_nodes: usize) -> usize {
    if num_nodes == 0 {
        return 0;
    }
    (hash % num_nodes as u64) as usize
}

/// Uses a type tag + value encoding to avoid collisions across types.
fn encode_datum_for_hash(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => buf.push(0x00),
        Datum::Boolean(b) => {
            buf.push(0x01);
            buf.push(u8::from(*b));
        }
        Datum::Int32(v) => {
            buf.push(0x03);
            buf.extend_from_slice(&(*v as i64).to_le_bytes());
        }
        Datum::Int64(v) => {
            buf.push(0x03);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            buf.push(0x04);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Text(s) => {
            buf.push(0x05);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00); // terminator, avoids prefix collisions
        }
        Datum::Timestamp(v) => {
            buf.push(0x06);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Date(v) => {
            buf.push(0x07);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Decimal(m, s) => {
            buf.push(0x08);
            let (mut m, mut s) = (*m, *s);
            while s > 0 && m != 0 && m % 10 == 0 {
                m /= 10;
                s -= 1;
            }
            if m == 0 {
                s = 0;
            }
            buf.extend_from_slice(&m.to_le_bytes());
            buf.push(s);
        }
        Datum::Bytea(bytes) => {
            buf.push(0x09);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
