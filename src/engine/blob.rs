//! Compiled atlas blob framing.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "DATL"
//! 4       1     schema major version
//! 5       3     reserved (zero)
//! 8       8     payload length (LE)
//! 16      8     xxh64 of payload, seed 0 (LE)
//! 24      n     payload (canonical JSON)
//! ```
//!
//! The payload is serialized with `serde_json`, which writes struct fields
//! in declaration order, so the same source always yields the same blob.

use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

use super::SchemaVersion;
use crate::error::EngineError;

/// Blob magic bytes.
pub const BLOB_MAGIC: &[u8; 4] = b"DATL";

/// Size of the fixed header.
pub const HEADER_LEN: usize = 24;

/// Frame a payload into a blob.
pub fn encode<T: Serialize>(schema: SchemaVersion, payload: &T) -> Result<Vec<u8>, EngineError> {
    let body = serde_json::to_vec(payload).map_err(|e| EngineError::Format(e.to_string()))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
    blob.extend_from_slice(BLOB_MAGIC);
    blob.push(schema.major());
    blob.extend_from_slice(&[0u8; 3]);
    blob.extend_from_slice(&(body.len() as u64).to_le_bytes());
    blob.extend_from_slice(&xxh64(&body, 0).to_le_bytes());
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Verify a blob's frame and decode its payload.
pub fn decode<T: DeserializeOwned>(blob: &[u8], schema: SchemaVersion) -> Result<T, EngineError> {
    if blob.len() < HEADER_LEN {
        return Err(EngineError::Format(format!(
            "blob is {} bytes, header needs {}",
            blob.len(),
            HEADER_LEN
        )));
    }
    if &blob[0..4] != BLOB_MAGIC {
        return Err(EngineError::Format("bad magic".to_string()));
    }
    if blob[4] != schema.major() {
        return Err(EngineError::Version {
            expected: schema.major(),
            found: blob[4],
        });
    }

    let declared = read_u64(&blob[8..16]);
    let body = &blob[HEADER_LEN..];
    if declared != body.len() as u64 {
        return Err(EngineError::Format(format!(
            "payload length {} does not match header {}",
            body.len(),
            declared
        )));
    }

    let expected = read_u64(&blob[16..24]);
    let found = xxh64(body, 0);
    if expected != found {
        return Err(EngineError::Checksum { expected, found });
    }

    serde_json::from_slice(body).map_err(|e| EngineError::Format(e.to_string()))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        value: i64,
    }

    fn sample() -> Payload {
        Payload {
            name: "atlas".to_string(),
            value: 42,
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = encode(SchemaVersion::V2, &sample()).unwrap();
        let b = encode(SchemaVersion::V2, &sample()).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[0..4], BLOB_MAGIC);
        assert_eq!(a[4], 2);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let err = decode::<Payload>(b"DATL", SchemaVersion::V2).unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
    }

    #[test]
    fn test_decode_rejects_other_schema() {
        let blob = encode(SchemaVersion::V1, &sample()).unwrap();
        let err = decode::<Payload>(&blob, SchemaVersion::V2).unwrap_err();
        assert_eq!(err, EngineError::Version { expected: 2, found: 1 });
    }

    #[test]
    fn test_decode_detects_corruption() {
        let mut blob = encode(SchemaVersion::V2, &sample()).unwrap();
        let last = blob.len() - 2;
        blob[last] ^= 0x01;
        let err = decode::<Payload>(&blob, SchemaVersion::V2).unwrap_err();
        assert!(matches!(err, EngineError::Checksum { .. }));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut blob = encode(SchemaVersion::V2, &sample()).unwrap();
        blob.push(b' ');
        let err = decode::<Payload>(&blob, SchemaVersion::V2).unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
    }
}
