//! Shard file encoding
//!
//! Each rank's [`StateBlob`] is stored as a fixed 64-byte little-endian
//! header followed by a bincode payload:
//!
//! | Field        | Size |
//! |--------------|------|
//! | magic `SHRD` | 4    |
//! | version      | 4    |
//! | generation   | 8    |
//! | rank         | 4    |
//! | world size   | 4    |
//! | payload len  | 8    |
//! | SHA-256      | 32   |

use bytes::{BufMut, Bytes, BytesMut};
use runtime_core::{Error, Generation, Rank, Result, StateBlob};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Magic bytes for shard files
pub const SHARD_MAGIC: [u8; 4] = *b"SHRD";

/// Shard format version
pub const SHARD_VERSION: u32 = 1;

/// Encoded header length
pub const HEADER_LEN: usize = 64;

/// Decoded shard file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHeader {
    pub version: u32,
    pub generation: Generation,
    pub rank: Rank,
    pub world_size: usize,
    pub payload_len: u64,
    pub digest: [u8; 32],
}

/// Serialize `blob` for `generation` into a self-verifying shard file
pub fn encode_shard(generation: Generation, world_size: usize, blob: &StateBlob) -> Result<Bytes> {
    let payload = bincode::serialize(blob)?;
    let digest: [u8; 32] = Sha256::digest(&payload).into();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&SHARD_MAGIC);
    buf.put_u32_le(SHARD_VERSION);
    buf.put_u64_le(generation.0);
    buf.put_u32_le(blob.owner_shard_id as u32);
    buf.put_u32_le(world_size as u32);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&digest);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Parse and validate only the header
pub fn decode_header(generation: Generation, data: &[u8]) -> Result<ShardHeader> {
    if data.len() < HEADER_LEN {
        return Err(Error::corrupt(
            generation,
            format!("shard file truncated to {} bytes", data.len()),
        ));
    }
    if data[0..4] != SHARD_MAGIC {
        return Err(Error::corrupt(generation, "invalid shard magic"));
    }

    let version = read_u32(data, 4);
    if version != SHARD_VERSION {
        warn!(
            expected = SHARD_VERSION,
            actual = version,
            "Shard format version mismatch"
        );
    }

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&data[32..64]);

    Ok(ShardHeader {
        version,
        generation: Generation(read_u64(data, 8)),
        rank: read_u32(data, 16) as Rank,
        world_size: read_u32(data, 20) as usize,
        payload_len: read_u64(data, 24),
        digest,
    })
}

/// Decode a shard file written for `generation`, verifying length and digest
pub fn decode_shard(generation: Generation, data: &[u8]) -> Result<(ShardHeader, StateBlob)> {
    let header = decode_header(generation, data)?;

    if header.generation != generation {
        return Err(Error::corrupt(
            generation,
            format!("shard belongs to {}", header.generation),
        ));
    }

    let payload = &data[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        return Err(Error::corrupt(
            generation,
            format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.payload_len
            ),
        ));
    }

    let digest: [u8; 32] = Sha256::digest(payload).into();
    if digest != header.digest {
        return Err(Error::corrupt(
            generation,
            format!("digest mismatch for rank {}", header.rank),
        ));
    }

    let blob: StateBlob = bincode::deserialize(payload)
        .map_err(|e| Error::corrupt(generation, format!("undecodable payload: {}", e)))?;

    if blob.owner_shard_id != header.rank {
        return Err(Error::corrupt(
            generation,
            format!(
                "header rank {} does not match blob owner {}",
                header.rank, blob.owner_shard_id
            ),
        ));
    }

    Ok((header, blob))
}
