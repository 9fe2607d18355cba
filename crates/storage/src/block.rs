//! Checksummed block framing.
//!
//! Everything the box-tree writes to a [`BackingStore`](crate::BackingStore)
//! is wrapped in a block:
//!
//! ```text
//! [checksum:4][magic:4][owner:8][payload_len:8][payload...]
//! ```
//!
//! The CRC32C checksum covers every byte after the checksum field, so a torn
//! or misdirected write is detected when the block is read back rather than
//! turning into garbage events.

use crate::error::StorageError;

/// Size of the block header (checksum + magic + owner + payload length).
pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 8 + 8;

/// A four-byte tag identifying what a block contains.
pub type Magic = [u8; 4];

/// Returns the total size of a block carrying `payload_len` bytes.
#[inline]
pub const fn block_len(payload_len: usize) -> usize {
    BLOCK_HEADER_SIZE + payload_len
}

/// Builds a block holding `payload`, owned by `owner` (for event payloads,
/// the id of the box that wrote it).
pub fn encode_block(magic: Magic, owner: u64, payload: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(block_len(payload.len()));
    block.extend_from_slice(&[0; 4]);
    block.extend_from_slice(&magic);
    block.extend_from_slice(&owner.to_le_bytes());
    block.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    block.extend_from_slice(payload);
    let checksum = crc32c::crc32c(&block[4..]);
    block[0..4].copy_from_slice(&checksum.to_le_bytes());
    block
}

/// Parsed header of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: Magic,
    pub owner: u64,
    pub payload_len: u64,
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Verifies `block` and returns its header and payload.
///
/// Fails if the checksum does not match, the magic differs from `magic`, or
/// the payload length disagrees with the block size.
pub fn decode_block(magic: Magic, block: &[u8]) -> Result<(BlockHeader, &[u8]), StorageError> {
    if block.len() < BLOCK_HEADER_SIZE {
        return Err(StorageError::Corrupt(format!(
            "block of {} bytes is smaller than its header",
            block.len()
        )));
    }

    let stored = read_u32(&block[0..4]);
    let computed = crc32c::crc32c(&block[4..]);
    if stored != computed {
        return Err(StorageError::ChecksumMismatch {
            expected: computed,
            found: stored,
        });
    }

    let found: Magic = [block[4], block[5], block[6], block[7]];
    if found != magic {
        return Err(StorageError::InvalidMagic {
            expected: magic,
            found,
        });
    }

    let header = BlockHeader {
        magic: found,
        owner: read_u64(&block[8..16]),
        payload_len: read_u64(&block[16..24]),
    };
    let payload = &block[BLOCK_HEADER_SIZE..];
    if payload.len() as u64 != header.payload_len {
        return Err(StorageError::Corrupt(format!(
            "block declares {} payload bytes but carries {}",
            header.payload_len,
            payload.len()
        )));
    }
    Ok((header, payload))
}

/// Like [`decode_block`], but also checks that the block belongs to `owner`.
pub fn decode_owned_block(
    magic: Magic,
    owner: u64,
    block: &[u8],
) -> Result<&[u8], StorageError> {
    let (header, payload) = decode_block(magic, block)?;
    if header.owner != owner {
        return Err(StorageError::OwnerMismatch {
            expected: owner,
            found: header.owner,
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: Magic = *b"TEST";

    #[test]
    fn roundtrip() {
        let block = encode_block(MAGIC, 42, b"hello, box");
        assert_eq!(block.len(), block_len(10));
        let (header, payload) = decode_block(MAGIC, &block).unwrap();
        assert_eq!(header.owner, 42);
        assert_eq!(payload, b"hello, box");
    }

    #[test]
    fn empty_payload() {
        let block = encode_block(MAGIC, 7, &[]);
        assert_eq!(decode_owned_block(MAGIC, 7, &block).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn detects_bit_flip() {
        let mut block = encode_block(MAGIC, 1, &[1, 2, 3, 4]);
        block[BLOCK_HEADER_SIZE + 2] ^= 0x10;
        assert!(matches!(
            decode_block(MAGIC, &block),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn detects_wrong_magic_and_owner() {
        let block = encode_block(MAGIC, 3, &[9]);
        assert!(matches!(
            decode_block(*b"ELSE", &block),
            Err(StorageError::InvalidMagic { .. })
        ));
        assert_eq!(
            decode_owned_block(MAGIC, 4, &block),
            Err(StorageError::OwnerMismatch {
                expected: 4,
                found: 3
            })
        );
    }

    #[test]
    fn rejects_truncated_block() {
        let block = encode_block(MAGIC, 3, &[9, 9, 9]);
        assert!(decode_block(MAGIC, &block[..10]).unwrap_err().is_corruption());
    }
}
