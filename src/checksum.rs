//! WalB's salted one's-complement checksum.
//!
//! Folds the block as a sequence of little-endian `u32` words, then negates
//! and adds one. A block that checksums to zero with the field itself zeroed
//! is valid; a checksum result of zero is remapped to `0xFFFF_FFFF` so that
//! "unset" and "valid-but-zero" are distinguishable.

const UNSET: u32 = 0xFFFF_FFFF;

/// Compute the salted checksum of `data`. `data.len()` must be a multiple of 4.
pub fn checksum(data: &[u8], salt: u32) -> u32 {
    debug_assert_eq!(data.len() % 4, 0, "checksum input must be word-aligned");

    let mut sum: u32 = salt;
    for word in data.chunks_exact(4) {
        let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        sum = sum.wrapping_add(w);
    }
    let folded = (!sum).wrapping_add(1);
    if folded == 0 {
        UNSET
    } else {
        folded
    }
}

/// Verify that `data` checksums to the stored salted value.
///
/// The convention (matching the on-disk format) is that the checksum field
/// itself is included in `data` but was zeroed before the original checksum
/// was computed; re-checksumming the full block (field included) must fold
/// to zero.
pub fn verify(data: &[u8], salt: u32) -> bool {
    let mut sum: u32 = salt;
    for word in data.chunks_exact(4) {
        let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        sum = sum.wrapping_add(w);
    }
    sum == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_salt_sensitive() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_ne!(checksum(&data, 0), checksum(&data, 1));
    }

    #[test]
    fn zero_result_is_remapped() {
        // salt chosen so the fold lands exactly on zero before remap.
        let data = [0u8; 4];
        let c = checksum(&data, 0);
        assert_eq!(c, UNSET);
    }

    #[test]
    fn self_verifying_round_trip() {
        let mut block = vec![0u8; 64];
        block[10] = 0xAB;
        block[40] = 0xCD;
        let salt = 0x1234_5678;

        // Zero the checksum field (bytes 4..8, matching the header layout),
        // compute, and write it back.
        let sum = checksum(&block, salt);
        block[4..8].copy_from_slice(&sum.to_le_bytes());

        // Folding the whole block (field included) now yields zero.
        let mut total: u32 = salt;
        for word in block.chunks_exact(4) {
            total = total.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }
        assert_eq!(total, 0);
    }
}
