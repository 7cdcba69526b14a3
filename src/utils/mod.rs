use crate::protocol::redis::SLOT_COUNT;

/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Trim hash tags according to Redis Cluster specification.
///
/// Only the first `{` and the first `}` after it are considered; an empty
/// tag (`{}`) hashes the whole key.
pub fn trim_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(begin) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                let start_idx = begin + 1;
                return &key[start_idx..start_idx + offset];
            }
        }
    }
    key
}

/// Slot a key belongs to.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    crc16(trim_hash_tag(key)) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_hash_tag_extracts_segment() {
        assert_eq!(trim_hash_tag(b"user:{42}:profile"), b"42");
    }

    #[test]
    fn trim_hash_tag_returns_key_when_missing() {
        let key = b"plain-key";
        assert_eq!(trim_hash_tag(key), key);
    }

    #[test]
    fn empty_tag_hashes_whole_key() {
        assert_eq!(trim_hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(trim_hash_tag(b"foo{bar"), b"foo{bar");
    }

    #[test]
    fn hash_slot_matches_reference_values() {
        assert_eq!(key_hash_slot(b"123456789"), 12739);
        assert_eq!(key_hash_slot(b"foo"), 12182);
        assert_eq!(key_hash_slot(b"{user1000}.following"), key_hash_slot(b"user1000"));
    }
}
