use crate::error::{Result, RmanError};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Content-hash algorithm a file's chunks are addressed with.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// Tag 1. Declared by the format but never used for chunk ids.
    Sha512,
    #[default]
    Sha256,
    /// Tag 3. Iterated HMAC-SHA256 chain keyed by the SHA-256 of the data.
    HmacChain,
    Blake3,
    Unknown(u8),
}

impl HashAlgorithm {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => HashAlgorithm::Sha512,
            2 => HashAlgorithm::Sha256,
            3 => HashAlgorithm::HmacChain,
            4 => HashAlgorithm::Blake3,
            other => HashAlgorithm::Unknown(other),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            HashAlgorithm::Sha512 => 1,
            HashAlgorithm::Sha256 => 2,
            HashAlgorithm::HmacChain => 3,
            HashAlgorithm::Blake3 => 4,
            HashAlgorithm::Unknown(tag) => tag,
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, HashAlgorithm::Sha256 | HashAlgorithm::HmacChain | HashAlgorithm::Blake3)
    }
}

/// Compute the 64-bit chunk id of `data` under `algorithm`.
pub fn chunk_id(data: &[u8], algorithm: HashAlgorithm) -> Result<u64> {
    match algorithm {
        HashAlgorithm::Sha256 => Ok(sha256_id(data)),
        HashAlgorithm::Blake3 => Ok(blake3_id(data)),
        HashAlgorithm::HmacChain => Ok(hmac_chain_id(data)),
        other => Err(RmanError::UnsupportedAlgorithm(other.tag())),
    }
}

/// True iff `data` hashes to `expected` under `algorithm`.
pub fn verify(data: &[u8], expected: u64, algorithm: HashAlgorithm) -> Result<bool> {
    Ok(chunk_id(data, algorithm)? == expected)
}

fn le_prefix(digest: &[u8]) -> u64 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(id)
}

fn sha256_id(data: &[u8]) -> u64 {
    le_prefix(&Sha256::digest(data))
}

fn blake3_id(data: &[u8]) -> u64 {
    le_prefix(blake3::hash(data).as_bytes())
}

/// 32 rounds of HMAC-SHA256 keyed by SHA-256(data), the first over the
/// big-endian block index 1, each later one over the previous round's output.
/// The first 8 bytes of every round are XOR-folded into the id.
fn hmac_chain_id(data: &[u8]) -> u64 {
    let key = Sha256::digest(data);
    let mut ipad = [0x36u8; 64];
    let mut opad = [0x5Cu8; 64];
    for (i, k) in key.iter().enumerate() {
        ipad[i] ^= k;
        opad[i] ^= k;
    }
    let hmac = |msg: &[u8]| {
        let inner = Sha256::new().chain_update(ipad).chain_update(msg).finalize();
        Sha256::new().chain_update(opad).chain_update(inner).finalize()
    };

    let mut buffer = hmac(&[0, 0, 0, 1]);
    let mut result = [0u8; 8];
    result.copy_from_slice(&buffer[..8]);
    for _ in 0..31 {
        buffer = hmac(&buffer);
        for (r, b) in result.iter_mut().zip(buffer.iter()) {
            *r ^= b;
        }
    }
    u64::from_le_bytes(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED: [HashAlgorithm; 3] =
        [HashAlgorithm::Sha256, HashAlgorithm::HmacChain, HashAlgorithm::Blake3];

    #[test]
    fn known_vectors() {
        assert_eq!(chunk_id(b"", HashAlgorithm::Sha256).unwrap(), 0x141C_FC98_42C4_B0E3);
        assert_eq!(chunk_id(b"", HashAlgorithm::Blake3).unwrap(), 0xA6A1_F9F5_B949_13AF);
        assert_eq!(chunk_id(b"", HashAlgorithm::HmacChain).unwrap(), 0xEB8F_EE76_A706_DBDF);
        assert_eq!(
            chunk_id(b"hello world", HashAlgorithm::HmacChain).unwrap(),
            0x0238_C718_A468_CEF7
        );
        assert_eq!(
            chunk_id(b"hello world", HashAlgorithm::Sha256).unwrap(),
            0x083E_4D93_B927_4DB9
        );
    }

    #[test]
    fn hmac_chain_over_larger_input() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(chunk_id(&data, HashAlgorithm::HmacChain).unwrap(), 0x147A_7B87_3285_4D67);
        assert_eq!(chunk_id(&data, HashAlgorithm::Sha256).unwrap(), 0xDC53_2CFC_5107_5B78);
    }

    #[test]
    fn deterministic_across_calls() {
        let data = b"the same bytes, twice";
        for alg in SUPPORTED {
            assert_eq!(chunk_id(data, alg).unwrap(), chunk_id(data, alg).unwrap());
        }
    }

    #[test]
    fn single_byte_flip_fails_every_algorithm() {
        fastrand::seed(0x5EED);
        let mut data: Vec<u8> = (0..4096).map(|_| fastrand::u8(..)).collect();
        let ids: Vec<u64> = SUPPORTED.iter().map(|a| chunk_id(&data, *a).unwrap()).collect();
        data[1234] ^= 0x01;
        for (alg, id) in SUPPORTED.iter().zip(ids) {
            assert!(!verify(&data, id, *alg).unwrap(), "{alg:?} accepted a corrupted chunk");
        }
    }

    #[test]
    fn reserved_and_unknown_tags_are_unsupported() {
        for alg in [HashAlgorithm::Sha512, HashAlgorithm::from_tag(9)] {
            match verify(b"x", 0, alg) {
                Err(RmanError::UnsupportedAlgorithm(tag)) => assert_eq!(tag, alg.tag()),
                other => panic!("expected UnsupportedAlgorithm, got {other:?}"),
            }
        }
    }

    #[test]
    fn tags_round_trip() {
        for tag in 0..=8u8 {
            assert_eq!(HashAlgorithm::from_tag(tag).tag(), tag);
        }
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Sha256);
    }
}
