use aes::{
    cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit},
    Aes128,
};
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::Rng;

use crate::crypto::{kdf16, KDF_SALT_AUTH_ID_ENCRYPTION_KEY};

pub const AUTH_ID_LEN: usize = 16;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Plaintext of an auth id: big endian timestamp, 4 random bytes, and a
/// big endian CRC32 over the first 12 bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EAuID {
    pub timestamp: i64,
    pub random: [u8; 4],
    pub crc: u32,
}

impl EAuID {
    pub fn new(timestamp: i64, random: [u8; 4]) -> Self {
        let mut id = EAuID {
            timestamp,
            random,
            crc: 0,
        };
        id.crc = CRC32.checksum(&id.to_bytes()[..12]);
        id
    }

    pub fn to_bytes(self) -> [u8; AUTH_ID_LEN] {
        let mut buf = [0u8; AUTH_ID_LEN];
        buf[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.random);
        buf[12..].copy_from_slice(&self.crc.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; AUTH_ID_LEN]) -> Self {
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[..8]);
        let mut random = [0u8; 4];
        random.copy_from_slice(&buf[8..12]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&buf[12..]);
        EAuID {
            timestamp: i64::from_be_bytes(timestamp),
            random,
            crc: u32::from_be_bytes(crc),
        }
    }

    /// Whether the embedded checksum matches the first 12 bytes.
    pub fn checksum_valid(&self) -> bool {
        CRC32.checksum(&self.to_bytes()[..12]) == self.crc
    }
}

fn auth_id_cipher(cmd_key: &[u8; 16]) -> Aes128 {
    let key = kdf16(cmd_key, &[KDF_SALT_AUTH_ID_ENCRYPTION_KEY]);
    Aes128::new(&GenericArray::from(key))
}

/// Builds a fresh encrypted auth id for `unix_time`.
pub fn create_auth_id(cmd_key: &[u8; 16], unix_time: i64) -> [u8; AUTH_ID_LEN] {
    let id = EAuID::new(unix_time, rand::thread_rng().gen());
    let mut block = GenericArray::from(id.to_bytes());
    auth_id_cipher(cmd_key).encrypt_block(&mut block);
    block.into()
}

/// Decrypts auth ids for one user. The key schedule is computed once.
#[derive(Clone)]
pub struct AuthIdDecoder {
    cipher: Aes128,
}

impl AuthIdDecoder {
    pub fn new(cmd_key: &[u8; 16]) -> Self {
        Self {
            cipher: auth_id_cipher(cmd_key),
        }
    }

    /// Decrypts without validating; see [`EAuID::checksum_valid`].
    pub fn decode(&self, auth_id: &[u8; AUTH_ID_LEN]) -> EAuID {
        let mut block = GenericArray::from(*auth_id);
        self.cipher.decrypt_block(&mut block);
        EAuID::from_bytes(block.into())
    }
}
