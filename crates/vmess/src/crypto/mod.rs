pub(crate) mod fnv;

use dyn_clone::DynClone;
use hmac::{Hmac as HmacCore, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = HmacCore<Sha256>;

pub(crate) const KDF_SALT_VMESS_AEAD_KDF: &[u8] = b"VMess AEAD KDF";
pub(crate) const KDF_SALT_AUTH_ID_ENCRYPTION_KEY: &[u8] = b"AES Auth ID Encryption";
pub(crate) const KDF_SALT_HEADER_LENGTH_AEAD_KEY: &[u8] = b"VMess Header AEAD Key_Length";
pub(crate) const KDF_SALT_HEADER_LENGTH_AEAD_IV: &[u8] = b"VMess Header AEAD Nonce_Length";
pub(crate) const KDF_SALT_HEADER_PAYLOAD_AEAD_KEY: &[u8] = b"VMess Header AEAD Key";
pub(crate) const KDF_SALT_HEADER_PAYLOAD_AEAD_IV: &[u8] = b"VMess Header AEAD Nonce";
pub(crate) const KDF_SALT_RESP_HEADER_LENGTH_KEY: &[u8] = b"AEAD Resp Header Len Key";
pub(crate) const KDF_SALT_RESP_HEADER_LENGTH_IV: &[u8] = b"AEAD Resp Header Len IV";
pub(crate) const KDF_SALT_RESP_HEADER_PAYLOAD_KEY: &[u8] = b"AEAD Resp Header Key";
pub(crate) const KDF_SALT_RESP_HEADER_PAYLOAD_IV: &[u8] = b"AEAD Resp Header IV";

/// Hash is the part of a hash function an HMAC needs from its inner hash.
/// An HMAC is itself a Hash, which is what lets the KDF nest them.
trait Hash: DynClone {
    /// write adds more data to the running hash.
    fn write(&mut self, data: &[u8]);

    /// sum returns the digest of everything written so far.
    /// This does not change the underlying hash state.
    fn sum(&self) -> Vec<u8>;

    /// reset restores the state right after construction.
    fn reset(&mut self);

    /// block_size returns the hash's underlying block size.
    fn block_size(&self) -> usize;
}

dyn_clone::clone_trait_object!(Hash);

/// The innermost link: HMAC-SHA256 keyed with the protocol constant.
#[derive(Clone)]
struct Root {
    initial: HmacSha256,
    mac: HmacSha256,
}

impl Root {
    fn new() -> Self {
        let initial = <HmacSha256 as Mac>::new_from_slice(KDF_SALT_VMESS_AEAD_KDF)
            .expect("HMAC can take key of any size");
        Self {
            mac: initial.clone(),
            initial,
        }
    }
}

impl Hash for Root {
    fn write(&mut self, data: &[u8]) {
        Mac::update(&mut self.mac, data);
    }

    fn sum(&self) -> Vec<u8> {
        self.mac.clone().finalize().into_bytes().to_vec()
    }

    fn reset(&mut self) {
        self.mac = self.initial.clone();
    }

    fn block_size(&self) -> usize {
        64
    }
}

/// Hmac over an arbitrary inner Hash.
#[derive(Clone)]
struct Hmac {
    /// opad is the outer padding.
    opad: Vec<u8>,
    /// ipad is the inner padding.
    ipad: Vec<u8>,
    inner: Box<dyn Hash>,
    outer: Box<dyn Hash>,
}

impl Hash for Hmac {
    fn write(&mut self, data: &[u8]) {
        self.inner.write(data);
    }

    fn sum(&self) -> Vec<u8> {
        let digest = self.inner.sum();
        let mut outer = self.outer.clone();
        outer.reset();
        outer.write(&self.opad);
        outer.write(&digest);
        outer.sum()
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.inner.write(&self.ipad);
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }
}

impl Hmac {
    /// `hasher` must be freshly constructed; it is cloned for the outer hash.
    fn new_hasher(hasher: Box<dyn Hash>, key: &[u8]) -> Box<dyn Hash> {
        let mut outer = hasher.clone();
        let mut inner = hasher;

        let block_size = inner.block_size();
        let mut key = key.to_vec();
        if key.len() > block_size {
            outer.write(&key);
            key = outer.sum();
        }

        let mut ipad = vec![0x36; block_size];
        let mut opad = vec![0x5c; block_size];
        for (i, b) in key.iter().enumerate() {
            ipad[i] ^= b;
            opad[i] ^= b;
        }

        inner.write(&ipad);

        Box::new(Hmac {
            opad,
            ipad,
            inner,
            outer,
        })
    }
}

/// Derives 32 bytes from `key` along `path`.
///
/// Every path segment keys a new HMAC whose hash function is the HMAC built
/// for the previous segments, so the order of `path` matters.
pub fn kdf(key: &[u8], path: &[&[u8]]) -> [u8; 32] {
    let mut mac: Box<dyn Hash> = Box::new(Root::new());
    for segment in path {
        mac = Hmac::new_hasher(mac, segment);
    }

    mac.write(key);

    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.sum());
    out
}

/// First 16 bytes of [`kdf`].
pub fn kdf16(key: &[u8], path: &[&[u8]]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&kdf(key, path)[..16]);
    out
}

pub(crate) fn sha256_16(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Sha256::digest(data)[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_vector() {
        assert_eq!(
            kdf(b"test", &[KDF_SALT_AUTH_ID_ENCRYPTION_KEY]),
            [
                149, 109, 253, 20, 158, 39, 112, 199, 28, 74, 3, 106, 99, 8, 234, 59, 64, 172,
                126, 5, 155, 28, 59, 21, 220, 196, 241, 54, 138, 5, 71, 107
            ]
        );
    }

    #[test]
    fn three_segment_vector() {
        assert_eq!(
            kdf(
                b"test",
                &[
                    KDF_SALT_RESP_HEADER_LENGTH_KEY,
                    KDF_SALT_RESP_HEADER_LENGTH_IV,
                    KDF_SALT_RESP_HEADER_PAYLOAD_KEY
                ]
            ),
            [
                243, 80, 193, 249, 151, 10, 93, 168, 117, 239, 214, 89, 161, 130, 122, 81, 238,
                177, 51, 113, 21, 74, 73, 212, 199, 41, 75, 155, 49, 55, 217, 226
            ]
        );
    }

    #[test]
    fn deterministic_and_order_sensitive() {
        let key = [7u8; 16];
        let forward = kdf(&key, &[b"one", b"two"]);
        assert_eq!(forward, kdf(&key, &[b"one", b"two"]));
        assert_ne!(forward, kdf(&key, &[b"two", b"one"]));
        assert_eq!(kdf16(&key, &[b"one", b"two"]), forward[..16]);
    }

    #[test]
    fn long_segments_are_hashed_first() {
        let long = [0xabu8; 100];
        let a = kdf(b"k", &[&long]);
        let b = kdf(b"k", &[&long[..99]]);
        assert_ne!(a, b);
        assert_eq!(a, kdf(b"k", &[&long]));
    }
}
