//! AEAD sealing of the request and response headers.
//!
//! Request header on the wire:
//!
//! ```text
//! +---------+--------------+-------+----------------+
//! | Auth ID | Sealed length| Nonce | Sealed payload |
//! +---------+--------------+-------+----------------+
//! |   16    |    2 + 16    |   8   |     N + 16     |
//! +---------+--------------+-------+----------------+
//! ```

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, Payload},
    Aes128Gcm, KeyInit, Nonce,
};
use log::{debug, trace};
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    auth_id::{create_auth_id, AUTH_ID_LEN},
    clock::{Clock, SystemClock},
    crypto::{
        kdf, kdf16, sha256_16, KDF_SALT_HEADER_LENGTH_AEAD_IV, KDF_SALT_HEADER_LENGTH_AEAD_KEY,
        KDF_SALT_HEADER_PAYLOAD_AEAD_IV, KDF_SALT_HEADER_PAYLOAD_AEAD_KEY,
        KDF_SALT_RESP_HEADER_LENGTH_IV, KDF_SALT_RESP_HEADER_LENGTH_KEY,
        KDF_SALT_RESP_HEADER_PAYLOAD_IV, KDF_SALT_RESP_HEADER_PAYLOAD_KEY,
    },
    error::{Error, Result},
};

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 8;
const SEALED_LENGTH_LEN: usize = 2 + TAG_LEN;

fn nonce12(key: &[u8], path: &[&[u8]]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&kdf(key, path)[..12]);
    nonce
}

fn seal(key: &[u8; 16], nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    Aes128Gcm::new(GenericArray::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| Error::Seal)
}

fn open(key: &[u8; 16], nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
    Aes128Gcm::new(GenericArray::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .ok()
}

/// Seals a request header with an auth id for the current time.
pub fn seal_header(cmd_key: &[u8; 16], header: &[u8]) -> Result<Vec<u8>> {
    seal_header_at(cmd_key, header, SystemClock.now())
}

/// Seals a request header with an auth id for `unix_time`.
pub fn seal_header_at(cmd_key: &[u8; 16], header: &[u8], unix_time: i64) -> Result<Vec<u8>> {
    let len = u16::try_from(header.len())
        .map_err(|_| Error::InvalidHeader(format!("header too long: {}", header.len())))?;

    let auth_id = create_auth_id(cmd_key, unix_time);
    let nonce: [u8; NONCE_LEN] = rand::thread_rng().gen();

    let length_key = kdf16(cmd_key, &[KDF_SALT_HEADER_LENGTH_AEAD_KEY, &auth_id, &nonce]);
    let length_nonce = nonce12(cmd_key, &[KDF_SALT_HEADER_LENGTH_AEAD_IV, &auth_id, &nonce]);
    let sealed_length = seal(&length_key, &length_nonce, &len.to_be_bytes(), &auth_id)?;

    let payload_key = kdf16(cmd_key, &[KDF_SALT_HEADER_PAYLOAD_AEAD_KEY, &auth_id, &nonce]);
    let payload_nonce = nonce12(cmd_key, &[KDF_SALT_HEADER_PAYLOAD_AEAD_IV, &auth_id, &nonce]);
    let sealed_payload = seal(&payload_key, &payload_nonce, header, &auth_id)?;

    let mut out = Vec::with_capacity(AUTH_ID_LEN + SEALED_LENGTH_LEN + NONCE_LEN + sealed_payload.len());
    out.extend_from_slice(&auth_id);
    out.extend_from_slice(&sealed_length);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed_payload);
    Ok(out)
}

#[derive(Debug)]
pub struct OpenedHeader {
    pub payload: Vec<u8>,
    /// Bytes read from the stream after the auth id.
    pub consumed: usize,
}

/// A failed [`open_header`].
///
/// `drain` tells the caller whether the peer should be drained before the
/// connection is dropped. It is false when reading itself failed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct OpenError {
    #[source]
    pub error: Error,
    pub drain: bool,
    pub consumed: usize,
}

/// Reads until `buf` is full, adding every byte read to `consumed`, even on
/// failure.
async fn read_full<R>(reader: &mut R, buf: &mut [u8], consumed: &mut usize) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
        *consumed += n;
    }
    Ok(())
}

/// Reads and opens the rest of a request header whose auth id was already
/// read and matched to `cmd_key`.
pub async fn open_header<R>(
    cmd_key: &[u8; 16],
    auth_id: &[u8; AUTH_ID_LEN],
    reader: &mut R,
) -> std::result::Result<OpenedHeader, OpenError>
where
    R: AsyncRead + Unpin,
{
    let mut consumed = 0;
    let read_failed = |e: std::io::Error, consumed: usize| OpenError {
        error: Error::Io(e),
        drain: false,
        consumed,
    };

    let mut sealed_length = [0u8; SEALED_LENGTH_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    if let Err(e) = read_full(reader, &mut sealed_length, &mut consumed).await {
        return Err(read_failed(e, consumed));
    }
    if let Err(e) = read_full(reader, &mut nonce, &mut consumed).await {
        return Err(read_failed(e, consumed));
    }

    let length_key = kdf16(cmd_key, &[KDF_SALT_HEADER_LENGTH_AEAD_KEY, auth_id, &nonce]);
    let length_nonce = nonce12(cmd_key, &[KDF_SALT_HEADER_LENGTH_AEAD_IV, auth_id, &nonce]);
    let length = match open(&length_key, &length_nonce, &sealed_length, auth_id) {
        Some(plain) if plain.len() == 2 => u16::from_be_bytes([plain[0], plain[1]]) as usize,
        _ => {
            debug!("header length failed authentication");
            return Err(OpenError {
                error: Error::OpenLength,
                drain: true,
                consumed,
            });
        }
    };
    trace!("header payload length {}", length);

    let mut sealed_payload = vec![0u8; length + TAG_LEN];
    if let Err(e) = read_full(reader, &mut sealed_payload, &mut consumed).await {
        return Err(read_failed(e, consumed));
    }

    let payload_key = kdf16(cmd_key, &[KDF_SALT_HEADER_PAYLOAD_AEAD_KEY, auth_id, &nonce]);
    let payload_nonce = nonce12(cmd_key, &[KDF_SALT_HEADER_PAYLOAD_AEAD_IV, auth_id, &nonce]);
    match open(&payload_key, &payload_nonce, &sealed_payload, auth_id) {
        Some(payload) => Ok(OpenedHeader { payload, consumed }),
        None => {
            debug!("header payload failed authentication");
            Err(OpenError {
                error: Error::OpenPayload,
                drain: true,
                consumed,
            })
        }
    }
}

/// Derives the response key and IV from the request's body key and IV.
pub fn response_keys(body_key: &[u8; 16], body_iv: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    (sha256_16(body_key), sha256_16(body_iv))
}

/// Seals a response header: sealed 2 byte length, then the sealed payload.
pub fn seal_response_header(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    header: &[u8],
) -> Result<Vec<u8>> {
    let len = u16::try_from(header.len())
        .map_err(|_| Error::InvalidHeader(format!("header too long: {}", header.len())))?;

    let length_key = kdf16(resp_key, &[KDF_SALT_RESP_HEADER_LENGTH_KEY]);
    let length_nonce = nonce12(resp_iv, &[KDF_SALT_RESP_HEADER_LENGTH_IV]);
    let mut out = seal(&length_key, &length_nonce, &len.to_be_bytes(), &[])?;

    let payload_key = kdf16(resp_key, &[KDF_SALT_RESP_HEADER_PAYLOAD_KEY]);
    let payload_nonce = nonce12(resp_iv, &[KDF_SALT_RESP_HEADER_PAYLOAD_IV]);
    out.extend_from_slice(&seal(&payload_key, &payload_nonce, header, &[])?);
    Ok(out)
}

pub async fn open_response_header<R>(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    reader: &mut R,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut sealed_length = [0u8; SEALED_LENGTH_LEN];
    reader.read_exact(&mut sealed_length).await?;

    let length_key = kdf16(resp_key, &[KDF_SALT_RESP_HEADER_LENGTH_KEY]);
    let length_nonce = nonce12(resp_iv, &[KDF_SALT_RESP_HEADER_LENGTH_IV]);
    let length = match open(&length_key, &length_nonce, &sealed_length, &[]) {
        Some(plain) if plain.len() == 2 => u16::from_be_bytes([plain[0], plain[1]]) as usize,
        _ => return Err(Error::OpenLength),
    };

    let mut sealed_payload = vec![0u8; length + TAG_LEN];
    reader.read_exact(&mut sealed_payload).await?;

    let payload_key = kdf16(resp_key, &[KDF_SALT_RESP_HEADER_PAYLOAD_KEY]);
    let payload_nonce = nonce12(resp_iv, &[KDF_SALT_RESP_HEADER_PAYLOAD_IV]);
    open(&payload_key, &payload_nonce, &sealed_payload, &[]).ok_or(Error::OpenPayload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_id::AuthIdDecoder;

    const KEY: [u8; 16] = [0x42; 16];
    const NOW: i64 = 1_700_000_000;

    fn split_auth_id(sealed: &[u8]) -> ([u8; AUTH_ID_LEN], &[u8]) {
        let mut auth_id = [0u8; AUTH_ID_LEN];
        auth_id.copy_from_slice(&sealed[..AUTH_ID_LEN]);
        (auth_id, &sealed[AUTH_ID_LEN..])
    }

    #[tokio::test]
    async fn opens_what_it_seals() {
        for size in [0usize, 1, 57, 4096] {
            let header: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let sealed = seal_header_at(&KEY, &header, NOW).unwrap();
            assert_eq!(sealed.len(), 16 + 18 + 8 + size + 16);

            let (auth_id, mut rest) = split_auth_id(&sealed);
            let opened = open_header(&KEY, &auth_id, &mut rest).await.unwrap();
            assert_eq!(opened.payload, header);
            assert_eq!(opened.consumed, sealed.len() - AUTH_ID_LEN);
            assert!(rest.is_empty());
        }
    }

    #[tokio::test]
    async fn auth_id_carries_the_time() {
        let sealed = seal_header_at(&KEY, b"x", NOW).unwrap();
        let (auth_id, _) = split_auth_id(&sealed);
        let decoded = AuthIdDecoder::new(&KEY).decode(&auth_id);
        assert!(decoded.checksum_valid());
        assert_eq!(decoded.timestamp, NOW);
    }

    #[tokio::test]
    async fn any_tampered_bit_fails_with_exact_consumption() {
        let header = b"0123456789abcdef0123456789abcdef".to_vec();
        let sealed = seal_header_at(&KEY, &header, NOW).unwrap();
        let after_auth = sealed.len() - AUTH_ID_LEN;

        for offset in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[offset] ^= 0x01;
            let (auth_id, mut rest) = split_auth_id(&tampered);

            let err = open_header(&KEY, &auth_id, &mut rest).await.unwrap_err();
            assert!(err.drain, "offset {}", offset);
            if offset < AUTH_ID_LEN + 26 {
                // the auth id is the AAD and, like the nonce, feeds the
                // length key, so both are caught on the length
                assert!(matches!(err.error, Error::OpenLength), "offset {}", offset);
                assert_eq!(err.consumed, 26);
            } else {
                assert!(matches!(err.error, Error::OpenPayload), "offset {}", offset);
                assert_eq!(err.consumed, after_auth);
                assert_eq!(err.consumed, 26 + header.len() + 16);
            }
        }
    }

    #[tokio::test]
    async fn wrong_key_fails_on_length() {
        let sealed = seal_header_at(&KEY, b"payload", NOW).unwrap();
        let (auth_id, mut rest) = split_auth_id(&sealed);
        let err = open_header(&[0x24; 16], &auth_id, &mut rest).await.unwrap_err();
        assert!(matches!(err.error, Error::OpenLength));
        assert!(err.drain);
    }

    #[tokio::test]
    async fn short_read_is_not_drained() {
        let sealed = seal_header_at(&KEY, b"payload", NOW).unwrap();
        let (auth_id, rest) = split_auth_id(&sealed);
        let mut truncated = &rest[..20];
        let err = open_header(&KEY, &auth_id, &mut truncated).await.unwrap_err();
        assert!(!err.drain);
        assert_eq!(err.consumed, 20);
        assert!(matches!(err.error, Error::Io(_)));
    }

    #[tokio::test]
    async fn response_header_round_trip() {
        let (resp_key, resp_iv) = response_keys(&[1u8; 16], &[2u8; 16]);
        assert_ne!(resp_key, resp_iv);

        let sealed = seal_response_header(&resp_key, &resp_iv, &[7, 0, 0, 0]).unwrap();
        assert_eq!(sealed.len(), 18 + 4 + 16);

        let mut reader = sealed.as_slice();
        let opened = open_response_header(&resp_key, &resp_iv, &mut reader)
            .await
            .unwrap();
        assert_eq!(opened, vec![7, 0, 0, 0]);

        let mut tampered = sealed.clone();
        tampered[25] ^= 0x80;
        let mut reader = tampered.as_slice();
        assert!(matches!(
            open_response_header(&resp_key, &resp_iv, &mut reader).await,
            Err(Error::OpenPayload)
        ));
    }
}
