//! Chunked data phase.
//!
//! Every chunk is a big endian `u16` length followed by that many body bytes.
//! A chunk carrying no data ends the stream. How the body is protected
//! depends on the negotiated [`Security`]; whether the length is masked and
//! the body padded depends on the request option bits, see [`Framing`].

use std::io;

use aes::Aes128;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead},
    Aes128Gcm, KeyInit,
};
use bytes::Bytes;
use cfb_mode::{cipher::KeyIvInit, BufDecryptor, BufEncryptor};
use chacha20poly1305::ChaCha20Poly1305;
use common::{ActivityTimer, PipeReader, PipeWriter};
use log::{debug, trace};
use md5::{Digest, Md5};
use rand::RngCore;
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake128, Shake128Reader,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    crypto::fnv::fnv,
    error::{Error, Result},
    protocol::{option, Security},
};

/// Largest payload carried by one chunk.
pub const MAX_CHUNK_DATA: usize = 16 * 1024;

const TAG_LEN: usize = 16;
const FNV_LEN: usize = 4;
const MAX_PADDING: u16 = 64;

/// Length masking and padding of one chunk stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Framing {
    pub masking: bool,
    pub padding: bool,
}

impl Framing {
    /// Reads the framing from request option bits. Padding needs masking and
    /// is never applied to unencrypted streams.
    pub fn new(option: u8, security: Security) -> Self {
        let masking = option & option::CHUNK_MASKING != 0;
        let padding =
            masking && option & option::GLOBAL_PADDING != 0 && security != Security::None;
        Self { masking, padding }
    }
}

/// SHAKE128 stream over the body IV that masks lengths and picks padding.
struct LengthMask {
    xof: Shake128Reader,
    padding: bool,
}

impl LengthMask {
    fn new(iv: &[u8; 16], padding: bool) -> Self {
        let mut shake = Shake128::default();
        shake.update(iv);
        Self {
            xof: shake.finalize_xof(),
            padding,
        }
    }

    fn next(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.xof.read(&mut buf);
        u16::from_be_bytes(buf)
    }

    /// Drawn before the mask of the same chunk.
    fn padding_len(&mut self) -> usize {
        if self.padding {
            (self.next() % MAX_PADDING) as usize
        } else {
            0
        }
    }
}

/// `MD5(key) ‖ MD5(MD5(key))`
pub(crate) fn chacha_key(key: &[u8; 16]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let first = Md5::digest(key);
    out[..16].copy_from_slice(&first);
    out[16..].copy_from_slice(&Md5::digest(&first));
    out
}

enum BodyCipher {
    Gcm(Aes128Gcm),
    Chacha(ChaCha20Poly1305),
}

struct AeadState {
    cipher: BodyCipher,
    iv: [u8; 16],
    count: u16,
}

impl AeadState {
    fn gcm(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: BodyCipher::Gcm(Aes128Gcm::new(GenericArray::from_slice(key))),
            iv: *iv,
            count: 0,
        }
    }

    fn chacha(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let key = chacha_key(key);
        Self {
            cipher: BodyCipher::Chacha(ChaCha20Poly1305::new(GenericArray::from_slice(&key))),
            iv: *iv,
            count: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.iv[2..12]);
        self.count = self.count.wrapping_add(1);
        nonce
    }

    fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = GenericArray::from_slice(&nonce);
        match &self.cipher {
            BodyCipher::Gcm(cipher) => cipher.encrypt(nonce, data),
            BodyCipher::Chacha(cipher) => cipher.encrypt(nonce, data),
        }
        .map_err(|_| Error::Seal)
    }

    fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < TAG_LEN {
            return Err(Error::ChunkAuth);
        }
        let nonce = self.next_nonce();
        let nonce = GenericArray::from_slice(&nonce);
        match &self.cipher {
            BodyCipher::Gcm(cipher) => cipher.decrypt(nonce, sealed),
            BodyCipher::Chacha(cipher) => cipher.decrypt(nonce, sealed),
        }
        .map_err(|_| Error::ChunkAuth)
    }
}

enum Sealer {
    None,
    Aead(AeadState),
    Cfb(BufEncryptor<Aes128>),
}

enum Opener {
    None,
    Aead(AeadState),
    Cfb(BufDecryptor<Aes128>),
}

/// Writes data as chunks.
pub struct ChunkWriter<W> {
    writer: W,
    sealer: Sealer,
    mask: Option<LengthMask>,
}

impl<W> ChunkWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(
        writer: W,
        security: Security,
        framing: Framing,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Self {
        let sealer = match security {
            Security::None => Sealer::None,
            Security::Aes128Gcm => Sealer::Aead(AeadState::gcm(key, iv)),
            Security::Chacha20Poly1305 => Sealer::Aead(AeadState::chacha(key, iv)),
            Security::Aes128Cfb => Sealer::Cfb(BufEncryptor::new(key.into(), iv.into())),
        };
        let mask = framing
            .masking
            .then(|| LengthMask::new(iv, framing.padding));
        Self {
            writer,
            sealer,
            mask,
        }
    }

    fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let padding = self.mask.as_mut().map_or(0, LengthMask::padding_len);
        let body = match &mut self.sealer {
            Sealer::None => data.to_vec(),
            Sealer::Aead(state) => state.seal(data)?,
            Sealer::Cfb(_) => {
                let mut body = Vec::with_capacity(FNV_LEN + data.len());
                body.extend_from_slice(&fnv(data).to_be_bytes());
                body.extend_from_slice(data);
                body
            }
        };

        // MAX_CHUNK_DATA plus overhead and padding stays below u16::MAX
        let mut len = (body.len() + padding) as u16;
        if let Some(mask) = &mut self.mask {
            len ^= mask.next();
        }

        let mut frame = Vec::with_capacity(2 + body.len() + padding);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        if padding > 0 {
            let start = frame.len();
            frame.resize(start + padding, 0);
            rand::thread_rng().fill_bytes(&mut frame[start..]);
        }
        if let Sealer::Cfb(encryptor) = &mut self.sealer {
            encryptor.encrypt(&mut frame);
        }
        Ok(frame)
    }

    /// Writes `data`, split into as many chunks as needed. Empty data is
    /// ignored since an empty chunk would end the stream.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        for piece in data.chunks(MAX_CHUNK_DATA) {
            let frame = self.encode(piece)?;
            self.writer.write_all(&frame).await?;
        }
        Ok(())
    }

    /// Writes the terminating chunk and shuts the writer down.
    pub async fn finish(&mut self) -> Result<()> {
        let frame = self.encode(&[])?;
        self.writer.write_all(&frame).await?;
        self.writer.shutdown().await?;
        trace!("chunk stream finished");
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads chunks written by a [`ChunkWriter`].
pub struct ChunkReader<R> {
    reader: R,
    opener: Opener,
    mask: Option<LengthMask>,
    finished: bool,
}

impl<R> ChunkReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        security: Security,
        framing: Framing,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Self {
        let opener = match security {
            Security::None => Opener::None,
            Security::Aes128Gcm => Opener::Aead(AeadState::gcm(key, iv)),
            Security::Chacha20Poly1305 => Opener::Aead(AeadState::chacha(key, iv)),
            Security::Aes128Cfb => Opener::Cfb(BufDecryptor::new(key.into(), iv.into())),
        };
        let mask = framing
            .masking
            .then(|| LengthMask::new(iv, framing.padding));
        Self {
            reader,
            opener,
            mask,
            finished: false,
        }
    }

    /// Reads the length prefix and returns it with the padding it includes.
    /// `None` means the peer closed cleanly on a chunk boundary.
    async fn read_length(&mut self) -> Result<Option<(usize, usize)>> {
        let mut len = [0u8; 2];
        let n = self.reader.read(&mut len).await?;
        if n == 0 {
            return Ok(None);
        }
        if n == 1 {
            self.reader.read_exact(&mut len[1..]).await?;
        }
        if let Opener::Cfb(decryptor) = &mut self.opener {
            decryptor.decrypt(&mut len);
        }
        let mut len = u16::from_be_bytes(len);
        let mut padding = 0;
        if let Some(mask) = &mut self.mask {
            padding = mask.padding_len();
            len ^= mask.next();
        }
        Ok(Some((len as usize, padding)))
    }

    /// Returns the next chunk, or `None` once the stream ended.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        let Some((len, padding)) = self.read_length().await? else {
            debug!("chunk stream closed without terminator");
            self.finished = true;
            return Ok(None);
        };
        if len < padding {
            return Err(Error::ChunkAuth);
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        if let Opener::Cfb(decryptor) = &mut self.opener {
            decryptor.decrypt(&mut body);
        }
        body.truncate(len - padding);

        let data = match &mut self.opener {
            Opener::None => body,
            Opener::Aead(state) => state.open(&body)?,
            Opener::Cfb(_) => {
                if body.len() < FNV_LEN {
                    return Err(Error::ChunkAuth);
                }
                let data = body.split_off(FNV_LEN);
                if fnv(&data).to_be_bytes() != body.as_slice() {
                    return Err(Error::ChunkAuth);
                }
                data
            }
        };

        if data.is_empty() {
            trace!("chunk stream terminator");
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(Bytes::from(data)))
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

/// Forwards decoded chunks into `pipe`, closing it when the stream ends and
/// releasing it on failure.
pub async fn copy_chunks_to_pipe<R>(
    reader: &mut ChunkReader<R>,
    pipe: &mut PipeWriter,
    timer: &ActivityTimer,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    loop {
        match reader.read_chunk().await {
            Ok(Some(chunk)) => {
                total += chunk.len() as u64;
                pipe.write(chunk).await?;
                timer.update();
            }
            Ok(None) => {
                pipe.close();
                return Ok(total);
            }
            Err(e) => {
                pipe.release();
                return Err(e.into());
            }
        }
    }
}

/// Encodes everything read from `pipe` as chunks, finishing the chunk stream
/// on a clean close.
pub async fn copy_pipe_to_chunks<W>(
    pipe: &mut PipeReader,
    writer: &mut ChunkWriter<W>,
    timer: &ActivityTimer,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = pipe.read().await? {
        if let Err(e) = writer.write_chunk(&chunk).await {
            pipe.release();
            return Err(e.into());
        }
        total += chunk.len() as u64;
        timer.update();
    }
    writer.finish().await?;
    Ok(total)
}
