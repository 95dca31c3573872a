//! Chunked AES-256-GCM encryption for backup content.
//!
//! Container layout:
//!
//! ```text
//! salt[32] ‖ nonce_base[12] ‖ ( len[4, BE] ‖ ciphertext[len] )*
//! ```
//!
//! The key is derived per file with PBKDF2-HMAC-SHA-256 over a fresh salt. Plaintext
//! is sealed in 4096-byte windows; window `i` uses nonce `nonce_base + i`, read as a
//! 96-bit big-endian integer. Decryption accepts end of input only at a frame
//! boundary, so a container cut short fails instead of yielding a silently shorter
//! plaintext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::io::{ErrorKind, Read, Write};
use zeroize::Zeroizing;

use crate::error::CryptoFailure;
use crate::{BackupError, Result};

/// Size of the per-file PBKDF2 salt in bytes.
pub const SALT_SIZE: usize = 32;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Plaintext bytes sealed per frame.
pub const CHUNK_SIZE: usize = 4096;

/// GCM authentication tag appended to every frame.
pub const TAG_SIZE: usize = 16;

const LENGTH_PREFIX_SIZE: usize = 4;
const MAX_FRAME_LEN: usize = CHUNK_SIZE + TAG_SIZE;
const NONCE_MAX: u128 = (1u128 << 96) - 1;

/// Content key with secure memory handling.
struct ContentKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl ContentKey {
    fn derive(password: &str, salt: &[u8]) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, key.as_mut());
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| CryptoFailure::Cipher(format!("failed to create cipher: {e}")).into())
    }
}

/// Per-chunk nonces derived from a random 96-bit base.
#[derive(Debug, Clone, Copy)]
struct NonceSequence {
    base: u128,
}

impl NonceSequence {
    fn new(base: &[u8; NONCE_SIZE]) -> Self {
        let mut wide = [0u8; 16];
        wide[4..].copy_from_slice(base);
        Self {
            base: u128::from_be_bytes(wide),
        }
    }

    fn nonce_for(&self, chunk: u64) -> Result<[u8; NONCE_SIZE]> {
        let value = self
            .base
            .checked_add(u128::from(chunk))
            .filter(|v| *v <= NONCE_MAX)
            .ok_or(CryptoFailure::NonceExhausted)?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&value.to_be_bytes()[4..]);
        Ok(nonce)
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn stream_error(e: std::io::Error) -> BackupError {
    BackupError::io("<stream>", e)
}

/// Encrypt everything readable from `reader` into `writer` with fresh salt and nonce base
///
/// # Returns
/// Number of bytes written
pub fn encrypt_stream<R: Read, W: Write>(reader: R, writer: W, password: &str) -> Result<u64> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_base = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_base);

    seal_stream(reader, writer, password, &salt, &nonce_base)
}

fn seal_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    password: &str,
    salt: &[u8; SALT_SIZE],
    nonce_base: &[u8; NONCE_SIZE],
) -> Result<u64> {
    let cipher = ContentKey::derive(password, salt).cipher()?;
    let nonces = NonceSequence::new(nonce_base);

    writer.write_all(salt).map_err(stream_error)?;
    writer.write_all(nonce_base).map_err(stream_error)?;
    let mut written = (SALT_SIZE + NONCE_SIZE) as u64;

    let mut window = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    let mut chunk = 0u64;
    loop {
        let n = read_full(&mut reader, &mut window).map_err(stream_error)?;
        if n == 0 {
            break;
        }

        let nonce = nonces.nonce_for(chunk)?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), &window[..n])
            .map_err(|_| CryptoFailure::Cipher(format!("failed to seal chunk {chunk}")))?;

        writer
            .write_all(&(sealed.len() as u32).to_be_bytes())
            .map_err(stream_error)?;
        writer.write_all(&sealed).map_err(stream_error)?;
        written += (LENGTH_PREFIX_SIZE + sealed.len()) as u64;
        chunk += 1;

        if n < CHUNK_SIZE {
            break;
        }
    }

    writer.flush().map_err(stream_error)?;
    Ok(written)
}

/// Decrypt a container from `reader` into `writer`
///
/// Frames are authenticated one at a time, so on failure `writer` may already hold
/// the plaintext of earlier frames. Use [`decrypt`] when nothing may be released
/// before the whole container verifies.
///
/// # Returns
/// Number of plaintext bytes written
pub fn decrypt_stream<R: Read, W: Write>(mut reader: R, mut writer: W, password: &str) -> Result<u64> {
    let mut salt = [0u8; SALT_SIZE];
    if read_full(&mut reader, &mut salt).map_err(stream_error)? != SALT_SIZE {
        return Err(CryptoFailure::Truncated.into());
    }
    let mut nonce_base = [0u8; NONCE_SIZE];
    if read_full(&mut reader, &mut nonce_base).map_err(stream_error)? != NONCE_SIZE {
        return Err(CryptoFailure::Truncated.into());
    }

    let cipher = ContentKey::derive(password, &salt).cipher()?;
    let nonces = NonceSequence::new(&nonce_base);

    let mut frame = vec![0u8; MAX_FRAME_LEN];
    let mut written = 0u64;
    let mut chunk = 0u64;
    loop {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match read_full(&mut reader, &mut prefix).map_err(stream_error)? {
            0 => break,
            LENGTH_PREFIX_SIZE => {}
            _ => return Err(CryptoFailure::Truncated.into()),
        }

        let length = u32::from_be_bytes(prefix);
        let len = length as usize;
        if !(TAG_SIZE..=MAX_FRAME_LEN).contains(&len) {
            return Err(CryptoFailure::InvalidFrame { chunk, length }.into());
        }
        if read_full(&mut reader, &mut frame[..len]).map_err(stream_error)? != len {
            return Err(CryptoFailure::Truncated.into());
        }

        let nonce = nonces.nonce_for(chunk)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), &frame[..len])
                .map_err(|_| CryptoFailure::AuthenticationFailed { chunk })?,
        );

        writer.write_all(&plaintext).map_err(stream_error)?;
        written += plaintext.len() as u64;
        chunk += 1;
    }

    writer.flush().map_err(stream_error)?;
    Ok(written)
}

/// Encrypt a buffer into a new container
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let frames = plaintext.len().div_ceil(CHUNK_SIZE);
    let mut out = Vec::with_capacity(
        SALT_SIZE + NONCE_SIZE + plaintext.len() + frames * (LENGTH_PREFIX_SIZE + TAG_SIZE),
    );
    encrypt_stream(plaintext, &mut out, password)?;
    Ok(out)
}

/// Decrypt a whole container; returns no plaintext unless every frame verifies
pub fn decrypt(container: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(container.len());
    decrypt_stream(container, &mut out, password)?;
    Ok(out)
}
