//! Mutual-auth handshake.
//!
//! A connection opens with exactly one fixed-size auth frame:
//! `magic(4) | key_len(2, LE) | key(key_len)` padded to 64 bytes. The
//! receiver answers `magic | 0x00` on accept and closes without writing on
//! reject. Credential validation itself is behind [`CredentialVerifier`];
//! the in-tree implementation checks the receiver's configured key.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::frame::{read_exact_deadline, MAGIC};
use crate::StreamError;

const AUTH_BUF_LEN: usize = 64;
const KEY_LEN_SIZE: usize = 2;
const MAX_KEY_LEN: usize = AUTH_BUF_LEN - MAGIC.len() - KEY_LEN_SIZE;
const RESP_LEN: usize = 5;

/// Validates a presented key and returns the authenticated identity.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, key: &str) -> Option<String>;
}

/// Verifier that accepts exactly the key from the receiver's own
/// configuration. An empty configured key rejects everything.
pub struct ConfiguredKeyVerifier {
    key: String,
}

impl ConfiguredKeyVerifier {
    pub fn new(key: String) -> Self {
        Self { key }
    }
}

impl CredentialVerifier for ConfiguredKeyVerifier {
    fn verify(&self, key: &str) -> Option<String> {
        if !self.key.is_empty() && key == self.key {
            Some("configured-key".to_string())
        } else {
            None
        }
    }
}

/// Client side: send the auth frame, await the 5-byte verdict.
pub async fn client_handshake<S>(stream: &mut S, auth_key: &str) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = auth_key.as_bytes();
    if key.len() > MAX_KEY_LEN {
        return Err(StreamError::AuthRejected(format!(
            "authentication key longer than {} bytes",
            MAX_KEY_LEN
        )));
    }

    let mut buf = [0u8; AUTH_BUF_LEN];
    buf[..MAGIC.len()].copy_from_slice(&MAGIC);
    buf[MAGIC.len()..MAGIC.len() + KEY_LEN_SIZE]
        .copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[MAGIC.len() + KEY_LEN_SIZE..MAGIC.len() + KEY_LEN_SIZE + key.len()].copy_from_slice(key);
    stream.write_all(&buf).await?;

    let mut resp = [0u8; RESP_LEN];
    read_exact_deadline(stream, &mut resp).await?;
    if resp[..MAGIC.len()] != MAGIC {
        return Err(StreamError::BadMagic);
    }
    if resp[RESP_LEN - 1] != 0x00 {
        return Err(StreamError::AuthRejected("declined by server".to_string()));
    }
    Ok(())
}

/// Server side: read the auth frame, validate the key, answer on accept.
///
/// On reject the function returns without writing anything; the caller
/// closes the connection.
pub async fn server_handshake<S, V>(stream: &mut S, verifier: &V) -> Result<String, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    V: CredentialVerifier + ?Sized,
{
    let mut buf = [0u8; AUTH_BUF_LEN];
    read_exact_deadline(stream, &mut buf).await?;

    if buf[..MAGIC.len()] != MAGIC {
        return Err(StreamError::BadMagic);
    }
    let key_len = u16::from_le_bytes([buf[MAGIC.len()], buf[MAGIC.len() + 1]]) as usize;
    if key_len > MAX_KEY_LEN {
        return Err(StreamError::AuthRejected("invalid key length".to_string()));
    }
    let key_start = MAGIC.len() + KEY_LEN_SIZE;
    let key = std::str::from_utf8(&buf[key_start..key_start + key_len])
        .map_err(|_| StreamError::AuthRejected("key is not valid UTF-8".to_string()))?;

    let identity = verifier
        .verify(key)
        .ok_or_else(|| StreamError::AuthRejected("unknown credentials".to_string()))?;

    let mut resp = [0u8; RESP_LEN];
    resp[..MAGIC.len()].copy_from_slice(&MAGIC);
    stream.write_all(&resp).await?;
    Ok(identity)
}
