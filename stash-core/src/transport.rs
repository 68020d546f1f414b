//! Encrypted packet transport
//!
//! A connection starts with a plaintext X25519 public-key exchange (64 hex
//! characters each way). Afterwards every packet on the wire is
//! `<4-digit ASCII length><ciphertext>`.
//!
//! Two cipher suites sit behind [`PacketCipher`]:
//! - [`CipherSuite::Legacy`] uses the raw shared secret as an AES-256 key in
//!   ECB mode with PKCS#7 padding to 32 bytes. It has no key derivation and
//!   no integrity protection; it exists for wire compatibility with older
//!   peers.
//! - [`CipherSuite::Aead`] derives the key with SHA-256 and seals each packet
//!   with AES-256-GCM under a random nonce.
//!
//! Neither side authenticates the other's public key, so both suites are
//! open to an active man in the middle.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Result, StashError};

/// Width of the ASCII length prefix
pub const LENGTH_DIGITS: usize = 4;

/// Largest ciphertext the length prefix can describe
pub const MAX_PACKET_LEN: usize = 9999;

/// Padding block size of the legacy suite
pub const PAD_BLOCK: usize = 32;

const AES_BLOCK: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const PUBLIC_KEY_HEX_LEN: usize = 64;
const KDF_LABEL: &[u8] = b"stash transport v1";

/// Cipher applied to every packet after the key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherSuite {
    #[default]
    Legacy,
    Aead,
}

impl CipherSuite {
    /// Build the packet cipher for a negotiated shared secret
    pub fn cipher(&self, shared_secret: &[u8; 32]) -> Result<Box<dyn PacketCipher>> {
        Ok(match self {
            CipherSuite::Legacy => Box::new(LegacyCipher::new(shared_secret)),
            CipherSuite::Aead => Box::new(AeadCipher::new(shared_secret)?),
        })
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherSuite::Legacy => write!(f, "legacy"),
            CipherSuite::Aead => write!(f, "aead"),
        }
    }
}

impl std::str::FromStr for CipherSuite {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(CipherSuite::Legacy),
            "aead" => Ok(CipherSuite::Aead),
            other => Err(StashError::Config(format!("unknown cipher suite {:?}", other))),
        }
    }
}

/// Symmetric packet encryption
pub trait PacketCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Largest plaintext whose ciphertext still fits in one packet
    fn max_plaintext_len(&self) -> usize;
}

/// AES-256-ECB with PKCS#7 padding to [`PAD_BLOCK`]
pub struct LegacyCipher {
    cipher: Aes256,
}

impl LegacyCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: <Aes256 as aes::cipher::KeyInit>::new(GenericArray::from_slice(key)),
        }
    }
}

impl PacketCipher for LegacyCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let pad = PAD_BLOCK - plaintext.len() % PAD_BLOCK;
        let mut buf = Vec::with_capacity(plaintext.len() + pad);
        buf.extend_from_slice(plaintext);
        buf.resize(plaintext.len() + pad, pad as u8);
        for block in buf.chunks_exact_mut(AES_BLOCK) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(buf)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % PAD_BLOCK != 0 {
            return Err(StashError::Crypto(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                PAD_BLOCK
            )));
        }
        let mut buf = ciphertext.to_vec();
        for block in buf.chunks_exact_mut(AES_BLOCK) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > PAD_BLOCK || !buf[buf.len() - pad..].iter().all(|b| *b as usize == pad) {
            return Err(StashError::Crypto("invalid packet padding".into()));
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }

    fn max_plaintext_len(&self) -> usize {
        (MAX_PACKET_LEN / PAD_BLOCK) * PAD_BLOCK - 1
    }
}

/// AES-256-GCM keyed by SHA-256 of the shared secret; `nonce || sealed`
pub struct AeadCipher {
    cipher: Aes256Gcm,
}

impl AeadCipher {
    pub fn new(shared_secret: &[u8; 32]) -> Result<Self> {
        let key = Sha256::new()
            .chain_update(KDF_LABEL)
            .chain_update(shared_secret)
            .finalize();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| StashError::Crypto(e.to_string()))?;
        Ok(Self { cipher })
    }
}

impl PacketCipher for AeadCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StashError::Crypto("packet encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(StashError::Crypto("sealed packet too short".into()));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StashError::Crypto("packet failed authentication".into()))
    }

    fn max_plaintext_len(&self) -> usize {
        MAX_PACKET_LEN - NONCE_LEN - TAG_LEN
    }
}

/// Length-framed encrypted packet stream
pub struct SecureChannel<S> {
    stream: S,
    cipher: Box<dyn PacketCipher>,
    read_timeout: Option<Duration>,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the key exchange on a freshly connected stream. Both peers send
    /// their public key first, so the call is symmetric.
    pub async fn establish(mut stream: S, suite: CipherSuite, read_timeout: Option<Duration>) -> Result<Self> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        stream.write_all(hex::encode(public.as_bytes()).as_bytes()).await?;
        stream.flush().await?;

        let mut peer_hex = [0u8; PUBLIC_KEY_HEX_LEN];
        read_exact_within(&mut stream, &mut peer_hex, read_timeout).await?;
        let mut peer = [0u8; 32];
        hex::decode_to_slice(peer_hex, &mut peer)
            .map_err(|e| StashError::Protocol(format!("invalid public key from peer: {}", e)))?;

        let shared = secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(StashError::Crypto("peer sent a low-order public key".into()));
        }
        tracing::debug!("key exchange complete ({} cipher)", suite);
        Ok(Self::with_cipher(stream, suite.cipher(shared.as_bytes())?, read_timeout))
    }

    /// Wrap a stream with an already agreed cipher
    pub fn with_cipher(stream: S, cipher: Box<dyn PacketCipher>, read_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            cipher,
            read_timeout,
        }
    }

    pub fn max_plaintext_len(&self) -> usize {
        self.cipher.max_plaintext_len()
    }

    /// Encrypt and send one packet
    pub async fn send_packet(&mut self, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.cipher.encrypt(plaintext)?;
        if ciphertext.len() > MAX_PACKET_LEN {
            return Err(StashError::Protocol(format!(
                "packet of {} bytes exceeds the {}-byte frame limit",
                ciphertext.len(),
                MAX_PACKET_LEN
            )));
        }
        let mut frame = Vec::with_capacity(LENGTH_DIGITS + ciphertext.len());
        frame.extend_from_slice(format!("{:04}", ciphertext.len()).as_bytes());
        frame.extend_from_slice(&ciphertext);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly one packet and decrypt it
    pub async fn recv_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; LENGTH_DIGITS];
        read_exact_within(&mut self.stream, &mut header, self.read_timeout).await?;
        let len = parse_length(&header)?;
        let mut ciphertext = vec![0u8; len];
        read_exact_within(&mut self.stream, &mut ciphertext, self.read_timeout).await?;
        self.cipher.decrypt(&ciphertext)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn parse_length(header: &[u8]) -> Result<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(StashError::Protocol(format!("invalid packet length {:?}", header)));
    }
    header
        .iter()
        .try_fold(0usize, |acc, d| Some(acc * 10 + (d - b'0') as usize))
        .filter(|len| *len > 0)
        .ok_or_else(|| StashError::Protocol("empty packet".into()))
}

async fn read_exact_within<S>(stream: &mut S, buf: &mut [u8], timeout: Option<Duration>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, stream.read_exact(buf))
            .await
            .map_err(|_| StashError::Timeout)?,
        None => stream.read_exact(buf).await,
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(StashError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}
