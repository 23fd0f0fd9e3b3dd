//! Artifact encryption.
//!
//! AES in CBC (PKCS#7) or CTR mode over the block primitive, keyed from
//! the master key file: the file holds the base64 key material, the working
//! key is its SHA-256 digest truncated to the algorithm's key length. A
//! random IV prefixes each ciphertext. Encrypted artifacts carry the `.aes`
//! suffix.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::Engine;
use pgharbor_config::Encryption;
use pgharbor_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

const BLOCK: usize = 16;

/// An artifact cipher.
pub trait Cipher: Send + Sync {
    /// Algorithm tag.
    fn name(&self) -> &'static str;

    /// File suffix for encrypted artifacts; empty for none.
    fn suffix(&self) -> &'static str;

    /// Encrypt a buffer. The IV is generated and prepended.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a buffer produced by `encrypt`.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through cipher.
pub struct NoCipher;

impl Cipher for NoCipher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn suffix(&self) -> &'static str {
        ""
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

enum AnyAes {
    A128(Aes128),
    A192(Aes192),
    A256(Aes256),
}

impl AnyAes {
    fn new(key: &[u8]) -> AnyAes {
        match key.len() {
            16 => AnyAes::A128(Aes128::new(GenericArray::from_slice(key))),
            24 => AnyAes::A192(Aes192::new(GenericArray::from_slice(key))),
            32 => AnyAes::A256(Aes256::new(GenericArray::from_slice(key))),
            other => unreachable!("unsupported AES key length {}", other),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; BLOCK]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AnyAes::A128(c) => c.encrypt_block(block),
            AnyAes::A192(c) => c.encrypt_block(block),
            AnyAes::A256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; BLOCK]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AnyAes::A128(c) => c.decrypt_block(block),
            AnyAes::A192(c) => c.decrypt_block(block),
            AnyAes::A256(c) => c.decrypt_block(block),
        }
    }
}

enum Mode {
    Cbc,
    Ctr,
}

/// AES cipher in the configured mode and key size.
pub struct AesCipher {
    aes: AnyAes,
    mode: Mode,
    name: &'static str,
}

impl AesCipher {
    /// Build from the configured algorithm and raw master key material.
    pub fn new(encryption: Encryption, master_key: &[u8]) -> Result<AesCipher> {
        let (mode, name) = match encryption {
            Encryption::None => return Err(Error::config("AES cipher requested with none")),
            Encryption::Aes128Cbc => (Mode::Cbc, "aes-128-cbc"),
            Encryption::Aes192Cbc => (Mode::Cbc, "aes-192-cbc"),
            Encryption::Aes256Cbc => (Mode::Cbc, "aes-256-cbc"),
            Encryption::Aes128Ctr => (Mode::Ctr, "aes-128-ctr"),
            Encryption::Aes192Ctr => (Mode::Ctr, "aes-192-ctr"),
            Encryption::Aes256Ctr => (Mode::Ctr, "aes-256-ctr"),
        };
        let digest = Sha256::digest(master_key);
        let key = &digest[..encryption.key_len()];
        Ok(AesCipher {
            aes: AnyAes::new(key),
            mode,
            name,
        })
    }

    fn keystream_xor(&self, iv: &[u8; BLOCK], data: &mut [u8]) {
        let counter_base = u128::from_be_bytes(*iv);
        for (i, chunk) in data.chunks_mut(BLOCK).enumerate() {
            let mut block = counter_base.wrapping_add(i as u128).to_be_bytes();
            self.aes.encrypt_block(&mut block);
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }
}

impl Cipher for AesCipher {
    fn name(&self) -> &'static str {
        self.name
    }

    fn suffix(&self) -> &'static str {
        "aes"
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let iv: [u8; BLOCK] = rand::random();
        let mut out = Vec::with_capacity(BLOCK + data.len() + BLOCK);
        out.extend_from_slice(&iv);

        match self.mode {
            Mode::Ctr => {
                let mut body = data.to_vec();
                self.keystream_xor(&iv, &mut body);
                out.extend_from_slice(&body);
            }
            Mode::Cbc => {
                // PKCS#7: always pad, a full block when already aligned.
                let pad = BLOCK - data.len() % BLOCK;
                let mut prev = iv;
                for chunk in data.chunks(BLOCK) {
                    let mut block = [pad as u8; BLOCK];
                    block[..chunk.len()].copy_from_slice(chunk);
                    if chunk.len() == BLOCK {
                        // Full block: padding applies to a later block.
                        for (b, p) in block.iter_mut().zip(prev.iter()) {
                            *b ^= p;
                        }
                        self.aes.encrypt_block(&mut block);
                        out.extend_from_slice(&block);
                        prev = block;
                        continue;
                    }
                    // Final short block, padded.
                    for (b, p) in block.iter_mut().zip(prev.iter()) {
                        *b ^= p;
                    }
                    self.aes.encrypt_block(&mut block);
                    out.extend_from_slice(&block);
                    prev = block;
                }
                if data.len() % BLOCK == 0 {
                    // Trailing all-padding block.
                    let mut block = [BLOCK as u8; BLOCK];
                    for (b, p) in block.iter_mut().zip(prev.iter()) {
                        *b ^= p;
                    }
                    self.aes.encrypt_block(&mut block);
                    out.extend_from_slice(&block);
                }
            }
        }
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < BLOCK {
            return Err(Error::format("ciphertext shorter than the IV"));
        }
        let iv: [u8; BLOCK] = data[..BLOCK].try_into().unwrap();
        let body = &data[BLOCK..];

        match self.mode {
            Mode::Ctr => {
                let mut out = body.to_vec();
                self.keystream_xor(&iv, &mut out);
                Ok(out)
            }
            Mode::Cbc => {
                if body.is_empty() || body.len() % BLOCK != 0 {
                    return Err(Error::format("CBC ciphertext is not block aligned"));
                }
                let mut out = Vec::with_capacity(body.len());
                let mut prev = iv;
                for chunk in body.chunks(BLOCK) {
                    let ct: [u8; BLOCK] = chunk.try_into().unwrap();
                    let mut block = ct;
                    self.aes.decrypt_block(&mut block);
                    for (b, p) in block.iter_mut().zip(prev.iter()) {
                        *b ^= p;
                    }
                    out.extend_from_slice(&block);
                    prev = ct;
                }
                let pad = *out.last().unwrap() as usize;
                if pad == 0 || pad > BLOCK || pad > out.len() {
                    return Err(Error::format("bad CBC padding"));
                }
                if out[out.len() - pad..].iter().any(|&b| b as usize != pad) {
                    return Err(Error::format("bad CBC padding"));
                }
                out.truncate(out.len() - pad);
                Ok(out)
            }
        }
    }
}

/// Build the configured cipher, loading the master key when needed.
pub fn for_encryption(encryption: Encryption, master_key_path: &Path) -> Result<Box<dyn Cipher>> {
    if encryption == Encryption::None {
        return Ok(Box::new(NoCipher));
    }
    let key = load_master_key(master_key_path)?;
    Ok(Box::new(AesCipher::new(encryption, &key)?))
}

/// Load and decode the base64 master key file.
pub fn load_master_key(path: &Path) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| Error::auth(format!("master key not found at {}", path.display())))?;
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|_| Error::auth("master key file is not valid base64"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cipher(encryption: Encryption) -> AesCipher {
        AesCipher::new(encryption, b"test master key material").unwrap()
    }

    #[test]
    fn test_ctr_roundtrip_all_sizes() {
        let c = cipher(Encryption::Aes256Ctr);
        for len in [0, 1, 15, 16, 17, 1000] {
            let data = vec![0x5A; len];
            let encrypted = c.encrypt(&data).unwrap();
            assert_eq!(encrypted.len(), BLOCK + len);
            assert_eq!(c.decrypt(&encrypted).unwrap(), data);
        }
    }

    #[test]
    fn test_cbc_roundtrip_all_sizes() {
        for encryption in [
            Encryption::Aes128Cbc,
            Encryption::Aes192Cbc,
            Encryption::Aes256Cbc,
        ] {
            let c = cipher(encryption);
            for len in [0, 1, 15, 16, 17, 1000] {
                let data = vec![0xC3; len];
                let encrypted = c.encrypt(&data).unwrap();
                assert_eq!(c.decrypt(&encrypted).unwrap(), data, "len {}", len);
            }
        }
    }

    #[test]
    fn test_ciphertexts_differ_by_iv() {
        let c = cipher(Encryption::Aes256Cbc);
        let a = c.encrypt(b"same plaintext").unwrap();
        let b = c.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let c = cipher(Encryption::Aes256Ctr);
        let data = vec![0u8; 64];
        let encrypted = c.encrypt(&data).unwrap();
        assert_ne!(&encrypted[BLOCK..], &data[..]);
    }

    #[test]
    fn test_wrong_key_fails_cbc_padding() {
        let good = cipher(Encryption::Aes256Cbc);
        let bad = AesCipher::new(Encryption::Aes256Cbc, b"a different key").unwrap();
        let encrypted = good.encrypt(b"some artifact bytes").unwrap();
        // Either padding breaks or the plaintext differs.
        match bad.decrypt(&encrypted) {
            Ok(plain) => assert_ne!(plain, b"some artifact bytes"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_master_key_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");

        let err = load_master_key(&path).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        std::fs::write(
            &path,
            base64::engine::general_purpose::STANDARD.encode(b"key material"),
        )
        .unwrap();
        assert_eq!(load_master_key(&path).unwrap(), b"key material");

        std::fs::write(&path, "!!! not base64 !!!").unwrap();
        assert!(load_master_key(&path).is_err());
    }

    #[test]
    fn test_no_cipher_passthrough() {
        let c = NoCipher;
        assert_eq!(c.encrypt(b"data").unwrap(), b"data");
        assert_eq!(c.suffix(), "");
    }
}
