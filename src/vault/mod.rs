//! Credential vault.
//!
//! Per-source secrets arrive as base64 ciphertexts produced by a
//! deterministic multi-round chain of ECB block ciphers whose key/cipher
//! schedule is drawn from a seeded PRNG. Unwrapping uses the local master key
//! (`dbkey`) and the source UUID as salt; the chain must stay bit-identical
//! to keep existing stored secrets decryptable.
//!
//! Schedule derivation:
//! 1. `K1 = PBKDF2-HMAC-SHA1(master_key, source_uuid, 1000 rounds, 32 bytes)`
//! 2. `K2 = PBKDF2-HMAC-SHA1(K1[0..16], K1[16..32], 1000 rounds, 32 bytes)`
//! 3. `K3 = K1[0..16] ∥ K2[16..32]`
//! 4. `K4` interleaves 2-byte pairs: 4-aligned offsets from K1, others from K2
//! 5. Seed the PRNG with K1, draw one bit; reseed with `K1∥K2∥K4` on 1,
//!    `K4∥K2∥K1` on 0
//! 6. Draw `rounds` pairs `(key index 0..=3, cipher index 0..=2)`; both lists
//!    are reversed for decryption
//! 7. Ciphers: AES-256-ECB, 3DES-EDE3-ECB (key truncated to 24 bytes),
//!    Blowfish-ECB

mod prng;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};
use hmac::Hmac;
use sha1::Sha1;

use crate::error::VaultError;
use prng::PyRandom;

/// Chain length for production secrets.
pub const DEFAULT_ROUNDS: usize = 2000;

const PBKDF2_ROUNDS: u32 = 1000;

/// Unwrap a stored secret with the default round count.
pub fn decrypt_secret(
    ciphertext: &str,
    master_key: &str,
    source_uuid: &str,
) -> Result<String, VaultError> {
    decrypt_with_rounds(ciphertext, master_key, source_uuid, DEFAULT_ROUNDS)
}

/// Unwrap a stored secret. Decryption applies the schedule in reverse.
pub fn decrypt_with_rounds(
    ciphertext: &str,
    master_key: &str,
    source_uuid: &str,
    rounds: usize,
) -> Result<String, VaultError> {
    let schedule = Schedule::derive(master_key, source_uuid, rounds)?;
    let mut buf = B64.decode(ciphertext.trim().as_bytes())?;

    for i in (0..rounds).rev() {
        apply_round(&schedule, i, &mut buf, Direction::Decrypt)?;
    }

    // The inner payload is base64 padded out to the widest block size.
    let trimmed = trim_ascii_whitespace(&buf);
    let plain = B64.decode(trimmed)?;
    Ok(String::from_utf8(plain)?)
}

/// Wrap a secret with the default round count. The remote side performs this
/// before shipping credentials; it lives here so the chain is verifiable
/// end-to-end.
pub fn encrypt_secret(
    plaintext: &str,
    master_key: &str,
    source_uuid: &str,
) -> Result<String, VaultError> {
    encrypt_with_rounds(plaintext, master_key, source_uuid, DEFAULT_ROUNDS)
}

/// Wrap a secret: base64 the payload, pad to the AES block size with
/// newlines, then apply the schedule in generation order.
pub fn encrypt_with_rounds(
    plaintext: &str,
    master_key: &str,
    source_uuid: &str,
    rounds: usize,
) -> Result<String, VaultError> {
    let schedule = Schedule::derive(master_key, source_uuid, rounds)?;
    let mut buf = B64.encode(plaintext.as_bytes()).into_bytes();
    while buf.len() % 16 != 0 {
        buf.push(b'\n');
    }

    for i in 0..rounds {
        apply_round(&schedule, i, &mut buf, Direction::Encrypt)?;
    }

    Ok(B64.encode(&buf))
}

/// Decrypt on the blocking pool; the chain is CPU-bound and must not stall
/// the cooperative scheduler.
pub async fn decrypt_secret_blocking(
    ciphertext: String,
    master_key: String,
    source_uuid: String,
) -> Result<String, VaultError> {
    tokio::task::spawn_blocking(move || decrypt_secret(&ciphertext, &master_key, &source_uuid))
        .await
        .map_err(|e| VaultError::KeyDerivation(format!("decrypt task panicked: {e}")))?
}

struct Schedule {
    keys: [[u8; 32]; 4],
    key_seq: Vec<u8>,
    cipher_seq: Vec<u8>,
}

impl Schedule {
    fn derive(master_key: &str, source_uuid: &str, rounds: usize) -> Result<Self, VaultError> {
        let k1 = pbkdf2_sha1(master_key.as_bytes(), source_uuid.as_bytes())?;
        let k2 = pbkdf2_sha1(&k1[..16], &k1[16..32])?;

        let mut k3 = [0u8; 32];
        k3[..16].copy_from_slice(&k1[..16]);
        k3[16..].copy_from_slice(&k2[16..32]);

        let mut k4 = [0u8; 32];
        for index in (0..32).step_by(2) {
            let pair = if index % 4 == 0 { &k1 } else { &k2 };
            k4[index..index + 2].copy_from_slice(&pair[index..index + 2]);
        }

        let mut rng = PyRandom::seed_bytes(&k1);
        let mut reseed = Vec::with_capacity(96);
        if rng.randint0(1) == 1 {
            reseed.extend_from_slice(&k1);
            reseed.extend_from_slice(&k2);
            reseed.extend_from_slice(&k4);
        } else {
            reseed.extend_from_slice(&k4);
            reseed.extend_from_slice(&k2);
            reseed.extend_from_slice(&k1);
        }
        let mut rng = PyRandom::seed_bytes(&reseed);

        let mut key_seq = Vec::with_capacity(rounds);
        let mut cipher_seq = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            key_seq.push(rng.randint0(3) as u8);
            cipher_seq.push(rng.randint0(2) as u8);
        }

        Ok(Self {
            keys: [k1, k2, k3, k4],
            key_seq,
            cipher_seq,
        })
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

fn process_blocks<C>(cipher: &C, buf: &mut [u8], dir: Direction)
where
    C: BlockEncrypt + BlockDecrypt + BlockSizeUser,
{
    for block in buf.chunks_exact_mut(C::block_size()) {
        let block = GenericArray::from_mut_slice(block);
        match dir {
            Direction::Encrypt => cipher.encrypt_block(block),
            Direction::Decrypt => cipher.decrypt_block(block),
        }
    }
}

fn apply_round(
    schedule: &Schedule,
    round: usize,
    buf: &mut [u8],
    dir: Direction,
) -> Result<(), VaultError> {
    let key = &schedule.keys[schedule.key_seq[round] as usize];
    match schedule.cipher_seq[round] {
        0 => {
            check_alignment("AES", buf.len(), 16)?;
            let cipher = aes::Aes256::new_from_slice(key)
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
            process_blocks(&cipher, buf, dir);
        }
        1 => {
            check_alignment("3DES", buf.len(), 8)?;
            let cipher = des::TdesEde3::new_from_slice(&key[..24])
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
            process_blocks(&cipher, buf, dir);
        }
        _ => {
            check_alignment("Blowfish", buf.len(), 8)?;
            let cipher = blowfish::Blowfish::<byteorder::BE>::new_from_slice(key)
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
            process_blocks(&cipher, buf, dir);
        }
    }
    Ok(())
}

fn check_alignment(cipher: &'static str, len: usize, block: usize) -> Result<(), VaultError> {
    if len == 0 || len % block != 0 {
        return Err(VaultError::BlockAlignment { cipher, len });
    }
    Ok(())
}

fn pbkdf2_sha1(password: &[u8], salt: &[u8]) -> Result<[u8; 32], VaultError> {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, PBKDF2_ROUNDS, &mut out)
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

fn trim_ascii_whitespace(buf: &[u8]) -> &[u8] {
    let start = buf
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &buf[start..end]
}
