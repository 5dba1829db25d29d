use crate::backend::{NativeResult, NativeStatus};
use crate::error::errno;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

pub(crate) const SALT_LEN: usize = 32;
pub(crate) const DIGEST_LEN: usize = 32;

pub(crate) fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// PBKDF2-HMAC-SHA256 of `secret` stretched to `len` bytes.
pub(crate) fn derive(secret: &[u8], salt: &[u8], iterations: u32, len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    pbkdf2_hmac::<Sha256>(secret, salt, iterations.max(1), &mut out);
    out
}

/// XOR `data` with `pad`; both must be the same length.
pub(crate) fn xor(data: &[u8], pad: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(data.iter().zip(pad).map(|(a, b)| a ^ b).collect())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Key for a headerless mapping: the passphrase hashed in rounds, each round
/// prefixed with one more 'A', until `len` bytes are available. `plain`
/// uses the passphrase bytes directly, zero padded.
pub(crate) fn plain_key(passphrase: &[u8], hash: &str, len: usize) -> NativeResult<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(Vec::with_capacity(len));
    match hash {
        "plain" => {
            key.extend_from_slice(&passphrase[..passphrase.len().min(len)]);
            key.resize(len, 0);
        }
        "sha256" | "sha512" => {
            let mut round = 0usize;
            while key.len() < len {
                let block = hash_round(hash, round, passphrase);
                let take = (len - key.len()).min(block.len());
                key.extend_from_slice(&block[..take]);
                round += 1;
            }
        }
        other => {
            log::debug!("hash '{other}' is not available for plain mappings");
            return Err(NativeStatus::from_errno(errno::EINVAL));
        }
    }
    Ok(key)
}

pub(crate) fn plain_hash_supported(hash: &str) -> bool {
    matches!(hash, "plain" | "sha256" | "sha512")
}

fn hash_round(hash: &str, round: usize, passphrase: &[u8]) -> Zeroizing<Vec<u8>> {
    let prefix = vec![b'A'; round];
    if hash == "sha512" {
        let mut hasher = Sha512::new();
        hasher.update(&prefix);
        hasher.update(passphrase);
        Zeroizing::new(hasher.finalize().to_vec())
    } else {
        let mut hasher = Sha256::new();
        hasher.update(&prefix);
        hasher.update(passphrase);
        Zeroizing::new(hasher.finalize().to_vec())
    }
}
