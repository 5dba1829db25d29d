//! Key material files: volume keys and passphrases read from disk, and secret
//! files staged with restrictive permissions.

use crate::error::{CryptError, CryptResult};
use hex::FromHex;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Decoded key bytes plus whether the file was hex encoded.
pub type DecodedKey = (Zeroizing<Vec<u8>>, bool);

/// Read bytes from `path` and decode them into raw key material.
pub fn read_key_file(path: &Path, expected_len: Option<usize>) -> CryptResult<DecodedKey> {
    let contents = Zeroizing::new(fs::read(path)?);
    decode_key_bytes(path, &contents, expected_len)
}

/// Decode raw bytes into key material.
///
/// Input of exactly `expected_len` bytes is taken verbatim. Anything else must
/// be hex (whitespace ignored) and decode to `expected_len` bytes when a length
/// is given.
pub fn decode_key_bytes(
    origin: &Path,
    bytes: &[u8],
    expected_len: Option<usize>,
) -> CryptResult<DecodedKey> {
    if bytes.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }

    if expected_len == Some(bytes.len()) {
        return Ok((Zeroizing::new(bytes.to_vec()), false));
    }

    let mut filtered = Zeroizing::new(Vec::with_capacity(bytes.len()));
    for byte in bytes {
        if byte.is_ascii_whitespace() {
            continue;
        }
        if !byte.is_ascii_hexdigit() {
            if expected_len.is_none() {
                return Ok((Zeroizing::new(bytes.to_vec()), false));
            }
            return Err(invalid_key(
                origin,
                format!("found non-hex byte 0x{byte:02x}"),
            ));
        }
        filtered.push(*byte);
    }

    if filtered.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }

    if filtered.len() % 2 != 0 {
        return Err(invalid_key(
            origin,
            format!("hex key has an odd number of digits ({})", filtered.len()),
        ));
    }

    let key = Zeroizing::new(
        Vec::from_hex(&filtered[..])
            .map_err(|err| invalid_key(origin, format!("hex decode failed: {err}")))?,
    );

    if let Some(expected) = expected_len {
        if key.len() != expected {
            return Err(invalid_key(
                origin,
                format!("decoded key must be {expected} bytes (got {})", key.len()),
            ));
        }
    }

    Ok((key, true))
}

/// Read a passphrase file. A single trailing newline is dropped.
pub fn read_passphrase_file(path: &Path) -> CryptResult<Zeroizing<Vec<u8>>> {
    let mut contents = Zeroizing::new(fs::read(path)?);
    if contents.last() == Some(&b'\n') {
        contents.pop();
        if contents.last() == Some(&b'\r') {
            contents.pop();
        }
    }
    if contents.is_empty() {
        return Err(invalid_key(path, "passphrase file is empty"));
    }
    Ok(contents)
}

/// Write secret bytes to `path`, readable by the owner only.
pub fn write_secret_file(path: &Path, secret: &[u8]) -> CryptResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret)?;
    file.sync_all()?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> CryptError {
    CryptError::InvalidKeyFile {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
