//! Parameters shared by every header family.

use crate::config::FormatDefaults;
use crate::error::{errno, CryptError, CryptResult};
use crate::keyfile::read_key_file;
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

pub const DEFAULT_CIPHER: &str = "aes";
pub const DEFAULT_CIPHER_MODE: &str = "xts-plain64";
pub const DEFAULT_VOLUME_KEY_SIZE: usize = 32;

/// Cipher selection and volume key material for `format`.
///
/// `volume_key: None` asks the backend to generate a fresh key of
/// `volume_key_size` bytes.
#[derive(Clone, Default)]
pub struct GenericParams {
    pub cipher: String,
    pub cipher_mode: String,
    pub uuid: Option<String>,
    pub volume_key: Option<Zeroizing<Vec<u8>>>,
    pub volume_key_size: usize,
}

impl GenericParams {
    pub fn new(cipher: impl Into<String>, cipher_mode: impl Into<String>, volume_key_size: usize) -> Self {
        Self {
            cipher: cipher.into(),
            cipher_mode: cipher_mode.into(),
            uuid: None,
            volume_key: None,
            volume_key_size,
        }
    }

    pub fn with_volume_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = Zeroizing::new(key.into());
        if self.volume_key_size == 0 {
            self.volume_key_size = key.len();
        }
        self.volume_key = Some(key);
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Read the volume key from `path` (raw or hex encoded).
    pub fn with_volume_key_file(mut self, path: &Path) -> CryptResult<Self> {
        let expected = (self.volume_key_size != 0).then_some(self.volume_key_size);
        let (key, _) = read_key_file(path, expected)?;
        if self.volume_key_size == 0 {
            self.volume_key_size = key.len();
        }
        self.volume_key = Some(key);
        Ok(self)
    }

    /// Fill empty fields with built-in defaults. Applying it twice is the
    /// same as applying it once.
    pub fn fill_defaults(&mut self) {
        self.fill_defaults_from(&FormatDefaults::default());
    }

    pub fn fill_defaults_from(&mut self, defaults: &FormatDefaults) {
        if self.cipher.is_empty() {
            self.cipher = defaults.cipher.clone();
        }
        if self.cipher_mode.is_empty() {
            self.cipher_mode = defaults.cipher_mode.clone();
        }
        if self.volume_key_size == 0 {
            self.volume_key_size = match &self.volume_key {
                Some(key) => key.len(),
                None => defaults.volume_key_size,
            };
        }
    }

    /// `cipher-mode` as the kernel and `cryptsetup` spell it.
    pub fn cipher_spec(&self) -> String {
        format!("{}-{}", self.cipher, self.cipher_mode)
    }

    /// Reject parameters no header could be written with.
    pub fn validate(&self) -> CryptResult<()> {
        if self.volume_key_size == 0 {
            return Err(invalid("crypt_format"));
        }
        if let Some(key) = &self.volume_key {
            if key.len() != self.volume_key_size {
                log::debug!(
                    "volume key is {} bytes but {} were requested",
                    key.len(),
                    self.volume_key_size
                );
                return Err(invalid("crypt_format"));
            }
        }
        if let Some(uuid) = &self.uuid {
            if uuid::Uuid::parse_str(uuid).is_err() {
                log::debug!("rejecting malformed uuid '{uuid}'");
                return Err(invalid("crypt_format"));
            }
        }
        Ok(())
    }
}

fn invalid(function: &'static str) -> CryptError {
    CryptError::Native {
        function,
        code: -errno::EINVAL,
    }
}

impl fmt::Debug for GenericParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericParams")
            .field("cipher", &self.cipher)
            .field("cipher_mode", &self.cipher_mode)
            .field("uuid", &self.uuid)
            .field("volume_key", &self.volume_key.as_ref().map(|_| "<redacted>"))
            .field("volume_key_size", &self.volume_key_size)
            .finish()
    }
}
