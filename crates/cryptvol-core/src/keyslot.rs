//! Keyslot selection and management.

use crate::backend::CryptBackend;
use crate::device::CryptDevice;
use crate::error::{errno, CryptError, CryptResult};
use crate::variant::Operation;
use std::fmt;
use zeroize::Zeroizing;

/// Keyslot selector; `Any` lets the backend choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyslot {
    Any,
    Index(u32),
}

impl Keyslot {
    /// Native sentinel for "any keyslot".
    pub const ANY_RAW: i32 = -1;

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            Self::ANY_RAW => Some(Keyslot::Any),
            n if n >= 0 => Some(Keyslot::Index(n as u32)),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Keyslot::Any => Self::ANY_RAW,
            Keyslot::Index(n) => n as i32,
        }
    }

    pub fn index(self) -> Option<u32> {
        match self {
            Keyslot::Any => None,
            Keyslot::Index(n) => Some(n),
        }
    }
}

impl From<u32> for Keyslot {
    fn from(index: u32) -> Self {
        Keyslot::Index(index)
    }
}

impl fmt::Display for Keyslot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keyslot::Any => f.write_str("any"),
            Keyslot::Index(n) => write!(f, "{n}"),
        }
    }
}

/// Volume key recovered from a keyslot. Zeroed on drop.
pub struct VolumeKey {
    pub key: Zeroizing<Vec<u8>>,
    pub keyslot: u32,
}

impl VolumeKey {
    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeKey")
            .field("key", &format_args!("<{} bytes redacted>", self.key.len()))
            .field("keyslot", &self.keyslot)
            .finish()
    }
}

/// Keyslot operations borrowed from a [`CryptDevice`].
pub struct KeyslotManager<'a, B: CryptBackend> {
    device: &'a mut CryptDevice<B>,
}

impl<'a, B: CryptBackend> KeyslotManager<'a, B> {
    pub(crate) fn new(device: &'a mut CryptDevice<B>) -> Self {
        Self { device }
    }

    /// Protect the volume key with `passphrase` in a new keyslot. `None`
    /// uses the key cached by `format`. Returns the slot written.
    pub fn add_by_volume_key(
        &mut self,
        keyslot: Keyslot,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> CryptResult<u32> {
        const FUNCTION: &str = "crypt_keyslot_add_by_volume_key";
        self.device
            .ensure_supported(FUNCTION, Operation::KeyslotAddByVolumeKey)?;
        let slot = self.device.call(FUNCTION, |backend, context| {
            backend.keyslot_add_by_volume_key(context, keyslot, volume_key, passphrase)
        })?;
        log::info!("added keyslot {slot} from volume key");
        Ok(slot)
    }

    /// Add `new_passphrase` after `passphrase` unlocks an existing slot.
    pub fn add_by_passphrase(
        &mut self,
        keyslot: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> CryptResult<u32> {
        const FUNCTION: &str = "crypt_keyslot_add_by_passphrase";
        self.device
            .ensure_supported(FUNCTION, Operation::KeyslotAddByPassphrase)?;
        let slot = self.device.call(FUNCTION, |backend, context| {
            backend.keyslot_add_by_passphrase(context, keyslot, passphrase, new_passphrase)
        })?;
        log::info!("added keyslot {slot} from passphrase");
        Ok(slot)
    }

    /// Replace the passphrase in `current`, moving it to `new` when the
    /// slots differ. Either everything changes or nothing does.
    pub fn change_by_passphrase(
        &mut self,
        current: Keyslot,
        new: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> CryptResult<u32> {
        const FUNCTION: &str = "crypt_keyslot_change_by_passphrase";
        self.device
            .ensure_supported(FUNCTION, Operation::KeyslotChangeByPassphrase)?;
        let slot = self.device.call(FUNCTION, |backend, context| {
            backend.keyslot_change_by_passphrase(context, current, new, passphrase, new_passphrase)
        })?;
        log::info!("changed passphrase from keyslot {current} into {slot}");
        Ok(slot)
    }

    /// Recover the volume key through `keyslot`.
    pub fn volume_key_get(&mut self, keyslot: Keyslot, passphrase: &[u8]) -> CryptResult<VolumeKey> {
        let size = self.device.volume_key_size();
        let mut key = Zeroizing::new(Vec::new());
        key.try_reserve_exact(size).map_err(|_| CryptError::Native {
            function: "malloc",
            code: -errno::ENOMEM,
        })?;

        let slot = self.device.call("crypt_volume_key_get", |backend, context| {
            backend.volume_key_get(context, keyslot, passphrase, &mut key)
        })?;
        Ok(VolumeKey { key, keyslot: slot })
    }
}
