//! LUKS2 tokens: JSON records that tell external handlers how to unlock
//! which keyslots.

use crate::backend::{CryptBackend, NativeStatus};
use crate::device::CryptDevice;
use crate::error::{errno, CryptError, CryptResult};
use crate::keyslot::Keyslot;
use crate::variant::{DeviceKind, Operation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token type of kernel keyring tokens.
pub const KEYRING_TOKEN_TYPE: &str = "luks2-keyring";

/// Token selector; `Any` lets the backend choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenTarget {
    Any,
    Id(u32),
}

impl TokenTarget {
    /// Native sentinel for "any token".
    pub const ANY_RAW: i32 = -1;

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            Self::ANY_RAW => Some(TokenTarget::Any),
            n if n >= 0 => Some(TokenTarget::Id(n as u32)),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            TokenTarget::Any => Self::ANY_RAW,
            TokenTarget::Id(n) => n as i32,
        }
    }

    pub fn id(self) -> Option<u32> {
        match self {
            TokenTarget::Any => None,
            TokenTarget::Id(n) => Some(n),
        }
    }
}

impl From<u32> for TokenTarget {
    fn from(id: u32) -> Self {
        TokenTarget::Id(id)
    }
}

impl fmt::Display for TokenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenTarget::Any => f.write_str("any"),
            TokenTarget::Id(n) => write!(f, "{n}"),
        }
    }
}

/// Parameters of a `luks2-keyring` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringTokenParams {
    pub key_description: String,
}

#[derive(Serialize, Deserialize)]
struct KeyringTokenJson {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    keyslots: Vec<String>,
    key_description: String,
}

/// Number of token ids a header family can hold.
pub fn token_max(kind: DeviceKind) -> CryptResult<u32> {
    match kind.token_count() {
        0 => Err(CryptError::native(
            "crypt_token_max",
            NativeStatus::from_errno(errno::EINVAL),
        )),
        count => Ok(count),
    }
}

/// Token operations borrowed from a [`CryptDevice`]. LUKS2 only.
pub struct TokenManager<'a, B: CryptBackend> {
    device: &'a mut CryptDevice<B>,
}

impl<'a, B: CryptBackend> TokenManager<'a, B> {
    pub(crate) fn new(device: &'a mut CryptDevice<B>) -> Self {
        Self { device }
    }

    pub fn json_get(&mut self, token: u32) -> CryptResult<String> {
        const FUNCTION: &str = "crypt_token_json_get";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        self.device.call(FUNCTION, |backend, context| {
            backend.token_json_get(context, token)
        })
    }

    /// Store `json` and return the id it landed in. `Any` picks the lowest
    /// free id.
    pub fn json_set(&mut self, token: TokenTarget, json: &str) -> CryptResult<u32> {
        const FUNCTION: &str = "crypt_token_json_set";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        let id = self.device.call(FUNCTION, |backend, context| {
            backend.token_json_set(context, token, Some(json))
        })?;
        log::debug!("stored token {id}");
        Ok(id)
    }

    pub fn remove(&mut self, token: u32) -> CryptResult<()> {
        const FUNCTION: &str = "crypt_token_json_set";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        self.device.call(FUNCTION, |backend, context| {
            backend.token_json_set(context, TokenTarget::Id(token), None)
        })?;
        log::debug!("removed token {token}");
        Ok(())
    }

    pub fn assign_keyslot(&mut self, token: TokenTarget, keyslot: Keyslot) -> CryptResult<()> {
        const FUNCTION: &str = "crypt_token_assign_keyslot";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        self.device.call(FUNCTION, |backend, context| {
            backend.token_assign_keyslot(context, token, keyslot)
        })
    }

    pub fn unassign_keyslot(&mut self, token: TokenTarget, keyslot: Keyslot) -> CryptResult<()> {
        const FUNCTION: &str = "crypt_token_unassign_keyslot";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        self.device.call(FUNCTION, |backend, context| {
            backend.token_unassign_keyslot(context, token, keyslot)
        })
    }

    /// `Ok(())` when `token` is assigned to `keyslot`.
    pub fn is_assigned(&mut self, token: u32, keyslot: u32) -> CryptResult<()> {
        const FUNCTION: &str = "crypt_token_is_assigned";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        self.device.call(FUNCTION, |backend, context| {
            backend.token_is_assigned(context, token, keyslot)
        })
    }

    pub fn luks2_keyring_get(&mut self, token: u32) -> CryptResult<KeyringTokenParams> {
        const FUNCTION: &str = "crypt_token_luks2_keyring_get";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        let json = self.device.call(FUNCTION, |backend, context| {
            backend.token_json_get(context, token)
        })?;
        let parsed: KeyringTokenJson = serde_json::from_str(&json).map_err(|err| {
            log::debug!("token {token} is not a keyring token: {err}");
            CryptError::native(FUNCTION, NativeStatus::from_errno(errno::EINVAL))
        })?;
        if parsed.kind != KEYRING_TOKEN_TYPE {
            return Err(CryptError::native(
                FUNCTION,
                NativeStatus::from_errno(errno::EINVAL),
            ));
        }
        Ok(KeyringTokenParams {
            key_description: parsed.key_description,
        })
    }

    pub fn luks2_keyring_set(
        &mut self,
        token: TokenTarget,
        params: &KeyringTokenParams,
    ) -> CryptResult<u32> {
        const FUNCTION: &str = "crypt_token_luks2_keyring_set";
        self.device.ensure_supported(FUNCTION, Operation::Tokens)?;
        let json = serde_json::to_string(&KeyringTokenJson {
            kind: KEYRING_TOKEN_TYPE.to_string(),
            keyslots: Vec::new(),
            key_description: params.key_description.clone(),
        })?;
        self.device.call(FUNCTION, |backend, context| {
            backend.token_json_set(context, token, Some(&json))
        })
    }
}
