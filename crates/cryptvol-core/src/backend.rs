//! The narrow native interface every device handle drives.
//!
//! A backend owns the cryptographic primitives and the kernel mapping
//! machinery. It answers each call with a value or a signed errno-style
//! status; classification and capability gating live in the handle.

use crate::flags::{ActivateFlags, DeactivateFlags};
use crate::keyslot::Keyslot;
use crate::logging::LogRecord;
use crate::params::GenericParams;
use crate::token::TokenTarget;
use crate::variant::{DeviceKind, HeaderVariant};
use crate::wipe::WipeRequest;
use std::fmt;
use std::path::Path;

/// Negative errno reported by a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeStatus(i32);

impl NativeStatus {
    /// Build from a positive errno constant.
    pub const fn from_errno(errno: i32) -> Self {
        NativeStatus(-errno.abs())
    }

    /// Build from a raw status as returned by the native library.
    pub const fn from_code(code: i32) -> Self {
        NativeStatus(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type NativeResult<T> = Result<T, NativeStatus>;

/// Everything `format` needs, with defaults already filled.
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest<'a> {
    pub variant: &'a HeaderVariant,
    pub params: &'a GenericParams,
}

/// Arguments for unlocking through a token handler.
#[derive(Debug, Clone, Copy)]
pub struct TokenActivation<'a> {
    pub name: Option<&'a str>,
    pub token: TokenTarget,
    /// Restrict to handlers of this token type.
    pub token_type: Option<&'a str>,
    pub pin: Option<&'a [u8]>,
    /// Opaque caller data handed to the token handler.
    pub context: Option<&'a str>,
    pub flags: ActivateFlags,
}

/// Header summary returned by `dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDump {
    pub kind: DeviceKind,
    pub uuid: Option<String>,
    pub cipher: String,
    pub cipher_mode: String,
    pub hash: Option<String>,
    pub volume_key_size: usize,
    /// Payload offset in 512-byte sectors.
    pub data_offset: u64,
    pub sector_size: u32,
    pub label: Option<String>,
    pub keyslots: Vec<u32>,
    pub tokens: Vec<u32>,
}

impl fmt::Display for HeaderDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self.kind {
            DeviceKind::Plain => "plain",
            DeviceKind::Luks1 => "1",
            DeviceKind::Luks2 => "2",
        };
        writeln!(f, "{} header information", self.kind)?;
        writeln!(f, "Version:        {version}")?;
        writeln!(f, "UUID:           {}", self.uuid.as_deref().unwrap_or("(no uuid)"))?;
        if let Some(label) = &self.label {
            writeln!(f, "Label:          {label}")?;
        }
        writeln!(f, "Cipher:         {}-{}", self.cipher, self.cipher_mode)?;
        if let Some(hash) = &self.hash {
            writeln!(f, "Hash:           {hash}")?;
        }
        writeln!(f, "MK bits:        {}", self.volume_key_size * 8)?;
        writeln!(f, "Payload offset: {}", self.data_offset)?;
        writeln!(f, "Sector size:    {}", self.sector_size)?;
        if self.kind.is_luks() {
            writeln!(f, "Keyslots:")?;
            for slot in &self.keyslots {
                writeln!(f, "  {slot}: luks{version}")?;
            }
        }
        if self.kind == DeviceKind::Luks2 {
            writeln!(f, "Tokens:")?;
            for token in &self.tokens {
                writeln!(f, "  {token}")?;
            }
        }
        Ok(())
    }
}

/// Native primitives behind a device handle.
///
/// `Context` is the per-handle native resource. It is created by `init` or
/// `init_by_name` and handed back to `release` exactly once.
pub trait CryptBackend {
    type Context;

    fn init(&self, path: &Path) -> NativeResult<Self::Context>;

    fn init_by_name(&self, name: &str) -> NativeResult<Self::Context>;

    fn release(&self, context: Self::Context);

    /// Header type recorded in the context, if any.
    fn device_kind(&self, context: &Self::Context) -> Option<DeviceKind>;

    fn device_path<'c>(&self, context: &'c Self::Context) -> &'c Path;

    fn uuid(&self, context: &Self::Context) -> Option<String>;

    /// Volume key size in bytes, 0 when unknown.
    fn volume_key_size(&self, context: &Self::Context) -> usize;

    fn format(&self, context: &mut Self::Context, request: &FormatRequest<'_>) -> NativeResult<()>;

    /// Parse the on-disk header; `None` detects the type.
    fn load(
        &self,
        context: &mut Self::Context,
        variant: Option<&HeaderVariant>,
    ) -> NativeResult<DeviceKind>;

    fn dump(&self, context: &mut Self::Context) -> NativeResult<HeaderDump>;

    fn dump_json(&self, context: &mut Self::Context) -> NativeResult<String>;

    /// Resize mapping `name` to `new_size` sectors; 0 fills the device.
    fn resize(&self, context: &mut Self::Context, name: &str, new_size: u64) -> NativeResult<()>;

    /// Wipe per `request`. `progress(total, done)` runs after each block; a
    /// non-zero return stops the wipe with EINTR.
    fn wipe(
        &self,
        context: &mut Self::Context,
        request: &WipeRequest,
        progress: &mut dyn FnMut(u64, u64) -> i32,
    ) -> NativeResult<()>;

    fn activate_by_passphrase(
        &self,
        context: &mut Self::Context,
        name: Option<&str>,
        keyslot: Keyslot,
        passphrase: &[u8],
        flags: ActivateFlags,
    ) -> NativeResult<u32>;

    /// `volume_key: None` uses the key cached by `format` in this context.
    fn activate_by_volume_key(
        &self,
        context: &mut Self::Context,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        volume_key_size: usize,
        flags: ActivateFlags,
    ) -> NativeResult<()>;

    fn activate_by_token(
        &self,
        context: &mut Self::Context,
        request: &TokenActivation<'_>,
    ) -> NativeResult<u32>;

    fn deactivate(
        &self,
        context: &mut Self::Context,
        name: &str,
        flags: DeactivateFlags,
    ) -> NativeResult<()>;

    fn keyslot_add_by_volume_key(
        &self,
        context: &mut Self::Context,
        keyslot: Keyslot,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> NativeResult<u32>;

    fn keyslot_add_by_passphrase(
        &self,
        context: &mut Self::Context,
        keyslot: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> NativeResult<u32>;

    fn keyslot_change_by_passphrase(
        &self,
        context: &mut Self::Context,
        current: Keyslot,
        new: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> NativeResult<u32>;

    /// Unlock `keyslot` and write the volume key into `out`.
    fn volume_key_get(
        &self,
        context: &mut Self::Context,
        keyslot: Keyslot,
        passphrase: &[u8],
        out: &mut Vec<u8>,
    ) -> NativeResult<u32>;

    fn token_json_get(&self, context: &mut Self::Context, token: u32) -> NativeResult<String>;

    /// Store `json` under `token`; `None` removes the token.
    fn token_json_set(
        &self,
        context: &mut Self::Context,
        token: TokenTarget,
        json: Option<&str>,
    ) -> NativeResult<u32>;

    fn token_assign_keyslot(
        &self,
        context: &mut Self::Context,
        token: TokenTarget,
        keyslot: Keyslot,
    ) -> NativeResult<()>;

    fn token_unassign_keyslot(
        &self,
        context: &mut Self::Context,
        token: TokenTarget,
        keyslot: Keyslot,
    ) -> NativeResult<()>;

    fn token_is_assigned(
        &self,
        context: &mut Self::Context,
        token: u32,
        keyslot: u32,
    ) -> NativeResult<()>;

    /// Diagnostics produced since the last drain.
    fn drain_messages(&self, context: &mut Self::Context) -> Vec<LogRecord>;
}
