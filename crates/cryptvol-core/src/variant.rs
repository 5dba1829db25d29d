//! Header families, their type-specific parameters, and the static matrix of
//! operations each family allows.

use crate::config::FormatDefaults;
use crate::flags::PbkdfFlags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// PBKDF2 according to RFC 2898 (the only KDF LUKS1 knows).
pub const KDF_PBKDF2: &str = "pbkdf2";
/// Argon2i according to RFC 9106.
pub const KDF_ARGON2I: &str = "argon2i";
/// Argon2id according to RFC 9106.
pub const KDF_ARGON2ID: &str = "argon2id";

/// On-disk header family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Plain,
    Luks1,
    Luks2,
}

/// Operations gated by the capability matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Format,
    Load,
    KeyslotAddByVolumeKey,
    KeyslotAddByPassphrase,
    KeyslotChangeByPassphrase,
    Tokens,
    DumpJson,
}

impl DeviceKind {
    /// Type name as recorded by the native library.
    pub const fn name(self) -> &'static str {
        match self {
            DeviceKind::Plain => "PLAIN",
            DeviceKind::Luks1 => "LUKS1",
            DeviceKind::Luks2 => "LUKS2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(DeviceKind::Plain),
            "LUKS1" | "LUKS" => Some(DeviceKind::Luks1),
            "LUKS2" => Some(DeviceKind::Luks2),
            _ => None,
        }
    }

    /// Whether `operation` is legal for this header family.
    pub const fn supports(self, operation: Operation) -> bool {
        match (self, operation) {
            (_, Operation::Format) => true,
            (DeviceKind::Plain, _) => false,
            (DeviceKind::Luks1, Operation::Tokens | Operation::DumpJson) => false,
            (DeviceKind::Luks1, _) => true,
            (DeviceKind::Luks2, _) => true,
        }
    }

    /// Number of keyslots the header can hold.
    pub const fn keyslot_count(self) -> u32 {
        match self {
            DeviceKind::Plain => 0,
            DeviceKind::Luks1 => 8,
            DeviceKind::Luks2 => 32,
        }
    }

    /// Number of token ids the header can hold.
    pub const fn token_count(self) -> u32 {
        match self {
            DeviceKind::Luks2 => 32,
            _ => 0,
        }
    }

    pub const fn is_luks(self) -> bool {
        matches!(self, DeviceKind::Luks1 | DeviceKind::Luks2)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-specific parameters for one header family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HeaderVariant {
    Plain(PlainParams),
    Luks1(Luks1Params),
    Luks2(Luks2Params),
}

impl HeaderVariant {
    pub fn kind(&self) -> DeviceKind {
        match self {
            HeaderVariant::Plain(_) => DeviceKind::Plain,
            HeaderVariant::Luks1(_) => DeviceKind::Luks1,
            HeaderVariant::Luks2(_) => DeviceKind::Luks2,
        }
    }

    /// Fail-safe parameters for `kind`.
    pub fn default_for(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Plain => HeaderVariant::Plain(PlainParams::default()),
            DeviceKind::Luks1 => HeaderVariant::Luks1(Luks1Params::default()),
            DeviceKind::Luks2 => HeaderVariant::Luks2(Luks2Params::default()),
        }
    }

    /// Fill unset fields with built-in defaults. Fields the caller set are kept.
    pub fn fill_defaults(&mut self) {
        self.fill_defaults_from(&FormatDefaults::default());
    }

    /// Fill unset fields from configured defaults.
    pub fn fill_defaults_from(&mut self, defaults: &FormatDefaults) {
        match self {
            HeaderVariant::Plain(params) => {
                if params.hash.is_empty() {
                    params.hash = DEFAULT_HASH.to_string();
                }
            }
            HeaderVariant::Luks1(params) => {
                if params.hash.is_empty() {
                    params.hash = defaults.luks_hash.clone();
                }
            }
            HeaderVariant::Luks2(params) => {
                if params.sector_size == 0 {
                    params.sector_size = defaults.sector_size;
                }
                if let Some(pbkdf) = params.pbkdf.as_mut() {
                    if pbkdf.hash.is_empty() {
                        pbkdf.hash = defaults.luks_hash.clone();
                    }
                }
            }
        }
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.kind().supports(operation)
    }
}

impl From<PlainParams> for HeaderVariant {
    fn from(params: PlainParams) -> Self {
        HeaderVariant::Plain(params)
    }
}

impl From<Luks1Params> for HeaderVariant {
    fn from(params: Luks1Params) -> Self {
        HeaderVariant::Luks1(params)
    }
}

impl From<Luks2Params> for HeaderVariant {
    fn from(params: Luks2Params) -> Self {
        HeaderVariant::Luks2(params)
    }
}

pub(crate) const DEFAULT_HASH: &str = "sha256";
pub(crate) const DEFAULT_SECTOR_SIZE: u32 = 512;

fn default_hash() -> String {
    DEFAULT_HASH.to_string()
}

fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

/// Headerless mapping: everything needed to recreate the mapping lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlainParams {
    #[serde(default = "default_hash")]
    pub hash: String,

    /// Data offset in 512-byte sectors.
    #[serde(default)]
    pub offset: u64,

    /// IV offset in 512-byte sectors.
    #[serde(default)]
    pub skip: u64,

    /// Mapping size in sectors, 0 for the whole device.
    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub sector_size: u32,
}

impl Default for PlainParams {
    fn default() -> Self {
        Self {
            hash: default_hash(),
            offset: 0,
            skip: 0,
            size: 0,
            sector_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Luks1Params {
    #[serde(default = "default_hash")]
    pub hash: String,

    /// Payload alignment in 512-byte sectors.
    #[serde(default)]
    pub data_alignment: u64,

    /// Separate data device when the header lives on its own.
    #[serde(default)]
    pub data_device: Option<String>,
}

impl Default for Luks1Params {
    fn default() -> Self {
        Self {
            hash: default_hash(),
            data_alignment: 0,
            data_device: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Luks2Params {
    #[serde(default)]
    pub pbkdf: Option<PbkdfType>,

    #[serde(default)]
    pub integrity: Option<String>,

    #[serde(default)]
    pub integrity_params: Option<IntegrityParams>,

    #[serde(default)]
    pub data_alignment: u64,

    #[serde(default)]
    pub data_device: Option<String>,

    #[serde(default = "default_sector_size")]
    pub sector_size: u32,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub subsystem: Option<String>,
}

impl Default for Luks2Params {
    fn default() -> Self {
        Self {
            pbkdf: None,
            integrity: None,
            integrity_params: None,
            data_alignment: 0,
            data_device: None,
            sector_size: default_sector_size(),
            label: None,
            subsystem: None,
        }
    }
}

/// Key derivation settings applied to new keyslots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PbkdfType {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_hash")]
    pub hash: String,

    #[serde(default)]
    pub time_ms: u32,

    #[serde(default)]
    pub iterations: u32,

    #[serde(default)]
    pub max_memory_kb: u32,

    #[serde(default)]
    pub parallel_threads: u32,

    #[serde(default)]
    #[schemars(with = "u32")]
    pub flags: PbkdfFlags,
}

impl Default for PbkdfType {
    fn default() -> Self {
        Self {
            kind: KDF_ARGON2ID.to_string(),
            hash: default_hash(),
            time_ms: 0,
            iterations: 0,
            max_memory_kb: 0,
            parallel_threads: 0,
            flags: PbkdfFlags::empty(),
        }
    }
}

/// dm-integrity parameters for authenticated LUKS2 segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IntegrityParams {
    pub journal_size: u64,
    pub journal_watermark: u32,
    pub journal_commit_time: u32,

    pub interleave_sectors: u32,
    pub tag_size: u32,
    pub sector_size: u32,
    pub buffer_sectors: u32,

    pub integrity: Option<String>,
    pub integrity_key_size: u32,

    pub journal_integrity: Option<String>,
    pub journal_integrity_key: Option<String>,
    pub journal_integrity_key_size: u32,

    pub journal_crypt: Option<String>,
    pub journal_crypt_key: Option<String>,
    pub journal_crypt_key_size: u32,
}
