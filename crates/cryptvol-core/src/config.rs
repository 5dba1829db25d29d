use crate::error::{CryptError, CryptResult};
use crate::params::{DEFAULT_CIPHER, DEFAULT_CIPHER_MODE, DEFAULT_VOLUME_KEY_SIZE};
use crate::variant::{HeaderVariant, DEFAULT_HASH, DEFAULT_SECTOR_SIZE};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackendCfg {
    /// Explicit `cryptsetup` binary; discovered on common paths when unset.
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Where secret scratch files are staged; the system temp dir when unset.
    #[serde(default)]
    pub scratch_dir: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for BackendCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            timeout_secs: default_timeout_secs(),
            scratch_dir: None,
        }
    }
}

/// Values used to fill fields a caller left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FormatDefaults {
    #[serde(default = "default_cipher")]
    pub cipher: String,

    #[serde(default = "default_cipher_mode")]
    pub cipher_mode: String,

    #[serde(default = "default_volume_key_size")]
    pub volume_key_size: usize,

    #[serde(default = "default_luks_hash")]
    pub luks_hash: String,

    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
}

fn default_cipher() -> String {
    DEFAULT_CIPHER.to_string()
}

fn default_cipher_mode() -> String {
    DEFAULT_CIPHER_MODE.to_string()
}

fn default_volume_key_size() -> usize {
    DEFAULT_VOLUME_KEY_SIZE
}

fn default_luks_hash() -> String {
    DEFAULT_HASH.to_string()
}

fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

impl Default for FormatDefaults {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            cipher_mode: default_cipher_mode(),
            volume_key_size: default_volume_key_size(),
            luks_hash: default_luks_hash(),
            sector_size: default_sector_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CryptvolConfig {
    #[serde(default)]
    pub backend: BackendCfg,

    #[serde(default)]
    pub defaults: FormatDefaults,

    /// Header profile applied by callers that format without an explicit one.
    #[serde(default)]
    pub format: Option<HeaderVariant>,

    #[serde(skip)]
    pub path: PathBuf,
}

impl CryptvolConfig {
    /// Load from TOML when the extension says so, YAML otherwise.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CryptResult<()> {
        if self.backend.timeout_secs == 0 {
            return Err(CryptError::InvalidConfig(
                "backend.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.defaults.cipher.is_empty() || self.defaults.cipher_mode.is_empty() {
            return Err(CryptError::InvalidConfig(
                "defaults.cipher and defaults.cipher_mode must not be empty".to_string(),
            ));
        }
        if self.defaults.volume_key_size == 0 {
            return Err(CryptError::InvalidConfig(
                "defaults.volume_key_size must be greater than zero".to_string(),
            ));
        }
        validate_sector_size("defaults.sector_size", self.defaults.sector_size)?;
        if let Some(HeaderVariant::Luks2(params)) = &self.format {
            validate_sector_size("format.sector_size", params.sector_size)?;
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_secs)
    }

    pub fn cryptsetup_binary_path(&self) -> Option<PathBuf> {
        self.backend.cryptsetup_path.as_ref().map(PathBuf::from)
    }

    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.backend.scratch_dir.as_ref().map(PathBuf::from)
    }

    /// Configured format profile with defaults filled in.
    pub fn format_profile(&self) -> Option<HeaderVariant> {
        self.format.clone().map(|mut variant| {
            variant.fill_defaults_from(&self.defaults);
            variant
        })
    }

    /// JSON schema for the configuration file.
    pub fn json_schema() -> CryptResult<String> {
        let schema = schemars::schema_for!(CryptvolConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn validate_sector_size(field: &str, value: u32) -> CryptResult<()> {
    // 0 means "let the backend pick".
    if value == 0 || (value.is_power_of_two() && (512..=4096).contains(&value)) {
        return Ok(());
    }
    Err(CryptError::InvalidConfig(format!(
        "{field} must be a power of two between 512 and 4096 (got {value})"
    )))
}
