//! Encrypted volume header management over a pluggable native backend.
//!
//! [`CryptDevice`] owns one backend context from `init` to `free` and gates
//! every operation on the header family it carries. [`EmulatedBackend`]
//! keeps headers in ordinary files; other crates supply system backends.

pub mod backend;
pub mod config;
pub mod device;
pub mod emulated;
pub mod error;
pub mod flags;
pub mod keyfile;
pub mod keyslot;
pub mod logging;
pub mod params;
pub mod token;
pub mod variant;
pub mod wipe;

pub use backend::{CryptBackend, FormatRequest, HeaderDump, NativeResult, NativeStatus, TokenActivation};
pub use config::{BackendCfg, CryptvolConfig, FormatDefaults};
pub use device::CryptDevice;
pub use emulated::{
    EmulatedBackend, EmulatedContext, MappingInfo, TokenHandler, DEFAULT_EXTERNAL_TOKEN_PATH,
};
pub use error::{CryptError, CryptResult, ErrorKind};
pub use flags::{ActivateFlags, DeactivateFlags, PbkdfFlags, WipeFlags};
pub use keyslot::{Keyslot, KeyslotManager, VolumeKey};
pub use logging::{DebugLevel, LogCallback, LogLevel, LogRecord};
pub use params::GenericParams;
pub use token::{token_max, KeyringTokenParams, TokenManager, TokenTarget, KEYRING_TOKEN_TYPE};
pub use variant::{
    DeviceKind, HeaderVariant, IntegrityParams, Luks1Params, Luks2Params, Operation, PbkdfType,
    PlainParams,
};
pub use wipe::{WipePattern, WipeRequest};
