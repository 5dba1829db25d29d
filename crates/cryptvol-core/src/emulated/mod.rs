//! File-backed backend: headers live in regular files or block devices the
//! process can write, mappings live in process memory.
//!
//! Keyslots wrap the volume key with a PBKDF2-derived pad and the header
//! carries a PBKDF2 digest of the volume key, so passphrase and volume key
//! checks behave like the native library without root privileges or
//! device-mapper.

mod crypto;
mod header;

use crate::backend::{
    CryptBackend, FormatRequest, HeaderDump, NativeResult, NativeStatus, TokenActivation,
};
use crate::error::errno;
use crate::flags::{ActivateFlags, DeactivateFlags};
use crate::keyslot::Keyslot;
use crate::logging::{LogLevel, LogRecord};
use crate::params::GenericParams;
use crate::token::TokenTarget;
use crate::variant::{DeviceKind, HeaderVariant, Luks2Params, PlainParams, KDF_ARGON2I, KDF_ARGON2ID, KDF_PBKDF2};
use crate::wipe::{self, io_status, WipeRequest};
use header::{HeaderMetadata, IntegrityRecord, KdfRecord, KeyslotRecord, SECTOR};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zeroize::Zeroizing;

/// PBKDF2 rounds for keyslots when the variant does not ask for a number.
pub const DEFAULT_ITERATIONS: u32 = 1000;
const DIGEST_ITERATIONS: u32 = 1000;
const MAPPER_DIR: &str = "/dev/mapper/";
/// Where token handler plugins are looked up unless configured otherwise.
pub const DEFAULT_EXTERNAL_TOKEN_PATH: &str = "/usr/lib/cryptsetup";
const JOURNAL_CIPHERS: &[&str] = &["cbc(aes)", "ctr(aes)", "xts(aes)", "salsa20", "chacha20"];

/// Produces the passphrase for keyslots guarded by one token type.
pub trait TokenHandler: Send + Sync {
    fn open(
        &self,
        token: &Value,
        pin: Option<&[u8]>,
        context: Option<&str>,
    ) -> NativeResult<Zeroizing<Vec<u8>>>;
}

impl<F> TokenHandler for F
where
    F: Fn(&Value, Option<&[u8]>, Option<&str>) -> NativeResult<Zeroizing<Vec<u8>>> + Send + Sync,
{
    fn open(
        &self,
        token: &Value,
        pin: Option<&[u8]>,
        context: Option<&str>,
    ) -> NativeResult<Zeroizing<Vec<u8>>> {
        self(token, pin, context)
    }
}

/// Public view of an active mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub name: String,
    pub device: PathBuf,
    pub kind: DeviceKind,
    pub cipher: String,
    /// Payload offset in 512-byte sectors.
    pub offset: u64,
    /// Mapped size in 512-byte sectors.
    pub size: u64,
    pub flags: ActivateFlags,
    pub keyslot: Option<u32>,
}

struct Mapping {
    info: MappingInfo,
    // Held for the mapping's lifetime like the kernel holds the table key.
    _volume_key: Zeroizing<Vec<u8>>,
    plain: Option<PlainState>,
}

#[derive(Default)]
struct Registry {
    mappings: BTreeMap<String, Mapping>,
    handlers: BTreeMap<String, Arc<dyn TokenHandler>>,
    external_disabled: bool,
}

/// Backend over regular files. Clones share one mapping registry.
#[derive(Clone)]
pub struct EmulatedBackend {
    registry: Arc<Mutex<Registry>>,
    iterations: u32,
    external_token_path: PathBuf,
}

impl Default for EmulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedBackend {
    pub fn new() -> Self {
        Self::with_iterations(DEFAULT_ITERATIONS)
    }

    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            iterations: iterations.max(1),
            external_token_path: PathBuf::from(DEFAULT_EXTERNAL_TOKEN_PATH),
        }
    }

    pub fn with_external_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.external_token_path = path.into();
        self
    }

    /// Handle tokens whose `type` is `token_type`.
    pub fn register_token_handler<H>(&self, token_type: impl Into<String>, handler: H)
    where
        H: TokenHandler + 'static,
    {
        self.registry()
            .handlers
            .insert(token_type.into(), Arc::new(handler));
    }

    /// Stop consulting registered token handlers. There is no way back; every
    /// clone of this backend is affected.
    pub fn disable_external_tokens(&self) {
        let mut registry = self.registry();
        if !registry.external_disabled {
            log::info!("external token handlers disabled");
        }
        registry.external_disabled = true;
    }

    /// Directory searched for token handler plugins, or `None` once external
    /// tokens are disabled.
    pub fn external_token_path(&self) -> Option<&Path> {
        if self.registry().external_disabled {
            None
        } else {
            Some(&self.external_token_path)
        }
    }

    pub fn mapping(&self, name: &str) -> Option<MappingInfo> {
        self.registry()
            .mappings
            .get(name)
            .map(|mapping| mapping.info.clone())
    }

    pub fn active_mappings(&self) -> Vec<String> {
        self.registry().mappings.keys().cloned().collect()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn map(
        &self,
        context: &mut EmulatedContext,
        name: &str,
        volume_key: Zeroizing<Vec<u8>>,
        keyslot: Option<u32>,
        flags: ActivateFlags,
    ) -> NativeResult<()> {
        let kind = context.kind.ok_or_else(einval)?;
        let (offset, requested, cipher) = match (&context.header, &context.plain) {
            (Some(meta), _) => (meta.data_offset, 0, meta.cipher_spec()),
            (None, Some(plain)) => (plain.offset, plain.size, plain.cipher_spec()),
            (None, None) => return Err(einval()),
        };
        let available = device_sectors(&context.path)?.saturating_sub(offset);
        let size = if requested == 0 { available } else { requested };

        let mut registry = self.registry();
        if registry.mappings.contains_key(name) {
            drop(registry);
            context.note(LogLevel::Error, format!("Device {name} already exists."));
            return Err(NativeStatus::from_errno(errno::EEXIST));
        }
        registry.mappings.insert(
            name.to_string(),
            Mapping {
                info: MappingInfo {
                    name: name.to_string(),
                    device: context.path.clone(),
                    kind,
                    cipher,
                    offset,
                    size,
                    flags,
                    keyslot,
                },
                _volume_key: volume_key,
                plain: context.plain.clone(),
            },
        );
        drop(registry);
        context.note(
            LogLevel::Verbose,
            format!("Activated {name} ({size} sectors, flags {:#x}).", flags.bits()),
        );
        Ok(())
    }

    fn format_plain(
        &self,
        context: &mut EmulatedContext,
        plain: &PlainParams,
        params: &GenericParams,
    ) -> NativeResult<()> {
        if !crypto::plain_hash_supported(&plain.hash) {
            context.note(
                LogLevel::Error,
                format!("Requested hash {} is not supported.", plain.hash),
            );
            return Err(einval());
        }

        // Headerless: scrub the first payload sector so stale metadata there
        // can no longer be detected.
        let start = plain.offset.checked_mul(SECTOR).ok_or_else(|| {
            context.note(
                LogLevel::Error,
                format!("Plain offset {} is out of range.", plain.offset),
            );
            einval()
        })?;
        let len = device_len(&context.path)?;
        if len > start {
            let scrub = crypto::random_bytes((len - start).min(SECTOR) as usize);
            header::write_at(&context.path, start, &scrub)?;
        }

        let volume_key = match &params.volume_key {
            Some(key) => key.clone(),
            None => crypto::random_bytes(params.volume_key_size),
        };
        context.plain = Some(PlainState {
            cipher: params.cipher.clone(),
            cipher_mode: params.cipher_mode.clone(),
            hash: plain.hash.clone(),
            offset: plain.offset,
            size: plain.size,
            sector_size: if plain.sector_size == 0 {
                SECTOR as u32
            } else {
                plain.sector_size
            },
            volume_key_size: params.volume_key_size,
        });
        context.kind = Some(DeviceKind::Plain);
        context.cached_key = Some(volume_key);
        context.note(LogLevel::Verbose, "Plain device parameters recorded.");
        Ok(())
    }

    fn luks2_layout(&self, params: &Luks2Params) -> NativeResult<LuksLayout> {
        let sector_size = params.sector_size;
        if !(sector_size.is_power_of_two() && (512..=4096).contains(&sector_size)) {
            return Err(einval());
        }

        let kdf = match &params.pbkdf {
            Some(pbkdf) => {
                if ![KDF_PBKDF2, KDF_ARGON2I, KDF_ARGON2ID].contains(&pbkdf.kind.as_str()) {
                    return Err(einval());
                }
                KdfRecord {
                    kind: pbkdf.kind.clone(),
                    hash: if pbkdf.hash.is_empty() {
                        "sha256".to_string()
                    } else {
                        pbkdf.hash.clone()
                    },
                    iterations: if pbkdf.iterations > 0 {
                        pbkdf.iterations
                    } else {
                        self.iterations
                    },
                }
            }
            None => self.default_kdf("sha256"),
        };

        let integrity_params = params.integrity_params.as_ref();
        if let Some(journal) = integrity_params.and_then(|p| p.journal_crypt.as_deref()) {
            if !JOURNAL_CIPHERS.contains(&journal) {
                log::debug!("journal encryption '{journal}' is not available");
                return Err(NativeStatus::from_errno(errno::ENOTSUP));
            }
        }
        let integrity = params
            .integrity
            .clone()
            .or_else(|| integrity_params.and_then(|p| p.integrity.clone()))
            .map(|integrity| IntegrityRecord {
                integrity,
                journal_encryption: integrity_params.and_then(|p| p.journal_crypt.clone()),
                journal_integrity: integrity_params.and_then(|p| p.journal_integrity.clone()),
            });

        Ok(LuksLayout {
            hash: kdf.hash.clone(),
            data_alignment: params.data_alignment,
            data_device: params.data_device.clone(),
            sector_size,
            label: params.label.clone(),
            subsystem: params.subsystem.clone(),
            integrity,
            kdf,
        })
    }

    fn default_kdf(&self, hash: &str) -> KdfRecord {
        KdfRecord {
            kind: KDF_PBKDF2.to_string(),
            hash: hash.to_string(),
            iterations: self.iterations,
        }
    }

    fn format_luks(
        &self,
        context: &mut EmulatedContext,
        kind: DeviceKind,
        layout: LuksLayout,
        params: &GenericParams,
    ) -> NativeResult<()> {
        let header_bytes = header::header_size(kind) as u64;
        let len = device_len(&context.path)?;
        if len < header_bytes {
            context.note(
                LogLevel::Error,
                format!("Device {} is too small.", context.path.display()),
            );
            return Err(einval());
        }

        let data_offset = match (&layout.data_device, layout.data_alignment) {
            (Some(_), alignment) => alignment,
            (None, 0) => header_bytes / SECTOR,
            (None, alignment) => round_up(header_bytes / SECTOR, alignment),
        };

        let volume_key = match &params.volume_key {
            Some(key) => key.clone(),
            None => crypto::random_bytes(params.volume_key_size),
        };
        let digest_salt = crypto::random_bytes(crypto::SALT_LEN);
        let digest = crypto::derive(&volume_key, &digest_salt, DIGEST_ITERATIONS, crypto::DIGEST_LEN);

        let meta = HeaderMetadata {
            uuid: params
                .uuid
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            cipher: params.cipher.clone(),
            cipher_mode: params.cipher_mode.clone(),
            hash: layout.hash,
            volume_key_size: params.volume_key_size,
            digest: hex::encode(&digest[..]),
            digest_salt: hex::encode(&digest_salt[..]),
            digest_iterations: DIGEST_ITERATIONS,
            data_offset,
            sector_size: layout.sector_size,
            data_device: layout.data_device,
            label: layout.label,
            subsystem: layout.subsystem,
            integrity: layout.integrity,
            kdf: layout.kdf,
            keyslots: BTreeMap::new(),
            tokens: BTreeMap::new(),
        };
        header::write_header(&context.path, kind, &meta)?;

        context.note(
            LogLevel::Verbose,
            format!("{kind} header written to {}.", context.path.display()),
        );
        context.kind = Some(kind);
        context.header = Some(meta);
        context.cached_key = Some(volume_key);
        Ok(())
    }
}

struct LuksLayout {
    hash: String,
    data_alignment: u64,
    data_device: Option<String>,
    sector_size: u32,
    label: Option<String>,
    subsystem: Option<String>,
    integrity: Option<IntegrityRecord>,
    kdf: KdfRecord,
}

#[derive(Debug, Clone)]
struct PlainState {
    cipher: String,
    cipher_mode: String,
    hash: String,
    offset: u64,
    size: u64,
    sector_size: u32,
    volume_key_size: usize,
}

impl PlainState {
    fn cipher_spec(&self) -> String {
        format!("{}-{}", self.cipher, self.cipher_mode)
    }
}

/// Per-handle state of the emulated backend.
pub struct EmulatedContext {
    path: PathBuf,
    kind: Option<DeviceKind>,
    header: Option<HeaderMetadata>,
    plain: Option<PlainState>,
    cached_key: Option<Zeroizing<Vec<u8>>>,
    messages: Vec<LogRecord>,
}

impl EmulatedContext {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            kind: None,
            header: None,
            plain: None,
            cached_key: None,
            messages: Vec::new(),
        }
    }

    fn note(&mut self, level: LogLevel, message: impl Into<String>) {
        self.messages.push(LogRecord::new(level, message));
    }

    /// Copy of the LUKS header for an all-or-nothing update.
    ///
    /// The header is re-read from the device every time so that updates made
    /// through other handles on the same image are never overwritten.
    fn luks(&mut self) -> NativeResult<(DeviceKind, HeaderMetadata)> {
        let kind = match self.kind {
            Some(kind) if kind.is_luks() && self.header.is_some() => kind,
            _ => return Err(einval()),
        };
        let (on_disk, meta) = header::read_header(&self.path)?;
        if on_disk != kind {
            log::debug!(
                "header on {} changed from {kind} to {on_disk}",
                self.path.display()
            );
            return Err(einval());
        }
        self.header = Some(meta.clone());
        Ok((kind, meta))
    }

    fn luks2(&mut self) -> NativeResult<HeaderMetadata> {
        match self.luks()? {
            (DeviceKind::Luks2, meta) => Ok(meta),
            _ => Err(einval()),
        }
    }

    /// Persist `meta` and adopt it. Nothing changes in memory if the write fails.
    fn commit(&mut self, kind: DeviceKind, meta: HeaderMetadata) -> NativeResult<()> {
        header::write_header(&self.path, kind, &meta)?;
        self.header = Some(meta);
        Ok(())
    }

    fn plain_key(&self, passphrase: &[u8]) -> NativeResult<Zeroizing<Vec<u8>>> {
        let plain = self.plain.as_ref().ok_or_else(einval)?;
        crypto::plain_key(passphrase, &plain.hash, plain.volume_key_size)
    }
}

impl CryptBackend for EmulatedBackend {
    type Context = EmulatedContext;

    fn init(&self, path: &Path) -> NativeResult<EmulatedContext> {
        match fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => Ok(EmulatedContext::new(path.to_path_buf())),
            _ => {
                log::debug!("{} is not a usable device", path.display());
                Err(NativeStatus::from_errno(errno::ENOTBLK))
            }
        }
    }

    fn init_by_name(&self, name: &str) -> NativeResult<EmulatedContext> {
        let (device, kind, plain) = {
            let registry = self.registry();
            let mapping = registry
                .mappings
                .get(name)
                .ok_or_else(|| NativeStatus::from_errno(errno::ENODEV))?;
            (mapping.info.device.clone(), mapping.info.kind, mapping.plain.clone())
        };

        let mut context = EmulatedContext::new(device);
        context.kind = Some(kind);
        if kind.is_luks() {
            let (_, meta) = header::read_header(&context.path)?;
            context.header = Some(meta);
        } else {
            context.plain = plain;
        }
        Ok(context)
    }

    fn release(&self, context: EmulatedContext) {
        log::trace!("releasing emulated context for {}", context.path.display());
        drop(context);
    }

    fn device_kind(&self, context: &EmulatedContext) -> Option<DeviceKind> {
        context.kind
    }

    fn device_path<'c>(&self, context: &'c EmulatedContext) -> &'c Path {
        &context.path
    }

    fn uuid(&self, context: &EmulatedContext) -> Option<String> {
        context.header.as_ref().map(|meta| meta.uuid.clone())
    }

    fn volume_key_size(&self, context: &EmulatedContext) -> usize {
        match (&context.header, &context.plain) {
            (Some(meta), _) => meta.volume_key_size,
            (None, Some(plain)) => plain.volume_key_size,
            (None, None) => 0,
        }
    }

    fn format(&self, context: &mut EmulatedContext, request: &FormatRequest<'_>) -> NativeResult<()> {
        if context.kind.is_some() {
            context.note(LogLevel::Error, "Context is already formatted.");
            return Err(einval());
        }
        match request.variant {
            HeaderVariant::Plain(plain) => self.format_plain(context, plain, request.params),
            HeaderVariant::Luks1(luks1) => {
                let kdf = self.default_kdf(&luks1.hash);
                let layout = LuksLayout {
                    hash: luks1.hash.clone(),
                    data_alignment: luks1.data_alignment,
                    data_device: luks1.data_device.clone(),
                    sector_size: SECTOR as u32,
                    label: None,
                    subsystem: None,
                    integrity: None,
                    kdf,
                };
                self.format_luks(context, DeviceKind::Luks1, layout, request.params)
            }
            HeaderVariant::Luks2(luks2) => {
                let layout = self.luks2_layout(luks2)?;
                self.format_luks(context, DeviceKind::Luks2, layout, request.params)
            }
        }
    }

    fn load(
        &self,
        context: &mut EmulatedContext,
        variant: Option<&HeaderVariant>,
    ) -> NativeResult<DeviceKind> {
        let (kind, meta) = match header::read_header(&context.path) {
            Ok(found) => found,
            Err(status) => {
                context.note(
                    LogLevel::Error,
                    format!("Device {} is not a valid LUKS device.", context.path.display()),
                );
                return Err(status);
            }
        };
        if let Some(variant) = variant {
            if variant.kind() != kind {
                context.note(
                    LogLevel::Error,
                    format!("Device carries a {kind} header, not {}.", variant.kind()),
                );
                return Err(einval());
            }
        }
        context.kind = Some(kind);
        context.header = Some(meta);
        context.plain = None;
        context.cached_key = None;
        Ok(kind)
    }

    fn dump(&self, context: &mut EmulatedContext) -> NativeResult<HeaderDump> {
        if context.kind.is_some_and(|kind| kind.is_luks()) {
            context.luks()?;
        }
        let dump = match (context.kind, &context.header, &context.plain) {
            (Some(kind), Some(meta), _) => HeaderDump {
                kind,
                uuid: Some(meta.uuid.clone()),
                cipher: meta.cipher.clone(),
                cipher_mode: meta.cipher_mode.clone(),
                hash: Some(meta.hash.clone()),
                volume_key_size: meta.volume_key_size,
                data_offset: meta.data_offset,
                sector_size: meta.sector_size,
                label: meta.label.clone(),
                keyslots: meta.keyslots.keys().copied().collect(),
                tokens: meta.tokens.keys().copied().collect(),
            },
            (Some(DeviceKind::Plain), None, Some(plain)) => HeaderDump {
                kind: DeviceKind::Plain,
                uuid: None,
                cipher: plain.cipher.clone(),
                cipher_mode: plain.cipher_mode.clone(),
                hash: Some(plain.hash.clone()),
                volume_key_size: plain.volume_key_size,
                data_offset: plain.offset,
                sector_size: plain.sector_size,
                label: None,
                keyslots: Vec::new(),
                tokens: Vec::new(),
            },
            _ => return Err(einval()),
        };
        context.note(LogLevel::Normal, dump.to_string());
        Ok(dump)
    }

    fn dump_json(&self, context: &mut EmulatedContext) -> NativeResult<String> {
        let meta = context.luks2()?;

        let keyslots: serde_json::Map<String, Value> = meta
            .keyslots
            .iter()
            .map(|(slot, record)| {
                (
                    slot.to_string(),
                    json!({
                        "type": "luks2",
                        "key_size": meta.volume_key_size,
                        "kdf": {
                            "type": meta.kdf.kind,
                            "hash": meta.kdf.hash,
                            "iterations": record.iterations,
                            "salt": record.salt,
                        },
                    }),
                )
            })
            .collect();
        let tokens: serde_json::Map<String, Value> = meta
            .tokens
            .iter()
            .map(|(id, token)| (id.to_string(), token.clone()))
            .collect();

        let mut segment = json!({
            "type": "crypt",
            "offset": (meta.data_offset * SECTOR).to_string(),
            "size": "dynamic",
            "iv_tweak": "0",
            "encryption": meta.cipher_spec(),
            "sector_size": meta.sector_size,
        });
        if let Some(integrity) = &meta.integrity {
            segment["integrity"] = json!({
                "type": integrity.integrity,
                "journal_encryption": integrity.journal_encryption.as_deref().unwrap_or("none"),
                "journal_integrity": integrity.journal_integrity.as_deref().unwrap_or("none"),
            });
        }

        let slot_names: Vec<String> = meta.keyslots.keys().map(u32::to_string).collect();
        let mut config = json!({
            "json_size": (header::header_size(DeviceKind::Luks2) - 12).to_string(),
            "keyslots_size": (meta.data_offset * SECTOR).to_string(),
        });
        if let Some(label) = &meta.label {
            config["label"] = json!(label);
        }
        if let Some(subsystem) = &meta.subsystem {
            config["subsystem"] = json!(subsystem);
        }

        let document = json!({
            "keyslots": keyslots,
            "tokens": tokens,
            "segments": { "0": segment },
            "digests": {
                "0": {
                    "type": "pbkdf2",
                    "keyslots": slot_names,
                    "segments": ["0"],
                    "hash": "sha256",
                    "iterations": meta.digest_iterations,
                    "salt": meta.digest_salt,
                    "digest": meta.digest,
                }
            },
            "config": config,
        });
        serde_json::to_string_pretty(&document).map_err(|_| einval())
    }

    fn resize(&self, context: &mut EmulatedContext, name: &str, new_size: u64) -> NativeResult<()> {
        if context.kind.is_none() {
            return Err(einval());
        }
        let available = device_sectors(&context.path)?;
        let mut registry = self.registry();
        let mapping = registry
            .mappings
            .get_mut(name)
            .ok_or_else(|| NativeStatus::from_errno(errno::ENODEV))?;
        if mapping.info.device != context.path {
            return Err(einval());
        }
        let available = available.saturating_sub(mapping.info.offset);
        let size = if new_size == 0 { available } else { new_size };
        if size > available {
            drop(registry);
            context.note(
                LogLevel::Error,
                format!("Requested size {size} exceeds the device ({available} sectors)."),
            );
            return Err(einval());
        }
        mapping.info.size = size;
        drop(registry);
        context.note(LogLevel::Verbose, format!("Resized {name} to {size} sectors."));
        Ok(())
    }

    fn wipe(
        &self,
        context: &mut EmulatedContext,
        request: &WipeRequest,
        progress: &mut dyn FnMut(u64, u64) -> i32,
    ) -> NativeResult<()> {
        let target = request.path.clone().unwrap_or_else(|| context.path.clone());
        let mapped = target
            .to_str()
            .and_then(|path| path.strip_prefix(MAPPER_DIR))
            .and_then(|name| self.mapping(name));

        let (path, request) = match mapped {
            Some(mapping) => {
                let base = mapping.offset * SECTOR;
                let length = if request.length == 0 {
                    (mapping.size * SECTOR).saturating_sub(request.offset)
                } else {
                    request.length
                };
                let mut shifted = request.clone();
                shifted.offset = base + request.offset;
                shifted.length = length;
                (mapping.device, shifted)
            }
            None => (target, request.clone()),
        };

        match wipe::wipe_file(&path, &request, progress) {
            Ok(written) => {
                context.note(
                    LogLevel::Verbose,
                    format!(
                        "Wiped {written} bytes of {} with {} pattern.",
                        path.display(),
                        request.pattern.name()
                    ),
                );
                Ok(())
            }
            Err(status) => {
                if status.code() == -errno::EINTR {
                    context.note(LogLevel::Normal, "Wipe interrupted.");
                }
                Err(status)
            }
        }
    }

    fn activate_by_passphrase(
        &self,
        context: &mut EmulatedContext,
        name: Option<&str>,
        keyslot: Keyslot,
        passphrase: &[u8],
        flags: ActivateFlags,
    ) -> NativeResult<u32> {
        let (slot, volume_key) = match context.kind {
            Some(DeviceKind::Plain) => (0, context.plain_key(passphrase)?),
            Some(_) => {
                let (_, meta) = context.luks()?;
                match open_keyslots(&meta, keyslot, passphrase) {
                    Ok(found) => found,
                    Err(status) => {
                        context.note(LogLevel::Normal, "No key available with this passphrase.");
                        return Err(status);
                    }
                }
            }
            None => return Err(einval()),
        };
        if let Some(name) = name {
            self.map(context, name, volume_key, Some(slot), flags)?;
        }
        Ok(slot)
    }

    fn activate_by_volume_key(
        &self,
        context: &mut EmulatedContext,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        volume_key_size: usize,
        flags: ActivateFlags,
    ) -> NativeResult<()> {
        if context.kind.is_none() {
            return Err(einval());
        }
        let key = match volume_key {
            Some(key) => Zeroizing::new(key.to_vec()),
            None => match &context.cached_key {
                Some(key) => key.clone(),
                None => {
                    context.note(LogLevel::Error, "Volume key is not available.");
                    return Err(einval());
                }
            },
        };
        let expected = self.volume_key_size(context);
        if key.len() != volume_key_size || key.len() != expected {
            return Err(einval());
        }
        if let Some(meta) = &context.header {
            if !verify_volume_key(meta, &key) {
                context.note(LogLevel::Error, "Volume key does not match the volume.");
                return Err(NativeStatus::from_errno(errno::EPERM));
            }
        }
        match name {
            Some(name) => self.map(context, name, key, None, flags),
            None => Ok(()),
        }
    }

    fn activate_by_token(
        &self,
        context: &mut EmulatedContext,
        request: &TokenActivation<'_>,
    ) -> NativeResult<u32> {
        let meta = context.luks2()?;
        let candidates: Vec<u32> = match request.token {
            TokenTarget::Any => meta.tokens.keys().copied().collect(),
            TokenTarget::Id(id) if meta.tokens.contains_key(&id) => vec![id],
            TokenTarget::Id(_) => return Err(NativeStatus::from_errno(errno::ENOENT)),
        };
        let handlers = {
            let registry = self.registry();
            if registry.external_disabled {
                BTreeMap::new()
            } else {
                registry.handlers.clone()
            }
        };

        let mut last = NativeStatus::from_errno(errno::ENOENT);
        for id in candidates {
            let token = &meta.tokens[&id];
            let token_type = token.get("type").and_then(Value::as_str).unwrap_or_default();
            if request.token_type.is_some_and(|wanted| wanted != token_type) {
                continue;
            }
            let Some(handler) = handlers.get(token_type) else {
                context.note(
                    LogLevel::Debug,
                    format!("No handler for token {id} of type {token_type}."),
                );
                continue;
            };
            let passphrase = match handler.open(token, request.pin, request.context) {
                Ok(passphrase) => passphrase,
                Err(status) => {
                    last = status;
                    continue;
                }
            };
            for slot in token_keyslots(token) {
                if let Some(volume_key) = unlock_keyslot(&meta, slot, &passphrase) {
                    if let Some(name) = request.name {
                        self.map(context, name, volume_key, Some(slot), request.flags)?;
                    }
                    return Ok(slot);
                }
            }
            last = NativeStatus::from_errno(errno::EPERM);
        }
        Err(last)
    }

    fn deactivate(
        &self,
        context: &mut EmulatedContext,
        name: &str,
        flags: DeactivateFlags,
    ) -> NativeResult<()> {
        let removed = self.registry().mappings.remove(name);
        if removed.is_none() {
            context.note(LogLevel::Error, format!("Device {name} is not active."));
            return Err(NativeStatus::from_errno(errno::ENODEV));
        }
        if flags.contains(DeactivateFlags::FORCE) {
            context.note(
                LogLevel::Normal,
                format!("Device {name} replaced with error target."),
            );
        } else if flags.contains(DeactivateFlags::DEFERRED) {
            context.note(LogLevel::Verbose, format!("Deferred removal of {name} completed."));
        }
        Ok(())
    }

    fn keyslot_add_by_volume_key(
        &self,
        context: &mut EmulatedContext,
        keyslot: Keyslot,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> NativeResult<u32> {
        let (kind, mut meta) = context.luks()?;
        let volume_key = match volume_key {
            Some(key) => {
                if !verify_volume_key(&meta, key) {
                    context.note(LogLevel::Error, "Volume key does not match the volume.");
                    return Err(NativeStatus::from_errno(errno::EPERM));
                }
                Zeroizing::new(key.to_vec())
            }
            None => context.cached_key.clone().ok_or_else(einval)?,
        };
        let slot = match free_slot(kind, &meta, keyslot) {
            Ok(slot) => slot,
            Err(status) => {
                context.note(LogLevel::Error, slot_unavailable(keyslot));
                return Err(status);
            }
        };
        let record = seal_keyslot(&volume_key, passphrase, meta.kdf.iterations);
        meta.keyslots.insert(slot, record);
        context.commit(kind, meta)?;
        context.note(LogLevel::Verbose, format!("Key slot {slot} created."));
        Ok(slot)
    }

    fn keyslot_add_by_passphrase(
        &self,
        context: &mut EmulatedContext,
        keyslot: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> NativeResult<u32> {
        let (kind, mut meta) = context.luks()?;
        let slot = match free_slot(kind, &meta, keyslot) {
            Ok(slot) => slot,
            Err(status) => {
                context.note(LogLevel::Error, slot_unavailable(keyslot));
                return Err(status);
            }
        };
        let (_, volume_key) = open_keyslots(&meta, Keyslot::Any, passphrase)?;
        let record = seal_keyslot(&volume_key, new_passphrase, meta.kdf.iterations);
        meta.keyslots.insert(slot, record);
        context.commit(kind, meta)?;
        context.note(LogLevel::Verbose, format!("Key slot {slot} created."));
        Ok(slot)
    }

    fn keyslot_change_by_passphrase(
        &self,
        context: &mut EmulatedContext,
        current: Keyslot,
        new: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> NativeResult<u32> {
        let (kind, mut meta) = context.luks()?;
        let (old, volume_key) = open_keyslots(&meta, current, passphrase)?;
        let target = match new {
            Keyslot::Index(index) => {
                if index >= kind.keyslot_count()
                    || (index != old && meta.keyslots.contains_key(&index))
                {
                    return Err(einval());
                }
                index
            }
            Keyslot::Any => (0..kind.keyslot_count())
                .find(|index| !meta.keyslots.contains_key(index))
                .unwrap_or(old),
        };
        let record = seal_keyslot(&volume_key, new_passphrase, meta.kdf.iterations);
        meta.keyslots.remove(&old);
        meta.keyslots.insert(target, record);
        context.commit(kind, meta)?;
        context.note(
            LogLevel::Verbose,
            format!("Key slot {old} changed into key slot {target}."),
        );
        Ok(target)
    }

    fn volume_key_get(
        &self,
        context: &mut EmulatedContext,
        keyslot: Keyslot,
        passphrase: &[u8],
        out: &mut Vec<u8>,
    ) -> NativeResult<u32> {
        let (slot, volume_key) = match context.kind {
            Some(DeviceKind::Plain) => (0, context.plain_key(passphrase)?),
            Some(_) => {
                let (_, meta) = context.luks()?;
                open_keyslots(&meta, keyslot, passphrase)?
            }
            None => return Err(einval()),
        };
        out.clear();
        out.extend_from_slice(&volume_key);
        Ok(slot)
    }

    fn token_json_get(&self, context: &mut EmulatedContext, token: u32) -> NativeResult<String> {
        let meta = context.luks2()?;
        check_token_id(token)?;
        let value = meta
            .tokens
            .get(&token)
            .ok_or_else(|| NativeStatus::from_errno(errno::ENOENT))?;
        serde_json::to_string(value).map_err(|_| einval())
    }

    fn token_json_set(
        &self,
        context: &mut EmulatedContext,
        token: TokenTarget,
        json: Option<&str>,
    ) -> NativeResult<u32> {
        let mut meta = context.luks2()?;
        let Some(json) = json else {
            let id = token.id().ok_or_else(einval)?;
            check_token_id(id)?;
            if meta.tokens.remove(&id).is_none() {
                return Err(NativeStatus::from_errno(errno::ENOENT));
            }
            context.commit(DeviceKind::Luks2, meta)?;
            context.note(LogLevel::Verbose, format!("Token {id} removed."));
            return Ok(id);
        };

        let value: Value = serde_json::from_str(json).map_err(|err| {
            log::debug!("token json rejected: {err}");
            einval()
        })?;
        let well_formed = value.get("type").is_some_and(Value::is_string)
            && value.get("keyslots").is_some_and(Value::is_array);
        if !well_formed {
            context.note(LogLevel::Error, "Token JSON needs a type and a keyslots array.");
            return Err(einval());
        }

        let id = match token {
            TokenTarget::Id(id) => {
                check_token_id(id)?;
                if meta.tokens.contains_key(&id) {
                    return Err(einval());
                }
                id
            }
            TokenTarget::Any => (0..DeviceKind::Luks2.token_count())
                .find(|id| !meta.tokens.contains_key(id))
                .ok_or_else(einval)?,
        };
        meta.tokens.insert(id, value);
        context.commit(DeviceKind::Luks2, meta)?;
        context.note(LogLevel::Verbose, format!("Token {id} created."));
        Ok(id)
    }

    fn token_assign_keyslot(
        &self,
        context: &mut EmulatedContext,
        token: TokenTarget,
        keyslot: Keyslot,
    ) -> NativeResult<()> {
        update_assignments(context, token, keyslot, true)
    }

    fn token_unassign_keyslot(
        &self,
        context: &mut EmulatedContext,
        token: TokenTarget,
        keyslot: Keyslot,
    ) -> NativeResult<()> {
        update_assignments(context, token, keyslot, false)
    }

    fn token_is_assigned(
        &self,
        context: &mut EmulatedContext,
        token: u32,
        keyslot: u32,
    ) -> NativeResult<()> {
        let meta = context.luks2()?;
        check_token_id(token)?;
        if keyslot >= DeviceKind::Luks2.keyslot_count() {
            return Err(einval());
        }
        let value = meta
            .tokens
            .get(&token)
            .ok_or_else(|| NativeStatus::from_errno(errno::ENOENT))?;
        if token_keyslots(value).contains(&keyslot) {
            Ok(())
        } else {
            Err(NativeStatus::from_errno(errno::ENOENT))
        }
    }

    fn drain_messages(&self, context: &mut EmulatedContext) -> Vec<LogRecord> {
        std::mem::take(&mut context.messages)
    }
}

fn einval() -> NativeStatus {
    NativeStatus::from_errno(errno::EINVAL)
}

fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn device_len(path: &Path) -> NativeResult<u64> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| io_status(&err))
}

fn device_sectors(path: &Path) -> NativeResult<u64> {
    Ok(device_len(path)? / SECTOR)
}

fn check_token_id(id: u32) -> NativeResult<()> {
    if id >= DeviceKind::Luks2.token_count() {
        return Err(einval());
    }
    Ok(())
}

fn verify_volume_key(meta: &HeaderMetadata, key: &[u8]) -> bool {
    if key.len() != meta.volume_key_size {
        return false;
    }
    let (Ok(salt), Ok(expected)) = (hex::decode(&meta.digest_salt), hex::decode(&meta.digest)) else {
        return false;
    };
    let digest = crypto::derive(key, &salt, meta.digest_iterations, expected.len());
    crypto::constant_time_eq(&digest, &expected)
}

fn seal_keyslot(volume_key: &[u8], passphrase: &[u8], iterations: u32) -> KeyslotRecord {
    let salt = crypto::random_bytes(crypto::SALT_LEN);
    let pad = crypto::derive(passphrase, &salt, iterations, volume_key.len());
    KeyslotRecord {
        salt: hex::encode(&salt[..]),
        iterations,
        wrapped_key: hex::encode(&crypto::xor(volume_key, &pad)[..]),
    }
}

fn unlock_keyslot(meta: &HeaderMetadata, slot: u32, passphrase: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    let record = meta.keyslots.get(&slot)?;
    let salt = hex::decode(&record.salt).ok()?;
    let wrapped = Zeroizing::new(hex::decode(&record.wrapped_key).ok()?);
    let pad = crypto::derive(passphrase, &salt, record.iterations, wrapped.len());
    let candidate = crypto::xor(&wrapped, &pad);
    verify_volume_key(meta, &candidate).then_some(candidate)
}

/// Unlock `keyslot`, or every occupied slot in ascending order for `Any`.
fn open_keyslots(
    meta: &HeaderMetadata,
    keyslot: Keyslot,
    passphrase: &[u8],
) -> NativeResult<(u32, Zeroizing<Vec<u8>>)> {
    match keyslot {
        Keyslot::Index(slot) => {
            if !meta.keyslots.contains_key(&slot) {
                return Err(NativeStatus::from_errno(errno::ENOENT));
            }
            unlock_keyslot(meta, slot, passphrase)
                .map(|key| (slot, key))
                .ok_or_else(|| NativeStatus::from_errno(errno::EPERM))
        }
        Keyslot::Any => {
            if meta.keyslots.is_empty() {
                return Err(NativeStatus::from_errno(errno::ENOENT));
            }
            meta.keyslots
                .keys()
                .find_map(|slot| unlock_keyslot(meta, *slot, passphrase).map(|key| (*slot, key)))
                .ok_or_else(|| NativeStatus::from_errno(errno::EPERM))
        }
    }
}

/// Resolve a slot for a new keyslot: the requested one if it is free, or the
/// lowest free one for `Any`.
fn free_slot(kind: DeviceKind, meta: &HeaderMetadata, keyslot: Keyslot) -> NativeResult<u32> {
    match keyslot {
        Keyslot::Index(slot) if slot < kind.keyslot_count() && !meta.keyslots.contains_key(&slot) => {
            Ok(slot)
        }
        Keyslot::Index(_) => Err(einval()),
        Keyslot::Any => (0..kind.keyslot_count())
            .find(|slot| !meta.keyslots.contains_key(slot))
            .ok_or_else(einval),
    }
}

fn slot_unavailable(keyslot: Keyslot) -> String {
    match keyslot {
        Keyslot::Any => "All key slots full.".to_string(),
        Keyslot::Index(slot) => format!("Key slot {slot} is full, please select another one."),
    }
}

/// Keyslots a token references. LUKS2 stores them as decimal strings.
fn token_keyslots(token: &Value) -> Vec<u32> {
    token
        .get("keyslots")
        .and_then(Value::as_array)
        .map(|slots| {
            slots
                .iter()
                .filter_map(|slot| match slot {
                    Value::String(text) => text.parse().ok(),
                    Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn set_token_keyslots(token: &mut Value, slots: &[u32]) {
    let mut slots = slots.to_vec();
    slots.sort_unstable();
    slots.dedup();
    token["keyslots"] = Value::Array(
        slots
            .into_iter()
            .map(|slot| Value::String(slot.to_string()))
            .collect(),
    );
}

fn update_assignments(
    context: &mut EmulatedContext,
    token: TokenTarget,
    keyslot: Keyslot,
    assign: bool,
) -> NativeResult<()> {
    let mut meta = context.luks2()?;
    let tokens: Vec<u32> = match token {
        TokenTarget::Any => meta.tokens.keys().copied().collect(),
        TokenTarget::Id(id) => {
            check_token_id(id)?;
            vec![id]
        }
    };
    if tokens.is_empty() || tokens.iter().any(|id| !meta.tokens.contains_key(id)) {
        return Err(NativeStatus::from_errno(errno::ENOENT));
    }
    let slots: Vec<u32> = match keyslot {
        Keyslot::Any => meta.keyslots.keys().copied().collect(),
        Keyslot::Index(slot) if meta.keyslots.contains_key(&slot) => vec![slot],
        Keyslot::Index(_) => return Err(einval()),
    };
    if slots.is_empty() {
        return Err(NativeStatus::from_errno(errno::ENOENT));
    }

    for id in &tokens {
        if let Some(value) = meta.tokens.get_mut(id) {
            let mut current = token_keyslots(value);
            if assign {
                current.extend(&slots);
            } else {
                current.retain(|slot| !slots.contains(slot));
            }
            set_token_keyslots(value, &current);
        }
    }
    context.commit(DeviceKind::Luks2, meta)?;
    let verb = if assign { "assigned to" } else { "unassigned from" };
    context.note(
        LogLevel::Verbose,
        format!("Token {token} {verb} keyslot {keyslot}."),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Luks1Params;
    use tempfile::NamedTempFile;

    fn image(len: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        file
    }

    fn formatted(backend: &EmulatedBackend, path: &Path, variant: HeaderVariant) -> EmulatedContext {
        let mut context = backend.init(path).unwrap();
        let mut variant = variant;
        variant.fill_defaults();
        let mut params = GenericParams::new("aes", "xts-plain64", 32);
        params.fill_defaults();
        backend
            .format(
                &mut context,
                &FormatRequest {
                    variant: &variant,
                    params: &params,
                },
            )
            .unwrap();
        context
    }

    #[test]
    fn keyslot_round_trip_through_header() {
        let backend = EmulatedBackend::with_iterations(10);
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks2Params::default().into());

        let slot = backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Any, None, b"pw1")
            .unwrap();
        assert_eq!(slot, 0);

        let mut reloaded = backend.init(file.path()).unwrap();
        assert_eq!(backend.load(&mut reloaded, None).unwrap(), DeviceKind::Luks2);
        let mut key = Vec::new();
        assert_eq!(
            backend
                .volume_key_get(&mut reloaded, Keyslot::Any, b"pw1", &mut key)
                .unwrap(),
            0
        );
        assert_eq!(key.len(), 32);
        assert_eq!(
            backend
                .volume_key_get(&mut reloaded, Keyslot::Any, b"nope", &mut key)
                .unwrap_err()
                .code(),
            -1
        );
    }

    #[test]
    fn occupied_slot_is_rejected_with_message() {
        let backend = EmulatedBackend::with_iterations(10);
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks1Params::default().into());
        backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Index(3), None, b"pw")
            .unwrap();
        backend.drain_messages(&mut context);

        let err = backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Index(3), None, b"pw")
            .unwrap_err();
        assert_eq!(err.code(), -22);
        let messages = backend.drain_messages(&mut context);
        assert!(messages
            .iter()
            .any(|record| record.message.contains("Key slot 3 is full")));
        assert_eq!(
            backend
                .keyslot_add_by_volume_key(&mut context, Keyslot::Index(8), None, b"pw")
                .unwrap_err()
                .code(),
            -22
        );
    }

    #[test]
    fn mappings_are_shared_between_clones() {
        let backend = EmulatedBackend::with_iterations(10);
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks2Params::default().into());
        backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Any, None, b"pw")
            .unwrap();
        backend
            .activate_by_passphrase(&mut context, Some("vault"), Keyslot::Any, b"pw", ActivateFlags::empty())
            .unwrap();

        let other = backend.clone();
        let info = other.mapping("vault").unwrap();
        assert_eq!(info.offset, 32);
        assert_eq!(info.size, 2048 - 32);
        assert_eq!(info.keyslot, Some(0));

        assert_eq!(
            backend
                .activate_by_passphrase(&mut context, Some("vault"), Keyslot::Any, b"pw", ActivateFlags::empty())
                .unwrap_err()
                .code(),
            -17
        );
        other
            .deactivate(&mut context, "vault", DeactivateFlags::empty())
            .unwrap();
        assert!(backend.active_mappings().is_empty());
    }

    #[test]
    fn token_assignment_uses_string_slots() {
        let backend = EmulatedBackend::with_iterations(10);
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks2Params::default().into());
        backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Index(2), None, b"pw")
            .unwrap();
        let id = backend
            .token_json_set(
                &mut context,
                TokenTarget::Any,
                Some(r#"{"type":"demo","keyslots":[]}"#),
            )
            .unwrap();
        backend
            .token_assign_keyslot(&mut context, TokenTarget::Id(id), Keyslot::Index(2))
            .unwrap();
        let json: Value =
            serde_json::from_str(&backend.token_json_get(&mut context, id).unwrap()).unwrap();
        assert_eq!(json["keyslots"], json!(["2"]));
        backend.token_is_assigned(&mut context, id, 2).unwrap();

        backend
            .token_unassign_keyslot(&mut context, TokenTarget::Id(id), Keyslot::Index(2))
            .unwrap();
        assert_eq!(
            backend.token_is_assigned(&mut context, id, 2).unwrap_err().code(),
            -2
        );
    }

    #[test]
    fn token_handler_unlocks_assigned_keyslot() {
        let backend = EmulatedBackend::with_iterations(10);
        backend.register_token_handler(
            "demo",
            |token: &Value, _pin: Option<&[u8]>, _context: Option<&str>| -> NativeResult<Zeroizing<Vec<u8>>> {
                let secret = token["secret"].as_str().unwrap_or_default();
                Ok(Zeroizing::new(secret.as_bytes().to_vec()))
            },
        );
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks2Params::default().into());
        backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Index(1), None, b"from-token")
            .unwrap();
        backend
            .token_json_set(
                &mut context,
                TokenTarget::Id(0),
                Some(r#"{"type":"demo","keyslots":["1"],"secret":"from-token"}"#),
            )
            .unwrap();

        let slot = backend
            .activate_by_token(
                &mut context,
                &TokenActivation {
                    name: None,
                    token: TokenTarget::Any,
                    token_type: Some("demo"),
                    pin: None,
                    context: None,
                    flags: ActivateFlags::empty(),
                },
            )
            .unwrap();
        assert_eq!(slot, 1);
    }

    #[test]
    fn disabled_external_tokens_skip_handlers() {
        let backend = EmulatedBackend::with_iterations(10).with_external_token_path("/opt/tokens");
        assert_eq!(backend.external_token_path(), Some(Path::new("/opt/tokens")));
        backend.register_token_handler(
            "demo",
            |_token: &Value, _pin: Option<&[u8]>, _context: Option<&str>| -> NativeResult<Zeroizing<Vec<u8>>> {
                Ok(Zeroizing::new(b"pw".to_vec()))
            },
        );
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks2Params::default().into());
        backend
            .keyslot_add_by_volume_key(&mut context, Keyslot::Index(0), None, b"pw")
            .unwrap();
        backend
            .token_json_set(
                &mut context,
                TokenTarget::Id(0),
                Some(r#"{"type":"demo","keyslots":["0"]}"#),
            )
            .unwrap();
        let request = TokenActivation {
            name: None,
            token: TokenTarget::Any,
            token_type: None,
            pin: None,
            context: None,
            flags: ActivateFlags::empty(),
        };
        assert_eq!(backend.activate_by_token(&mut context, &request).unwrap(), 0);

        backend.clone().disable_external_tokens();
        assert_eq!(backend.external_token_path(), None);
        assert_eq!(
            backend.activate_by_token(&mut context, &request).unwrap_err().code(),
            -2
        );
        let messages = backend.drain_messages(&mut context);
        assert!(messages
            .iter()
            .any(|record| record.message.contains("No handler for token 0")));
    }

    #[test]
    fn plain_mapping_resizes_within_device() {
        let backend = EmulatedBackend::with_iterations(10);
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), PlainParams::default().into());
        backend
            .activate_by_passphrase(&mut context, Some("plain-vol"), Keyslot::Any, b"pw", ActivateFlags::empty())
            .unwrap();
        backend.resize(&mut context, "plain-vol", 100).unwrap();
        assert_eq!(backend.mapping("plain-vol").unwrap().size, 100);
        assert_eq!(
            backend.resize(&mut context, "plain-vol", 1 << 30).unwrap_err().code(),
            -22
        );
        assert_eq!(
            backend.resize(&mut context, "missing", 0).unwrap_err().code(),
            -19
        );
        backend
            .deactivate(&mut context, "plain-vol", DeactivateFlags::empty())
            .unwrap();
    }

    #[test]
    fn dump_json_describes_segment() {
        let backend = EmulatedBackend::with_iterations(10);
        let file = image(1 << 20);
        let mut context = formatted(&backend, file.path(), Luks2Params::default().into());
        let json: Value = serde_json::from_str(&backend.dump_json(&mut context).unwrap()).unwrap();
        assert_eq!(json["segments"]["0"]["encryption"], "aes-xts-plain64");
        assert_eq!(json["segments"]["0"]["offset"], "16384");
        assert_eq!(json["digests"]["0"]["type"], "pbkdf2");
    }

    #[test]
    fn small_device_cannot_hold_header() {
        let backend = EmulatedBackend::new();
        let file = image(4096);
        let mut context = backend.init(file.path()).unwrap();
        let mut variant: HeaderVariant = Luks2Params::default().into();
        variant.fill_defaults();
        let mut params = GenericParams::default();
        params.fill_defaults();
        let status = backend
            .format(
                &mut context,
                &FormatRequest {
                    variant: &variant,
                    params: &params,
                },
            )
            .unwrap_err();
        assert_eq!(status.code(), -22);
        assert!(backend.device_kind(&context).is_none());
    }
}
