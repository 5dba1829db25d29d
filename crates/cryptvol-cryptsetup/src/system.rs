//! System-backed `CryptBackend` implementation. It shells out to the platform
//! `cryptsetup` binary, hands secrets over through stdin or scratch key files,
//! and keeps a parsed copy of the header in the handle context.

use crate::command::{CommandRunner, Output};
use crate::parse::{
    created_slot, parse_luks_dump, parse_status, parse_volume_key, unlocked_slot,
};
use crate::scratch::SecretScratch;
use cryptvol_core::config::CryptvolConfig;
use cryptvol_core::error::{errno, CryptError, CryptResult};
use cryptvol_core::wipe::wipe_file;
use cryptvol_core::{
    ActivateFlags, CryptBackend, DeactivateFlags, DeviceKind, FormatRequest, GenericParams,
    HeaderDump, HeaderVariant, Keyslot, LogLevel, LogRecord, Luks1Params, Luks2Params,
    NativeResult, NativeStatus, PlainParams, TokenActivation, TokenTarget, WipePattern,
    WipeRequest,
};
use rand::RngCore;
use serde_json::Value;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// Default locations searched when looking for a `cryptsetup` binary on the host.
pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/sbin/cryptsetup",
    "/usr/sbin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
    "/bin/cryptsetup",
];

const SECTOR: u64 = 512;

/// Activation flags with a direct `cryptsetup open` option.
const FLAG_OPTIONS: &[(ActivateFlags, &str)] = &[
    (ActivateFlags::READONLY, "--readonly"),
    (ActivateFlags::SHARED, "--shared"),
    (ActivateFlags::ALLOW_DISCARDS, "--allow-discards"),
    (ActivateFlags::SAME_CPU_CRYPT, "--perf-same_cpu_crypt"),
    (
        ActivateFlags::SUBMIT_FROM_CRYPT_CPUS,
        "--perf-submit_from_crypt_cpus",
    ),
    (ActivateFlags::NO_JOURNAL, "--integrity-no-journal"),
];

/// `CryptBackend` that drives the native `cryptsetup` CLI.
#[derive(Clone)]
pub struct SystemCryptsetupBackend {
    runner: CommandRunner,
    scratch_dir: Option<PathBuf>,
}

/// Plain mapping parameters; nothing is stored on disk for these.
#[derive(Debug, Clone)]
struct PlainSetup {
    cipher: String,
    key_size: usize,
    params: PlainParams,
}

/// Per-handle state for the system backend.
pub struct SystemContext {
    path: PathBuf,
    data_device: Option<PathBuf>,
    kind: Option<DeviceKind>,
    plain: Option<PlainSetup>,
    dump: Option<HeaderDump>,
    cached_key: Option<Zeroizing<Vec<u8>>>,
    messages: Vec<LogRecord>,
}

impl SystemContext {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            data_device: None,
            kind: None,
            plain: None,
            dump: None,
            cached_key: None,
            messages: Vec::new(),
        }
    }

    fn note(&mut self, level: LogLevel, message: impl Into<String>) {
        self.messages.push(LogRecord::new(level, message));
    }

    fn device_arg(&self) -> String {
        path_arg(&self.path)
    }

    fn luks_kind(&mut self) -> NativeResult<DeviceKind> {
        match self.kind {
            Some(kind) if kind.is_luks() => Ok(kind),
            _ => {
                self.note(LogLevel::Error, "Device is not a LUKS device.");
                Err(einval())
            }
        }
    }

    fn require_luks2(&mut self) -> NativeResult<()> {
        if self.kind == Some(DeviceKind::Luks2) {
            return Ok(());
        }
        self.note(LogLevel::Error, "Tokens are only supported on LUKS2 devices.");
        Err(einval())
    }

    /// Positional device for `open`, adding `--header` when the header is detached.
    fn open_target(&self, args: &mut Vec<String>) -> String {
        match &self.data_device {
            Some(data) => {
                args.push("--header".into());
                args.push(self.device_arg());
                path_arg(data)
            }
            None => self.device_arg(),
        }
    }
}

impl SystemCryptsetupBackend {
    /// Build a backend from the user configuration, falling back to discovery when needed.
    pub fn from_config(config: &CryptvolConfig) -> CryptResult<Self> {
        let timeout = config.command_timeout();
        let runner = match config.cryptsetup_binary_path() {
            Some(path) => Self::runner_with_path(path, timeout)?,
            None => Self::discover_runner(timeout)?,
        };
        Ok(Self {
            runner,
            scratch_dir: config.scratch_dir(),
        })
    }

    /// Construct a backend with an explicit `cryptsetup` path.
    pub fn with_path(path: PathBuf, timeout: Duration) -> CryptResult<Self> {
        Ok(Self {
            runner: Self::runner_with_path(path, timeout)?,
            scratch_dir: None,
        })
    }

    /// Auto-discover the binary using the built-in search paths.
    pub fn discover(timeout: Duration) -> CryptResult<Self> {
        Ok(Self {
            runner: Self::discover_runner(timeout)?,
            scratch_dir: None,
        })
    }

    /// Stage key files under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn binary(&self) -> &Path {
        self.runner.binary()
    }

    /// Validate that the given path exists and wrap it in a `CommandRunner`.
    fn runner_with_path(path: PathBuf, timeout: Duration) -> CryptResult<CommandRunner> {
        if !path.exists() {
            return Err(CryptError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(CommandRunner::new(path, timeout))
    }

    /// Walk through `DEFAULT_CRYPTSETUP_PATHS` until a workable binary is found.
    fn discover_runner(timeout: Duration) -> CryptResult<CommandRunner> {
        for candidate in DEFAULT_CRYPTSETUP_PATHS {
            let p = Path::new(candidate);
            if p.exists() {
                return Self::runner_with_path(p.to_path_buf(), timeout);
            }
        }
        Err(CryptError::InvalidConfig(format!(
            "unable to locate cryptsetup binary; tried {:?}",
            DEFAULT_CRYPTSETUP_PATHS
        )))
    }

    /// Run `cryptsetup` and turn failures into native statuses. Diagnostics
    /// land in the context either way.
    fn run(
        &self,
        context: &mut SystemContext,
        args: &[String],
        input: Option<&[u8]>,
    ) -> NativeResult<Output> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        log::debug!("{} {}", self.runner.binary().display(), argv.join(" "));
        let out = match self.runner.run(&argv, input) {
            Ok(out) => out,
            Err(err) => {
                context.note(LogLevel::Error, err.to_string());
                return Err(NativeStatus::from_errno(errno::EIO));
            }
        };
        if out.status != 0 {
            let status = exit_status(&out);
            for line in out.diagnostic().lines().filter(|l| !l.trim().is_empty()) {
                context.note(LogLevel::Error, line.trim());
            }
            log::debug!(
                "cryptsetup {} exited with code {} ({})",
                argv.first().copied().unwrap_or_default(),
                out.status,
                status
            );
            return Err(status);
        }
        for line in out.stderr.lines().filter(|l| !l.trim().is_empty()) {
            context.note(LogLevel::Normal, line.trim());
        }
        Ok(out)
    }

    fn scratch(&self, context: &mut SystemContext) -> NativeResult<SecretScratch> {
        host_io(context, SecretScratch::new(self.scratch_dir.as_deref()))
    }

    fn stage(
        context: &mut SystemContext,
        scratch: &mut SecretScratch,
        name: &str,
        secret: &[u8],
    ) -> NativeResult<String> {
        let path = host_io(context, scratch.stage(name, secret))?;
        Ok(path_arg(&path))
    }

    /// Re-read the header and cache the parsed result.
    fn refresh(&self, context: &mut SystemContext) -> NativeResult<HeaderDump> {
        let args = vec!["luksDump".to_string(), context.device_arg()];
        let out = self.run(context, &args, None)?;
        let Some(dump) = parse_luks_dump(&out.stdout) else {
            let message = format!("Device {} is not a valid LUKS device.", context.path.display());
            context.note(LogLevel::Error, message);
            return Err(einval());
        };
        context.dump = Some(dump.clone());
        Ok(dump)
    }

    fn format_luks(
        &self,
        context: &mut SystemContext,
        variant: &HeaderVariant,
        params: &GenericParams,
        volume_key: &[u8],
    ) -> NativeResult<()> {
        let mut scratch = self.scratch(context)?;
        let mut bootstrap = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(bootstrap.as_mut_slice());
        let bootstrap = Zeroizing::new(hex::encode(bootstrap.as_slice()));
        let key_file = Self::stage(context, &mut scratch, "bootstrap", bootstrap.as_bytes())?;
        let volume_key_file = Self::stage(context, &mut scratch, "volume-key", volume_key)?;

        let mut args = match variant {
            HeaderVariant::Luks1(luks1) => luks1_format_args(luks1),
            HeaderVariant::Luks2(luks2) => {
                if let Some(integrity) = &luks2.integrity_params {
                    if integrity.journal_crypt.is_some() || integrity.journal_integrity.is_some() {
                        context.note(
                            LogLevel::Error,
                            "Journal encryption and integrity are not supported by cryptsetup luksFormat.",
                        );
                        return Err(NativeStatus::from_errno(errno::ENOTSUP));
                    }
                }
                luks2_format_args(luks2)
            }
            HeaderVariant::Plain(_) => return Err(einval()),
        };
        args.extend(generic_format_args(params, volume_key.len()));
        args.extend([
            "--key-file".to_string(),
            key_file,
            "--volume-key-file".to_string(),
            volume_key_file,
        ]);
        let data_device = match variant {
            HeaderVariant::Luks1(Luks1Params { data_device, .. })
            | HeaderVariant::Luks2(Luks2Params { data_device, .. }) => {
                data_device.as_ref().map(PathBuf::from)
            }
            HeaderVariant::Plain(_) => None,
        };
        if let Some(data) = &data_device {
            args.extend(["--header".to_string(), context.device_arg(), path_arg(data)]);
        } else {
            args.push(context.device_arg());
        }
        self.run(context, &args, None)?;

        // The bootstrap passphrase only exists to satisfy luksFormat.
        let kill = vec![
            "luksKillSlot".to_string(),
            "--batch-mode".to_string(),
            context.device_arg(),
            "0".to_string(),
        ];
        self.run(context, &kill, None)?;

        context.kind = Some(variant.kind());
        context.data_device = data_device;
        self.refresh(context)?;
        Ok(())
    }

    fn format_plain(
        &self,
        context: &mut SystemContext,
        plain: &PlainParams,
        params: &GenericParams,
        key_size: usize,
    ) -> NativeResult<()> {
        let start = plain.offset.saturating_mul(SECTOR);
        let len = fs::metadata(&context.path).map(|m| m.len()).unwrap_or(0);
        if len >= start.saturating_add(SECTOR) {
            let request = WipeRequest::new(WipePattern::Random)
                .with_range(start, SECTOR)
                .with_block_size(SECTOR as usize);
            wipe_file(&context.path, &request, &mut |_, _| 0)?;
        } else {
            log::debug!(
                "skipping payload scrub on {}: {len} bytes visible",
                context.path.display()
            );
        }
        context.plain = Some(PlainSetup {
            cipher: params.cipher_spec(),
            key_size,
            params: plain.clone(),
        });
        context.kind = Some(DeviceKind::Plain);
        Ok(())
    }

    /// Arguments shared by every plain `open`.
    fn plain_open_args(setup: &PlainSetup) -> Vec<String> {
        let params = &setup.params;
        let mut args = vec![
            "open".to_string(),
            "--type".into(),
            "plain".into(),
            "--cipher".into(),
            setup.cipher.clone(),
            "--key-size".into(),
            (setup.key_size * 8).to_string(),
            "--offset".into(),
            params.offset.to_string(),
            "--skip".into(),
            params.skip.to_string(),
        ];
        if params.size > 0 {
            args.extend(["--size".to_string(), params.size.to_string()]);
        }
        if params.sector_size > 0 && u64::from(params.sector_size) != SECTOR {
            args.extend(["--sector-size".to_string(), params.sector_size.to_string()]);
        }
        args
    }

    fn plain_setup(context: &mut SystemContext) -> NativeResult<PlainSetup> {
        match &context.plain {
            Some(setup) => Ok(setup.clone()),
            None => {
                context.note(LogLevel::Error, "Plain device parameters are not set.");
                Err(einval())
            }
        }
    }

    /// Find the slot a passphrase opens without touching the mapping table.
    fn passphrase_slot(
        &self,
        context: &mut SystemContext,
        keyslot: Keyslot,
        passphrase: &[u8],
    ) -> NativeResult<u32> {
        let mut args = vec![
            "open".to_string(),
            "--test-passphrase".into(),
            "--verbose".into(),
            "--key-file".into(),
            "-".into(),
        ];
        push_keyslot(&mut args, keyslot);
        args.push(context.device_arg());
        let out = self.run(context, &args, Some(passphrase))?;
        reported_slot(context, &out, unlocked_slot, keyslot)
    }

    fn token_json(&self, context: &mut SystemContext, token: u32) -> NativeResult<Value> {
        check_token_id(context, token)?;
        let dump = self.refresh(context)?;
        if !dump.tokens.contains(&token) {
            return Err(NativeStatus::from_errno(errno::ENOENT));
        }
        let args = vec![
            "token".to_string(),
            "export".into(),
            "--token-id".into(),
            token.to_string(),
            context.device_arg(),
        ];
        let out = self.run(context, &args, None)?;
        serde_json::from_str(out.stdout.trim()).map_err(|err| {
            context.note(LogLevel::Error, format!("Token {token} is not valid JSON: {err}"));
            einval()
        })
    }

    fn import_token(
        &self,
        context: &mut SystemContext,
        token: u32,
        json: &str,
        replace: bool,
    ) -> NativeResult<()> {
        let mut scratch = self.scratch(context)?;
        let json_file = Self::stage(context, &mut scratch, "token.json", json.as_bytes())?;
        let mut args = vec!["token".to_string(), "import".into()];
        if replace {
            args.push("--token-replace".into());
        }
        args.extend([
            "--token-id".to_string(),
            token.to_string(),
            "--json-file".into(),
            json_file,
            context.device_arg(),
        ]);
        self.run(context, &args, None)?;
        Ok(())
    }

    fn update_assignments(
        &self,
        context: &mut SystemContext,
        token: TokenTarget,
        keyslot: Keyslot,
        assign: bool,
    ) -> NativeResult<()> {
        context.require_luks2()?;
        let dump = self.refresh(context)?;
        let tokens = match token {
            TokenTarget::Any if dump.tokens.is_empty() => {
                return Err(NativeStatus::from_errno(errno::ENOENT))
            }
            TokenTarget::Any => dump.tokens.clone(),
            TokenTarget::Id(id) if dump.tokens.contains(&id) => vec![id],
            TokenTarget::Id(_) => return Err(NativeStatus::from_errno(errno::ENOENT)),
        };
        let slots = match keyslot {
            Keyslot::Any if dump.keyslots.is_empty() => {
                return Err(NativeStatus::from_errno(errno::ENOENT))
            }
            Keyslot::Any => dump.keyslots.clone(),
            Keyslot::Index(n) if dump.keyslots.contains(&n) => vec![n],
            Keyslot::Index(n) => {
                context.note(LogLevel::Error, format!("Keyslot {n} is not active."));
                return Err(einval());
            }
        };

        for id in tokens {
            let mut json = self.token_json(context, id)?;
            let mut assigned = token_keyslots(&json);
            if assign {
                assigned.extend(&slots);
            } else {
                assigned.retain(|slot| !slots.contains(slot));
            }
            set_token_keyslots(&mut json, assigned);
            self.import_token(context, id, &json.to_string(), true)?;
        }
        self.refresh(context)?;
        let verb = if assign { "assigned to" } else { "unassigned from" };
        context.note(
            LogLevel::Verbose,
            format!("Keyslot {keyslot} {verb} token {token}."),
        );
        Ok(())
    }
}

impl CryptBackend for SystemCryptsetupBackend {
    type Context = SystemContext;

    fn init(&self, path: &Path) -> NativeResult<SystemContext> {
        match fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => Ok(SystemContext::new(path.to_path_buf())),
            Ok(_) | Err(_) => {
                log::debug!("{} is not a usable device", path.display());
                Err(NativeStatus::from_errno(errno::ENOTBLK))
            }
        }
    }

    fn init_by_name(&self, name: &str) -> NativeResult<SystemContext> {
        let mut context = SystemContext::new(PathBuf::new());
        let out = self.run(&mut context, &["status".to_string(), name.to_string()], None)?;
        let status = parse_status(&out.stdout);
        let Some(device) = status.device else {
            return Err(NativeStatus::from_errno(errno::ENODEV));
        };
        context.path = device;
        context.kind = status.kind;
        match status.kind {
            Some(DeviceKind::Plain) => {
                context.plain = Some(PlainSetup {
                    cipher: status.cipher.unwrap_or_default(),
                    key_size: status.key_size,
                    params: PlainParams {
                        offset: status.offset,
                        size: status.size,
                        ..PlainParams::default()
                    },
                });
            }
            Some(_) => {
                if self.refresh(&mut context).is_err() {
                    log::warn!("mapping {name} is active but its header could not be read");
                }
            }
            None => {}
        }
        Ok(context)
    }

    fn release(&self, mut context: SystemContext) {
        context.cached_key = None;
        log::debug!("released handle for {}", context.path.display());
    }

    fn device_kind(&self, context: &SystemContext) -> Option<DeviceKind> {
        context.kind
    }

    fn device_path<'c>(&self, context: &'c SystemContext) -> &'c Path {
        &context.path
    }

    fn uuid(&self, context: &SystemContext) -> Option<String> {
        context.dump.as_ref().and_then(|dump| dump.uuid.clone())
    }

    fn volume_key_size(&self, context: &SystemContext) -> usize {
        if let Some(dump) = &context.dump {
            return dump.volume_key_size;
        }
        if let Some(plain) = &context.plain {
            return plain.key_size;
        }
        context.cached_key.as_ref().map(|key| key.len()).unwrap_or(0)
    }

    fn format(&self, context: &mut SystemContext, request: &FormatRequest<'_>) -> NativeResult<()> {
        if context.kind.is_some() {
            context.note(LogLevel::Error, "Context is already formatted.");
            return Err(einval());
        }
        let params = request.params;
        let volume_key = match &params.volume_key {
            Some(key) if key.len() != params.volume_key_size => {
                context.note(LogLevel::Error, "Volume key size does not match.");
                return Err(einval());
            }
            Some(key) => key.clone(),
            None => {
                let mut key = Zeroizing::new(vec![0u8; params.volume_key_size]);
                rand::thread_rng().fill_bytes(key.as_mut_slice());
                key
            }
        };

        match request.variant {
            HeaderVariant::Plain(plain) => {
                self.format_plain(context, plain, params, volume_key.len())?
            }
            variant => self.format_luks(context, variant, params, &volume_key)?,
        }
        context.cached_key = Some(volume_key);
        Ok(())
    }

    fn load(
        &self,
        context: &mut SystemContext,
        variant: Option<&HeaderVariant>,
    ) -> NativeResult<DeviceKind> {
        let dump = self.refresh(context)?;
        if let Some(variant) = variant {
            if variant.kind() != dump.kind {
                let message = format!(
                    "Device {} is {}, not {}.",
                    context.path.display(),
                    dump.kind,
                    variant.kind()
                );
                context.note(LogLevel::Error, message);
                return Err(einval());
            }
            if let HeaderVariant::Luks1(Luks1Params { data_device, .. })
            | HeaderVariant::Luks2(Luks2Params { data_device, .. }) = variant
            {
                context.data_device = data_device.as_ref().map(PathBuf::from);
            }
        }
        context.kind = Some(dump.kind);
        Ok(dump.kind)
    }

    fn dump(&self, context: &mut SystemContext) -> NativeResult<HeaderDump> {
        let dump = match context.kind {
            Some(DeviceKind::Plain) => {
                let setup = Self::plain_setup(context)?;
                let (cipher, mode) = setup
                    .cipher
                    .split_once('-')
                    .map(|(c, m)| (c.to_string(), m.to_string()))
                    .unwrap_or((setup.cipher.clone(), String::new()));
                HeaderDump {
                    kind: DeviceKind::Plain,
                    uuid: None,
                    cipher,
                    cipher_mode: mode,
                    hash: Some(setup.params.hash.clone()),
                    volume_key_size: setup.key_size,
                    data_offset: setup.params.offset,
                    sector_size: setup.params.sector_size,
                    label: None,
                    keyslots: Vec::new(),
                    tokens: Vec::new(),
                }
            }
            Some(_) => self.refresh(context)?,
            None => {
                context.note(LogLevel::Error, "Device type is not set.");
                return Err(einval());
            }
        };
        context.note(LogLevel::Normal, dump.to_string());
        Ok(dump)
    }

    fn dump_json(&self, context: &mut SystemContext) -> NativeResult<String> {
        if context.kind != Some(DeviceKind::Luks2) {
            context.note(LogLevel::Error, "JSON metadata requires a LUKS2 device.");
            return Err(einval());
        }
        let args = vec![
            "luksDump".to_string(),
            "--dump-json-metadata".into(),
            context.device_arg(),
        ];
        let out = self.run(context, &args, None)?;
        let text = out.stdout.trim();
        if let Err(err) = serde_json::from_str::<Value>(text) {
            context.note(LogLevel::Error, format!("Unreadable JSON metadata: {err}"));
            return Err(einval());
        }
        Ok(text.to_string())
    }

    fn resize(&self, context: &mut SystemContext, name: &str, new_size: u64) -> NativeResult<()> {
        if context.kind.is_none() {
            context.note(LogLevel::Error, "Device type is not set.");
            return Err(einval());
        }
        let mut args = vec!["resize".to_string()];
        if new_size > 0 {
            args.extend(["--size".to_string(), new_size.to_string()]);
        }
        args.push(name.to_string());
        self.run(context, &args, None)?;
        context.note(LogLevel::Verbose, format!("Resized {name}."));
        Ok(())
    }

    fn wipe(
        &self,
        context: &mut SystemContext,
        request: &WipeRequest,
        progress: &mut dyn FnMut(u64, u64) -> i32,
    ) -> NativeResult<()> {
        let target = request.path.clone().unwrap_or_else(|| context.path.clone());
        match wipe_file(&target, request, progress) {
            Ok(written) => {
                context.note(
                    LogLevel::Verbose,
                    format!(
                        "Wiped {written} bytes of {} with {} pattern.",
                        target.display(),
                        request.pattern.name()
                    ),
                );
                Ok(())
            }
            Err(status) => {
                if status.code() == -errno::EINTR {
                    context.note(LogLevel::Error, "Wipe interrupted.");
                }
                Err(status)
            }
        }
    }

    fn activate_by_passphrase(
        &self,
        context: &mut SystemContext,
        name: Option<&str>,
        keyslot: Keyslot,
        passphrase: &[u8],
        flags: ActivateFlags,
    ) -> NativeResult<u32> {
        match context.kind {
            None => {
                context.note(LogLevel::Error, "Device type is not set.");
                Err(einval())
            }
            Some(DeviceKind::Plain) => {
                let setup = Self::plain_setup(context)?;
                let Some(name) = name else {
                    // Any passphrase yields some key for a plain mapping.
                    return Ok(0);
                };
                let mut args = Self::plain_open_args(&setup);
                args.extend([
                    "--hash".to_string(),
                    setup.params.hash.clone(),
                    "--key-file".into(),
                    "-".into(),
                ]);
                args.extend(flag_args(flags));
                args.extend([context.device_arg(), name.to_string()]);
                self.run(context, &args, Some(passphrase))?;
                Ok(0)
            }
            Some(kind) => {
                let mut args = vec![
                    "open".to_string(),
                    "--type".into(),
                    luks_type(kind).into(),
                    "--verbose".into(),
                    "--key-file".into(),
                    "-".into(),
                ];
                push_keyslot(&mut args, keyslot);
                args.extend(flag_args(flags));
                match name {
                    Some(name) => {
                        let device = context.open_target(&mut args);
                        args.extend([device, name.to_string()]);
                    }
                    None => {
                        args.push("--test-passphrase".into());
                        args.push(context.device_arg());
                    }
                }
                let out = self.run(context, &args, Some(passphrase))?;
                reported_slot(context, &out, unlocked_slot, keyslot)
            }
        }
    }

    fn activate_by_volume_key(
        &self,
        context: &mut SystemContext,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        volume_key_size: usize,
        flags: ActivateFlags,
    ) -> NativeResult<()> {
        let Some(kind) = context.kind else {
            context.note(LogLevel::Error, "Device type is not set.");
            return Err(einval());
        };
        let key = match volume_key {
            Some(key) => Zeroizing::new(key.to_vec()),
            None => match &context.cached_key {
                Some(key) => key.clone(),
                None => {
                    context.note(LogLevel::Error, "No cached volume key; pass one explicitly.");
                    return Err(einval());
                }
            },
        };
        let expected = self.volume_key_size(context);
        if key.len() != volume_key_size || (expected != 0 && expected != volume_key_size) {
            context.note(LogLevel::Error, "Volume key size does not match.");
            return Err(einval());
        }

        let mut scratch = self.scratch(context)?;
        let key_file = Self::stage(context, &mut scratch, "volume-key", &key)?;
        let args = if kind == DeviceKind::Plain {
            let setup = Self::plain_setup(context)?;
            let Some(name) = name else {
                return Ok(());
            };
            let mut args = Self::plain_open_args(&setup);
            args.extend([
                "--hash".to_string(),
                "plain".into(),
                "--key-file".into(),
                key_file,
                "--keyfile-size".into(),
                key.len().to_string(),
            ]);
            args.extend(flag_args(flags));
            args.extend([context.device_arg(), name.to_string()]);
            args
        } else {
            let mut args = vec![
                "open".to_string(),
                "--type".into(),
                luks_type(kind).into(),
                "--volume-key-file".into(),
                key_file,
            ];
            args.extend(flag_args(flags));
            match name {
                Some(name) => {
                    let device = context.open_target(&mut args);
                    args.extend([device, name.to_string()]);
                }
                None => {
                    args.push("--test-passphrase".into());
                    args.push(context.device_arg());
                }
            }
            args
        };
        self.run(context, &args, None)?;
        Ok(())
    }

    fn activate_by_token(
        &self,
        context: &mut SystemContext,
        request: &TokenActivation<'_>,
    ) -> NativeResult<u32> {
        context.require_luks2()?;
        if request.context.is_some() {
            log::debug!("cryptsetup CLI has no channel for token context data; ignoring it");
        }
        let mut args = vec![
            "open".to_string(),
            "--type".into(),
            "luks2".into(),
            "--token-only".into(),
            "--verbose".into(),
        ];
        if let TokenTarget::Id(id) = request.token {
            args.extend(["--token-id".to_string(), id.to_string()]);
        }
        if let Some(token_type) = request.token_type {
            args.extend(["--token-type".to_string(), token_type.to_string()]);
        }
        args.extend(flag_args(request.flags));
        match request.name {
            Some(name) => {
                let device = context.open_target(&mut args);
                args.extend([device, name.to_string()]);
            }
            None => {
                args.push("--test-passphrase".into());
                args.push(context.device_arg());
            }
        }
        let pin = request.pin.map(|pin| {
            let mut line = Zeroizing::new(pin.to_vec());
            line.push(b'\n');
            line
        });
        let out = self.run(context, &args, pin.as_deref().map(|p| p.as_slice()))?;
        reported_slot(context, &out, unlocked_slot, Keyslot::Any)
    }

    fn deactivate(
        &self,
        context: &mut SystemContext,
        name: &str,
        flags: DeactivateFlags,
    ) -> NativeResult<()> {
        if flags.contains(DeactivateFlags::FORCE) {
            context.note(LogLevel::Error, "Forced removal is not supported by cryptsetup close.");
            return Err(NativeStatus::from_errno(errno::ENOTSUP));
        }
        let mut args = vec!["close".to_string()];
        if flags.contains(DeactivateFlags::DEFERRED) {
            args.push("--deferred".into());
        }
        args.push(name.to_string());
        self.run(context, &args, None)?;
        if flags.contains(DeactivateFlags::DEFERRED) {
            context.note(LogLevel::Verbose, format!("Deferred removal of {name} scheduled."));
        }
        Ok(())
    }

    fn keyslot_add_by_volume_key(
        &self,
        context: &mut SystemContext,
        keyslot: Keyslot,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> NativeResult<u32> {
        context.luks_kind()?;
        let key = match (volume_key, &context.cached_key) {
            (Some(key), _) => Zeroizing::new(key.to_vec()),
            (None, Some(cached)) => cached.clone(),
            (None, None) => {
                context.note(LogLevel::Error, "No cached volume key; pass one explicitly.");
                return Err(einval());
            }
        };
        let mut scratch = self.scratch(context)?;
        let key_file = Self::stage(context, &mut scratch, "volume-key", &key)?;
        let new_file = Self::stage(context, &mut scratch, "new-passphrase", passphrase)?;
        let mut args = vec![
            "luksAddKey".to_string(),
            "--batch-mode".into(),
            "--verbose".into(),
            "--volume-key-file".into(),
            key_file,
        ];
        push_keyslot(&mut args, keyslot);
        args.extend([context.device_arg(), new_file]);
        let out = self.run(context, &args, None)?;
        let slot = reported_slot(context, &out, created_slot, keyslot)?;
        self.refresh(context)?;
        Ok(slot)
    }

    fn keyslot_add_by_passphrase(
        &self,
        context: &mut SystemContext,
        keyslot: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> NativeResult<u32> {
        context.luks_kind()?;
        let mut scratch = self.scratch(context)?;
        let new_file = Self::stage(context, &mut scratch, "new-passphrase", new_passphrase)?;
        let mut args = vec![
            "luksAddKey".to_string(),
            "--batch-mode".into(),
            "--verbose".into(),
            "--key-file".into(),
            "-".into(),
        ];
        push_keyslot(&mut args, keyslot);
        args.extend([context.device_arg(), new_file]);
        let out = self.run(context, &args, Some(passphrase))?;
        let slot = reported_slot(context, &out, created_slot, keyslot)?;
        self.refresh(context)?;
        Ok(slot)
    }

    fn keyslot_change_by_passphrase(
        &self,
        context: &mut SystemContext,
        current: Keyslot,
        new: Keyslot,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> NativeResult<u32> {
        let kind = context.luks_kind()?;
        let old = self.passphrase_slot(context, current, passphrase)?;
        let dump = self.refresh(context)?;
        let target = match new {
            Keyslot::Index(n) if n == old => n,
            Keyslot::Index(n) if n < kind.keyslot_count() && !dump.keyslots.contains(&n) => n,
            Keyslot::Index(n) => {
                context.note(
                    LogLevel::Error,
                    format!("Key slot {n} is full, please select another one."),
                );
                return Err(einval());
            }
            Keyslot::Any => (0..kind.keyslot_count())
                .find(|n| !dump.keyslots.contains(n))
                .unwrap_or(old),
        };

        let mut scratch = self.scratch(context)?;
        let new_file = Self::stage(context, &mut scratch, "new-passphrase", new_passphrase)?;
        if target == old {
            let args = vec![
                "luksChangeKey".to_string(),
                "--batch-mode".into(),
                "--verbose".into(),
                "--key-file".into(),
                "-".into(),
                "--key-slot".into(),
                old.to_string(),
                context.device_arg(),
                new_file,
            ];
            self.run(context, &args, Some(passphrase))?;
        } else {
            let add = vec![
                "luksAddKey".to_string(),
                "--batch-mode".into(),
                "--verbose".into(),
                "--key-file".into(),
                "-".into(),
                "--key-slot".into(),
                target.to_string(),
                context.device_arg(),
                new_file,
            ];
            self.run(context, &add, Some(passphrase))?;
            let kill = vec![
                "luksKillSlot".to_string(),
                "--batch-mode".into(),
                context.device_arg(),
                old.to_string(),
            ];
            self.run(context, &kill, None)?;
        }
        self.refresh(context)?;
        context.note(
            LogLevel::Verbose,
            format!("Key slot {old} changed into key slot {target}."),
        );
        Ok(target)
    }

    fn volume_key_get(
        &self,
        context: &mut SystemContext,
        keyslot: Keyslot,
        passphrase: &[u8],
        out: &mut Vec<u8>,
    ) -> NativeResult<u32> {
        match context.kind {
            Some(DeviceKind::Plain) => {
                context.note(
                    LogLevel::Error,
                    "cryptsetup cannot derive a plain volume key without activating it.",
                );
                return Err(NativeStatus::from_errno(errno::ENOTSUP));
            }
            None => {
                context.note(LogLevel::Error, "Device type is not set.");
                return Err(einval());
            }
            Some(_) => {}
        }
        let mut args = vec![
            "luksDump".to_string(),
            "--dump-volume-key".into(),
            "--batch-mode".into(),
            "--verbose".into(),
            "--key-file".into(),
            "-".into(),
        ];
        push_keyslot(&mut args, keyslot);
        args.push(context.device_arg());
        let output = self.run(context, &args, Some(passphrase))?;
        let Some(key) = parse_volume_key(&output.stdout) else {
            context.note(LogLevel::Error, "cryptsetup printed no volume key.");
            return Err(NativeStatus::from_errno(errno::EIO));
        };
        let slot = reported_slot(context, &output, unlocked_slot, keyslot)?;
        out.clear();
        out.extend_from_slice(&key);
        Ok(slot)
    }

    fn token_json_get(&self, context: &mut SystemContext, token: u32) -> NativeResult<String> {
        context.require_luks2()?;
        Ok(self.token_json(context, token)?.to_string())
    }

    fn token_json_set(
        &self,
        context: &mut SystemContext,
        token: TokenTarget,
        json: Option<&str>,
    ) -> NativeResult<u32> {
        context.require_luks2()?;
        let Some(json) = json else {
            let TokenTarget::Id(id) = token else {
                context.note(LogLevel::Error, "Removing a token needs an explicit id.");
                return Err(einval());
            };
            check_token_id(context, id)?;
            if !self.refresh(context)?.tokens.contains(&id) {
                return Err(NativeStatus::from_errno(errno::ENOENT));
            }
            let args = vec![
                "token".to_string(),
                "remove".into(),
                "--token-id".into(),
                id.to_string(),
                context.device_arg(),
            ];
            self.run(context, &args, None)?;
            self.refresh(context)?;
            return Ok(id);
        };

        let valid = serde_json::from_str::<Value>(json).ok().filter(|value| {
            value.get("type").map_or(false, Value::is_string)
                && value.get("keyslots").map_or(false, Value::is_array)
        });
        if valid.is_none() {
            context.note(LogLevel::Error, "Token JSON needs a string type and a keyslots array.");
            return Err(einval());
        }

        let dump = self.refresh(context)?;
        let id = match token {
            TokenTarget::Id(id) => {
                check_token_id(context, id)?;
                if dump.tokens.contains(&id) {
                    context.note(LogLevel::Error, format!("Token {id} is in use."));
                    return Err(einval());
                }
                id
            }
            TokenTarget::Any => {
                match (0..DeviceKind::Luks2.token_count()).find(|id| !dump.tokens.contains(id)) {
                    Some(id) => id,
                    None => {
                        context.note(LogLevel::Error, "No free token slot.");
                        return Err(einval());
                    }
                }
            }
        };
        self.import_token(context, id, json, false)?;
        self.refresh(context)?;
        Ok(id)
    }

    fn token_assign_keyslot(
        &self,
        context: &mut SystemContext,
        token: TokenTarget,
        keyslot: Keyslot,
    ) -> NativeResult<()> {
        self.update_assignments(context, token, keyslot, true)
    }

    fn token_unassign_keyslot(
        &self,
        context: &mut SystemContext,
        token: TokenTarget,
        keyslot: Keyslot,
    ) -> NativeResult<()> {
        self.update_assignments(context, token, keyslot, false)
    }

    fn token_is_assigned(
        &self,
        context: &mut SystemContext,
        token: u32,
        keyslot: u32,
    ) -> NativeResult<()> {
        context.require_luks2()?;
        if keyslot >= DeviceKind::Luks2.keyslot_count() {
            return Err(einval());
        }
        let json = self.token_json(context, token)?;
        if token_keyslots(&json).contains(&keyslot) {
            Ok(())
        } else {
            Err(NativeStatus::from_errno(errno::ENOENT))
        }
    }

    fn drain_messages(&self, context: &mut SystemContext) -> Vec<LogRecord> {
        mem::take(&mut context.messages)
    }
}

fn einval() -> NativeStatus {
    NativeStatus::from_errno(errno::EINVAL)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn luks_type(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Luks1 => "luks1",
        _ => "luks2",
    }
}

/// Note a host-side failure (scratch files, temp dirs) and report EIO.
fn host_io<T>(context: &mut SystemContext, result: CryptResult<T>) -> NativeResult<T> {
    result.map_err(|err| {
        context.note(LogLevel::Error, err.to_string());
        NativeStatus::from_errno(errno::EIO)
    })
}

fn check_token_id(context: &mut SystemContext, token: u32) -> NativeResult<()> {
    if token >= DeviceKind::Luks2.token_count() {
        context.note(LogLevel::Error, format!("Token {token} is out of range."));
        return Err(einval());
    }
    Ok(())
}

fn push_keyslot(args: &mut Vec<String>, keyslot: Keyslot) {
    if let Keyslot::Index(n) = keyslot {
        args.extend(["--key-slot".to_string(), n.to_string()]);
    }
}

/// Slot named in verbose output, else the one the caller asked for.
fn reported_slot(
    context: &mut SystemContext,
    out: &Output,
    extract: fn(&str) -> Option<u32>,
    requested: Keyslot,
) -> NativeResult<u32> {
    let text = format!("{}\n{}", out.stdout, out.stderr);
    match extract(&text).or(requested.index()) {
        Some(slot) => Ok(slot),
        None => {
            context.note(LogLevel::Error, "cryptsetup did not report a key slot.");
            Err(NativeStatus::from_errno(errno::EIO))
        }
    }
}

/// Map a non-zero `cryptsetup` exit into a native status. The CLI folds
/// several errno values into one exit code, so a few diagnostics refine it.
fn exit_status(out: &Output) -> NativeStatus {
    let diagnostic = out.diagnostic().to_ascii_lowercase();
    if diagnostic.contains("does not match the volume")
        || diagnostic.contains("no key available")
    {
        return NativeStatus::from_errno(errno::EPERM);
    }
    if diagnostic.contains("no usable token") || diagnostic.contains("is not in use") {
        return NativeStatus::from_errno(errno::ENOENT);
    }
    let code = match out.status {
        1 => errno::EINVAL,
        2 => errno::EPERM,
        3 => errno::ENOMEM,
        4 => errno::ENODEV,
        5 => errno::EEXIST,
        _ => errno::EIO,
    };
    NativeStatus::from_errno(code)
}

/// `cryptsetup open` options for `flags`; the rest are logged and dropped.
fn flag_args(flags: ActivateFlags) -> Vec<String> {
    let mut args = Vec::new();
    let mut handled = ActivateFlags::empty();
    for (flag, option) in FLAG_OPTIONS {
        if flags.contains(*flag) {
            args.push((*option).to_string());
            handled.insert(*flag);
        }
    }
    let rest = ActivateFlags::from_bits_retain(flags.bits() & !handled.bits());
    if !rest.is_empty() {
        log::debug!("no cryptsetup option for activation flags {:?}", rest.labels());
    }
    args
}

fn generic_format_args(params: &GenericParams, key_len: usize) -> Vec<String> {
    let mut args = vec![
        "--cipher".to_string(),
        params.cipher_spec(),
        "--key-size".into(),
        (key_len * 8).to_string(),
    ];
    if let Some(uuid) = &params.uuid {
        args.extend(["--uuid".to_string(), uuid.clone()]);
    }
    args
}

fn luks1_format_args(params: &Luks1Params) -> Vec<String> {
    let mut args = vec![
        "luksFormat".to_string(),
        "--batch-mode".into(),
        "--type".into(),
        "luks1".into(),
        "--hash".into(),
        params.hash.clone(),
    ];
    if params.data_alignment > 0 {
        args.extend(["--align-payload".to_string(), params.data_alignment.to_string()]);
    }
    args
}

fn luks2_format_args(params: &Luks2Params) -> Vec<String> {
    let mut args = vec![
        "luksFormat".to_string(),
        "--batch-mode".into(),
        "--type".into(),
        "luks2".into(),
    ];
    if params.sector_size > 0 {
        args.extend(["--sector-size".to_string(), params.sector_size.to_string()]);
    }
    if let Some(label) = &params.label {
        args.extend(["--label".to_string(), label.clone()]);
    }
    if let Some(subsystem) = &params.subsystem {
        args.extend(["--subsystem".to_string(), subsystem.clone()]);
    }
    if let Some(pbkdf) = &params.pbkdf {
        args.extend(["--pbkdf".to_string(), pbkdf.kind.clone()]);
        if !pbkdf.hash.is_empty() {
            args.extend(["--hash".to_string(), pbkdf.hash.clone()]);
        }
        if pbkdf.iterations > 0 {
            args.extend([
                "--pbkdf-force-iterations".to_string(),
                pbkdf.iterations.to_string(),
            ]);
        } else if pbkdf.time_ms > 0 {
            args.extend(["--iter-time".to_string(), pbkdf.time_ms.to_string()]);
        }
        if pbkdf.max_memory_kb > 0 {
            args.extend(["--pbkdf-memory".to_string(), pbkdf.max_memory_kb.to_string()]);
        }
        if pbkdf.parallel_threads > 0 {
            args.extend([
                "--pbkdf-parallel".to_string(),
                pbkdf.parallel_threads.to_string(),
            ]);
        }
    }
    if let Some(integrity) = &params.integrity {
        args.extend(["--integrity".to_string(), integrity.clone()]);
    }
    if params.data_alignment > 0 {
        args.extend(["--align-payload".to_string(), params.data_alignment.to_string()]);
    }
    args
}

/// Keyslots listed by a token, accepting strings or bare numbers.
fn token_keyslots(json: &Value) -> Vec<u32> {
    json.get("keyslots")
        .and_then(Value::as_array)
        .map(|slots| {
            slots
                .iter()
                .filter_map(|slot| match slot {
                    Value::String(s) => s.parse().ok(),
                    Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn set_token_keyslots(json: &mut Value, mut slots: Vec<u32>) {
    slots.sort_unstable();
    slots.dedup();
    if let Some(object) = json.as_object_mut() {
        object.insert(
            "keyslots".into(),
            Value::Array(slots.iter().map(|s| Value::String(s.to_string())).collect()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptvol_core::PbkdfType;

    fn output(status: i32, stderr: &str) -> Output {
        Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status,
        }
    }

    #[test]
    fn exit_codes_map_to_errno() {
        assert_eq!(exit_status(&output(1, "bad option")).code(), -22);
        assert_eq!(exit_status(&output(2, "")).code(), -1);
        assert_eq!(exit_status(&output(3, "")).code(), -12);
        assert_eq!(exit_status(&output(4, "Device x is not active.")).code(), -19);
        assert_eq!(exit_status(&output(5, "Device x already exists.")).code(), -17);
        assert_eq!(exit_status(&output(9, "")).code(), -5);
    }

    #[test]
    fn diagnostics_refine_exit_codes() {
        let mismatch = output(1, "Volume key does not match the volume.");
        assert_eq!(exit_status(&mismatch).code(), -1);
        let no_token = output(1, "No usable token is available.");
        assert_eq!(exit_status(&no_token).code(), -2);
    }

    #[test]
    fn activation_flags_become_options() {
        let flags = ActivateFlags::READONLY | ActivateFlags::ALLOW_DISCARDS | ActivateFlags::PRIVATE;
        assert_eq!(flag_args(flags), vec!["--readonly", "--allow-discards"]);
        assert!(flag_args(ActivateFlags::empty()).is_empty());
        assert!(flag_args(ActivateFlags::IGNORE_PERSISTENT).is_empty());
    }

    #[test]
    fn luks2_format_args_carry_pbkdf_settings() {
        let params = Luks2Params {
            pbkdf: Some(PbkdfType {
                kind: "argon2id".into(),
                hash: "sha512".into(),
                time_ms: 2000,
                iterations: 4,
                max_memory_kb: 65536,
                parallel_threads: 2,
                ..PbkdfType::default()
            }),
            label: Some("vault".into()),
            sector_size: 4096,
            ..Luks2Params::default()
        };
        let args = luks2_format_args(&params).join(" ");
        assert!(args.starts_with("luksFormat --batch-mode --type luks2"));
        assert!(args.contains("--sector-size 4096"));
        assert!(args.contains("--label vault"));
        assert!(args.contains("--pbkdf argon2id --hash sha512"));
        assert!(args.contains("--pbkdf-force-iterations 4"));
        assert!(!args.contains("--iter-time"));
        assert!(args.contains("--pbkdf-memory 65536 --pbkdf-parallel 2"));
    }

    #[test]
    fn luks1_format_args_use_hash_and_alignment() {
        let params = Luks1Params {
            hash: "sha1".into(),
            data_alignment: 2048,
            data_device: None,
        };
        assert_eq!(
            luks1_format_args(&params).join(" "),
            "luksFormat --batch-mode --type luks1 --hash sha1 --align-payload 2048"
        );
        let generic = GenericParams::new("serpent", "cbc-essiv:sha256", 32).with_uuid("u-1");
        assert_eq!(
            generic_format_args(&generic, 32).join(" "),
            "--cipher serpent-cbc-essiv:sha256 --key-size 256 --uuid u-1"
        );
    }

    #[test]
    fn token_keyslots_accept_strings_and_numbers() {
        let mut json: Value =
            serde_json::from_str(r#"{"type":"x","keyslots":["3",1,"bogus"]}"#).unwrap();
        assert_eq!(token_keyslots(&json), vec![3, 1]);
        set_token_keyslots(&mut json, vec![3, 1, 3]);
        assert_eq!(json["keyslots"], serde_json::json!(["1", "3"]));
    }

    #[cfg(unix)]
    mod integration {
        use super::*;
        use cryptvol_core::{CryptDevice, ErrorKind};
        use std::env;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::{Mutex, OnceLock};
        use tempfile::{tempdir, TempDir};

        const FAKE_CRYPTSETUP_SCRIPT: &str = r#"#!/usr/bin/env python3
import json
import os
import sys

STATE = os.environ.get("FAKE_CRYPTSETUP_STATE")
if not STATE:
    print("FAKE_CRYPTSETUP_STATE not set", file=sys.stderr)
    sys.exit(3)

try:
    with open(STATE, "r", encoding="utf-8") as fh:
        state = json.load(fh)
except (FileNotFoundError, json.JSONDecodeError):
    state = {"devices": {}, "mappings": {}}

def save():
    with open(STATE, "w", encoding="utf-8") as fh:
        json.dump(state, fh)

VALUED = {"--type", "--cipher", "--key-size", "--hash", "--uuid", "--label",
          "--sector-size", "--key-file", "--volume-key-file", "--key-slot",
          "--token-id", "--token-type", "--json-file", "--size", "--offset",
          "--skip", "--keyfile-size", "--pbkdf"}

args = sys.argv[1:]
cmd = args.pop(0)
action = args.pop(0) if cmd == "token" else None
opts, flags, pos = {}, set(), []
i = 0
while i < len(args):
    if args[i] in VALUED:
        opts[args[i]] = args[i + 1]
        i += 2
    elif args[i].startswith("--"):
        flags.add(args[i])
        i += 1
    else:
        pos.append(args[i])
        i += 1

def read_file(path):
    with open(path, "rb") as fh:
        return fh.read().hex()

def secret():
    if opts.get("--key-file") == "-":
        return sys.stdin.buffer.read().hex()
    return read_file(opts["--key-file"])

def device(path):
    dev = state["devices"].get(path)
    if dev is None:
        print(f"Device {path} is not a valid LUKS device.", file=sys.stderr)
        sys.exit(1)
    return dev

def unlock(dev, slot=None):
    given = secret()
    for candidate in ([slot] if slot is not None else sorted(dev["keyslots"], key=int)):
        if dev["keyslots"].get(candidate) == given:
            print(f"Key slot {candidate} unlocked.")
            return candidate
    print("No key available with this passphrase.", file=sys.stderr)
    sys.exit(2)

def free_slot(dev):
    if "--key-slot" in opts:
        slot = opts["--key-slot"]
        if slot in dev["keyslots"]:
            print(f"Key slot {slot} is full, please select another one.", file=sys.stderr)
            sys.exit(1)
        return slot
    for n in range(32 if dev["version"] == 2 else 8):
        if str(n) not in dev["keyslots"]:
            return str(n)
    print("All key slots full.", file=sys.stderr)
    sys.exit(1)

def check_volume_key(dev):
    if read_file(opts["--volume-key-file"]) != dev["volume_key"]:
        print("Volume key does not match the volume.", file=sys.stderr)
        sys.exit(1)

if cmd == "luksFormat":
    state["devices"][pos[0]] = {
        "version": 2 if opts["--type"] == "luks2" else 1,
        "uuid": opts.get("--uuid", "0b5a3a4e-5f0e-4a53-9a51-0c7d6a1e2f10"),
        "cipher": opts["--cipher"],
        "key_bits": int(opts["--key-size"]),
        "volume_key": read_file(opts["--volume-key-file"]),
        "keyslots": {"0": secret()},
        "tokens": {},
    }
elif cmd == "luksKillSlot":
    device(pos[0])["keyslots"].pop(pos[1], None)
elif cmd == "luksDump":
    dev = device(pos[0])
    if "--dump-json-metadata" in flags:
        print(json.dumps({"keyslots": {s: {"type": "luks2"} for s in dev["keyslots"]},
                          "tokens": dev["tokens"],
                          "segments": {"0": {"type": "crypt", "encryption": dev["cipher"]}}}))
    elif "--dump-volume-key" in flags:
        unlock(dev, opts.get("--key-slot"))
        key = dev["volume_key"]
        print("Volume key:\t" + " ".join(key[i:i + 2] for i in range(0, len(key), 2)))
    elif dev["version"] == 1:
        name, mode = dev["cipher"].split("-", 1)
        print(f"LUKS header information for {pos[0]}\n")
        print("Version:       \t1")
        print(f"Cipher name:   \t{name}")
        print(f"Cipher mode:   \t{mode}")
        print("Hash spec:     \tsha256")
        print("Payload offset:\t4096")
        print(f"MK bits:       \t{dev['key_bits']}")
        print(f"UUID:          \t{dev['uuid']}\n")
        for n in range(8):
            status = "ENABLED" if str(n) in dev["keyslots"] else "DISABLED"
            print(f"Key Slot {n}: {status}")
    else:
        print("LUKS header information")
        print("Version:       \t2")
        print(f"UUID:          \t{dev['uuid']}")
        print("Label:         \t(no label)")
        print("Data segments:")
        print("  0: crypt")
        print("\toffset: 16777216 [bytes]")
        print(f"\tcipher: {dev['cipher']}")
        print("\tsector: 512 [bytes]")
        print("Keyslots:")
        for slot in sorted(dev["keyslots"], key=int):
            print(f"  {slot}: luks2")
            print(f"\tKey:        {dev['key_bits']} bits")
        print("Tokens:")
        for token in sorted(dev["tokens"], key=int):
            print(f"  {token}: {dev['tokens'][token]['type']}")
        print("Digests:")
        print("  0: pbkdf2")
        print("\tHash:       sha256")
elif cmd == "open":
    dev = device(pos[0]) if opts.get("--type") != "plain" else None
    slot = "0"
    if dev is None:
        sys.stdin.buffer.read()
    elif "--token-only" in flags:
        pin = sys.stdin.read().strip()
        for token_id, token in sorted(dev["tokens"].items()):
            if "--token-id" in opts and opts["--token-id"] != token_id:
                continue
            if token.get("pin") != pin:
                continue
            if token["keyslots"]:
                slot = token["keyslots"][0]
                print(f"Key slot {slot} unlocked.")
                break
        else:
            print("No usable token is available.", file=sys.stderr)
            sys.exit(1)
    elif "--volume-key-file" in opts:
        check_volume_key(dev)
    else:
        slot = unlock(dev, opts.get("--key-slot"))
    if "--test-passphrase" not in flags:
        name = pos[1]
        if name in state["mappings"]:
            print(f"Device {name} already exists.", file=sys.stderr)
            sys.exit(5)
        state["mappings"][name] = {
            "device": pos[0],
            "type": "PLAIN" if dev is None else f"LUKS{dev['version']}",
            "cipher": opts.get("--cipher", dev["cipher"] if dev else ""),
            "offset": opts.get("--offset", "32768"),
        }
elif cmd == "close":
    if state["mappings"].pop(pos[0], None) is None:
        print(f"Device {pos[0]} is not active.", file=sys.stderr)
        sys.exit(4)
elif cmd == "status":
    mapping = state["mappings"].get(pos[0])
    if mapping is None:
        print(f"/dev/mapper/{pos[0]} is inactive.")
        sys.exit(4)
    print(f"/dev/mapper/{pos[0]} is active.")
    print(f"  type:    {mapping['type']}")
    print(f"  cipher:  {mapping['cipher']}")
    print("  keysize: 512 bits")
    print(f"  device:  {mapping['device']}")
    print(f"  offset:  {mapping['offset']} sectors")
    print("  size:    2048 sectors")
elif cmd == "luksAddKey":
    dev = device(pos[0])
    if "--volume-key-file" in opts:
        check_volume_key(dev)
    else:
        unlock(dev)
    slot = free_slot(dev)
    dev["keyslots"][slot] = read_file(pos[1])
    print(f"Key slot {slot} created.")
elif cmd == "luksChangeKey":
    dev = device(pos[0])
    slot = unlock(dev, opts.get("--key-slot"))
    dev["keyslots"][slot] = read_file(pos[1])
    print(f"Key slot {slot} created.")
elif cmd == "token":
    dev = device(pos[0])
    token_id = opts.get("--token-id")
    if action == "export":
        if token_id not in dev["tokens"]:
            print(f"Token {token_id} is not in use.", file=sys.stderr)
            sys.exit(1)
        print(json.dumps(dev["tokens"][token_id]))
    elif action == "import":
        if token_id in dev["tokens"] and "--token-replace" not in flags:
            print(f"Token {token_id} is in use.", file=sys.stderr)
            sys.exit(1)
        with open(opts["--json-file"], "r", encoding="utf-8") as fh:
            dev["tokens"][token_id] = json.load(fh)
        print(f"Token {token_id} created.")
    elif action == "remove":
        dev["tokens"].pop(token_id, None)
else:
    print("unexpected args: " + " ".join(sys.argv[1:]), file=sys.stderr)
    sys.exit(1)

save()
"#;

        struct EnvGuard {
            key: &'static str,
            prev: Option<String>,
        }

        impl EnvGuard {
            fn set(key: &'static str, value: impl Into<String>) -> Self {
                let prev = env::var(key).ok();
                env::set_var(key, value.into());
                Self { key, prev }
            }
        }

        impl Drop for EnvGuard {
            fn drop(&mut self) {
                if let Some(prev) = &self.prev {
                    env::set_var(self.key, prev);
                } else {
                    env::remove_var(self.key);
                }
            }
        }

        struct BackendFixture {
            _tmp: TempDir,
            _state_guard: EnvGuard,
            image: PathBuf,
            backend: SystemCryptsetupBackend,
        }

        impl BackendFixture {
            fn new() -> CryptResult<Self> {
                let tmp = tempdir()?;
                let script = tmp.path().join("cryptsetup.py");
                fs::write(&script, FAKE_CRYPTSETUP_SCRIPT)?;
                make_executable(&script)?;
                let image = tmp.path().join("disk.img");
                fs::File::create(&image)?.set_len(1 << 20)?;
                let state_path = tmp.path().join("state.json");
                let state_guard = EnvGuard::set(
                    "FAKE_CRYPTSETUP_STATE",
                    state_path.to_string_lossy().into_owned(),
                );
                let backend = SystemCryptsetupBackend::with_path(script, Duration::from_secs(5))?
                    .with_scratch_dir(tmp.path().join("scratch"));
                Ok(Self {
                    _tmp: tmp,
                    _state_guard: state_guard,
                    image,
                    backend,
                })
            }

            fn device(&self) -> CryptDevice<SystemCryptsetupBackend> {
                CryptDevice::init(self.backend.clone(), &self.image).unwrap()
            }

            fn luks2(&self) -> CryptDevice<SystemCryptsetupBackend> {
                let mut device = self.device();
                device
                    .format(Luks2Params::default(), GenericParams::default())
                    .unwrap();
                device
            }
        }

        fn make_executable(path: &Path) -> std::io::Result<()> {
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(path, perms)
        }

        fn test_lock() -> std::sync::MutexGuard<'static, ()> {
            static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
            LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
        }

        #[test]
        fn format_discards_bootstrap_slot_and_adds_keyslot() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.luks2();
            assert_eq!(device.kind(), Some(DeviceKind::Luks2));
            assert!(device.dump()?.keyslots.is_empty());

            let slot = device.keyslots().add_by_volume_key(Keyslot::Any, None, b"secret")?;
            assert_eq!(slot, 0);
            let slot = device
                .keyslots()
                .add_by_passphrase(Keyslot::Index(3), b"secret", b"other")?;
            assert_eq!(slot, 3);
            assert_eq!(device.dump()?.keyslots, vec![0, 3]);

            let opened = device.activate_by_passphrase(
                Some("vault"),
                Keyslot::Any,
                b"other",
                ActivateFlags::empty(),
            )?;
            assert_eq!(opened, 3);
            device.deactivate("vault")?;

            let err = device
                .activate_by_passphrase(None, Keyslot::Any, b"wrong", ActivateFlags::empty())
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WrongCredential);
            Ok(())
        }

        #[test]
        fn volume_key_round_trips_through_dump() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.device();
            let key: Vec<u8> = (0u8..32).collect();
            device.format(
                Luks2Params::default(),
                GenericParams::default().with_volume_key(key.clone()),
            )?;
            device.keyslots().add_by_volume_key(Keyslot::Any, None, b"pw")?;

            let recovered = device.keyslots().volume_key_get(Keyslot::Any, b"pw")?;
            assert_eq!(recovered.key.as_slice(), key.as_slice());
            assert_eq!(recovered.keyslot, 0);

            let wrong = [0x55u8; 32];
            let err = device
                .activate_by_volume_key(None, Some(&wrong[..]), 32, ActivateFlags::empty())
                .unwrap_err();
            assert_eq!(err.code(), Some(-errno::EPERM));
            Ok(())
        }

        #[test]
        fn change_passphrase_moves_slot() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.luks2();
            device.keyslots().add_by_volume_key(Keyslot::Any, None, b"old")?;
            let slot = device.keyslots().change_by_passphrase(
                Keyslot::Any,
                Keyslot::Index(5),
                b"old",
                b"new",
            )?;
            assert_eq!(slot, 5);
            assert_eq!(device.dump()?.keyslots, vec![5]);
            let opened =
                device.activate_by_passphrase(None, Keyslot::Any, b"new", ActivateFlags::empty())?;
            assert_eq!(opened, 5);
            Ok(())
        }

        #[test]
        fn change_passphrase_to_any_slot_takes_lowest_free() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.luks2();
            let first = device.keyslots().add_by_volume_key(Keyslot::Any, None, b"old")?;
            assert_eq!(first, 0);
            let slot = device.keyslots().change_by_passphrase(
                Keyslot::Index(0),
                Keyslot::Any,
                b"old",
                b"new",
            )?;
            assert_eq!(slot, 1);
            assert_eq!(device.dump()?.keyslots, vec![1]);
            let err = device
                .activate_by_passphrase(None, Keyslot::Any, b"old", ActivateFlags::empty())
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WrongCredential);
            Ok(())
        }

        #[test]
        fn tokens_import_assign_and_unlock() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.luks2();
            device.keyslots().add_by_volume_key(Keyslot::Any, None, b"pw")?;

            let id = device
                .tokens()
                .json_set(TokenTarget::Any, r#"{"type":"fake-pin","keyslots":[],"pin":"1234"}"#)?;
            assert_eq!(id, 0);
            assert_eq!(
                device.tokens().is_assigned(0, 0).unwrap_err().kind(),
                ErrorKind::NotFound
            );
            device.tokens().assign_keyslot(TokenTarget::Id(0), Keyslot::Index(0))?;
            device.tokens().is_assigned(0, 0)?;
            let json: Value = serde_json::from_str(&device.tokens().json_get(0)?).unwrap();
            assert_eq!(json["keyslots"], serde_json::json!(["0"]));

            let slot = device.activate_by_token_pin(
                Some("vault"),
                None,
                TokenTarget::Any,
                b"1234",
                None,
                ActivateFlags::empty(),
            )?;
            assert_eq!(slot, 0);

            device.tokens().unassign_keyslot(TokenTarget::Any, Keyslot::Any)?;
            device.tokens().remove(0)?;
            assert_eq!(
                device.tokens().json_get(0).unwrap_err().kind(),
                ErrorKind::NotFound
            );
            Ok(())
        }

        #[test]
        fn unformatted_device_fails_load_as_invalid_header() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.device();
            let err = device.load(None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::HeaderInvalid);
            let err = device.deactivate("missing").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotActive);
            Ok(())
        }

        #[test]
        fn load_and_init_by_name_see_existing_state() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            {
                let mut device = fixture.device();
                device.format(
                    Luks1Params::default(),
                    GenericParams::default().with_uuid("0d8f2c55-2f1b-4f5a-9b4e-1a2b3c4d5e6f"),
                )?;
                device.keyslots().add_by_volume_key(Keyslot::Any, None, b"pw")?;
                device.activate_by_passphrase(
                    Some("legacy"),
                    Keyslot::Any,
                    b"pw",
                    ActivateFlags::empty(),
                )?;
            }

            let mut device = fixture.device();
            device.load(None)?;
            assert_eq!(device.kind(), Some(DeviceKind::Luks1));
            assert_eq!(
                device.uuid().as_deref(),
                Some("0d8f2c55-2f1b-4f5a-9b4e-1a2b3c4d5e6f")
            );
            assert_eq!(device.dump()?.keyslots, vec![0]);

            let mut mapped = CryptDevice::init_by_name(fixture.backend.clone(), "legacy")?;
            assert_eq!(mapped.kind(), Some(DeviceKind::Luks1));
            assert_eq!(mapped.device_name(), Some(fixture.image.as_path()));
            mapped.deactivate("legacy")?;
            Ok(())
        }

        #[test]
        fn luks2_json_metadata_is_returned() -> CryptResult<()> {
            let _guard = test_lock();
            let fixture = BackendFixture::new()?;
            let mut device = fixture.luks2();
            let json: Value = serde_json::from_str(&device.dump_json()?).unwrap();
            assert_eq!(json["segments"]["0"]["encryption"], "aes-xts-plain64");
            Ok(())
        }
    }
}
