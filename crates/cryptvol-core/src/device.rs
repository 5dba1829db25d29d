//! Device handle: one native context from init to free.

use crate::backend::{CryptBackend, FormatRequest, HeaderDump, NativeResult, TokenActivation};
use crate::config::FormatDefaults;
use crate::error::{CryptError, CryptResult};
use crate::flags::{ActivateFlags, DeactivateFlags};
use crate::keyslot::{Keyslot, KeyslotManager};
use crate::logging::{self, DebugLevel, LogCallback, LogLevel};
use crate::params::GenericParams;
use crate::token::{TokenManager, TokenTarget};
use crate::variant::{DeviceKind, HeaderVariant, Operation};
use crate::wipe::WipeRequest;
use log::{debug, info};
use std::path::Path;

/// Handle over a block device or image file.
///
/// The native context is released exactly once, either by the first call to
/// [`CryptDevice::free`] or on drop. Every operation after that fails with
/// [`CryptError::Released`] without reaching the backend.
pub struct CryptDevice<B: CryptBackend> {
    backend: B,
    context: Option<B::Context>,
    variant: Option<HeaderVariant>,
    log_callback: Option<LogCallback>,
    debug_level: DebugLevel,
}

impl<B: CryptBackend> CryptDevice<B> {
    /// Bind to the device or image at `path`.
    pub fn init(backend: B, path: impl AsRef<Path>) -> CryptResult<Self> {
        let path = path.as_ref();
        let context = backend
            .init(path)
            .map_err(|status| CryptError::native("crypt_init", status))?;
        debug!("initialised crypt device for {}", path.display());
        Ok(Self::with_context(backend, context))
    }

    /// Bind to the device behind the active mapping `name`.
    pub fn init_by_name(backend: B, name: &str) -> CryptResult<Self> {
        let context = backend
            .init_by_name(name)
            .map_err(|status| CryptError::native("crypt_init_by_name", status))?;
        debug!("initialised crypt device from active mapping {name}");
        Ok(Self::with_context(backend, context))
    }

    fn with_context(backend: B, context: B::Context) -> Self {
        Self {
            backend,
            context: Some(context),
            variant: None,
            log_callback: None,
            debug_level: DebugLevel::None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Route this handle's diagnostics to `callback`.
    pub fn set_log_callback<F>(&mut self, callback: F)
    where
        F: FnMut(LogLevel, &str) + Send + 'static,
    {
        self.log_callback = Some(Box::new(callback));
    }

    pub fn clear_log_callback(&mut self) {
        self.log_callback = None;
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.debug_level = level;
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.debug_level
    }

    /// Release the native context. Returns `true` on the first call only.
    pub fn free(&mut self) -> bool {
        match self.context.take() {
            Some(context) => {
                self.backend.release(context);
                debug!("released crypt device handle");
                true
            }
            None => false,
        }
    }

    pub fn is_freed(&self) -> bool {
        self.context.is_none()
    }

    /// Variant recorded by the last successful format or load.
    pub fn variant(&self) -> Option<&HeaderVariant> {
        self.variant.as_ref()
    }

    /// Active header family: the recorded variant, else what the backend
    /// reports for the context.
    pub fn kind(&self) -> Option<DeviceKind> {
        let context = self.context.as_ref()?;
        self.variant
            .as_ref()
            .map(HeaderVariant::kind)
            .or_else(|| self.backend.device_kind(context))
    }

    /// "PLAIN", "LUKS1", "LUKS2", or "" before format/load.
    pub fn device_type(&self) -> &'static str {
        self.kind().map(DeviceKind::name).unwrap_or("")
    }

    /// Path of the backing device.
    pub fn device_name(&self) -> Option<&Path> {
        self.context
            .as_ref()
            .map(|context| self.backend.device_path(context))
    }

    pub fn uuid(&self) -> Option<String> {
        self.context
            .as_ref()
            .and_then(|context| self.backend.uuid(context))
    }

    /// Volume key size in bytes, 0 when unknown or released.
    pub fn volume_key_size(&self) -> usize {
        self.context
            .as_ref()
            .map(|context| self.backend.volume_key_size(context))
            .unwrap_or(0)
    }

    /// Write a fresh header. Empty parameter fields get built-in defaults.
    pub fn format(
        &mut self,
        variant: impl Into<HeaderVariant>,
        params: GenericParams,
    ) -> CryptResult<()> {
        self.format_with_defaults(variant, params, &FormatDefaults::default())
    }

    /// Write a fresh header, filling empty fields from `defaults`.
    pub fn format_with_defaults(
        &mut self,
        variant: impl Into<HeaderVariant>,
        mut params: GenericParams,
        defaults: &FormatDefaults,
    ) -> CryptResult<()> {
        let mut variant = variant.into();
        self.require_context("crypt_format")?;
        if !variant.supports(Operation::Format) {
            return Err(CryptError::Unsupported {
                function: "crypt_format",
                kind: variant.kind(),
            });
        }

        variant.fill_defaults_from(defaults);
        params.fill_defaults_from(defaults);
        params.validate()?;

        let request = FormatRequest {
            variant: &variant,
            params: &params,
        };
        self.call("crypt_format", |backend, context| {
            backend.format(context, &request)
        })?;

        info!(
            "formatted {} header ({})",
            variant.kind(),
            params.cipher_spec()
        );
        self.variant = Some(variant);
        Ok(())
    }

    /// Parse the existing header. `None` detects the type.
    pub fn load(&mut self, variant: Option<HeaderVariant>) -> CryptResult<()> {
        self.ensure_supported("crypt_load", Operation::Load)?;
        if let Some(variant) = &variant {
            if !variant.supports(Operation::Load) {
                return Err(CryptError::Unsupported {
                    function: "crypt_load",
                    kind: variant.kind(),
                });
            }
        }

        let kind = self.call("crypt_load", |backend, context| {
            backend.load(context, variant.as_ref())
        })?;
        debug!("loaded {kind} header");
        self.variant = Some(variant.unwrap_or_else(|| HeaderVariant::default_for(kind)));
        Ok(())
    }

    pub fn dump(&mut self) -> CryptResult<HeaderDump> {
        self.call("crypt_dump", |backend, context| backend.dump(context))
    }

    /// Header metadata as JSON.
    pub fn dump_json(&mut self) -> CryptResult<String> {
        self.ensure_supported("crypt_dump_json", Operation::DumpJson)?;
        self.call("crypt_dump_json", |backend, context| backend.dump_json(context))
    }

    /// Resize mapping `name` to `new_size` 512-byte sectors; 0 fills the device.
    pub fn resize(&mut self, name: &str, new_size: u64) -> CryptResult<()> {
        self.call("crypt_resize", |backend, context| {
            backend.resize(context, name, new_size)
        })
    }

    /// Wipe a region. Return non-zero from `progress` to stop after the
    /// current block.
    pub fn wipe<F>(&mut self, request: &WipeRequest, mut progress: F) -> CryptResult<()>
    where
        F: FnMut(u64, u64) -> i32,
    {
        self.call("crypt_wipe", |backend, context| {
            backend.wipe(context, request, &mut progress)
        })
    }

    /// Unlock with a passphrase and map as `name`. `None` only checks the
    /// passphrase. Returns the keyslot that opened.
    pub fn activate_by_passphrase(
        &mut self,
        name: Option<&str>,
        keyslot: Keyslot,
        passphrase: &[u8],
        flags: ActivateFlags,
    ) -> CryptResult<u32> {
        let slot = self.call("crypt_activate_by_passphrase", |backend, context| {
            backend.activate_by_passphrase(context, name, keyslot, passphrase, flags)
        })?;
        if let Some(name) = name {
            info!("activated {name} with keyslot {slot}");
        }
        Ok(slot)
    }

    /// Map with a raw volume key. `None` reuses the key from `format`.
    pub fn activate_by_volume_key(
        &mut self,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        volume_key_size: usize,
        flags: ActivateFlags,
    ) -> CryptResult<()> {
        self.call("crypt_activate_by_volume_key", |backend, context| {
            backend.activate_by_volume_key(context, name, volume_key, volume_key_size, flags)
        })?;
        if let Some(name) = name {
            info!("activated {name} with volume key");
        }
        Ok(())
    }

    pub fn activate_by_token(
        &mut self,
        name: Option<&str>,
        token: TokenTarget,
        context: Option<&str>,
        flags: ActivateFlags,
    ) -> CryptResult<u32> {
        self.activate_with_token(
            "crypt_activate_by_token",
            TokenActivation {
                name,
                token,
                token_type: None,
                pin: None,
                context,
                flags,
            },
        )
    }

    pub fn activate_by_token_pin(
        &mut self,
        name: Option<&str>,
        token_type: Option<&str>,
        token: TokenTarget,
        pin: &[u8],
        context: Option<&str>,
        flags: ActivateFlags,
    ) -> CryptResult<u32> {
        self.activate_with_token(
            "crypt_activate_by_token_pin",
            TokenActivation {
                name,
                token,
                token_type,
                pin: Some(pin),
                context,
                flags,
            },
        )
    }

    fn activate_with_token(
        &mut self,
        function: &'static str,
        request: TokenActivation<'_>,
    ) -> CryptResult<u32> {
        self.ensure_supported(function, Operation::Tokens)?;
        let slot = self.call(function, |backend, context| {
            backend.activate_by_token(context, &request)
        })?;
        if let Some(name) = request.name {
            info!("activated {name} through token with keyslot {slot}");
        }
        Ok(slot)
    }

    pub fn deactivate(&mut self, name: &str) -> CryptResult<()> {
        self.deactivate_with_flags(name, DeactivateFlags::empty())
    }

    pub fn deactivate_with_flags(&mut self, name: &str, flags: DeactivateFlags) -> CryptResult<()> {
        let function = if flags.is_empty() {
            "crypt_deactivate"
        } else {
            "crypt_deactivate_by_name"
        };
        self.call(function, |backend, context| {
            backend.deactivate(context, name, flags)
        })?;
        info!("deactivated {name}");
        Ok(())
    }

    /// Keyslot operations on this handle.
    pub fn keyslots(&mut self) -> KeyslotManager<'_, B> {
        KeyslotManager::new(self)
    }

    /// Token operations on this handle.
    pub fn tokens(&mut self) -> TokenManager<'_, B> {
        TokenManager::new(self)
    }

    fn require_context(&self, function: &'static str) -> CryptResult<()> {
        if self.context.is_none() {
            return Err(CryptError::Released { function });
        }
        Ok(())
    }

    /// Reject `operation` for the active header family before any I/O.
    pub(crate) fn ensure_supported(
        &self,
        function: &'static str,
        operation: Operation,
    ) -> CryptResult<()> {
        self.require_context(function)?;
        match self.kind() {
            Some(kind) if !kind.supports(operation) => {
                debug!("{function} rejected for {kind} device");
                Err(CryptError::Unsupported { function, kind })
            }
            _ => Ok(()),
        }
    }

    /// Run one backend primitive and hand its diagnostics to this handle's
    /// callback before returning.
    pub(crate) fn call<T, F>(&mut self, function: &'static str, op: F) -> CryptResult<T>
    where
        F: FnOnce(&B, &mut B::Context) -> NativeResult<T>,
    {
        let context = self
            .context
            .as_mut()
            .ok_or(CryptError::Released { function })?;
        let result = op(&self.backend, context);
        let records = self.backend.drain_messages(context);
        logging::dispatch(
            function,
            records,
            self.debug_level,
            self.log_callback.as_mut(),
        );
        result.map_err(|status| {
            debug!("{function} failed with {status}");
            CryptError::native(function, status)
        })
    }
}

impl<B: CryptBackend> Drop for CryptDevice<B> {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeStatus;
    use crate::error::errno;
    use crate::logging::LogRecord;
    use crate::variant::{Luks2Params, PlainParams};
    use crate::wipe::WipePattern;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Records every primitive that reaches it; the header kind is fixed.
    #[derive(Clone, Default)]
    struct MockBackend {
        kind: Option<DeviceKind>,
        calls: Arc<Mutex<Vec<&'static str>>>,
        releases: Arc<Mutex<u32>>,
    }

    struct MockContext {
        path: PathBuf,
        kind: Option<DeviceKind>,
        pending: Vec<LogRecord>,
    }

    impl MockBackend {
        fn with_kind(kind: DeviceKind) -> Self {
            Self {
                kind: Some(kind),
                ..Self::default()
            }
        }

        fn hit(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CryptBackend for MockBackend {
        type Context = MockContext;

        fn init(&self, path: &Path) -> NativeResult<MockContext> {
            self.hit("init");
            Ok(MockContext {
                path: path.to_path_buf(),
                kind: self.kind,
                pending: Vec::new(),
            })
        }

        fn init_by_name(&self, _name: &str) -> NativeResult<MockContext> {
            Err(NativeStatus::from_errno(errno::ENODEV))
        }

        fn release(&self, _context: MockContext) {
            *self.releases.lock().unwrap() += 1;
        }

        fn device_kind(&self, context: &MockContext) -> Option<DeviceKind> {
            context.kind
        }

        fn device_path<'c>(&self, context: &'c MockContext) -> &'c Path {
            &context.path
        }

        fn uuid(&self, _context: &MockContext) -> Option<String> {
            None
        }

        fn volume_key_size(&self, _context: &MockContext) -> usize {
            32
        }

        fn format(&self, context: &mut MockContext, request: &FormatRequest<'_>) -> NativeResult<()> {
            self.hit("format");
            context.kind = Some(request.variant.kind());
            context
                .pending
                .push(LogRecord::new(LogLevel::Normal, "header written"));
            context
                .pending
                .push(LogRecord::new(LogLevel::Debug, "debug detail"));
            Ok(())
        }

        fn load(
            &self,
            context: &mut MockContext,
            _variant: Option<&HeaderVariant>,
        ) -> NativeResult<DeviceKind> {
            self.hit("load");
            context.kind.ok_or(NativeStatus::from_errno(errno::EINVAL))
        }

        fn dump(&self, _context: &mut MockContext) -> NativeResult<HeaderDump> {
            self.hit("dump");
            Err(NativeStatus::from_errno(errno::EINVAL))
        }

        fn dump_json(&self, _context: &mut MockContext) -> NativeResult<String> {
            self.hit("dump_json");
            Ok("{}".into())
        }

        fn resize(&self, _context: &mut MockContext, _name: &str, _new_size: u64) -> NativeResult<()> {
            self.hit("resize");
            Ok(())
        }

        fn wipe(
            &self,
            _context: &mut MockContext,
            _request: &WipeRequest,
            progress: &mut dyn FnMut(u64, u64) -> i32,
        ) -> NativeResult<()> {
            self.hit("wipe");
            if progress(2, 1) != 0 {
                return Err(NativeStatus::from_errno(errno::EINTR));
            }
            Ok(())
        }

        fn activate_by_passphrase(
            &self,
            _context: &mut MockContext,
            _name: Option<&str>,
            _keyslot: Keyslot,
            passphrase: &[u8],
            _flags: ActivateFlags,
        ) -> NativeResult<u32> {
            self.hit("activate_by_passphrase");
            if passphrase == b"pw" {
                Ok(0)
            } else {
                Err(NativeStatus::from_errno(errno::EPERM))
            }
        }

        fn activate_by_volume_key(
            &self,
            _context: &mut MockContext,
            _name: Option<&str>,
            _volume_key: Option<&[u8]>,
            _volume_key_size: usize,
            _flags: ActivateFlags,
        ) -> NativeResult<()> {
            self.hit("activate_by_volume_key");
            Ok(())
        }

        fn activate_by_token(
            &self,
            _context: &mut MockContext,
            _request: &TokenActivation<'_>,
        ) -> NativeResult<u32> {
            self.hit("activate_by_token");
            Ok(0)
        }

        fn deactivate(
            &self,
            _context: &mut MockContext,
            _name: &str,
            _flags: DeactivateFlags,
        ) -> NativeResult<()> {
            self.hit("deactivate");
            Err(NativeStatus::from_errno(errno::ENODEV))
        }

        fn keyslot_add_by_volume_key(
            &self,
            _context: &mut MockContext,
            _keyslot: Keyslot,
            _volume_key: Option<&[u8]>,
            _passphrase: &[u8],
        ) -> NativeResult<u32> {
            self.hit("keyslot_add_by_volume_key");
            Ok(0)
        }

        fn keyslot_add_by_passphrase(
            &self,
            _context: &mut MockContext,
            _keyslot: Keyslot,
            _passphrase: &[u8],
            _new_passphrase: &[u8],
        ) -> NativeResult<u32> {
            self.hit("keyslot_add_by_passphrase");
            Ok(1)
        }

        fn keyslot_change_by_passphrase(
            &self,
            _context: &mut MockContext,
            _current: Keyslot,
            _new: Keyslot,
            _passphrase: &[u8],
            _new_passphrase: &[u8],
        ) -> NativeResult<u32> {
            self.hit("keyslot_change_by_passphrase");
            Ok(0)
        }

        fn volume_key_get(
            &self,
            _context: &mut MockContext,
            _keyslot: Keyslot,
            _passphrase: &[u8],
            out: &mut Vec<u8>,
        ) -> NativeResult<u32> {
            self.hit("volume_key_get");
            out.extend_from_slice(&[0x11; 32]);
            Ok(0)
        }

        fn token_json_get(&self, _context: &mut MockContext, _token: u32) -> NativeResult<String> {
            self.hit("token_json_get");
            Err(NativeStatus::from_errno(errno::ENOENT))
        }

        fn token_json_set(
            &self,
            _context: &mut MockContext,
            _token: TokenTarget,
            _json: Option<&str>,
        ) -> NativeResult<u32> {
            self.hit("token_json_set");
            Ok(0)
        }

        fn token_assign_keyslot(
            &self,
            _context: &mut MockContext,
            _token: TokenTarget,
            _keyslot: Keyslot,
        ) -> NativeResult<()> {
            self.hit("token_assign_keyslot");
            Ok(())
        }

        fn token_unassign_keyslot(
            &self,
            _context: &mut MockContext,
            _token: TokenTarget,
            _keyslot: Keyslot,
        ) -> NativeResult<()> {
            self.hit("token_unassign_keyslot");
            Ok(())
        }

        fn token_is_assigned(
            &self,
            _context: &mut MockContext,
            _token: u32,
            _keyslot: u32,
        ) -> NativeResult<()> {
            self.hit("token_is_assigned");
            Ok(())
        }

        fn drain_messages(&self, context: &mut MockContext) -> Vec<LogRecord> {
            std::mem::take(&mut context.pending)
        }
    }

    #[test]
    fn free_releases_once_and_blocks_later_calls() {
        let backend = MockBackend::default();
        let mut device = CryptDevice::init(backend.clone(), "/dev/mock").unwrap();
        assert!(device.free());
        assert!(!device.free());
        assert!(device.is_freed());
        assert_eq!(device.device_type(), "");

        let err = device.dump().unwrap_err();
        assert!(matches!(err, CryptError::Released { function: "crypt_dump" }));
        assert_eq!(err.code(), Some(-22));
        drop(device);
        assert_eq!(*backend.releases.lock().unwrap(), 1);
        assert_eq!(backend.calls(), vec!["init"]);
    }

    #[test]
    fn drop_releases_context() {
        let backend = MockBackend::default();
        let device = CryptDevice::init(backend.clone(), "/dev/mock").unwrap();
        drop(device);
        assert_eq!(*backend.releases.lock().unwrap(), 1);
    }

    #[test]
    fn plain_gating_never_reaches_backend() {
        let backend = MockBackend::with_kind(DeviceKind::Plain);
        let mut device = CryptDevice::init(backend.clone(), "/dev/mock").unwrap();

        let err = device.load(None).unwrap_err();
        assert!(err.is_unsupported());
        let err = device
            .keyslots()
            .add_by_volume_key(Keyslot::Any, None, b"pw")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
        assert!(device
            .keyslots()
            .add_by_passphrase(Keyslot::Any, b"a", b"b")
            .unwrap_err()
            .is_unsupported());
        assert!(device
            .keyslots()
            .change_by_passphrase(Keyslot::Index(0), Keyslot::Index(0), b"a", b"b")
            .unwrap_err()
            .is_unsupported());
        assert!(device.tokens().json_get(0).unwrap_err().is_unsupported());
        assert!(device.dump_json().unwrap_err().is_unsupported());

        assert_eq!(backend.calls(), vec!["init"]);
    }

    #[test]
    fn explicit_plain_load_is_rejected_up_front() {
        let backend = MockBackend::default();
        let mut device = CryptDevice::init(backend.clone(), "/dev/mock").unwrap();
        let err = device
            .load(Some(PlainParams::default().into()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "[CV2200] Operation unsupported for this device type (PLAIN, crypt_load)"
        );
        assert_eq!(backend.calls(), vec!["init"]);
    }

    #[test]
    fn format_records_variant_and_forwards_messages() {
        let backend = MockBackend::default();
        let mut device = CryptDevice::init(backend.clone(), "/dev/mock").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        device.set_log_callback(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });

        device
            .format(Luks2Params::default(), GenericParams::default())
            .unwrap();
        assert_eq!(device.device_type(), "LUKS2");
        assert!(matches!(device.variant(), Some(HeaderVariant::Luks2(_))));
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![(LogLevel::Normal, "header written".to_string())]
        );

        device.set_debug_level(DebugLevel::All);
        device.clear_log_callback();
        device.dump_json().unwrap();
        assert_eq!(backend.calls(), vec!["init", "format", "dump_json"]);
    }

    #[test]
    fn native_failures_carry_function_name() {
        let backend = MockBackend::with_kind(DeviceKind::Luks1);
        let mut device = CryptDevice::init(backend, "/dev/mock").unwrap();

        let err = device
            .activate_by_passphrase(Some("vol"), Keyslot::Any, b"bad", ActivateFlags::READONLY)
            .unwrap_err();
        assert_eq!(err.function(), Some("crypt_activate_by_passphrase"));
        assert_eq!(err.code(), Some(-1));

        let err = device
            .deactivate_with_flags("vol", DeactivateFlags::FORCE)
            .unwrap_err();
        assert_eq!(err.function(), Some("crypt_deactivate_by_name"));
        assert_eq!(err.code(), Some(-19));

        let err = device.wipe(&WipeRequest::new(WipePattern::Zero), |_, _| 1).unwrap_err();
        assert_eq!(err.code(), Some(-4));
    }

    #[test]
    fn volume_key_get_sizes_buffer() {
        let backend = MockBackend::with_kind(DeviceKind::Luks2);
        let mut device = CryptDevice::init(backend, "/dev/mock").unwrap();
        let key = device
            .keyslots()
            .volume_key_get(Keyslot::Any, b"pw")
            .unwrap();
        assert_eq!(key.len(), 32);
        assert_eq!(key.keyslot, 0);
    }
}
