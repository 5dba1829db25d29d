//! Private directory for key files handed to `cryptsetup`. Files are
//! overwritten with zeros before the directory is removed.

use cryptvol_core::error::CryptResult;
use cryptvol_core::keyfile::write_secret_file;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};

pub(crate) struct SecretScratch {
    dir: TempDir,
    files: Vec<(PathBuf, usize)>,
}

impl SecretScratch {
    /// Create the directory under `parent`, or the system temp dir.
    pub(crate) fn new(parent: Option<&Path>) -> CryptResult<Self> {
        let mut builder = Builder::new();
        builder.prefix("cryptvol-");
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            dir,
            files: Vec::new(),
        })
    }

    /// Stage `secret` as `name` and return its path.
    pub(crate) fn stage(&mut self, name: &str, secret: &[u8]) -> CryptResult<PathBuf> {
        let path = self.dir.path().join(name);
        write_secret_file(&path, secret)?;
        self.files.push((path.clone(), secret.len()));
        Ok(path)
    }

    fn scrub(path: &Path, len: usize) -> std::io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(&vec![0u8; len])?;
        file.sync_all()
    }
}

impl Drop for SecretScratch {
    fn drop(&mut self) {
        for (path, len) in self.files.drain(..) {
            if let Err(err) = Self::scrub(&path, len) {
                log::warn!("failed to scrub {}: {err}", path.display());
            }
        }
    }
}
