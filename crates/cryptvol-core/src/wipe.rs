//! Wipe requests and the block engine shared by file-backed backends.

use crate::backend::{NativeResult, NativeStatus};
use crate::error::errno;
use crate::flags::WipeFlags;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const DEFAULT_WIPE_BLOCK: usize = 1024 * 1024;
const SECTOR: u64 = 512;

/// What gets written over the wiped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WipePattern {
    Zero,
    Random,
    /// Zeros run through a throwaway cipher keystream.
    EncryptedZero,
    /// Legacy multi-pattern fill kept for compatibility.
    Special,
}

impl WipePattern {
    pub fn name(self) -> &'static str {
        match self {
            WipePattern::Zero => "zero",
            WipePattern::Random => "random",
            WipePattern::EncryptedZero => "encrypted-zero",
            WipePattern::Special => "special",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeRequest {
    /// Target to wipe; the handle's own device when `None`.
    pub path: Option<PathBuf>,
    pub pattern: WipePattern,
    /// Start in bytes, sector aligned.
    pub offset: u64,
    /// Bytes to wipe, 0 for everything past `offset`.
    pub length: u64,
    /// Bytes per block, 0 for the default.
    pub block_size: usize,
    pub flags: WipeFlags,
}

impl WipeRequest {
    pub fn new(pattern: WipePattern) -> Self {
        Self {
            path: None,
            pattern,
            offset: 0,
            length: 0,
            block_size: 0,
            flags: WipeFlags::empty(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_range(mut self, offset: u64, length: u64) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn effective_block_size(&self) -> usize {
        if self.block_size == 0 {
            DEFAULT_WIPE_BLOCK
        } else {
            self.block_size
        }
    }
}

/// Overwrite the requested region of `path` block by block.
///
/// `progress(total, done)` runs after every block; a non-zero return stops
/// the wipe before the next block with EINTR. Returns the bytes written.
pub fn wipe_file(
    path: &Path,
    request: &WipeRequest,
    progress: &mut dyn FnMut(u64, u64) -> i32,
) -> NativeResult<u64> {
    let block_size = request.effective_block_size();
    if request.offset % SECTOR != 0 || block_size as u64 % SECTOR != 0 {
        log::debug!(
            "wipe rejected: offset {} / block {} not sector aligned",
            request.offset,
            block_size
        );
        return Err(NativeStatus::from_errno(errno::EINVAL));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| io_status(&err))?;
    let device_len = file.metadata().map_err(|err| io_status(&err))?.len();
    if request.offset > device_len {
        return Err(NativeStatus::from_errno(errno::EINVAL));
    }
    let total = if request.length == 0 {
        device_len - request.offset
    } else {
        request.length
    };
    if request.offset.saturating_add(total) > device_len {
        return Err(NativeStatus::from_errno(errno::EINVAL));
    }

    file.seek(SeekFrom::Start(request.offset))
        .map_err(|err| io_status(&err))?;

    let mut filler = BlockFiller::new(request.pattern);
    let mut block = Zeroizing::new(vec![0u8; block_size]);
    let mut done = 0u64;
    while done < total {
        let chunk = (total - done).min(block_size as u64) as usize;
        filler.fill(&mut block[..chunk], request.offset + done);
        file.write_all(&block[..chunk])
            .map_err(|err| io_status(&err))?;
        done += chunk as u64;

        if progress(total, done) != 0 {
            file.sync_data().map_err(|err| io_status(&err))?;
            log::info!("wipe of {} interrupted after {done} of {total} bytes", path.display());
            return Err(NativeStatus::from_errno(errno::EINTR));
        }
    }
    file.sync_data().map_err(|err| io_status(&err))?;
    Ok(done)
}

pub(crate) fn io_status(err: &std::io::Error) -> NativeStatus {
    match err.raw_os_error() {
        Some(code) => NativeStatus::from_errno(code),
        None => NativeStatus::from_errno(errno::EIO),
    }
}

struct BlockFiller {
    pattern: WipePattern,
    key: Zeroizing<[u8; 32]>,
}

impl BlockFiller {
    fn new(pattern: WipePattern) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        if pattern == WipePattern::EncryptedZero {
            rand::thread_rng().fill_bytes(&mut key[..]);
        }
        Self { pattern, key }
    }

    fn fill(&mut self, block: &mut [u8], position: u64) {
        match self.pattern {
            WipePattern::Zero => block.fill(0),
            WipePattern::Random => rand::thread_rng().fill_bytes(block),
            WipePattern::EncryptedZero => {
                for (index, chunk) in block.chunks_mut(32).enumerate() {
                    let mut hasher = Sha256::new();
                    hasher.update(&self.key[..]);
                    hasher.update((position + (index as u64) * 32).to_le_bytes());
                    let stream = hasher.finalize();
                    chunk.copy_from_slice(&stream[..chunk.len()]);
                }
            }
            WipePattern::Special => {
                let pass = (position / SECTOR) % 3;
                let byte = match pass {
                    0 => 0x55,
                    1 => 0xAA,
                    _ => 0x92,
                };
                block.fill(byte);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn zero_wipe_covers_requested_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0xFFu8; 8192]).unwrap();

        let request = WipeRequest::new(WipePattern::Zero)
            .with_range(1024, 2048)
            .with_block_size(1024);
        let mut calls = Vec::new();
        let written = wipe_file(&path, &request, &mut |total, done| {
            calls.push((total, done));
            0
        })
        .unwrap();

        assert_eq!(written, 2048);
        assert_eq!(calls, vec![(2048, 1024), (2048, 2048)]);
        let data = fs::read(&path).unwrap();
        assert!(data[..1024].iter().all(|b| *b == 0xFF));
        assert!(data[1024..3072].iter().all(|b| *b == 0));
        assert!(data[3072..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn non_zero_progress_cancels_after_one_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0xFFu8; 4096]).unwrap();

        let request = WipeRequest::new(WipePattern::Zero).with_block_size(1024);
        let mut calls = 0;
        let err = wipe_file(&path, &request, &mut |_, _| {
            calls += 1;
            1
        })
        .unwrap_err();

        assert_eq!(err.code(), -4);
        assert_eq!(calls, 1);
        let data = fs::read(&path).unwrap();
        assert!(data[..1024].iter().all(|b| *b == 0));
        assert!(data[1024..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn encrypted_zero_is_not_plain_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 2048]).unwrap();

        let request = WipeRequest::new(WipePattern::EncryptedZero);
        wipe_file(&path, &request, &mut |_, _| 0).unwrap();
        let data = fs::read(&path).unwrap();
        assert!(data.iter().any(|b| *b != 0));
    }

    #[test]
    fn unaligned_offset_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 2048]).unwrap();

        let request = WipeRequest::new(WipePattern::Zero).with_range(100, 0);
        let err = wipe_file(&path, &request, &mut |_, _| 0).unwrap_err();
        assert_eq!(err.code(), -22);
    }
}
