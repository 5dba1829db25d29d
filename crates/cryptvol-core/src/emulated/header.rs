//! On-disk layout: magic, version, metadata length, JSON metadata, zero pad.

use crate::backend::{NativeResult, NativeStatus};
use crate::error::errno;
use crate::variant::DeviceKind;
use crate::wipe::io_status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub(crate) const MAGIC: &[u8; 6] = b"LUKS\xba\xbe";
const PREFIX_LEN: usize = 12;
pub(crate) const SECTOR: u64 = 512;

/// Bytes reserved for the header area of `kind`.
pub(crate) fn header_size(kind: DeviceKind) -> usize {
    match kind {
        DeviceKind::Luks2 => 16 * 1024,
        _ => 4 * 1024,
    }
}

fn version(kind: DeviceKind) -> NativeResult<u16> {
    match kind {
        DeviceKind::Luks1 => Ok(1),
        DeviceKind::Luks2 => Ok(2),
        DeviceKind::Plain => Err(NativeStatus::from_errno(errno::EINVAL)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KdfRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: String,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KeyslotRecord {
    pub salt: String,
    pub iterations: u32,
    pub wrapped_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IntegrityRecord {
    pub integrity: String,
    #[serde(default)]
    pub journal_encryption: Option<String>,
    #[serde(default)]
    pub journal_integrity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HeaderMetadata {
    pub uuid: String,
    pub cipher: String,
    pub cipher_mode: String,
    pub hash: String,
    pub volume_key_size: usize,
    pub digest: String,
    pub digest_salt: String,
    pub digest_iterations: u32,
    /// Payload offset in 512-byte sectors.
    pub data_offset: u64,
    pub sector_size: u32,
    #[serde(default)]
    pub data_device: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub integrity: Option<IntegrityRecord>,
    pub kdf: KdfRecord,
    #[serde(default)]
    pub keyslots: BTreeMap<u32, KeyslotRecord>,
    #[serde(default)]
    pub tokens: BTreeMap<u32, serde_json::Value>,
}

impl HeaderMetadata {
    pub fn cipher_spec(&self) -> String {
        format!("{}-{}", self.cipher, self.cipher_mode)
    }
}

pub(crate) fn encode(kind: DeviceKind, meta: &HeaderMetadata) -> NativeResult<Vec<u8>> {
    let version = version(kind)?;
    let json = serde_json::to_vec(meta).map_err(|err| {
        log::debug!("failed to serialise header metadata: {err}");
        NativeStatus::from_errno(errno::EINVAL)
    })?;
    let size = header_size(kind);
    if PREFIX_LEN + json.len() > size {
        return Err(NativeStatus::from_errno(errno::ENOSPC));
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(&json);
    out.resize(size, 0);
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> NativeResult<(DeviceKind, HeaderMetadata)> {
    let invalid = || NativeStatus::from_errno(errno::EINVAL);
    if bytes.len() < PREFIX_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(invalid());
    }
    let kind = match u16::from_be_bytes([bytes[6], bytes[7]]) {
        1 => DeviceKind::Luks1,
        2 => DeviceKind::Luks2,
        other => {
            log::debug!("unsupported header version {other}");
            return Err(invalid());
        }
    };
    let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if len > header_size(kind) - PREFIX_LEN || PREFIX_LEN + len > bytes.len() {
        return Err(invalid());
    }
    let meta = serde_json::from_slice(&bytes[PREFIX_LEN..PREFIX_LEN + len]).map_err(|err| {
        log::debug!("header metadata is corrupt: {err}");
        invalid()
    })?;
    Ok((kind, meta))
}

pub(crate) fn read_header(path: &Path) -> NativeResult<(DeviceKind, HeaderMetadata)> {
    let mut file = File::open(path).map_err(|err| io_status(&err))?;
    let mut buf = vec![0u8; header_size(DeviceKind::Luks2)];
    let mut filled = 0;
    loop {
        let read = file.read(&mut buf[filled..]).map_err(|err| io_status(&err))?;
        if read == 0 {
            break;
        }
        filled += read;
        if filled == buf.len() {
            break;
        }
    }
    decode(&buf[..filled])
}

pub(crate) fn write_header(path: &Path, kind: DeviceKind, meta: &HeaderMetadata) -> NativeResult<()> {
    let bytes = encode(kind, meta)?;
    write_at(path, 0, &bytes)
}

pub(crate) fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> NativeResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| io_status(&err))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| io_status(&err))?;
    file.write_all(bytes).map_err(|err| io_status(&err))?;
    file.sync_data().map_err(|err| io_status(&err))
}
