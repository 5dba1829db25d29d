//! Turns `cryptsetup` text output into data the backend can reason about.

use cryptvol_core::{DeviceKind, HeaderDump};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use zeroize::Zeroizing;

fn index_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+(\d+):\s*(\S+)").expect("static regex"))
}

fn field_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z][A-Za-z ]*?):\s*(.*?)\s*$").expect("static regex"))
}

fn luks1_slot_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Key Slot (\d+): (ENABLED|DISABLED)").expect("static regex"))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Top,
    Segments,
    Keyslots,
    Tokens,
    Digests,
    Other,
}

/// Parse `cryptsetup luksDump` for either header version.
pub(crate) fn parse_luks_dump(output: &str) -> Option<HeaderDump> {
    let mut version = None;
    let mut uuid = None;
    let mut label = None;
    let mut cipher = None;
    let mut cipher_mode = None;
    let mut hash = None;
    let mut key_bits = None;
    let mut data_offset = 0u64;
    let mut sector_size = 512u32;
    let mut keyslots = Vec::new();
    let mut tokens = Vec::new();
    let mut section = Section::Top;

    for line in output.lines() {
        if let Some(caps) = luks1_slot_line().captures(line) {
            if &caps[2] == "ENABLED" {
                keyslots.extend(caps[1].parse::<u32>().ok());
            }
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            match line.trim_end() {
                "Data segments:" => {
                    section = Section::Segments;
                    continue;
                }
                "Keyslots:" => {
                    section = Section::Keyslots;
                    continue;
                }
                "Tokens:" => {
                    section = Section::Tokens;
                    continue;
                }
                "Digests:" => {
                    section = Section::Digests;
                    continue;
                }
                _ => {}
            }
            if line.ends_with(':') && !line.contains(' ') {
                section = Section::Other;
                continue;
            }
        }

        if let Some(caps) = index_line().captures(line) {
            let index = caps[1].parse::<u32>().ok();
            match section {
                Section::Keyslots => keyslots.extend(index),
                Section::Tokens => tokens.extend(index),
                _ => {}
            }
            continue;
        }

        let Some(caps) = field_line().captures(line) else {
            continue;
        };
        let key = caps[1].trim();
        let value = caps[2].trim();
        match (section, key) {
            (Section::Top, "Version") => version = value.parse::<u32>().ok(),
            (Section::Top, "UUID") => uuid = Some(value.to_string()),
            (Section::Top, "Label") if value != "(no label)" => label = Some(value.to_string()),
            (Section::Top, "Cipher name") => cipher = Some(value.to_string()),
            (Section::Top, "Cipher mode") => cipher_mode = Some(value.to_string()),
            (Section::Top, "Hash spec") => hash = Some(value.to_string()),
            (Section::Top, "MK bits") => key_bits = leading_number(value),
            (Section::Top, "Payload offset") => data_offset = leading_number(value).unwrap_or(0),
            (Section::Segments, "cipher") => {
                if let Some((name, mode)) = value.split_once('-') {
                    cipher = Some(name.to_string());
                    cipher_mode = Some(mode.to_string());
                }
            }
            (Section::Segments, "offset") => {
                data_offset = leading_number(value).unwrap_or(0) / 512;
            }
            (Section::Segments, "sector") => {
                sector_size = leading_number(value)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(512);
            }
            (Section::Keyslots, "Key") if key_bits.is_none() => key_bits = leading_number(value),
            (Section::Digests, "Hash") if hash.is_none() => hash = Some(value.to_string()),
            _ => {}
        }
    }

    let kind = match version? {
        1 => DeviceKind::Luks1,
        2 => DeviceKind::Luks2,
        _ => return None,
    };
    keyslots.sort_unstable();
    keyslots.dedup();
    tokens.sort_unstable();
    Some(HeaderDump {
        kind,
        uuid,
        cipher: cipher.unwrap_or_default(),
        cipher_mode: cipher_mode.unwrap_or_default(),
        hash,
        volume_key_size: key_bits.map(|bits| bits as usize / 8).unwrap_or(0),
        data_offset,
        sector_size,
        label,
        keyslots,
        tokens,
    })
}

/// Fields of `cryptsetup status <name>` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MappingStatus {
    pub kind: Option<DeviceKind>,
    pub device: Option<PathBuf>,
    pub cipher: Option<String>,
    pub key_size: usize,
    pub offset: u64,
    pub size: u64,
}

pub(crate) fn parse_status(output: &str) -> MappingStatus {
    let mut status = MappingStatus::default();
    for line in output.lines().skip(1) {
        let Some(caps) = field_line().captures(line) else {
            continue;
        };
        let value = caps[2].trim();
        match caps[1].trim() {
            "type" => status.kind = DeviceKind::from_name(value),
            "device" => status.device = Some(PathBuf::from(value)),
            "cipher" => status.cipher = Some(value.to_string()),
            "keysize" => {
                status.key_size = leading_number(value).map(|bits| bits as usize / 8).unwrap_or(0)
            }
            "offset" => status.offset = leading_number(value).unwrap_or(0),
            "size" => status.size = leading_number(value).unwrap_or(0),
            _ => {}
        }
    }
    status
}

/// Slot reported by a verbose unlock, e.g. "Key slot 2 unlocked.".
pub(crate) fn unlocked_slot(output: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Key slot (\d+) unlocked").expect("static regex"));
    re.captures(output).and_then(|caps| caps[1].parse().ok())
}

/// Slot reported by a verbose add, e.g. "Key slot 1 created.".
pub(crate) fn created_slot(output: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Key slot (\d+) created").expect("static regex"));
    re.captures(output).and_then(|caps| caps[1].parse().ok())
}

/// Hex bytes printed after "MK dump:" or "Volume key:", which may wrap onto
/// indented continuation lines.
pub(crate) fn parse_volume_key(output: &str) -> Option<Zeroizing<Vec<u8>>> {
    let mut lines = output.lines();
    let first = lines.find_map(|line| {
        let trimmed = line.trim_start();
        trimmed
            .strip_prefix("MK dump:")
            .or_else(|| trimmed.strip_prefix("Volume key:"))
    })?;

    let mut key = Zeroizing::new(Vec::new());
    push_hex(first, &mut key)?;
    for line in lines {
        if !line.starts_with(char::is_whitespace) || line.trim().is_empty() {
            break;
        }
        push_hex(line, &mut key)?;
    }
    (!key.is_empty()).then_some(key)
}

fn push_hex(text: &str, out: &mut Vec<u8>) -> Option<()> {
    for pair in text.split_whitespace() {
        let [byte] = <[u8; 1]>::try_from(hex::decode(pair).ok()?.as_slice()).ok()?;
        out.push(byte);
    }
    Some(())
}

fn leading_number(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}
