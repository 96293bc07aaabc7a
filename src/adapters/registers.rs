//! Register map file format (spec §6 "Register map file format") and
//! loader. Declarative: addresses never appear in adapter code (spec §9
//! "Register map evolution"). Grounded on the teacher's `modbus_server.rs`
//! `REG_*`/`VariableType` idiom, turned into data instead of code, and on
//! `test_powdrive.py`'s register-id lookups.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RegisterMapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegisterKind {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterType {
    U16,
    S16,
    U32,
    S32,
    ASCII,
}

impl RegisterType {
    /// Register count implied by the type, used to validate `size`.
    fn expected_size(self) -> u8 {
        match self {
            RegisterType::U16 | RegisterType::S16 => 1,
            RegisterType::U32 | RegisterType::S32 => 2,
            RegisterType::ASCII => 0, // variable; not size-checked
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegisterRw {
    RO,
    RW,
    WO,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDef {
    pub id: String,
    pub name: String,
    pub addr: u16,
    pub size: u8,
    pub kind: RegisterKind,
    #[serde(rename = "type")]
    pub ty: RegisterType,
    pub scale: Option<f64>,
    pub unit: Option<String>,
    pub rw: RegisterRw,
    #[serde(default)]
    pub r#enum: Option<HashMap<String, String>>,
    pub notes: Option<String>,
}

/// Loaded once at startup; caches the ordered list plus an id index (spec
/// §6: "Files are loaded once at startup; the adapter caches the list and
/// an index keyed by `id`").
#[derive(Debug, Clone)]
pub struct RegisterMap {
    defs: Vec<RegisterDef>,
    by_id: HashMap<String, usize>,
}

impl RegisterMap {
    pub fn load(path: &str) -> Result<Self, RegisterMapError> {
        let content = std::fs::read_to_string(path).map_err(|source| RegisterMapError::Io {
            path: path.to_string(),
            source,
        })?;
        let defs: Vec<RegisterDef> = serde_json::from_str(&content).map_err(|source| RegisterMapError::Parse {
            path: path.to_string(),
            source,
        })?;
        Self::from_defs(defs)
    }

    /// Validates: unique ids, `rw` drawn from the allowed set (enforced by
    /// the enum type itself), `size` consistent with `type`, scale numeric
    /// or null (enforced by the `Option<f64>` type) — per spec §9
    /// "Register map evolution".
    pub fn from_defs(defs: Vec<RegisterDef>) -> Result<Self, RegisterMapError> {
        let mut by_id = HashMap::with_capacity(defs.len());
        for (idx, def) in defs.iter().enumerate() {
            if by_id.insert(def.id.clone(), idx).is_some() {
                return Err(RegisterMapError::DuplicateId(def.id.clone()));
            }
            let expected = def.ty.expected_size();
            if expected != 0 && def.size != expected {
                return Err(RegisterMapError::SizeMismatch {
                    id: def.id.clone(),
                    size: def.size,
                    ty: format!("{:?}", def.ty),
                });
            }
        }
        Ok(Self { defs, by_id })
    }

    pub fn get(&self, id: &str) -> Option<&RegisterDef> {
        self.by_id.get(id).map(|&idx| &self.defs[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDef> {
        self.defs.iter()
    }
}

/// Decodes a big-endian two's-complement signed 32-bit value from two
/// 16-bit words (high word first), per spec §4.1 item 2 framing.
pub fn decode_s32(hi: u16, lo: u16) -> i32 {
    (((hi as u32) << 16) | lo as u32) as i32
}

pub fn decode_u32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

pub fn decode_s16(raw: u16) -> i16 {
    raw as i16
}

/// Looks up a decoded numeric register value in its `enum` table (spec §6
/// register map `enum?` field), falling back to the raw value rendered as a
/// string when no mapping matches or none is declared.
pub fn decode_enum_label(raw: i64, enum_map: Option<&HashMap<String, String>>) -> String {
    match enum_map.and_then(|map| map.get(&raw.to_string())) {
        Some(label) => label.clone(),
        None => raw.to_string(),
    }
}

/// Decodes a big-endian ASCII string across `words.len()` registers, two
/// characters per word, trimmed at first NUL (spec §4.1 item 1).
pub fn decode_ascii(words: &[u16]) -> String {
    let mut buf = Vec::with_capacity(words.len() * 2);
    for w in words {
        buf.push((w >> 8) as u8);
        buf.push((*w & 0xFF) as u8);
    }
    super::trim_at_nul(&buf)
}

/// Encodes a string back into big-endian register words, NUL-padded to
/// `word_count` words, for round-trip testing (spec §8 "Round-trip /
/// idempotence": `decode(encode(s)) == s`).
pub fn encode_ascii(s: &str, word_count: usize) -> Vec<u16> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(word_count * 2, 0);
    bytes
        .chunks(2)
        .map(|chunk| ((chunk[0] as u16) << 8) | chunk[1] as u16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_defs() -> Vec<RegisterDef> {
        vec![RegisterDef {
            id: "model".into(),
            name: "Model".into(),
            addr: 3,
            size: 0,
            kind: RegisterKind::Holding,
            ty: RegisterType::ASCII,
            scale: None,
            unit: None,
            rw: RegisterRw::RO,
            r#enum: None,
            notes: None,
        }]
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut defs = sample_defs();
        defs.push(defs[0].clone());
        assert!(matches!(RegisterMap::from_defs(defs), Err(RegisterMapError::DuplicateId(_))));
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut defs = vec![RegisterDef {
            id: "soc".into(),
            name: "SOC".into(),
            addr: 10,
            size: 2,
            kind: RegisterKind::Input,
            ty: RegisterType::U16,
            scale: None,
            unit: None,
            rw: RegisterRw::RO,
            r#enum: None,
            notes: None,
        }];
        assert!(matches!(RegisterMap::from_defs(std::mem::take(&mut defs)), Err(RegisterMapError::SizeMismatch { .. })));
    }

    #[test]
    fn ascii_round_trips_without_embedded_nul() {
        let words = encode_ascii("SN12345", 5);
        assert_eq!(decode_ascii(&words), "SN12345");
    }

    #[test]
    fn s32_decodes_high_word_first() {
        // -1 as two's complement 32-bit: 0xFFFFFFFF
        assert_eq!(decode_s32(0xFFFF, 0xFFFF), -1);
        assert_eq!(decode_s32(0x0000, 0x0001), 1);
    }

    #[test]
    fn enum_label_falls_back_to_raw_value() {
        assert_eq!(decode_enum_label(2, None), "2");
        let map: HashMap<String, String> = [("0".to_string(), "standby".to_string())].into();
        assert_eq!(decode_enum_label(2, Some(&map)), "2");
    }

    #[test]
    fn enum_label_resolves_mapped_value() {
        let map: HashMap<String, String> = [("1".to_string(), "grid_lost".to_string())].into();
        assert_eq!(decode_enum_label(1, Some(&map)), "grid_lost");
    }
}
