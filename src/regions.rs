//! User-declared binary regions.
//!
//! A region is a named `[start, end)` interval in load-relative address
//! space; the simulator produces a dedicated report per region. Regions are
//! loaded once, from a JSON manifest, in one of two shapes:
//!
//! * address-based: a top-level array of `{"start": A, "end": B,
//!   "description": D}` objects, addresses given as integers or as strings
//!   with an optional `0x` prefix;
//! * symbol-based: `{"file": <ELF path>, "regions": [{"symbol": S,
//!   "description": D, "offsets": [SO, EO]}, ...]}`, resolving each symbol's
//!   address and size through the binary's symbol table, with optional
//!   start/end offsets applied.
//!
//! Malformed entries are skipped with a log message; only an unreadable or
//! structurally unrecognizable manifest fails the load. Overlap between
//! regions is not checked, but a duplicated start address is rejected (the
//! first entry wins).

use crate::errors::RegionsError;
use log::{debug, error, warn};
use object::{Object, ObjectSymbol};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryRegion {
    pub description: Arc<str>,
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for BinaryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}>, address: [ {:#018x} - {:#018x} ]",
            self.description, self.start, self.end
        )
    }
}

/// The manifest, keyed by region start address.
#[derive(Debug, Default)]
pub struct BinaryRegions {
    by_start: HashMap<u64, Arc<BinaryRegion>>,
}

impl BinaryRegions {
    pub fn from_manifest(path: &Path) -> Result<Self, RegionsError> {
        let text = fs::read_to_string(path).map_err(|source| RegionsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let top: Value = serde_json::from_str(&text)?;
        let mut this = BinaryRegions::default();
        match &top {
            Value::Array(raw_regions) => this.parse_address_based(raw_regions),
            Value::Object(manifest)
                if manifest.get("file").is_some() && manifest.get("regions").is_some() =>
            {
                this.parse_symbol_based(manifest)?
            }
            _ => return Err(RegionsError::UnknownFormat),
        }
        Ok(this)
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// The region starting exactly at `addr`, if any.
    pub fn lookup_start(&self, addr: u64) -> Option<&Arc<BinaryRegion>> {
        self.by_start.get(&addr)
    }

    fn insert(&mut self, region: BinaryRegion) {
        use std::collections::hash_map::Entry;
        match self.by_start.entry(region.start) {
            Entry::Occupied(_) => {
                error!(
                    "entry for starting address {:#018x} already exists",
                    region.start
                );
            }
            Entry::Vacant(slot) => {
                debug!("loaded region {region}");
                slot.insert(Arc::new(region));
            }
        }
    }

    fn parse_address_based(&mut self, raw_regions: &[Value]) {
        for raw in raw_regions {
            let Some(region) = raw.as_object() else {
                continue;
            };
            let start = region.get("start").and_then(parse_integer);
            let end = region.get("end").and_then(parse_integer);
            let (Some(start), Some(end)) = (start, end) else {
                warn!("skipping region without usable start/end addresses");
                continue;
            };
            if start < 0 || end < 0 {
                continue;
            }
            let description = region
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            self.insert(BinaryRegion {
                description: Arc::from(description),
                start: start as u64,
                end: end as u64,
            });
        }
    }

    fn parse_symbol_based(
        &mut self,
        manifest: &serde_json::Map<String, Value>,
    ) -> Result<(), RegionsError> {
        let bin_path = manifest
            .get("file")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or(RegionsError::UnknownFormat)?;
        let raw_regions = manifest
            .get("regions")
            .and_then(Value::as_array)
            .ok_or(RegionsError::UnknownFormat)?;

        let data = fs::read(&bin_path).map_err(|source| RegionsError::Read {
            path: bin_path.clone(),
            source,
        })?;
        let symbols = read_symbols(&bin_path, &data)?;

        for raw in raw_regions {
            let Some(region) = raw.as_object() else {
                continue;
            };
            let Some(sym_name) = region.get("symbol").and_then(Value::as_str) else {
                continue;
            };
            let Some(&(sym_addr, sym_size)) = symbols.get(sym_name) else {
                warn!("symbol {sym_name} not found");
                continue;
            };
            let description = region
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or(sym_name);

            let (mut start_off, mut end_off) = (0i64, 0i64);
            if let Some(offsets) = region.get("offsets").and_then(Value::as_array) {
                if let Some(so) = offsets.first().and_then(parse_integer) {
                    // The region cannot begin before its symbol.
                    if so >= 0 {
                        start_off = so;
                    }
                }
                if let Some(eo) = offsets.get(1).and_then(parse_integer) {
                    end_off = eo;
                }
            }

            self.insert(BinaryRegion {
                description: Arc::from(description),
                start: (sym_addr as i64 + start_off) as u64,
                end: (sym_addr as i64 + sym_size as i64 + end_off) as u64,
            });
        }
        Ok(())
    }
}

fn read_symbols(path: &Path, data: &[u8]) -> Result<HashMap<String, (u64, u64)>, RegionsError> {
    let obj = object::File::parse(data).map_err(|e| RegionsError::Object {
        path: path.to_owned(),
        msg: e.to_string(),
    })?;
    let mut symbols = HashMap::new();
    for sym in obj.symbols() {
        if let Ok(name) = sym.name() {
            symbols.insert(name.to_owned(), (sym.address(), sym.size()));
        }
    }
    Ok(symbols)
}

/// Accepts JSON integers as well as string-encoded integers with an
/// optional `0x`/`0X` prefix.
fn parse_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    parse_int_str(value.as_str()?)
}

/// String-encoded integer, optionally `0x`/`0X`-prefixed.
pub(crate) fn parse_int_str(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let n = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        s.parse::<i64>().ok()?
    };
    Some(if neg { -n } else { n })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn manifest_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_integer_accepts_hex_strings() {
        assert_eq!(parse_integer(&json!(16)), Some(16));
        assert_eq!(parse_integer(&json!("0x10")), Some(16));
        assert_eq!(parse_integer(&json!("-0x10")), Some(-16));
        assert_eq!(parse_integer(&json!("42")), Some(42));
        assert_eq!(parse_integer(&json!("nope")), None);
        assert_eq!(parse_integer(&json!([])), None);
    }

    #[test]
    fn address_based_manifest() {
        let f = manifest_file(
            r#"[
                {"start": "0x10", "end": "0x18", "description": "hot"},
                {"start": 64, "end": 96},
                {"start": "bogus", "end": 128},
                "not even an object"
            ]"#,
        );
        let regions = BinaryRegions::from_manifest(f.path()).unwrap();
        assert_eq!(regions.len(), 2);
        let hot = regions.lookup_start(0x10).unwrap();
        assert_eq!(&*hot.description, "hot");
        assert_eq!(hot.end, 0x18);
        assert_eq!(&*regions.lookup_start(64).unwrap().description, "");
        assert!(regions.lookup_start(0x18).is_none());
    }

    #[test]
    fn duplicate_start_keeps_first_entry() {
        let f = manifest_file(
            r#"[
                {"start": 16, "end": 24, "description": "first"},
                {"start": 16, "end": 32, "description": "second"}
            ]"#,
        );
        let regions = BinaryRegions::from_manifest(f.path()).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(&*regions.lookup_start(16).unwrap().description, "first");
    }

    #[test]
    fn unrecognized_manifest_is_an_error() {
        let f = manifest_file(r#"{"neither": "format"}"#);
        assert!(matches!(
            BinaryRegions::from_manifest(f.path()),
            Err(RegionsError::UnknownFormat)
        ));
        let f = manifest_file("not json");
        assert!(matches!(
            BinaryRegions::from_manifest(f.path()),
            Err(RegionsError::Json(_))
        ));
    }

    #[test]
    fn symbol_based_manifest() {
        use object::write::{Object, Symbol, SymbolSection};
        use object::{
            Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope,
        };

        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(object::write::StandardSection::Text);
        obj.append_section_data(text, &[0u8; 0x40], 16);
        obj.add_symbol(Symbol {
            name: b"hot_loop".to_vec(),
            value: 0x10,
            size: 0x20,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        let mut bin = tempfile::NamedTempFile::new().unwrap();
        bin.write_all(&obj.write().unwrap()).unwrap();

        let manifest = format!(
            r#"{{
                "file": "{}",
                "regions": [
                    {{"symbol": "hot_loop", "description": "the loop"}},
                    {{"symbol": "hot_loop", "offsets": [4, -4]}},
                    {{"symbol": "missing"}}
                ]
            }}"#,
            bin.path().display()
        );

        let f = manifest_file(&manifest);
        let regions = BinaryRegions::from_manifest(f.path()).unwrap();
        assert_eq!(regions.len(), 2);
        let hot = regions.lookup_start(0x10).unwrap();
        assert_eq!(&*hot.description, "the loop");
        assert_eq!(hot.end, 0x30);
        let shifted = regions.lookup_start(0x14).unwrap();
        assert_eq!(shifted.end, 0x2c);
    }
}
