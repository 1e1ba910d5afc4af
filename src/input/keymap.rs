//! Keymap Resolution
//!
//! Builds a lookup table from key symbols to key codes out of the active XKB
//! keymap, so that symbols arriving from remote viewers can be turned into
//! key events the compositor understands.
//!
//! # Table Construction
//!
//! For every key code in the keymap, for every shift level defined for that
//! code at layout index 0, each symbol produced at that level contributes one
//! `(symbol, code, level)` entry. The table is sorted by `(symbol, level)` so
//! that all entries for a symbol are contiguous with the lowest level first.
//! The lowest level is the preferred way to type a symbol: `a` resolves to
//! the unshifted key, `A` to the same key at the shift level.
//!
//! # Keymap Sharing
//!
//! The compositor numbers key codes according to the keymap installed on the
//! virtual-keyboard device. [`KeymapTable::write_to_fd`] serializes the
//! keymap to XKB v1 text in a shared-memory segment so the caller can install
//! the exact map the table was built from.

use std::fs::File;
use std::io::{Seek, Write};
use std::os::fd::OwnedFd;

use tracing::debug;
use xkbcommon::xkb;

use super::error::{InputError, Result};
use crate::shm;

/// One lookup table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    /// Keysym value as transmitted on the wire
    pub symbol: u32,
    /// XKB key code producing the symbol
    pub code: u32,
    /// Shift level at which the code produces the symbol
    pub level: u32,
}

/// Symbol lookup table over the active keymap
pub struct KeymapTable {
    keymap: xkb::Keymap,
    table: Vec<TableEntry>,
}

impl KeymapTable {
    /// Compile a keymap from rule names and build the lookup table
    ///
    /// The keymap is built from `{rules: default, model: pc105, layout,
    /// variant}`. An empty layout selects the system default.
    pub fn new(layout: &str, variant: &str) -> Result<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);

        let keymap = xkb::Keymap::new_from_names(
            &context,
            "",
            "pc105",
            layout,
            variant,
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| InputError::KeymapCompile {
            layout: layout.to_string(),
            variant: variant.to_string(),
        })?;

        let table = build_table(&keymap);

        debug!(
            "keymap lookup table built: {} entries over key codes {}..={}",
            table.len(),
            keymap.min_keycode().raw(),
            keymap.max_keycode().raw()
        );

        Ok(Self { keymap, table })
    }

    /// Build the lookup table from a serialized XKB v1 keymap
    ///
    /// Counterpart of [`KeymapTable::as_text`]; used to verify that the
    /// serialized form the compositor receives describes the same table.
    pub fn from_text(text: String) -> Result<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);

        let keymap = xkb::Keymap::new_from_string(
            &context,
            text,
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| InputError::KeymapCompile {
            layout: "<serialized>".to_string(),
            variant: String::new(),
        })?;

        let table = build_table(&keymap);
        Ok(Self { keymap, table })
    }

    /// Find the preferred entry for `symbol`
    ///
    /// Binary-searches for any entry carrying the symbol, then walks left to
    /// the first one, which has the lowest level. Returns `None` when the
    /// keymap cannot produce the symbol.
    pub fn find(&self, symbol: u32) -> Option<TableEntry> {
        let mut idx = self
            .table
            .binary_search_by(|e| e.symbol.cmp(&symbol))
            .ok()?;

        while idx > 0 && self.table[idx - 1].symbol == symbol {
            idx -= 1;
        }

        Some(self.table[idx])
    }

    /// Modifier mask required to produce `entry`'s symbol
    ///
    /// Resolved by probing: a scratch state is driven through candidate
    /// masks of one, two and then three modifier bits until the key reports
    /// the entry's level at layout 0, and the first (smallest) matching mask
    /// wins. Level 0 never needs modifiers. Real keymaps do not define
    /// levels behind more than three simultaneous modifiers; if one ever
    /// did, the probe would come up empty and return no modifiers.
    pub fn mods_for_entry(&self, entry: &TableEntry) -> xkb::ModMask {
        if entry.level == 0 {
            return 0;
        }

        let code = xkb::Keycode::new(entry.code);
        let num_mods = self.keymap.num_mods();
        let mut state = xkb::State::new(&self.keymap);

        let mut matches = |mask: xkb::ModMask| {
            state.update_mask(mask, 0, 0, 0, 0, 0);
            state.key_get_level(code, 0) == entry.level
        };

        for a in 0..num_mods {
            let mask = 1u32 << a;
            if matches(mask) {
                return mask;
            }
        }

        for a in 0..num_mods {
            for b in a + 1..num_mods {
                let mask = 1u32 << a | 1u32 << b;
                if matches(mask) {
                    return mask;
                }
            }
        }

        for a in 0..num_mods {
            for b in a + 1..num_mods {
                for c in b + 1..num_mods {
                    let mask = 1u32 << a | 1u32 << b | 1u32 << c;
                    if matches(mask) {
                        return mask;
                    }
                }
            }
        }

        0
    }

    /// Largest key code in the keymap
    pub fn max_keycode(&self) -> u32 {
        self.keymap.max_keycode().raw()
    }

    /// Serialize the keymap to XKB v1 text format
    pub fn as_text(&self) -> String {
        self.keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1)
    }

    /// Write the serialized keymap into a shared-memory fd
    ///
    /// Returns the fd and the segment size (text plus terminating NUL). The
    /// caller hands the fd to the virtual-keyboard device and drops it.
    pub fn write_to_fd(&self) -> Result<(OwnedFd, usize)> {
        let text = self.as_text();
        if text.is_empty() {
            return Err(InputError::EmptyKeymap);
        }

        let size = text.len() + 1;
        let fd = shm::alloc_fd(size)?;

        let mut file = File::from(fd);
        file.write_all(text.as_bytes())?;
        file.write_all(&[0])?;
        // Readers that consume the fd sequentially start from the beginning.
        file.rewind()?;

        Ok((file.into(), size))
    }

    /// All table entries in sorted order
    pub fn entries(&self) -> &[TableEntry] {
        &self.table
    }
}

fn build_table(keymap: &xkb::Keymap) -> Vec<TableEntry> {
    let mut table = Vec::with_capacity(128);

    keymap.key_for_each(|keymap, code| {
        let n_levels = keymap.num_levels_for_key(code, 0);
        for level in 0..n_levels {
            for sym in keymap.key_get_syms_by_level(code, 0, level) {
                table.push(TableEntry {
                    symbol: sym.raw(),
                    code: code.raw(),
                    level,
                });
            }
        }
    });

    table.sort_by_key(|e| (e.symbol, e.level));
    table
}

/// Printable name for a keysym, for diagnostics
pub fn symbol_name(symbol: u32) -> String {
    let name = xkb::keysym_get_name(xkb::Keysym::from(symbol));
    if name.is_empty() {
        format!("UNKNOWN ({:#x})", symbol)
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XK_A_LOWER: u32 = 0x0061;
    const XK_A_UPPER: u32 = 0x0041;

    fn us_table() -> Option<KeymapTable> {
        match KeymapTable::new("us", "") {
            Ok(t) => Some(t),
            Err(e) => {
                // Minimal environments may lack the system XKB data files.
                println!("skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_table_sorted_and_unique() {
        let Some(table) = us_table() else { return };

        let entries = table.entries();
        assert!(!entries.is_empty());

        for pair in entries.windows(2) {
            assert!(
                (pair[0].symbol, pair[0].level) <= (pair[1].symbol, pair[1].level),
                "table not sorted at {:?}",
                pair
            );
        }

        let mut seen = std::collections::HashSet::new();
        for e in entries {
            assert!(
                seen.insert((e.symbol, e.code, e.level)),
                "duplicate entry {:?}",
                e
            );
        }
    }

    #[test]
    fn test_find_prefers_lowest_level() {
        let Some(table) = us_table() else { return };

        let lower = table.find(XK_A_LOWER).expect("keysym a resolvable");
        let upper = table.find(XK_A_UPPER).expect("keysym A resolvable");

        // Same physical key, different shift levels.
        assert_eq!(lower.code, upper.code);
        assert_eq!(lower.level, 0);
        assert_eq!(upper.level, 1);
    }

    #[test]
    fn test_find_matches_table_entries() {
        let Some(table) = us_table() else { return };

        for entry in table.entries() {
            let found = table.find(entry.symbol).unwrap();
            assert_eq!(found.symbol, entry.symbol);
            // The returned entry is the first for the symbol.
            assert!(found.level <= entry.level);
        }
    }

    #[test]
    fn test_find_unknown_symbol() {
        let Some(table) = us_table() else { return };
        assert!(table.find(0x00ff_fffe).is_none());
    }

    #[test]
    fn test_mods_for_shift_level() {
        let Some(table) = us_table() else { return };

        let lower = table.find(XK_A_LOWER).unwrap();
        assert_eq!(table.mods_for_entry(&lower), 0);

        let upper = table.find(XK_A_UPPER).unwrap();
        let mods = table.mods_for_entry(&upper);
        assert_ne!(mods, 0, "uppercase A requires a modifier");
    }

    #[test]
    fn test_symbol_name() {
        assert_eq!(symbol_name(XK_A_LOWER), "a");
        assert_eq!(symbol_name(XK_A_UPPER), "A");
    }
}
