//! Keymap resolver round-trip tests
//!
//! The virtual-keyboard device receives the serialized form of the keymap
//! the lookup table was built from. These tests check that serializing and
//! re-parsing preserves the table, so the compositor's key-code numbering
//! matches what the injector emits.

use std::collections::HashSet;

use wayrfb::input::KeymapTable;

fn us_table() -> Option<KeymapTable> {
    match KeymapTable::new("us", "") {
        Ok(table) => Some(table),
        Err(e) => {
            // Minimal environments may lack the system XKB data files.
            println!("skipping: {}", e);
            None
        }
    }
}

#[test]
fn serialized_keymap_reparses_to_same_table() {
    let Some(table) = us_table() else { return };

    let reparsed = KeymapTable::from_text(table.as_text()).expect("serialized keymap re-parses");

    let original: HashSet<_> = table
        .entries()
        .iter()
        .map(|e| (e.symbol, e.code, e.level))
        .collect();
    let roundtripped: HashSet<_> = reparsed
        .entries()
        .iter()
        .map(|e| (e.symbol, e.code, e.level))
        .collect();

    assert_eq!(original, roundtripped);
}

#[test]
fn resolver_reproduces_codes_for_all_symbols() {
    let Some(table) = us_table() else { return };

    // For every (symbol, code, level) in the table, find() must return one
    // of the codes the keymap defines for that symbol.
    for entry in table.entries() {
        let found = table.find(entry.symbol).expect("table symbols resolve");

        let valid_codes: Vec<u32> = table
            .entries()
            .iter()
            .filter(|e| e.symbol == entry.symbol)
            .map(|e| e.code)
            .collect();

        assert!(
            valid_codes.contains(&found.code),
            "find({:#x}) returned code {} not among {:?}",
            entry.symbol,
            found.code,
            valid_codes
        );
    }
}

#[test]
fn serialized_keymap_is_nul_terminated_in_shm() {
    use std::io::Read;

    let Some(table) = us_table() else { return };

    let (fd, size) = table.write_to_fd().expect("keymap fits in shm");
    let mut file = std::fs::File::from(fd);

    let mut contents = Vec::new();
    file.read_to_end(&mut contents).unwrap();

    assert_eq!(contents.len(), size);
    assert_eq!(contents.last(), Some(&0u8));
    assert!(contents.starts_with(b"xkb_keymap"));
}
