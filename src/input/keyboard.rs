//! Keyboard Injection
//!
//! Turns remote key symbols into virtual-keyboard events. Each symbol is
//! resolved through the [`KeymapTable`], the required modifier mask is
//! latched, and the key event is emitted with the evdev key code (XKB code
//! minus 8). A [`KeySet`] tracks pressed codes so duplicate presses and
//! releases are dropped.
//!
//! # Modifier Synchronisation
//!
//! Modifiers are latched independently of any physical keyboard in the same
//! seat, which can desynchronise compositor-level modifier state while a
//! local user is typing. This is a known limitation of injecting through the
//! virtual-keyboard protocol; no attempt is made to read real modifier state
//! back.

use std::os::fd::AsFd;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::QueueHandle;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};

use super::error::Result;
use super::keymap::{symbol_name, KeymapTable};
use super::keyset::KeySet;

/// Offset between XKB key codes and the evdev codes sent on the wire
const EVDEV_OFFSET: u32 = 8;

/// Keymap format value for XKB v1 text (`wl_keyboard.keymap_format`)
const KEYMAP_FORMAT_XKB_V1: u32 = 1;

/// Destination for keyboard wire events
///
/// Seam between the injection logic and the virtual-keyboard protocol
/// object, so the press/release bookkeeping is testable without a
/// compositor.
pub trait KeyEventSink {
    /// Emit a modifier-state event
    fn modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32);
    /// Emit a key press or release for an evdev key code
    fn key(&mut self, code: u32, pressed: bool);
}

/// Production sink backed by `zwp_virtual_keyboard_v1`
pub struct WaylandKeySink {
    keyboard: ZwpVirtualKeyboardV1,
}

impl KeyEventSink for WaylandKeySink {
    fn modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        self.keyboard.modifiers(depressed, latched, locked, group);
    }

    fn key(&mut self, code: u32, pressed: bool) {
        let state = if pressed { 1 } else { 0 };
        self.keyboard.key(current_time_millis(), code, state);
    }
}

impl Drop for WaylandKeySink {
    fn drop(&mut self) {
        self.keyboard.destroy();
    }
}

/// Stateful keyboard injector
pub struct Keyboard {
    table: KeymapTable,
    key_state: KeySet,
    sink: Box<dyn KeyEventSink>,
}

impl Keyboard {
    /// Create a virtual keyboard on `seat` and install the keymap
    ///
    /// Compiles the keymap from the configured layout and variant, writes the
    /// serialized form into a shared-memory fd and hands it to the device so
    /// the compositor's key-code numbering matches the lookup table. The fd
    /// is closed locally once the request is queued.
    pub fn new<State>(
        manager: &ZwpVirtualKeyboardManagerV1,
        seat: &WlSeat,
        qh: &QueueHandle<State>,
        layout: &str,
        variant: &str,
    ) -> Result<Self>
    where
        State: wayland_client::Dispatch<ZwpVirtualKeyboardV1, ()> + 'static,
    {
        let table = KeymapTable::new(layout, variant)?;

        let keyboard = manager.create_virtual_keyboard(seat, qh, ());

        let (fd, size) = table.write_to_fd()?;
        keyboard.keymap(KEYMAP_FORMAT_XKB_V1, fd.as_fd(), size as u32);
        drop(fd);

        info!(
            "virtual keyboard created: layout '{}' variant '{}', keymap {} bytes",
            layout, variant, size
        );

        Ok(Self::with_sink(table, Box::new(WaylandKeySink { keyboard })))
    }

    /// Create an injector over an arbitrary sink
    pub fn with_sink(table: KeymapTable, sink: Box<dyn KeyEventSink>) -> Self {
        let key_state = KeySet::with_capacity(table.max_keycode());
        Self {
            table,
            key_state,
            sink,
        }
    }

    /// Inject a key symbol press or release
    ///
    /// Unknown symbols are logged and dropped. A press for an already-pressed
    /// code, or a release for an unpressed one, emits nothing. Otherwise a
    /// modifier event with the required mask latched precedes the key event.
    pub fn feed(&mut self, symbol: u32, pressed: bool) {
        let Some(entry) = self.table.find(symbol) else {
            warn!("failed to look up keyboard symbol: {}", symbol_name(symbol));
            return;
        };

        let mods = self.table.mods_for_entry(&entry);

        let was_pressed = self.key_state.contains(entry.code);
        if was_pressed == pressed {
            return;
        }

        if pressed {
            self.key_state.set(entry.code);
        } else {
            self.key_state.clear(entry.code);
        }

        debug!(
            "key {}: symbol={} code={} level={} mods={:#x}",
            if pressed { "press" } else { "release" },
            symbol_name(symbol),
            entry.code,
            entry.level,
            mods
        );

        self.sink.modifiers(0, mods, 0, 0);
        self.sink.key(entry.code - EVDEV_OFFSET, pressed);
    }

    /// Whether the code for `symbol` is currently held
    pub fn is_pressed(&self, symbol: u32) -> bool {
        self.table
            .find(symbol)
            .is_some_and(|e| self.key_state.contains(e.code))
    }

    /// Release every key currently held
    ///
    /// Used when the last client disconnects so no key is left stuck in the
    /// session.
    pub fn release_all(&mut self) {
        let held: Vec<u32> = self.key_state.iter().collect();
        for code in held {
            self.key_state.clear(code);
            self.sink.modifiers(0, 0, 0, 0);
            self.sink.key(code - EVDEV_OFFSET, false);
        }
    }
}

/// Current time in milliseconds for event timestamps
fn current_time_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const XK_A_LOWER: u32 = 0x0061;
    const XK_A_UPPER: u32 = 0x0041;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Emitted {
        Modifiers { latched: u32 },
        Key { code: u32, pressed: bool },
    }

    struct RecordingSink(Rc<RefCell<Vec<Emitted>>>);

    impl KeyEventSink for RecordingSink {
        fn modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
            assert_eq!((depressed, locked, group), (0, 0, 0));
            self.0.borrow_mut().push(Emitted::Modifiers { latched });
        }

        fn key(&mut self, code: u32, pressed: bool) {
            self.0.borrow_mut().push(Emitted::Key { code, pressed });
        }
    }

    fn keyboard() -> Option<(Keyboard, Rc<RefCell<Vec<Emitted>>>)> {
        let table = match KeymapTable::new("us", "") {
            Ok(t) => t,
            Err(e) => {
                println!("skipping: {}", e);
                return None;
            }
        };
        let events = Rc::new(RefCell::new(Vec::new()));
        let kb = Keyboard::with_sink(table, Box::new(RecordingSink(events.clone())));
        Some((kb, events))
    }

    #[test]
    fn test_press_emits_modifiers_then_key() {
        let Some((mut kb, events)) = keyboard() else { return };

        kb.feed(XK_A_UPPER, true);

        let events = events.borrow();
        assert_eq!(events.len(), 2);
        match events[0] {
            Emitted::Modifiers { latched } => assert_ne!(latched, 0, "shift must be latched"),
            other => panic!("expected modifier event first, got {:?}", other),
        }
        match events[1] {
            Emitted::Key { pressed, .. } => assert!(pressed),
            other => panic!("expected key event second, got {:?}", other),
        }
    }

    #[test]
    fn test_evdev_offset() {
        let Some((mut kb, events)) = keyboard() else { return };

        let entry = kb.table.find(XK_A_LOWER).unwrap();
        kb.feed(XK_A_LOWER, true);

        assert_eq!(
            events.borrow()[1],
            Emitted::Key {
                code: entry.code - 8,
                pressed: true
            }
        );
    }

    #[test]
    fn test_duplicate_press_is_dropped() {
        let Some((mut kb, events)) = keyboard() else { return };

        kb.feed(XK_A_LOWER, true);
        kb.feed(XK_A_LOWER, true);

        let key_events = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Emitted::Key { .. }))
            .count();
        assert_eq!(key_events, 1);
    }

    #[test]
    fn test_release_without_press_emits_nothing() {
        let Some((mut kb, events)) = keyboard() else { return };

        kb.feed(XK_A_LOWER, false);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_press_release_clears_state() {
        let Some((mut kb, _events)) = keyboard() else { return };

        kb.feed(XK_A_LOWER, true);
        assert!(kb.is_pressed(XK_A_LOWER));

        kb.feed(XK_A_LOWER, false);
        assert!(!kb.is_pressed(XK_A_LOWER));
    }

    #[test]
    fn test_unknown_symbol_is_dropped() {
        let Some((mut kb, events)) = keyboard() else { return };

        kb.feed(0x00ff_fffe, true);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_release_all() {
        let Some((mut kb, events)) = keyboard() else { return };

        kb.feed(XK_A_LOWER, true);
        events.borrow_mut().clear();

        kb.release_all();

        let released = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Emitted::Key { pressed: false, .. }))
            .count();
        assert_eq!(released, 1);
        assert!(!kb.is_pressed(XK_A_LOWER));
    }
}
