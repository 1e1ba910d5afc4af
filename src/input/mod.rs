//! Input Injection
//!
//! Translates remote input events into virtual-device protocol requests:
//!
//! - [`keymap`] resolves key symbols to key codes through a lookup table
//!   built from the active XKB keymap
//! - [`keyboard`] tracks press/release state and emits virtual-keyboard
//!   events with the right modifiers latched
//! - [`pointer`] diffs button masks and forwards absolute motion and scroll
//!   to the virtual pointer
//! - [`keyset`] is the compact presence map backing the press/release
//!   bookkeeping

pub mod error;
pub mod keyboard;
pub mod keymap;
pub mod keyset;
pub mod pointer;

pub use error::InputError;
pub use keyboard::{KeyEventSink, Keyboard};
pub use keymap::{KeymapTable, TableEntry};
pub use keyset::KeySet;
pub use pointer::Pointer;
