//! Pointer Passthrough
//!
//! Forwards remote pointer state to a `zwlr_virtual_pointer_v1` device. The
//! RFB layer reports absolute position plus an eight-bit button mask on every
//! pointer message; this module diffs the mask against the previously seen
//! one and emits only the transitions.
//!
//! # Button Mask Layout
//!
//! - bit 0: left button (BTN_LEFT)
//! - bit 1: middle button (BTN_MIDDLE)
//! - bit 2: right button (BTN_RIGHT)
//! - bits 3/4: vertical wheel up/down
//! - bits 5/6: horizontal wheel left/right
//! - bit 7: side button (BTN_SIDE)
//!
//! Wheel bits are momentary: each 0→1 transition is one scroll step.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;
use wayland_client::protocol::wl_pointer;
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::QueueHandle;
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

/// Distance covered by one wheel detent, in wl_pointer axis units
const SCROLL_STEP: f64 = 15.0;

/// Evdev button codes for the maskable buttons
const BTN_LEFT: u32 = 0x110;
const BTN_RIGHT: u32 = 0x111;
const BTN_MIDDLE: u32 = 0x112;
const BTN_SIDE: u32 = 0x113;

const BUTTON_MAP: [(u8, u32); 4] = [
    (1 << 0, BTN_LEFT),
    (1 << 1, BTN_MIDDLE),
    (1 << 2, BTN_RIGHT),
    (1 << 7, BTN_SIDE),
];

/// Stateful pointer injector
pub struct Pointer {
    pointer: ZwlrVirtualPointerV1,
    button_mask: u8,
    last_pos: Option<(u32, u32)>,
}

impl Pointer {
    /// Create a virtual pointer on `seat`
    pub fn new<State>(
        manager: &ZwlrVirtualPointerManagerV1,
        seat: &WlSeat,
        qh: &QueueHandle<State>,
    ) -> Self
    where
        State: wayland_client::Dispatch<ZwlrVirtualPointerV1, ()> + 'static,
    {
        let pointer = manager.create_virtual_pointer(Some(seat), qh, ());
        Self {
            pointer,
            button_mask: 0,
            last_pos: None,
        }
    }

    /// Apply a remote pointer report
    ///
    /// `x` and `y` are absolute coordinates inside `[0, x_extent) ×
    /// [0, y_extent)`; the compositor maps the extent onto the output.
    pub fn set(&mut self, x: u32, y: u32, x_extent: u32, y_extent: u32, mask: u8) {
        let time = current_time_millis();

        if self.last_pos != Some((x, y)) {
            self.pointer.motion_absolute(time, x, y, x_extent, y_extent);
            self.pointer.frame();
            self.last_pos = Some((x, y));
        }

        let diff = mask ^ self.button_mask;

        for (bit, code) in BUTTON_MAP {
            if diff & bit != 0 {
                let state = if mask & bit != 0 {
                    wl_pointer::ButtonState::Pressed
                } else {
                    wl_pointer::ButtonState::Released
                };
                debug!("pointer button {:#x} {:?}", code, state);
                self.pointer.button(time, code, state);
                self.pointer.frame();
            }
        }

        self.emit_scroll(time, mask, diff);

        self.button_mask = mask;
    }

    fn emit_scroll(&self, time: u32, mask: u8, diff: u8) {
        const WHEEL_BITS: [(u8, wl_pointer::Axis, f64); 4] = [
            (1 << 3, wl_pointer::Axis::VerticalScroll, -1.0),
            (1 << 4, wl_pointer::Axis::VerticalScroll, 1.0),
            (1 << 5, wl_pointer::Axis::HorizontalScroll, -1.0),
            (1 << 6, wl_pointer::Axis::HorizontalScroll, 1.0),
        ];

        for (bit, axis, direction) in WHEEL_BITS {
            // One step per press edge; the release edge carries no motion.
            if diff & bit != 0 && mask & bit != 0 {
                self.pointer
                    .axis_source(wl_pointer::AxisSource::Wheel);
                self.pointer.axis_discrete(
                    time,
                    axis,
                    direction * SCROLL_STEP,
                    direction as i32,
                );
                self.pointer.frame();
            }
        }
    }

    /// Currently pressed button mask
    pub fn button_mask(&self) -> u8 {
        self.button_mask
    }
}

impl Drop for Pointer {
    fn drop(&mut self) {
        self.pointer.destroy();
    }
}

/// Current time in milliseconds for event timestamps
fn current_time_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}
