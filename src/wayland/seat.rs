//! Seat Model
//!
//! Tracks `wl_seat` globals. The selected seat is where the virtual
//! keyboard and pointer devices are created.

use tracing::debug;
use wayland_client::protocol::wl_seat::{self, Capability, WlSeat};
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};

use crate::server::Daemon;

/// A compositor seat
#[derive(Debug)]
pub struct Seat {
    /// Bound seat proxy
    pub wl_seat: WlSeat,
    /// Registry name of the global, used to notice removal
    pub global_name: u32,
    /// Seat name announced by the compositor
    pub name: Option<String>,
    /// Capability bits announced by the compositor
    pub capabilities: WEnum<Capability>,
}

impl Seat {
    /// Track a freshly bound seat
    pub fn new(wl_seat: WlSeat, global_name: u32) -> Self {
        Self {
            wl_seat,
            global_name,
            name: None,
            capabilities: WEnum::Value(Capability::empty()),
        }
    }
}

impl Dispatch<WlSeat, ()> for Daemon {
    fn event(
        state: &mut Self,
        proxy: &WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(seat) = state
            .seats
            .iter_mut()
            .find(|s| s.wl_seat.id() == proxy.id())
        else {
            return;
        };

        match event {
            wl_seat::Event::Name { name } => {
                debug!("seat '{}'", name);
                seat.name = Some(name);
            }
            wl_seat::Event::Capabilities { capabilities } => {
                seat.capabilities = capabilities;
            }
            _ => {}
        }
    }
}
