//! Compositor Connection Wiring
//!
//! Connects to the Wayland display, enumerates globals and binds the
//! protocol objects the server needs: `wl_shm` plus the two capture
//! managers upstream, and the virtual keyboard/pointer managers for input
//! injection. Outputs and seats are bound per-global and tracked in
//! [`output::Output`] / [`seat::Seat`].

pub mod output;
pub mod seat;

use anyhow::{Context as _, Result};
use tracing::{debug, error, warn};
use wayland_client::globals::{GlobalList, GlobalListContents};
use wayland_client::protocol::{wl_output::WlOutput, wl_registry, wl_seat::WlSeat, wl_shm::WlShm};
use wayland_client::{Connection, Dispatch, QueueHandle};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1;
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1;
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1;
use wayland_protocols_wlr::virtual_pointer::v1::client::zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1;

use crate::server::Daemon;
pub use output::Output;
pub use seat::Seat;

/// Singleton protocol objects bound from the registry
pub struct Globals {
    /// Shared-memory buffer factory
    pub wl_shm: WlShm,
    /// Screencopy capture manager, when advertised at version 2
    pub screencopy: Option<ZwlrScreencopyManagerV1>,
    /// Export-dmabuf capture manager, when advertised
    pub export_dmabuf: Option<ZwlrExportDmabufManagerV1>,
    /// Virtual keyboard manager
    pub virtual_keyboard: ZwpVirtualKeyboardManagerV1,
    /// Virtual pointer manager
    pub virtual_pointer: ZwlrVirtualPointerManagerV1,
    /// xdg-output manager, when advertised
    pub xdg_output: Option<ZxdgOutputManagerV1>,
}

/// Bind the singleton globals the server depends on
///
/// The virtual keyboard and pointer managers are hard requirements. The
/// capture managers are each optional here; the capture scheduler fails
/// later when neither is present.
pub fn bind_globals(globals: &GlobalList, qh: &QueueHandle<Daemon>) -> Result<Globals> {
    let wl_shm: WlShm = globals
        .bind(qh, 1..=1, ())
        .context("compositor does not advertise wl_shm")?;

    // copy_with_damage needs screencopy v2.
    let screencopy: Option<ZwlrScreencopyManagerV1> = globals.bind(qh, 2..=2, ()).ok();
    let export_dmabuf: Option<ZwlrExportDmabufManagerV1> = globals.bind(qh, 1..=1, ()).ok();

    if screencopy.is_none() {
        warn!("zwlr_screencopy_manager_v1 (v2) not advertised");
    }
    if export_dmabuf.is_none() {
        debug!("zwlr_export_dmabuf_manager_v1 not advertised");
    }

    let virtual_keyboard: ZwpVirtualKeyboardManagerV1 = globals.bind(qh, 1..=1, ()).context(
        "compositor does not support the virtual-keyboard protocol; \
         keyboard input cannot be injected",
    )?;

    let virtual_pointer: ZwlrVirtualPointerManagerV1 = globals.bind(qh, 1..=2, ()).context(
        "compositor does not support the wlr virtual-pointer protocol; \
         pointer input cannot be injected",
    )?;

    let xdg_output: Option<ZxdgOutputManagerV1> = globals.bind(qh, 1..=3, ()).ok();

    Ok(Globals {
        wl_shm,
        screencopy,
        export_dmabuf,
        virtual_keyboard,
        virtual_pointer,
        xdg_output,
    })
}

/// Bind every advertised `wl_output`
pub fn bind_outputs(globals: &GlobalList, qh: &QueueHandle<Daemon>) -> Vec<Output> {
    let registry = globals.registry();
    let mut outputs = Vec::new();

    globals.contents().with_list(|list| {
        for global in list {
            if global.interface == "wl_output" {
                let version = global.version.min(4);
                let wl_output: WlOutput = registry.bind(global.name, version, qh, ());
                outputs.push(Output::new(wl_output, global.name));
            }
        }
    });

    outputs
}

/// Bind every advertised `wl_seat`
pub fn bind_seats(globals: &GlobalList, qh: &QueueHandle<Daemon>) -> Vec<Seat> {
    let registry = globals.registry();
    let mut seats = Vec::new();

    globals.contents().with_list(|list| {
        for global in list {
            if global.interface == "wl_seat" {
                let version = global.version.min(7);
                let wl_seat: WlSeat = registry.bind(global.name, version, qh, ());
                seats.push(Seat::new(wl_seat, global.name));
            }
        }
    });

    seats
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for Daemon {
    fn event(
        state: &mut Self,
        _proxy: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::GlobalRemove { name } = event {
            if state
                .outputs
                .get(state.selected_output)
                .is_some_and(|o| o.global_name == name)
            {
                error!("selected output disappeared, shutting down");
                state.running = false;
            }
            if state
                .seats
                .get(state.selected_seat)
                .is_some_and(|s| s.global_name == name)
            {
                error!("selected seat disappeared, shutting down");
                state.running = false;
            }
        }
    }
}
