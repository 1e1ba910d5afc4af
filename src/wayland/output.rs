//! Output Model
//!
//! Tracks `wl_output` globals together with their xdg-output metadata. The
//! capture pipeline works in the output's buffer space; the RFB layer and
//! the virtual pointer work in the transformed (displayed) space, so this
//! module also provides the coordinate mapping between the two.

use tracing::debug;
use wayland_client::protocol::wl_output::{self, Transform, WlOutput};
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_v1::{self, ZxdgOutputV1};

use crate::server::Daemon;

/// Whether a transform swaps the width and height axes
pub fn transform_swaps_axes(transform: Transform) -> bool {
    matches!(
        transform,
        Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270
    )
}

/// Displayed size of a `width × height` buffer under `transform`
pub fn transformed_size(width: u32, height: u32, transform: Transform) -> (u32, u32) {
    if transform_swaps_axes(transform) {
        (height, width)
    } else {
        (width, height)
    }
}

/// Map a point from displayed space back into buffer space
///
/// Viewers position the pointer in the image they see; the virtual pointer
/// wants coordinates in the output's buffer space, so the inverse of the
/// output transform is applied. Coordinates are clamped to the image.
pub fn transform_coord(
    width: u32,
    height: u32,
    transform: Transform,
    x: u32,
    y: u32,
) -> (u32, u32) {
    let (tw, th) = transformed_size(width, height, transform);
    let x = x.min(tw.saturating_sub(1));
    let y = y.min(th.saturating_sub(1));
    let w = width.saturating_sub(1);
    let h = height.saturating_sub(1);

    match transform {
        Transform::Normal => (x, y),
        Transform::_90 => (y, h - x),
        Transform::_180 => (w - x, h - y),
        Transform::_270 => (w - y, x),
        Transform::Flipped => (w - x, y),
        Transform::Flipped90 => (y, x),
        Transform::Flipped180 => (x, h - y),
        Transform::Flipped270 => (w - y, h - x),
        _ => (x, y),
    }
}

/// A compositor output
#[derive(Debug)]
pub struct Output {
    /// Bound output proxy
    pub wl_output: WlOutput,
    /// Registry name of the global, used to notice removal
    pub global_name: u32,
    /// xdg-output object, when the manager is available
    pub xdg_output: Option<ZxdgOutputV1>,
    /// Output name (xdg-output, or wl_output v4)
    pub name: Option<String>,
    /// Human-readable description
    pub description: Option<String>,
    /// Buffer width in pixels (current mode)
    pub width: u32,
    /// Buffer height in pixels (current mode)
    pub height: u32,
    /// Output transform applied by the compositor
    pub transform: Transform,
}

impl Output {
    /// Track a freshly bound output
    pub fn new(wl_output: WlOutput, global_name: u32) -> Self {
        Self {
            wl_output,
            global_name,
            xdg_output: None,
            name: None,
            description: None,
            width: 0,
            height: 0,
            transform: Transform::Normal,
        }
    }

    /// Width of the displayed image
    pub fn transformed_width(&self) -> u32 {
        transformed_size(self.width, self.height, self.transform).0
    }

    /// Height of the displayed image
    pub fn transformed_height(&self) -> u32 {
        transformed_size(self.width, self.height, self.transform).1
    }

    /// Map a displayed-space point into buffer space
    pub fn transform_coord(&self, x: u32, y: u32) -> (u32, u32) {
        transform_coord(self.width, self.height, self.transform, x, y)
    }
}

impl Dispatch<WlOutput, ()> for Daemon {
    fn event(
        state: &mut Self,
        proxy: &WlOutput,
        event: wl_output::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(output) = state
            .outputs
            .iter_mut()
            .find(|o| o.wl_output.id() == proxy.id())
        else {
            return;
        };

        match event {
            wl_output::Event::Geometry { transform, .. } => {
                if let WEnum::Value(transform) = transform {
                    output.transform = transform;
                }
            }
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                ..
            } => {
                if flags.contains(wl_output::Mode::Current) {
                    output.width = width as u32;
                    output.height = height as u32;
                }
            }
            wl_output::Event::Name { name } => {
                if output.name.is_none() {
                    output.name = Some(name);
                }
            }
            wl_output::Event::Description { description } => {
                if output.description.is_none() {
                    output.description = Some(description);
                }
            }
            wl_output::Event::Done => {
                debug!(
                    "output '{}': {}x{} transform {:?}",
                    output.name.as_deref().unwrap_or("?"),
                    output.width,
                    output.height,
                    output.transform
                );
            }
            _ => {}
        }
    }
}

impl Dispatch<ZxdgOutputV1, ()> for Daemon {
    fn event(
        state: &mut Self,
        proxy: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(output) = state.outputs.iter_mut().find(|o| {
            o.xdg_output
                .as_ref()
                .is_some_and(|x| x.id() == proxy.id())
        }) else {
            return;
        };

        match event {
            zxdg_output_v1::Event::Name { name } => {
                // xdg-output names take precedence over wl_output v4 names.
                output.name = Some(name);
            }
            zxdg_output_v1::Event::Description { description } => {
                output.description = Some(description);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transformed_dimensions() {
        assert_eq!(transformed_size(1920, 1080, Transform::Normal), (1920, 1080));
        assert_eq!(transformed_size(1920, 1080, Transform::_90), (1080, 1920));
        assert_eq!(transformed_size(1920, 1080, Transform::Flipped270), (1080, 1920));
        assert_eq!(transformed_size(1920, 1080, Transform::_180), (1920, 1080));
    }

    #[test]
    fn test_transform_coord_normal() {
        assert_eq!(transform_coord(1920, 1080, Transform::Normal, 10, 20), (10, 20));
    }

    #[test]
    fn test_transform_coord_90() {
        // Top-left of the displayed image maps to the bottom-left buffer
        // corner under a 90 degree rotation.
        assert_eq!(transform_coord(1920, 1080, Transform::_90, 0, 0), (0, 1919));
    }

    #[test]
    fn test_transform_coord_180_corners() {
        assert_eq!(transform_coord(100, 50, Transform::_180, 0, 0), (99, 49));
        assert_eq!(transform_coord(100, 50, Transform::_180, 99, 49), (0, 0));
    }

    #[test]
    fn test_transform_coord_flipped() {
        assert_eq!(transform_coord(100, 50, Transform::Flipped, 0, 10), (99, 10));
    }

    #[test]
    fn test_transform_coord_clamps() {
        assert_eq!(
            transform_coord(100, 50, Transform::Normal, 5000, 5000),
            (99, 49)
        );
    }
}
