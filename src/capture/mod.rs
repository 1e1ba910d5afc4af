//! Frame Capture Pipeline
//!
//! Harvests desktop frames from the compositor over one of two protocols:
//!
//! - [`screencopy`]: `zwlr_screencopy_v1`, pixels copied into shared memory
//! - [`dmabuf`]: `zwlr_export_dmabuf_v1`, GPU buffers referenced by fds
//!
//! Both drive the same status machine and are rate-limited to a steady
//! cadence. The [`CaptureScheduler`] owns the backends, picks the active one
//! at startup, enforces single-flight captures and falls back from DMA-BUF
//! to screencopy on permanent failure.

pub mod dmabuf;
pub mod screencopy;

use thiserror::Error;
use wayland_client::protocol::wl_shm;

use crate::render::damage::Rect;
pub use dmabuf::DmabufCapture;
pub use screencopy::ScreencopyCapture;

/// Default sustained capture frequency in Hz
pub const RATE_LIMIT: f64 = 20.0;

/// Default delay-smoother time constant in seconds
pub const DELAY_SMOOTHER_TIME_CONSTANT: f64 = 0.5;

/// Capture state machine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureStatus {
    /// No capture outstanding
    #[default]
    Stopped,
    /// A capture request is in flight; `start` fails fast in this state
    InProgress,
    /// The most recent capture completed and a frame is available
    Done,
    /// The most recent capture failed transiently; retry is allowed
    Failed,
    /// The backend failed permanently; the caller should switch backends
    Fatal,
}

/// Geometry and format of the most recent frame
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfo {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per row (shared-memory path only)
    pub stride: u32,
    /// DRM FourCC pixel format
    pub fourcc_format: u32,
}

/// Capture pipeline errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Compositor advertises neither capture protocol
    #[error("compositor supports neither screencopy nor export-dmabuf")]
    NoBackend,

    /// `start` called while a capture is outstanding
    #[error("capture already in progress")]
    AlreadyInProgress,
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// DRM FourCC for ARGB8888
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");
/// DRM FourCC for XRGB8888
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");
/// DRM FourCC for ABGR8888
pub const DRM_FORMAT_ABGR8888: u32 = fourcc(b"AB24");
/// DRM FourCC for XBGR8888
pub const DRM_FORMAT_XBGR8888: u32 = fourcc(b"XB24");

/// Map a `wl_shm` format to its DRM FourCC
///
/// Only the two formats with remapped enum values need translation; every
/// other `wl_shm` format value already coincides with its FourCC.
pub fn fourcc_from_wl_shm(format: wl_shm::Format) -> u32 {
    match format {
        wl_shm::Format::Argb8888 => DRM_FORMAT_ARGB8888,
        wl_shm::Format::Xrgb8888 => DRM_FORMAT_XRGB8888,
        other => u32::from(other),
    }
}

/// Remaining wait before the next capture may start, in seconds
///
/// `elapsed` is the time since the previous capture completed and `delay` is
/// the smoothed compositor round trip, subtracted so the steady-state cadence
/// meets the rate limit despite compositor latency. Non-positive results mean
/// the capture may start immediately.
pub fn time_left(period: f64, elapsed: f64, delay: f64) -> f64 {
    period - elapsed - delay
}

/// Which backend the scheduler is driving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Shared-memory screencopy
    Screencopy,
    /// GPU-buffer export
    ExportDmabuf,
}

/// Owns the capture backends and arbitrates their lifecycle
pub struct CaptureScheduler {
    pub(crate) screencopy: Option<ScreencopyCapture>,
    pub(crate) dmabuf: Option<DmabufCapture>,
    active: BackendKind,
}

impl Default for CaptureScheduler {
    /// A scheduler with no backends; `start` fails until configured
    fn default() -> Self {
        Self {
            screencopy: None,
            dmabuf: None,
            active: BackendKind::Screencopy,
        }
    }
}

impl CaptureScheduler {
    /// Choose the active backend
    ///
    /// DMA-BUF is preferred when the compositor advertises it and the
    /// configuration allows, otherwise screencopy. With neither protocol
    /// available this fails with [`CaptureError::NoBackend`].
    pub fn new(
        screencopy: Option<ScreencopyCapture>,
        dmabuf: Option<DmabufCapture>,
        prefer_dmabuf: bool,
    ) -> Result<Self, CaptureError> {
        let active = match (&screencopy, &dmabuf) {
            (_, Some(_)) if prefer_dmabuf => BackendKind::ExportDmabuf,
            (Some(_), _) => BackendKind::Screencopy,
            (None, Some(_)) => BackendKind::ExportDmabuf,
            (None, None) => return Err(CaptureError::NoBackend),
        };

        Ok(Self {
            screencopy,
            dmabuf,
            active,
        })
    }

    /// Currently active backend kind
    pub fn active(&self) -> BackendKind {
        self.active
    }

    /// Status of the active backend
    pub fn status(&self) -> CaptureStatus {
        match self.active {
            BackendKind::Screencopy => self
                .screencopy
                .as_ref()
                .map(|b| b.status())
                .unwrap_or_default(),
            BackendKind::ExportDmabuf => {
                self.dmabuf.as_ref().map(|b| b.status()).unwrap_or_default()
            }
        }
    }

    /// Start a capture on the active backend
    ///
    /// Single-flight: a backend with a capture in flight is never started
    /// again; the call is a no-op in that case.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.status() == CaptureStatus::InProgress {
            return Ok(());
        }

        match self.active {
            BackendKind::Screencopy => self
                .screencopy
                .as_mut()
                .ok_or(CaptureError::NoBackend)?
                .start(),
            BackendKind::ExportDmabuf => self
                .dmabuf
                .as_mut()
                .ok_or(CaptureError::NoBackend)?
                .start(),
        }
    }

    /// Stop any outstanding capture; synchronous and idempotent
    pub fn stop(&mut self) {
        if let Some(b) = self.screencopy.as_mut() {
            b.stop();
        }
        if let Some(b) = self.dmabuf.as_mut() {
            b.stop();
        }
    }

    /// Take the completion raised by the active backend, if any
    pub fn take_completion(&mut self) -> Option<CaptureStatus> {
        match self.active {
            BackendKind::Screencopy => self.screencopy.as_mut()?.take_completion(),
            BackendKind::ExportDmabuf => self.dmabuf.as_mut()?.take_completion(),
        }
    }

    /// Switch from DMA-BUF to screencopy after a fatal backend error
    ///
    /// Returns `true` when a screencopy backend is available to take over.
    pub fn fall_back_to_screencopy(&mut self) -> bool {
        if self.active == BackendKind::ExportDmabuf && self.screencopy.is_some() {
            if let Some(b) = self.dmabuf.as_mut() {
                b.stop();
            }
            self.active = BackendKind::Screencopy;
            return true;
        }
        false
    }

    /// Damage hint advertised by the compositor for the most recent frame
    pub fn damage_hint(&self) -> Option<Rect> {
        match self.active {
            BackendKind::Screencopy => self.screencopy.as_ref()?.damage_hint(),
            BackendKind::ExportDmabuf => self.dmabuf.as_ref()?.damage_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_values() {
        assert_eq!(DRM_FORMAT_ARGB8888, 0x3432_5241);
        assert_eq!(DRM_FORMAT_XRGB8888, 0x3432_5258);
    }

    #[test]
    fn test_fourcc_from_wl_shm_known() {
        assert_eq!(
            fourcc_from_wl_shm(wl_shm::Format::Argb8888),
            DRM_FORMAT_ARGB8888
        );
        assert_eq!(
            fourcc_from_wl_shm(wl_shm::Format::Xrgb8888),
            DRM_FORMAT_XRGB8888
        );
    }

    #[test]
    fn test_fourcc_from_wl_shm_passthrough() {
        // Formats other than the remapped pair keep their numeric value.
        assert_eq!(
            fourcc_from_wl_shm(wl_shm::Format::Abgr8888),
            u32::from(wl_shm::Format::Abgr8888)
        );
    }

    #[test]
    fn test_time_left_waits_for_cadence() {
        // Two captures 10 ms apart at 20 Hz leave most of the period to wait.
        let left = time_left(1.0 / 20.0, 0.010, 0.0);
        assert!((left - 0.040).abs() < 1e-9);
    }

    #[test]
    fn test_time_left_bypass_when_late() {
        // Previous frame finished 80 ms ago at 20 Hz: dispatch immediately.
        let left = time_left(1.0 / 20.0, 0.080, 0.0);
        assert!(left < 0.0);
    }

    #[test]
    fn test_time_left_subtracts_delay() {
        // The smoothed delay biases the schedule earlier.
        let left = time_left(1.0 / 20.0, 0.0, 0.0068);
        assert!((left - 0.0432).abs() < 1e-9);
    }
}
