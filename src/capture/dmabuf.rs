//! Export-DMABUF Capture Backend
//!
//! Drives `zwlr_export_dmabuf_manager_v1`. Pixel data never enters host
//! memory: the compositor hands over one dma-buf file descriptor per plane
//! together with format, modifier, offset and pitch. The fds are owned here
//! from the `object` event until the renderer imports them into an EGL
//! image; `stop` and failure paths close any fds still outstanding.
//!
//! After `ready`, delivery is deferred with a one-shot timer when the
//! rate-limit deadline has not been reached yet; otherwise completion is
//! raised immediately.

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};
use tracing::{debug, trace, warn};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1::{self, CancelReason, ZwlrExportDmabufFrameV1},
    zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
};

use super::{time_left, CaptureError, CaptureStatus};
use crate::render::damage::Rect;
use crate::server::Daemon;

/// Maximum planes a dma-buf frame can carry
pub const MAX_PLANES: usize = 4;

/// One dma-buf plane; the fd is moved, never copied
#[derive(Debug)]
pub struct DmabufPlane {
    /// Kernel-shareable buffer handle, owned by the current holder
    pub fd: OwnedFd,
    /// Byte offset of the plane inside the buffer
    pub offset: u32,
    /// Bytes per row
    pub pitch: u32,
    /// Plane size in bytes
    pub size: u32,
    /// DRM format modifier
    pub modifier: u64,
}

/// A complete GPU-resident frame ready for EGL import
///
/// Owning this value means owning the plane fds; dropping it closes them.
#[derive(Debug, Default)]
pub struct DmabufFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// DRM FourCC pixel format
    pub format: u32,
    /// Planes in plane-index order
    pub planes: Vec<DmabufPlane>,
}

/// Export-dmabuf capture backend state machine
pub struct DmabufCapture {
    manager: ZwlrExportDmabufManagerV1,
    output: WlOutput,
    overlay_cursor: bool,

    qh: QueueHandle<Daemon>,
    handle: LoopHandle<'static, Daemon>,

    status: CaptureStatus,
    completion: Option<CaptureStatus>,
    zwlr_frame: Option<ZwlrExportDmabufFrameV1>,

    width: u32,
    height: u32,
    format: u32,
    modifier: u64,
    planes: [Option<DmabufPlane>; MAX_PLANES],
    expected_planes: u32,
    damage_hint: Option<Rect>,

    period: f64,
    last_time: Option<Instant>,
    timer: Option<RegistrationToken>,
}

impl DmabufCapture {
    /// Create the backend over an already-bound manager
    pub fn new(
        manager: ZwlrExportDmabufManagerV1,
        output: WlOutput,
        overlay_cursor: bool,
        rate_limit_hz: f64,
        qh: QueueHandle<Daemon>,
        handle: LoopHandle<'static, Daemon>,
    ) -> Self {
        Self {
            manager,
            output,
            overlay_cursor,
            qh,
            handle,
            status: CaptureStatus::Stopped,
            completion: None,
            zwlr_frame: None,
            width: 0,
            height: 0,
            format: 0,
            modifier: 0,
            planes: Default::default(),
            expected_planes: 0,
            damage_hint: None,
            period: 1.0 / rate_limit_hz,
            last_time: None,
            timer: None,
        }
    }

    /// Current status
    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    /// Take the pending completion, if any
    pub fn take_completion(&mut self) -> Option<CaptureStatus> {
        self.completion.take()
    }

    /// Damage hint for the most recent frame (whole frame for this protocol)
    pub fn damage_hint(&self) -> Option<Rect> {
        self.damage_hint
    }

    /// Move the completed frame out of the backend
    ///
    /// Transfers fd ownership to the caller. Only meaningful while the
    /// status is [`CaptureStatus::Done`].
    pub fn take_frame(&mut self) -> Option<DmabufFrame> {
        if self.status != CaptureStatus::Done {
            return None;
        }

        let planes: Vec<DmabufPlane> = self.planes.iter_mut().filter_map(|p| p.take()).collect();
        if planes.is_empty() {
            return None;
        }

        Some(DmabufFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            planes,
        })
    }

    /// Start a capture
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.status == CaptureStatus::InProgress {
            return Err(CaptureError::AlreadyInProgress);
        }

        let frame =
            self.manager
                .capture_output(self.overlay_cursor as i32, &self.output, &self.qh, ());
        self.zwlr_frame = Some(frame);
        self.status = CaptureStatus::InProgress;

        Ok(())
    }

    /// Stop any outstanding capture; synchronous and idempotent
    ///
    /// Cancels the delivery timer, releases the compositor-side frame object
    /// and closes all plane fds still held.
    pub fn stop(&mut self) {
        self.cancel_timer();
        self.close_fds();
        self.destroy_frame();
        if self.status == CaptureStatus::InProgress {
            self.status = CaptureStatus::Stopped;
        }
    }

    /// Deferred-delivery timer fired
    pub(crate) fn timer_fired(&mut self) {
        self.timer = None;
        if self.status != CaptureStatus::InProgress {
            return;
        }

        self.last_time = Some(Instant::now());
        self.status = CaptureStatus::Done;
        self.completion = Some(CaptureStatus::Done);
    }

    fn close_fds(&mut self) {
        for plane in self.planes.iter_mut() {
            // OwnedFd closes on drop, exactly once.
            plane.take();
        }
        self.expected_planes = 0;
    }

    fn destroy_frame(&mut self) {
        if let Some(frame) = self.zwlr_frame.take() {
            frame.destroy();
        }
    }

    fn is_current_frame(&self, proxy: &ZwlrExportDmabufFrameV1) -> bool {
        self.zwlr_frame
            .as_ref()
            .is_some_and(|f| f.id() == proxy.id())
    }

    fn arm_timer(&mut self, seconds: f64) {
        self.cancel_timer();
        let timer = Timer::from_duration(Duration::from_secs_f64(seconds));
        match self.handle.insert_source(timer, |_, _, daemon| {
            if let Some(backend) = daemon.capture.dmabuf.as_mut() {
                backend.timer_fired();
            }
            daemon.pump_capture();
            TimeoutAction::Drop
        }) {
            Ok(token) => self.timer = Some(token),
            Err(e) => {
                warn!("dmabuf: failed to arm delivery timer: {}", e);
                self.timer_fired();
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            self.handle.remove(token);
        }
    }

    fn on_frame(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
        mod_high: u32,
        mod_low: u32,
        num_objects: u32,
    ) {
        self.cancel_timer();
        self.close_fds();

        self.width = width;
        self.height = height;
        self.format = format;
        self.modifier = (mod_high as u64) << 32 | mod_low as u64;
        self.expected_planes = num_objects.min(MAX_PLANES as u32);

        // This protocol reports no damage; assume the whole output changed.
        self.damage_hint = Some(Rect {
            x: 0,
            y: 0,
            width,
            height,
        });
    }

    fn on_object(&mut self, fd: OwnedFd, size: u32, offset: u32, stride: u32, plane_index: u32) {
        let index = plane_index as usize;
        if index >= MAX_PLANES {
            warn!("dmabuf: plane index {} out of range, dropping fd", index);
            return;
        }

        self.planes[index] = Some(DmabufPlane {
            fd,
            offset,
            pitch: stride,
            size,
            modifier: self.modifier,
        });
    }

    fn on_ready(&mut self) {
        self.destroy_frame();

        let now = Instant::now();
        let wait = match self.last_time {
            Some(last) => time_left(self.period, now.duration_since(last).as_secs_f64(), 0.0),
            None => 0.0,
        };

        if wait > 0.0 {
            trace!("dmabuf: deferring delivery by {:.1} ms", wait * 1e3);
            self.arm_timer(wait);
            return;
        }

        self.last_time = Some(now);
        self.status = CaptureStatus::Done;
        self.completion = Some(CaptureStatus::Done);
    }

    fn on_cancel(&mut self, reason: CancelReason) {
        self.cancel_timer();
        self.destroy_frame();
        self.close_fds();

        let status = if reason == CancelReason::Permanent {
            CaptureStatus::Fatal
        } else {
            CaptureStatus::Failed
        };

        debug!("dmabuf: capture cancelled ({:?}) -> {:?}", reason, status);

        self.status = status;
        self.completion = Some(status);
    }
}

impl Drop for DmabufCapture {
    fn drop(&mut self) {
        self.cancel_timer();
        self.close_fds();
        self.destroy_frame();
        self.manager.destroy();
    }
}

impl Dispatch<ZwlrExportDmabufFrameV1, ()> for Daemon {
    fn event(
        state: &mut Self,
        proxy: &ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
        _data: &(),
        _conn: &wayland_client::Connection,
        _qh: &QueueHandle<Self>,
    ) {
        {
            let Some(backend) = state.capture.dmabuf.as_mut() else {
                return;
            };
            if !backend.is_current_frame(proxy) {
                return;
            }

            use zwlr_export_dmabuf_frame_v1::Event;
            match event {
                Event::Frame {
                    width,
                    height,
                    format,
                    mod_high,
                    mod_low,
                    num_objects,
                    ..
                } => backend.on_frame(width, height, format, mod_high, mod_low, num_objects),
                Event::Object {
                    fd,
                    size,
                    offset,
                    stride,
                    plane_index,
                    ..
                } => backend.on_object(fd, size, offset, stride, plane_index),
                Event::Ready { .. } => backend.on_ready(),
                Event::Cancel {
                    reason: WEnum::Value(reason),
                } => backend.on_cancel(reason),
                Event::Cancel { .. } => backend.on_cancel(CancelReason::Temporary),
                _ => {}
            }
        }

        state.pump_capture();
    }
}
