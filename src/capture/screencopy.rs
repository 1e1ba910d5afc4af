//! Screencopy Capture Backend
//!
//! Drives `zwlr_screencopy_manager_v1`. The compositor announces the buffer
//! geometry it wants to copy into, we provide a shared-memory `wl_buffer`,
//! request a damage-reporting copy and wait for `ready`/`failed`.
//!
//! The pixel buffer is pooled: it is recreated only when the announced
//! `(format, width, height, stride)` tuple changes. The backing fd is closed
//! locally as soon as the compositor-side objects are bound to it.
//!
//! Captures are rate-limited. `start` computes how much of the period is
//! left, subtracts the smoothed compositor round-trip delay, and either arms
//! a one-shot timer or issues the capture request immediately.

use std::fs::File;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error, trace, warn};
use wayland_client::protocol::{wl_buffer::WlBuffer, wl_output::WlOutput, wl_shm, wl_shm::WlShm};
use wayland_client::{Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols_wlr::screencopy::v1::client::{
    zwlr_screencopy_frame_v1::{self, ZwlrScreencopyFrameV1},
    zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
};

use super::{fourcc_from_wl_shm, time_left, CaptureError, CaptureStatus, FrameInfo};
use crate::render::damage::Rect;
use crate::server::Daemon;
use crate::shm;
use crate::smooth::Smoother;

/// Pooled shared-memory buffer bound to the compositor
struct ShmBuffer {
    wl_buffer: WlBuffer,
    map: MmapMut,
    format: wl_shm::Format,
    width: u32,
    height: u32,
    stride: u32,
}

impl ShmBuffer {
    fn matches(&self, format: wl_shm::Format, width: u32, height: u32, stride: u32) -> bool {
        self.format == format
            && self.width == width
            && self.height == height
            && self.stride == stride
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        self.wl_buffer.destroy();
    }
}

/// Screencopy capture backend state machine
pub struct ScreencopyCapture {
    manager: ZwlrScreencopyManagerV1,
    wl_shm: WlShm,
    output: WlOutput,
    overlay_cursor: bool,

    qh: QueueHandle<Daemon>,
    handle: LoopHandle<'static, Daemon>,

    status: CaptureStatus,
    completion: Option<CaptureStatus>,
    frame: Option<ZwlrScreencopyFrameV1>,
    buffer: Option<ShmBuffer>,

    frame_info: FrameInfo,
    damage_hint: Option<Rect>,
    y_invert: bool,

    period: f64,
    smoother: Smoother,
    delay: f64,
    start_time: Instant,
    last_ready: Option<Instant>,
    timer: Option<RegistrationToken>,
}

impl ScreencopyCapture {
    /// Create the backend over an already-bound manager
    pub fn new(
        manager: ZwlrScreencopyManagerV1,
        wl_shm: WlShm,
        output: WlOutput,
        overlay_cursor: bool,
        rate_limit_hz: f64,
        smoother_time_constant: f64,
        qh: QueueHandle<Daemon>,
        handle: LoopHandle<'static, Daemon>,
    ) -> Self {
        Self {
            manager,
            wl_shm,
            output,
            overlay_cursor,
            qh,
            handle,
            status: CaptureStatus::Stopped,
            completion: None,
            frame: None,
            buffer: None,
            frame_info: FrameInfo::default(),
            damage_hint: None,
            y_invert: false,
            period: 1.0 / rate_limit_hz,
            smoother: Smoother::new(smoother_time_constant),
            delay: 0.0,
            start_time: Instant::now(),
            last_ready: None,
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

    /// Geometry and format of the most recent frame
    pub fn frame_info(&self) -> &FrameInfo {
        &self.frame_info
    }

    /// Damage hint recorded during the most recent capture
    pub fn damage_hint(&self) -> Option<Rect> {
        self.damage_hint
    }

    /// Pixel data of the completed frame
    ///
    /// Valid only while the status is [`CaptureStatus::Done`]; the buffer is
    /// reused by the next capture. The returned flag tells the renderer
    /// whether texture coordinates must be flipped vertically.
    pub fn frame_pixels(&self) -> Option<(&FrameInfo, &[u8], bool)> {
        if self.status != CaptureStatus::Done {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        Some((&self.frame_info, &buffer.map[..], !self.y_invert))
    }

    /// Start a capture, honouring the rate limit
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.status == CaptureStatus::InProgress {
            return Err(CaptureError::AlreadyInProgress);
        }

        self.status = CaptureStatus::InProgress;

        let wait = match self.last_ready {
            Some(last) => {
                let elapsed = last.elapsed().as_secs_f64();
                time_left(self.period, elapsed, self.delay)
            }
            None => 0.0,
        };

        if wait > 0.0 {
            trace!("screencopy: deferring capture by {:.1} ms", wait * 1e3);
            self.arm_timer(wait);
        } else {
            self.start_capture();
        }

        Ok(())
    }

    /// Stop any outstanding capture; synchronous and idempotent
    pub fn stop(&mut self) {
        self.cancel_timer();
        self.destroy_frame();
        if self.status == CaptureStatus::InProgress {
            self.status = CaptureStatus::Stopped;
        }
    }

    /// One-shot timer fired: issue the deferred capture request
    pub(crate) fn timer_fired(&mut self) {
        self.timer = None;
        if self.status == CaptureStatus::InProgress {
            self.start_capture();
        }
    }

    fn start_capture(&mut self) {
        self.start_time = Instant::now();
        self.damage_hint = None;

        let frame =
            self.manager
                .capture_output(self.overlay_cursor as i32, &self.output, &self.qh, ());
        self.frame = Some(frame);
    }

    fn arm_timer(&mut self, seconds: f64) {
        self.cancel_timer();
        let timer = Timer::from_duration(Duration::from_secs_f64(seconds));
        match self.handle.insert_source(timer, |_, _, daemon| {
            if let Some(backend) = daemon.capture.screencopy.as_mut() {
                backend.timer_fired();
            }
            TimeoutAction::Drop
        }) {
            Ok(token) => self.timer = Some(token),
            Err(e) => {
                // Timer registration should never fail; capture immediately
                // rather than stalling the stream.
                warn!("screencopy: failed to arm rate-limit timer: {}", e);
                self.start_capture();
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            self.handle.remove(token);
        }
    }

    fn destroy_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }

    fn is_current_frame(&self, proxy: &ZwlrScreencopyFrameV1) -> bool {
        self.frame.as_ref().is_some_and(|f| f.id() == proxy.id())
    }

    /// Make sure the pooled buffer matches the announced geometry
    fn ensure_buffer(
        &mut self,
        format: wl_shm::Format,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<(), shm::ShmError> {
        if let Some(buffer) = &self.buffer {
            if buffer.matches(format, width, height, stride) {
                return Ok(());
            }
            debug!(
                "screencopy: geometry changed ({}x{} stride {} -> {}x{} stride {}), recreating pool",
                buffer.width, buffer.height, buffer.stride, width, height, stride
            );
            self.buffer = None;
        }

        let size = stride as usize * height as usize;
        let fd = shm::alloc_fd(size)?;
        let file = File::from(fd);

        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(|e| {
            shm::ShmError {
                size,
                source: nix::Error::from_raw(e.raw_os_error().unwrap_or(0)),
            }
        })?;

        let pool = self.wl_shm.create_pool(file.as_fd(), size as i32, &self.qh, ());
        let wl_buffer = pool.create_buffer(
            0,
            width as i32,
            height as i32,
            stride as i32,
            format,
            &self.qh,
            (),
        );
        pool.destroy();
        // The compositor holds its own reference now; close our fd.
        drop(file);

        self.buffer = Some(ShmBuffer {
            wl_buffer,
            map,
            format,
            width,
            height,
            stride,
        });

        Ok(())
    }

    fn on_buffer(&mut self, format: wl_shm::Format, width: u32, height: u32, stride: u32) {
        if let Err(e) = self.ensure_buffer(format, width, height, stride) {
            error!("screencopy: buffer allocation failed: {}", e);
            self.destroy_frame();
            self.status = CaptureStatus::Fatal;
            self.completion = Some(CaptureStatus::Fatal);
            return;
        }

        self.frame_info = FrameInfo {
            width,
            height,
            stride,
            fourcc_format: fourcc_from_wl_shm(format),
        };

        if let (Some(frame), Some(buffer)) = (&self.frame, &self.buffer) {
            frame.copy_with_damage(&buffer.wl_buffer);
        }
    }

    fn on_flags(&mut self, flags: zwlr_screencopy_frame_v1::Flags) {
        self.y_invert = flags.contains(zwlr_screencopy_frame_v1::Flags::YInvert);
    }

    fn on_damage(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.damage_hint = Some(Rect {
            x,
            y,
            width,
            height,
        });
    }

    fn on_ready(&mut self) {
        self.cancel_timer();
        self.destroy_frame();

        let now = Instant::now();
        let sample = now.duration_since(self.start_time).as_secs_f64();
        let dt = self
            .last_ready
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(sample);
        self.delay = self.smoother.update(sample, dt);
        self.last_ready = Some(now);

        trace!(
            "screencopy: ready after {:.1} ms (smoothed delay {:.1} ms)",
            sample * 1e3,
            self.delay * 1e3
        );

        self.status = CaptureStatus::Done;
        self.completion = Some(CaptureStatus::Done);
    }

    fn on_failed(&mut self) {
        self.cancel_timer();
        self.destroy_frame();
        self.status = CaptureStatus::Failed;
        self.completion = Some(CaptureStatus::Failed);
    }
}

impl Drop for ScreencopyCapture {
    fn drop(&mut self) {
        self.cancel_timer();
        self.destroy_frame();
        self.manager.destroy();
    }
}

impl Dispatch<ZwlrScreencopyFrameV1, ()> for Daemon {
    fn event(
        state: &mut Self,
        proxy: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        _data: &(),
        _conn: &wayland_client::Connection,
        _qh: &QueueHandle<Self>,
    ) {
        {
            let Some(backend) = state.capture.screencopy.as_mut() else {
                return;
            };
            if !backend.is_current_frame(proxy) {
                // Stale events from a frame object destroyed by stop().
                return;
            }

            use zwlr_screencopy_frame_v1::Event;
            match event {
                Event::Buffer {
                    format: WEnum::Value(format),
                    width,
                    height,
                    stride,
                } => backend.on_buffer(format, width, height, stride),
                Event::Buffer { format, .. } => {
                    error!("screencopy: unknown buffer format {:?}", format);
                    backend.on_failed();
                }
                Event::Flags {
                    flags: WEnum::Value(flags),
                } => backend.on_flags(flags),
                Event::Flags { .. } => {}
                Event::Damage {
                    x,
                    y,
                    width,
                    height,
                } => backend.on_damage(x, y, width, height),
                Event::Ready { .. } => backend.on_ready(),
                Event::Failed => backend.on_failed(),
                // v3 events; not requested at our bind version but harmless.
                Event::LinuxDmabuf { .. } | Event::BufferDone => {}
                _ => {}
            }
        }

        state.pump_capture();
    }
}
