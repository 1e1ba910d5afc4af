//! Server Daemon
//!
//! Ties everything together on one calloop event loop thread: the Wayland
//! connection with its capture backends and virtual input devices, the
//! renderer, and the RFB listener with its client sockets. Every wait is a
//! protocol callback or a one-shot timer; nothing blocks except GPU
//! readback, which is the thread's only forward-progress path.
//!
//! Frame flow: the capture scheduler completes a frame, the renderer
//! uploads and diffs it, the damaged band is read back into the local
//! framebuffer copy, and interested clients receive Raw-encoded updates.
//! Input flows the other way: client messages decode into actions that the
//! keyboard and pointer injectors replay into the compositor.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use calloop::generic::{FdWrapper, Generic};
use calloop::signals::{Signal, Signals};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use calloop_wayland_source::WaylandSource;
use tracing::{debug, error, info, warn};
use wayland_client::delegate_noop;
use wayland_client::globals::registry_queue_init;
use wayland_client::protocol::{
    wl_buffer::WlBuffer, wl_shm::WlShm, wl_shm_pool::WlShmPool,
};
use wayland_client::{Connection, QueueHandle};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1;
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1;
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use crate::capture::{
    BackendKind, CaptureScheduler, CaptureStatus, DmabufCapture, ScreencopyCapture,
};
use crate::config::{self, Config};
use crate::input::{Keyboard, Pointer};
use crate::render::{self, Renderer};
use crate::rfb::{InputAction, PixelFormat, RfbClient, RfbServer, ServerInfo};
use crate::wayland::{self, Globals, Output, Seat};

/// All server state, owned by the event loop thread
pub struct Daemon {
    pub(crate) config: Config,
    pub(crate) handle: LoopHandle<'static, Daemon>,
    pub(crate) conn: Connection,
    pub(crate) qh: QueueHandle<Daemon>,

    pub(crate) globals: Globals,
    pub(crate) outputs: Vec<Output>,
    pub(crate) seats: Vec<Seat>,
    pub(crate) selected_output: usize,
    pub(crate) selected_seat: usize,

    pub(crate) capture: CaptureScheduler,
    pub(crate) renderer: Option<Renderer>,
    pub(crate) keyboard: Option<Keyboard>,
    pub(crate) pointer: Option<Pointer>,

    pub(crate) rfb: Option<RfbServer>,
    pub(crate) fb: Vec<u8>,
    listener_token: Option<RegistrationToken>,
    client_tokens: HashMap<u64, RegistrationToken>,
    // Disconnected clients parked here until their sources are unregistered,
    // so the fds stay valid for the poller.
    dead_clients: Vec<RfbClient>,

    watchdog: Option<RegistrationToken>,
    flush_timer: Option<RegistrationToken>,

    pub(crate) running: bool,
}

/// Connect, wire everything up and run until shutdown
pub fn run(config: Config) -> Result<()> {
    let mut event_loop: EventLoop<'static, Daemon> =
        EventLoop::try_new().context("failed to create event loop")?;
    let handle = event_loop.handle();

    let conn = Connection::connect_to_env()
        .context("failed to connect to Wayland display; is WAYLAND_DISPLAY set?")?;
    let (global_list, mut event_queue) =
        registry_queue_init::<Daemon>(&conn).context("failed to initialise Wayland registry")?;
    let qh = event_queue.handle();

    let globals = wayland::bind_globals(&global_list, &qh)?;
    let mut outputs = wayland::bind_outputs(&global_list, &qh);
    let seats = wayland::bind_seats(&global_list, &qh);

    if outputs.is_empty() {
        bail!("compositor advertises no outputs");
    }
    if seats.is_empty() {
        bail!("compositor advertises no seats");
    }

    if let Some(manager) = &globals.xdg_output {
        for output in &mut outputs {
            output.xdg_output = Some(manager.get_xdg_output(&output.wl_output, &qh, ()));
        }
    }

    let mut daemon = Daemon {
        config,
        handle: handle.clone(),
        conn: conn.clone(),
        qh,
        globals,
        outputs,
        seats,
        selected_output: 0,
        selected_seat: 0,
        capture: CaptureScheduler::default(),
        renderer: None,
        keyboard: None,
        pointer: None,
        rfb: None,
        fb: Vec::new(),
        listener_token: None,
        client_tokens: HashMap::new(),
        dead_clients: Vec::new(),
        watchdog: None,
        flush_timer: None,
        running: true,
    };

    // Two rounds: output/seat metadata, then the xdg-output follow-ups.
    event_queue
        .roundtrip(&mut daemon)
        .context("initial roundtrip failed")?;
    event_queue
        .roundtrip(&mut daemon)
        .context("initial roundtrip failed")?;

    daemon.select_output()?;
    daemon.select_seat()?;
    daemon.init_renderer()?;
    daemon.init_input()?;
    daemon.init_capture()?;
    daemon.init_rfb()?;

    WaylandSource::new(conn.clone(), event_queue)
        .insert(handle.clone())
        .map_err(|e| anyhow!("failed to insert Wayland source: {}", e))?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .context("failed to set up signal handling")?;
    handle
        .insert_source(signals, |event, _, daemon| {
            info!("received {:?}, shutting down", event.signal());
            daemon.running = false;
        })
        .map_err(|e| anyhow!("failed to insert signal source: {}", e))?;

    daemon.start_capture()?;
    conn.flush().context("failed to flush Wayland connection")?;

    let stop_signal = event_loop.get_signal();
    event_loop
        .run(None::<Duration>, &mut daemon, move |daemon| {
            daemon.reap_clients();
            if !daemon.running {
                stop_signal.stop();
                return;
            }
            if let Err(e) = daemon.conn.flush() {
                error!("compositor connection lost: {}", e);
                stop_signal.stop();
            }
        })
        .map_err(|e| anyhow!("event loop error: {}", e))?;

    daemon.shutdown();
    Ok(())
}

impl Daemon {
    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    fn select_output(&mut self) -> Result<()> {
        let index = match &self.config.capture.output {
            Some(name) => self
                .outputs
                .iter()
                .position(|o| o.name.as_deref() == Some(name.as_str()))
                .with_context(|| format!("no such output: {}", name))?,
            None => 0,
        };

        let output = &self.outputs[index];
        if output.width == 0 || output.height == 0 {
            bail!("output reported no mode; cannot size the framebuffer");
        }

        info!(
            "capturing output '{}' ({}x{}, transform {:?})",
            output.name.as_deref().unwrap_or("?"),
            output.width,
            output.height,
            output.transform
        );

        self.selected_output = index;
        Ok(())
    }

    fn select_seat(&mut self) -> Result<()> {
        let index = match &self.config.capture.seat {
            Some(name) => self
                .seats
                .iter()
                .position(|s| s.name.as_deref() == Some(name.as_str()))
                .with_context(|| format!("no such seat: {}", name))?,
            None => 0,
        };

        info!(
            "injecting input on seat '{}'",
            self.seats[index].name.as_deref().unwrap_or("?")
        );

        self.selected_seat = index;
        Ok(())
    }

    fn init_renderer(&mut self) -> Result<()> {
        let output = &self.outputs[self.selected_output];
        let width = output.transformed_width();
        let height = output.transformed_height();

        let upload_override = self
            .config
            .render
            .shm_upload_format
            .as_deref()
            .and_then(config::parse_fourcc);

        let renderer = Renderer::new(width, height, output.transform, upload_override)
            .context("failed to initialise renderer")?;

        self.fb = vec![0u8; (width * height * 4) as usize];
        self.renderer = Some(renderer);
        Ok(())
    }

    fn init_input(&mut self) -> Result<()> {
        let seat = &self.seats[self.selected_seat];

        let keyboard = Keyboard::new(
            &self.globals.virtual_keyboard,
            &seat.wl_seat,
            &self.qh,
            &self.config.input.layout,
            &self.config.input.variant,
        )
        .context("failed to initialise keyboard injection")?;

        let pointer = Pointer::new(&self.globals.virtual_pointer, &seat.wl_seat, &self.qh);

        self.keyboard = Some(keyboard);
        self.pointer = Some(pointer);
        Ok(())
    }

    fn init_capture(&mut self) -> Result<()> {
        let output = &self.outputs[self.selected_output];
        let cfg = &self.config.capture;
        let forced = cfg.backend.as_str();

        let screencopy = (forced != "dmabuf")
            .then(|| self.globals.screencopy.clone())
            .flatten()
            .map(|manager| {
                ScreencopyCapture::new(
                    manager,
                    self.globals.wl_shm.clone(),
                    output.wl_output.clone(),
                    cfg.overlay_cursor,
                    cfg.rate_limit_hz,
                    cfg.smoother_time_constant,
                    self.qh.clone(),
                    self.handle.clone(),
                )
            });

        let dmabuf = (forced != "screencopy")
            .then(|| self.globals.export_dmabuf.clone())
            .flatten()
            .map(|manager| {
                DmabufCapture::new(
                    manager,
                    output.wl_output.clone(),
                    cfg.overlay_cursor,
                    cfg.rate_limit_hz,
                    self.qh.clone(),
                    self.handle.clone(),
                )
            });

        let prefer_dmabuf = cfg.prefer_dmabuf || forced == "dmabuf";

        self.capture = CaptureScheduler::new(screencopy, dmabuf, prefer_dmabuf)
            .context("no usable capture backend")?;

        info!("using {:?} capture backend", self.capture.active());
        Ok(())
    }

    fn init_rfb(&mut self) -> Result<()> {
        let renderer = self.renderer.as_ref().context("renderer not initialised")?;
        if renderer.width() > u16::MAX as u32 || renderer.height() > u16::MAX as u32 {
            bail!("output too large for the RFB protocol");
        }

        let fourcc = render::fourcc_from_gl_format(renderer.read_format())
            .context("renderer read format has no FourCC mapping")?;
        let native_format =
            PixelFormat::from_fourcc(fourcc).context("no RFB pixel format for read format")?;

        let info = ServerInfo {
            width: renderer.width() as u16,
            height: renderer.height() as u16,
            native_format,
            name: self.config.server.name.clone(),
            password: self.config.server.password.clone(),
        };

        if info.password.is_none() {
            warn!("no password configured; RFB connections are unauthenticated");
        }

        let rfb = RfbServer::bind(&self.config.server.address, self.config.server.port, info)
            .with_context(|| {
                format!(
                    "failed to bind {}:{}",
                    self.config.server.address, self.config.server.port
                )
            })?;

        let fd = rfb.listener_fd();
        self.rfb = Some(rfb);

        let source = Generic::new(unsafe { FdWrapper::new(fd) }, Interest::READ, Mode::Level);
        let token = self
            .handle
            .insert_source(source, |_, _, daemon: &mut Daemon| {
                daemon.rfb_accept();
                Ok(PostAction::Continue)
            })
            .map_err(|e| anyhow!("failed to register RFB listener: {}", e))?;
        self.listener_token = Some(token);

        Ok(())
    }

    // ------------------------------------------------------------------
    // Capture lifecycle
    // ------------------------------------------------------------------

    /// Begin the capture stream
    pub fn start_capture(&mut self) -> Result<()> {
        self.capture.start().context("failed to start capture")?;
        self.arm_watchdog();
        Ok(())
    }

    /// Stop the capture stream
    pub fn stop_capture(&mut self) {
        self.cancel_watchdog();
        self.capture.stop();
    }

    fn restart_capture(&mut self) {
        if !self.running {
            return;
        }
        if let Err(e) = self.start_capture() {
            error!("{:#}; shutting down", e);
            self.running = false;
        }
    }

    /// Drain the completion raised by a capture backend
    ///
    /// Called after every backend event or timer that may have finished a
    /// capture. State transitions have already committed by the time this
    /// runs.
    pub(crate) fn pump_capture(&mut self) {
        let Some(status) = self.capture.take_completion() else {
            return;
        };
        self.cancel_watchdog();

        match status {
            CaptureStatus::Done => self.process_frame(),
            CaptureStatus::Failed => {
                debug!("capture failed, retrying");
                self.restart_capture();
            }
            CaptureStatus::Fatal => {
                if self.capture.active() == BackendKind::ExportDmabuf
                    && self.capture.fall_back_to_screencopy()
                {
                    warn!("dmabuf capture failed permanently, falling back to screencopy");
                    self.restart_capture();
                } else {
                    error!("capture failed permanently, shutting down");
                    self.running = false;
                }
            }
            CaptureStatus::Stopped | CaptureStatus::InProgress => {}
        }
    }

    fn process_frame(&mut self) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        let rendered = match self.capture.active() {
            BackendKind::Screencopy => {
                let Some(backend) = self.capture.screencopy.as_ref() else {
                    return;
                };
                let Some((info, pixels, flip_y)) = backend.frame_pixels() else {
                    return;
                };
                renderer.render_framebuffer(
                    pixels,
                    info.fourcc_format,
                    info.width,
                    info.height,
                    info.stride,
                    flip_y,
                )
            }
            BackendKind::ExportDmabuf => {
                let Some(backend) = self.capture.dmabuf.as_mut() else {
                    return;
                };
                let Some(frame) = backend.take_frame() else {
                    return;
                };
                renderer.render_dmabuf_frame(frame)
            }
        };

        if let Err(e) = rendered {
            warn!("dropping frame: {}", e);
            self.restart_capture();
            return;
        }

        let damage = renderer.current_damage().clone();
        if !damage.is_empty() {
            let width = renderer.width();
            let height = renderer.height();

            if let Some(band) = damage.extents().and_then(|e| e.clipped(width, height)) {
                let offset = (band.y * width * 4) as usize;
                let len = (band.height * width * 4) as usize;
                renderer.copy_pixels(&mut self.fb[offset..offset + len], band.y, band.height);
            }

            if let Some(rfb) = self.rfb.as_mut() {
                let failed = rfb.feed_frame(&self.fb, width, height, &damage);
                for id in failed {
                    self.drop_client(id);
                }
                if self.rfb.as_ref().is_some_and(|r| r.has_pending_output()) {
                    self.arm_flush_timer();
                }
            }
        }

        self.restart_capture();
    }

    fn arm_watchdog(&mut self) {
        self.cancel_watchdog();

        // A capture that stays silent for two rate-limit periods is treated
        // as failed.
        let period = 1.0 / self.config.capture.rate_limit_hz;
        let timer = Timer::from_duration(Duration::from_secs_f64(2.0 * period));

        match self.handle.insert_source(timer, |_, _, daemon| {
            daemon.watchdog = None;
            daemon.on_watchdog();
            TimeoutAction::Drop
        }) {
            Ok(token) => self.watchdog = Some(token),
            Err(e) => warn!("failed to arm capture watchdog: {}", e),
        }
    }

    fn cancel_watchdog(&mut self) {
        if let Some(token) = self.watchdog.take() {
            self.handle.remove(token);
        }
    }

    fn on_watchdog(&mut self) {
        if self.capture.status() == CaptureStatus::InProgress {
            warn!("capture watchdog expired, restarting capture");
            self.capture.stop();
            self.restart_capture();
        }
    }

    // ------------------------------------------------------------------
    // RFB plumbing
    // ------------------------------------------------------------------

    fn rfb_accept(&mut self) {
        let Some(rfb) = self.rfb.as_mut() else { return };
        let accepted = rfb.accept_pending();

        for id in accepted {
            let Some(client) = self.rfb.as_mut().and_then(|r| r.client_mut(id)) else {
                continue;
            };
            let fd = client.raw_fd();
            let _ = client.try_flush();

            let source = Generic::new(unsafe { FdWrapper::new(fd) }, Interest::READ, Mode::Level);
            match self
                .handle
                .insert_source(source, move |_, _, daemon: &mut Daemon| {
                    if daemon.rfb_client_readable(id) {
                        Ok(PostAction::Continue)
                    } else {
                        daemon.finish_client(id);
                        Ok(PostAction::Remove)
                    }
                }) {
                Ok(token) => {
                    self.client_tokens.insert(id, token);
                }
                Err(e) => {
                    warn!("failed to register client {}: {}", id, e);
                    if let Some(rfb) = self.rfb.as_mut() {
                        rfb.remove_client(id);
                    }
                }
            }
        }
    }

    /// Handle readability on a client socket; returns false to tear down
    fn rfb_client_readable(&mut self, id: u64) -> bool {
        let Some(rfb) = self.rfb.as_mut() else {
            return false;
        };
        let info = rfb.info.clone();
        let Some(client) = rfb.client_mut(id) else {
            return false;
        };

        let events = client.handle_readable(&info);
        let mut disconnect = events.disconnect;

        if let Err(e) = client.try_flush() {
            warn!("client {} write failed: {}", id, e);
            disconnect = true;
        }
        let pending = client.has_pending_output();

        for action in events.actions {
            self.apply_input(action);
        }

        if pending {
            self.arm_flush_timer();
        }

        !disconnect
    }

    fn apply_input(&mut self, action: InputAction) {
        match action {
            InputAction::Key { symbol, pressed } => {
                if let Some(keyboard) = self.keyboard.as_mut() {
                    keyboard.feed(symbol, pressed);
                }
            }
            InputAction::Pointer { x, y, mask } => {
                let Some(output) = self.outputs.get(self.selected_output) else {
                    return;
                };
                let (bx, by) = output.transform_coord(x as u32, y as u32);
                let (width, height) = (output.width, output.height);
                if let Some(pointer) = self.pointer.as_mut() {
                    pointer.set(bx, by, width, height, mask);
                }
            }
        }
    }

    /// Tear down a client from outside its own source callback
    fn drop_client(&mut self, id: u64) {
        if let Some(token) = self.client_tokens.remove(&id) {
            self.handle.remove(token);
        }
        self.park_client(id);
    }

    /// Tear down a client from within its source callback; the source is
    /// removed by the returned `PostAction`
    fn finish_client(&mut self, id: u64) {
        self.client_tokens.remove(&id);
        self.park_client(id);
    }

    fn park_client(&mut self, id: u64) {
        if let Some(client) = self.rfb.as_mut().and_then(|r| r.remove_client(id)) {
            info!("client {} ({}) disconnected", id, client.peer);
            self.dead_clients.push(client);
        }

        let no_clients = self.rfb.as_ref().map(|r| r.client_count() == 0).unwrap_or(true);
        if no_clients {
            // Do not leave keys stuck in the session when the last viewer
            // goes away mid-keystroke.
            if let Some(keyboard) = self.keyboard.as_mut() {
                keyboard.release_all();
            }
        }
    }

    /// Drop disconnected clients once their sources are unregistered
    fn reap_clients(&mut self) {
        self.dead_clients.clear();
    }

    fn arm_flush_timer(&mut self) {
        if self.flush_timer.is_some() {
            return;
        }

        let timer = Timer::from_duration(Duration::from_millis(4));
        match self.handle.insert_source(timer, |_, _, daemon| {
            daemon.flush_timer = None;
            daemon.flush_clients();
            TimeoutAction::Drop
        }) {
            Ok(token) => self.flush_timer = Some(token),
            Err(e) => warn!("failed to arm flush timer: {}", e),
        }
    }

    fn flush_clients(&mut self) {
        let failed = self
            .rfb
            .as_mut()
            .map(|r| r.flush_pending())
            .unwrap_or_default();
        for id in failed {
            self.drop_client(id);
        }

        if self.rfb.as_ref().is_some_and(|r| r.has_pending_output()) {
            self.arm_flush_timer();
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn shutdown(&mut self) {
        self.stop_capture();

        if let Some(token) = self.listener_token.take() {
            self.handle.remove(token);
        }
        for (_, token) in self.client_tokens.drain() {
            self.handle.remove(token);
        }

        if let Some(keyboard) = self.keyboard.as_mut() {
            keyboard.release_all();
        }
        let _ = self.conn.flush();
        info!("shut down cleanly");
    }
}

// Protocol objects whose events carry nothing we act on.
delegate_noop!(Daemon: ignore WlShm);
delegate_noop!(Daemon: ignore WlShmPool);
delegate_noop!(Daemon: ignore WlBuffer);
delegate_noop!(Daemon: ignore ZwlrScreencopyManagerV1);
delegate_noop!(Daemon: ignore ZwlrExportDmabufManagerV1);
delegate_noop!(Daemon: ignore ZwpVirtualKeyboardManagerV1);
delegate_noop!(Daemon: ignore ZwpVirtualKeyboardV1);
delegate_noop!(Daemon: ignore ZwlrVirtualPointerManagerV1);
delegate_noop!(Daemon: ignore ZwlrVirtualPointerV1);
delegate_noop!(Daemon: ignore ZxdgOutputManagerV1);
