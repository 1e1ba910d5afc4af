//! RFB Client State Machine
//!
//! One instance per TCP connection, driving the RFB 3.7/3.8 handshake and
//! the steady-state message loop over a non-blocking socket. Reads are
//! buffered until a complete message is available; writes are queued and
//! flushed as the socket allows.
//!
//! Input messages are not applied here: they are returned as
//! [`InputAction`]s for the caller to route into the injectors, keeping the
//! protocol parsing free of injection state.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

use tracing::{debug, info, warn};

use super::auth;
use super::pixel_format::{translate_pixels, PixelFormat};
use super::ServerInfo;
use crate::render::damage::{DamageRegion, Rect};

/// Highest protocol minor version we speak
const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;

const ENCODING_RAW: i32 = 0;

/// A decoded input message for the injectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Key symbol press or release
    Key {
        /// X11 keysym
        symbol: u32,
        /// Pressed or released
        pressed: bool,
    },
    /// Pointer position and button mask
    Pointer {
        /// X in framebuffer coordinates
        x: u16,
        /// Y in framebuffer coordinates
        y: u16,
        /// Button mask
        mask: u8,
    },
}

/// Result of processing client input
#[derive(Debug, Default)]
pub struct ClientEvents {
    /// Input messages to inject
    pub actions: Vec<InputAction>,
    /// The connection should be torn down
    pub disconnect: bool,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Version,
    SecuritySelect,
    Authenticating { challenge: [u8; auth::CHALLENGE_LEN] },
    Init,
    Ready,
}

/// Per-connection RFB state
pub struct RfbClient {
    /// Connection identifier for logs and the source registry
    pub id: u64,
    /// Remote address
    pub peer: SocketAddr,
    stream: TcpStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    out_pos: usize,
    phase: Phase,
    minor_version: u8,
    offer_auth: bool,
    format: PixelFormat,
    wants_update: bool,
    full_update_pending: bool,
}

impl RfbClient {
    /// Adopt an accepted connection and greet it
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr, info: &ServerInfo) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            id,
            peer,
            stream,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            out_pos: 0,
            phase: Phase::Version,
            minor_version: 8,
            offer_auth: info.password.is_some(),
            format: info.native_format,
            wants_update: false,
            full_update_pending: true,
        };

        client.queue(PROTOCOL_VERSION);
        Ok(client)
    }

    /// Whether the handshake has completed
    pub fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    /// Whether the client has an unanswered update request
    pub fn wants_update(&self) -> bool {
        matches!(self.phase, Phase::Ready) && self.wants_update
    }

    /// Whether queued output remains unflushed
    pub fn has_pending_output(&self) -> bool {
        self.out_pos < self.outbuf.len()
    }

    /// Drain the socket and process complete messages
    pub fn handle_readable(&mut self, info: &ServerInfo) -> ClientEvents {
        let mut events = ClientEvents::default();
        let mut chunk = [0u8; 4096];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    info!("client {} ({}) disconnected", self.id, self.peer);
                    events.disconnect = true;
                    break;
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("client {} read error: {}", self.id, e);
                    events.disconnect = true;
                    break;
                }
            }
        }

        if !events.disconnect {
            self.process(info, &mut events);
        }
        events
    }

    /// Parse as many complete messages as the buffer holds
    fn process(&mut self, info: &ServerInfo, events: &mut ClientEvents) {
        // The handlers never touch the input buffer, only output and phase.
        let inbuf = std::mem::take(&mut self.inbuf);
        let mut cursor = 0usize;

        loop {
            let buf = &inbuf[cursor..];
            let consumed = match self.phase {
                Phase::Version => self.on_version(buf, events),
                Phase::SecuritySelect => self.on_security_select(buf, info, events),
                Phase::Authenticating { challenge } => {
                    self.on_auth_response(buf, &challenge, info, events)
                }
                Phase::Init => self.on_client_init(buf, info),
                Phase::Ready => self.on_message(buf, events),
            };

            match consumed {
                Some(n) if n > 0 => cursor += n,
                _ => break,
            }
            if events.disconnect {
                break;
            }
        }

        self.inbuf = inbuf;
        self.inbuf.drain(..cursor);
    }

    fn on_version(&mut self, buf: &[u8], events: &mut ClientEvents) -> Option<usize> {
        if buf.len() < 12 {
            return None;
        }

        let version: [u8; 12] = buf[..12].try_into().unwrap_or_default();
        let minor = match &version {
            b"RFB 003.008\n" => 8,
            b"RFB 003.007\n" => 7,
            other => {
                warn!(
                    "client {} sent unsupported version {:?}",
                    self.id,
                    String::from_utf8_lossy(other).trim_end()
                );
                events.disconnect = true;
                return None;
            }
        };

        debug!("client {} negotiated RFB 3.{}", self.id, minor);
        self.minor_version = minor;
        self.phase = Phase::SecuritySelect;

        let security = if self.offer_auth {
            SECURITY_VNC_AUTH
        } else {
            SECURITY_NONE
        };
        self.queue(&[1, security]);

        Some(12)
    }

    fn on_security_select(
        &mut self,
        buf: &[u8],
        _info: &ServerInfo,
        events: &mut ClientEvents,
    ) -> Option<usize> {
        let choice = *buf.first()?;
        let offered = if self.offer_auth {
            SECURITY_VNC_AUTH
        } else {
            SECURITY_NONE
        };

        if choice != offered {
            warn!("client {} chose unexpected security type {}", self.id, choice);
            self.send_security_failure("unsupported security type");
            events.disconnect = true;
            return Some(1);
        }

        if choice == SECURITY_VNC_AUTH {
            let challenge = auth::make_challenge();
            self.queue(&challenge);
            self.phase = Phase::Authenticating { challenge };
        } else {
            // RFB 3.7 skips SecurityResult for the None type.
            if self.minor_version >= 8 {
                self.queue(&0u32.to_be_bytes());
            }
            self.phase = Phase::Init;
        }

        Some(1)
    }

    fn on_auth_response(
        &mut self,
        buf: &[u8],
        challenge: &[u8; auth::CHALLENGE_LEN],
        info: &ServerInfo,
        events: &mut ClientEvents,
    ) -> Option<usize> {
        if buf.len() < auth::CHALLENGE_LEN {
            return None;
        }

        let mut response = [0u8; auth::CHALLENGE_LEN];
        response.copy_from_slice(&buf[..auth::CHALLENGE_LEN]);

        let ok = info
            .password
            .as_deref()
            .is_some_and(|pw| auth::verify_response(pw, challenge, &response));

        if ok {
            info!("client {} ({}) authenticated", self.id, self.peer);
            self.queue(&0u32.to_be_bytes());
            self.phase = Phase::Init;
        } else {
            warn!("client {} ({}) failed authentication", self.id, self.peer);
            self.send_security_failure("authentication failed");
            events.disconnect = true;
        }

        Some(auth::CHALLENGE_LEN)
    }

    fn send_security_failure(&mut self, reason: &str) {
        self.queue(&1u32.to_be_bytes());
        if self.minor_version >= 8 {
            self.queue(&(reason.len() as u32).to_be_bytes());
            self.queue(reason.as_bytes());
        }
    }

    fn on_client_init(&mut self, buf: &[u8], info: &ServerInfo) -> Option<usize> {
        let shared = *buf.first()?;
        if shared == 0 {
            // Exclusive access is not enforced; every session is shared.
            debug!("client {} requested exclusive access, ignoring", self.id);
        }

        self.queue(&info.width.to_be_bytes());
        self.queue(&info.height.to_be_bytes());
        self.queue(&info.native_format.encode());
        self.queue(&(info.name.len() as u32).to_be_bytes());
        self.queue(info.name.as_bytes());

        info!("client {} ({}) entered session", self.id, self.peer);
        self.phase = Phase::Ready;

        Some(1)
    }

    fn on_message(&mut self, buf: &[u8], events: &mut ClientEvents) -> Option<usize> {
        match *buf.first()? {
            // SetPixelFormat
            0 => {
                if buf.len() < 20 {
                    return None;
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&buf[4..20]);
                let format = PixelFormat::decode(&raw);

                if !format.is_supported() {
                    warn!(
                        "client {} requested unsupported pixel format {:?}",
                        self.id, format
                    );
                    events.disconnect = true;
                    return Some(20);
                }

                debug!("client {} set pixel format {:?}", self.id, format);
                self.format = format;
                // Colour mapping changed; everything on screen is stale.
                self.full_update_pending = true;
                Some(20)
            }
            // SetEncodings
            2 => {
                if buf.len() < 4 {
                    return None;
                }
                let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                let total = 4 + count * 4;
                if buf.len() < total {
                    return None;
                }
                // Raw is mandatory for every client; other encodings are
                // advisory and unimplemented.
                debug!("client {} announced {} encodings", self.id, count);
                Some(total)
            }
            // FramebufferUpdateRequest
            3 => {
                if buf.len() < 10 {
                    return None;
                }
                let incremental = buf[1] != 0;
                if !incremental {
                    self.full_update_pending = true;
                }
                self.wants_update = true;
                Some(10)
            }
            // KeyEvent
            4 => {
                if buf.len() < 8 {
                    return None;
                }
                let pressed = buf[1] != 0;
                let symbol = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                events.actions.push(InputAction::Key { symbol, pressed });
                Some(8)
            }
            // PointerEvent
            5 => {
                if buf.len() < 6 {
                    return None;
                }
                let mask = buf[1];
                let x = u16::from_be_bytes([buf[2], buf[3]]);
                let y = u16::from_be_bytes([buf[4], buf[5]]);
                events.actions.push(InputAction::Pointer { x, y, mask });
                Some(6)
            }
            // ClientCutText
            6 => {
                if buf.len() < 8 {
                    return None;
                }
                let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                let total = 8 + len;
                if buf.len() < total {
                    return None;
                }
                debug!("client {} cut text ({} bytes) ignored", self.id, len);
                Some(total)
            }
            other => {
                warn!("client {} sent unknown message type {}", self.id, other);
                events.disconnect = true;
                None
            }
        }
    }

    /// Queue a FramebufferUpdate for the damaged regions
    ///
    /// `fb` holds the full frame in the server's native format. Returns
    /// `true` when an update was queued.
    pub fn send_update(
        &mut self,
        fb: &[u8],
        fb_width: u32,
        fb_height: u32,
        damage: &DamageRegion,
        info: &ServerInfo,
    ) -> bool {
        let rects: Vec<Rect> = if self.full_update_pending {
            vec![Rect::new(0, 0, fb_width, fb_height)]
        } else {
            damage
                .rects()
                .iter()
                .filter_map(|r| r.clipped(fb_width, fb_height))
                .collect()
        };

        if rects.is_empty() {
            return false;
        }

        self.queue(&[0u8, 0u8]);
        self.queue(&(rects.len() as u16).to_be_bytes());

        for rect in &rects {
            self.queue(&(rect.x as u16).to_be_bytes());
            self.queue(&(rect.y as u16).to_be_bytes());
            self.queue(&(rect.width as u16).to_be_bytes());
            self.queue(&(rect.height as u16).to_be_bytes());
            self.queue(&ENCODING_RAW.to_be_bytes());

            let mut pixels = Vec::with_capacity(
                rect.width as usize * rect.height as usize * self.format.bytes_per_pixel(),
            );
            for row in rect.y..rect.y + rect.height {
                let start = ((row * fb_width + rect.x) * 4) as usize;
                let end = start + rect.width as usize * 4;
                translate_pixels(&fb[start..end], &info.native_format, &self.format, &mut pixels);
            }
            self.queue(&pixels);
        }

        self.wants_update = false;
        self.full_update_pending = false;
        true
    }

    fn queue(&mut self, bytes: &[u8]) {
        self.outbuf.extend_from_slice(bytes);
    }

    /// Flush queued output; returns `true` when the queue drained
    pub fn try_flush(&mut self) -> io::Result<bool> {
        while self.out_pos < self.outbuf.len() {
            match self.stream.write(&self.outbuf[self.out_pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "zero-length write",
                    ))
                }
                Ok(n) => self.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.outbuf.clear();
        self.out_pos = 0;
        Ok(true)
    }

    /// Raw fd of the underlying socket, for source registration
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }
}
