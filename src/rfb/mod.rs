//! RFB/VNC Server Layer
//!
//! The downstream face of the server: a TCP listener, per-connection
//! [`client::RfbClient`] state machines, and the framebuffer feed that turns
//! damage regions into Raw-encoded FramebufferUpdate messages.
//!
//! Security is limited to the optional single pre-shared secret of VNC
//! Authentication ([`auth`]); there is no user database and no transport
//! encryption. All sockets are non-blocking and driven from the calloop
//! event loop by the daemon.

pub mod auth;
pub mod client;
pub mod pixel_format;

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info, warn};

use crate::render::damage::DamageRegion;
pub use client::{ClientEvents, InputAction, RfbClient};
pub use pixel_format::PixelFormat;

/// Immutable session parameters shared with every client
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Framebuffer width in pixels
    pub width: u16,
    /// Framebuffer height in pixels
    pub height: u16,
    /// Server-native pixel format
    pub native_format: PixelFormat,
    /// Desktop name sent in ServerInit
    pub name: String,
    /// Pre-shared secret; `None` disables authentication
    pub password: Option<String>,
}

/// Listener plus connected-client registry
pub struct RfbServer {
    listener: TcpListener,
    clients: HashMap<u64, RfbClient>,
    next_id: u64,
    /// Session parameters
    pub info: ServerInfo,
}

impl RfbServer {
    /// Bind the listening socket
    pub fn bind(addr: &str, port: u16, info: ServerInfo) -> io::Result<Self> {
        let listener = TcpListener::bind((addr, port))?;
        listener.set_nonblocking(true)?;

        info!("RFB server listening on {}:{}", addr, port);

        Ok(Self {
            listener,
            clients: HashMap::new(),
            next_id: 0,
            info,
        })
    }

    /// Raw fd of the listener, for source registration
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept every pending connection, returning the new client ids
    pub fn accept_pending(&mut self) -> Vec<u64> {
        let mut accepted = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = self.next_id;
                    self.next_id += 1;

                    match RfbClient::new(id, stream, peer, &self.info) {
                        Ok(client) => {
                            info!("client {} connected from {}", id, peer);
                            self.clients.insert(id, client);
                            accepted.push(id);
                        }
                        Err(e) => warn!("failed to set up connection from {}: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }

        accepted
    }

    /// Look up a client
    pub fn client_mut(&mut self, id: u64) -> Option<&mut RfbClient> {
        self.clients.get_mut(&id)
    }

    /// Drop a client
    pub fn remove_client(&mut self, id: u64) -> Option<RfbClient> {
        let client = self.clients.remove(&id);
        if client.is_some() {
            debug!("client {} removed", id);
        }
        client
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether any client is waiting for a framebuffer update
    pub fn has_update_requests(&self) -> bool {
        self.clients.values().any(|c| c.wants_update())
    }

    /// Whether any client still has queued output
    pub fn has_pending_output(&self) -> bool {
        self.clients.values().any(|c| c.has_pending_output())
    }

    /// Feed a new frame to every interested client
    ///
    /// Returns the ids of clients whose connection failed and must be torn
    /// down by the caller.
    pub fn feed_frame(
        &mut self,
        fb: &[u8],
        fb_width: u32,
        fb_height: u32,
        damage: &DamageRegion,
    ) -> Vec<u64> {
        let info = self.info.clone();
        let mut failed = Vec::new();

        for (id, client) in self.clients.iter_mut() {
            if client.wants_update() {
                client.send_update(fb, fb_width, fb_height, damage, &info);
            }
            if let Err(e) = client.try_flush() {
                warn!("client {} write failed: {}", id, e);
                failed.push(*id);
            }
        }

        failed
    }

    /// Retry flushing blocked clients
    ///
    /// Returns the ids of clients whose connection failed.
    pub fn flush_pending(&mut self) -> Vec<u64> {
        let mut failed = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            if client.has_pending_output() {
                if let Err(e) = client.try_flush() {
                    warn!("client {} write failed: {}", id, e);
                    failed.push(*id);
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DRM_FORMAT_XRGB8888;
    use crate::render::damage::DamageRegion;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn test_info(password: Option<&str>) -> ServerInfo {
        ServerInfo {
            width: 64,
            height: 32,
            native_format: PixelFormat::from_fourcc(DRM_FORMAT_XRGB8888).unwrap(),
            name: "wayrfb".to_string(),
            password: password.map(str::to_string),
        }
    }

    /// A connected (server-side client, viewer socket) pair
    fn connected_pair(info: &ServerInfo) -> (RfbClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let viewer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let client = RfbClient::new(0, stream, peer, info).unwrap();
        (client, viewer)
    }

    fn read_exact(viewer: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        viewer.read_exact(&mut buf).unwrap();
        buf
    }

    /// Loopback delivery is asynchronous; settle before the non-blocking read
    fn recv(client: &mut RfbClient, info: &ServerInfo) -> ClientEvents {
        std::thread::sleep(std::time::Duration::from_millis(10));
        client.handle_readable(info)
    }

    /// Run the handshake up to the Ready phase with no authentication
    fn handshake(client: &mut RfbClient, viewer: &mut TcpStream, info: &ServerInfo) {
        client.try_flush().unwrap();
        assert_eq!(read_exact(viewer, 12), b"RFB 003.008\n");

        viewer.write_all(b"RFB 003.008\n").unwrap();
        let events = recv(client, info);
        assert!(!events.disconnect);
        client.try_flush().unwrap();
        assert_eq!(read_exact(viewer, 2), [1, 1]);

        viewer.write_all(&[1]).unwrap();
        recv(client, info);
        client.try_flush().unwrap();
        assert_eq!(read_exact(viewer, 4), 0u32.to_be_bytes());

        viewer.write_all(&[1]).unwrap();
        recv(client, info);
        client.try_flush().unwrap();

        let init = read_exact(viewer, 24 + info.name.len());
        assert_eq!(&init[0..2], &info.width.to_be_bytes());
        assert_eq!(&init[2..4], &info.height.to_be_bytes());
        assert_eq!(&init[4..20], &info.native_format.encode());
        assert_eq!(&init[24..], info.name.as_bytes());

        assert!(client.is_ready());
    }

    #[test]
    fn test_handshake_without_auth() {
        let info = test_info(None);
        let (mut client, mut viewer) = connected_pair(&info);
        handshake(&mut client, &mut viewer, &info);
    }

    #[test]
    fn test_handshake_with_auth() {
        let info = test_info(Some("hunter2"));
        let (mut client, mut viewer) = connected_pair(&info);

        client.try_flush().unwrap();
        read_exact(&mut viewer, 12);
        viewer.write_all(b"RFB 003.008\n").unwrap();
        recv(&mut client, &info);
        client.try_flush().unwrap();

        // VNC Authentication offered.
        assert_eq!(read_exact(&mut viewer, 2), [1, 2]);
        viewer.write_all(&[2]).unwrap();
        recv(&mut client, &info);
        client.try_flush().unwrap();

        let challenge: [u8; 16] = read_exact(&mut viewer, 16).try_into().unwrap();
        let response = auth::encrypt_challenge("hunter2", &challenge);
        viewer.write_all(&response).unwrap();
        let events = recv(&mut client, &info);
        assert!(!events.disconnect);
        client.try_flush().unwrap();
        assert_eq!(read_exact(&mut viewer, 4), 0u32.to_be_bytes());
    }

    #[test]
    fn test_auth_rejects_wrong_password() {
        let info = test_info(Some("hunter2"));
        let (mut client, mut viewer) = connected_pair(&info);

        client.try_flush().unwrap();
        read_exact(&mut viewer, 12);
        viewer.write_all(b"RFB 003.008\n").unwrap();
        recv(&mut client, &info);
        client.try_flush().unwrap();
        read_exact(&mut viewer, 2);
        viewer.write_all(&[2]).unwrap();
        recv(&mut client, &info);
        client.try_flush().unwrap();

        let challenge: [u8; 16] = read_exact(&mut viewer, 16).try_into().unwrap();
        let response = auth::encrypt_challenge("wrong", &challenge);
        viewer.write_all(&response).unwrap();
        let events = recv(&mut client, &info);
        assert!(events.disconnect);
        client.try_flush().unwrap();
        assert_eq!(read_exact(&mut viewer, 4), 1u32.to_be_bytes());
    }

    #[test]
    fn test_key_and_pointer_events_decoded() {
        let info = test_info(None);
        let (mut client, mut viewer) = connected_pair(&info);
        handshake(&mut client, &mut viewer, &info);

        // KeyEvent: press keysym 0x61, then PointerEvent at (10, 20) mask 1.
        let mut msg = vec![4u8, 1, 0, 0];
        msg.extend_from_slice(&0x61u32.to_be_bytes());
        msg.extend_from_slice(&[5u8, 1]);
        msg.extend_from_slice(&10u16.to_be_bytes());
        msg.extend_from_slice(&20u16.to_be_bytes());
        viewer.write_all(&msg).unwrap();

        let events = recv(&mut client, &info);
        assert_eq!(
            events.actions,
            vec![
                InputAction::Key {
                    symbol: 0x61,
                    pressed: true
                },
                InputAction::Pointer {
                    x: 10,
                    y: 20,
                    mask: 1
                },
            ]
        );
    }

    #[test]
    fn test_partial_message_is_buffered() {
        let info = test_info(None);
        let (mut client, mut viewer) = connected_pair(&info);
        handshake(&mut client, &mut viewer, &info);

        // First half of a KeyEvent.
        viewer.write_all(&[4u8, 1, 0, 0]).unwrap();
        let events = recv(&mut client, &info);
        assert!(events.actions.is_empty());

        viewer.write_all(&0x20u32.to_be_bytes()).unwrap();
        let events = recv(&mut client, &info);
        assert_eq!(
            events.actions,
            vec![InputAction::Key {
                symbol: 0x20,
                pressed: true
            }]
        );
    }

    #[test]
    fn test_framebuffer_update_raw_encoding() {
        let info = test_info(None);
        let (mut client, mut viewer) = connected_pair(&info);
        handshake(&mut client, &mut viewer, &info);

        // Non-incremental update request for the whole screen.
        let mut req = vec![3u8, 0];
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&info.width.to_be_bytes());
        req.extend_from_slice(&info.height.to_be_bytes());
        viewer.write_all(&req).unwrap();
        recv(&mut client, &info);
        assert!(client.wants_update());

        let fb = vec![0xabu8; 64 * 32 * 4];
        let sent = client.send_update(&fb, 64, 32, &DamageRegion::new(), &info);
        assert!(sent, "non-incremental request forces a full update");
        client.try_flush().unwrap();

        let header = read_exact(&mut viewer, 4);
        assert_eq!(header[0], 0);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 1);

        let rect = read_exact(&mut viewer, 12);
        assert_eq!(u16::from_be_bytes([rect[4], rect[5]]), 64);
        assert_eq!(u16::from_be_bytes([rect[6], rect[7]]), 32);
        // Raw encoding.
        assert_eq!(&rect[8..12], &0i32.to_be_bytes());

        let pixels = read_exact(&mut viewer, 64 * 32 * 4);
        assert!(pixels.iter().all(|&b| b == 0xab));
        assert!(!client.wants_update());
    }

    #[test]
    fn test_no_update_without_damage() {
        let info = test_info(None);
        let (mut client, mut viewer) = connected_pair(&info);
        handshake(&mut client, &mut viewer, &info);

        // Incremental request, then a frame with no damage: nothing goes out.
        let mut req = vec![3u8, 1];
        req.extend_from_slice(&[0; 8]);
        viewer.write_all(&req).unwrap();
        recv(&mut client, &info);

        // Clear the initial full-update flag by serving one frame first.
        let fb = vec![0u8; 64 * 32 * 4];
        client.send_update(&fb, 64, 32, &DamageRegion::full(64, 32), &info);
        client.try_flush().unwrap();

        viewer.write_all(&req).unwrap();
        recv(&mut client, &info);
        let sent = client.send_update(&fb, 64, 32, &DamageRegion::new(), &info);
        assert!(!sent, "empty damage produces no update");
    }
}
