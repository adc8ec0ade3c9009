//! UDP capture socket for Wake-on-LAN packets
//!
//! Magic packets are commonly sent as UDP broadcasts to port 9 (sometimes 7).
//! The socket is created at file-descriptor level so the relevant options can
//! be set before bind: `SO_REUSEADDR`/`SO_REUSEPORT` (the host may already
//! run a WoL proxy), `SO_BROADCAST` (required), and `IP_PKTINFO` so datagrams
//! addressed to 255.255.255.255 are delivered.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::packet::decode_magic_payload;
use crate::Error;

/// Receive buffer size requested on the capture socket.
const RECV_BUFFER_BYTES: libc::c_int = 64 * 1024;

/// Deadline on each receive so cancellation is observed within one second.
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// A bound Wake-on-LAN UDP capture socket.
pub struct UdpCapture {
    socket: tokio::net::UdpSocket,
    port: u16,
}

impl UdpCapture {
    /// Binds the capture socket on `0.0.0.0:port` with WoL socket options.
    ///
    /// Binding may fail (privileged port without `NET_BIND_SERVICE`, port
    /// conflict); the caller reports the port and continues with the
    /// remaining ones.
    pub fn bind(port: u16) -> Result<Self, Error> {
        let socket = bind_wol_socket(port)?;
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;
        info!(port, "WoL UDP capture socket bound");
        Ok(Self { socket, port })
    }

    /// The actually bound port (differs from the request only for port 0).
    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.port)
    }

    /// Receives until cancellation, handing each valid magic packet's MAC to
    /// the handler. Invalid payloads are dropped silently (debug log only).
    pub async fn run<F>(self, shutdown: CancellationToken, mut handler: F)
    where
        F: FnMut(String, SocketAddr, usize),
    {
        let mut buf = [0u8; 1024];
        info!(port = self.port, "UDP capture loop started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match tokio::time::timeout(READ_DEADLINE, self.socket.recv_from(&mut buf)).await {
                // Deadline elapsed; loop to re-check cancellation.
                Err(_) => continue,
                Ok(Err(e)) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(port = self.port, error = %e, "error reading UDP packet");
                    continue;
                }
                Ok(Ok((len, addr))) => {
                    trace!(port = self.port, from = %addr, size = len, "UDP packet received");
                    match decode_magic_payload(&buf[..len]) {
                        None => {
                            debug!(from = %addr, size = len, "invalid WoL packet, dropping");
                        }
                        Some(mac) => handler(mac, addr, len),
                    }
                }
            }
        }

        debug!(port = self.port, "UDP capture loop stopped");
    }
}

/// Creates and binds the WoL UDP socket with options applied pre-bind.
fn bind_wol_socket(port: u16) -> io::Result<std::net::UdpSocket> {
    // SAFETY: socket() returns either a fresh fd or -1; ownership of the fd
    // moves into the UdpSocket immediately so it is closed on every path.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

    if let Err(e) = set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
        warn!(port, error = %e, "failed to enable SO_REUSEADDR");
    }
    if let Err(e) = set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1) {
        warn!(port, error = %e, "failed to enable SO_REUSEPORT");
    }
    // Essential for WoL: magic packets are broadcast.
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, 1)?;
    // Needed to receive datagrams addressed to the all-ones broadcast.
    #[cfg(target_os = "linux")]
    if let Err(e) = set_socket_option(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1) {
        warn!(port, error = %e, "failed to enable IP_PKTINFO");
    }
    if let Err(e) = set_socket_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, RECV_BUFFER_BYTES) {
        warn!(port, error = %e, "failed to set receive buffer size");
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY,
        },
        sin_zero: [0; 8],
    };
    // SAFETY: addr is a valid sockaddr_in for the lifetime of the call.
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(socket)
}

fn set_socket_option(
    fd: libc::c_int,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: value outlives the call; length matches the pointed-to type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
