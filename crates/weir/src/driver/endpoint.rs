use std::{
    io::{self, IoSlice},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
};

use tracing::debug;

/// One send tick batches at most this many datagrams into a gather write.
pub const MAX_SEND_BATCH: usize = 8;

/// Write side of a unicast or multicast UDP channel.
///
/// The canonical form names the channel in counters and log file paths, so it
/// must stay filesystem-safe.
#[derive(Clone, Debug)]
pub struct UdpChannel {
    remote: SocketAddr,
    interface: Option<IpAddr>,
    multicast_ttl: u8,
    canonical: String,
}

impl UdpChannel {
    pub fn unicast(remote: SocketAddr) -> Self {
        Self::new(remote, None, 0)
    }

    pub fn multicast(group: SocketAddr, interface: Option<IpAddr>, ttl: u8) -> Self {
        Self::new(group, interface, ttl)
    }

    fn new(remote: SocketAddr, interface: Option<IpAddr>, multicast_ttl: u8) -> Self {
        let canonical = format!("udp-{}-{}", remote.ip().to_string().replace(':', "."), remote.port());
        Self { remote, interface, multicast_ttl, canonical }
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.remote.ip().is_multicast()
    }

    #[inline]
    pub fn multicast_ttl(&self) -> u8 {
        self.multicast_ttl
    }

    #[inline]
    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }
}

/// Non-blocking connected UDP socket shared by every publication on the
/// channel. Publications hold it by `Arc` and never tear it down.
pub struct SendChannelEndpoint {
    socket: UdpSocket,
    channel: UdpChannel,
}

impl SendChannelEndpoint {
    pub fn new(channel: UdpChannel) -> io::Result<Self> {
        let bind_addr = match (channel.interface, channel.remote) {
            (Some(ip), _) => SocketAddr::new(ip, 0),
            (None, SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            (None, SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;

        if channel.is_multicast() {
            match channel.remote.ip() {
                IpAddr::V4(_) => {
                    socket.set_multicast_ttl_v4(u32::from(channel.multicast_ttl))?;
                    if let Some(IpAddr::V4(interface)) = channel.interface {
                        set_multicast_if_v4(&socket, interface)?;
                    }
                }
                IpAddr::V6(_) => {
                    set_multicast_hops_v6(&socket, u32::from(channel.multicast_ttl))?;
                }
            }
        }

        socket.connect(channel.remote)?;
        debug!(local = ?socket.local_addr(), remote = %channel.remote, "send channel up");
        Ok(Self { socket, channel })
    }

    #[inline]
    pub fn channel(&self) -> &UdpChannel {
        &self.channel
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Single-datagram send. `WouldBlock` surfaces to the caller, which
    /// treats it as a short send.
    #[inline]
    pub fn send(&self, frame: &[u8]) -> io::Result<usize> {
        self.socket.send(frame)
    }

    /// Send each slice as its own datagram, returning how many went out.
    #[cfg(target_os = "linux")]
    pub fn send_batch(&self, frames: &[IoSlice<'_>]) -> io::Result<usize> {
        use std::os::fd::AsRawFd;

        debug_assert!(frames.len() <= MAX_SEND_BATCH);
        if frames.is_empty() {
            return Ok(0);
        }

        let mut msgs: [libc::mmsghdr; MAX_SEND_BATCH] = unsafe { std::mem::zeroed() };
        for (msg, frame) in msgs.iter_mut().zip(frames) {
            // IoSlice is ABI-compatible with iovec.
            msg.msg_hdr.msg_iov = std::ptr::from_ref(frame) as *mut libc::iovec;
            msg.msg_hdr.msg_iovlen = 1;
        }

        let sent = unsafe {
            libc::sendmmsg(self.socket.as_raw_fd(), msgs.as_mut_ptr(), frames.len() as u32, 0)
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn send_batch(&self, frames: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut sent = 0;
        for frame in frames {
            match self.socket.send(frame) {
                Ok(_) => sent += 1,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock && sent > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }
}

#[cfg(target_os = "linux")]
fn set_multicast_if_v4(socket: &UdpSocket, interface: Ipv4Addr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let addr = libc::in_addr { s_addr: u32::from_ne_bytes(interface.octets()) };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            std::ptr::from_ref(&addr).cast(),
            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

#[cfg(not(target_os = "linux"))]
fn set_multicast_if_v4(_socket: &UdpSocket, _interface: Ipv4Addr) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_multicast_hops_v6(socket: &UdpSocket, hops: u32) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let hops = hops as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            std::ptr::from_ref(&hops).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

#[cfg(not(target_os = "linux"))]
fn set_multicast_hops_v6(_socket: &UdpSocket, _hops: u32) -> io::Result<()> {
    Ok(())
}
