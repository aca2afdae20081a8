use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use crate::icmp::Family;

/// Metadata reported alongside one received ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Length of the ICMP message, IP header excluded
    pub len: usize,
    pub source: IpAddr,
    /// Local address the datagram was delivered to, when reported
    pub destination: Option<IpAddr>,
    /// TTL or hop limit of the datagram, when reported
    pub ttl: Option<u8>,
}

/// A raw ICMP socket bound to one address family.
///
/// Dropping the last handle closes the socket.
#[async_trait]
pub trait RawSocket: Send + Sync {
    /// Read one ICMP message into `buf`, without any IP header.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<Received>;

    async fn send_to(&self, buf: &[u8], destination: IpAddr) -> io::Result<usize>;
}

/// Opens configured raw sockets for a transport.
pub trait SocketOpener: Send + Sync {
    fn open(&self, family: Family) -> io::Result<Arc<dyn RawSocket>>;
}

/// Opens real operating system sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSockets;

impl SocketOpener for SystemSockets {
    #[cfg(unix)]
    fn open(&self, family: Family) -> io::Result<Arc<dyn RawSocket>> {
        Ok(Arc::new(sys::SystemSocket::open(family)?))
    }

    #[cfg(not(unix))]
    fn open(&self, _family: Family) -> io::Result<Arc<dyn RawSocket>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "raw ICMP sockets are only supported on unix platforms",
        ))
    }
}

/// Check whether raw ICMP sockets can be created by this process.
pub fn check_raw_socket_privileges(family: Family) -> io::Result<()> {
    socket2::Socket::new(family.domain(), socket2::Type::RAW, Some(family.protocol())).map(|_| ())
}

#[cfg(unix)]
pub use sys::{SystemSocket, enable_metadata, install_echo_reply_filter};

#[cfg(unix)]
mod sys {
    use super::*;
    use libc::c_int;
    use socket2::{SockAddr, Socket, Type};
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::os::unix::io::AsRawFd;
    use tokio::io::unix::AsyncFd;

    #[cfg(target_os = "linux")]
    const IPV6_RECVHOPLIMIT: c_int = 51;
    #[cfg(target_os = "macos")]
    const IPV6_RECVHOPLIMIT: c_int = 37;

    #[cfg(target_os = "linux")]
    const ICMP_FILTER: c_int = 1;
    #[cfg(target_os = "linux")]
    const ICMPV6_FILTER: c_int = 1;

    pub struct SystemSocket {
        family: Family,
        fd: AsyncFd<Socket>,
    }

    impl SystemSocket {
        /// Open a non-blocking raw socket that only delivers echo replies.
        pub fn open(family: Family) -> io::Result<Self> {
            let socket = Socket::new(family.domain(), Type::RAW, Some(family.protocol()))?;
            socket.set_nonblocking(true)?;
            enable_metadata(&socket, family)?;
            install_echo_reply_filter(&socket, family)?;

            log::debug!("opened raw {} ICMP socket", family);
            Ok(Self {
                family,
                fd: AsyncFd::new(socket)?,
            })
        }
    }

    impl Drop for SystemSocket {
        fn drop(&mut self) {
            log::debug!("closing raw {} ICMP socket", self.family);
        }
    }

    #[async_trait]
    impl RawSocket for SystemSocket {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<Received> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| recv_with_metadata(inner.get_ref(), buf, self.family)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send_to(&self, buf: &[u8], destination: IpAddr) -> io::Result<usize> {
            let addr = SockAddr::from(SocketAddr::new(destination, 0));
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send_to(buf, &addr)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }
    }

    /// Ask the kernel to report destination address and TTL/hop limit with
    /// each datagram. IPv4 raw sockets already carry the TTL in the IP header.
    #[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(unused_variables))]
    pub fn enable_metadata(socket: &Socket, family: Family) -> io::Result<()> {
        match family {
            Family::V4 => {
                #[cfg(target_os = "linux")]
                set_option(socket, libc::IPPROTO_IP, libc::IP_PKTINFO, &(1 as c_int))?;
            }
            Family::V6 => {
                #[cfg(any(target_os = "linux", target_os = "macos"))]
                set_option(socket, libc::IPPROTO_IPV6, IPV6_RECVHOPLIMIT, &(1 as c_int))?;
                #[cfg(target_os = "linux")]
                set_option(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, &(1 as c_int))?;
            }
        }
        Ok(())
    }

    /// Drop everything but echo replies in the kernel. Only Linux supports
    /// this; elsewhere the decoder discards other messages.
    #[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
    pub fn install_echo_reply_filter(socket: &Socket, family: Family) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        match family {
            Family::V4 => {
                // Set bits block the matching type
                let blocked: u32 = !(1u32 << family.echo_reply_type());
                set_option(socket, libc::SOL_RAW, ICMP_FILTER, &blocked)?;
            }
            Family::V6 => {
                let reply = family.echo_reply_type() as usize;
                let mut blocked = [u32::MAX; 8];
                blocked[reply >> 5] &= !(1u32 << (reply & 31));
                set_option(socket, libc::IPPROTO_ICMPV6, ICMPV6_FILTER, &blocked)?;
            }
        }
        Ok(())
    }

    #[allow(dead_code)]
    fn set_option<T>(socket: &Socket, level: c_int, name: c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv_with_metadata(socket: &Socket, buf: &mut [u8], family: Family) -> io::Result<Received> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        // u64 backing keeps the control buffer aligned for cmsghdr
        let mut cmsg_buf = [0u64; 16];
        let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

        let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        let source = parse_sockaddr_storage(&src_storage)?;
        let (destination, mut ttl) = parse_control(&msg);
        let mut len = len as usize;

        if family == Family::V4 {
            let header_len = ipv4_header_len(&buf[..len])?;
            ttl = Some(buf[8]);
            buf.copy_within(header_len..len, 0);
            len -= header_len;
        }

        Ok(Received {
            len,
            source,
            destination,
            ttl,
        })
    }

    fn ipv4_header_len(packet: &[u8]) -> io::Result<usize> {
        let header_len = packet
            .first()
            .map(|b| ((b & 0x0F) as usize) * 4)
            .unwrap_or(0);
        if header_len < 20 || packet.len() < header_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated IPv4 header",
            ));
        }
        Ok(header_len)
    }

    fn parse_control(msg: &libc::msghdr) -> (Option<IpAddr>, Option<u8>) {
        let mut destination = None;
        let mut ttl = None;

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                let data = libc::CMSG_DATA(cmsg);

                if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_HOPLIMIT {
                    let hops = std::ptr::read_unaligned(data as *const c_int);
                    ttl = Some(hops as u8);
                }

                #[cfg(target_os = "linux")]
                if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                    let info = std::ptr::read_unaligned(data as *const libc::in_pktinfo);
                    destination = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr))));
                }

                #[cfg(target_os = "linux")]
                if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                    let info = std::ptr::read_unaligned(data as *const libc::in6_pktinfo);
                    destination = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                }

                cmsg = libc::CMSG_NXTHDR(msg, cmsg);
            }
        }

        (destination, ttl)
    }

    fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> io::Result<IpAddr> {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
                Ok(IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr))))
            }
            libc::AF_INET6 => {
                let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
                Ok(IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address family: {}", other),
            )),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_ipv4_header_len() {
            let mut packet = [0u8; 28];
            packet[0] = 0x45;
            assert_eq!(ipv4_header_len(&packet).unwrap(), 20);

            packet[0] = 0x46;
            assert_eq!(ipv4_header_len(&packet).unwrap(), 24);

            packet[0] = 0x4F;
            assert!(ipv4_header_len(&packet).is_err());
            assert!(ipv4_header_len(&[]).is_err());
        }

        #[tokio::test]
        async fn test_raw_socket_creation() {
            // This test may fail without administrator privileges
            match SystemSocket::open(Family::V4) {
                Ok(_) => println!("Raw socket creation successful"),
                Err(e) => println!("Raw socket creation failed: {}", e),
            }
        }
    }
}
