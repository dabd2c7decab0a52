use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_int, c_void, socklen_t};

use super::fd::FileDesc;
use super::syscall;

pub fn setsockopt<T>(sock: &Socket, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    Ok(slot)
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let addr = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let addr = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family",
        )),
    }
}

pub fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

pub fn family_of(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut libc::sockaddr, *mut socklen_t) -> c_int,
{
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    if f(&mut storage as *mut _ as *mut _, &mut len) == -1 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage, len as usize)
}

/// An owned stream socket. The descriptor moves with the value; whoever
/// holds the `Socket` closes it.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    /// A nonblocking close-on-exec TCP socket for the given family.
    pub fn new_nonblocking(family: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;
        Ok(Socket(unsafe { FileDesc::new(fd) }))
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), libc::SOMAXCONN))?;
        Ok(())
    }

    /// Accepts one pending connection; the returned socket is nonblocking
    /// and close-on-exec. WouldBlock when the backlog is empty.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = syscall!(accept4(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;

        let sock = Socket(unsafe { FileDesc::new(fd) });
        let addr = sockaddr_to_addr(&storage, len as usize)?;
        Ok((sock, addr))
    }

    /// A single nonblocking connect attempt. The error carries the raw
    /// errno (EINPROGRESS included); classification is the caller's job.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(
            self.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(
            self.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.as_raw_fd();
        sockname(|addr, len| unsafe { libc::getsockname(fd, addr, len) })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.as_raw_fd();
        sockname(|addr, len| unsafe { libc::getpeername(fd, addr, len) })
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_no_delay(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    /// True when a nonblocking connect landed on its own listening port.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        getsockopt(self, libc::IPPROTO_TCP, libc::TCP_INFO)
    }

    /// One-line snapshot of the kernel's view of this connection.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        let info = self.tcp_info()?;
        Ok(format!(
            "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} \
             lost={} retrans={} rtt={} rttvar={} \
             sshthresh={} cwnd={} total_retrans={}",
            info.tcpi_retransmits,
            info.tcpi_rto,
            info.tcpi_ato,
            info.tcpi_snd_mss,
            info.tcpi_rcv_mss,
            info.tcpi_lost,
            info.tcpi_retrans,
            info.tcpi_rtt,
            info.tcpi_rttvar,
            info.tcpi_snd_ssthresh,
            info.tcpi_snd_cwnd,
            info.tcpi_total_retrans
        ))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Socket;
    use std::io::ErrorKind;

    #[test]
    fn bind_listen_accept_would_block() {
        let sock = Socket::new_nonblocking(libc::AF_INET).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        sock.listen().unwrap();

        let addr = sock.local_addr().unwrap();
        assert!(addr.port() != 0);

        assert_eq!(sock.accept().unwrap_err().kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn addr_round_trip() {
        let addr: std::net::SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let (storage, len) = super::addr_to_sockaddr(&addr);
        let back = super::sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(addr, back);

        let addr6: std::net::SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        let (storage, len) = super::addr_to_sockaddr(&addr6);
        let back = super::sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(addr6, back);
    }
}
