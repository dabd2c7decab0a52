use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_void, socklen_t};

use super::fd::FileDesc;
use super::socket::{addr_to_sockaddr, family_of, sockaddr_to_addr};
use super::syscall;

/// A thin nonblocking datagram socket. No delivery semantics beyond what
/// `sendto`/`recvfrom` give; reactor users wrap it in their own channel.
#[derive(Debug)]
pub struct UdpSocket(FileDesc);

impl UdpSocket {
    pub fn bind(addr: &SocketAddr) -> io::Result<UdpSocket> {
        let fd = syscall!(socket(
            family_of(addr),
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_UDP
        ))?;
        let socket = UdpSocket(unsafe { FileDesc::new(fd) });

        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(
            socket.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;

        Ok(socket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = addr_to_sockaddr(target);
        let n = syscall!(sendto(
            self.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(n as usize)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let n = syscall!(recvfrom(
            self.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;

        Ok((n as usize, sockaddr_to_addr(&storage, len as usize)?))
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for UdpSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> UdpSocket {
        UdpSocket(FileDesc::new(fd))
    }
}

impl IntoRawFd for UdpSocket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::UdpSocket;
    use std::io::ErrorKind;

    #[test]
    fn datagram_round_trip() {
        let a = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();

        let sent = a.send_to(b"ping", &b.local_addr().unwrap()).unwrap();
        assert_eq!(sent, 4);

        // loopback delivery is fast but not instant for a nonblocking read
        let mut buf = [0u8; 16];
        let (n, from) = loop {
            match b.recv_from(&mut buf) {
                Ok(got) => break got,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("recv_from: {}", e),
            }
        };

        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
