macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

pub mod epoll;
pub mod eventfd;
pub mod fd;
pub mod socket;
pub mod timerfd;
pub mod udp;

pub use epoll::Epoll;
pub use eventfd::EventFd;
pub use fd::FileDesc;
pub use socket::Socket;
pub use timerfd::TimerFd;
pub use udp::UdpSocket;
