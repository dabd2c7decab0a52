use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;
use super::syscall;

/// The shortest delay we ever arm. Arming an absolute time that has already
/// passed makes `timerfd_settime` racy with EINVAL; 100us keeps the arm in
/// the future without a perceptible delay.
const MIN_DELAY_MICROS: u64 = 100;

/// A monotonic timerfd in nonblocking close-on-exec mode.
/// view: http://man7.org/linux/man-pages/man2/timerfd_create.2.html
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let flags = libc::TFD_CLOEXEC | libc::TFD_NONBLOCK;
        let timerfd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(timerfd) },
        })
    }

    /// Arms the timer to fire once after `delay`, replacing any previous
    /// setting. The delay is clamped up to 100us.
    pub fn set_delay(&self, delay: Duration) -> io::Result<()> {
        let micros = (delay.as_micros() as u64).max(MIN_DELAY_MICROS);

        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (micros / 1_000_000) as libc::time_t,
                tv_nsec: ((micros % 1_000_000) * 1_000) as libc::c_long,
            },
        };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut()
        ))?;

        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        let new_value: libc::itimerspec = unsafe { std::mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut()
        ))?;

        Ok(())
    }

    /// Returns the number of expirations since the last read. WouldBlock
    /// means the timer has not expired.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::TimerFd;
    use std::time::Duration;

    #[test]
    fn expires_after_delay() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_delay(Duration::from_millis(10)).unwrap();

        assert_eq!(
            timerfd.read().unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(1, timerfd.read().unwrap());
    }

    #[test]
    fn disarm_clears_pending() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_delay(Duration::from_millis(5)).unwrap();
        timerfd.disarm().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(timerfd.read().is_err());
    }
}
