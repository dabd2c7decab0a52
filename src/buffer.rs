use std::io;
use std::os::unix::io::RawFd;

use libc::{self, c_void};

use crate::sys::syscall;

/// Headroom kept in front of the content so protocol code can prepend a
/// length field without moving the payload.
pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// A growable byte buffer for socket I/O.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      reader_idx   <=    writer_idx    <=      len
/// ```
///
/// Integer helpers read and write in network byte order.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_idx: usize,
    writer_idx: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_idx: CHEAP_PREPEND,
            writer_idx: CHEAP_PREPEND,
        }
    }

    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    pub fn readable_len(&self) -> usize {
        self.writer_idx - self.reader_idx
    }

    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.writer_idx
    }

    pub fn prependable_len(&self) -> usize {
        self.reader_idx
    }

    /// The readable region.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.reader_idx..self.writer_idx]
    }

    pub fn find_crlf(&self) -> Option<usize> {
        self.readable().windows(2).position(|w| w == b"\r\n")
    }

    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_len());
        self.readable()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| start + pos)
    }

    pub fn find_eol(&self) -> Option<usize> {
        self.readable().iter().position(|&b| b == b'\n')
    }

    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_len());
        self.readable()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_len() {
            self.reader_idx += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_idx = CHEAP_PREPEND;
        self.writer_idx = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_len());
        let result = self.readable()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_len())
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    pub fn retrieve_all_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_len())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_idx..self.writer_idx + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_len() < len {
            self.make_space(len);
        }
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_len());
        self.writer_idx += len;
    }

    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_len());
        self.writer_idx -= len;
    }

    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_len() >= 8);
        i64::from_be_bytes(self.readable()[..8].try_into().unwrap())
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_len() >= 4);
        i32::from_be_bytes(self.readable()[..4].try_into().unwrap())
    }

    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_len() >= 2);
        i16::from_be_bytes(self.readable()[..2].try_into().unwrap())
    }

    pub fn peek_i8(&self) -> i8 {
        assert!(!self.readable().is_empty());
        self.readable()[0] as i8
    }

    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve(8);
        x
    }

    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve(4);
        x
    }

    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve(2);
        x
    }

    pub fn read_i8(&mut self) -> i8 {
        let x = self.peek_i8();
        self.retrieve(1);
        x
    }

    /// Writes into the headroom in front of the readable region.
    /// Panics when the headroom is smaller than `data`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_len());
        self.reader_idx -= data.len();
        self.buf[self.reader_idx..self.reader_idx + data.len()].copy_from_slice(data);
    }

    pub fn prepend_i64(&mut self, x: i64) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i32(&mut self, x: i32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, x: i16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i8(&mut self, x: i8) {
        self.prepend(&x.to_be_bytes());
    }

    /// Drains `fd` with one `readv` into the writable region plus a 64 KiB
    /// stack buffer, so a single call can pull in more than the buffer has
    /// room for while growing it at most once.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_len();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_idx) } as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];

        let n = syscall!(readv(fd, iov.as_mut_ptr(), 2))? as usize;

        if n <= writable {
            self.writer_idx += n;
        } else {
            self.writer_idx = self.buf.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_len() + self.prependable_len() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_idx + len, 0);
        } else {
            // enough stale headroom to reclaim; shift instead of realloc
            let readable = self.readable_len();
            self.buf
                .copy_within(self.reader_idx..self.writer_idx, CHEAP_PREPEND);
            self.reader_idx = CHEAP_PREPEND;
            self.writer_idx = self.reader_idx + readable;
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_len(), 0);
        assert_eq!(buf.writable_len(), INITIAL_SIZE);
        assert_eq!(buf.prependable_len(), CHEAP_PREPEND);

        buf.append(b"hello world");
        assert_eq!(buf.readable_len(), 11);
        assert_eq!(buf.readable(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.readable(), b"world");
        assert_eq!(buf.prependable_len(), CHEAP_PREPEND + 6);

        buf.retrieve_all();
        assert_eq!(buf.readable_len(), 0);
        assert_eq!(buf.reader_idx, CHEAP_PREPEND);
        assert_eq!(buf.writer_idx, CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_past_end_resets() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert_eq!(buf.readable_len(), 0);
        assert_eq!(buf.prependable_len(), CHEAP_PREPEND);
    }

    #[test]
    fn grow_reallocates() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 400]);
        buf.append(&vec![b'y'; 1000]);
        assert_eq!(buf.readable_len(), 1400);
        assert_eq!(&buf.readable()[..400], &vec![b'x'; 400][..]);
        assert_eq!(&buf.readable()[400..], &vec![b'y'; 1000][..]);
    }

    #[test]
    fn grow_reclaims_headroom_without_realloc() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 800]);
        buf.retrieve(600);

        let cap = buf.buf.len();
        // 600 stale prepend bytes + 224 writable >= 500 + CHEAP_PREPEND
        buf.append(&vec![b'y'; 500]);
        assert_eq!(buf.buf.len(), cap);
        assert_eq!(buf.prependable_len(), CHEAP_PREPEND);
        assert_eq!(buf.readable_len(), 700);
        assert_eq!(&buf.readable()[..200], &vec![b'x'; 200][..]);
    }

    #[test]
    fn integer_round_trips() {
        let mut buf = Buffer::new();
        buf.append_i64(0x0102030405060708);
        buf.append_i32(-559038737);
        buf.append_i16(-2);
        buf.append_i8(-128);

        assert_eq!(buf.readable_len(), 15);
        // network byte order on the wire
        assert_eq!(buf.readable()[0], 0x01);

        assert_eq!(buf.read_i64(), 0x0102030405060708);
        assert_eq!(buf.read_i32(), -559038737);
        assert_eq!(buf.read_i16(), -2);
        assert_eq!(buf.read_i8(), -128);
        assert_eq!(buf.readable_len(), 0);
    }

    #[test]
    fn prepend_uses_headroom() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_i32(7);

        assert_eq!(buf.prependable_len(), CHEAP_PREPEND - 4);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.readable(), b"payload");
    }

    #[test]
    #[should_panic]
    fn prepend_overflow_panics() {
        let mut buf = Buffer::new();
        buf.prepend_i64(1);
        buf.prepend_i8(1);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");

        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(15), Some(23));
        assert_eq!(buf.find_eol(), Some(15));
        assert_eq!(buf.find_eol_from(16), Some(24));

        buf.retrieve_all();
        buf.append(b"no line ending");
        assert_eq!(buf.find_crlf(), None);
        assert_eq!(buf.find_eol(), None);
    }

    #[test]
    fn read_fd_spills_into_extra_buf() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let payload = vec![b'z'; 2000];
        let n = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n, 2000);

        let mut buf = Buffer::with_capacity(100);
        let read = buf.read_fd(fds[0]).unwrap();
        assert_eq!(read, 2000);
        assert_eq!(buf.readable(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn retrieve_strings() {
        let mut buf = Buffer::new();
        buf.append(b"one two");
        assert_eq!(buf.retrieve_as_string(3), "one");
        buf.retrieve(1);
        assert_eq!(buf.retrieve_all_string(), "two");
    }
}
