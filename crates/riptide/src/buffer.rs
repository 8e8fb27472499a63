use std::{io, os::fd::RawFd};

/// Headroom kept in front of the readable region so a length prefix can be
/// prepended without shifting the payload.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity past the prepend headroom.
pub const INITIAL_SIZE: usize = 1024;

/// Growable byte buffer partitioned by two cursors:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index   <=   capacity
/// ```
///
/// Both cursors snap back to [`CHEAP_PREPEND`] whenever the buffer fully
/// drains, so a connection that keeps up with its peer never reallocates.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes. Requests covering the whole readable
    /// region (or more) reset both cursors.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        debug_assert!(len <= self.readable_bytes());
        let taken = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        taken
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() - CHEAP_PREPEND < len {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // enough total room, slide the readable region back down
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Reads once from `fd` with a two-part scatter: the writable tail of the
    /// buffer plus a 64 KiB stack scratch. Whatever lands in the scratch is
    /// appended after growing capacity, so one call can take everything the
    /// kernel has buffered without sizing the heap up front.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) }.cast::<libc::c_void>(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr().cast::<libc::c_void>(),
                iov_len: scratch.len(),
            },
        ];
        let iovcnt: libc::c_int = if writable < scratch.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the whole readable region to `fd` once. Does not retry and
    /// does not consume; the caller retrieves whatever the kernel accepted.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.reader_index).cast::<libc::c_void>(),
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
