//! Cursor-driven transmission of a buffer chain to a non-blocking socket.
//!
//! The chain stays intact while it is being written; a byte cursor tracks
//! progress so partial writes resume where they stopped. Memory segments are
//! gathered into one vectored write, file regions go through `sendfile(2)`.

use std::fs::File;
use std::io::{self, IoSlice, Write};
use std::os::fd::AsRawFd;

use super::pooled::{BufferKind, PooledBuffer};
use crate::metrics;

/// Maximum iovecs per vectored write.
pub(crate) const MAX_IOVECS: usize = 64;

/// Largest single `sendfile` request.
const MAX_SENDFILE: u64 = 1 << 30;

/// Result of a [`Transmit::write_to`] call that did not fail.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Every byte of the chain is on the wire.
    Complete,
    /// The socket stopped accepting bytes.
    Blocked,
}

/// Where a transmission failed.
#[derive(Debug)]
pub(crate) enum TransmitError {
    /// The socket failed; the connection is unusable.
    Socket(io::Error),
    /// A file-backed segment could not be read.
    File(io::Error),
}

/// A chain being written to a socket.
pub(crate) struct Transmit {
    chain: Option<PooledBuffer>,
    total: u64,
    written: u64,
}

impl Transmit {
    pub(crate) fn new(chain: Option<PooledBuffer>) -> Self {
        let total = chain.as_ref().map_or(0, |c| c.chain_len());
        Transmit {
            chain,
            total,
            written: 0,
        }
    }

    /// Memory bytes still to be written. Unsent file regions are not
    /// counted; they occupy no memory.
    pub(crate) fn buffered(&self) -> u64 {
        let Some(chain) = self.chain.as_ref() else {
            return 0;
        };
        let mut skip = self.written;
        let mut buffered = 0;
        for segment in chain.segments() {
            let len = segment.len() as u64;
            let sent = skip.min(len);
            skip -= sent;
            if segment.kind() != BufferKind::File {
                buffered += len - sent;
            }
        }
        buffered
    }

    /// Whether any byte has reached the wire.
    pub(crate) fn started(&self) -> bool {
        self.written > 0
    }

    /// Swap in a replacement chain. The old chain is released.
    pub(crate) fn replace(&mut self, chain: Option<PooledBuffer>) {
        *self = Transmit::new(chain);
    }

    /// Write as much of the chain as `out` accepts.
    pub(crate) fn write_to<W>(&mut self, out: &mut W) -> Result<Progress, TransmitError>
    where
        W: Write + AsRawFd,
    {
        loop {
            if self.written >= self.total {
                return Ok(Progress::Complete);
            }
            let Some(chain) = self.chain.as_mut() else {
                return Ok(Progress::Complete);
            };

            // Locate the first unsent byte.
            let mut skip = self.written;
            let mut index = 0;
            let mut file_next = false;
            for segment in chain.segments() {
                let len = segment.len() as u64;
                if skip < len {
                    file_next = segment.kind() == BufferKind::File;
                    break;
                }
                skip -= len;
                index += 1;
            }

            let result = if file_next {
                match chain.segment_mut(index) {
                    Some(segment) => send_file_segment(out, segment, skip),
                    None => return Ok(Progress::Complete),
                }
            } else {
                write_memory_segments(out, chain, index, skip as usize)
            };

            match result {
                Ok(0) => {
                    return Err(TransmitError::Socket(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )));
                }
                Ok(n) => {
                    self.written += n as u64;
                    metrics::BYTES_SENT.add(n as u64);
                }
                Err(TransmitError::Socket(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Blocked);
                }
                Err(TransmitError::Socket(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Gather memory segments from `index` onward, stopping at a file segment.
fn write_memory_segments<W: Write>(
    out: &mut W,
    chain: &PooledBuffer,
    index: usize,
    skip: usize,
) -> Result<usize, TransmitError> {
    let mut slices = Vec::with_capacity(MAX_IOVECS.min(8));
    for (i, segment) in chain.segments().skip(index).enumerate() {
        if segment.kind() == BufferKind::File || slices.len() == MAX_IOVECS {
            break;
        }
        let data = if i == 0 {
            &segment.data()[skip..]
        } else {
            segment.data()
        };
        if !data.is_empty() {
            slices.push(IoSlice::new(data));
        }
    }
    out.write_vectored(&slices).map_err(TransmitError::Socket)
}

fn send_file_segment<W: Write + AsRawFd>(
    out: &mut W,
    segment: &mut PooledBuffer,
    skip: u64,
) -> Result<usize, TransmitError> {
    let length = segment.len() as u64;
    let Some((file, offset)) = segment.file_cursor() else {
        return Err(TransmitError::File(io::Error::other(
            "file segment has no handle",
        )));
    };
    let n = send_file(out, file, offset + skip, length - skip)?;
    if n == 0 {
        return Err(TransmitError::File(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file ended before the region was sent",
        )));
    }
    segment.set_file_sent(skip + n as u64);
    Ok(n)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_file<W: Write + AsRawFd>(
    out: &mut W,
    file: &File,
    offset: u64,
    len: u64,
) -> Result<usize, TransmitError> {
    let mut off = offset as libc::off_t;
    let count = len.min(MAX_SENDFILE) as usize;
    let ret = unsafe { libc::sendfile(out.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
    if ret >= 0 {
        return Ok(ret as usize);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN)
        | Some(libc::EINTR)
        | Some(libc::EPIPE)
        | Some(libc::ECONNRESET)
        | Some(libc::ENOTCONN) => Err(TransmitError::Socket(err)),
        _ => Err(TransmitError::File(err)),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_file<W: Write + AsRawFd>(
    out: &mut W,
    file: &File,
    offset: u64,
    len: u64,
) -> Result<usize, TransmitError> {
    use std::os::unix::fs::FileExt;

    let mut scratch = vec![0u8; len.min(64 * 1024) as usize];
    let n = file
        .read_at(&mut scratch, offset)
        .map_err(TransmitError::File)?;
    if n == 0 {
        return Ok(0);
    }
    out.write(&scratch[..n]).map_err(TransmitError::Socket)
}
