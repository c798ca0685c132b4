//! Logical image sources
//!
//! `LogicalReader` is the capability seam between the copy engine and the
//! concrete source kinds: a plain raw file, an archive-windowed member, or
//! an NBD export (qcow2 served by qemu-nbd). The checksum aggregator and
//! the extent source depend only on this trait.

use crate::error::{Error, Result};
use crate::extent::Extent;
#[cfg(unix)]
use crate::nbd::NbdClient;
#[cfg(unix)]
use parking_lot::Mutex;
use std::fs::File;
use std::path::Path;

pub trait LogicalReader: Send + Sync {
    /// Virtual size of the guest-visible content.
    fn size(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset`. Safe for concurrent
    /// callers.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Allocation map covering `[start, start+length)` exactly. Sources
    /// without extent reporting return a single data extent, degrading to
    /// a full copy.
    fn extents(&self, start: u64, length: u64) -> Result<Vec<Extent>>;
}

/// Raw file source, optionally windowed to a byte range of the underlying
/// file (the archive-member case). Reads use positioned I/O so the handle
/// is shared freely across workers.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    window_offset: u64,
    window_size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let size = file.metadata()?.len();
        Ok(FileSource {
            file,
            window_offset: 0,
            window_size: size,
        })
    }

    /// Open `path` windowed to `[offset, offset+size)`.
    pub fn open_window(path: &Path, offset: u64, size: u64) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(FileSource {
            file,
            window_offset: offset,
            window_size: size,
        })
    }
}

impl LogicalReader for FileSource {
    fn size(&self) -> u64 {
        self.window_size
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if offset + buf.len() as u64 > self.window_size {
            return Err(Error::InvalidArgument(format!(
                "read past end of image: offset {offset} length {}",
                buf.len()
            )));
        }
        read_exact_at(&self.file, buf, self.window_offset + offset)?;
        Ok(())
    }

    fn extents(&self, start: u64, length: u64) -> Result<Vec<Extent>> {
        if start + length > self.window_size {
            return Err(Error::InvalidArgument(format!(
                "extent query past end of image: start {start} length {length}"
            )));
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        let file_start = self.window_offset + start;
        match probe_extents(&self.file, file_start, length) {
            Some(extents) => Ok(extents
                .into_iter()
                .map(|e| Extent {
                    start: e.start - self.window_offset,
                    length: e.length,
                    zero: e.zero,
                })
                .collect()),
            // Filesystem cannot report holes: full copy.
            None => Ok(vec![Extent::data(start, length)]),
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Walk SEEK_DATA/SEEK_HOLE over `[start, start+length)`. Returns None
/// when the filesystem does not support hole reporting.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn probe_extents(file: &File, start: u64, length: u64) -> Option<Vec<Extent>> {
    use std::os::fd::AsRawFd;

    let fd = file.as_raw_fd();
    let end = start + length;
    let mut pos = start;
    let mut out = Vec::new();

    while pos < end {
        let data = unsafe { libc::lseek(fd, pos as libc::off_t, libc::SEEK_DATA) };
        if data < 0 {
            let err = std::io::Error::last_os_error();
            // ENXIO: no more data before EOF, the rest is one hole.
            if err.raw_os_error() == Some(libc::ENXIO) {
                out.push(Extent::zero(pos, end - pos));
                return Some(out);
            }
            return None;
        }
        let data = data as u64;
        if data >= end {
            out.push(Extent::zero(pos, end - pos));
            return Some(out);
        }
        if data > pos {
            out.push(Extent::zero(pos, data - pos));
        }
        let hole = unsafe { libc::lseek(fd, data as libc::off_t, libc::SEEK_HOLE) };
        if hole < 0 {
            return None;
        }
        let hole = (hole as u64).min(end);
        out.push(Extent::data(data, hole - data));
        pos = hole;
    }
    Some(out)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn probe_extents(_file: &File, _start: u64, _length: u64) -> Option<Vec<Extent>> {
    None
}

/// NBD-backed source: qcow2 (or any qemu-readable format) exposed as its
/// logical byte stream by a qemu-nbd subprocess. NBD commands mutate the
/// connection state, so the client sits behind a lock; workers doing bulk
/// reads should open their own connection instead.
#[cfg(unix)]
pub struct NbdSource {
    client: Mutex<NbdClient>,
    size: u64,
}

#[cfg(unix)]
impl NbdSource {
    pub fn new(client: NbdClient) -> Self {
        let size = client.export_size();
        NbdSource {
            client: Mutex::new(client),
            size,
        }
    }
}

#[cfg(unix)]
impl LogicalReader for NbdSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.client.lock().read(offset, buf)
    }

    fn extents(&self, start: u64, length: u64) -> Result<Vec<Extent>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut client = self.client.lock();
        if !client.has_block_status() {
            return Ok(vec![Extent::data(start, length)]);
        }
        client.block_status(start, length)
    }
}

/// Read the logical stream as zeros-or-data according to the extent map,
/// in `chunk` sized pieces. Shared by the checksum aggregator and tests.
pub fn read_range(
    reader: &dyn LogicalReader,
    start: u64,
    length: u64,
    chunk: usize,
    mut consume: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    let mut buf = vec![0u8; chunk];
    let mut pos = start;
    let end = start + length;
    while pos < end {
        let n = ((end - pos) as usize).min(chunk);
        reader.read_at(&mut buf[..n], pos)?;
        consume(&buf[..n])?;
        pos += n as u64;
    }
    Ok(())
}
