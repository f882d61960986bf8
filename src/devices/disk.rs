use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::info;

pub const SECTOR_SIZE: usize = 512;

/// A raw disk image: sector N lives at byte offset N * 512, no header,
/// no metadata. Opened read/write on mount; the handle closes (and
/// flushes) on drop.
pub struct DiskImage {
    file: File,
    size: u64,
    path: PathBuf,
}

impl DiskImage {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        info!("disk image opened: {} ({} bytes)", path.display(), size);
        Ok(Self {
            file,
            size,
            path: path.to_path_buf(),
        })
    }

    /// Image length in bytes; reported to the host as the card size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bulk read at an arbitrary byte offset. Any portion of `buf` beyond
    /// the end of the image reads back as 0xFF.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        for byte in buf.iter_mut() {
            *byte = 0xFF;
        }
        if offset >= self.size {
            return Ok(());
        }
        let available = (self.size - offset).min(buf.len() as u64) as usize;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..available])?;
        Ok(())
    }

    /// Bulk write at an arbitrary byte offset. Writes past the end of the
    /// image are refused; the image never grows.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "write offset overflow"))?;
        if end > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of disk image",
            ));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(())
    }
}
