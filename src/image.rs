//! Image source abstraction.
//!
//! Both carving passes consume an [`ImageSource`]: a seekable byte stream
//! with a known total size. Two implementations exist, a thin wrapper
//! around a regular file and one around a raw block device. Sizing a block
//! device by seeking to its end does not work everywhere, so the device
//! variant uses the `BLKGETSIZE64` ioctl on Linux and falls back to a
//! binary search over valid read offsets elsewhere.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A readable, seekable evidence stream.
pub trait ImageSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;
    /// Current physical position.
    fn tell(&mut self) -> io::Result<u64>;
    /// Total byte size of the underlying object.
    fn size(&mut self) -> io::Result<u64>;
}

/// Regular-file image.
pub struct FileImage {
    file: File,
}

impl ImageSource for FileImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Raw block-device image. Assumes 512-byte sectors when probing.
pub struct DeviceImage {
    file: File,
}

impl ImageSource for DeviceImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    #[cfg(target_os = "linux")]
    fn size(&mut self) -> io::Result<u64> {
        use std::os::unix::io::AsRawFd;

        let mut size: libc::size_t = 0;
        match unsafe { ioctl::blkgetsize64(self.file.as_raw_fd(), &mut size) } {
            Ok(_) => Ok(size as u64),
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn size(&mut self) -> io::Result<u64> {
        // Binary search over offsets at which a one-byte read succeeds.
        let original = self.file.stream_position()?;

        let mut low: u64 = 0;
        let mut high: u64 = 512;
        while valid_offset(&mut self.file, high) {
            low = high;
            high *= 2;
        }
        while low < high - 1 {
            let mid = (low + high) / 2;
            if valid_offset(&mut self.file, mid) {
                low = mid;
            } else {
                high = mid;
            }
        }
        let sectors = (low + 1) >> 9;

        self.file.seek(SeekFrom::Start(original))?;
        Ok(sectors * 512)
    }
}

#[cfg(target_os = "linux")]
mod ioctl {
    use nix::ioctl_read;
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

#[cfg(not(target_os = "linux"))]
fn valid_offset(file: &mut File, offset: u64) -> bool {
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return false;
    }
    let mut byte = [0u8; 1];
    matches!(file.read(&mut byte), Ok(1))
}

/// An opened evidence stream, regular file or block device.
pub enum Image {
    File(FileImage),
    Device(DeviceImage),
}

impl Image {
    /// Opens `path` read-only and picks the implementation from the file
    /// type.
    pub fn open(path: &Path) -> io::Result<Image> {
        let file = File::open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if file.metadata()?.file_type().is_block_device() {
                log::debug!("{} is a block device", path.display());
                return Ok(Image::Device(DeviceImage { file }));
            }
        }

        Ok(Image::File(FileImage { file }))
    }
}

impl ImageSource for Image {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Image::File(image) => image.read(buf),
            Image::Device(image) => image.read(buf),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Image::File(image) => image.seek(pos),
            Image::Device(image) => image.seek(pos),
        }
    }

    fn tell(&mut self) -> io::Result<u64> {
        match self {
            Image::File(image) => image.tell(),
            Image::Device(image) => image.tell(),
        }
    }

    fn size(&mut self) -> io::Result<u64> {
        match self {
            Image::File(image) => image.size(),
            Image::Device(image) => image.size(),
        }
    }
}
