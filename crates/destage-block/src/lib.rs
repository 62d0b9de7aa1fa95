#![forbid(unsafe_code)]
//! Raw block device abstraction.
//!
//! The cache layer sits on top of [`BlockDevice`]: a synchronous transfer
//! surface moving `count` contiguous blocks per call. Each call is atomic per
//! invocation — implementations either transfer everything or return an
//! error; there is no partial-transfer reporting.
//!
//! Two implementations are provided: [`MemBlockDevice`] (shared in-memory
//! store, used by tests and RAM-disk setups) and [`FileBlockDevice`]
//! (pread/pwrite on a backing image, thread-safe without a shared seek
//! position).

use destage_error::{DestageError, Result};
use destage_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

/// Block-addressed synchronous I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read `count` contiguous blocks starting at `start` into `out`.
    /// `out.len()` MUST equal `count * block_size()`.
    fn read_blocks(&self, start: BlockNumber, count: u32, out: &mut [u8]) -> Result<()>;

    /// Write `count` contiguous blocks starting at `start` from `data`.
    /// `data.len()` MUST equal `count * block_size()`.
    fn write_blocks(&self, start: BlockNumber, count: u32, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

/// Validate a transfer request against device geometry.
///
/// Returns the byte offset of `start` on success.
fn check_transfer(
    device: &dyn BlockDevice,
    start: BlockNumber,
    count: u32,
    buf_len: usize,
) -> Result<u64> {
    if count == 0 {
        return Err(DestageError::InvalidArgument(
            "zero-length transfer".to_owned(),
        ));
    }
    let block_size = device.block_size().as_usize();
    let expected = block_size
        .checked_mul(count as usize)
        .ok_or_else(|| DestageError::InvalidArgument("transfer length overflow".to_owned()))?;
    if buf_len != expected {
        return Err(DestageError::InvalidArgument(format!(
            "buffer size mismatch: got {buf_len}, expected {expected}"
        )));
    }
    let end = start
        .checked_add(u64::from(count))
        .ok_or_else(|| DestageError::InvalidArgument("block range overflow".to_owned()))?;
    if end.0 > device.block_count() {
        return Err(DestageError::InvalidArgument(format!(
            "transfer out of range: start={start} count={count} block_count={}",
            device.block_count()
        )));
    }
    start
        .0
        .checked_mul(u64::from(device.block_size().get()))
        .ok_or_else(|| DestageError::InvalidArgument("byte offset overflow".to_owned()))
}

/// Shared in-memory block device.
///
/// Cloning shares the backing store, so a test can hand one clone to a cache
/// and inspect the other after flushes.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    block_size: BlockSize,
    block_count: u64,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `block_count` blocks.
    #[must_use]
    pub fn new(block_size: BlockSize, block_count: u64) -> Self {
        let len = (block_count as usize) * block_size.as_usize();
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
            block_size,
            block_count,
        }
    }

    /// Copy of one block's current backing contents.
    #[must_use]
    pub fn block_contents(&self, block: BlockNumber) -> Vec<u8> {
        let block_size = self.block_size.as_usize();
        let start = (block.0 as usize) * block_size;
        self.bytes.lock()[start..start + block_size].to_vec()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_blocks(&self, start: BlockNumber, count: u32, out: &mut [u8]) -> Result<()> {
        let offset = check_transfer(self, start, count, out.len())? as usize;
        let bytes = self.bytes.lock();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, data: &[u8]) -> Result<()> {
        let offset = check_transfer(self, start, count, data.len())? as usize;
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<std::fs::File>,
    block_size: BlockSize,
    block_count: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open a backing image. Opens read-write if possible, read-only
    /// otherwise. The image length must be block-aligned.
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_size_u64 = u64::from(block_size.get());
        if len % block_size_u64 != 0 {
            return Err(DestageError::InvalidGeometry(format!(
                "image length {len} is not a multiple of block size {block_size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: len / block_size_u64,
            writable,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_blocks(&self, start: BlockNumber, count: u32, out: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let offset = check_transfer(self, start, count, out.len())?;
        self.file.read_exact_at(out, offset)?;
        Ok(())
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let offset = check_transfer(self, start, count, data.len())?;
        if !self.writable {
            return Err(DestageError::InvalidArgument(
                "device opened read-only".to_owned(),
            ));
        }
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_blocks(&self, start: BlockNumber, count: u32, out: &mut [u8]) -> Result<()> {
        (**self).read_blocks(start, count, out)
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, data: &[u8]) -> Result<()> {
        (**self).write_blocks(start, count, data)
    }

    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}
