//! 文件/块设备节点后端
//!
//! 使用 `pread`/`pwrite` 风格的定位读写，不维护共享的文件指针。

use super::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

const SECTOR_SIZE: u32 = 512;

/// 基于文件（镜像文件或块设备节点）的设备
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileDevice {
    /// 打开已有的镜像或设备
    ///
    /// `writable` 为 false 时以只读方式打开。
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        log::debug!(
            "[DEV] opened {} ({} bytes, writable={})",
            path.display(),
            len,
            writable
        );
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    /// 创建（或截断）指定大小的镜像文件
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file,
            len,
            writable: true,
        })
    }

    /// 文件字节数
    pub fn len(&self) -> u64 {
        self.len
    }

    /// 是否为空文件
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self, lba: u64, count: u32) -> Result<(u64, usize)> {
        let start = lba * SECTOR_SIZE as u64;
        let len = count as usize * SECTOR_SIZE as usize;
        if start + len as u64 > self.len {
            return Err(Error::new(ErrorKind::Io, "access beyond end of file"));
        }
        Ok((start, len))
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn total_blocks(&self) -> u64 {
        self.len / SECTOR_SIZE as u64
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let (start, len) = self.range(lba, count)?;
        self.file.read_exact_at(&mut buf[..len], start)?;
        Ok(len)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::new(ErrorKind::InvalidState, "device opened read-only"));
        }
        let (start, len) = self.range(lba, count)?;
        self.file.write_all_at(&buf[..len], start)?;
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }
}
