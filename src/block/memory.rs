//! 内存块设备
//!
//! 稀疏存储：只为写过的 4 KiB 页分配内存，未写过的区域读出全零。
//! 这样可以在测试中构造 256 GiB 的“设备”并覆盖第三个 superblock 副本。

use super::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

const PAGE_SIZE: u64 = 4096;
const SECTOR_SIZE: u32 = 512;

/// 稀疏内存块设备
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    size: u64,
    read_only: bool,
    read_ops: u64,
    write_ops: u64,
    flushes: u64,
}

impl MemoryDevice {
    /// 创建指定字节数的设备（向下取整到 4 KiB）
    pub fn new(size: u64) -> Self {
        Self {
            size: size - size % PAGE_SIZE,
            ..Default::default()
        }
    }

    /// 设置只读
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// 底层 read_blocks 调用次数
    pub fn read_ops(&self) -> u64 {
        self.read_ops
    }

    /// 底层 write_blocks 调用次数
    pub fn write_ops(&self) -> u64 {
        self.write_ops
    }

    /// flush 次数
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// 已分配的页数
    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// 按字节读取（不计入统计）
    pub fn peek(&self, offset: u64, buf: &mut [u8]) {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            match self.pages.get(&page) {
                Some(data) => buf[done..done + n].copy_from_slice(&data[in_page..in_page + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    /// 按字节写入（不计入统计，忽略只读标志）
    pub fn poke(&mut self, offset: u64, buf: &[u8]) {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            let data = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            data[in_page..in_page + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
    }

    /// 翻转指定字节的最低位（测试中制造校验和错误）
    pub fn corrupt(&mut self, offset: u64) {
        let mut byte = [0u8; 1];
        self.peek(offset, &mut byte);
        byte[0] ^= 1;
        self.poke(offset, &byte);
    }

    fn check_range(&self, lba: u64, count: u32) -> Result<(u64, usize)> {
        let start = lba * SECTOR_SIZE as u64;
        let len = count as u64 * SECTOR_SIZE as u64;
        if start + len > self.size {
            return Err(Error::new(ErrorKind::Io, "access beyond end of memory device"));
        }
        Ok((start, len as usize))
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 {
        PAGE_SIZE as u32
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn total_blocks(&self) -> u64 {
        self.size / PAGE_SIZE
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let (start, len) = self.check_range(lba, count)?;
        self.read_ops += 1;
        self.peek(start, &mut buf[..len]);
        Ok(len)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(Error::new(ErrorKind::InvalidState, "memory device is read-only"));
        }
        let (start, len) = self.check_range(lba, count)?;
        self.write_ops += 1;
        self.poke(start, &buf[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_storage() {
        let mut dev = MemoryDevice::new(256 << 30);
        assert_eq!(dev.total_blocks(), (256u64 << 30) / 4096);

        dev.poke((256u64 << 30) - 4096, &[7u8; 4096]);
        assert_eq!(dev.allocated_pages(), 1);

        let mut buf = [0u8; 512];
        let lba = ((256u64 << 30) - 512) / 512;
        dev.read_blocks(lba, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let mut dev = MemoryDevice::new(1 << 20);
        let mut buf = [0xffu8; 1024];
        dev.read_blocks(10, 2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(dev.read_ops(), 1);
    }

    #[test]
    fn test_cross_page_poke() {
        let mut dev = MemoryDevice::new(1 << 20);
        dev.poke(4090, &[1u8; 20]);
        let mut buf = [0u8; 20];
        dev.peek(4090, &mut buf);
        assert_eq!(buf, [1u8; 20]);
        assert_eq!(dev.allocated_pages(), 2);
    }

    #[test]
    fn test_read_only_and_bounds() {
        let mut dev = MemoryDevice::new(4096);
        assert!(dev.read_blocks(8, 1, &mut [0u8; 512]).is_err());
        dev.set_read_only(true);
        assert!(dev.write_blocks(0, 1, &[0u8; 512]).is_err());
    }
}
