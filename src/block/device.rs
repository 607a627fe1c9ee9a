//! 块设备核心类型

use crate::error::{Error, ErrorKind, Result};
use alloc::boxed::Box;
use alloc::vec;

/// 块设备接口
///
/// 实现此 trait 以提供底层块设备访问。btrfs 的所有磁盘访问（superblock、树块、
/// metadump 恢复）最终都落到这里的扇区级读写上。
///
/// # 示例
///
/// ```rust,ignore
/// use btrfs_core::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn block_size(&self) -> u32 {
///         4096
///     }
///
///     fn sector_size(&self) -> u32 {
///         512
///     }
///
///     fn total_blocks(&self) -> u64 {
///         1000000
///     }
///
///     fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
///         Ok(count as usize * self.sector_size() as usize)
///     }
///
///     fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
///         Ok(count as usize * self.sector_size() as usize)
///     }
/// }
/// ```
pub trait BlockDevice {
    /// 逻辑块大小（通常 4096）
    fn block_size(&self) -> u32;

    /// 物理扇区大小（通常 512）
    fn sector_size(&self) -> u32;

    /// 总块数
    fn total_blocks(&self) -> u64;

    /// 读取扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要读取的扇区数
    /// * `buf` - 目标缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际读取的字节数
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize>;

    /// 写入扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要写入的扇区数
    /// * `buf` - 源缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际写入的字节数
    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize>;

    /// 刷新缓存
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }

    /// 打开设备
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// 关闭设备
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn total_blocks(&self) -> u64 {
        (**self).total_blocks()
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        (**self).read_blocks(lba, count, buf)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        (**self).write_blocks(lba, count, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// 多设备文件系统中使用的类型擦除设备
#[cfg(feature = "std")]
pub type DynBlockDevice = Box<dyn BlockDevice + Send>;

/// 多设备文件系统中使用的类型擦除设备
#[cfg(not(feature = "std"))]
pub type DynBlockDevice = Box<dyn BlockDevice>;

/// I/O 计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// 字节级读请求次数
    pub reads: u64,
    /// 字节级写请求次数
    pub writes: u64,
    /// 读出字节数
    pub bytes_read: u64,
    /// 写入字节数
    pub bytes_written: u64,
    /// flush 次数
    pub flushes: u64,
}

/// 块设备包装器
///
/// 在扇区接口之上提供任意字节偏移的读写，并记录 I/O 统计。
/// btrfs 的 superblock 与树块按字节地址定位，不一定与设备扇区对齐。
pub struct BlockDev<D> {
    /// 底层设备
    device: D,
    /// 设备总字节数
    size: u64,
    /// 统计信息
    stats: IoStats,
}

impl<D: BlockDevice> BlockDev<D> {
    /// 创建新的块设备包装器
    pub fn new(device: D) -> Result<Self> {
        let block_size = device.block_size();
        let sector_size = device.sector_size();

        // 验证块大小是扇区大小的整数倍
        if sector_size == 0 || block_size % sector_size != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Block size must be a multiple of sector size",
            ));
        }

        let size = device.total_blocks() * block_size as u64;
        Ok(Self {
            device,
            size,
            stats: IoStats::default(),
        })
    }

    /// 获取底层设备的引用
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 获取底层设备的可变引用
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// 取回底层设备
    pub fn into_inner(self) -> D {
        self.device
    }

    /// 设备总字节数
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 物理扇区大小
    pub fn sector_size(&self) -> u32 {
        self.device.sector_size()
    }

    /// 是否只读
    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    /// I/O 统计
    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// 清零统计
    pub fn reset_stats(&mut self) {
        self.stats = IoStats::default();
    }

    /// 按字节偏移读取
    ///
    /// 超出设备末尾的部分不读取，返回值小于 `buf.len()` 即为短读，调用方据此判断
    /// （例如 superblock 副本超出小设备的情况）。
    ///
    /// # 参数
    ///
    /// * `offset` - 字节偏移
    /// * `buf` - 目标缓冲区
    ///
    /// # 返回
    ///
    /// 实际读取的字节数
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.stats.reads += 1;
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);

        let sector = self.device.sector_size() as u64;
        let start_sector = offset / sector;
        let head = (offset % sector) as usize;
        let sectors = (head + len).div_ceil(sector as usize);

        if head == 0 && len % sector as usize == 0 {
            let n = self
                .device
                .read_blocks(start_sector, sectors as u32, &mut buf[..len])?;
            self.stats.bytes_read += n as u64;
            return Ok(n.min(len));
        }

        let mut temp = vec![0u8; sectors * sector as usize];
        let n = self
            .device
            .read_blocks(start_sector, sectors as u32, &mut temp)?;
        let got = n.saturating_sub(head).min(len);
        buf[..got].copy_from_slice(&temp[head..head + got]);
        self.stats.bytes_read += got as u64;
        Ok(got)
    }

    /// 按字节偏移读取，要求读满
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            log::debug!(
                "[DEV] short read at {:#x}: {} of {} bytes",
                offset,
                n,
                buf.len()
            );
            return Err(Error::new(ErrorKind::Io, "short read"));
        }
        Ok(())
    }

    /// 按字节偏移写入
    ///
    /// 非扇区对齐的写入会先读出首尾扇区再合并。超出设备末尾的写入是错误。
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.stats.writes += 1;
        if self.device.is_read_only() {
            return Err(Error::new(ErrorKind::InvalidState, "device is read-only"));
        }
        if offset
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.size)
        {
            log::error!(
                "[DEV] write beyond end of device: offset={:#x} len={} size={:#x}",
                offset,
                buf.len(),
                self.size
            );
            return Err(Error::new(ErrorKind::NoSpace, "write beyond end of device"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let sector = self.device.sector_size() as u64;
        let start_sector = offset / sector;
        let head = (offset % sector) as usize;
        let sectors = (head + buf.len()).div_ceil(sector as usize);

        let n = if head == 0 && buf.len() % sector as usize == 0 {
            self.device
                .write_blocks(start_sector, sectors as u32, buf)?
        } else {
            let mut temp = vec![0u8; sectors * sector as usize];
            self.device
                .read_blocks(start_sector, sectors as u32, &mut temp)?;
            temp[head..head + buf.len()].copy_from_slice(buf);
            self.device
                .write_blocks(start_sector, sectors as u32, &temp)?
                .saturating_sub(head)
                .min(buf.len())
        };

        if n != buf.len() {
            return Err(Error::new(ErrorKind::Io, "short write"));
        }
        self.stats.bytes_written += n as u64;
        Ok(n)
    }

    /// 刷新底层设备
    pub fn flush(&mut self) -> Result<()> {
        self.stats.flushes += 1;
        self.device.flush()
    }

    /// 打开底层设备
    pub fn open(&mut self) -> Result<()> {
        self.device.open()
    }

    /// 关闭底层设备（先刷新）
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.device.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;

    #[test]
    fn test_unaligned_roundtrip() {
        let mut dev = BlockDev::new(MemoryDevice::new(1 << 20)).unwrap();
        let data = [0xabu8; 100];
        dev.write_at(1000, &data).unwrap();

        let mut back = [0u8; 100];
        assert_eq!(dev.read_at(1000, &mut back).unwrap(), 100);
        assert_eq!(back, data);

        // 相邻字节未被覆盖
        let mut around = [0xffu8; 2];
        dev.read_at(999, &mut around[..1]).unwrap();
        dev.read_at(1100, &mut around[1..]).unwrap();
        assert_eq!(around, [0, 0]);
    }

    #[test]
    fn test_short_read_at_end() {
        let mut dev = BlockDev::new(MemoryDevice::new(8192)).unwrap();
        let mut buf = [0u8; 4096];
        assert_eq!(dev.read_at(6144, &mut buf).unwrap(), 2048);
        assert_eq!(dev.read_at(8192, &mut buf).unwrap(), 0);
        assert!(dev.read_exact_at(6144, &mut buf).is_err());
    }

    #[test]
    fn test_write_beyond_end() {
        let mut dev = BlockDev::new(MemoryDevice::new(8192)).unwrap();
        let err = dev.write_at(8000, &[0u8; 512]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_stats() {
        let mut dev = BlockDev::new(MemoryDevice::new(8192)).unwrap();
        dev.write_at(0, &[1u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        dev.read_at(0, &mut buf).unwrap();
        dev.flush().unwrap();

        let stats = dev.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 512);
        assert_eq!(stats.flushes, 1);

        dev.reset_stats();
        assert_eq!(dev.stats(), IoStats::default());
    }

    #[test]
    fn test_boxed_device() {
        let boxed: DynBlockDevice = Box::new(MemoryDevice::new(4096));
        let mut dev = BlockDev::new(boxed).unwrap();
        dev.write_at(10, b"boxed").unwrap();
        let mut buf = [0u8; 5];
        dev.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"boxed");
    }
}
