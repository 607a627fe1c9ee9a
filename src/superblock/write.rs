//! Superblock 写入

use super::{checksum, Superblock};
use crate::{
    block::{BlockDev, BlockDevice},
    consts::*,
    error::{Error, ErrorKind, Result},
};

/// 写入范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperWriteIntent {
    /// 只写主副本
    Primary,
    /// 主副本及设备容纳得下的全部备份副本
    All,
}

/// 将 superblock 写回块设备
///
/// 每个副本的 `bytenr` 不同，因此逐个副本重新计算校验和。
/// 写主副本前后各 flush 一次，保证主副本落盘先于备份副本。
///
/// # 参数
///
/// * `bdev` - 块设备引用
/// * `sb` - superblock（返回时 `bytenr` 为最后写入的副本偏移）
/// * `intent` - 写入范围
///
/// # 返回
///
/// 写入的副本数
pub fn write_superblock<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    sb: &mut Superblock,
    intent: SuperWriteIntent,
) -> Result<usize> {
    let mirrors = match intent {
        SuperWriteIntent::Primary => 1,
        SuperWriteIntent::All => BTRFS_SUPER_MIRROR_MAX,
    };

    let mut written = 0;
    for mirror in 0..mirrors {
        let bytenr = btrfs_sb_offset(mirror);
        if bytenr + BTRFS_SUPER_INFO_SIZE as u64 > bdev.size() {
            break;
        }

        sb.set_bytenr(bytenr);
        checksum::set_checksum(sb)?;

        if mirror == 0 {
            bdev.flush()?;
        }
        bdev.write_at(bytenr, sb.as_bytes()).map_err(|e| {
            log::error!("[SUPER] failed to write super block at {:#x}: {}", bytenr, e);
            Error::new(ErrorKind::Io, "failed to write superblock")
        })?;
        if mirror == 0 {
            bdev.flush()?;
        }
        log::debug!(
            "[SUPER] wrote mirror {} at {:#x} generation {}",
            mirror,
            bytenr,
            sb.generation()
        );
        written += 1;
    }

    if written == 0 {
        return Err(Error::new(
            ErrorKind::NoSpace,
            "device too small for a superblock",
        ));
    }
    Ok(written)
}

/// 写入 mkfs 临时 superblock
///
/// 使用临时魔数，使未完成的文件系统不会被识别为可用的 btrfs。
/// 只写主副本，最终完成时由 [`finalize_temp_super`] 换回正式魔数。
pub fn write_temp_super<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    sb: &mut Superblock,
    root_bytenr: u64,
) -> Result<()> {
    sb.set_root(root_bytenr);
    sb.set_magic(BTRFS_MAGIC_TEMPORARY);
    sb.set_bytenr(BTRFS_SUPER_INFO_OFFSET);
    checksum::set_checksum(sb)?;
    bdev.write_at(BTRFS_SUPER_INFO_OFFSET, sb.as_bytes())?;
    Ok(())
}

/// 将临时魔数替换为正式魔数并写出全部副本
pub fn finalize_temp_super<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    sb: &mut Superblock,
) -> Result<usize> {
    sb.set_magic(BTRFS_MAGIC);
    write_superblock(bdev, sb, SuperWriteIntent::All)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;
    use crate::superblock::{read_superblock, read_superblock_copy, SuperReadMode};
    use crate::testutil::sample_superblock;

    #[test]
    fn test_write_all_fits_device() {
        let mut bdev = BlockDev::new(MemoryDevice::new(128 << 20)).unwrap();
        let mut sb = sample_superblock();
        let written = write_superblock(&mut bdev, &mut sb, SuperWriteIntent::All).unwrap();
        assert_eq!(written, 2);

        let backup = read_superblock_copy(&mut bdev, 1).unwrap();
        assert_eq!(backup.bytenr(), btrfs_sb_offset(1));
        assert_eq!(backup.generation(), sb.generation());
    }

    #[test]
    fn test_flush_around_primary() {
        let mut bdev = BlockDev::new(MemoryDevice::new(64 << 20)).unwrap();
        let mut sb = sample_superblock();
        write_superblock(&mut bdev, &mut sb, SuperWriteIntent::All).unwrap();
        assert_eq!(bdev.device().flushes(), 2);
    }

    #[test]
    fn test_too_small() {
        let mut bdev = BlockDev::new(MemoryDevice::new(32 << 10)).unwrap();
        let mut sb = sample_superblock();
        let err = write_superblock(&mut bdev, &mut sb, SuperWriteIntent::All).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_temp_super() {
        let mut bdev = BlockDev::new(MemoryDevice::new(64 << 20)).unwrap();
        let mut sb = sample_superblock();
        write_temp_super(&mut bdev, &mut sb, 0x50_0000).unwrap();

        let err = read_superblock(&mut bdev, BTRFS_SUPER_INFO_OFFSET, SuperReadMode::Primary)
            .unwrap_err();
        assert!(err.is_not_found());

        let tmp = read_superblock(&mut bdev, BTRFS_SUPER_INFO_OFFSET, SuperReadMode::Temporary)
            .unwrap();
        assert_eq!(tmp.root(), 0x50_0000);

        let mut sb = tmp;
        finalize_temp_super(&mut bdev, &mut sb).unwrap();
        let done = read_superblock(&mut bdev, BTRFS_SUPER_INFO_OFFSET, SuperReadMode::Primary)
            .unwrap();
        assert!(done.has_valid_magic());
    }
}
