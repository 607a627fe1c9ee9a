//! Superblock 读取和验证

use super::{checksum, Superblock};
use crate::{
    block::{BlockDev, BlockDevice},
    consts::*,
    csum::CsumType,
    error::{Error, ErrorKind, Result},
    types::{ChunkItem, Key, Stripe},
};

/// superblock 读取模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuperReadMode {
    /// 只读主副本（64 KiB）
    #[default]
    Primary,
    /// 扫描全部副本，选 generation 最高的有效副本
    Recover,
    /// 只读主副本，接受 mkfs 临时魔数
    Temporary,
}

/// 从块设备读取 superblock
///
/// `offset` 不是主副本偏移时只读取并验证该副本；否则按 `mode` 处理。
///
/// # 参数
///
/// * `bdev` - 块设备引用
/// * `offset` - superblock 字节偏移（通常为 `BTRFS_SUPER_INFO_OFFSET`）
/// * `mode` - 读取模式
///
/// # 返回
///
/// 成功返回 superblock；副本不存在（短读、无魔数）返回 `NotFound`，
/// 副本损坏返回 `Corrupted`
pub fn read_superblock<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    offset: u64,
    mode: SuperReadMode,
) -> Result<Superblock> {
    if offset != BTRFS_SUPER_INFO_OFFSET || mode != SuperReadMode::Recover {
        return read_one_copy(bdev, offset, mode);
    }

    let mut best: Option<Superblock> = None;
    let mut fsid: Option<[u8; BTRFS_FSID_SIZE]> = None;
    let mut found_magic = false;

    for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
        let bytenr = btrfs_sb_offset(mirror);
        let sb = match read_raw(bdev, bytenr)? {
            Some(sb) => sb,
            None => break,
        };

        if sb.bytenr() != bytenr {
            log::debug!(
                "[SUPER] mirror {} bytenr mismatch: have {:#x} expect {:#x}",
                mirror,
                sb.bytenr(),
                bytenr
            );
            continue;
        }
        // 主副本魔数被清零说明设备已从文件系统中移除
        if sb.magic() == 0 && mirror == 0 {
            break;
        }
        found_magic |= sb.has_valid_magic();

        if let Err(e) = check_super(&sb, mode) {
            log::warn!("[SUPER] skipping invalid copy at {:#x}: {}", bytenr, e);
            continue;
        }

        let copy_fsid = sb.metadata_uuid();
        match fsid {
            None => fsid = Some(copy_fsid),
            Some(first) if first != copy_fsid => {
                log::warn!("[SUPER] copy at {:#x} belongs to another filesystem", bytenr);
                continue;
            }
            Some(_) => {}
        }

        if best.as_ref().map_or(true, |b| sb.generation() > b.generation()) {
            log::debug!(
                "[SUPER] mirror {} generation {} is newest so far",
                mirror,
                sb.generation()
            );
            best = Some(sb);
        }
    }

    match best {
        Some(sb) => Ok(sb),
        None if found_magic => Err(Error::new(
            ErrorKind::Corrupted,
            "no valid superblock copy found",
        )),
        None => Err(Error::new(ErrorKind::NotFound, "no btrfs superblock found")),
    }
}

/// 读取第 `mirror` 个副本（0..3）
pub fn read_superblock_copy<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    mirror: usize,
) -> Result<Superblock> {
    if mirror >= BTRFS_SUPER_MIRROR_MAX {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid superblock mirror"));
    }
    read_one_copy(bdev, btrfs_sb_offset(mirror), SuperReadMode::Primary)
}

/// 读原始 4 KiB；短读返回 None
fn read_raw<D: BlockDevice>(bdev: &mut BlockDev<D>, offset: u64) -> Result<Option<Superblock>> {
    let mut sb = Superblock::default();
    let n = bdev.read_at(offset, sb.as_bytes_mut())?;
    if n < BTRFS_SUPER_INFO_SIZE {
        return Ok(None);
    }
    Ok(Some(sb))
}

fn read_one_copy<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    offset: u64,
    mode: SuperReadMode,
) -> Result<Superblock> {
    let sb = read_raw(bdev, offset)?
        .ok_or(Error::new(ErrorKind::NotFound, "superblock beyond end of device"))?;

    let magic_ok = match mode {
        SuperReadMode::Temporary => sb.has_temporary_magic() || sb.has_valid_magic(),
        _ => sb.has_valid_magic(),
    };
    if !magic_ok {
        return Err(Error::new(ErrorKind::NotFound, "no btrfs magic at superblock offset"));
    }
    if sb.bytenr() != offset {
        log::error!(
            "[SUPER] bytenr mismatch at {:#x}: superblock says {:#x}",
            offset,
            sb.bytenr()
        );
        return Err(Error::new(ErrorKind::Io, "superblock bytenr mismatch"));
    }
    check_super(&sb, mode)?;
    Ok(sb)
}

fn is_power_of_two(val: u32) -> bool {
    val != 0 && val & (val - 1) == 0
}

/// 验证 superblock 的完整性
///
/// 依次检查：魔数、校验算法、校验和、层级、大小参数、对齐、设备数、系统 chunk 数组、
/// 内嵌设备项的 FSID。generation 异常只记录警告。
pub fn check_super(sb: &Superblock, mode: SuperReadMode) -> Result<()> {
    let corrupted = |msg: &'static str| {
        log::error!("[SUPER] {}", msg);
        Err(Error::new(ErrorKind::Corrupted, msg))
    };

    // 1. 魔数
    let magic_ok = match mode {
        SuperReadMode::Temporary => sb.has_temporary_magic() || sb.has_valid_magic(),
        _ => sb.has_valid_magic(),
    };
    if !magic_ok {
        return corrupted("superblock magic doesn't match");
    }

    // 2. 校验算法与校验和
    let csum = CsumType::from_raw(sb.csum_type_raw())?;
    if !checksum::verify_checksum(sb) {
        log::error!("[SUPER] {} checksum mismatch at {:#x}", csum, sb.bytenr());
        return corrupted("superblock checksum mismatch");
    }

    // 3. 层级
    if sb.root_level() >= BTRFS_MAX_LEVEL {
        return corrupted("tree_root level too big");
    }
    if sb.chunk_root_level() >= BTRFS_MAX_LEVEL {
        return corrupted("chunk_root level too big");
    }
    if sb.log_root_level() >= BTRFS_MAX_LEVEL {
        return corrupted("log_root level too big");
    }

    // 4. 大小参数
    let sectorsize = sb.sectorsize();
    if !is_power_of_two(sectorsize)
        || sectorsize < BTRFS_MIN_SECTORSIZE
        || sectorsize > BTRFS_MAX_METADATA_BLOCKSIZE
    {
        return corrupted("invalid sectorsize");
    }
    let nodesize = sb.nodesize();
    if !is_power_of_two(nodesize)
        || nodesize < sectorsize
        || nodesize > BTRFS_MAX_METADATA_BLOCKSIZE
    {
        return corrupted("invalid nodesize");
    }
    if nodesize != sb.leafsize() {
        return corrupted("nodesize doesn't match leafsize");
    }

    // 5. 对齐
    let align = sectorsize as u64;
    if sb.root() % align != 0 {
        return corrupted("tree_root block unaligned");
    }
    if sb.chunk_root() % align != 0 {
        return corrupted("chunk_root block unaligned");
    }
    if sb.log_root() % align != 0 {
        return corrupted("log_root block unaligned");
    }

    // 6. 内嵌设备项必须属于本文件系统
    if sb.dev_item().fsid != sb.metadata_uuid() {
        return corrupted("dev_item UUID does not match metadata fsid");
    }

    // 7. generation 只做告警
    if sb.generation() != 0 && sb.chunk_root_generation() > sb.generation() {
        log::warn!(
            "[SUPER] suspicious: chunk_root_generation {} > generation {}",
            sb.chunk_root_generation(),
            sb.generation()
        );
    }
    if sb.cache_generation() != u64::MAX && sb.cache_generation() > sb.generation() {
        log::warn!(
            "[SUPER] suspicious: cache_generation {} > generation {}",
            sb.cache_generation(),
            sb.generation()
        );
    }

    // 8. 设备数与容量
    if sb.num_devices() == 0 {
        return corrupted("number of devices is 0");
    }
    if sb.total_bytes() == 0 {
        return corrupted("total_bytes is 0");
    }

    // 9. 系统 chunk 数组
    let sys_size = sb.sys_chunk_array_size() as usize;
    if sys_size > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
        return corrupted("system chunk array too big");
    }
    if sys_size < Key::SIZE + ChunkItem::FIXED_SIZE + Stripe::SIZE {
        return corrupted("system chunk array too small");
    }

    Ok(())
}
