//! chunk 项与设备项的加载
//!
//! superblock 内嵌的 sys chunk array 给出 SYSTEM chunk，足以读取 chunk tree；
//! chunk tree 中的 CHUNK_ITEM 与 DEV_ITEM 再补全整张映射表和设备集合。

use super::device::{open_seed_devices, Device, FsDevices, ScanContext};
use super::map::{ChunkMap, MapLookup};
use super::profile::RaidProfile;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::Superblock;
use crate::types::{ChunkItem, DevItem, Key, Stripe};

/// 校验一个 chunk 项
///
/// # 参数
///
/// * `chunk` - chunk 项
/// * `logical` - 键中的逻辑起点
/// * `sectorsize` - 文件系统扇区大小
/// * `from_sys_array` - 是否来自 superblock 的 sys chunk array（额外限制大小）
pub fn check_chunk_valid(
    chunk: &ChunkItem,
    logical: u64,
    sectorsize: u32,
    from_sys_array: bool,
) -> Result<()> {
    let num_stripes = chunk.stripes.len();
    let sectorsize = sectorsize as u64;

    let fail = |what: &'static str| {
        log::error!("[CHUNK] invalid chunk at logical {:#x}: {}", logical, what);
        Err(Error::new(ErrorKind::Corrupted, what))
    };

    if num_stripes == 0 {
        return fail("chunk has no stripes");
    }
    if from_sys_array && ChunkItem::item_size(num_stripes) > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
        return fail("chunk item too large for sys array");
    }
    if sectorsize == 0 || logical % sectorsize != 0 {
        return fail("unaligned chunk logical start");
    }
    if chunk.sector_size as u64 != sectorsize {
        return fail("chunk sector size mismatch");
    }
    if chunk.length == 0 || chunk.length % sectorsize != 0 {
        return fail("unaligned chunk length");
    }
    if chunk.stripe_len != BTRFS_STRIPE_LEN {
        return fail("invalid chunk stripe length");
    }
    if chunk.chunk_type & !(BTRFS_BLOCK_GROUP_TYPE_MASK | BTRFS_BLOCK_GROUP_PROFILE_MASK) != 0 {
        return fail("unknown chunk type bits");
    }
    if chunk.chunk_type & BTRFS_BLOCK_GROUP_TYPE_MASK == 0 {
        return fail("chunk has no type bit");
    }
    let profile = match RaidProfile::from_flags(chunk.chunk_type) {
        Ok(p) => p,
        Err(_) => return fail("conflicting chunk profile bits"),
    };
    if !profile.stripes_valid(num_stripes as u16, chunk.sub_stripes) {
        return fail("stripe count does not match profile");
    }
    Ok(())
}

/// 把一个 chunk 加入映射表
///
/// 已有 chunk 覆盖该逻辑地址时直接跳过（sys array 与 chunk tree 会重复描述 SYSTEM chunk）。
/// 条带引用的设备未扫描到时登记为缺失设备。
pub fn read_one_chunk(
    sb: &Superblock,
    key: &Key,
    chunk: &ChunkItem,
    map: &mut ChunkMap,
    fs_devices: &mut FsDevices,
    from_sys_array: bool,
) -> Result<()> {
    let logical = key.offset;
    check_chunk_valid(chunk, logical, sb.sectorsize(), from_sys_array)?;

    if map.lookup(logical).is_some() {
        return Ok(());
    }

    for stripe in &chunk.stripes {
        ensure_stripe_device(stripe, fs_devices);
    }

    map.insert(MapLookup::from_chunk(logical, chunk))?;
    log::debug!(
        "[CHUNK] mapped [{:#x}, {:#x}) {} x{}",
        logical,
        logical + chunk.length,
        RaidProfile::from_flags(chunk.chunk_type).unwrap_or(RaidProfile::Single),
        chunk.stripes.len()
    );
    Ok(())
}

fn ensure_stripe_device(stripe: &Stripe, fs_devices: &mut FsDevices) {
    if fs_devices
        .find_device(stripe.devid, Some(&stripe.dev_uuid), None)
        .is_some()
    {
        return;
    }
    log::warn!("[CHUNK] devid {} missing, using placeholder", stripe.devid);
    let fsid = fs_devices.fsid;
    fs_devices.add_device(Device::new_missing(stripe.devid, stripe.dev_uuid, fsid));
    fs_devices.missing_devices += 1;
}

/// 解析 superblock 中的 sys chunk array
///
/// 数组是 `(key, chunk)` 的紧密序列，只允许 CHUNK_ITEM 键。
pub fn read_sys_array(sb: &Superblock, map: &mut ChunkMap, fs_devices: &mut FsDevices) -> Result<()> {
    let array = sb.sys_chunk_array();
    let mut cur = 0usize;

    while cur < array.len() {
        if array.len() - cur < Key::SIZE {
            log::error!("[CHUNK] sys array short read at offset {}", cur);
            return Err(Error::new(ErrorKind::Io, "sys chunk array truncated"));
        }
        let key = Key::read(&array[cur..]);
        cur += Key::SIZE;

        if key.item_type != BTRFS_CHUNK_ITEM_KEY {
            log::error!(
                "[CHUNK] unexpected item type {} in sys array at offset {}",
                key.item_type,
                cur - Key::SIZE
            );
            return Err(Error::new(ErrorKind::Io, "unexpected key type in sys chunk array"));
        }

        let (chunk, used) = ChunkItem::parse(&array[cur..]).map_err(|e| {
            log::error!("[CHUNK] invalid sys array chunk at offset {}: {}", cur, e);
            Error::new(ErrorKind::Io, "invalid chunk in sys chunk array")
        })?;
        read_one_chunk(sb, &key, &chunk, map, fs_devices, true)?;
        cur += used;
    }
    Ok(())
}

/// 应用 chunk tree 中的一个设备项
///
/// 设备项的 fsid 与文件系统不同时说明它属于 seed 文件系统，先从扫描上下文挂接 seed。
pub fn read_one_dev(
    item: &DevItem,
    fs_devices: &mut FsDevices,
    ctx: &mut ScanContext,
) -> Result<()> {
    let fs_fsid = fs_devices.metadata_uuid;
    if item.fsid != fs_fsid && item.fsid != fs_devices.fsid {
        open_seed_devices(fs_devices, ctx, &item.fsid)?;
    }

    let target = if item.fsid == fs_fsid {
        fs_devices.fsid
    } else {
        item.fsid
    };
    if fs_devices
        .find_device(item.devid, Some(&item.uuid), Some(&target))
        .is_none()
    {
        log::warn!("[CHUNK] devid {} not found, adding missing device", item.devid);
        fs_devices.missing_devices += 1;
        insert_into_set(fs_devices, Device::new_missing(item.devid, item.uuid, target));
    }

    let dev = fs_devices
        .find_device_mut(item.devid, Some(&item.uuid), Some(&target))
        .ok_or(Error::new(ErrorKind::NotFound, "device not found"))?;

    dev.apply_dev_item(item);
    let writeable = dev.writeable;
    if writeable {
        fs_devices.total_rw_bytes += item.total_bytes;
    }
    Ok(())
}

fn insert_into_set(fs_devices: &mut FsDevices, dev: Device) {
    if dev.fsid == fs_devices.fsid {
        fs_devices.add_device(dev);
        return;
    }
    if let Some(seed) = fs_devices.seed_mut(&dev.fsid) {
        seed.add_device(dev);
    } else {
        fs_devices.add_device(dev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_superblock, sys_chunk, FSID};

    #[test]
    fn test_check_chunk_valid() {
        let good = sys_chunk(0x10_0000, 4 << 20, 0x10_0000);
        check_chunk_valid(&good, 0x10_0000, 4096, true).unwrap();

        let mut bad = good.clone();
        bad.stripe_len = 4096;
        assert!(check_chunk_valid(&bad, 0x10_0000, 4096, false).is_err());

        let mut bad = good.clone();
        bad.chunk_type = 0;
        assert!(check_chunk_valid(&bad, 0x10_0000, 4096, false).is_err());

        let mut bad = good.clone();
        bad.chunk_type |= BTRFS_BLOCK_GROUP_DUP;
        // DUP 需要两个条带
        assert!(check_chunk_valid(&bad, 0x10_0000, 4096, false).is_err());
        bad.stripes.push(bad.stripes[0]);
        check_chunk_valid(&bad, 0x10_0000, 4096, false).unwrap();

        assert!(check_chunk_valid(&good, 0x10_0200, 4096, false).is_err());

        let mut bad = good.clone();
        bad.length = 1000;
        assert!(check_chunk_valid(&bad, 0x10_0000, 4096, false).is_err());

        let mut bad = good;
        bad.stripes.clear();
        assert!(check_chunk_valid(&bad, 0x10_0000, 4096, false).is_err());
    }

    #[test]
    fn test_read_sys_array() {
        let sb = sample_superblock();
        let mut map = ChunkMap::new();
        let mut devs = FsDevices::new(FSID, FSID);
        read_sys_array(&sb, &mut map, &mut devs).unwrap();

        assert_eq!(map.len(), 1);
        let chunk = map.lookup(0x10_0000).unwrap();
        assert_eq!(chunk.size, 4 << 20);
        assert_ne!(chunk.chunk_type & BTRFS_BLOCK_GROUP_SYSTEM, 0);
        // 没有扫描到设备，devid 1 为缺失占位
        assert_eq!(devs.missing_devices, 1);
        assert!(devs.device(1).unwrap().missing);
    }

    #[test]
    fn test_sys_array_rejects_other_keys() {
        let mut sb = sample_superblock();
        sb.sys_chunk_array_mut()[8] = BTRFS_DEV_ITEM_KEY;
        let mut map = ChunkMap::new();
        let mut devs = FsDevices::new(FSID, FSID);
        let err = read_sys_array(&sb, &mut map, &mut devs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_sys_array_truncated() {
        let mut sb = sample_superblock();
        let size = sb.sys_chunk_array_size();
        sb.set_sys_chunk_array_size(size - 8);
        let mut map = ChunkMap::new();
        let mut devs = FsDevices::new(FSID, FSID);
        let err = read_sys_array(&sb, &mut map, &mut devs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_read_one_chunk_duplicate_and_overlap() {
        let sb = sample_superblock();
        let mut map = ChunkMap::new();
        let mut devs = FsDevices::new(FSID, FSID);
        let key = Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0x10_0000);
        let chunk = sys_chunk(0x10_0000, 4 << 20, 0x10_0000);

        read_one_chunk(&sb, &key, &chunk, &mut map, &mut devs, false).unwrap();
        // 同一个 chunk 再来一次是空操作
        read_one_chunk(&sb, &key, &chunk, &mut map, &mut devs, false).unwrap();
        assert_eq!(map.len(), 1);

        // 起点在现有 chunk 之前但尾部重叠
        let key2 = Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0);
        let chunk2 = sys_chunk(0, 2 << 20, 0x80_0000);
        let err = read_one_chunk(&sb, &key2, &chunk2, &mut map, &mut devs, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_read_one_dev_updates_device() {
        let sb = sample_superblock();
        let mut devs = FsDevices::new(FSID, FSID);
        let mut ctx = ScanContext::new();
        let mut item = sb.dev_item();
        item.total_bytes = 123 << 20;

        read_one_dev(&item, &mut devs, &mut ctx).unwrap();
        let dev = devs.device(1).unwrap();
        assert!(dev.missing);
        assert_eq!(dev.total_bytes, 123 << 20);
        assert_eq!(devs.missing_devices, 1);
    }

    #[test]
    fn test_read_one_dev_unknown_seed() {
        let sb = sample_superblock();
        let mut devs = FsDevices::new(FSID, FSID);
        let mut ctx = ScanContext::new();
        let mut item = sb.dev_item();
        item.fsid = [0xee; 16];
        let err = read_one_dev(&item, &mut devs, &mut ctx).unwrap_err();
        assert!(err.is_not_found());
    }
}
