//! 设备与设备集合
//!
//! 设备按 FSID 分组为 [`FsDevices`]。扫描状态保存在显式传递的 [`ScanContext`] 中，
//! 不存在进程级的全局设备表。

use crate::block::{BlockDev, DynBlockDevice};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::{read_superblock, SuperReadMode, Superblock};
use crate::types::DevItem;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// 一个成员设备
pub struct Device {
    /// 设备 ID
    pub devid: u64,
    /// 设备 UUID
    pub uuid: [u8; BTRFS_UUID_SIZE],
    /// 所属文件系统 FSID
    pub fsid: [u8; BTRFS_FSID_SIZE],
    /// 设备大小
    pub total_bytes: u64,
    /// 已分配字节数
    pub bytes_used: u64,
    /// I/O 对齐
    pub io_align: u32,
    /// I/O 宽度
    pub io_width: u32,
    /// 扇区大小
    pub sector_size: u32,
    /// 设备类型
    pub dev_type: u64,
    /// 设备项 generation
    pub generation: u64,
    /// 扫描到的 superblock generation（用于同 devid 择新）
    pub super_generation: u64,
    /// 是否可写
    pub writeable: bool,
    /// 是否缺失（chunk 引用了但未扫描到）
    pub missing: bool,
    /// 设备名（路径或调用方给定的标签）
    pub name: String,
    bdev: Option<BlockDev<DynBlockDevice>>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("devid", &self.devid)
            .field("name", &self.name)
            .field("total_bytes", &self.total_bytes)
            .field("writeable", &self.writeable)
            .field("missing", &self.missing)
            .finish()
    }
}

impl Device {
    /// 由扫描得到的 superblock 创建设备
    pub fn from_super(bdev: BlockDev<DynBlockDevice>, sb: &Superblock, name: String) -> Self {
        let item = sb.dev_item();
        let writeable = !bdev.is_read_only() && !sb.is_seeding();
        let mut dev = Self::placeholder(item.devid, item.uuid, sb.fsid());
        dev.apply_dev_item(&item);
        dev.super_generation = sb.generation();
        dev.writeable = writeable;
        dev.missing = false;
        dev.name = name;
        dev.bdev = Some(bdev);
        dev
    }

    /// chunk 引用了但没有扫描到的设备
    pub fn new_missing(devid: u64, uuid: [u8; BTRFS_UUID_SIZE], fsid: [u8; BTRFS_FSID_SIZE]) -> Self {
        Self::placeholder(devid, uuid, fsid)
    }

    fn placeholder(devid: u64, uuid: [u8; BTRFS_UUID_SIZE], fsid: [u8; BTRFS_FSID_SIZE]) -> Self {
        Self {
            devid,
            uuid,
            fsid,
            total_bytes: 0,
            bytes_used: 0,
            io_align: 0,
            io_width: 0,
            sector_size: 0,
            dev_type: 0,
            generation: 0,
            super_generation: 0,
            writeable: false,
            missing: true,
            name: String::new(),
            bdev: None,
        }
    }

    /// 用设备项更新（chunk tree 中的 DEV_ITEM）
    pub fn apply_dev_item(&mut self, item: &DevItem) {
        self.devid = item.devid;
        self.uuid = item.uuid;
        self.total_bytes = item.total_bytes;
        self.bytes_used = item.bytes_used;
        self.io_align = item.io_align;
        self.io_width = item.io_width;
        self.sector_size = item.sector_size;
        self.dev_type = item.dev_type;
        self.generation = item.generation;
    }

    /// 生成设备项（写 superblock 时刷新内嵌副本）
    pub fn to_dev_item(&self, fsid: &[u8; BTRFS_FSID_SIZE]) -> DevItem {
        DevItem {
            devid: self.devid,
            total_bytes: self.total_bytes,
            bytes_used: self.bytes_used,
            io_align: self.io_align,
            io_width: self.io_width,
            sector_size: self.sector_size,
            dev_type: self.dev_type,
            generation: self.generation,
            uuid: self.uuid,
            fsid: *fsid,
            ..Default::default()
        }
    }

    /// 是否打开了底层设备
    pub fn is_open(&self) -> bool {
        self.bdev.is_some()
    }

    /// 底层设备
    pub fn bdev(&mut self) -> Result<&mut BlockDev<DynBlockDevice>> {
        match self.bdev.as_mut() {
            Some(bdev) => Ok(bdev),
            None => {
                log::error!("[DEV] devid {} is missing", self.devid);
                Err(Error::new(ErrorKind::Io, "device is missing"))
            }
        }
    }

    /// 只读访问底层设备
    pub fn bdev_ref(&self) -> Option<&BlockDev<DynBlockDevice>> {
        self.bdev.as_ref()
    }

    /// 关闭并释放底层设备
    pub fn close(&mut self) -> Result<()> {
        match self.bdev.take() {
            Some(mut bdev) => bdev.close(),
            None => Ok(()),
        }
    }
}

/// 同一 FSID 的设备集合
#[derive(Debug)]
pub struct FsDevices {
    /// FSID
    pub fsid: [u8; BTRFS_FSID_SIZE],
    /// 树块头中使用的 FSID
    pub metadata_uuid: [u8; BTRFS_FSID_SIZE],
    /// 最新扫描到的 superblock generation
    pub latest_generation: u64,
    /// 是否为 seed 文件系统
    pub seeding: bool,
    /// chunk tree 中出现但未扫描到的设备数
    pub missing_devices: u64,
    /// 可写设备总字节数
    pub total_rw_bytes: u64,
    devices: BTreeMap<u64, Device>,
    seeds: Vec<FsDevices>,
}

impl FsDevices {
    /// 创建空集合
    pub fn new(fsid: [u8; BTRFS_FSID_SIZE], metadata_uuid: [u8; BTRFS_FSID_SIZE]) -> Self {
        Self {
            fsid,
            metadata_uuid,
            latest_generation: 0,
            seeding: false,
            missing_devices: 0,
            total_rw_bytes: 0,
            devices: BTreeMap::new(),
            seeds: Vec::new(),
        }
    }

    /// 加入设备；同 devid 已存在时保留 superblock generation 较新者
    ///
    /// 返回是否替换/加入了该设备。
    pub fn add_device(&mut self, dev: Device) -> bool {
        self.latest_generation = self.latest_generation.max(dev.super_generation);
        match self.devices.get(&dev.devid) {
            Some(old) if !old.missing && old.super_generation >= dev.super_generation => {
                log::debug!(
                    "[DEV] keeping devid {} generation {} over {}",
                    old.devid,
                    old.super_generation,
                    dev.super_generation
                );
                false
            }
            _ => {
                self.devices.insert(dev.devid, dev);
                true
            }
        }
    }

    /// 按 devid 查找（不含 seed）
    pub fn device(&self, devid: u64) -> Option<&Device> {
        self.devices.get(&devid)
    }

    /// 按 devid 查找（不含 seed）
    pub fn device_mut(&mut self, devid: u64) -> Option<&mut Device> {
        self.devices.get_mut(&devid)
    }

    /// 在本集合与全部 seed 中查找设备
    ///
    /// `uuid` / `fsid` 为 None 时不比较。
    pub fn find_device(
        &self,
        devid: u64,
        uuid: Option<&[u8; BTRFS_UUID_SIZE]>,
        fsid: Option<&[u8; BTRFS_FSID_SIZE]>,
    ) -> Option<&Device> {
        self.all().find_map(|set| {
            if fsid.map_or(false, |f| *f != set.fsid) {
                return None;
            }
            set.devices
                .get(&devid)
                .filter(|d| uuid.map_or(true, |u| d.uuid == *u))
        })
    }

    /// 可变版本的 [`FsDevices::find_device`]
    pub fn find_device_mut(
        &mut self,
        devid: u64,
        uuid: Option<&[u8; BTRFS_UUID_SIZE]>,
        fsid: Option<&[u8; BTRFS_FSID_SIZE]>,
    ) -> Option<&mut Device> {
        if fsid.map_or(true, |f| *f == self.fsid) {
            let hit = self
                .devices
                .get(&devid)
                .map_or(false, |d| uuid.map_or(true, |u| d.uuid == *u));
            if hit {
                return self.devices.get_mut(&devid);
            }
        }
        self.seeds
            .iter_mut()
            .find_map(|seed| seed.find_device_mut(devid, uuid, fsid))
    }

    /// 本集合及其 seed（按加入顺序，seed 的 seed 紧随其后）
    pub fn all(&self) -> impl Iterator<Item = &FsDevices> {
        let mut out: Vec<&FsDevices> = Vec::new();
        let mut stack: Vec<&FsDevices> = alloc::vec![self];
        while let Some(set) = stack.pop() {
            out.push(set);
            stack.extend(set.seeds.iter().rev());
        }
        out.into_iter()
    }

    /// 本集合的设备
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// 本集合的设备（可变）
    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    /// 本集合设备数
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// seed 序列
    pub fn seeds(&self) -> &[FsDevices] {
        &self.seeds
    }

    /// 按 FSID 查找已挂接的 seed（递归）
    pub fn seed_mut(&mut self, fsid: &[u8; BTRFS_FSID_SIZE]) -> Option<&mut FsDevices> {
        for seed in self.seeds.iter_mut() {
            if seed.fsid == *fsid {
                return Some(seed);
            }
            if let Some(found) = seed.seed_mut(fsid) {
                return Some(found);
            }
        }
        None
    }

    /// 是否已经挂接了某个 seed
    pub fn has_seed(&self, fsid: &[u8; BTRFS_FSID_SIZE]) -> bool {
        self.all().skip(1).any(|s| s.fsid == *fsid)
    }

    /// 挂接 seed 集合
    pub fn push_seed(&mut self, mut seed: FsDevices) {
        seed.seeding = true;
        for dev in seed.devices.values_mut() {
            dev.writeable = false;
        }
        log::info!("[DEV] attached seed filesystem with {} devices", seed.devices.len());
        self.seeds.push(seed);
    }

    /// 所有 FSID（本集合 + seed）
    pub fn fsids(&self) -> Vec<[u8; BTRFS_FSID_SIZE]> {
        self.all().map(|s| s.fsid).collect()
    }

    /// 关闭全部设备（含 seed）
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for dev in self.devices.values_mut() {
            if let Err(e) = dev.close() {
                log::error!("[DEV] failed to close devid {}: {}", dev.devid, e);
                first_err.get_or_insert(e);
            }
        }
        for seed in self.seeds.iter_mut() {
            if let Err(e) = seed.close_all() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 合并两个设备集合
///
/// 按 devid 求并集，冲突时保留 superblock generation 较新的设备，seed 序列按顺序拼接
/// 并去重。结果与合并顺序无关（generation 相同时保留 `base` 中的设备）。
pub fn splice_device_list(base: &mut FsDevices, other: FsDevices) {
    let FsDevices {
        devices,
        seeds,
        latest_generation,
        missing_devices,
        ..
    } = other;

    for dev in devices.into_values() {
        base.add_device(dev);
    }
    base.latest_generation = base.latest_generation.max(latest_generation);
    base.missing_devices = base.missing_devices.max(missing_devices);

    for seed in seeds {
        if let Some(pos) = base.seeds.iter().position(|s| s.fsid == seed.fsid) {
            splice_device_list(&mut base.seeds[pos], seed);
        } else {
            base.seeds.push(seed);
        }
    }
}

/// 设备扫描上下文
///
/// 打开文件系统前登记所有候选设备，按 FSID 分组。
#[derive(Debug, Default)]
pub struct ScanContext {
    groups: BTreeMap<[u8; BTRFS_FSID_SIZE], FsDevices>,
}

impl ScanContext {
    /// 创建空上下文
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个设备
    ///
    /// 读取设备的 superblock（`mode` 决定是否扫描备份副本），按 FSID 归组。
    ///
    /// # 返回
    ///
    /// 设备所属文件系统的 FSID
    pub fn register_device(
        &mut self,
        device: DynBlockDevice,
        name: &str,
        mode: SuperReadMode,
    ) -> Result<[u8; BTRFS_FSID_SIZE]> {
        let mut bdev = BlockDev::new(device)?;
        bdev.open()?;
        let sb = read_superblock(&mut bdev, BTRFS_SUPER_INFO_OFFSET, mode).map_err(|e| {
            log::debug!("[DEV] {} is not a btrfs device: {}", name, e);
            e
        })?;
        Ok(self.register_super(bdev, &sb, name))
    }

    /// 以已读出的 superblock 登记设备
    pub fn register_super(
        &mut self,
        bdev: BlockDev<DynBlockDevice>,
        sb: &Superblock,
        name: &str,
    ) -> [u8; BTRFS_FSID_SIZE] {
        let fsid = sb.fsid();
        let group = self
            .groups
            .entry(fsid)
            .or_insert_with(|| FsDevices::new(fsid, sb.metadata_uuid()));
        group.seeding |= sb.is_seeding();
        let devid = sb.dev_item().devid;
        if group.add_device(Device::from_super(bdev, sb, String::from(name))) {
            log::debug!(
                "[DEV] registered {} devid {} generation {}",
                name,
                devid,
                sb.generation()
            );
        }
        fsid
    }

    /// 查找 seed 文件系统（纯查询）
    pub fn resolve_seed(&self, fsid: &[u8; BTRFS_FSID_SIZE]) -> Option<&FsDevices> {
        self.groups.get(fsid)
    }

    /// 取出一个设备集合
    pub fn take(&mut self, fsid: &[u8; BTRFS_FSID_SIZE]) -> Option<FsDevices> {
        self.groups.remove(fsid)
    }

    /// 已登记的 FSID
    pub fn fsids(&self) -> impl Iterator<Item = &[u8; BTRFS_FSID_SIZE]> {
        self.groups.keys()
    }

    /// 分组数
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// 确保 `fsid` 对应的 seed 已挂接到 `fs_devices`
///
/// 已挂接时直接返回；否则从扫描上下文中取出并挂接。找不到时返回 `NotFound`。
pub fn open_seed_devices(
    fs_devices: &mut FsDevices,
    ctx: &mut ScanContext,
    fsid: &[u8; BTRFS_FSID_SIZE],
) -> Result<()> {
    if fs_devices.has_seed(fsid) {
        return Ok(());
    }
    if ctx.resolve_seed(fsid).is_none() {
        log::error!("[DEV] seed filesystem not found among scanned devices");
        return Err(Error::new(ErrorKind::NotFound, "seed devices not found"));
    }
    if let Some(seed) = ctx.take(fsid) {
        fs_devices.push_seed(seed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;
    use crate::superblock::{write_superblock, SuperWriteIntent};
    use crate::testutil::sample_superblock;
    use alloc::boxed::Box;

    fn device_for(sb: &Superblock) -> DynBlockDevice {
        let mut bdev = BlockDev::new(MemoryDevice::new(8 << 20)).unwrap();
        let mut sb = sb.clone();
        write_superblock(&mut bdev, &mut sb, SuperWriteIntent::Primary).unwrap();
        Box::new(bdev.into_inner())
    }

    fn super_with(devid: u64, generation: u64, fsid: [u8; 16]) -> Superblock {
        let mut sb = sample_superblock();
        sb.set_fsid(&fsid);
        sb.set_generation(generation);
        let mut item = sb.dev_item();
        item.devid = devid;
        item.fsid = fsid;
        item.uuid = [devid as u8; 16];
        sb.set_dev_item(&item);
        sb
    }

    #[test]
    fn test_register_groups_by_fsid() {
        let mut ctx = ScanContext::new();
        let a = ctx
            .register_device(device_for(&super_with(1, 5, [1; 16])), "a", SuperReadMode::Primary)
            .unwrap();
        let b = ctx
            .register_device(device_for(&super_with(2, 5, [1; 16])), "b", SuperReadMode::Primary)
            .unwrap();
        let c = ctx
            .register_device(device_for(&super_with(1, 3, [2; 16])), "c", SuperReadMode::Primary)
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.resolve_seed(&[1; 16]).unwrap().num_devices(), 2);
    }

    #[test]
    fn test_register_rejects_blank_device() {
        let mut ctx = ScanContext::new();
        let err = ctx
            .register_device(Box::new(MemoryDevice::new(1 << 20)), "blank", SuperReadMode::Primary)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_newer_generation_wins() {
        let mut ctx = ScanContext::new();
        ctx.register_device(device_for(&super_with(1, 5, [1; 16])), "old", SuperReadMode::Primary)
            .unwrap();
        ctx.register_device(device_for(&super_with(1, 8, [1; 16])), "new", SuperReadMode::Primary)
            .unwrap();
        ctx.register_device(device_for(&super_with(1, 6, [1; 16])), "mid", SuperReadMode::Primary)
            .unwrap();

        let set = ctx.take(&[1; 16]).unwrap();
        assert_eq!(set.device(1).unwrap().name, "new");
        assert_eq!(set.latest_generation, 8);
    }

    #[test]
    fn test_splice_is_union() {
        let fsid = [3; 16];
        let mut left = FsDevices::new(fsid, fsid);
        let mut right = FsDevices::new(fsid, fsid);
        left.add_device(Device::new_missing(1, [1; 16], fsid));
        right.add_device(Device::new_missing(2, [2; 16], fsid));
        right.push_seed(FsDevices::new([4; 16], [4; 16]));

        splice_device_list(&mut left, right);
        assert_eq!(left.num_devices(), 2);
        assert_eq!(left.seeds().len(), 1);
        assert_eq!(left.fsids(), alloc::vec![[3; 16], [4; 16]]);
    }

    #[test]
    fn test_find_device_in_seed() {
        let mut ctx = ScanContext::new();
        ctx.register_device(device_for(&super_with(1, 5, [7; 16])), "seed", SuperReadMode::Primary)
            .unwrap();

        let mut fs = FsDevices::new([8; 16], [8; 16]);
        assert!(open_seed_devices(&mut fs, &mut ctx, &[9; 16]).is_err());
        open_seed_devices(&mut fs, &mut ctx, &[7; 16]).unwrap();
        // 再次挂接为空操作
        open_seed_devices(&mut fs, &mut ctx, &[7; 16]).unwrap();
        assert_eq!(fs.seeds().len(), 1);

        let dev = fs.find_device(1, Some(&[1; 16]), None).unwrap();
        assert!(!dev.writeable);
        assert!(fs.find_device(1, Some(&[2; 16]), None).is_none());
        assert!(fs.find_device(1, None, Some(&[8; 16])).is_none());
        assert!(fs.find_device_mut(1, None, Some(&[7; 16])).is_some());
    }
}
