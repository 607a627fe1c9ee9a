//! 打开文件系统
//!
//! 顺序：设备集合 → superblock 与特性检查 → sys chunk array → chunk tree →
//! block group tree → root tree → 全局根 → 其余根。
//!
//! 设置 `PARTIAL` 时，必需树根读取失败会得到一个内容无效的占位根，可选树根（uuid、quota）
//! 直接缺席；否则任何一个失败都会使打开失败。

use super::features::check_features;
use super::fs_info::FsInfo;
use super::root::Root;
use super::types::{FsConfig, OpenFlags};
use crate::block::DynBlockDevice;
use crate::consts::*;
use crate::ctree::{find_root_item, walk_items};
use crate::disk_io;
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::{find_best_backup_root, read_superblock, SuperReadMode, Superblock};
use crate::types::{ChunkItem, DevItem, Key, RootItem};
use crate::volumes::{read_one_chunk, read_one_dev, read_sys_array, FsDevices, ScanContext};
use alloc::string::String;
use alloc::vec::Vec;

/// 一个树根读取失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootKind {
    /// 必需：PARTIAL 下用占位根
    Required,
    /// 可选：PARTIAL 下缺席
    Optional,
}

fn super_read_mode(flags: OpenFlags) -> SuperReadMode {
    if flags.contains(OpenFlags::RECOVER_SUPER) {
        SuperReadMode::Recover
    } else if flags.contains(OpenFlags::TEMPORARY_SUPER) {
        SuperReadMode::Temporary
    } else {
        SuperReadMode::Primary
    }
}

impl FsInfo {
    /// 打开扫描上下文中唯一的（非 seed）文件系统
    ///
    /// 上下文中有多个非 seed 文件系统时返回 `InvalidInput`，此时用 [`FsInfo::open_fsid`]。
    pub fn open(ctx: ScanContext, flags: OpenFlags, config: FsConfig) -> Result<Self> {
        let candidates: Vec<[u8; BTRFS_FSID_SIZE]> = ctx
            .fsids()
            .filter(|fsid| ctx.resolve_seed(fsid).map_or(false, |set| !set.seeding))
            .copied()
            .collect();
        let fsid = match candidates.as_slice() {
            [fsid] => *fsid,
            [] => {
                // 只有 seed 文件系统时直接打开它
                let first = ctx.fsids().next().copied();
                first.ok_or(Error::new(ErrorKind::NotFound, "no btrfs device scanned"))?
            }
            _ => {
                log::error!("[OPEN] more than one filesystem among scanned devices");
                return Err(Error::new(ErrorKind::InvalidInput, "ambiguous filesystem"));
            }
        };
        Self::open_fsid(ctx, &fsid, flags, config)
    }

    /// 打开扫描上下文中 FSID 为 `fsid` 的文件系统
    pub fn open_fsid(
        mut ctx: ScanContext,
        fsid: &[u8; BTRFS_FSID_SIZE],
        flags: OpenFlags,
        config: FsConfig,
    ) -> Result<Self> {
        let mut fs_devices = ctx
            .take(fsid)
            .ok_or(Error::new(ErrorKind::NotFound, "filesystem not scanned"))?;

        let mut sb = read_latest_super(&mut fs_devices, flags)?;
        check_features(&mut sb, flags)?;
        if flags.contains(OpenFlags::WRITES) && sb.is_seeding() {
            log::error!("[OPEN] seed filesystem cannot be opened read-write");
            return Err(Error::new(ErrorKind::Unsupported, "seed filesystem is read-only"));
        }

        let mut fs = FsInfo::new(fs_devices, ctx, sb, flags, config)?;
        log::info!(
            "[OPEN] generation {} nodesize {} sectorsize {} csum {}",
            fs.generation,
            fs.nodesize,
            fs.sectorsize,
            fs.csum_type
        );

        read_sys_array(&fs.super_copy, &mut fs.chunk_map, &mut fs.fs_devices)?;
        fs.setup_chunk_tree()?;
        fs.setup_block_group_tree()?;
        fs.setup_root_tree()?;
        fs.setup_global_roots()?;

        fs.load_tree_root(BTRFS_DEV_TREE_OBJECTID, RootKind::Required)?;
        fs.load_tree_root(BTRFS_FS_TREE_OBJECTID, RootKind::Required)?;
        fs.load_tree_root(BTRFS_UUID_TREE_OBJECTID, RootKind::Optional)?;
        fs.load_tree_root(BTRFS_QUOTA_TREE_OBJECTID, RootKind::Optional)?;
        fs.setup_log_root()?;

        log::info!(
            "[OPEN] opened with {} chunks, {} roots, {} missing devices",
            fs.chunk_map.len(),
            fs.roots.len(),
            fs.fs_devices.missing_devices
        );
        Ok(fs)
    }

    /// 用一组设备打开文件系统
    ///
    /// 每个元素是设备和它的名字（仅用于日志）。
    pub fn open_devices(
        devices: Vec<(DynBlockDevice, String)>,
        flags: OpenFlags,
        config: FsConfig,
    ) -> Result<Self> {
        let mode = super_read_mode(flags);
        let mut ctx = ScanContext::new();
        for (device, name) in devices {
            ctx.register_device(device, &name, mode)?;
        }
        Self::open(ctx, flags, config)
    }

    /// 打开镜像文件或块设备节点
    #[cfg(all(feature = "std", unix))]
    pub fn open_path(
        path: impl AsRef<std::path::Path>,
        flags: OpenFlags,
        config: FsConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let device = crate::block::FileDevice::open(path, flags.contains(OpenFlags::WRITES))?;
        let name = String::from(path.to_string_lossy());
        let device: DynBlockDevice = alloc::boxed::Box::new(device);
        Self::open_devices(alloc::vec![(device, name)], flags, config)
    }

    /// chunk tree：读根节点，再把全部 DEV_ITEM 与 CHUNK_ITEM 加入设备集合和映射表
    fn setup_chunk_tree(&mut self) -> Result<()> {
        let bytenr = self.super_copy.chunk_root();
        let generation = self.super_copy.chunk_root_generation();
        let node = disk_io::read_tree_block(self, bytenr, generation).map_err(|e| {
            log::error!("[OPEN] cannot read chunk root {:#x}: {}", bytenr, e);
            e
        })?;
        if node.level() != self.super_copy.chunk_root_level() {
            log::error!(
                "[OPEN] chunk root level {} does not match superblock {}",
                node.level(),
                self.super_copy.chunk_root_level()
            );
            return Err(Error::new(ErrorKind::Io, "chunk root level mismatch"));
        }

        let mut items: Vec<(Key, Vec<u8>)> = Vec::new();
        walk_items(self, &node, &Key::MIN, |key, data| {
            if key.item_type == BTRFS_DEV_ITEM_KEY || key.item_type == BTRFS_CHUNK_ITEM_KEY {
                items.push((*key, data.to_vec()));
            }
            Ok(true)
        })?;

        for (key, data) in &items {
            if key.item_type == BTRFS_DEV_ITEM_KEY {
                let item = DevItem::parse(data)?;
                read_one_dev(&item, &mut self.fs_devices, &mut self.scan)?;
            } else {
                let (chunk, _) = ChunkItem::parse(data)?;
                read_one_chunk(
                    &self.super_copy,
                    key,
                    &chunk,
                    &mut self.chunk_map,
                    &mut self.fs_devices,
                    false,
                )?;
            }
        }
        log::debug!("[OPEN] chunk tree has {} items", items.len());

        let key = Key::new(BTRFS_CHUNK_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0);
        let item = RootItem::new(bytenr, node.generation(), node.level());
        self.insert_root(Root::new(key, item, node));
        Ok(())
    }

    fn setup_block_group_tree(&mut self) -> Result<()> {
        let sb = &self.super_copy;
        if !sb.has_compat_ro(BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE)
            && !sb.has_incompat(BTRFS_FEATURE_INCOMPAT_EXTENT_TREE_V2)
        {
            return Ok(());
        }
        let key = Key::new(BTRFS_BLOCK_GROUP_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0);
        let item = RootItem::new(
            sb.block_group_root(),
            sb.block_group_root_generation(),
            sb.block_group_root_level(),
        );
        self.load_root(key, item, RootKind::Required)
    }

    /// root tree：取自 superblock，或 `BACKUP_ROOT` 时取自最佳备份槽位
    fn setup_root_tree(&mut self) -> Result<()> {
        let (bytenr, generation, level) = if self.flags.contains(OpenFlags::BACKUP_ROOT) {
            let index = find_best_backup_root(&self.super_copy);
            let backup = self.super_copy.backup_root(index);
            log::warn!(
                "[OPEN] using backup root slot {} (tree root {:#x} generation {})",
                index,
                backup.tree_root,
                backup.tree_root_gen
            );
            (backup.tree_root, backup.tree_root_gen, backup.tree_root_level)
        } else {
            (
                self.super_copy.root(),
                self.super_copy.generation(),
                self.super_copy.root_level(),
            )
        };

        let node = disk_io::read_tree_block(self, bytenr, generation).map_err(|e| {
            log::error!("[OPEN] cannot read tree root {:#x}: {}", bytenr, e);
            e
        })?;
        if node.level() != level {
            log::error!("[OPEN] tree root level {} expected {}", node.level(), level);
            return Err(Error::new(ErrorKind::Io, "tree root level mismatch"));
        }
        let key = Key::new(BTRFS_ROOT_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0);
        let item = RootItem::new(bytenr, generation, level);
        self.insert_root(Root::new(key, item, node));
        Ok(())
    }

    /// extent、csum、free space 根：扫描 offset 在 `[0, nr_global_roots)` 内的 ROOT_ITEM
    fn setup_global_roots(&mut self) -> Result<()> {
        let nr = if self
            .super_copy
            .has_incompat(BTRFS_FEATURE_INCOMPAT_EXTENT_TREE_V2)
        {
            self.super_copy.nr_global_roots().max(1)
        } else {
            1
        };

        let mut objectids = alloc::vec![BTRFS_EXTENT_TREE_OBJECTID, BTRFS_CSUM_TREE_OBJECTID];
        if self
            .super_copy
            .has_compat_ro(BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE)
        {
            objectids.push(BTRFS_FREE_SPACE_TREE_OBJECTID);
        }

        let tree_root = self.tree_root()?.node.clone();
        for objectid in objectids {
            let mut found: Vec<(Key, RootItem)> = Vec::new();
            let start = Key::new(objectid, BTRFS_ROOT_ITEM_KEY, 0);
            walk_items(self, &tree_root, &start, |key, data| {
                if key.objectid != objectid || key.item_type != BTRFS_ROOT_ITEM_KEY {
                    return Ok(false);
                }
                if key.offset >= nr {
                    return Ok(false);
                }
                found.push((*key, RootItem::parse(data)?));
                Ok(true)
            })?;

            if found.is_empty() {
                let key = Key::new(objectid, BTRFS_ROOT_ITEM_KEY, 0);
                self.missing_root(key, RootKind::Required)?;
                continue;
            }
            for (key, item) in found {
                self.load_root(key, item, RootKind::Required)?;
            }
        }
        Ok(())
    }

    fn setup_log_root(&mut self) -> Result<()> {
        let bytenr = self.super_copy.log_root();
        if bytenr == 0 {
            return Ok(());
        }
        let key = Key::new(BTRFS_TREE_LOG_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0);
        let item = RootItem::new(
            bytenr,
            self.super_copy.generation() + 1,
            self.super_copy.log_root_level(),
        );
        self.load_root(key, item, RootKind::Optional)
    }

    /// 在 root tree 中查找 `objectid` 的最新 ROOT_ITEM 并读入根节点
    fn load_tree_root(&mut self, objectid: u64, kind: RootKind) -> Result<()> {
        let tree_root = self.tree_root()?.node.clone();
        let key = Key::new(objectid, BTRFS_ROOT_ITEM_KEY, 0);
        match find_root_item(self, &tree_root, objectid) {
            Ok(Some((key, item))) => self.load_root(key, item, kind),
            Ok(None) => match kind {
                RootKind::Required => self.missing_root(key, kind),
                RootKind::Optional => Ok(()),
            },
            Err(e) => self.tolerate(key, None, kind, e),
        }
    }

    fn load_root(&mut self, key: Key, item: RootItem, kind: RootKind) -> Result<()> {
        let node = match disk_io::read_tree_block(self, item.bytenr(), item.generation()) {
            Ok(node) => node,
            Err(e) => return self.tolerate(key, Some(item), kind, e),
        };
        if node.level() != item.level() {
            log::error!(
                "[OPEN] root {} level {} does not match root item level {}",
                key.objectid,
                node.level(),
                item.level()
            );
            let e = Error::new(ErrorKind::Io, "root level mismatch");
            return self.tolerate(key, Some(item), kind, e);
        }
        log::debug!(
            "[OPEN] loaded root {} offset {} at {:#x} level {}",
            key.objectid,
            key.offset,
            node.start(),
            node.level()
        );
        self.insert_root(Root::new(key, item, node));
        Ok(())
    }

    fn missing_root(&mut self, key: Key, kind: RootKind) -> Result<()> {
        log::error!("[OPEN] root {} not found in root tree", key.objectid);
        let e = Error::new(ErrorKind::Io, "required root missing");
        self.tolerate(key, None, kind, e)
    }

    fn tolerate(&mut self, key: Key, item: Option<RootItem>, kind: RootKind, e: Error) -> Result<()> {
        if !self.flags.contains(OpenFlags::PARTIAL) {
            log::error!("[OPEN] failed to load root {}: {}", key.objectid, e);
            return Err(Error::new(ErrorKind::Io, "failed to load tree root"));
        }
        match kind {
            RootKind::Optional => {
                log::warn!("[OPEN] ignoring unreadable optional root {}: {}", key.objectid, e);
            }
            RootKind::Required => {
                log::warn!(
                    "[OPEN] root {} unreadable ({}), using empty placeholder",
                    key.objectid,
                    e
                );
                let item = item.unwrap_or_else(|| RootItem::new(0, 0, 0));
                self.insert_root(Root::placeholder(key, item, self.nodesize as usize));
            }
        }
        Ok(())
    }
}

/// 从 generation 最新的设备读取 superblock
fn read_latest_super(fs_devices: &mut FsDevices, flags: OpenFlags) -> Result<Superblock> {
    let latest = fs_devices.latest_generation;
    let dev = fs_devices
        .devices_mut()
        .filter(|d| d.is_open())
        .find(|d| d.super_generation == latest)
        .ok_or(Error::new(ErrorKind::NotFound, "no open device"))?;
    let name = dev.name.clone();
    let bdev = dev.bdev()?;
    read_superblock(bdev, BTRFS_SUPER_INFO_OFFSET, super_read_mode(flags)).map_err(|e| {
        log::error!("[OPEN] cannot read superblock from {}: {}", name, e);
        e
    })
}
