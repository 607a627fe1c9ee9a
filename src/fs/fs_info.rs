//! 文件系统会话
//!
//! [`FsInfo`] 持有设备集合、superblock 副本、chunk 映射、各棵树的根和树块缓存。
//! 打开流程见 [`super::bootstrap`]；读写树块见 [`crate::disk_io`]。

use super::root::Root;
use super::types::{FsConfig, OpenFlags, ReadStats};
use crate::consts::*;
use crate::csum::CsumType;
use crate::ctree::{search_slot, search_slot_level, ExtentBuffer, Path, TreeReader};
use crate::disk_io::{self, ExtentCache};
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::{backup_super_roots, write_superblock, SuperWriteIntent, Superblock};
use crate::types::{Key, RootBackup};
use crate::volumes::{ChunkMap, FsDevices, ScanContext};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// 正在进行的事务
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    /// 事务号
    pub transid: u64,
}

/// 文件系统会话
pub struct FsInfo {
    pub(crate) fs_devices: FsDevices,
    pub(crate) scan: ScanContext,
    pub(crate) super_copy: Superblock,
    pub(crate) chunk_map: ChunkMap,
    pub(crate) cache: ExtentCache,
    pub(crate) roots: BTreeMap<(u64, u64), Root>,
    pub(crate) recow: Vec<(u64, u32)>,
    pub(crate) flags: OpenFlags,
    pub(crate) csum_type: CsumType,
    pub(crate) nodesize: u32,
    pub(crate) sectorsize: u32,
    pub(crate) stripesize: u32,
    pub(crate) generation: u64,
    pub(crate) last_trans_committed: u64,
    pub(crate) transaction: Option<Transaction>,
    pub(crate) stats: ReadStats,
}

impl core::fmt::Debug for FsInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsInfo")
            .field("generation", &self.generation)
            .field("nodesize", &self.nodesize)
            .field("sectorsize", &self.sectorsize)
            .field("csum_type", &self.csum_type)
            .field("flags", &self.flags)
            .field("chunks", &self.chunk_map.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl FsInfo {
    /// 由已读出的 superblock 创建尚未加载任何树的会话
    pub(crate) fn new(
        fs_devices: FsDevices,
        scan: ScanContext,
        super_copy: Superblock,
        flags: OpenFlags,
        config: FsConfig,
    ) -> Result<Self> {
        let csum_type = super_copy.csum_type()?;
        Ok(Self {
            fs_devices,
            scan,
            nodesize: super_copy.nodesize(),
            sectorsize: super_copy.sectorsize(),
            stripesize: super_copy.stripesize(),
            generation: super_copy.generation(),
            last_trans_committed: super_copy.generation(),
            super_copy,
            chunk_map: ChunkMap::new(),
            cache: ExtentCache::new(config.cache_size as usize),
            roots: BTreeMap::new(),
            recow: Vec::new(),
            flags,
            csum_type,
            transaction: None,
            stats: ReadStats::default(),
        })
    }

    // ===== 访问器 =====

    /// superblock 内存副本
    pub fn superblock(&self) -> &Superblock {
        &self.super_copy
    }

    /// 设备集合
    pub fn fs_devices(&self) -> &FsDevices {
        &self.fs_devices
    }

    /// chunk 映射表
    pub fn chunk_map(&self) -> &ChunkMap {
        &self.chunk_map
    }

    /// 打开选项
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// 校验和算法
    pub fn csum_type(&self) -> CsumType {
        self.csum_type
    }

    /// 树块大小
    pub fn nodesize(&self) -> u32 {
        self.nodesize
    }

    /// 扇区大小
    pub fn sectorsize(&self) -> u32 {
        self.sectorsize
    }

    /// 条带大小
    pub fn stripesize(&self) -> u32 {
        self.stripesize
    }

    /// 当前 generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 最近一次提交的 generation
    pub fn last_trans_committed(&self) -> u64 {
        self.last_trans_committed
    }

    /// 是否可写
    pub fn is_writable(&self) -> bool {
        self.flags.contains(OpenFlags::WRITES)
    }

    /// 读取统计
    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// 清零读取统计
    pub fn reset_stats(&mut self) {
        self.stats = ReadStats::default();
    }

    /// 树块缓存
    pub fn cache(&self) -> &ExtentCache {
        &self.cache
    }

    /// 等待重新 COW 的树块（generation 不匹配时读入）
    pub fn recow_list(&self) -> &[(u64, u32)] {
        &self.recow
    }

    /// 按 objectid 取非全局根（offset 为 0）
    pub fn root(&self, objectid: u64) -> Option<&Root> {
        self.roots.get(&(objectid, 0))
    }

    /// 按 objectid 取根（可变）
    pub fn root_mut(&mut self, objectid: u64) -> Option<&mut Root> {
        self.roots.get_mut(&(objectid, 0))
    }

    /// 取全局根（extent、csum、free space）
    pub fn global_root(&self, objectid: u64, offset: u64) -> Option<&Root> {
        self.roots.get(&(objectid, offset))
    }

    /// 全部已加载的根
    pub fn roots(&self) -> impl Iterator<Item = &Root> {
        self.roots.values()
    }

    /// root tree
    pub fn tree_root(&self) -> Result<&Root> {
        self.root(BTRFS_ROOT_TREE_OBJECTID)
            .ok_or(Error::new(ErrorKind::InvalidState, "root tree not loaded"))
    }

    /// chunk tree
    pub fn chunk_root(&self) -> Result<&Root> {
        self.root(BTRFS_CHUNK_TREE_OBJECTID)
            .ok_or(Error::new(ErrorKind::InvalidState, "chunk tree not loaded"))
    }

    /// 默认子卷（fs tree）
    pub fn fs_root(&self) -> Option<&Root> {
        self.root(BTRFS_FS_TREE_OBJECTID)
    }

    pub(crate) fn insert_root(&mut self, root: Root) {
        let key = (root.key.objectid, if is_global_root(root.key.objectid) { root.key.offset } else { 0 });
        self.roots.insert(key, root);
    }

    /// 在 `root` 中查找 `key`
    pub fn search(&mut self, objectid: u64, key: &Key, path: &mut Path) -> Result<bool> {
        let node = match self.root(objectid) {
            Some(root) if root.is_uptodate() => root.node.clone(),
            Some(_) => return Err(Error::new(ErrorKind::Io, "root node is not readable")),
            None => return Err(Error::new(ErrorKind::NotFound, "no such root")),
        };
        search_slot(self, &node, key, path)
    }

    // ===== 事务 =====

    /// 开始（或加入）一个事务
    pub fn start_transaction(&mut self) -> Result<Transaction> {
        if !self.is_writable() {
            return Err(Error::new(ErrorKind::InvalidState, "filesystem opened read-only"));
        }
        if let Some(trans) = self.transaction {
            return Ok(trans);
        }
        let trans = Transaction {
            transid: self.generation + 1,
        };
        self.generation = trans.transid;
        self.transaction = Some(trans);
        log::debug!("[TRANS] started transaction {}", trans.transid);
        Ok(trans)
    }

    /// 标记一个修改过的树块为脏，提交时写回
    ///
    /// 树块头的 generation 改为当前事务号。如果它是某棵树的根节点，同时替换该树的根；
    /// 否则把新 generation 写进父节点的指针，并逐层向上标脏直到根。
    pub fn mark_buffer_dirty(&mut self, mut eb: ExtentBuffer) -> Result<()> {
        let trans = self
            .transaction
            .ok_or(Error::new(ErrorKind::InvalidState, "no running transaction"))?;
        eb.set_generation(trans.transid);
        let mut is_root = false;
        for root in self.roots.values_mut() {
            if root.node.start() == eb.start() {
                root.set_node(eb.clone());
                is_root = true;
            }
        }
        self.cache.mark_dirty(eb.clone());
        if is_root {
            return Ok(());
        }
        self.update_parent_ptr(&eb)
    }

    /// 在所属树中找到指向 `eb` 的父节点指针，更新其 generation 后标脏父节点
    fn update_parent_ptr(&mut self, eb: &ExtentBuffer) -> Result<()> {
        let key = eb.first_key().ok_or_else(|| {
            log::error!("[TRANS] empty tree block {:#x} is not a root", eb.start());
            Error::new(ErrorKind::InvalidInput, "cannot locate parent of empty block")
        })?;
        let level = eb.level() as usize + 1;
        let owner = eb.owner();
        let roots: Vec<ExtentBuffer> = self
            .roots
            .values()
            .filter(|r| r.objectid() == owner && r.is_uptodate() && r.level() as usize >= level)
            .map(|r| r.node.clone())
            .collect();

        for root in roots {
            let mut path = Path::new();
            search_slot_level(self, &root, &key, &mut path, level)?;
            let slot = path.slots[level];
            let Some(mut parent) = path.nodes[level].take() else {
                continue;
            };
            if parent.node_blockptr(slot) != eb.start() {
                continue;
            }
            let node_key = parent.node_key(slot);
            parent.set_node_ptr(slot, &node_key, eb.start(), eb.generation());
            log::trace!(
                "[TRANS] parent {:#x} slot {} now points at generation {}",
                parent.start(),
                slot,
                eb.generation()
            );
            return self.mark_buffer_dirty(parent);
        }

        log::error!(
            "[TRANS] no parent of tree block {:#x} found in tree {}",
            eb.start(),
            owner
        );
        Err(Error::new(ErrorKind::NotFound, "parent of dirty tree block not found"))
    }

    /// 提交当前事务
    ///
    /// 写回被替换过的 ROOT_ITEM 和全部脏树块，更新 superblock 的根指针，
    /// 轮转备份根并写出全部 superblock。写出 superblock 之后的错误只报告，不回滚。
    pub fn commit_transaction(&mut self) -> Result<()> {
        let trans = self
            .transaction
            .ok_or(Error::new(ErrorKind::InvalidState, "no running transaction"))?;

        self.update_root_items()?;

        // superblock 的 generation 总是前进，root tree 根节点必须跟着重写
        let tree_root = self.tree_root()?.node.clone();
        if tree_root.generation() != trans.transid {
            self.mark_buffer_dirty(tree_root)?;
        }

        let dirty = self.cache.dirty_buffers();
        log::debug!(
            "[TRANS] committing {} with {} dirty buffers",
            trans.transid,
            dirty.len()
        );
        for eb in &dirty {
            disk_io::write_tree_block(self, eb)?;
            self.cache.clear_dirty(eb.start(), eb.len() as u32);
        }

        self.update_super_roots(trans.transid)?;
        let backup = self.current_backup();
        backup_super_roots(&mut self.super_copy, &backup);
        self.write_all_supers()?;

        for root in self.roots.values_mut() {
            root.dirty = false;
        }
        self.transaction = None;
        self.last_trans_committed = trans.transid;
        log::info!("[TRANS] committed transaction {}", trans.transid);
        Ok(())
    }

    /// 把被替换过根节点的树的 ROOT_ITEM 写回 root tree 叶子
    fn update_root_items(&mut self) -> Result<()> {
        let dirty: Vec<(Key, Vec<u8>)> = self
            .roots
            .values()
            .filter(|r| {
                r.dirty
                    && r.objectid() != BTRFS_ROOT_TREE_OBJECTID
                    && r.objectid() != BTRFS_CHUNK_TREE_OBJECTID
                    && r.objectid() != BTRFS_BLOCK_GROUP_TREE_OBJECTID
            })
            .map(|r| (r.key, r.item.as_bytes().to_vec()))
            .collect();

        for (key, bytes) in dirty {
            let mut path = Path::new();
            if !self.search(BTRFS_ROOT_TREE_OBJECTID, &key, &mut path)? {
                log::error!("[TRANS] ROOT_ITEM {} missing from root tree", key);
                return Err(Error::new(ErrorKind::NotFound, "root item not found"));
            }
            let slot = path.slot();
            let mut leaf = match path.nodes[0].take() {
                Some(leaf) => leaf,
                None => return Err(Error::new(ErrorKind::NotFound, "root item not found")),
            };
            let data = leaf.item_data_mut(slot)?;
            if data.len() != bytes.len() {
                return Err(Error::new(ErrorKind::Corrupted, "root item size changed"));
            }
            data.copy_from_slice(&bytes);
            self.mark_buffer_dirty(leaf)?;
        }
        Ok(())
    }

    fn update_super_roots(&mut self, transid: u64) -> Result<()> {
        let (root_start, root_level) = {
            let root = self.tree_root()?;
            (root.bytenr(), root.level())
        };
        let (chunk_start, chunk_level, chunk_gen) = {
            let root = self.chunk_root()?;
            (root.bytenr(), root.level(), root.node.generation())
        };
        let sb = &mut self.super_copy;
        sb.set_root(root_start);
        sb.set_root_level(root_level);
        sb.set_chunk_root(chunk_start);
        sb.set_chunk_root_level(chunk_level);
        sb.set_chunk_root_generation(chunk_gen);
        if let Some(bg) = self.roots.get(&(BTRFS_BLOCK_GROUP_TREE_OBJECTID, 0)) {
            self.super_copy.set_block_group_root(bg.bytenr());
            self.super_copy.set_block_group_root_level(bg.level());
            self.super_copy
                .set_block_group_root_generation(bg.node.generation());
        }
        self.super_copy.set_generation(transid);
        Ok(())
    }

    fn current_backup(&self) -> RootBackup {
        let mut backup = RootBackup::default();
        let get = |objectid: u64| self.roots.get(&(objectid, 0));
        if let Some(r) = get(BTRFS_ROOT_TREE_OBJECTID) {
            backup.tree_root = r.bytenr();
            backup.tree_root_gen = r.node.generation();
            backup.tree_root_level = r.level();
        }
        if let Some(r) = get(BTRFS_CHUNK_TREE_OBJECTID) {
            backup.chunk_root = r.bytenr();
            backup.chunk_root_gen = r.node.generation();
            backup.chunk_root_level = r.level();
        }
        if let Some(r) = get(BTRFS_EXTENT_TREE_OBJECTID) {
            backup.extent_root = r.bytenr();
            backup.extent_root_gen = r.node.generation();
            backup.extent_root_level = r.level();
        }
        if let Some(r) = get(BTRFS_FS_TREE_OBJECTID) {
            backup.fs_root = r.bytenr();
            backup.fs_root_gen = r.node.generation();
            backup.fs_root_level = r.level();
        }
        if let Some(r) = get(BTRFS_DEV_TREE_OBJECTID) {
            backup.dev_root = r.bytenr();
            backup.dev_root_gen = r.node.generation();
            backup.dev_root_level = r.level();
        }
        if let Some(r) = get(BTRFS_CSUM_TREE_OBJECTID) {
            backup.csum_root = r.bytenr();
            backup.csum_root_gen = r.node.generation();
            backup.csum_root_level = r.level();
        }
        backup.total_bytes = self.super_copy.total_bytes();
        backup.bytes_used = self.super_copy.bytes_used();
        backup.num_devices = self.super_copy.num_devices();
        backup
    }

    /// 把 superblock 写到每个可写设备
    ///
    /// 每个设备写入自己的设备项，并设置 WRITTEN 标志。
    pub fn write_all_supers(&mut self) -> Result<usize> {
        let fsid = self.super_copy.metadata_uuid();
        let flags = self.super_copy.flags() | BTRFS_HEADER_FLAG_WRITTEN;
        self.super_copy.set_flags(flags);

        let mut written = 0;
        for dev in self.fs_devices.devices_mut() {
            if dev.missing || !dev.writeable || !dev.is_open() {
                continue;
            }
            let devid = dev.devid;
            let mut sb = self.super_copy.clone();
            sb.set_dev_item(&dev.to_dev_item(&fsid));
            let bdev = dev.bdev()?;
            write_superblock(bdev, &mut sb, SuperWriteIntent::All).map_err(|e| {
                log::error!("[SUPER] failed to write superblock on devid {}: {}", devid, e);
                e
            })?;
            written += 1;
        }
        if written == 0 {
            log::error!("[SUPER] no writable device to write superblock");
            return Err(Error::new(ErrorKind::Io, "no writable device"));
        }
        Ok(written)
    }

    /// 丢弃树块缓存与 chunk 映射
    pub fn cleanup_caches(&mut self) {
        let dropped = self.cache.cleanup();
        if dropped > 0 {
            log::warn!("[CLOSE] dropped {} uncommitted buffers", dropped);
        }
        self.chunk_map.clear();
        self.recow.clear();
    }

    /// 关闭会话
    ///
    /// `commit` 为 true 时先提交正在进行的事务。以临时魔数打开且可写时，
    /// 关闭时写回正式魔数。持久化之后的失败只报告。
    pub fn close(mut self, commit: bool) -> Result<()> {
        let mut result = Ok(());

        if commit && self.transaction.is_some() {
            if let Err(e) = self.commit_transaction() {
                log::error!("[CLOSE] commit failed: {}", e);
                result = Err(e);
            }
        }

        if result.is_ok()
            && self.is_writable()
            && self.flags.contains(OpenFlags::TEMPORARY_SUPER)
            && self.super_copy.has_temporary_magic()
        {
            self.super_copy.set_magic(BTRFS_MAGIC);
            if let Err(e) = self.write_all_supers() {
                log::error!("[CLOSE] failed to finalize superblock: {}", e);
                result = Err(e);
            }
        }

        self.cleanup_caches();
        self.roots.clear();
        if let Err(e) = self.fs_devices.close_all() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        result
    }
}

impl TreeReader for FsInfo {
    fn read_tree_block(&mut self, bytenr: u64, parent_transid: u64) -> Result<ExtentBuffer> {
        disk_io::read_tree_block(self, bytenr, parent_transid)
    }
}

/// 是否为按 (objectid, offset) 区分的全局根
pub fn is_global_root(objectid: u64) -> bool {
    matches!(
        objectid,
        BTRFS_EXTENT_TREE_OBJECTID | BTRFS_CSUM_TREE_OBJECTID | BTRFS_FREE_SPACE_TREE_OBJECTID
    )
}
