//! 树块缓冲区
//!
//! 一个 `nodesize` 字节的树块及其内存状态。树块头 101 字节，
//! 叶子中紧跟 25 字节的 item 头（数据从块尾向前生长），
//! 内部节点中紧跟 33 字节的 key pointer。

use crate::consts::*;
use crate::csum::CsumType;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{le_accessors, Key};
use alloc::vec::Vec;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

/// 树块头大小
pub const HEADER_SIZE: usize = 101;
/// 叶子 item 头大小
pub const ITEM_SIZE: usize = 25;
/// 内部节点 key pointer 大小
pub const KEY_PTR_SIZE: usize = 33;

const OFF_CSUM: usize = 0;
const OFF_FSID: usize = 0x20;
const OFF_BYTENR: usize = 0x30;
const OFF_FLAGS: usize = 0x38;
const OFF_CHUNK_TREE_UUID: usize = 0x40;
const OFF_GENERATION: usize = 0x50;
const OFF_OWNER: usize = 0x58;
const OFF_NRITEMS: usize = 0x60;
const OFF_LEVEL: usize = 0x64;

bitflags! {
    /// 树块的内存状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EbFlags: u8 {
        /// 内容有效
        const UPTODATE      = 0x01;
        /// 已修改，等待提交
        const DIRTY         = 0x02;
        /// 以 generation 不匹配的方式读入（需要重新 COW）
        const BAD_TRANSID   = 0x04;
        /// 键顺序错误（读取仍然成功）
        const BAD_KEY_ORDER = 0x08;
    }
}

/// 树块缓冲区
#[derive(Clone, PartialEq, Eq)]
pub struct ExtentBuffer {
    start: u64,
    data: Vec<u8>,
    flags: EbFlags,
}

impl core::fmt::Debug for ExtentBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtentBuffer")
            .field("start", &self.start)
            .field("len", &self.data.len())
            .field("level", &self.level())
            .field("nritems", &self.nritems())
            .field("generation", &self.generation())
            .field("flags", &self.flags)
            .finish()
    }
}

impl ExtentBuffer {
    /// 创建全零缓冲区（未 UPTODATE）
    pub fn new(start: u64, len: usize) -> Self {
        Self {
            start,
            data: alloc::vec![0u8; len],
            flags: EbFlags::empty(),
        }
    }

    /// 由原始字节创建
    pub fn from_bytes(start: u64, bytes: &[u8]) -> Self {
        Self {
            start,
            data: bytes.to_vec(),
            flags: EbFlags::UPTODATE,
        }
    }

    /// 创建一个空的树块并填好树块头
    pub fn new_empty(
        start: u64,
        len: usize,
        owner: u64,
        level: u8,
        generation: u64,
        fsid: &[u8; BTRFS_FSID_SIZE],
    ) -> Self {
        let mut eb = Self::new(start, len);
        eb.set_bytenr(start);
        eb.set_owner(owner);
        eb.set_level(level);
        eb.set_generation(generation);
        eb.set_fsid(fsid);
        eb.set_backref_rev(BTRFS_MIXED_BACKREF_REV);
        eb.flags = EbFlags::UPTODATE;
        eb
    }

    /// 逻辑地址
    pub fn start(&self) -> u64 {
        self.start
    }

    /// 长度（nodesize）
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 原始数据
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 原始数据（可变）
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 内存状态
    pub fn flags(&self) -> EbFlags {
        self.flags
    }

    /// 设置状态位
    pub fn set_flag(&mut self, flag: EbFlags) {
        self.flags.insert(flag);
    }

    /// 清除状态位
    pub fn clear_flag(&mut self, flag: EbFlags) {
        self.flags.remove(flag);
    }

    /// 测试状态位
    pub fn test_flag(&self, flag: EbFlags) -> bool {
        self.flags.contains(flag)
    }

    /// 内容是否有效
    pub fn is_uptodate(&self) -> bool {
        self.test_flag(EbFlags::UPTODATE)
    }

    /// 是否为脏
    pub fn is_dirty(&self) -> bool {
        self.test_flag(EbFlags::DIRTY)
    }

    // ===== 树块头 =====

    le_accessors! { data;
        /// 树块头中记录的逻辑地址
        bytenr, set_bytenr: u64 @ OFF_BYTENR;
        /// 写入时的事务 generation
        generation, set_generation: u64 @ OFF_GENERATION;
        /// 所属树的 objectid
        owner, set_owner: u64 @ OFF_OWNER;
    }

    /// 树块头中的校验和
    pub fn csum(&self) -> &[u8] {
        &self.data[OFF_CSUM..OFF_CSUM + BTRFS_CSUM_SIZE]
    }

    /// FSID（metadata uuid）
    pub fn fsid(&self) -> [u8; BTRFS_FSID_SIZE] {
        crate::types::read_uuid(&self.data[OFF_FSID..])
    }

    /// 设置 FSID
    pub fn set_fsid(&mut self, fsid: &[u8; BTRFS_FSID_SIZE]) {
        self.data[OFF_FSID..OFF_FSID + BTRFS_FSID_SIZE].copy_from_slice(fsid);
    }

    /// chunk tree UUID
    pub fn chunk_tree_uuid(&self) -> [u8; BTRFS_UUID_SIZE] {
        crate::types::read_uuid(&self.data[OFF_CHUNK_TREE_UUID..])
    }

    /// 设置 chunk tree UUID
    pub fn set_chunk_tree_uuid(&mut self, uuid: &[u8; BTRFS_UUID_SIZE]) {
        self.data[OFF_CHUNK_TREE_UUID..OFF_CHUNK_TREE_UUID + BTRFS_UUID_SIZE]
            .copy_from_slice(uuid);
    }

    /// 树块头标志（低 56 位）
    pub fn header_flags(&self) -> u64 {
        LittleEndian::read_u64(&self.data[OFF_FLAGS..]) & !(0xffu64 << BTRFS_BACKREF_REV_SHIFT)
    }

    /// 设置树块头标志位
    pub fn set_header_flag(&mut self, flag: u64) {
        let raw = LittleEndian::read_u64(&self.data[OFF_FLAGS..]);
        LittleEndian::write_u64(&mut self.data[OFF_FLAGS..], raw | flag);
    }

    /// 清除树块头标志位
    pub fn clear_header_flag(&mut self, flag: u64) {
        let raw = LittleEndian::read_u64(&self.data[OFF_FLAGS..]);
        LittleEndian::write_u64(&mut self.data[OFF_FLAGS..], raw & !flag);
    }

    /// backref 版本（高 8 位）
    pub fn backref_rev(&self) -> u64 {
        LittleEndian::read_u64(&self.data[OFF_FLAGS..]) >> BTRFS_BACKREF_REV_SHIFT
    }

    /// 设置 backref 版本
    pub fn set_backref_rev(&mut self, rev: u64) {
        let raw = LittleEndian::read_u64(&self.data[OFF_FLAGS..]);
        let mask = 0xffu64 << BTRFS_BACKREF_REV_SHIFT;
        let raw = (raw & !mask) | (rev << BTRFS_BACKREF_REV_SHIFT);
        LittleEndian::write_u64(&mut self.data[OFF_FLAGS..], raw);
    }

    /// 条目数
    pub fn nritems(&self) -> u32 {
        LittleEndian::read_u32(&self.data[OFF_NRITEMS..])
    }

    /// 设置条目数
    pub fn set_nritems(&mut self, nr: u32) {
        LittleEndian::write_u32(&mut self.data[OFF_NRITEMS..], nr);
    }

    /// 层级（0 为叶子）
    pub fn level(&self) -> u8 {
        self.data[OFF_LEVEL]
    }

    /// 设置层级
    pub fn set_level(&mut self, level: u8) {
        self.data[OFF_LEVEL] = level;
    }

    /// 是否为叶子
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    // ===== 容量 =====

    /// 叶子数据区大小
    pub fn leaf_data_size(&self) -> usize {
        self.len() - HEADER_SIZE
    }

    /// 内部节点最多容纳的 key pointer 数
    pub fn max_node_ptrs(&self) -> usize {
        self.leaf_data_size() / KEY_PTR_SIZE
    }

    /// 叶子最多容纳的 item 数（每个 item 至少有头部）
    pub fn max_leaf_items(&self) -> usize {
        self.leaf_data_size() / ITEM_SIZE
    }

    /// 叶子剩余空间
    pub fn leaf_free_space(&self) -> usize {
        let nr = self.nritems() as usize;
        let data_start = if nr == 0 {
            self.leaf_data_size()
        } else {
            self.item_offset(nr - 1) as usize
        };
        data_start.saturating_sub(nr * ITEM_SIZE)
    }

    // ===== 叶子 item =====

    fn item_base(slot: usize) -> usize {
        HEADER_SIZE + slot * ITEM_SIZE
    }

    /// 第 `slot` 个 item 的键
    pub fn item_key(&self, slot: usize) -> Key {
        Key::read(&self.data[Self::item_base(slot)..])
    }

    /// 修改第 `slot` 个 item 的键
    pub fn set_item_key(&mut self, slot: usize, key: &Key) {
        key.write(&mut self.data[Self::item_base(slot)..]);
    }

    /// item 数据偏移（相对树块头之后）
    pub fn item_offset(&self, slot: usize) -> u32 {
        LittleEndian::read_u32(&self.data[Self::item_base(slot) + Key::SIZE..])
    }

    /// item 数据大小
    pub fn item_size(&self, slot: usize) -> u32 {
        LittleEndian::read_u32(&self.data[Self::item_base(slot) + Key::SIZE + 4..])
    }

    fn set_item_offset_size(&mut self, slot: usize, offset: u32, size: u32) {
        let base = Self::item_base(slot) + Key::SIZE;
        LittleEndian::write_u32(&mut self.data[base..], offset);
        LittleEndian::write_u32(&mut self.data[base + 4..], size);
    }

    /// item 数据
    pub fn item_data(&self, slot: usize) -> Result<&[u8]> {
        let start = HEADER_SIZE + self.item_offset(slot) as usize;
        let end = start + self.item_size(slot) as usize;
        if end > self.len() {
            return Err(Error::new(ErrorKind::Corrupted, "item data beyond tree block"));
        }
        Ok(&self.data[start..end])
    }

    /// item 数据（可变）
    pub fn item_data_mut(&mut self, slot: usize) -> Result<&mut [u8]> {
        let start = HEADER_SIZE + self.item_offset(slot) as usize;
        let end = start + self.item_size(slot) as usize;
        if end > self.len() {
            return Err(Error::new(ErrorKind::Corrupted, "item data beyond tree block"));
        }
        Ok(&mut self.data[start..end])
    }

    /// 在叶子末尾追加一个 item
    ///
    /// 调用方负责按键顺序追加。空间不足返回 `NoSpace`。
    pub fn push_item(&mut self, key: &Key, payload: &[u8]) -> Result<usize> {
        if !self.is_leaf() {
            return Err(Error::new(ErrorKind::InvalidInput, "push_item on a node"));
        }
        if self.leaf_free_space() < ITEM_SIZE + payload.len() {
            return Err(Error::new(ErrorKind::NoSpace, "leaf is full"));
        }
        let slot = self.nritems() as usize;
        let data_end = if slot == 0 {
            self.leaf_data_size()
        } else {
            self.item_offset(slot - 1) as usize
        };
        let offset = data_end - payload.len();
        self.set_item_key(slot, key);
        self.set_item_offset_size(slot, offset as u32, payload.len() as u32);
        let abs = HEADER_SIZE + offset;
        self.data[abs..abs + payload.len()].copy_from_slice(payload);
        self.set_nritems(slot as u32 + 1);
        Ok(slot)
    }

    // ===== 内部节点 =====

    fn ptr_base(slot: usize) -> usize {
        HEADER_SIZE + slot * KEY_PTR_SIZE
    }

    /// 第 `slot` 个 key pointer 的键
    pub fn node_key(&self, slot: usize) -> Key {
        Key::read(&self.data[Self::ptr_base(slot)..])
    }

    /// 子节点逻辑地址
    pub fn node_blockptr(&self, slot: usize) -> u64 {
        LittleEndian::read_u64(&self.data[Self::ptr_base(slot) + Key::SIZE..])
    }

    /// 子节点 generation
    pub fn node_ptr_generation(&self, slot: usize) -> u64 {
        LittleEndian::read_u64(&self.data[Self::ptr_base(slot) + Key::SIZE + 8..])
    }

    /// 写入第 `slot` 个 key pointer
    pub fn set_node_ptr(&mut self, slot: usize, key: &Key, blockptr: u64, generation: u64) {
        let base = Self::ptr_base(slot);
        key.write(&mut self.data[base..]);
        LittleEndian::write_u64(&mut self.data[base + Key::SIZE..], blockptr);
        LittleEndian::write_u64(&mut self.data[base + Key::SIZE + 8..], generation);
    }

    /// 在节点末尾追加一个 key pointer
    pub fn push_ptr(&mut self, key: &Key, blockptr: u64, generation: u64) -> Result<usize> {
        if self.is_leaf() {
            return Err(Error::new(ErrorKind::InvalidInput, "push_ptr on a leaf"));
        }
        let slot = self.nritems() as usize;
        if slot >= self.max_node_ptrs() {
            return Err(Error::new(ErrorKind::NoSpace, "node is full"));
        }
        self.set_node_ptr(slot, key, blockptr, generation);
        self.set_nritems(slot as u32 + 1);
        Ok(slot)
    }

    /// 第 `slot` 个条目的键（叶子或节点）
    pub fn key_at(&self, slot: usize) -> Key {
        if self.is_leaf() {
            self.item_key(slot)
        } else {
            self.node_key(slot)
        }
    }

    /// 第一个键
    pub fn first_key(&self) -> Option<Key> {
        (self.nritems() > 0).then(|| self.key_at(0))
    }

    // ===== 校验和 =====

    /// 计算并写入校验和
    pub fn update_checksum(&mut self, csum_type: CsumType) {
        let digest = csum_type.compute(&self.data[BTRFS_CSUM_SIZE..]);
        self.data[..BTRFS_CSUM_SIZE].copy_from_slice(&digest);
    }

    /// 校验和是否正确
    pub fn verify_checksum(&self, csum_type: CsumType) -> bool {
        csum_type.verify(&self.data[BTRFS_CSUM_SIZE..], self.csum())
    }
}
