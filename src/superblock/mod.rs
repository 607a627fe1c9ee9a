//! Superblock 操作模块
//!
//! 这个模块提供 btrfs superblock 的读取、验证、写入以及备份根轮转功能。
//!
//! superblock 以 4096 字节原始缓冲区的形式保存，所有字段通过访问器按小端读写，
//! 保留字段原样保留，因此读出再写回不会改变未知字段。

mod backup;
pub mod checksum;
mod read;
mod write;

pub use backup::*;
pub use read::*;
pub use write::*;

use crate::consts::*;
use crate::csum::CsumType;
use crate::error::Result;
use crate::types::{le_accessors, read_uuid, DevItem, RootBackup};
use alloc::boxed::Box;
use byteorder::{ByteOrder, LittleEndian};

// 字段偏移
const OFF_CSUM: usize = 0x00;
const OFF_FSID: usize = 0x20;
const OFF_BYTENR: usize = 0x30;
const OFF_FLAGS: usize = 0x38;
const OFF_MAGIC: usize = 0x40;
const OFF_GENERATION: usize = 0x48;
const OFF_ROOT: usize = 0x50;
const OFF_CHUNK_ROOT: usize = 0x58;
const OFF_LOG_ROOT: usize = 0x60;
const OFF_LOG_ROOT_TRANSID: usize = 0x68;
const OFF_TOTAL_BYTES: usize = 0x70;
const OFF_BYTES_USED: usize = 0x78;
const OFF_ROOT_DIR_OBJECTID: usize = 0x80;
const OFF_NUM_DEVICES: usize = 0x88;
const OFF_SECTORSIZE: usize = 0x90;
const OFF_NODESIZE: usize = 0x94;
const OFF_LEAFSIZE: usize = 0x98;
const OFF_STRIPESIZE: usize = 0x9c;
const OFF_SYS_ARRAY_SIZE: usize = 0xa0;
const OFF_CHUNK_ROOT_GENERATION: usize = 0xa4;
const OFF_COMPAT: usize = 0xac;
const OFF_COMPAT_RO: usize = 0xb4;
const OFF_INCOMPAT: usize = 0xbc;
const OFF_CSUM_TYPE: usize = 0xc4;
const OFF_ROOT_LEVEL: usize = 0xc6;
const OFF_CHUNK_ROOT_LEVEL: usize = 0xc7;
const OFF_LOG_ROOT_LEVEL: usize = 0xc8;
const OFF_DEV_ITEM: usize = 0xc9;
const OFF_LABEL: usize = 0x12b;
const OFF_CACHE_GENERATION: usize = 0x22b;
const OFF_UUID_TREE_GENERATION: usize = 0x233;
const OFF_METADATA_UUID: usize = 0x23b;
const OFF_NR_GLOBAL_ROOTS: usize = 0x24b;
const OFF_BLOCK_GROUP_ROOT: usize = 0x253;
const OFF_BLOCK_GROUP_ROOT_GENERATION: usize = 0x25b;
const OFF_BLOCK_GROUP_ROOT_LEVEL: usize = 0x263;
const OFF_SYS_CHUNK_ARRAY: usize = 0x32b;
const OFF_SUPER_ROOTS: usize = 0xb2b;

/// 校验和覆盖范围起点
pub const SUPER_CSUM_START: usize = BTRFS_CSUM_SIZE;

/// btrfs superblock
#[derive(Clone, PartialEq, Eq)]
pub struct Superblock {
    buf: Box<[u8; BTRFS_SUPER_INFO_SIZE]>,
}

impl core::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Superblock")
            .field("bytenr", &self.bytenr())
            .field("generation", &self.generation())
            .field("root", &self.root())
            .field("chunk_root", &self.chunk_root())
            .field("nodesize", &self.nodesize())
            .field("sectorsize", &self.sectorsize())
            .field("num_devices", &self.num_devices())
            .finish()
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self {
            buf: Box::new([0u8; BTRFS_SUPER_INFO_SIZE]),
        }
    }
}

impl Superblock {
    /// 从原始字节构造（长度必须为 4096）
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BTRFS_SUPER_INFO_SIZE {
            return Err(crate::error::Error::new(
                crate::error::ErrorKind::InvalidInput,
                "superblock buffer must be 4096 bytes",
            ));
        }
        let mut sb = Self::default();
        sb.buf.copy_from_slice(bytes);
        Ok(sb)
    }

    /// 原始字节
    pub fn as_bytes(&self) -> &[u8; BTRFS_SUPER_INFO_SIZE] {
        &self.buf
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; BTRFS_SUPER_INFO_SIZE] {
        &mut self.buf
    }

    le_accessors! { buf;
        /// 本副本所在的字节偏移
        bytenr, set_bytenr: u64 @ OFF_BYTENR;
        /// superblock flags
        flags, set_flags: u64 @ OFF_FLAGS;
        /// 魔数
        magic, set_magic: u64 @ OFF_MAGIC;
        /// 提交 generation
        generation, set_generation: u64 @ OFF_GENERATION;
        /// root tree 根节点逻辑地址
        root, set_root: u64 @ OFF_ROOT;
        /// chunk tree 根节点逻辑地址
        chunk_root, set_chunk_root: u64 @ OFF_CHUNK_ROOT;
        /// log tree 根节点逻辑地址
        log_root, set_log_root: u64 @ OFF_LOG_ROOT;
        /// log root 对应的事务号
        log_root_transid, set_log_root_transid: u64 @ OFF_LOG_ROOT_TRANSID;
        /// 文件系统总字节数
        total_bytes, set_total_bytes: u64 @ OFF_TOTAL_BYTES;
        /// 已用字节数
        bytes_used, set_bytes_used: u64 @ OFF_BYTES_USED;
        /// 根目录 objectid
        root_dir_objectid, set_root_dir_objectid: u64 @ OFF_ROOT_DIR_OBJECTID;
        /// 设备数
        num_devices, set_num_devices: u64 @ OFF_NUM_DEVICES;
        /// chunk root generation
        chunk_root_generation, set_chunk_root_generation: u64 @ OFF_CHUNK_ROOT_GENERATION;
        /// compat 特性位
        compat_flags, set_compat_flags: u64 @ OFF_COMPAT;
        /// compat_ro 特性位
        compat_ro_flags, set_compat_ro_flags: u64 @ OFF_COMPAT_RO;
        /// incompat 特性位
        incompat_flags, set_incompat_flags: u64 @ OFF_INCOMPAT;
        /// 空闲空间缓存 generation
        cache_generation, set_cache_generation: u64 @ OFF_CACHE_GENERATION;
        /// uuid tree generation
        uuid_tree_generation, set_uuid_tree_generation: u64 @ OFF_UUID_TREE_GENERATION;
        /// 全局根数量（extent tree v2）
        nr_global_roots, set_nr_global_roots: u64 @ OFF_NR_GLOBAL_ROOTS;
        /// block group tree 根节点
        block_group_root, set_block_group_root: u64 @ OFF_BLOCK_GROUP_ROOT;
        /// block group tree generation
        block_group_root_generation, set_block_group_root_generation: u64 @ OFF_BLOCK_GROUP_ROOT_GENERATION;
    }

    fn u32_at(&self, off: usize) -> u32 {
        LittleEndian::read_u32(&self.buf[off..off + 4])
    }

    fn set_u32_at(&mut self, off: usize, val: u32) {
        LittleEndian::write_u32(&mut self.buf[off..off + 4], val)
    }

    /// 扇区大小
    pub fn sectorsize(&self) -> u32 {
        self.u32_at(OFF_SECTORSIZE)
    }

    /// 设置扇区大小
    pub fn set_sectorsize(&mut self, val: u32) {
        self.set_u32_at(OFF_SECTORSIZE, val)
    }

    /// 树块大小
    pub fn nodesize(&self) -> u32 {
        self.u32_at(OFF_NODESIZE)
    }

    /// 设置树块大小（同时更新已废弃的 leafsize）
    pub fn set_nodesize(&mut self, val: u32) {
        self.set_u32_at(OFF_NODESIZE, val);
        self.set_u32_at(OFF_LEAFSIZE, val);
    }

    /// 已废弃的 leafsize，必须与 nodesize 相等
    pub fn leafsize(&self) -> u32 {
        self.u32_at(OFF_LEAFSIZE)
    }

    /// 条带大小
    pub fn stripesize(&self) -> u32 {
        self.u32_at(OFF_STRIPESIZE)
    }

    /// 设置条带大小
    pub fn set_stripesize(&mut self, val: u32) {
        self.set_u32_at(OFF_STRIPESIZE, val)
    }

    /// 系统 chunk 数组有效长度
    pub fn sys_chunk_array_size(&self) -> u32 {
        self.u32_at(OFF_SYS_ARRAY_SIZE)
    }

    /// 设置系统 chunk 数组有效长度
    pub fn set_sys_chunk_array_size(&mut self, val: u32) {
        self.set_u32_at(OFF_SYS_ARRAY_SIZE, val)
    }

    /// 校验算法原始 ID
    pub fn csum_type_raw(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[OFF_CSUM_TYPE..])
    }

    /// 校验算法
    pub fn csum_type(&self) -> Result<CsumType> {
        CsumType::from_raw(self.csum_type_raw())
    }

    /// 设置校验算法
    pub fn set_csum_type(&mut self, csum: CsumType) {
        LittleEndian::write_u16(&mut self.buf[OFF_CSUM_TYPE..], csum.as_raw())
    }

    /// root tree 层级
    pub fn root_level(&self) -> u8 {
        self.buf[OFF_ROOT_LEVEL]
    }

    /// 设置 root tree 层级
    pub fn set_root_level(&mut self, level: u8) {
        self.buf[OFF_ROOT_LEVEL] = level
    }

    /// chunk tree 层级
    pub fn chunk_root_level(&self) -> u8 {
        self.buf[OFF_CHUNK_ROOT_LEVEL]
    }

    /// 设置 chunk tree 层级
    pub fn set_chunk_root_level(&mut self, level: u8) {
        self.buf[OFF_CHUNK_ROOT_LEVEL] = level
    }

    /// log tree 层级
    pub fn log_root_level(&self) -> u8 {
        self.buf[OFF_LOG_ROOT_LEVEL]
    }

    /// block group tree 层级
    pub fn block_group_root_level(&self) -> u8 {
        self.buf[OFF_BLOCK_GROUP_ROOT_LEVEL]
    }

    /// 设置 block group tree 层级
    pub fn set_block_group_root_level(&mut self, level: u8) {
        self.buf[OFF_BLOCK_GROUP_ROOT_LEVEL] = level
    }

    /// 存储的校验和槽位
    pub fn csum(&self) -> &[u8] {
        &self.buf[OFF_CSUM..OFF_CSUM + BTRFS_CSUM_SIZE]
    }

    /// 文件系统 FSID
    pub fn fsid(&self) -> [u8; BTRFS_FSID_SIZE] {
        read_uuid(&self.buf[OFF_FSID..])
    }

    /// 设置 FSID
    pub fn set_fsid(&mut self, fsid: &[u8; BTRFS_FSID_SIZE]) {
        self.buf[OFF_FSID..OFF_FSID + BTRFS_FSID_SIZE].copy_from_slice(fsid)
    }

    /// 原始 metadata_uuid 字段
    pub fn metadata_uuid_raw(&self) -> [u8; BTRFS_FSID_SIZE] {
        read_uuid(&self.buf[OFF_METADATA_UUID..])
    }

    /// 设置 metadata_uuid 字段
    pub fn set_metadata_uuid(&mut self, uuid: &[u8; BTRFS_FSID_SIZE]) {
        self.buf[OFF_METADATA_UUID..OFF_METADATA_UUID + BTRFS_FSID_SIZE].copy_from_slice(uuid)
    }

    /// 树块头中应出现的 FSID
    ///
    /// 设置 METADATA_UUID 特性时为 metadata_uuid，否则为 fsid。
    pub fn metadata_uuid(&self) -> [u8; BTRFS_FSID_SIZE] {
        if self.has_incompat(BTRFS_FEATURE_INCOMPAT_METADATA_UUID) {
            self.metadata_uuid_raw()
        } else {
            self.fsid()
        }
    }

    /// 内嵌设备项
    pub fn dev_item(&self) -> DevItem {
        // 固定偏移，长度足够
        DevItem::parse(&self.buf[OFF_DEV_ITEM..OFF_DEV_ITEM + DevItem::SIZE])
            .unwrap_or_default()
    }

    /// 设置内嵌设备项
    pub fn set_dev_item(&mut self, item: &DevItem) {
        item.write(&mut self.buf[OFF_DEV_ITEM..OFF_DEV_ITEM + DevItem::SIZE])
    }

    /// 卷标（到第一个 NUL 为止）
    pub fn label(&self) -> &[u8] {
        let raw = &self.buf[OFF_LABEL..OFF_LABEL + BTRFS_LABEL_SIZE];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(BTRFS_LABEL_SIZE);
        &raw[..end]
    }

    /// 设置卷标（超长截断，保留结尾 NUL）
    pub fn set_label(&mut self, label: &[u8]) {
        let raw = &mut self.buf[OFF_LABEL..OFF_LABEL + BTRFS_LABEL_SIZE];
        raw.fill(0);
        let len = label.len().min(BTRFS_LABEL_SIZE - 1);
        raw[..len].copy_from_slice(&label[..len]);
    }

    /// 系统 chunk 数组的有效部分
    pub fn sys_chunk_array(&self) -> &[u8] {
        let len = (self.sys_chunk_array_size() as usize).min(BTRFS_SYSTEM_CHUNK_ARRAY_SIZE);
        &self.buf[OFF_SYS_CHUNK_ARRAY..OFF_SYS_CHUNK_ARRAY + len]
    }

    /// 整个系统 chunk 数组区域（可写）
    pub fn sys_chunk_array_mut(&mut self) -> &mut [u8] {
        &mut self.buf[OFF_SYS_CHUNK_ARRAY..OFF_SYS_CHUNK_ARRAY + BTRFS_SYSTEM_CHUNK_ARRAY_SIZE]
    }

    /// 第 `index` 个备份根
    pub fn backup_root(&self, index: usize) -> RootBackup {
        let off = OFF_SUPER_ROOTS + (index % BTRFS_NUM_BACKUP_ROOTS) * RootBackup::SIZE;
        RootBackup::parse(&self.buf[off..off + RootBackup::SIZE])
    }

    /// 写入第 `index` 个备份根（整槽清零后写入）
    pub fn set_backup_root(&mut self, index: usize, backup: &RootBackup) {
        let off = OFF_SUPER_ROOTS + (index % BTRFS_NUM_BACKUP_ROOTS) * RootBackup::SIZE;
        backup.write(&mut self.buf[off..off + RootBackup::SIZE])
    }

    /// 是否设置了某个 incompat 特性
    pub fn has_incompat(&self, feature: u64) -> bool {
        self.incompat_flags() & feature != 0
    }

    /// 是否设置了某个 compat_ro 特性
    pub fn has_compat_ro(&self, feature: u64) -> bool {
        self.compat_ro_flags() & feature != 0
    }

    /// 是否设置了某个 superblock flag
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags() & flag != 0
    }

    /// 魔数是否为正式魔数
    pub fn has_valid_magic(&self) -> bool {
        self.magic() == BTRFS_MAGIC
    }

    /// 魔数是否为 mkfs 临时魔数
    pub fn has_temporary_magic(&self) -> bool {
        self.magic() == BTRFS_MAGIC_TEMPORARY
    }

    /// 是否为 seed 设备
    pub fn is_seeding(&self) -> bool {
        self.has_flag(BTRFS_SUPER_FLAG_SEEDING)
    }

    /// 是否为 metadump 恢复出的镜像
    pub fn is_metadump(&self) -> bool {
        self.has_flag(BTRFS_SUPER_FLAG_METADUMP | BTRFS_SUPER_FLAG_METADUMP_V2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets() {
        let mut sb = Superblock::default();
        sb.set_magic(BTRFS_MAGIC);
        sb.set_generation(42);
        sb.set_nodesize(16384);
        sb.set_csum_type(CsumType::Xxhash);

        let raw = sb.as_bytes();
        assert_eq!(&raw[0x40..0x48], b"_BHRfS_M");
        assert_eq!(raw[0x48], 42);
        assert_eq!(LittleEndian::read_u32(&raw[0x94..]), 16384);
        assert_eq!(LittleEndian::read_u32(&raw[0x98..]), 16384);
        assert_eq!(raw[0xc4], 1);
        assert_eq!(sb.csum_type().unwrap(), CsumType::Xxhash);
    }

    #[test]
    fn test_metadata_uuid_selection() {
        let mut sb = Superblock::default();
        sb.set_fsid(&[1; 16]);
        sb.set_metadata_uuid(&[2; 16]);
        assert_eq!(sb.metadata_uuid(), [1; 16]);

        sb.set_incompat_flags(BTRFS_FEATURE_INCOMPAT_METADATA_UUID);
        assert_eq!(sb.metadata_uuid(), [2; 16]);
    }

    #[test]
    fn test_label() {
        let mut sb = Superblock::default();
        sb.set_label(b"data");
        assert_eq!(sb.label(), b"data");
        sb.set_label(&[b'x'; 300]);
        assert_eq!(sb.label().len(), BTRFS_LABEL_SIZE - 1);
    }

    #[test]
    fn test_backup_root_slots() {
        let mut sb = Superblock::default();
        let backup = RootBackup {
            tree_root: 0x10000,
            tree_root_gen: 9,
            ..Default::default()
        };
        sb.set_backup_root(3, &backup);
        assert_eq!(sb.backup_root(3), backup);
        assert_eq!(sb.backup_root(0), RootBackup::default());
        // 备份根区域止于 4096 字节内
        assert!(OFF_SUPER_ROOTS + 4 * RootBackup::SIZE <= BTRFS_SUPER_INFO_SIZE);
    }

    #[test]
    fn test_dev_item_embedded() {
        let mut sb = Superblock::default();
        let item = DevItem {
            devid: 1,
            fsid: [9; 16],
            ..Default::default()
        };
        sb.set_dev_item(&item);
        assert_eq!(sb.dev_item(), item);
        assert_eq!(sb.as_bytes()[0xc9], 1);
    }
}
