//! btrfs 磁盘数据结构定义
//!
//! 这个模块包含了直接对应磁盘格式的数据结构。
//!
//! ## 设计原则
//!
//! 1. **磁盘格式结构** - 字段命名与 btrfs 磁盘格式保持一致（便于对照）
//! 2. **序列化** - 通过 `byteorder` 按小端逐字段读写，不依赖内存布局
//! 3. **辅助方法** - 提供 Rust 风格的访问器和工具函数

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};

/// 为固定偏移的小端字段生成 getter/setter
///
/// 用于 superblock、树块头等按字节缓冲区存放的结构。
macro_rules! le_accessors {
    ($buf:ident; $( $(#[$meta:meta])* $get:ident, $set:ident : u64 @ $off:expr; )*) => {
        $(
            $(#[$meta])*
            pub fn $get(&self) -> u64 {
                <byteorder::LittleEndian as byteorder::ByteOrder>::read_u64(&self.$buf[$off..$off + 8])
            }

            #[doc = concat!("设置 `", stringify!($get), "`")]
            pub fn $set(&mut self, val: u64) {
                <byteorder::LittleEndian as byteorder::ByteOrder>::write_u64(&mut self.$buf[$off..$off + 8], val)
            }
        )*
    };
}

pub(crate) use le_accessors;

//=============================================================================
// 键
//=============================================================================

/// 磁盘键（btrfs_disk_key / btrfs_key）
///
/// 排序规则为 (objectid, type, offset) 字典序，与 B 树中的顺序一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    /// 对象 ID
    pub objectid: u64,
    /// 键类型
    pub item_type: u8,
    /// 偏移（含义随类型变化）
    pub offset: u64,
}

impl Key {
    /// 磁盘上的大小
    pub const SIZE: usize = 17;

    /// 最小键
    pub const MIN: Key = Key::new(0, 0, 0);

    /// 最大键
    pub const MAX: Key = Key::new(u64::MAX, u8::MAX, u64::MAX);

    /// 创建键
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// 从字节读取（调用方保证长度 >= 17）
    pub fn read(buf: &[u8]) -> Self {
        Self {
            objectid: LittleEndian::read_u64(&buf[0..8]),
            item_type: buf[8],
            offset: LittleEndian::read_u64(&buf[9..17]),
        }
    }

    /// 写入字节（调用方保证长度 >= 17）
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.objectid);
        buf[8] = self.item_type;
        LittleEndian::write_u64(&mut buf[9..17], self.offset);
    }
}

impl core::fmt::Display for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

/// 读取 16 字节 UUID
pub(crate) fn read_uuid(buf: &[u8]) -> [u8; BTRFS_UUID_SIZE] {
    let mut uuid = [0u8; BTRFS_UUID_SIZE];
    uuid.copy_from_slice(&buf[..BTRFS_UUID_SIZE]);
    uuid
}

//=============================================================================
// 设备项
//=============================================================================

/// 设备项（btrfs_dev_item）
///
/// 既出现在 chunk tree 的 DEV_ITEM 中，也内嵌在每个设备的 superblock 里。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevItem {
    /// 设备 ID
    pub devid: u64,
    /// 设备总大小
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
    /// 起始偏移
    pub start_offset: u64,
    /// 设备组
    pub dev_group: u32,
    /// 寻道速度
    pub seek_speed: u8,
    /// 带宽
    pub bandwidth: u8,
    /// 设备 UUID
    pub uuid: [u8; BTRFS_UUID_SIZE],
    /// 所属文件系统 FSID
    pub fsid: [u8; BTRFS_FSID_SIZE],
}

impl DevItem {
    /// 磁盘上的大小
    pub const SIZE: usize = 98;

    /// 解析
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::new(ErrorKind::Corrupted, "dev item too short"));
        }
        Ok(Self {
            devid: LittleEndian::read_u64(&buf[0..]),
            total_bytes: LittleEndian::read_u64(&buf[8..]),
            bytes_used: LittleEndian::read_u64(&buf[16..]),
            io_align: LittleEndian::read_u32(&buf[24..]),
            io_width: LittleEndian::read_u32(&buf[28..]),
            sector_size: LittleEndian::read_u32(&buf[32..]),
            dev_type: LittleEndian::read_u64(&buf[36..]),
            generation: LittleEndian::read_u64(&buf[44..]),
            start_offset: LittleEndian::read_u64(&buf[52..]),
            dev_group: LittleEndian::read_u32(&buf[60..]),
            seek_speed: buf[64],
            bandwidth: buf[65],
            uuid: read_uuid(&buf[66..]),
            fsid: read_uuid(&buf[82..]),
        })
    }

    /// 序列化到缓冲区（长度 >= 98）
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..], self.devid);
        LittleEndian::write_u64(&mut buf[8..], self.total_bytes);
        LittleEndian::write_u64(&mut buf[16..], self.bytes_used);
        LittleEndian::write_u32(&mut buf[24..], self.io_align);
        LittleEndian::write_u32(&mut buf[28..], self.io_width);
        LittleEndian::write_u32(&mut buf[32..], self.sector_size);
        LittleEndian::write_u64(&mut buf[36..], self.dev_type);
        LittleEndian::write_u64(&mut buf[44..], self.generation);
        LittleEndian::write_u64(&mut buf[52..], self.start_offset);
        LittleEndian::write_u32(&mut buf[60..], self.dev_group);
        buf[64] = self.seek_speed;
        buf[65] = self.bandwidth;
        buf[66..82].copy_from_slice(&self.uuid);
        buf[82..98].copy_from_slice(&self.fsid);
    }
}

//=============================================================================
// Chunk 项
//=============================================================================

/// Chunk 中的一个条带（btrfs_stripe）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stripe {
    /// 设备 ID
    pub devid: u64,
    /// 设备上的物理偏移
    pub offset: u64,
    /// 设备 UUID
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

impl Stripe {
    /// 磁盘上的大小
    pub const SIZE: usize = 32;
}

/// Chunk 项（btrfs_chunk）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkItem {
    /// 逻辑长度
    pub length: u64,
    /// 所属树（总是 extent tree）
    pub owner: u64,
    /// 条带长度
    pub stripe_len: u64,
    /// 块组类型 + profile 位
    pub chunk_type: u64,
    /// I/O 对齐
    pub io_align: u32,
    /// I/O 宽度
    pub io_width: u32,
    /// 扇区大小
    pub sector_size: u32,
    /// 条带数
    pub num_stripes: u16,
    /// RAID10 子条带数
    pub sub_stripes: u16,
    /// 条带列表
    pub stripes: Vec<Stripe>,
}

impl ChunkItem {
    /// 条带数组之前的固定部分大小
    pub const FIXED_SIZE: usize = 48;

    /// 给定条带数时的完整大小
    pub const fn item_size(num_stripes: usize) -> usize {
        Self::FIXED_SIZE + num_stripes * Stripe::SIZE
    }

    /// 解析 chunk 项，返回 (chunk, 消耗的字节数)
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(Error::new(ErrorKind::Corrupted, "chunk item too short"));
        }
        let num_stripes = LittleEndian::read_u16(&buf[44..]);
        if num_stripes == 0 {
            return Err(Error::new(
                ErrorKind::Corrupted,
                "chunk item has zero stripes",
            ));
        }
        let size = Self::item_size(num_stripes as usize);
        if buf.len() < size {
            return Err(Error::new(
                ErrorKind::Corrupted,
                "chunk item stripes exceed item size",
            ));
        }

        let mut stripes = Vec::with_capacity(num_stripes as usize);
        for i in 0..num_stripes as usize {
            let base = Self::FIXED_SIZE + i * Stripe::SIZE;
            stripes.push(Stripe {
                devid: LittleEndian::read_u64(&buf[base..]),
                offset: LittleEndian::read_u64(&buf[base + 8..]),
                dev_uuid: read_uuid(&buf[base + 16..]),
            });
        }

        Ok((
            Self {
                length: LittleEndian::read_u64(&buf[0..]),
                owner: LittleEndian::read_u64(&buf[8..]),
                stripe_len: LittleEndian::read_u64(&buf[16..]),
                chunk_type: LittleEndian::read_u64(&buf[24..]),
                io_align: LittleEndian::read_u32(&buf[32..]),
                io_width: LittleEndian::read_u32(&buf[36..]),
                sector_size: LittleEndian::read_u32(&buf[40..]),
                num_stripes,
                sub_stripes: LittleEndian::read_u16(&buf[46..]),
                stripes,
            },
            size,
        ))
    }

    /// 序列化为字节
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; Self::item_size(self.stripes.len())];
        LittleEndian::write_u64(&mut buf[0..], self.length);
        LittleEndian::write_u64(&mut buf[8..], self.owner);
        LittleEndian::write_u64(&mut buf[16..], self.stripe_len);
        LittleEndian::write_u64(&mut buf[24..], self.chunk_type);
        LittleEndian::write_u32(&mut buf[32..], self.io_align);
        LittleEndian::write_u32(&mut buf[36..], self.io_width);
        LittleEndian::write_u32(&mut buf[40..], self.sector_size);
        LittleEndian::write_u16(&mut buf[44..], self.stripes.len() as u16);
        LittleEndian::write_u16(&mut buf[46..], self.sub_stripes);
        for (i, stripe) in self.stripes.iter().enumerate() {
            let base = Self::FIXED_SIZE + i * Stripe::SIZE;
            LittleEndian::write_u64(&mut buf[base..], stripe.devid);
            LittleEndian::write_u64(&mut buf[base + 8..], stripe.offset);
            buf[base + 16..base + 32].copy_from_slice(&stripe.dev_uuid);
        }
        buf
    }
}

//=============================================================================
// 备份根
//=============================================================================

/// superblock 中的备份根（btrfs_root_backup）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootBackup {
    pub tree_root: u64,
    pub tree_root_gen: u64,
    pub chunk_root: u64,
    pub chunk_root_gen: u64,
    pub extent_root: u64,
    pub extent_root_gen: u64,
    pub fs_root: u64,
    pub fs_root_gen: u64,
    pub dev_root: u64,
    pub dev_root_gen: u64,
    pub csum_root: u64,
    pub csum_root_gen: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
}

impl RootBackup {
    /// 磁盘上的大小
    pub const SIZE: usize = 168;

    /// 解析（调用方保证长度 >= 168）
    pub fn parse(buf: &[u8]) -> Self {
        let u = |i: usize| LittleEndian::read_u64(&buf[i * 8..]);
        Self {
            tree_root: u(0),
            tree_root_gen: u(1),
            chunk_root: u(2),
            chunk_root_gen: u(3),
            extent_root: u(4),
            extent_root_gen: u(5),
            fs_root: u(6),
            fs_root_gen: u(7),
            dev_root: u(8),
            dev_root_gen: u(9),
            csum_root: u(10),
            csum_root_gen: u(11),
            total_bytes: u(12),
            bytes_used: u(13),
            num_devices: u(14),
            // 15..19 为 unused_64[4]
            tree_root_level: buf[152],
            chunk_root_level: buf[153],
            extent_root_level: buf[154],
            fs_root_level: buf[155],
            dev_root_level: buf[156],
            csum_root_level: buf[157],
        }
    }

    /// 序列化（整槽清零后写入，填充字段保持为 0）
    pub fn write(&self, buf: &mut [u8]) {
        buf[..Self::SIZE].fill(0);
        let fields = [
            self.tree_root,
            self.tree_root_gen,
            self.chunk_root,
            self.chunk_root_gen,
            self.extent_root,
            self.extent_root_gen,
            self.fs_root,
            self.fs_root_gen,
            self.dev_root,
            self.dev_root_gen,
            self.csum_root,
            self.csum_root_gen,
            self.total_bytes,
            self.bytes_used,
            self.num_devices,
        ];
        for (i, val) in fields.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * 8..], *val);
        }
        buf[152] = self.tree_root_level;
        buf[153] = self.chunk_root_level;
        buf[154] = self.extent_root_level;
        buf[155] = self.fs_root_level;
        buf[156] = self.dev_root_level;
        buf[157] = self.csum_root_level;
    }
}

//=============================================================================
// Root 项
//=============================================================================

/// Root 项（btrfs_root_item）
///
/// 只解析元数据引擎关心的字段；其余字段（内嵌 inode、时间戳）按原样保存在 `raw` 中，
/// 回写时不会丢失。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootItem {
    /// 原始字节（239 字节旧格式或 439 字节新格式）
    raw: Vec<u8>,
}

impl RootItem {
    /// 当前格式大小
    pub const SIZE: usize = 439;

    /// 旧格式（无 generation_v2 / uuid）大小
    pub const LEGACY_SIZE: usize = 239;

    const GENERATION: usize = 160;
    const ROOT_DIRID: usize = 168;
    const BYTENR: usize = 176;
    const BYTES_USED: usize = 192;
    const LAST_SNAPSHOT: usize = 200;
    const FLAGS: usize = 208;
    const REFS: usize = 216;
    const DROP_LEVEL: usize = 237;
    const LEVEL: usize = 238;
    const GENERATION_V2: usize = 239;
    const UUID: usize = 247;

    /// 创建全新的 root 项
    pub fn new(bytenr: u64, generation: u64, level: u8) -> Self {
        let mut item = Self {
            raw: alloc::vec![0u8; Self::SIZE],
        };
        item.set_bytenr(bytenr);
        item.set_generation(generation);
        item.set_level(level);
        item.set_refs(1);
        item
    }

    /// 从叶子项数据解析
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEGACY_SIZE {
            return Err(Error::new(ErrorKind::Corrupted, "root item too short"));
        }
        let len = buf.len().min(Self::SIZE);
        Ok(Self {
            raw: buf[..len].to_vec(),
        })
    }

    /// 原始字节
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn u64_at(&self, off: usize) -> u64 {
        LittleEndian::read_u64(&self.raw[off..off + 8])
    }

    fn set_u64_at(&mut self, off: usize, val: u64) {
        LittleEndian::write_u64(&mut self.raw[off..off + 8], val)
    }

    /// 是否带有 v2 扩展字段
    pub fn has_v2_fields(&self) -> bool {
        self.raw.len() >= Self::SIZE
    }

    /// 根节点 generation
    pub fn generation(&self) -> u64 {
        self.u64_at(Self::GENERATION)
    }

    /// 设置 generation（新格式同时更新 generation_v2）
    pub fn set_generation(&mut self, gen: u64) {
        self.set_u64_at(Self::GENERATION, gen);
        if self.has_v2_fields() {
            self.set_u64_at(Self::GENERATION_V2, gen);
        }
    }

    /// 根目录 objectid
    pub fn root_dirid(&self) -> u64 {
        self.u64_at(Self::ROOT_DIRID)
    }

    /// 根节点逻辑地址
    pub fn bytenr(&self) -> u64 {
        self.u64_at(Self::BYTENR)
    }

    /// 设置根节点逻辑地址
    pub fn set_bytenr(&mut self, bytenr: u64) {
        self.set_u64_at(Self::BYTENR, bytenr)
    }

    /// 已用字节
    pub fn bytes_used(&self) -> u64 {
        self.u64_at(Self::BYTES_USED)
    }

    /// 最近一次快照的 generation
    pub fn last_snapshot(&self) -> u64 {
        self.u64_at(Self::LAST_SNAPSHOT)
    }

    /// flags
    pub fn flags(&self) -> u64 {
        self.u64_at(Self::FLAGS)
    }

    /// 引用计数
    pub fn refs(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[Self::REFS..])
    }

    /// 设置引用计数
    pub fn set_refs(&mut self, refs: u32) {
        LittleEndian::write_u32(&mut self.raw[Self::REFS..], refs)
    }

    /// drop 进度层级
    pub fn drop_level(&self) -> u8 {
        self.raw[Self::DROP_LEVEL]
    }

    /// 根节点层级
    pub fn level(&self) -> u8 {
        self.raw[Self::LEVEL]
    }

    /// 设置根节点层级
    pub fn set_level(&mut self, level: u8) {
        self.raw[Self::LEVEL] = level
    }

    /// generation_v2（旧格式返回 None）
    pub fn generation_v2(&self) -> Option<u64> {
        self.has_v2_fields()
            .then(|| self.u64_at(Self::GENERATION_V2))
    }

    /// 子卷 UUID（旧格式返回 None）
    pub fn uuid(&self) -> Option<[u8; BTRFS_UUID_SIZE]> {
        self.has_v2_fields().then(|| read_uuid(&self.raw[Self::UUID..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = Key::new(1, BTRFS_ROOT_ITEM_KEY, 0);
        let b = Key::new(1, BTRFS_ROOT_ITEM_KEY, 5);
        let c = Key::new(2, BTRFS_INODE_ITEM_KEY, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(Key::MIN < a && c < Key::MAX);
    }

    #[test]
    fn test_key_bytes() {
        let key = Key::new(0x1122_3344, BTRFS_CHUNK_ITEM_KEY, 0x5566);
        let mut buf = [0u8; Key::SIZE];
        key.write(&mut buf);
        assert_eq!(buf[8], BTRFS_CHUNK_ITEM_KEY);
        assert_eq!(Key::read(&buf), key);
    }

    #[test]
    fn test_chunk_item_parse() {
        let chunk = ChunkItem {
            length: 8 << 20,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            chunk_type: BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_DUP,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 2,
            sub_stripes: 1,
            stripes: alloc::vec![
                Stripe { devid: 1, offset: 1 << 20, dev_uuid: [1; 16] },
                Stripe { devid: 1, offset: 9 << 20, dev_uuid: [1; 16] },
            ],
        };
        let bytes = chunk.to_bytes();
        assert_eq!(bytes.len(), ChunkItem::item_size(2));

        let (parsed, used) = ChunkItem::parse(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_chunk_item_zero_stripes() {
        let buf = [0u8; ChunkItem::FIXED_SIZE];
        let err = ChunkItem::parse(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_root_item_fields() {
        let mut item = RootItem::new(0x40_0000, 7, 1);
        assert_eq!(item.bytenr(), 0x40_0000);
        assert_eq!(item.generation(), 7);
        assert_eq!(item.generation_v2(), Some(7));
        assert_eq!(item.level(), 1);
        assert_eq!(item.refs(), 1);

        item.set_generation(9);
        let parsed = RootItem::parse(item.as_bytes()).unwrap();
        assert_eq!(parsed.generation(), 9);
        assert_eq!(parsed.generation_v2(), Some(9));
    }

    #[test]
    fn test_legacy_root_item() {
        let full = RootItem::new(4096, 3, 0);
        let legacy = RootItem::parse(&full.as_bytes()[..RootItem::LEGACY_SIZE]).unwrap();
        assert_eq!(legacy.bytenr(), 4096);
        assert_eq!(legacy.generation_v2(), None);
        assert!(RootItem::parse(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_dev_item_bytes() {
        let item = DevItem {
            devid: 3,
            total_bytes: 1 << 30,
            bytes_used: 1 << 20,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            uuid: [0xaa; 16],
            fsid: [0xbb; 16],
            ..Default::default()
        };
        let mut buf = [0u8; DevItem::SIZE];
        item.write(&mut buf);
        assert_eq!(DevItem::parse(&buf).unwrap(), item);
    }

    #[test]
    fn test_root_backup_bytes() {
        let backup = RootBackup {
            tree_root: 1,
            tree_root_gen: 2,
            csum_root_gen: 12,
            num_devices: 1,
            tree_root_level: 1,
            csum_root_level: 2,
            ..Default::default()
        };
        let mut buf = [0xffu8; RootBackup::SIZE];
        backup.write(&mut buf);
        assert_eq!(RootBackup::parse(&buf), backup);
        assert!(buf[158..].iter().all(|&b| b == 0));
    }
}
