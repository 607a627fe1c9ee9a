//! btrfs 磁盘格式常量定义
//!
//! 这个模块包含了 btrfs 磁盘格式的常量定义，包括：
//! - 磁盘布局相关常量（superblock 位置、大小）
//! - 树对象 ID 与键类型
//! - 块组（chunk）类型与冗余 profile 位
//! - 特性标志

//=============================================================================
// 基础常量
//=============================================================================

/// 最小扇区大小
pub const BTRFS_MIN_SECTORSIZE: u32 = 4096;

/// 最大扇区 / 节点大小（64 KiB）
pub const BTRFS_MAX_METADATA_BLOCKSIZE: u32 = 65536;

/// 默认节点大小
pub const BTRFS_DEFAULT_NODESIZE: u32 = 16384;

/// 校验和字段长度
pub const BTRFS_CSUM_SIZE: usize = 32;

/// FSID 长度
pub const BTRFS_FSID_SIZE: usize = 16;

/// UUID 长度
pub const BTRFS_UUID_SIZE: usize = 16;

/// 卷标长度
pub const BTRFS_LABEL_SIZE: usize = 256;

/// 树的最大层数（合法层号为 0..8）
pub const BTRFS_MAX_LEVEL: u8 = 8;

/// 条带长度（64 KiB）
pub const BTRFS_STRIPE_LEN: u64 = 64 * 1024;

//=============================================================================
// Superblock 相关
//=============================================================================

/// 主 superblock 在设备上的字节偏移
pub const BTRFS_SUPER_INFO_OFFSET: u64 = 65536;

/// Superblock 大小（字节）
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

/// 每个设备上的 superblock 副本数
pub const BTRFS_SUPER_MIRROR_MAX: usize = 3;

/// 备份副本偏移的移位量
pub const BTRFS_SUPER_MIRROR_SHIFT: u32 = 12;

/// 备份根槽位数量
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

/// 内嵌 system chunk 数组的最大长度
pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;

/// btrfs 魔数 ("_BHRfS_M")
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// mkfs 构建过程中的临时魔数 ("_BHRf$_M")
pub const BTRFS_MAGIC_TEMPORARY: u64 = 0x4D5F_2466_5248_425F;

/// 第 `mirror` 个 superblock 副本的字节偏移
///
/// 对应 btrfs 的 `btrfs_sb_offset()`：64 KiB、64 MiB、256 GiB。
pub const fn btrfs_sb_offset(mirror: usize) -> u64 {
    let start: u64 = 16 * 1024;
    if mirror > 0 {
        start << (BTRFS_SUPER_MIRROR_SHIFT as u64 * mirror as u64)
    } else {
        BTRFS_SUPER_INFO_OFFSET
    }
}

//=============================================================================
// Superblock / 树块头 flags
//=============================================================================

/// 树块已写出
pub const BTRFS_HEADER_FLAG_WRITTEN: u64 = 1 << 0;
/// 树块属于 reloc 树
pub const BTRFS_HEADER_FLAG_RELOC: u64 = 1 << 1;
/// superblock 错误标志
pub const BTRFS_SUPER_FLAG_ERROR: u64 = 1 << 2;
/// seed 文件系统
pub const BTRFS_SUPER_FLAG_SEEDING: u64 = 1 << 32;
/// metadump 镜像
pub const BTRFS_SUPER_FLAG_METADUMP: u64 = 1 << 33;
/// metadump v2 镜像
pub const BTRFS_SUPER_FLAG_METADUMP_V2: u64 = 1 << 34;
/// fsid 修改中
pub const BTRFS_SUPER_FLAG_CHANGING_FSID: u64 = 1 << 35;
/// metadata_uuid 方式修改 fsid 中
pub const BTRFS_SUPER_FLAG_CHANGING_FSID_V2: u64 = 1 << 36;

/// 树块头中 backref 版本的位移
pub const BTRFS_BACKREF_REV_SHIFT: u32 = 56;
/// 混合 backref 版本
pub const BTRFS_MIXED_BACKREF_REV: u64 = 1;

//=============================================================================
// 树对象 ID
//=============================================================================

/// root tree
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
/// extent tree
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
/// chunk tree
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
/// device tree
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
/// 默认子卷 fs tree
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
/// root tree 目录
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
/// csum tree
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
/// quota tree
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;
/// uuid tree
pub const BTRFS_UUID_TREE_OBJECTID: u64 = 9;
/// free space tree
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;
/// block group tree
pub const BTRFS_BLOCK_GROUP_TREE_OBJECTID: u64 = 11;
/// raid stripe tree
pub const BTRFS_RAID_STRIPE_TREE_OBJECTID: u64 = 12;
/// log tree
pub const BTRFS_TREE_LOG_OBJECTID: u64 = -6i64 as u64;
/// log root tree 的 fixup
pub const BTRFS_TREE_LOG_FIXUP_OBJECTID: u64 = -7i64 as u64;
/// reloc tree
pub const BTRFS_TREE_RELOC_OBJECTID: u64 = -8i64 as u64;
/// data reloc tree
pub const BTRFS_DATA_RELOC_TREE_OBJECTID: u64 = -9i64 as u64;
/// 第一个普通子卷 ID
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
/// 最后一个普通子卷 ID
pub const BTRFS_LAST_FREE_OBJECTID: u64 = -256i64 as u64;
/// chunk item 的 objectid
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;
/// dev item 的 objectid
pub const BTRFS_DEV_ITEMS_OBJECTID: u64 = 1;

//=============================================================================
// 键类型
//=============================================================================

/// inode item
pub const BTRFS_INODE_ITEM_KEY: u8 = 1;
/// root item
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
/// root backref
pub const BTRFS_ROOT_BACKREF_KEY: u8 = 144;
/// root ref
pub const BTRFS_ROOT_REF_KEY: u8 = 156;
/// extent item
pub const BTRFS_EXTENT_ITEM_KEY: u8 = 168;
/// metadata item（skinny metadata）
pub const BTRFS_METADATA_ITEM_KEY: u8 = 169;
/// block group item
pub const BTRFS_BLOCK_GROUP_ITEM_KEY: u8 = 192;
/// free space info
pub const BTRFS_FREE_SPACE_INFO_KEY: u8 = 198;
/// dev extent
pub const BTRFS_DEV_EXTENT_KEY: u8 = 204;
/// dev item
pub const BTRFS_DEV_ITEM_KEY: u8 = 216;
/// chunk item
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;
/// 持久化项（dev stats）
pub const BTRFS_PERSISTENT_ITEM_KEY: u8 = 249;
/// dev replace 状态
pub const BTRFS_DEV_REPLACE_KEY: u8 = 250;
/// uuid tree：子卷 uuid
pub const BTRFS_UUID_KEY_SUBVOL: u8 = 251;
/// uuid tree：接收子卷 uuid
pub const BTRFS_UUID_KEY_RECEIVED_SUBVOL: u8 = 252;

//=============================================================================
// 块组类型与冗余 profile
//=============================================================================

/// 数据块组
pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
/// system 块组
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
/// 元数据块组
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
/// RAID0
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
/// RAID1
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
/// DUP
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
/// RAID10
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
/// RAID5
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
/// RAID6
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;
/// RAID1C3
pub const BTRFS_BLOCK_GROUP_RAID1C3: u64 = 1 << 9;
/// RAID1C4
pub const BTRFS_BLOCK_GROUP_RAID1C4: u64 = 1 << 10;

/// 块组类型掩码
pub const BTRFS_BLOCK_GROUP_TYPE_MASK: u64 =
    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_METADATA;

/// RAID1 系列掩码
pub const BTRFS_BLOCK_GROUP_RAID1_MASK: u64 =
    BTRFS_BLOCK_GROUP_RAID1 | BTRFS_BLOCK_GROUP_RAID1C3 | BTRFS_BLOCK_GROUP_RAID1C4;

/// RAID5/6 掩码
pub const BTRFS_BLOCK_GROUP_RAID56_MASK: u64 = BTRFS_BLOCK_GROUP_RAID5 | BTRFS_BLOCK_GROUP_RAID6;

/// 冗余 profile 掩码
pub const BTRFS_BLOCK_GROUP_PROFILE_MASK: u64 = BTRFS_BLOCK_GROUP_RAID0
    | BTRFS_BLOCK_GROUP_RAID1_MASK
    | BTRFS_BLOCK_GROUP_RAID56_MASK
    | BTRFS_BLOCK_GROUP_DUP
    | BTRFS_BLOCK_GROUP_RAID10;

/// RAID5 P 校验条带哨兵（逻辑读永远不会直接寻址）
pub const BTRFS_RAID5_P_STRIPE: u64 = (-2i64) as u64;

/// RAID6 Q 校验条带哨兵
pub const BTRFS_RAID6_Q_STRIPE: u64 = (-1i64) as u64;

//=============================================================================
// 特性标志
//=============================================================================

/// 混合 backref
pub const BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF: u64 = 1 << 0;
/// 默认子卷
pub const BTRFS_FEATURE_INCOMPAT_DEFAULT_SUBVOL: u64 = 1 << 1;
/// 混合块组
pub const BTRFS_FEATURE_INCOMPAT_MIXED_GROUPS: u64 = 1 << 2;
/// LZO 压缩
pub const BTRFS_FEATURE_INCOMPAT_COMPRESS_LZO: u64 = 1 << 3;
/// ZSTD 压缩
pub const BTRFS_FEATURE_INCOMPAT_COMPRESS_ZSTD: u64 = 1 << 4;
/// 大元数据块
pub const BTRFS_FEATURE_INCOMPAT_BIG_METADATA: u64 = 1 << 5;
/// 扩展 inode ref
pub const BTRFS_FEATURE_INCOMPAT_EXTENDED_IREF: u64 = 1 << 6;
/// RAID5/6
pub const BTRFS_FEATURE_INCOMPAT_RAID56: u64 = 1 << 7;
/// skinny metadata
pub const BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA: u64 = 1 << 8;
/// 无空洞
pub const BTRFS_FEATURE_INCOMPAT_NO_HOLES: u64 = 1 << 9;
/// metadata_uuid
pub const BTRFS_FEATURE_INCOMPAT_METADATA_UUID: u64 = 1 << 10;
/// RAID1C3/4
pub const BTRFS_FEATURE_INCOMPAT_RAID1C34: u64 = 1 << 11;
/// 分区设备
pub const BTRFS_FEATURE_INCOMPAT_ZONED: u64 = 1 << 12;
/// extent tree v2
pub const BTRFS_FEATURE_INCOMPAT_EXTENT_TREE_V2: u64 = 1 << 13;
/// raid stripe tree
pub const BTRFS_FEATURE_INCOMPAT_RAID_STRIPE_TREE: u64 = 1 << 14;
/// simple quota
pub const BTRFS_FEATURE_INCOMPAT_SIMPLE_QUOTA: u64 = 1 << 16;

/// free space tree
pub const BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE: u64 = 1 << 0;
/// free space tree 有效
pub const BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID: u64 = 1 << 1;
/// verity
pub const BTRFS_FEATURE_COMPAT_RO_VERITY: u64 = 1 << 2;
/// block group tree
pub const BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE: u64 = 1 << 3;

/// 支持的 compat 特性
pub const BTRFS_FEATURE_COMPAT_SUPP: u64 = 0;

/// 支持的 compat_ro 特性
pub const BTRFS_FEATURE_COMPAT_RO_SUPP: u64 = BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE
    | BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID
    | BTRFS_FEATURE_COMPAT_RO_VERITY
    | BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE;

/// 支持的 incompat 特性
pub const BTRFS_FEATURE_INCOMPAT_SUPP: u64 = BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF
    | BTRFS_FEATURE_INCOMPAT_DEFAULT_SUBVOL
    | BTRFS_FEATURE_INCOMPAT_MIXED_GROUPS
    | BTRFS_FEATURE_INCOMPAT_COMPRESS_LZO
    | BTRFS_FEATURE_INCOMPAT_COMPRESS_ZSTD
    | BTRFS_FEATURE_INCOMPAT_BIG_METADATA
    | BTRFS_FEATURE_INCOMPAT_EXTENDED_IREF
    | BTRFS_FEATURE_INCOMPAT_RAID56
    | BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA
    | BTRFS_FEATURE_INCOMPAT_NO_HOLES
    | BTRFS_FEATURE_INCOMPAT_METADATA_UUID
    | BTRFS_FEATURE_INCOMPAT_RAID1C34
    | BTRFS_FEATURE_INCOMPAT_EXTENT_TREE_V2
    | BTRFS_FEATURE_INCOMPAT_RAID_STRIPE_TREE
    | BTRFS_FEATURE_INCOMPAT_SIMPLE_QUOTA;
