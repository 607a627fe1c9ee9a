//! CRC32C 辅助函数
//!
//! btrfs 在两处使用 CRC32C：元数据校验和（标准 CRC32C，初值 ~0，结果取反），
//! 以及目录项名字哈希（初值 ~1，结果不取反）。

/// 标准 CRC32C 初值
pub const BTRFS_CRC32_INIT: u32 = !0u32;

/// 计算标准 CRC32C（一次性计算）
///
/// 等价于 `~crc32c_le(~0, data)`，即树块与 superblock 所用的校验值。
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// 计算标准 CRC32C（追加模式）
///
/// # 参数
/// * `crc` - 前一段数据的 CRC32C 结果
/// * `data` - 追加的数据
///
/// # 返回
/// 两段数据拼接后的 CRC32C 值
#[inline]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// 以原始种子计算 CRC32C（不做初值与结果取反）
///
/// 对应内核中的 `crc32c(seed, data, len)`。
///
/// # 参数
/// * `seed` - 原始种子
/// * `data` - 输入数据
#[inline]
pub fn btrfs_crc32c(seed: u32, data: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, data)
}

/// 目录项名字哈希
///
/// 用于 DIR_ITEM 键的 offset。
#[inline]
pub fn btrfs_name_hash(name: &[u8]) -> u64 {
    btrfs_crc32c(!1u32, name) as u64
}

/// 扩展引用哈希（INODE_EXTREF 键的 offset）
#[inline]
pub fn btrfs_extref_hash(parent_objectid: u64, name: &[u8]) -> u64 {
    btrfs_crc32c(parent_objectid as u32, name) as u64
}
