//! Superblock 校验和
//!
//! 校验和覆盖 [32, 4096) 字节，算法由 superblock 自身的 `csum_type` 决定。

use super::{Superblock, SUPER_CSUM_START};
use crate::consts::BTRFS_CSUM_SIZE;
use crate::csum::{CsumDigest, CsumType};
use crate::error::Result;

/// 计算 superblock 校验和
///
/// # 参数
/// * `sb` - superblock
///
/// # 返回
/// 32 字节槽位内容；`csum_type` 未知时返回错误
pub fn compute_checksum(sb: &Superblock) -> Result<CsumDigest> {
    let csum = sb.csum_type()?;
    Ok(csum.compute(&sb.as_bytes()[SUPER_CSUM_START..]))
}

/// 验证 superblock 校验和
pub fn verify_checksum(sb: &Superblock) -> bool {
    match sb.csum_type() {
        Ok(csum) => csum.verify(&sb.as_bytes()[SUPER_CSUM_START..], sb.csum()),
        Err(_) => false,
    }
}

/// 重新计算并写入校验和
pub fn set_checksum(sb: &mut Superblock) -> Result<()> {
    let digest = compute_checksum(sb)?;
    sb.as_bytes_mut()[..BTRFS_CSUM_SIZE].copy_from_slice(&digest);
    Ok(())
}

/// 以指定算法写入校验和（mkfs 构建时 csum_type 字段可能尚未写入）
pub fn set_checksum_with(sb: &mut Superblock, csum: CsumType) {
    sb.set_csum_type(csum);
    let digest = csum.compute(&sb.as_bytes()[SUPER_CSUM_START..]);
    sb.as_bytes_mut()[..BTRFS_CSUM_SIZE].copy_from_slice(&digest);
}
