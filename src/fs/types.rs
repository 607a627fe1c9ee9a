//! 会话配置与统计类型

use bitflags::bitflags;

bitflags! {
    /// 打开文件系统时的选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// 可写打开
        const WRITES                      = 1 << 0;
        /// 容忍部分树根损坏
        const PARTIAL                     = 1 << 1;
        /// 从最佳备份根打开 root tree
        const BACKUP_ROOT                 = 1 << 2;
        /// 允许 generation 不匹配的树块（标记后加入重新 COW 列表）
        const ALLOW_TRANSID_MISMATCH      = 1 << 3;
        /// 不检查树块头中的 FSID
        const IGNORE_FSID_MISMATCH        = 1 << 4;
        /// 可写打开时忽略未知的 compat_ro 特性（free space tree 将被重建）
        const INVALIDATE_FST              = 1 << 5;
        /// 接受 mkfs 临时魔数，关闭时写回正式魔数
        const TEMPORARY_SUPER             = 1 << 6;
        /// 扫描全部 superblock 副本，取最新者
        const RECOVER_SUPER               = 1 << 7;
        /// 读取树块失败时不打印错误
        const SUPPRESS_CHECK_BLOCK_ERRORS = 1 << 8;
        /// 不读取块组（保留位，当前总是如此）
        const NO_BLOCK_GROUPS             = 1 << 9;
    }
}

/// 文件系统配置
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    /// 树块缓存容量（树块数）
    pub cache_size: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_size: 256, // 默认 256 个树块
        }
    }
}

/// 树块读取统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// `read_tree_block` 调用次数
    pub tree_reads: u64,
    /// 缓存命中次数
    pub cache_hits: u64,
    /// 读取的镜像次数
    pub mirror_reads: u64,
    /// 校验和计算次数
    pub csum_attempts: u64,
    /// 校验和失败次数
    pub csum_failures: u64,
    /// generation 不匹配次数
    pub transid_mismatches: u64,
    /// RAID5/6 重建次数
    pub rebuilds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FsConfig::default();
        assert_eq!(config.cache_size, 256);
    }

    #[test]
    fn test_flags_compose() {
        let flags = OpenFlags::WRITES | OpenFlags::PARTIAL;
        assert!(flags.contains(OpenFlags::WRITES));
        assert!(!flags.contains(OpenFlags::BACKUP_ROOT));
        assert_eq!(OpenFlags::default(), OpenFlags::empty());
    }
}
