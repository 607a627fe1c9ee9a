//! btrfs_core: btrfs 元数据存储引擎的纯 Rust 实现
//!
//! 这个库实现了用户态 btrfs 工具所需的底层部分：
//! - **设备与卷**：多设备扫描、seed 文件系统、逻辑地址到物理条带的映射
//! - **树块 I/O**：带镜像回退与 RAID5/6 重建的树块读取、校验和写回
//! - **打开流程**：superblock → sys chunk array → chunk tree → root tree → 各棵树
//! - **metadump 恢复**（`std`）：多线程把元数据镜像写回设备
//!
//! # 示例
//!
//! ```rust,ignore
//! use btrfs_core::{FsConfig, FsInfo, OpenFlags, Result};
//!
//! fn main() -> Result<()> {
//!     let mut fs = FsInfo::open_path("disk.img", OpenFlags::empty(), FsConfig::default())?;
//!     println!("generation {}", fs.generation());
//!     fs.close(false)
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`block`] - 块设备抽象和 I/O 操作
//! - [`consts`] - 常量定义
//! - [`types`] - 磁盘数据结构
//! - [`csum`] - 校验和算法
//! - [`crc`] - CRC32C 与名字哈希
//! - [`superblock`] - Superblock 读写与验证
//! - [`volumes`] - 设备集合与 chunk 映射
//! - [`ctree`] - 树块缓冲区与查找
//! - [`disk_io`] - 树块读写与缓存
//! - [`fs`] - 打开后的文件系统会话
//! - [`restore`] - metadump 恢复（仅 `std`）

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 块设备抽象
pub mod block;

/// 常量定义
pub mod consts;

/// 数据结构定义
pub mod types;

/// 校验和算法
pub mod csum;

/// Superblock 操作
pub mod superblock;

/// 设备与 chunk 映射
pub mod volumes;

/// B 树
pub mod ctree;

/// 树块 I/O
pub mod disk_io;

/// 文件系统会话
pub mod fs;

/// metadump 恢复
#[cfg(feature = "std")]
pub mod restore;

/// CRC32C 辅助函数与名字哈希
pub mod crc;

#[cfg(test)]
mod testutil;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, RecoveryStatus, Result};

// 块设备
pub use block::{BlockDev, BlockDevice, DynBlockDevice, MemoryDevice};
#[cfg(all(feature = "std", unix))]
pub use block::FileDevice;

// 校验和
pub use csum::{CsumDigest, CsumType};

// 数据结构
pub use types::{ChunkItem, DevItem, Key, RootItem};

// Superblock
pub use superblock::{read_superblock, write_superblock, Superblock};

// 卷
pub use volumes::{ChunkMap, FsDevices, MapOp, MultiStripe, RaidProfile, ScanContext};

// 树
pub use ctree::{ExtentBuffer, Path, TreeReader};

// 树块 I/O
pub use disk_io::{read_tree_block, write_tree_block, ExtentCache};

// 文件系统
pub use fs::{FsConfig, FsInfo, OpenFlags, Root, Transaction};

// 恢复
#[cfg(feature = "std")]
pub use restore::{MetadumpImage, RestoreStats};
