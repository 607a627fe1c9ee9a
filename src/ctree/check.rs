//! 树块结构检查
//!
//! 与读取路径上的树块头检查不同，这里逐项检查叶子/节点的内部一致性，
//! 供检查工具使用。

use super::extent_buffer::{ExtentBuffer, HEADER_SIZE, ITEM_SIZE};
use crate::consts::*;
use crate::types::Key;

/// 树块检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// 正常
    Ok,
    /// 条目数非法
    InvalidNritems,
    /// 首键与父节点中的键不一致
    InvalidParentKey,
    /// 键顺序错误
    BadKeyOrder,
    /// 层级非法
    InvalidLevel,
    /// item 头与数据区重叠
    InvalidFreeSpace,
    /// item 数据偏移不连续或越界
    InvalidOffsets,
    /// 子节点指针非法
    InvalidBlockptr,
}

impl BlockStatus {
    /// 是否正常
    pub fn is_ok(self) -> bool {
        self == BlockStatus::Ok
    }
}

/// 检查键是否严格递增
pub fn check_key_order(eb: &ExtentBuffer) -> bool {
    let nr = eb.nritems() as usize;
    (1..nr).all(|i| eb.key_at(i - 1) < eb.key_at(i))
}

/// 检查叶子
///
/// # 参数
///
/// * `eb` - 叶子
/// * `parent_key` - 父节点中指向它的键（根节点为 None）
pub fn check_leaf(eb: &ExtentBuffer, parent_key: Option<&Key>) -> BlockStatus {
    if eb.level() != 0 {
        return BlockStatus::InvalidLevel;
    }
    let nr = eb.nritems() as usize;
    if nr == 0 {
        // 空叶子只允许出现在根
        return if parent_key.is_some() {
            BlockStatus::InvalidNritems
        } else {
            BlockStatus::Ok
        };
    }
    if nr > eb.max_leaf_items() {
        return BlockStatus::InvalidNritems;
    }

    if let Some(pk) = parent_key {
        if eb.item_key(0) != *pk {
            log::debug!(
                "[CHECK] leaf {:#x} first key {} differs from parent key {}",
                eb.start(),
                eb.item_key(0),
                pk
            );
            return BlockStatus::InvalidParentKey;
        }
    }

    let data_size = eb.leaf_data_size();
    for i in 0..nr {
        if i > 0 && eb.item_key(i - 1) >= eb.item_key(i) {
            log::debug!("[CHECK] leaf {:#x} bad key order at slot {}", eb.start(), i);
            return BlockStatus::BadKeyOrder;
        }

        let expected_end = if i == 0 {
            data_size
        } else {
            eb.item_offset(i - 1) as usize
        };
        let offset = eb.item_offset(i) as usize;
        let size = eb.item_size(i) as usize;
        if offset + size != expected_end || offset + size > data_size {
            log::debug!(
                "[CHECK] leaf {:#x} slot {} data [{}, {}) expected end {}",
                eb.start(),
                i,
                offset,
                offset + size,
                expected_end
            );
            return BlockStatus::InvalidOffsets;
        }
        if (i + 1) * ITEM_SIZE > offset {
            return BlockStatus::InvalidFreeSpace;
        }
    }
    BlockStatus::Ok
}

/// 检查内部节点
///
/// 指针必须按 `sectorsize` 对齐且不为 0。
pub fn check_node(eb: &ExtentBuffer, parent_key: Option<&Key>, sectorsize: u32) -> BlockStatus {
    let level = eb.level();
    if level == 0 || level >= BTRFS_MAX_LEVEL {
        return BlockStatus::InvalidLevel;
    }
    let nr = eb.nritems() as usize;
    if nr == 0 || nr > eb.max_node_ptrs() {
        return BlockStatus::InvalidNritems;
    }
    if HEADER_SIZE + nr * super::extent_buffer::KEY_PTR_SIZE > eb.len() {
        return BlockStatus::InvalidNritems;
    }
    if let Some(pk) = parent_key {
        if eb.node_key(0) != *pk {
            return BlockStatus::InvalidParentKey;
        }
    }
    for i in 0..nr {
        let ptr = eb.node_blockptr(i);
        if ptr == 0 || ptr % sectorsize as u64 != 0 {
            log::debug!("[CHECK] node {:#x} slot {} bad blockptr {:#x}", eb.start(), i, ptr);
            return BlockStatus::InvalidBlockptr;
        }
        if i > 0 && eb.node_key(i - 1) >= eb.node_key(i) {
            return BlockStatus::BadKeyOrder;
        }
    }
    BlockStatus::Ok
}
