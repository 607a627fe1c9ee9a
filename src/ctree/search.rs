//! 只读 B 树查找

use super::extent_buffer::ExtentBuffer;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{Key, RootItem};

/// 树块来源
///
/// 查找路径只需要按 `(bytenr, parent generation)` 读取子树块。
pub trait TreeReader {
    /// 读取并校验一个树块
    fn read_tree_block(&mut self, bytenr: u64, parent_transid: u64) -> Result<ExtentBuffer>;
}

/// 从根到叶子的查找路径
#[derive(Debug, Default, Clone)]
pub struct Path {
    /// 每层的树块，下标为层级
    pub nodes: [Option<ExtentBuffer>; BTRFS_MAX_LEVEL as usize],
    /// 每层的槽位
    pub slots: [usize; BTRFS_MAX_LEVEL as usize],
}

impl Path {
    /// 空路径
    pub fn new() -> Self {
        Self::default()
    }

    /// 叶子
    pub fn leaf(&self) -> Option<&ExtentBuffer> {
        self.nodes[0].as_ref()
    }

    /// 叶子槽位
    pub fn slot(&self) -> usize {
        self.slots[0]
    }

    /// 当前槽位是否指向一个有效 item
    pub fn is_valid(&self) -> bool {
        self.leaf()
            .map_or(false, |leaf| self.slots[0] < leaf.nritems() as usize)
    }

    /// 当前 item 的键
    pub fn item_key(&self) -> Option<Key> {
        self.is_valid()
            .then(|| self.leaf().map(|leaf| leaf.item_key(self.slots[0])))
            .flatten()
    }

    /// 当前 item 的数据
    pub fn item_data(&self) -> Result<&[u8]> {
        match self.leaf() {
            Some(leaf) if self.is_valid() => leaf.item_data(self.slots[0]),
            _ => Err(Error::new(ErrorKind::NotFound, "path has no current item")),
        }
    }

    /// 释放路径上的树块
    pub fn release(&mut self) {
        *self = Self::default();
    }
}

/// 二分查找：返回 (是否命中, 第一个 >= key 的槽位)
pub fn bin_search(eb: &ExtentBuffer, key: &Key) -> (bool, usize) {
    let mut low = 0usize;
    let mut high = eb.nritems() as usize;
    while low < high {
        let mid = low + (high - low) / 2;
        match eb.key_at(mid).cmp(key) {
            core::cmp::Ordering::Less => low = mid + 1,
            core::cmp::Ordering::Greater => high = mid,
            core::cmp::Ordering::Equal => return (true, mid),
        }
    }
    (false, low)
}

/// 从 `root` 开始查找 `key`
///
/// 命中时叶子槽位指向该 item；未命中时指向插入位置（可能等于 nritems）。
///
/// # 返回
///
/// 是否精确命中
pub fn search_slot<R: TreeReader + ?Sized>(
    reader: &mut R,
    root: &ExtentBuffer,
    key: &Key,
    path: &mut Path,
) -> Result<bool> {
    search_slot_level(reader, root, key, path, 0)
}

/// 查找 `key`，下降到 `lowest_level` 为止
///
/// `lowest_level` 大于 0 时，该层的槽位指向覆盖 `key` 的子指针，
/// 与中间层的取法相同。`lowest_level` 高于根节点层级时返回 `NotFound`。
pub fn search_slot_level<R: TreeReader + ?Sized>(
    reader: &mut R,
    root: &ExtentBuffer,
    key: &Key,
    path: &mut Path,
    lowest_level: usize,
) -> Result<bool> {
    path.release();
    if lowest_level > root.level() as usize {
        return Err(Error::new(ErrorKind::NotFound, "level above tree root"));
    }
    let mut eb = root.clone();
    loop {
        let level = eb.level() as usize;
        if level >= BTRFS_MAX_LEVEL as usize {
            return Err(Error::new(ErrorKind::Corrupted, "tree level too high"));
        }
        let (found, mut slot) = bin_search(&eb, key);
        if level == 0 {
            path.slots[0] = slot;
            path.nodes[0] = Some(eb);
            return Ok(found);
        }
        if !found && slot > 0 {
            slot -= 1;
        }
        if eb.nritems() == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "empty tree node"));
        }
        if level == lowest_level {
            path.slots[level] = slot;
            path.nodes[level] = Some(eb);
            return Ok(found);
        }
        let ptr = eb.node_blockptr(slot);
        let gen = eb.node_ptr_generation(slot);
        path.slots[level] = slot;
        path.nodes[level] = Some(eb);

        let child = reader.read_tree_block(ptr, gen)?;
        if child.level() as usize + 1 != level {
            log::error!(
                "[SEARCH] child {:#x} level {} under level {}",
                ptr,
                child.level(),
                level
            );
            return Err(Error::new(ErrorKind::Corrupted, "unexpected child level"));
        }
        eb = child;
    }
}

/// 移动到下一个叶子
///
/// # 返回
///
/// `false` 表示已经是最后一个叶子
pub fn next_leaf<R: TreeReader + ?Sized>(reader: &mut R, path: &mut Path) -> Result<bool> {
    let mut level = 1usize;
    loop {
        if level >= BTRFS_MAX_LEVEL as usize {
            return Ok(false);
        }
        let (ptr, gen) = match path.nodes[level].as_ref() {
            None => return Ok(false),
            Some(node) => {
                let slot = path.slots[level] + 1;
                if slot >= node.nritems() as usize {
                    level += 1;
                    continue;
                }
                path.slots[level] = slot;
                (node.node_blockptr(slot), node.node_ptr_generation(slot))
            }
        };

        let (mut ptr, mut gen) = (ptr, gen);
        let mut lvl = level;
        while lvl > 0 {
            let child = reader.read_tree_block(ptr, gen)?;
            lvl -= 1;
            path.slots[lvl] = 0;
            if lvl > 0 {
                ptr = child.node_blockptr(0);
                gen = child.node_ptr_generation(0);
            }
            path.nodes[lvl] = Some(child);
        }
        return Ok(true);
    }
}

/// 从 `start` 开始按键顺序遍历叶子 item
///
/// 回调返回 `false` 时停止。
pub fn walk_items<R, F>(reader: &mut R, root: &ExtentBuffer, start: &Key, mut f: F) -> Result<()>
where
    R: TreeReader + ?Sized,
    F: FnMut(&Key, &[u8]) -> Result<bool>,
{
    let mut path = Path::new();
    search_slot(reader, root, start, &mut path)?;
    loop {
        if !path.is_valid() {
            if !next_leaf(reader, &mut path)? {
                return Ok(());
            }
            continue;
        }
        let slot = path.slot();
        let leaf = match path.leaf() {
            Some(leaf) => leaf,
            None => return Ok(()),
        };
        let key = leaf.item_key(slot);
        if !f(&key, leaf.item_data(slot)?)? {
            return Ok(());
        }
        path.slots[0] += 1;
    }
}

/// 查找 `objectid` 对应的最新 ROOT_ITEM（offset 最大者）
pub fn find_root_item<R: TreeReader + ?Sized>(
    reader: &mut R,
    tree_root: &ExtentBuffer,
    objectid: u64,
) -> Result<Option<(Key, RootItem)>> {
    let search = Key::new(objectid, BTRFS_ROOT_ITEM_KEY, u64::MAX);
    let mut path = Path::new();
    search_slot(reader, tree_root, &search, &mut path)?;

    let slot = path.slot();
    if slot == 0 {
        return Ok(None);
    }
    path.slots[0] = slot - 1;
    let Some(key) = path.item_key() else {
        return Ok(None);
    };
    if key.objectid != objectid || key.item_type != BTRFS_ROOT_ITEM_KEY {
        return Ok(None);
    }
    let item = RootItem::parse(path.item_data()?)?;
    Ok(Some((key, item)))
}

/// 精确查找一个 ROOT_ITEM
pub fn find_root_item_exact<R: TreeReader + ?Sized>(
    reader: &mut R,
    tree_root: &ExtentBuffer,
    key: &Key,
) -> Result<Option<RootItem>> {
    let mut path = Path::new();
    if !search_slot(reader, tree_root, key, &mut path)? {
        return Ok(None);
    }
    Ok(Some(RootItem::parse(path.item_data()?)?))
}
