//! 树根

use crate::ctree::ExtentBuffer;
use crate::types::{Key, RootItem};

/// 一棵已加载的树
#[derive(Debug, Clone)]
pub struct Root {
    /// root tree 中的键
    pub key: Key,
    /// ROOT_ITEM
    pub item: RootItem,
    /// 当前根节点
    pub node: ExtentBuffer,
    /// 根节点是否被替换过（提交时需要更新指针）
    pub dirty: bool,
}

impl Root {
    /// 以已读入的根节点创建
    pub fn new(key: Key, item: RootItem, node: ExtentBuffer) -> Self {
        Self {
            key,
            item,
            node,
            dirty: false,
        }
    }

    /// 读取失败时的占位根（根节点内容无效）
    pub fn placeholder(key: Key, item: RootItem, nodesize: usize) -> Self {
        let node = ExtentBuffer::new(item.bytenr(), nodesize);
        Self::new(key, item, node)
    }

    /// objectid
    pub fn objectid(&self) -> u64 {
        self.key.objectid
    }

    /// 根节点逻辑地址
    pub fn bytenr(&self) -> u64 {
        self.node.start()
    }

    /// 根节点层级
    pub fn level(&self) -> u8 {
        self.node.level()
    }

    /// 根节点内容是否有效
    pub fn is_uptodate(&self) -> bool {
        self.node.is_uptodate()
    }

    /// 替换根节点并同步 ROOT_ITEM
    pub fn set_node(&mut self, node: ExtentBuffer) {
        self.item.set_bytenr(node.start());
        self.item.set_generation(node.generation());
        self.item.set_level(node.level());
        self.node = node;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::*;

    #[test]
    fn test_placeholder_not_uptodate() {
        let key = Key::new(BTRFS_EXTENT_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0);
        let root = Root::placeholder(key, RootItem::new(0x50_4000, 5, 0), 16384);
        assert!(!root.is_uptodate());
        assert_eq!(root.bytenr(), 0x50_4000);
    }

    #[test]
    fn test_set_node_updates_item() {
        let key = Key::new(BTRFS_FS_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0);
        let node = ExtentBuffer::new_empty(0x1000, 4096, 5, 0, 3, &[0; 16]);
        let mut root = Root::new(key, RootItem::new(0x1000, 3, 0), node);
        let newer = ExtentBuffer::new_empty(0x2000, 4096, 5, 1, 4, &[0; 16]);
        root.set_node(newer);
        assert!(root.dirty);
        assert_eq!(root.item.bytenr(), 0x2000);
        assert_eq!(root.item.generation(), 4);
        assert_eq!(root.item.level(), 1);
    }
}
