//! B 树：树块缓冲区、只读查找与结构检查

pub mod check;
mod extent_buffer;
pub mod search;

pub use check::{check_key_order, check_leaf, check_node, BlockStatus};
pub use extent_buffer::{EbFlags, ExtentBuffer, HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE};
pub use search::{
    bin_search, find_root_item, find_root_item_exact, next_leaf, search_slot, search_slot_level,
    walk_items, Path, TreeReader,
};
