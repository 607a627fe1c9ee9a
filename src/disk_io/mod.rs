//! 树块 I/O
//!
//! - [`read`] 带镜像回退的树块读取
//! - [`write`] 树块写回
//! - [`cache`] 树块缓存

mod cache;
mod read;
mod write;

pub use cache::{CacheStats, ExtentCache, DEFAULT_CACHE_SIZE};
pub use read::{read_data_range, read_extent_from_disk, read_tree_block};
pub use write::{write_data_range, write_temp_extent_buffer, write_tree_block};
