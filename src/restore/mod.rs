//! metadump 镜像恢复
//!
//! [`MetadumpImage`] 解析 `btrfs-image` 风格的元数据镜像；[`MetadumpImage::restore`]
//! 用一个固定大小的线程池把镜像中的树块写回块设备，最后写 superblock。

mod metadump;
mod worker;

pub use metadump::{
    Compression, MetadumpImage, MetadumpItem, ITEMS_PER_CLUSTER, METADUMP_BLOCK_SIZE,
    METADUMP_MAGIC,
};
pub use worker::RestoreStats;
