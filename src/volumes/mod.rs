//! chunk/设备映射
//!
//! - [`profile`] 冗余 profile 属性表
//! - [`map`] 逻辑地址映射与反向映射
//! - [`chunk`] sys chunk array 与 chunk tree 项的加载
//! - [`device`] 设备、设备集合与扫描上下文
//! - [`raid56`] RAID5/6 校验

mod chunk;
mod device;
mod map;
mod profile;
pub mod raid56;

pub use chunk::{check_chunk_valid, read_one_chunk, read_one_dev, read_sys_array};
pub use device::{open_seed_devices, splice_device_list, Device, FsDevices, ScanContext};
pub use map::{
    check_crossing_stripes, ChunkMap, IoStripe, MapLookup, MapOp, MapStripe, MultiStripe,
};
pub use profile::{RaidAttr, RaidProfile};
