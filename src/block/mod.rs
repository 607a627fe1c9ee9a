//! 块设备抽象
//!
//! 提供块设备接口和按字节偏移的 I/O 操作。
//! block/device.rs 定义扇区级的 `BlockDevice` 接口以及在其上提供字节级读写的 `BlockDev`。
//! block/memory.rs 提供稀疏内存设备，block/file.rs 提供镜像文件与设备节点后端。

mod device;
mod memory;
#[cfg(all(feature = "std", unix))]
mod file;

pub use device::{BlockDev, BlockDevice, DynBlockDevice, IoStats};
pub use memory::MemoryDevice;
#[cfg(all(feature = "std", unix))]
pub use file::FileDevice;
