//! 文件系统会话
//!
//! [`FsInfo`] 是打开后的文件系统：设备、chunk 映射、各棵树的根和树块缓存都挂在它上面。
//! 打开见 [`FsInfo::open`]，关闭见 [`FsInfo::close`]。

mod bootstrap;
mod features;
mod fs_info;
mod root;
mod types;

pub use features::check_features;
pub use fs_info::{is_global_root, FsInfo, Transaction};
pub use root::Root;
pub use types::{FsConfig, OpenFlags, ReadStats};
