//! 错误类型定义
//!
//! 提供 btrfs 元数据引擎的错误类型，以及恢复工具使用的退出码。

use core::fmt;

/// btrfs 操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误（短读写、设备缺失、所有镜像均失败）
    Io,
    /// 无效参数
    InvalidInput,
    /// 结构损坏（无效的 superblock、树块头、chunk 项）
    Corrupted,
    /// 不存在（superblock 副本缺失、根项缺失）
    NotFound,
    /// 已存在
    AlreadyExists,
    /// 空间不足
    NoSpace,
    /// 不支持的操作或特性
    Unsupported,
    /// 设备忙
    Busy,
    /// 无效状态
    InvalidState,
    /// 校验和不匹配
    ChecksumMismatch,
    /// 父节点记录的 generation 与树块头不一致
    TransidMismatch,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 对应的负 errno 值
    ///
    /// 供需要沿用 errno 语义的调用方（命令行工具打印 `strerror`）使用。
    pub const fn errno(&self) -> i32 {
        match self.kind {
            ErrorKind::Io | ErrorKind::ChecksumMismatch | ErrorKind::TransidMismatch => -5,
            ErrorKind::InvalidInput => -22,
            ErrorKind::Corrupted => -117,
            ErrorKind::NotFound => -2,
            ErrorKind::AlreadyExists => -17,
            ErrorKind::NoSpace => -28,
            ErrorKind::Unsupported => -95,
            ErrorKind::Busy => -16,
            ErrorKind::InvalidState => -22,
        }
    }

    /// 是否为“不存在”类错误（非致命）
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::new(ErrorKind::NotFound, "No such file or device"),
            std::io::ErrorKind::PermissionDenied => {
                Error::new(ErrorKind::InvalidState, "Permission denied")
            }
            std::io::ErrorKind::UnexpectedEof => Error::new(ErrorKind::Io, "Short read"),
            std::io::ErrorKind::InvalidData => Error::new(ErrorKind::Corrupted, "Invalid data"),
            _ => Error::new(ErrorKind::Io, "Device I/O error"),
        }
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;

/// 恢复工具（rescue / restore）的退出码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RecoveryStatus {
    /// 无需处理
    NothingToDo = 0,
    /// 用法错误
    Usage = 1,
    /// 已修复
    Repaired = 2,
    /// 失败
    Failed = 3,
    /// 被用户中止
    Aborted = 4,
}

impl RecoveryStatus {
    /// 进程退出码
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// 由操作结果推导退出码
    ///
    /// `Ok(true)` 表示做了修改，`Ok(false)` 表示没有需要修复的内容。
    pub fn from_result(result: &Result<bool>) -> Self {
        match result {
            Ok(true) => RecoveryStatus::Repaired,
            Ok(false) => RecoveryStatus::NothingToDo,
            Err(e) if e.kind() == ErrorKind::InvalidInput => RecoveryStatus::Usage,
            Err(_) => RecoveryStatus::Failed,
        }
    }
}
