//! 校验和引擎
//!
//! btrfs 支持四种元数据/数据校验算法，算法 ID 记录在 superblock 的 `csum_type` 字段。
//! 所有摘要都写入 32 字节的校验和槽位，不足 32 字节的部分补零。

use crate::consts::BTRFS_CSUM_SIZE;
use crate::error::{Error, ErrorKind, Result};
use blake2::digest::consts::U32;
use blake2::Blake2b;
use sha2::{Digest, Sha256};

/// BLAKE2b-256
type Blake2b256 = Blake2b<U32>;

/// 校验和摘要（固定 32 字节槽位）
pub type CsumDigest = [u8; BTRFS_CSUM_SIZE];

/// 校验算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CsumType {
    /// CRC32C（4 字节）
    Crc32c = 0,
    /// XXH64，种子 0（8 字节）
    Xxhash = 1,
    /// SHA-256（32 字节）
    Sha256 = 2,
    /// BLAKE2b-256（32 字节）
    Blake2 = 3,
}

impl CsumType {
    /// 从 superblock 的原始 ID 转换
    ///
    /// 未知 ID 可能是格式损坏，也可能是更新版本的文件系统，统一报告为不支持。
    pub fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(CsumType::Crc32c),
            1 => Ok(CsumType::Xxhash),
            2 => Ok(CsumType::Sha256),
            3 => Ok(CsumType::Blake2),
            _ => {
                log::error!("[CSUM] unsupported checksum type {}", raw);
                Err(Error::new(ErrorKind::Unsupported, "unsupported checksum type"))
            }
        }
    }

    /// 原始 ID
    pub const fn as_raw(self) -> u16 {
        self as u16
    }

    /// 摘要长度（字节）
    pub const fn size(self) -> usize {
        match self {
            CsumType::Crc32c => 4,
            CsumType::Xxhash => 8,
            CsumType::Sha256 | CsumType::Blake2 => 32,
        }
    }

    /// 算法名称（与 `btrfs inspect-internal dump-super` 输出一致）
    pub const fn name(self) -> &'static str {
        match self {
            CsumType::Crc32c => "crc32c",
            CsumType::Xxhash => "xxhash64",
            CsumType::Sha256 => "sha256",
            CsumType::Blake2 => "blake2b",
        }
    }

    /// 计算摘要
    ///
    /// 返回补零到 32 字节的槽位内容；整数类摘要按小端存放。
    pub fn compute(self, data: &[u8]) -> CsumDigest {
        let mut out = [0u8; BTRFS_CSUM_SIZE];
        match self {
            CsumType::Crc32c => {
                out[..4].copy_from_slice(&crate::crc::crc32c(data).to_le_bytes());
            }
            CsumType::Xxhash => {
                let hash = xxhash_rust::xxh64::xxh64(data, 0);
                out[..8].copy_from_slice(&hash.to_le_bytes());
            }
            CsumType::Sha256 => {
                out.copy_from_slice(&Sha256::digest(data));
            }
            CsumType::Blake2 => {
                out.copy_from_slice(&Blake2b256::digest(data));
            }
        }
        out
    }

    /// 校验 `data` 的摘要是否与 `expected` 的前 `size()` 字节一致
    pub fn verify(self, data: &[u8], expected: &[u8]) -> bool {
        let size = self.size();
        if expected.len() < size {
            return false;
        }
        self.compute(data)[..size] == expected[..size]
    }
}

impl core::fmt::Display for CsumType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// 计算摘要（函数形式，便于按算法参数化调用）
#[inline]
pub fn compute(algorithm: CsumType, data: &[u8]) -> CsumDigest {
    algorithm.compute(data)
}

/// 校验摘要（函数形式）
#[inline]
pub fn verify(algorithm: CsumType, data: &[u8], expected: &[u8]) -> bool {
    algorithm.verify(data, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        assert_eq!(CsumType::from_raw(0).unwrap(), CsumType::Crc32c);
        assert_eq!(CsumType::from_raw(3).unwrap(), CsumType::Blake2);
        let err = CsumType::from_raw(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(CsumType::Crc32c.size(), 4);
        assert_eq!(CsumType::Xxhash.size(), 8);
        assert_eq!(CsumType::Sha256.size(), 32);
        assert_eq!(CsumType::Blake2.size(), 32);
    }

    #[test]
    fn test_crc32c_digest_layout() {
        let digest = CsumType::Crc32c.compute(b"123456789");
        assert_eq!(&digest[..4], &0xE306_9283u32.to_le_bytes());
        assert!(digest[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sha256_known_value() {
        let digest = CsumType::Sha256.compute(b"abc");
        assert_eq!(digest[0], 0xba);
        assert_eq!(digest[1], 0x78);
        assert_eq!(digest[31], 0xad);
    }

    #[test]
    fn test_xxhash_empty() {
        let digest = CsumType::Xxhash.compute(b"");
        assert_eq!(&digest[..8], &0xEF46_DB37_51D8_E999u64.to_le_bytes());
    }

    #[test]
    fn test_verify_all_algorithms() {
        let data = [0x5au8; 4064];
        for csum in [
            CsumType::Crc32c,
            CsumType::Xxhash,
            CsumType::Sha256,
            CsumType::Blake2,
        ] {
            let digest = compute(csum, &data);
            assert!(verify(csum, &data, &digest), "{} should verify", csum);

            let mut bad = digest;
            bad[0] ^= 1;
            assert!(!verify(csum, &data, &bad));
        }
    }

    #[test]
    fn test_verify_ignores_padding() {
        let data = b"leaf";
        let mut digest = CsumType::Crc32c.compute(data);
        digest[10] = 0xff;
        assert!(CsumType::Crc32c.verify(data, &digest));
        assert!(!CsumType::Crc32c.verify(data, &digest[..2]));
    }
}
