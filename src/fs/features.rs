//! 特性位检查

use super::types::OpenFlags;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::Superblock;

/// 打开前检查 superblock 特性位
///
/// - 未知 incompat 位：拒绝打开
/// - 可写打开时未知 compat_ro 位：拒绝，除非要求重建 free space tree
/// - MIXED_BACKREF 视为总是存在，直接补到内存副本
pub fn check_features(sb: &mut Superblock, flags: OpenFlags) -> Result<()> {
    let unknown = sb.incompat_flags() & !BTRFS_FEATURE_INCOMPAT_SUPP;
    if unknown != 0 {
        log::error!(
            "[OPEN] cannot open filesystem, unsupported incompat features {:#x}",
            unknown
        );
        return Err(Error::new(ErrorKind::Unsupported, "unsupported incompat features"));
    }

    let unknown_ro = sb.compat_ro_flags() & !BTRFS_FEATURE_COMPAT_RO_SUPP;
    if flags.contains(OpenFlags::WRITES) && unknown_ro != 0 {
        if flags.contains(OpenFlags::INVALIDATE_FST) {
            log::warn!(
                "[OPEN] unknown compat_ro features {:#x}, free space tree will be rebuilt",
                unknown_ro
            );
        } else {
            log::error!(
                "[OPEN] cannot open read-write, unsupported compat_ro features {:#x}",
                unknown_ro
            );
            return Err(Error::new(ErrorKind::Unsupported, "unsupported compat_ro features"));
        }
    }

    if !sb.has_incompat(BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF) {
        let incompat = sb.incompat_flags() | BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF;
        sb.set_incompat_flags(incompat);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_superblock;

    #[test]
    fn test_unknown_incompat_rejected() {
        let mut sb = sample_superblock();
        sb.set_incompat_flags(sb.incompat_flags() | (1 << 40));
        let err = check_features(&mut sb, OpenFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_zoned_rejected() {
        let mut sb = sample_superblock();
        sb.set_incompat_flags(BTRFS_FEATURE_INCOMPAT_ZONED);
        assert!(check_features(&mut sb, OpenFlags::empty()).is_err());
    }

    #[test]
    fn test_unknown_compat_ro() {
        let mut sb = sample_superblock();
        sb.set_compat_ro_flags(1 << 20);
        // 只读打开不受影响
        check_features(&mut sb, OpenFlags::empty()).unwrap();

        let err = check_features(&mut sb, OpenFlags::WRITES).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        check_features(&mut sb, OpenFlags::WRITES | OpenFlags::INVALIDATE_FST).unwrap();
    }

    #[test]
    fn test_mixed_backref_implied() {
        let mut sb = sample_superblock();
        sb.set_incompat_flags(0);
        check_features(&mut sb, OpenFlags::empty()).unwrap();
        assert!(sb.has_incompat(BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF));
    }
}
