//! 冗余 profile

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};

/// 块组冗余 profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaidProfile {
    /// 单副本
    Single,
    /// 条带化
    Raid0,
    /// 两设备镜像
    Raid1,
    /// 同设备双副本
    Dup,
    /// 条带化镜像
    Raid10,
    /// 单校验
    Raid5,
    /// 双校验
    Raid6,
    /// 三设备镜像
    Raid1C3,
    /// 四设备镜像
    Raid1C4,
}

/// profile 属性（对应 `btrfs_raid_array`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidAttr {
    /// RAID10 中每组镜像的条带数
    pub sub_stripes: u16,
    /// 每个设备上的条带数
    pub dev_stripes: u16,
    /// 最少设备数
    pub devs_min: u16,
    /// 可容忍的故障设备数
    pub tolerated_failures: u16,
    /// 数据副本数
    pub ncopies: u16,
    /// 校验条带数
    pub nparity: u16,
}

impl RaidProfile {
    /// 全部 profile
    pub const ALL: [RaidProfile; 9] = [
        RaidProfile::Raid10,
        RaidProfile::Raid1,
        RaidProfile::Dup,
        RaidProfile::Raid0,
        RaidProfile::Single,
        RaidProfile::Raid5,
        RaidProfile::Raid6,
        RaidProfile::Raid1C3,
        RaidProfile::Raid1C4,
    ];

    /// 从块组类型位解析
    ///
    /// 没有 profile 位即为 SINGLE；多于一个 profile 位视为损坏。
    pub fn from_flags(flags: u64) -> Result<Self> {
        let bits = flags & BTRFS_BLOCK_GROUP_PROFILE_MASK;
        if bits & bits.wrapping_sub(1) != 0 {
            return Err(Error::new(
                ErrorKind::Corrupted,
                "conflicting chunk profile bits",
            ));
        }
        Ok(match bits {
            0 => RaidProfile::Single,
            BTRFS_BLOCK_GROUP_RAID0 => RaidProfile::Raid0,
            BTRFS_BLOCK_GROUP_RAID1 => RaidProfile::Raid1,
            BTRFS_BLOCK_GROUP_DUP => RaidProfile::Dup,
            BTRFS_BLOCK_GROUP_RAID10 => RaidProfile::Raid10,
            BTRFS_BLOCK_GROUP_RAID5 => RaidProfile::Raid5,
            BTRFS_BLOCK_GROUP_RAID6 => RaidProfile::Raid6,
            BTRFS_BLOCK_GROUP_RAID1C3 => RaidProfile::Raid1C3,
            BTRFS_BLOCK_GROUP_RAID1C4 => RaidProfile::Raid1C4,
            _ => {
                return Err(Error::new(ErrorKind::Corrupted, "unknown chunk profile bit"))
            }
        })
    }

    /// 对应的块组类型位
    pub const fn bg_flag(self) -> u64 {
        match self {
            RaidProfile::Single => 0,
            RaidProfile::Raid0 => BTRFS_BLOCK_GROUP_RAID0,
            RaidProfile::Raid1 => BTRFS_BLOCK_GROUP_RAID1,
            RaidProfile::Dup => BTRFS_BLOCK_GROUP_DUP,
            RaidProfile::Raid10 => BTRFS_BLOCK_GROUP_RAID10,
            RaidProfile::Raid5 => BTRFS_BLOCK_GROUP_RAID5,
            RaidProfile::Raid6 => BTRFS_BLOCK_GROUP_RAID6,
            RaidProfile::Raid1C3 => BTRFS_BLOCK_GROUP_RAID1C3,
            RaidProfile::Raid1C4 => BTRFS_BLOCK_GROUP_RAID1C4,
        }
    }

    /// 属性表
    pub const fn attr(self) -> RaidAttr {
        let (sub_stripes, dev_stripes, devs_min, tolerated_failures, ncopies, nparity) =
            match self {
                RaidProfile::Raid10 => (2, 1, 2, 1, 2, 0),
                RaidProfile::Raid1 => (1, 1, 2, 1, 2, 0),
                RaidProfile::Raid1C3 => (1, 1, 3, 2, 3, 0),
                RaidProfile::Raid1C4 => (1, 1, 4, 3, 4, 0),
                RaidProfile::Dup => (1, 2, 1, 0, 2, 0),
                RaidProfile::Raid0 => (1, 1, 1, 0, 1, 0),
                RaidProfile::Single => (1, 1, 1, 0, 1, 0),
                RaidProfile::Raid5 => (1, 1, 2, 1, 1, 1),
                RaidProfile::Raid6 => (1, 1, 3, 2, 1, 2),
            };
        RaidAttr {
            sub_stripes,
            dev_stripes,
            devs_min,
            tolerated_failures,
            ncopies,
            nparity,
        }
    }

    /// 名称
    pub const fn name(self) -> &'static str {
        match self {
            RaidProfile::Single => "single",
            RaidProfile::Raid0 => "raid0",
            RaidProfile::Raid1 => "raid1",
            RaidProfile::Dup => "dup",
            RaidProfile::Raid10 => "raid10",
            RaidProfile::Raid5 => "raid5",
            RaidProfile::Raid6 => "raid6",
            RaidProfile::Raid1C3 => "raid1c3",
            RaidProfile::Raid1C4 => "raid1c4",
        }
    }

    /// 是否为 RAID1 系列
    pub const fn is_raid1(self) -> bool {
        matches!(
            self,
            RaidProfile::Raid1 | RaidProfile::Raid1C3 | RaidProfile::Raid1C4
        )
    }

    /// 是否为 RAID5/6
    pub const fn is_parity(self) -> bool {
        matches!(self, RaidProfile::Raid5 | RaidProfile::Raid6)
    }

    /// 读取返回长度是否裁剪到单个条带
    pub const fn is_striped_or_mirrored(self) -> bool {
        !matches!(self, RaidProfile::Single)
    }

    /// 给定条带数时的数据条带数
    pub const fn nr_data_stripes(self, num_stripes: u16) -> u16 {
        num_stripes - self.attr().nparity
    }

    /// 条带数与 profile 是否一致
    pub fn stripes_valid(self, num_stripes: u16, sub_stripes: u16) -> bool {
        match self {
            RaidProfile::Raid10 => {
                sub_stripes == 2 && num_stripes >= 2 && num_stripes % sub_stripes == 0
            }
            RaidProfile::Raid1 | RaidProfile::Dup => num_stripes == 2,
            RaidProfile::Raid1C3 => num_stripes == 3,
            RaidProfile::Raid1C4 => num_stripes == 4,
            RaidProfile::Raid5 => num_stripes >= 2,
            RaidProfile::Raid6 => num_stripes >= 3,
            RaidProfile::Raid0 => num_stripes >= 1,
            RaidProfile::Single => num_stripes == 1,
        }
    }
}

impl core::fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(
            RaidProfile::from_flags(BTRFS_BLOCK_GROUP_METADATA).unwrap(),
            RaidProfile::Single
        );
        assert_eq!(
            RaidProfile::from_flags(BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID6).unwrap(),
            RaidProfile::Raid6
        );
        assert!(RaidProfile::from_flags(BTRFS_BLOCK_GROUP_RAID1 | BTRFS_BLOCK_GROUP_DUP).is_err());

        for profile in RaidProfile::ALL {
            assert_eq!(RaidProfile::from_flags(profile.bg_flag()).unwrap(), profile);
        }
    }

    #[test]
    fn test_attr_table() {
        assert_eq!(RaidProfile::Raid10.attr().sub_stripes, 2);
        assert_eq!(RaidProfile::Dup.attr().dev_stripes, 2);
        assert_eq!(RaidProfile::Raid1C4.attr().tolerated_failures, 3);
        assert_eq!(RaidProfile::Raid6.attr().nparity, 2);
        assert_eq!(RaidProfile::Raid6.nr_data_stripes(5), 3);
    }

    #[test]
    fn test_stripe_counts() {
        assert!(RaidProfile::Dup.stripes_valid(2, 1));
        assert!(!RaidProfile::Dup.stripes_valid(3, 1));
        assert!(RaidProfile::Raid10.stripes_valid(4, 2));
        assert!(!RaidProfile::Raid10.stripes_valid(3, 2));
        assert!(!RaidProfile::Raid10.stripes_valid(4, 1));
        assert!(!RaidProfile::Single.stripes_valid(2, 1));
        assert!(!RaidProfile::Raid6.stripes_valid(2, 1));
    }
}
