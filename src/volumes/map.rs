//! 逻辑地址到物理地址的映射
//!
//! 每个 chunk 对应一个 [`MapLookup`]，以逻辑起点为键保存在有序映射中。
//! [`ChunkMap::map_block`] 按 profile 的条带公式把一段逻辑地址翻译为若干
//! `(devid, physical)`：读返回选中的一个镜像，写返回需要写入的全部条带。

use super::profile::RaidProfile;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::types::ChunkItem;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// chunk 中的一个条带
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapStripe {
    /// 设备 ID
    pub devid: u64,
    /// 设备上的物理偏移
    pub physical: u64,
    /// 设备 UUID
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

/// 一个 chunk 的映射信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLookup {
    /// 逻辑起点
    pub start: u64,
    /// 逻辑长度
    pub size: u64,
    /// 块组类型位
    pub chunk_type: u64,
    /// 条带长度
    pub stripe_len: u64,
    /// I/O 对齐
    pub io_align: u32,
    /// I/O 宽度
    pub io_width: u32,
    /// 扇区大小
    pub sector_size: u32,
    /// RAID10 子条带数
    pub sub_stripes: u16,
    /// 条带
    pub stripes: Vec<MapStripe>,
}

impl MapLookup {
    /// 由 chunk 项构造
    pub fn from_chunk(logical: u64, chunk: &ChunkItem) -> Self {
        Self {
            start: logical,
            size: chunk.length,
            chunk_type: chunk.chunk_type,
            stripe_len: chunk.stripe_len,
            io_align: chunk.io_align,
            io_width: chunk.io_width,
            sector_size: chunk.sector_size,
            sub_stripes: chunk.sub_stripes,
            stripes: chunk
                .stripes
                .iter()
                .map(|s| MapStripe {
                    devid: s.devid,
                    physical: s.offset,
                    dev_uuid: s.dev_uuid,
                })
                .collect(),
        }
    }

    /// profile
    pub fn profile(&self) -> RaidProfile {
        RaidProfile::from_flags(self.chunk_type).unwrap_or(RaidProfile::Single)
    }

    /// 条带数
    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }

    /// 数据条带数（RAID5/6 去掉校验条带）
    pub fn nr_data_stripes(&self) -> usize {
        self.num_stripes() - self.profile().attr().nparity as usize
    }

    /// 逻辑终点（不含）
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// 是否包含逻辑地址
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.start && logical < self.end()
    }
}

/// 映射方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    /// 读：返回一个镜像
    Read,
    /// 写：返回需要写入的全部条带
    Write,
}

/// 一个物理 I/O 目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStripe {
    /// 设备 ID
    pub devid: u64,
    /// 物理偏移
    pub physical: u64,
    /// 设备 UUID，与 devid 一起确定设备（seed 与 sprout 的 devid 可能重复）
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

/// `map_block` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiStripe {
    /// 请求的逻辑地址
    pub logical: u64,
    /// 本次映射覆盖的长度（已裁剪到条带边界）
    pub length: u64,
    /// 块组类型位
    pub chunk_type: u64,
    /// 条带长度
    pub stripe_len: u64,
    /// 物理目标
    pub stripes: Vec<IoStripe>,
    /// RAID5/6 完整条带：每个条带对应的逻辑地址，校验条带为 P/Q 哨兵值
    pub raid_map: Option<Vec<u64>>,
}

impl MultiStripe {
    /// 条带数
    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }
}

/// 判断一段范围是否跨越 64 KiB 条带边界
///
/// 树块不允许跨条带，否则在条带化 profile 下会被拆到两个设备上。
pub fn check_crossing_stripes(start: u64, len: u64) -> bool {
    len > 0 && start / BTRFS_STRIPE_LEN != (start + len - 1) / BTRFS_STRIPE_LEN
}

/// chunk 映射表
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    map: BTreeMap<u64, MapLookup>,
}

impl ChunkMap {
    /// 创建空映射表
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一个 chunk
    ///
    /// 与已有 chunk 重叠时返回 `AlreadyExists`。
    pub fn insert(&mut self, lookup: MapLookup) -> Result<()> {
        let start = lookup.start;
        let end = lookup.end();
        if let Some((_, prev)) = self.map.range(..end).next_back() {
            if prev.end() > start {
                log::error!(
                    "[CHUNK] chunk [{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                    start,
                    end,
                    prev.start,
                    prev.end()
                );
                return Err(Error::new(ErrorKind::AlreadyExists, "overlapping chunk"));
            }
        }
        self.map.insert(start, lookup);
        Ok(())
    }

    /// 查找包含 `logical` 的 chunk
    pub fn lookup(&self, logical: u64) -> Option<&MapLookup> {
        self.map
            .range(..=logical)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(logical))
    }

    /// 第一个起点 >= `logical` 的 chunk
    pub fn next_chunk(&self, logical: u64) -> Option<&MapLookup> {
        self.map.range(logical..).next().map(|(_, m)| m)
    }

    /// 删除以 `start` 为起点的 chunk
    pub fn remove(&mut self, start: u64) -> Option<MapLookup> {
        self.map.remove(&start)
    }

    /// 按逻辑地址顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &MapLookup> {
        self.map.values()
    }

    /// chunk 数
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// 清空
    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn lookup_or_err(&self, logical: u64) -> Result<&MapLookup> {
        self.lookup(logical).ok_or_else(|| {
            log::error!("[CHUNK] unable to find chunk for logical {:#x}", logical);
            Error::new(ErrorKind::NotFound, "no chunk maps the logical address")
        })
    }

    /// 可读取的副本数
    ///
    /// DUP/RAID1 系列为条带数，RAID10 为子条带数，RAID5 为 2（数据 + P 重建），
    /// RAID6 为 3（再加 Q 重建），其余为 1。未映射的地址返回 1。
    pub fn num_copies(&self, logical: u64, _length: u64) -> usize {
        let Some(map) = self.lookup(logical) else {
            return 1;
        };
        match map.profile() {
            RaidProfile::Dup | RaidProfile::Raid1 | RaidProfile::Raid1C3 | RaidProfile::Raid1C4 => {
                map.num_stripes()
            }
            RaidProfile::Raid10 => map.sub_stripes as usize,
            RaidProfile::Raid5 => 2,
            RaidProfile::Raid6 => 3,
            RaidProfile::Raid0 | RaidProfile::Single => 1,
        }
    }

    /// 把逻辑范围映射到物理条带
    ///
    /// # 参数
    ///
    /// * `logical` - 逻辑起点
    /// * `length` - 请求长度（结果长度可能更短）
    /// * `op` - 读/写
    /// * `mirror` - 读镜像号，0 表示默认选择；从 1 开始编号
    pub fn map_block(
        &self,
        logical: u64,
        length: u64,
        op: MapOp,
        mirror: usize,
    ) -> Result<MultiStripe> {
        let map = self.lookup_or_err(logical)?;
        let profile = map.profile();
        let num = map.num_stripes() as u64;
        let stripe_len = map.stripe_len;
        if stripe_len == 0 || num == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "chunk has no stripes"));
        }

        let offset = logical - map.start;
        let mut stripe_nr = offset / stripe_len;
        let mut stripe_offset = offset - stripe_nr * stripe_len;

        let mut out_len = if profile.is_striped_or_mirrored() {
            (map.size - offset).min(stripe_len - stripe_offset)
        } else {
            map.size - offset
        };

        let mut num_out: u64 = 1;
        let mut stripe_index: u64 = 0;
        let mut raid_map = None;

        match profile {
            RaidProfile::Raid1 | RaidProfile::Raid1C3 | RaidProfile::Raid1C4 => {
                if op == MapOp::Write {
                    num_out = num;
                } else if mirror > 0 {
                    stripe_index = mirror as u64 - 1;
                } else {
                    stripe_index = stripe_nr % num;
                }
            }
            RaidProfile::Raid10 => {
                let sub = map.sub_stripes.max(1) as u64;
                let factor = num / sub;
                stripe_index = (stripe_nr % factor) * sub;
                if op == MapOp::Write {
                    num_out = sub;
                } else if mirror > 0 {
                    stripe_index += mirror as u64 - 1;
                }
                stripe_nr /= factor;
            }
            RaidProfile::Dup => {
                if op == MapOp::Write {
                    num_out = num;
                } else if mirror > 0 {
                    stripe_index = mirror as u64 - 1;
                }
            }
            RaidProfile::Raid5 | RaidProfile::Raid6 => {
                let nr_data = map.nr_data_stripes() as u64;
                if op == MapOp::Write || mirror > 1 {
                    // 返回整个条带组
                    let full_stripe_len = nr_data * stripe_len;
                    let full_stripe_nr = offset / full_stripe_len;
                    let rot = full_stripe_nr % num;
                    let tmp = full_stripe_nr * nr_data;

                    let mut rmap = alloc::vec![0u64; num as usize];
                    for i in 0..nr_data {
                        rmap[((i + rot) % num) as usize] = map.start + (tmp + i) * stripe_len;
                    }
                    rmap[((nr_data + rot) % num) as usize] = BTRFS_RAID5_P_STRIPE;
                    if profile == RaidProfile::Raid6 {
                        rmap[((nr_data + rot + 1) % num) as usize] = BTRFS_RAID6_Q_STRIPE;
                    }
                    raid_map = Some(rmap);

                    out_len = stripe_len;
                    stripe_index = 0;
                    stripe_offset = 0;
                    stripe_nr = full_stripe_nr;
                    num_out = num;
                } else {
                    stripe_index = stripe_nr % nr_data;
                    stripe_nr /= nr_data;
                    stripe_index = (stripe_nr + stripe_index) % num;
                }
            }
            RaidProfile::Raid0 | RaidProfile::Single => {
                stripe_index = stripe_nr % num;
                stripe_nr /= num;
            }
        }

        if stripe_index + num_out > num {
            log::error!(
                "[CHUNK] mirror {} out of range for {} chunk at {:#x}",
                mirror,
                profile,
                map.start
            );
            return Err(Error::new(ErrorKind::InvalidInput, "mirror number out of range"));
        }

        let mut stripes: Vec<IoStripe> = (0..num_out)
            .map(|i| {
                let s = &map.stripes[(stripe_index + i) as usize];
                IoStripe {
                    devid: s.devid,
                    physical: s.physical + stripe_offset + stripe_nr * stripe_len,
                    dev_uuid: s.dev_uuid,
                }
            })
            .collect();

        // 按逻辑顺序排列：数据条带在前，P、Q 在后
        if let Some(rmap) = raid_map.as_mut() {
            let mut pairs: Vec<(u64, IoStripe)> =
                rmap.iter().copied().zip(stripes.iter().copied()).collect();
            pairs.sort_by_key(|(l, _)| *l);
            *rmap = pairs.iter().map(|(l, _)| *l).collect();
            stripes = pairs.into_iter().map(|(_, s)| s).collect();
        }

        log::trace!(
            "[CHUNK] map {:?} {:#x}+{} mirror {} -> {} stripes, len {}",
            op,
            logical,
            length,
            mirror,
            stripes.len(),
            out_len
        );

        Ok(MultiStripe {
            logical,
            length: if raid_map.is_some() {
                out_len
            } else {
                out_len.min(length)
            },
            chunk_type: map.chunk_type,
            stripe_len,
            stripes,
            raid_map,
        })
    }

    /// 物理地址反查逻辑地址（单个 chunk 内）
    ///
    /// # 返回
    ///
    /// `(逻辑条带起点列表, 每个起点覆盖的逻辑长度)`
    pub fn rmap_block_in_chunk(
        &self,
        chunk_start: u64,
        devid: Option<u64>,
        physical: u64,
    ) -> Result<(Vec<u64>, u64)> {
        let map = self.lookup_or_err(chunk_start)?;
        let num = map.num_stripes() as u64;
        let mut length = map.size;
        let mut rmap_len = map.stripe_len;

        match map.profile() {
            RaidProfile::Raid10 => length = map.size / (num / map.sub_stripes.max(1) as u64),
            RaidProfile::Raid0 => length = map.size / num,
            RaidProfile::Raid5 | RaidProfile::Raid6 => {
                let nr_data = map.nr_data_stripes() as u64;
                length = map.size / nr_data;
                rmap_len = map.stripe_len * nr_data;
            }
            _ => {}
        }

        let mut out: Vec<u64> = Vec::new();
        for (i, stripe) in map.stripes.iter().enumerate() {
            if devid.map_or(false, |d| d != stripe.devid) {
                continue;
            }
            if stripe.physical > physical || stripe.physical + length <= physical {
                continue;
            }
            let mut stripe_nr = (physical - stripe.physical) / map.stripe_len;
            match map.profile() {
                RaidProfile::Raid10 => {
                    stripe_nr = (stripe_nr * num + i as u64) / map.sub_stripes.max(1) as u64
                }
                RaidProfile::Raid0 => stripe_nr = stripe_nr * num + i as u64,
                _ => {}
            }
            let bytenr = map.start + stripe_nr * rmap_len;
            if !out.contains(&bytenr) {
                out.push(bytenr);
            }
        }
        Ok((out, rmap_len))
    }

    /// 物理地址反查逻辑地址（全部 chunk）
    pub fn rmap_block(&self, devid: u64, physical: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for map in self.map.values() {
            if !map.stripes.iter().any(|s| s.devid == devid) {
                continue;
            }
            if let Ok((logicals, len)) = self.rmap_block_in_chunk(map.start, Some(devid), physical)
            {
                out.extend(logicals.into_iter().map(|l| (l, len)));
            }
        }
        out
    }
}
