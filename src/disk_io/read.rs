//! 树块读取
//!
//! 读取路径：对齐检查 → 缓存 → 逐个镜像读取并校验（校验和、树块头、generation）。
//! 校验和或 FSID 错误换下一个镜像；校验和正确但树块头结构错误直接失败；
//! generation 不匹配记录为候选，全部镜像失败后按选项决定是否接受。

use crate::consts::*;
use crate::ctree::{check_key_order, EbFlags, ExtentBuffer};
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{FsInfo, OpenFlags};
use crate::volumes::{raid56, IoStripe, MapOp};
use alloc::vec::Vec;

/// 单个镜像的校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Good,
    /// 换下一个镜像
    Retry,
    /// generation 不匹配，记为候选
    BadTransid,
}

/// 读取一个树块
///
/// # 参数
///
/// * `fs` - 文件系统会话
/// * `bytenr` - 逻辑地址
/// * `parent_transid` - 父节点记录的 generation，0 表示不检查
pub fn read_tree_block(fs: &mut FsInfo, bytenr: u64, parent_transid: u64) -> Result<ExtentBuffer> {
    let nodesize = fs.nodesize;
    let sectorsize = fs.sectorsize as u64;
    fs.stats.tree_reads += 1;

    if bytenr < sectorsize || bytenr % sectorsize != 0 {
        log::error!(
            "[READ] tree block bytenr {:#x} is not aligned to sectorsize {}",
            bytenr,
            sectorsize
        );
        return Err(Error::new(ErrorKind::Io, "unaligned tree block"));
    }

    if let Some(eb) = fs.cache.get(bytenr, nodesize) {
        if eb.is_uptodate() && (parent_transid == 0 || eb.generation() == parent_transid) {
            fs.stats.cache_hits += 1;
            return Ok(eb.clone());
        }
    }

    let num_copies = fs.chunk_map.num_copies(bytenr, nodesize as u64);
    let mut candidate: Option<(usize, u64)> = None;
    let quiet = fs.flags.contains(OpenFlags::SUPPRESS_CHECK_BLOCK_ERRORS);

    for mirror in 1..=num_copies {
        let mut eb = ExtentBuffer::new(bytenr, nodesize as usize);
        fs.stats.mirror_reads += 1;
        if let Err(e) = read_extent_from_disk(fs, &mut eb, mirror) {
            log::debug!("[READ] {:#x} mirror {} read failed: {}", bytenr, mirror, e);
            continue;
        }

        match verify_tree_block(fs, &eb, parent_transid, quiet)? {
            Verdict::Good => {
                finish_read(&mut eb);
                fs.cache.insert(eb.clone());
                if mirror > 1 {
                    log::info!("[READ] {:#x} recovered from mirror {}", bytenr, mirror);
                }
                return Ok(eb);
            }
            Verdict::Retry => continue,
            Verdict::BadTransid => {
                let gen = eb.generation();
                if candidate.map_or(true, |(_, best)| gen > best) {
                    candidate = Some((mirror, gen));
                }
            }
        }
    }

    if let Some((mirror, gen)) = candidate {
        if fs.flags.contains(OpenFlags::ALLOW_TRANSID_MISMATCH) {
            let mut eb = ExtentBuffer::new(bytenr, nodesize as usize);
            read_extent_from_disk(fs, &mut eb, mirror)?;
            log::warn!(
                "[READ] ignoring transid mismatch on {:#x}: want {} have {}",
                bytenr,
                parent_transid,
                gen
            );
            finish_read(&mut eb);
            eb.set_flag(EbFlags::BAD_TRANSID);
            fs.recow.push((bytenr, nodesize));
            fs.cache.insert(eb.clone());
            return Ok(eb);
        }
    }

    if !quiet {
        log::error!(
            "[READ] failed to read tree block {:#x} from {} mirrors",
            bytenr,
            num_copies
        );
    }
    Err(Error::new(ErrorKind::Io, "failed to read tree block"))
}

fn finish_read(eb: &mut ExtentBuffer) {
    if !check_key_order(eb) {
        log::warn!("[READ] tree block {:#x} has bad key order", eb.start());
        eb.set_flag(EbFlags::BAD_KEY_ORDER);
    }
    eb.set_flag(EbFlags::UPTODATE);
}

/// 逐项检查一个镜像读出的树块
fn verify_tree_block(
    fs: &mut FsInfo,
    eb: &ExtentBuffer,
    parent_transid: u64,
    quiet: bool,
) -> Result<Verdict> {
    let bytenr = eb.start();

    fs.stats.csum_attempts += 1;
    if !eb.verify_checksum(fs.csum_type) {
        fs.stats.csum_failures += 1;
        if !quiet {
            log::warn!("[READ] checksum mismatch on {:#x}", bytenr);
        }
        return Ok(Verdict::Retry);
    }

    if !fs.flags.contains(OpenFlags::IGNORE_FSID_MISMATCH) && !fsid_matches(fs, eb) {
        if !quiet {
            log::warn!("[READ] fsid mismatch on {:#x}", bytenr);
        }
        return Ok(Verdict::Retry);
    }

    if eb.bytenr() != bytenr {
        log::error!(
            "[READ] tree block {:#x} claims bytenr {:#x}",
            bytenr,
            eb.bytenr()
        );
        return Err(Error::new(ErrorKind::Io, "tree block bytenr mismatch"));
    }
    if eb.level() >= BTRFS_MAX_LEVEL {
        log::error!("[READ] tree block {:#x} has level {}", bytenr, eb.level());
        return Err(Error::new(ErrorKind::Io, "tree block level too high"));
    }
    let nritems = eb.nritems() as usize;
    let capacity = if eb.is_leaf() {
        eb.max_leaf_items()
    } else {
        eb.max_node_ptrs()
    };
    if nritems > capacity || (!eb.is_leaf() && nritems == 0) {
        log::error!("[READ] tree block {:#x} has {} items", bytenr, nritems);
        return Err(Error::new(ErrorKind::Io, "tree block nritems invalid"));
    }

    if parent_transid != 0 && eb.generation() != parent_transid {
        fs.stats.transid_mismatches += 1;
        log::debug!(
            "[READ] parent transid verify failed on {:#x} wanted {} found {}",
            bytenr,
            parent_transid,
            eb.generation()
        );
        return Ok(Verdict::BadTransid);
    }
    Ok(Verdict::Good)
}

/// 树块头 FSID 是否属于本文件系统或其 seed
fn fsid_matches(fs: &FsInfo, eb: &ExtentBuffer) -> bool {
    let fsid = eb.fsid();
    if fsid == fs.fs_devices.metadata_uuid {
        return true;
    }
    fs.fs_devices.all().skip(1).any(|seed| seed.fsid == fsid)
}

/// 读取一个镜像的树块内容
pub fn read_extent_from_disk(fs: &mut FsInfo, eb: &mut ExtentBuffer, mirror: usize) -> Result<()> {
    let start = eb.start();
    read_data_range(fs, start, eb.data_mut(), mirror).map(|_| ())
}

/// 按逻辑地址读取任意长度的数据
///
/// `mirror` 为 0 时按默认镜像读取。RAID5/6 的 mirror 2/3 通过 P/Q 重建。
///
/// # 返回
///
/// 读取的字节数（总是等于 `buf.len()`）
pub fn read_data_range(fs: &mut FsInfo, logical: u64, buf: &mut [u8], mirror: usize) -> Result<usize> {
    let mut done = 0usize;
    while done < buf.len() {
        let cur = logical + done as u64;
        let remaining = (buf.len() - done) as u64;
        let multi = fs.chunk_map.map_block(cur, remaining, MapOp::Read, mirror)?;

        let len = match multi.raid_map.as_ref() {
            Some(raid_map) => rebuild_range(
                fs,
                &multi.stripes,
                raid_map,
                multi.stripe_len,
                cur,
                &mut buf[done..],
                mirror,
            )?,
            None => {
                let len = multi.length.min(remaining) as usize;
                let stripe = multi.stripes[0];
                read_physical(fs, &stripe, 0, &mut buf[done..done + len])?;
                len
            }
        };
        if len == 0 {
            return Err(Error::new(ErrorKind::Io, "zero length mapping"));
        }
        done += len;
    }
    Ok(done)
}

/// 从条带所在设备读取，`offset` 相对条带的物理起点
pub(crate) fn read_physical(
    fs: &mut FsInfo,
    stripe: &IoStripe,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let dev = fs
        .fs_devices
        .find_device_mut(stripe.devid, Some(&stripe.dev_uuid), None)
        .ok_or_else(|| {
            log::error!("[READ] devid {} not found", stripe.devid);
            Error::new(ErrorKind::Io, "device not found")
        })?;
    let bdev = dev.bdev()?;
    bdev.read_exact_at(stripe.physical + offset, buf)
}

/// 用 RAID5/6 校验重建 `logical` 所在数据条带中的一段
///
/// # 返回
///
/// 本次重建覆盖的字节数（不越过数据条带边界）
fn rebuild_range(
    fs: &mut FsInfo,
    stripes: &[IoStripe],
    raid_map: &[u64],
    stripe_len: u64,
    logical: u64,
    out: &mut [u8],
    mirror: usize,
) -> Result<usize> {
    let nr_data = raid_map
        .iter()
        .filter(|&&l| l != BTRFS_RAID5_P_STRIPE && l != BTRFS_RAID6_Q_STRIPE)
        .count();
    let failed = raid_map[..nr_data]
        .iter()
        .position(|&l| logical >= l && logical < l + stripe_len)
        .ok_or(Error::new(ErrorKind::Corrupted, "logical not in full stripe"))?;

    let offset = logical - raid_map[failed];
    let len = ((stripe_len - offset) as usize).min(out.len());

    let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(stripes.len());
    for (i, stripe) in stripes.iter().enumerate() {
        let mut block = alloc::vec![0u8; len];
        if i != failed {
            read_physical(fs, stripe, offset, &mut block)?;
        }
        blocks.push(block);
    }

    let data: Vec<&[u8]> = blocks[..nr_data].iter().map(|b| b.as_slice()).collect();
    let rebuilt = if mirror == 2 || blocks.len() == nr_data + 1 {
        raid56::rebuild_from_p(&data, &blocks[nr_data], failed)?
    } else {
        raid56::rebuild_from_q(&data, &blocks[nr_data + 1], failed)?
    };
    fs.stats.rebuilds += 1;
    log::debug!(
        "[READ] rebuilt {:#x}+{} from {} (mirror {})",
        logical,
        len,
        if mirror == 2 { "P" } else { "Q" },
        mirror
    );
    out[..len].copy_from_slice(&rebuilt);
    Ok(len)
}
