//! 树块写入

use super::read::read_physical;
use crate::block::{BlockDev, BlockDevice};
use crate::consts::*;
use crate::csum::CsumType;
use crate::ctree::ExtentBuffer;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::FsInfo;
use crate::volumes::{raid56, IoStripe, MapOp};
use alloc::vec::Vec;

/// 写入前的树块头检查
fn check_before_write(fs: &FsInfo, eb: &ExtentBuffer) -> Result<()> {
    if eb.bytenr() != eb.start() {
        log::error!(
            "[WRITE] tree block {:#x} header bytenr {:#x}",
            eb.start(),
            eb.bytenr()
        );
        return Err(Error::new(ErrorKind::Corrupted, "header bytenr mismatch"));
    }
    if eb.level() >= BTRFS_MAX_LEVEL {
        return Err(Error::new(ErrorKind::Corrupted, "tree block level too high"));
    }
    if eb.len() != fs.nodesize as usize {
        return Err(Error::new(ErrorKind::InvalidInput, "tree block size mismatch"));
    }
    if eb.start() % fs.sectorsize as u64 != 0 {
        return Err(Error::new(ErrorKind::InvalidInput, "unaligned tree block"));
    }
    Ok(())
}

/// 写回一个树块
///
/// 设置 WRITTEN 标志、重新计算校验和后写到所有条带；RAID5/6 做整条带读改写。
/// 任一条带写失败即返回错误。
pub fn write_tree_block(fs: &mut FsInfo, eb: &ExtentBuffer) -> Result<()> {
    check_before_write(fs, eb)?;

    let mut eb = eb.clone();
    eb.set_header_flag(BTRFS_HEADER_FLAG_WRITTEN);
    eb.update_checksum(fs.csum_type);

    write_data_range(fs, eb.start(), eb.data())?;
    log::debug!(
        "[WRITE] tree block {:#x} generation {}",
        eb.start(),
        eb.generation()
    );

    let mut cached = eb;
    cached.clear_flag(crate::ctree::EbFlags::DIRTY);
    fs.cache.insert(cached);
    Ok(())
}

/// 按逻辑地址写入数据到所有副本
pub fn write_data_range(fs: &mut FsInfo, logical: u64, data: &[u8]) -> Result<()> {
    let mut done = 0usize;
    while done < data.len() {
        let cur = logical + done as u64;
        let remaining = (data.len() - done) as u64;
        let multi = fs.chunk_map.map_block(cur, remaining, MapOp::Write, 0)?;

        let len = match multi.raid_map.as_ref() {
            Some(raid_map) => write_full_stripe(
                fs,
                &multi.stripes,
                raid_map,
                multi.stripe_len,
                cur,
                &data[done..],
            )?,
            None => {
                let len = multi.length.min(remaining) as usize;
                for stripe in &multi.stripes {
                    write_physical(fs, stripe, 0, &data[done..done + len])?;
                }
                len
            }
        };
        if len == 0 {
            return Err(Error::new(ErrorKind::Io, "zero length mapping"));
        }
        done += len;
    }
    Ok(())
}

fn write_physical(fs: &mut FsInfo, stripe: &IoStripe, offset: u64, data: &[u8]) -> Result<()> {
    let devid = stripe.devid;
    let physical = stripe.physical + offset;
    let dev = fs
        .fs_devices
        .find_device_mut(devid, Some(&stripe.dev_uuid), None)
        .ok_or(Error::new(ErrorKind::Io, "device not found"))?;
    if !dev.writeable {
        log::error!("[WRITE] devid {} is not writeable", devid);
        return Err(Error::new(ErrorKind::Io, "device is not writeable"));
    }
    let bdev = dev.bdev()?;
    bdev.write_at(physical, data).map_err(|e| {
        log::error!(
            "[WRITE] devid {} physical {:#x} len {} failed: {}",
            devid,
            physical,
            data.len(),
            e
        );
        e
    })?;
    Ok(())
}

/// RAID5/6 读改写
fn write_full_stripe(
    fs: &mut FsInfo,
    stripes: &[IoStripe],
    raid_map: &[u64],
    stripe_len: u64,
    logical: u64,
    data: &[u8],
) -> Result<usize> {
    let nr_data = raid_map
        .iter()
        .filter(|&&l| l != BTRFS_RAID5_P_STRIPE && l != BTRFS_RAID6_Q_STRIPE)
        .count();
    let target = raid_map[..nr_data]
        .iter()
        .position(|&l| logical >= l && logical < l + stripe_len)
        .ok_or(Error::new(ErrorKind::Corrupted, "logical not in full stripe"))?;
    let offset = logical - raid_map[target];
    let len = ((stripe_len - offset) as usize).min(data.len());

    let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(nr_data);
    for (i, stripe) in stripes[..nr_data].iter().enumerate() {
        if i == target {
            blocks.push(data[..len].to_vec());
        } else {
            let mut block = alloc::vec![0u8; len];
            read_physical(fs, stripe, offset, &mut block)?;
            blocks.push(block);
        }
    }

    let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
    let p = raid56::gen_p(&refs)?;
    let q = if stripes.len() > nr_data + 1 {
        Some(raid56::gen_q(&refs)?)
    } else {
        None
    };

    write_physical(fs, &stripes[target], offset, &data[..len])?;
    write_physical(fs, &stripes[nr_data], offset, &p)?;
    if let Some(q) = q {
        write_physical(fs, &stripes[nr_data + 1], offset, &q)?;
    }
    Ok(len)
}

/// mkfs 原语：计算校验和后把树块直接写到设备的物理偏移
pub fn write_temp_extent_buffer<D: BlockDevice>(
    bdev: &mut BlockDev<D>,
    eb: &mut ExtentBuffer,
    physical: u64,
    csum_type: CsumType,
) -> Result<()> {
    eb.update_checksum(csum_type);
    bdev.write_at(physical, eb.data())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryDevice;
    use crate::disk_io::{read_data_range, read_tree_block};
    use crate::fs::OpenFlags;
    use crate::testutil::*;
    use crate::types::{ChunkItem, Key, Stripe};
    use crate::volumes::MapLookup;

    fn open(opts: ImageOptions) -> (SharedDevice, FsInfo) {
        let dev = SharedDevice::new(build_image(opts));
        let fs = open_image(&dev, OpenFlags::WRITES).unwrap();
        (dev, fs)
    }

    #[test]
    fn test_write_then_read() {
        let (_dev, mut fs) = open(ImageOptions::default());
        let bytenr = 0x51_c000;
        let mut eb = ExtentBuffer::new_empty(bytenr, NODESIZE as usize, 5, 0, 6, &FSID);
        eb.push_item(&Key::new(257, 1, 0), &[0xab; 64]).unwrap();
        write_tree_block(&mut fs, &eb).unwrap();

        fs.cache.invalidate(bytenr, NODESIZE);
        let back = read_tree_block(&mut fs, bytenr, 6).unwrap();
        assert_eq!(back.nritems(), 1);
        assert_eq!(back.item_key(0), Key::new(257, 1, 0));
        assert_eq!(back.item_data(0).unwrap(), &[0xab; 64][..]);
        assert_ne!(back.header_flags() & BTRFS_HEADER_FLAG_WRITTEN, 0);
    }

    #[test]
    fn test_write_dup_fans_out() {
        let (dev, mut fs) = open(ImageOptions {
            dup_metadata: true,
            ..Default::default()
        });
        let bytenr = 0x52_0000;
        let eb = ExtentBuffer::new_empty(bytenr, NODESIZE as usize, 5, 0, 6, &FSID);
        write_tree_block(&mut fs, &eb).unwrap();

        let mut a = alloc::vec![0u8; NODESIZE as usize];
        let mut b = alloc::vec![0u8; NODESIZE as usize];
        dev.peek(bytenr, &mut a);
        dev.peek(bytenr - META_CHUNK_START + META_DUP_PHYSICAL, &mut b);
        assert_eq!(a, b);
        assert_eq!(ExtentBuffer::from_bytes(bytenr, &a).bytenr(), bytenr);
    }

    #[test]
    fn test_header_mismatch_rejected() {
        let (_dev, mut fs) = open(ImageOptions::default());
        let mut eb = ExtentBuffer::new_empty(0x52_4000, NODESIZE as usize, 5, 0, 6, &FSID);
        eb.set_bytenr(0x52_8000);
        let err = write_tree_block(&mut fs, &eb).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_raid5_write_and_rebuild() {
        let (dev, mut fs) = open(ImageOptions::default());
        let logical = 0x200_0000;
        let physicals = [0x220_0000u64, 0x240_0000, 0x260_0000];
        let chunk = ChunkItem {
            length: 2 * 2 * BTRFS_STRIPE_LEN,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            chunk_type: BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID5,
            io_align: BTRFS_STRIPE_LEN as u32,
            io_width: BTRFS_STRIPE_LEN as u32,
            sector_size: SECTORSIZE,
            num_stripes: 3,
            sub_stripes: 1,
            stripes: physicals
                .iter()
                .map(|&offset| Stripe {
                    devid: 1,
                    offset,
                    dev_uuid: DEV_UUID,
                })
                .collect(),
        };
        fs.chunk_map.insert(MapLookup::from_chunk(logical, &chunk)).unwrap();

        let data: Vec<u8> = (0..8192u32).map(|i| (i * 7) as u8).collect();
        write_data_range(&mut fs, logical, &data).unwrap();

        // 第二个数据条带为零，P 等于第一个数据条带
        let mut parity = alloc::vec![0u8; data.len()];
        dev.peek(physicals[2], &mut parity);
        assert_eq!(parity, data);

        let mut buf = alloc::vec![0u8; data.len()];
        read_data_range(&mut fs, logical, &mut buf, 0).unwrap();
        assert_eq!(buf, data);

        dev.inner.lock().poke(physicals[0], &alloc::vec![0u8; data.len()]);
        fs.reset_stats();
        let mut buf = alloc::vec![0u8; data.len()];
        read_data_range(&mut fs, logical, &mut buf, 2).unwrap();
        assert_eq!(buf, data);
        assert_eq!(fs.stats().rebuilds, 1);
    }

    #[test]
    fn test_raid6_tree_block_rebuilt_from_q() {
        let (dev, mut fs) = open(ImageOptions::default());
        let logical = 0x300_0000;
        let physicals = [0x280_0000u64, 0x2a0_0000, 0x2c0_0000, 0x2e0_0000];
        let chunk = ChunkItem {
            length: 2 * 2 * BTRFS_STRIPE_LEN,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            chunk_type: BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID6,
            io_align: BTRFS_STRIPE_LEN as u32,
            io_width: BTRFS_STRIPE_LEN as u32,
            sector_size: SECTORSIZE,
            num_stripes: 4,
            sub_stripes: 1,
            stripes: physicals
                .iter()
                .map(|&offset| Stripe {
                    devid: 1,
                    offset,
                    dev_uuid: DEV_UUID,
                })
                .collect(),
        };
        fs.chunk_map.insert(MapLookup::from_chunk(logical, &chunk)).unwrap();
        assert_eq!(fs.chunk_map.num_copies(logical, NODESIZE as u64), 3);

        let mut eb = ExtentBuffer::new_empty(logical, NODESIZE as usize, 5, 0, 6, &FSID);
        eb.push_item(&Key::new(257, 1, 0), &[0x5a; 100]).unwrap();
        write_tree_block(&mut fs, &eb).unwrap();
        fs.cache.invalidate(logical, NODESIZE);

        // 数据条带和 P 都损坏，只能用 Q 重建
        dev.corrupt(physicals[0] + 0x100);
        dev.corrupt(physicals[2] + 0x100);
        fs.reset_stats();

        let back = read_tree_block(&mut fs, logical, 6).unwrap();
        assert_eq!(back.item_data(0).unwrap(), &[0x5a; 100][..]);
        let stats = fs.stats();
        assert_eq!(stats.mirror_reads, 3);
        assert_eq!(stats.csum_failures, 2);
        assert_eq!(stats.rebuilds, 2);

        let mut buf = alloc::vec![0u8; NODESIZE as usize];
        read_data_range(&mut fs, logical, &mut buf, 3).unwrap();
        assert_eq!(ExtentBuffer::from_bytes(logical, &buf).item_key(0), Key::new(257, 1, 0));
    }

    #[test]
    fn test_write_temp_extent_buffer() {
        let mut bdev = BlockDev::new(MemoryDevice::new(4 << 20)).unwrap();
        let mut eb = ExtentBuffer::new_empty(0x10_0000, 4096, 3, 0, 1, &FSID);
        write_temp_extent_buffer(&mut bdev, &mut eb, 0x20_0000, CsumType::Crc32c).unwrap();

        let mut raw = alloc::vec![0u8; 4096];
        bdev.read_exact_at(0x20_0000, &mut raw).unwrap();
        let back = ExtentBuffer::from_bytes(0x10_0000, &raw);
        assert!(back.verify_checksum(CsumType::Crc32c));
        assert_eq!(back.owner(), 3);
    }
}
