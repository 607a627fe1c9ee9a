//! 多线程恢复
//!
//! 主线程把 item 下标放进共享队列，工作线程取出后在锁外解压，再持锁写入输出设备。
//! 任一线程出错后其余线程尽快退出，主线程返回第一个错误。

use super::metadump::{MetadumpImage, MetadumpItem};
use crate::block::{BlockDev, BlockDevice};
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::{write_superblock, SuperWriteIntent, Superblock};
use crate::volumes::{ChunkMap, MapOp};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::vec::Vec;

/// 恢复统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// 写入的树块 item 数
    pub items: usize,
    /// 写入设备的字节数（含镜像副本）
    pub bytes_written: u64,
    /// superblock 写入的副本数
    pub super_copies: usize,
}

struct WorkState<'a, D: BlockDevice> {
    queue: VecDeque<usize>,
    done: bool,
    error: Option<Error>,
    output: &'a mut BlockDev<D>,
    stats: RestoreStats,
}

struct Shared<'a, D: BlockDevice> {
    state: Mutex<WorkState<'a, D>>,
    cond: Condvar,
}

impl<D: BlockDevice> Shared<'_, D> {
    /// 取下一个任务；队列已关闭或出错时返回 `None`
    fn next(&self) -> Option<usize> {
        let mut state = self.state.lock();
        loop {
            if state.error.is_some() {
                return None;
            }
            if let Some(index) = state.queue.pop_front() {
                return Some(index);
            }
            if state.done {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    fn fail(&self, err: Error) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(err);
        }
        drop(state);
        self.cond.notify_all();
    }
}

/// 恢复目标
struct Target<'m> {
    map: &'m ChunkMap,
    devid: u64,
}

impl Target<'_> {
    /// 把一个树块 item 写到本设备上的全部条带
    fn write_item<D: BlockDevice>(
        &self,
        output: &mut BlockDev<D>,
        item: &MetadumpItem,
        data: &[u8],
    ) -> Result<u64> {
        let mut written = 0u64;
        let mut done = 0usize;
        while done < data.len() {
            let logical = item.bytenr + done as u64;
            let remaining = (data.len() - done) as u64;
            let multi = self
                .map
                .map_block(logical, remaining, MapOp::Write, 0)
                .map_err(|_| {
                    log::error!("[RESTORE] {:#x} is not covered by any chunk", logical);
                    Error::new(ErrorKind::Io, "metadump item outside of chunk map")
                })?;
            if multi.raid_map.is_some() {
                log::error!("[RESTORE] {:#x} lives in a RAID5/6 chunk", logical);
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "restoring into RAID5/6 chunks is not supported",
                ));
            }

            let len = multi.length.min(remaining) as usize;
            let chunk = &data[done..done + len];
            for stripe in multi.stripes.iter().filter(|s| s.devid == self.devid) {
                output.write_at(stripe.physical, chunk).map_err(|e| {
                    log::error!(
                        "[RESTORE] write of {:#x} at physical {:#x} failed: {}",
                        logical,
                        stripe.physical,
                        e
                    );
                    e
                })?;
                written += len as u64;
            }
            done += len;
        }
        Ok(written)
    }
}

impl MetadumpImage {
    /// 把镜像恢复到单个输出设备
    ///
    /// 先构造 chunk 映射，再启动 `workers` 个线程写树块；全部成功后写 superblock
    /// （主副本以及设备容纳得下的备份副本）。只写属于 superblock 中设备项 devid 的条带。
    pub fn restore<D: BlockDevice + Send>(
        &self,
        output: &mut BlockDev<D>,
        workers: usize,
    ) -> Result<RestoreStats> {
        let mut sb: Superblock = self.superblock()?;
        let map = self.build_chunk_map()?;
        let target = Target {
            map: &map,
            devid: sb.dev_item().devid,
        };
        let workers = workers.max(1);

        log::info!(
            "[RESTORE] restoring {} items to devid {} with {} workers",
            self.items().len(),
            target.devid,
            workers
        );

        let shared = Shared {
            state: Mutex::new(WorkState {
                queue: VecDeque::new(),
                done: false,
                error: None,
                output,
                stats: RestoreStats::default(),
            }),
            cond: Condvar::new(),
        };

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| self.run_worker(&shared, &target)));
            }

            for (index, item) in self.items().iter().enumerate() {
                if item.is_super() {
                    continue;
                }
                let mut state = shared.state.lock();
                if state.error.is_some() {
                    break;
                }
                state.queue.push_back(index);
                drop(state);
                shared.cond.notify_one();
            }
            shared.state.lock().done = true;
            shared.cond.notify_all();

            for handle in handles {
                if handle.join().is_err() {
                    shared.fail(Error::new(ErrorKind::Io, "restore worker panicked"));
                }
            }
        });

        let state = shared.state.into_inner();
        if let Some(err) = state.error {
            log::error!("[RESTORE] restore failed: {}", err);
            return Err(err);
        }
        let mut stats = state.stats;
        let output = state.output;

        stats.super_copies = write_superblock(output, &mut sb, SuperWriteIntent::All)?;
        output.flush()?;
        log::info!(
            "[RESTORE] wrote {} items, {} bytes, {} superblock copies",
            stats.items,
            stats.bytes_written,
            stats.super_copies
        );
        Ok(stats)
    }

    fn run_worker<D: BlockDevice>(&self, shared: &Shared<'_, D>, target: &Target<'_>) {
        while let Some(index) = shared.next() {
            let item = &self.items()[index];
            let data = match self.item_data(item) {
                Ok(data) => data,
                Err(err) => {
                    shared.fail(err);
                    return;
                }
            };

            let mut state = shared.state.lock();
            if state.error.is_some() {
                return;
            }
            match target.write_item(&mut *state.output, item, &data) {
                Ok(written) => {
                    state.stats.items += 1;
                    state.stats.bytes_written += written;
                    log::trace!("[RESTORE] item {:#x} done ({} bytes)", item.bytenr, written);
                }
                Err(err) => {
                    drop(state);
                    shared.fail(err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::metadump::METADUMP_BLOCK_SIZE;
    use crate::block::MemoryDevice;
    use crate::consts::*;
    use crate::ctree::Path;
    use crate::fs::OpenFlags;
    use crate::testutil::*;
    use crate::types::Key;
    use alloc::vec;

    fn restore_into(raw: &[u8], workers: usize) -> Result<(MemoryDevice, RestoreStats)> {
        let image = MetadumpImage::parse(raw)?;
        let mut output = BlockDev::new(MemoryDevice::new(IMAGE_SIZE))?;
        let stats = image.restore(&mut output, workers)?;
        Ok((output.into_inner(), stats))
    }

    #[test]
    fn test_restore_then_open() {
        let raw = metadump_of(&build_image(ImageOptions::default()), true);
        let (dev, stats) = restore_into(&raw, 3).unwrap();
        // chunk root + tree root + 四棵树
        assert_eq!(stats.items, 6);
        assert_eq!(stats.bytes_written, 6 * NODESIZE as u64);
        assert_eq!(stats.super_copies, 1);

        let dev = SharedDevice::new(dev);
        let mut fs = open_image(&dev, OpenFlags::empty()).unwrap();
        assert_eq!(fs.fs_root().unwrap().bytenr(), FS_ROOT);
        let key = Key::new(BTRFS_FIRST_FREE_OBJECTID, BTRFS_INODE_ITEM_KEY, 0);
        let mut path = Path::new();
        assert!(fs.search(BTRFS_FS_TREE_OBJECTID, &key, &mut path).unwrap());
    }

    #[test]
    fn test_restore_dup_writes_both_copies() {
        let opts = ImageOptions {
            dup_metadata: true,
            ..Default::default()
        };
        let raw = metadump_of(&build_image(opts), false);
        let (dev, stats) = restore_into(&raw, 1).unwrap();
        // 五个 METADATA 树块各写两份
        assert_eq!(stats.bytes_written, (1 + 5 * 2) * NODESIZE as u64);

        let mut primary = vec![0u8; NODESIZE as usize];
        let mut copy = vec![0u8; NODESIZE as usize];
        dev.peek(FS_ROOT, &mut primary);
        dev.peek(FS_ROOT - META_CHUNK_START + META_DUP_PHYSICAL, &mut copy);
        assert_eq!(primary, copy);
        assert!(primary.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_unmapped_item_fails() {
        let source = build_image(ImageOptions::default());
        let mut items = metadump_items(&source);
        items.push((0x300_0000, vec![0xab; NODESIZE as usize]));
        let raw = encode_metadump(&items, false);

        let err = restore_into(&raw, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_corrupt_payload_fails() {
        let source = build_image(ImageOptions::default());
        let mut raw = metadump_of(&source, true);
        let image = MetadumpImage::parse(&raw[..]).unwrap();
        let victim = *image
            .items()
            .iter()
            .find(|item| item.bytenr == FS_ROOT)
            .unwrap();
        // 破坏 zlib 流
        let pos = find_payload(&raw, &image, &victim);
        for b in &mut raw[pos..pos + victim.size as usize] {
            *b = 0xff;
        }

        let err = restore_into(&raw, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_no_superblock() {
        let source = build_image(ImageOptions::default());
        let items: Vec<(u64, Vec<u8>)> = metadump_items(&source)
            .into_iter()
            .filter(|(bytenr, _)| *bytenr != BTRFS_SUPER_INFO_OFFSET)
            .collect();
        let err = restore_into(&encode_metadump(&items, false), 2).unwrap_err();
        assert!(err.is_not_found());
    }

    /// 单 cluster 镜像中 item 数据的起始偏移
    fn find_payload(raw: &[u8], image: &MetadumpImage, item: &MetadumpItem) -> usize {
        let stored = image.items().iter().position(|i| i == item).unwrap();
        let mut pos = METADUMP_BLOCK_SIZE;
        for earlier in &image.items()[..stored] {
            pos += earlier.size as usize;
        }
        assert!(pos + item.size as usize <= raw.len());
        pos
    }
}
