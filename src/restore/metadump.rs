//! metadump 镜像解析
//!
//! 镜像由若干 cluster 组成。每个 cluster 以 1 KiB 的索引块开头：
//!
//! ```text
//! magic u64 | bytenr u64 | nritems u32 | compress u8 | item[nritems] (bytenr u64, size u32)
//! ```
//!
//! 索引块之后依次存放各 item 的数据，整个 cluster 补齐到 1 KiB。
//! 索引中的 `bytenr` 是该 cluster 在镜像文件中的偏移；item 的 `bytenr` 是逻辑地址，
//! 只有 superblock item 使用其物理偏移 `BTRFS_SUPER_INFO_OFFSET`。

use crate::consts::*;
use crate::csum::CsumType;
use crate::ctree::{walk_items, ExtentBuffer, TreeReader};
use crate::error::{Error, ErrorKind, Result};
use crate::superblock::{check_super, SuperReadMode, Superblock};
use crate::types::{ChunkItem, DevItem, Key};
use crate::volumes::{read_one_chunk, read_sys_array, ChunkMap, Device, FsDevices};
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use std::vec::Vec;

/// cluster 头魔数
pub const METADUMP_MAGIC: u64 = 0xbd5c_25e2_7295_668b;

/// cluster 索引块大小，也是 cluster 的对齐单位
pub const METADUMP_BLOCK_SIZE: usize = 1024;

const HEADER_SIZE: usize = 21;
const ITEM_SIZE: usize = 12;

/// 单个 cluster 最多容纳的 item 数
pub const ITEMS_PER_CLUSTER: usize = (METADUMP_BLOCK_SIZE - HEADER_SIZE) / ITEM_SIZE;

/// item 数据的压缩方式（按 cluster 设置）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// 原样存放
    None,
    /// zlib
    Zlib,
}

impl Compression {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            _ => {
                log::error!("[RESTORE] unknown compression method {}", raw);
                Err(Error::new(ErrorKind::Unsupported, "unknown metadump compression"))
            }
        }
    }
}

/// 镜像中的一个 item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadumpItem {
    /// 逻辑地址（superblock 为物理偏移）
    pub bytenr: u64,
    /// 镜像中存放的字节数（压缩后）
    pub size: u32,
    /// 压缩方式
    pub compression: Compression,
    offset: usize,
}

impl MetadumpItem {
    /// 是否为 superblock
    pub fn is_super(&self) -> bool {
        self.bytenr == BTRFS_SUPER_INFO_OFFSET
    }
}

/// 已读入内存的 metadump 镜像
#[derive(Debug)]
pub struct MetadumpImage {
    raw: Vec<u8>,
    items: Vec<MetadumpItem>,
    by_bytenr: BTreeMap<u64, usize>,
    super_index: Option<usize>,
}

impl MetadumpImage {
    /// 读取并解析整个镜像
    ///
    /// 只解析 cluster 索引，item 数据在用到时才解压。
    pub fn parse<R: Read>(mut reader: R) -> Result<Self> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;

        let mut items = Vec::new();
        let mut by_bytenr = BTreeMap::new();
        let mut super_index = None;
        let mut cursor = 0usize;
        let mut clusters = 0usize;

        while cursor < raw.len() {
            if raw.len() - cursor < METADUMP_BLOCK_SIZE {
                log::error!("[RESTORE] truncated cluster header at {:#x}", cursor);
                return Err(Error::new(ErrorKind::Corrupted, "truncated metadump cluster"));
            }
            let block = &raw[cursor..cursor + METADUMP_BLOCK_SIZE];
            let magic = LittleEndian::read_u64(&block[0..8]);
            let bytenr = LittleEndian::read_u64(&block[8..16]);
            let nritems = LittleEndian::read_u32(&block[16..20]) as usize;

            if magic != METADUMP_MAGIC {
                log::error!("[RESTORE] bad cluster magic {:#x} at {:#x}", magic, cursor);
                return Err(Error::new(ErrorKind::Corrupted, "bad metadump cluster magic"));
            }
            if bytenr != cursor as u64 {
                log::error!(
                    "[RESTORE] cluster at {:#x} claims offset {:#x}",
                    cursor,
                    bytenr
                );
                return Err(Error::new(ErrorKind::Corrupted, "metadump cluster offset mismatch"));
            }
            if nritems > ITEMS_PER_CLUSTER {
                log::error!("[RESTORE] cluster at {:#x} has {} items", cursor, nritems);
                return Err(Error::new(ErrorKind::Corrupted, "too many items in metadump cluster"));
            }
            let compression = Compression::from_raw(block[20])?;

            let mut data = cursor + METADUMP_BLOCK_SIZE;
            for i in 0..nritems {
                let pos = HEADER_SIZE + i * ITEM_SIZE;
                let item_bytenr = LittleEndian::read_u64(&block[pos..pos + 8]);
                let size = LittleEndian::read_u32(&block[pos + 8..pos + 12]);
                if data + size as usize > raw.len() {
                    log::error!(
                        "[RESTORE] item {:#x} runs past end of image ({} bytes at {:#x})",
                        item_bytenr,
                        size,
                        data
                    );
                    return Err(Error::new(ErrorKind::Corrupted, "truncated metadump item"));
                }

                let index = items.len();
                items.push(MetadumpItem {
                    bytenr: item_bytenr,
                    size,
                    compression,
                    offset: data,
                });
                if item_bytenr == BTRFS_SUPER_INFO_OFFSET {
                    super_index = Some(index);
                } else {
                    by_bytenr.insert(item_bytenr, index);
                }
                data += size as usize;
            }

            clusters += 1;
            cursor = align_up(data, METADUMP_BLOCK_SIZE);
        }

        log::debug!(
            "[RESTORE] parsed {} clusters, {} items",
            clusters,
            items.len()
        );
        Ok(Self {
            raw,
            items,
            by_bytenr,
            super_index,
        })
    }

    /// 全部 item，按镜像中的顺序
    pub fn items(&self) -> &[MetadumpItem] {
        &self.items
    }

    /// 解压一个 item 的数据
    pub fn item_data(&self, item: &MetadumpItem) -> Result<Vec<u8>> {
        let stored = &self.raw[item.offset..item.offset + item.size as usize];
        match item.compression {
            Compression::None => Ok(stored.to_vec()),
            Compression::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(stored).read_to_end(&mut out).map_err(|e| {
                    log::error!("[RESTORE] cannot inflate item {:#x}: {}", item.bytenr, e);
                    Error::new(ErrorKind::Corrupted, "cannot inflate metadump item")
                })?;
                Ok(out)
            }
        }
    }

    /// 镜像中的 superblock
    pub fn superblock(&self) -> Result<Superblock> {
        let index = self
            .super_index
            .ok_or(Error::new(ErrorKind::NotFound, "metadump has no superblock"))?;
        let data = self.item_data(&self.items[index])?;
        if data.len() < BTRFS_SUPER_INFO_SIZE {
            log::error!("[RESTORE] superblock item is only {} bytes", data.len());
            return Err(Error::new(ErrorKind::Corrupted, "short superblock item"));
        }
        let sb = Superblock::from_bytes(&data[..BTRFS_SUPER_INFO_SIZE])?;
        check_super(&sb, SuperReadMode::Primary)?;
        Ok(sb)
    }

    /// 读取一段逻辑地址
    ///
    /// 范围必须落在单个 item 内。
    pub fn read_logical(&self, logical: u64, len: usize) -> Result<Vec<u8>> {
        let (&start, &index) = self
            .by_bytenr
            .range(..=logical)
            .next_back()
            .ok_or(Error::new(ErrorKind::NotFound, "logical address not in metadump"))?;
        let data = self.item_data(&self.items[index])?;
        let from = (logical - start) as usize;
        if from + len > data.len() {
            log::debug!(
                "[RESTORE] {:#x}+{} not covered by item {:#x} ({} bytes)",
                logical,
                len,
                start,
                data.len()
            );
            return Err(Error::new(ErrorKind::NotFound, "logical address not in metadump"));
        }
        Ok(data[from..from + len].to_vec())
    }

    /// 用 sys chunk array 与镜像中的 chunk tree 构造逻辑地址映射
    pub fn build_chunk_map(&self) -> Result<ChunkMap> {
        let sb = self.superblock()?;
        let mut map = ChunkMap::new();
        let mut devices = FsDevices::new(sb.fsid(), sb.metadata_uuid());
        add_known_device(&mut devices, &sb.dev_item(), &sb);

        read_sys_array(&sb, &mut map, &mut devices)?;

        let mut reader = ImageReader::new(self, &sb)?;
        let root = reader.read_tree_block(sb.chunk_root(), sb.chunk_root_generation())?;

        let mut chunks: Vec<(Key, ChunkItem)> = Vec::new();
        let mut devs: Vec<DevItem> = Vec::new();
        walk_items(&mut reader, &root, &Key::MIN, |key, data| {
            match key.item_type {
                BTRFS_DEV_ITEM_KEY => devs.push(DevItem::parse(data)?),
                BTRFS_CHUNK_ITEM_KEY => chunks.push((*key, ChunkItem::parse(data)?.0)),
                _ => {}
            }
            Ok(true)
        })?;

        for item in &devs {
            add_known_device(&mut devices, item, &sb);
        }
        for (key, chunk) in &chunks {
            read_one_chunk(&sb, key, chunk, &mut map, &mut devices, false)?;
        }
        log::info!(
            "[RESTORE] chunk map has {} chunks over {} devices",
            map.len(),
            devices.num_devices()
        );
        Ok(map)
    }
}

fn add_known_device(devices: &mut FsDevices, item: &DevItem, sb: &Superblock) {
    if devices.device(item.devid).is_some() {
        return;
    }
    let mut dev = Device::new_missing(item.devid, item.uuid, sb.fsid());
    dev.apply_dev_item(item);
    dev.missing = false;
    devices.add_device(dev);
}

fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) / align * align
}

/// 直接从镜像读取树块
struct ImageReader<'a> {
    image: &'a MetadumpImage,
    nodesize: usize,
    csum_type: CsumType,
}

impl<'a> ImageReader<'a> {
    fn new(image: &'a MetadumpImage, sb: &Superblock) -> Result<Self> {
        Ok(Self {
            image,
            nodesize: sb.nodesize() as usize,
            csum_type: sb.csum_type()?,
        })
    }
}

impl TreeReader for ImageReader<'_> {
    fn read_tree_block(&mut self, bytenr: u64, parent_transid: u64) -> Result<ExtentBuffer> {
        let data = self.image.read_logical(bytenr, self.nodesize)?;
        let eb = ExtentBuffer::from_bytes(bytenr, &data);
        if !eb.verify_checksum(self.csum_type) {
            log::error!("[RESTORE] checksum mismatch on tree block {:#x}", bytenr);
            return Err(Error::new(ErrorKind::ChecksumMismatch, "metadump tree block checksum mismatch"));
        }
        if eb.bytenr() != bytenr {
            log::error!(
                "[RESTORE] tree block {:#x} claims bytenr {:#x}",
                bytenr,
                eb.bytenr()
            );
            return Err(Error::new(ErrorKind::Corrupted, "metadump tree block bytenr mismatch"));
        }
        if parent_transid != 0 && eb.generation() != parent_transid {
            log::error!(
                "[RESTORE] tree block {:#x} generation {} wanted {}",
                bytenr,
                eb.generation(),
                parent_transid
            );
            return Err(Error::new(ErrorKind::TransidMismatch, "metadump tree block transid mismatch"));
        }
        Ok(eb)
    }
}
