//! 测试用的 superblock 与单设备镜像构造

use crate::block::{BlockDev, BlockDevice, DynBlockDevice, MemoryDevice};
use crate::consts::*;
use crate::csum::CsumType;
use crate::ctree::ExtentBuffer;
use crate::fs::{FsConfig, FsInfo, OpenFlags};
use crate::superblock::{checksum, write_superblock, SuperWriteIntent, Superblock};
use crate::types::{ChunkItem, DevItem, Key, RootItem, Stripe};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const FSID: [u8; BTRFS_FSID_SIZE] = [0x5a; BTRFS_FSID_SIZE];
pub const DEV_UUID: [u8; BTRFS_UUID_SIZE] = [0x11; BTRFS_UUID_SIZE];
pub const CHUNK_TREE_UUID: [u8; BTRFS_UUID_SIZE] = [0x22; BTRFS_UUID_SIZE];

pub const IMAGE_SIZE: u64 = 64 << 20;
pub const NODESIZE: u32 = 16384;
pub const SECTORSIZE: u32 = 4096;
pub const GENERATION: u64 = 5;

pub const SYS_CHUNK_START: u64 = 0x10_0000;
pub const SYS_CHUNK_LEN: u64 = 4 << 20;
pub const META_CHUNK_START: u64 = 0x50_0000;
pub const META_CHUNK_LEN: u64 = 8 << 20;
/// DUP 时第二个副本的物理起点
pub const META_DUP_PHYSICAL: u64 = META_CHUNK_START + META_CHUNK_LEN;

pub const CHUNK_ROOT: u64 = SYS_CHUNK_START;
pub const TREE_ROOT: u64 = META_CHUNK_START;
pub const EXTENT_ROOT: u64 = 0x50_4000;
pub const DEV_ROOT: u64 = 0x50_8000;
pub const FS_ROOT: u64 = 0x50_c000;
pub const CSUM_ROOT: u64 = 0x51_0000;
pub const UUID_ROOT: u64 = 0x51_4000;

/// 单条带 SYSTEM chunk（devid 1）
pub fn sys_chunk(_logical: u64, length: u64, physical: u64) -> ChunkItem {
    ChunkItem {
        length,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: BTRFS_STRIPE_LEN,
        chunk_type: BTRFS_BLOCK_GROUP_SYSTEM,
        io_align: BTRFS_STRIPE_LEN as u32,
        io_width: BTRFS_STRIPE_LEN as u32,
        sector_size: SECTORSIZE,
        num_stripes: 1,
        sub_stripes: 1,
        stripes: alloc::vec![Stripe {
            devid: 1,
            offset: physical,
            dev_uuid: DEV_UUID,
        }],
    }
}

/// METADATA chunk，`dup` 时两个条带都在 devid 1 上
pub fn meta_chunk(dup: bool) -> ChunkItem {
    let mut chunk = sys_chunk(META_CHUNK_START, META_CHUNK_LEN, META_CHUNK_START);
    chunk.chunk_type = BTRFS_BLOCK_GROUP_METADATA;
    if dup {
        chunk.chunk_type |= BTRFS_BLOCK_GROUP_DUP;
        chunk.stripes.push(Stripe {
            devid: 1,
            offset: META_DUP_PHYSICAL,
            dev_uuid: DEV_UUID,
        });
        chunk.num_stripes = 2;
    }
    chunk
}

pub fn sample_dev_item() -> DevItem {
    DevItem {
        devid: 1,
        total_bytes: IMAGE_SIZE,
        bytes_used: SYS_CHUNK_LEN + META_CHUNK_LEN,
        io_align: SECTORSIZE,
        io_width: SECTORSIZE,
        sector_size: SECTORSIZE,
        generation: 0,
        uuid: DEV_UUID,
        fsid: FSID,
        ..Default::default()
    }
}

/// 64 MiB 单设备文件系统的 superblock（带有效校验和）
pub fn sample_superblock() -> Superblock {
    let mut sb = Superblock::default();
    sb.set_magic(BTRFS_MAGIC);
    sb.set_bytenr(BTRFS_SUPER_INFO_OFFSET);
    sb.set_fsid(&FSID);
    sb.set_generation(GENERATION);
    sb.set_root(TREE_ROOT);
    sb.set_chunk_root(CHUNK_ROOT);
    sb.set_chunk_root_generation(GENERATION);
    sb.set_total_bytes(IMAGE_SIZE);
    sb.set_bytes_used(6 * NODESIZE as u64);
    sb.set_root_dir_objectid(BTRFS_ROOT_TREE_DIR_OBJECTID);
    sb.set_num_devices(1);
    sb.set_sectorsize(SECTORSIZE);
    sb.set_nodesize(NODESIZE);
    sb.set_stripesize(SECTORSIZE);
    sb.set_incompat_flags(
        BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF
            | BTRFS_FEATURE_INCOMPAT_EXTENDED_IREF
            | BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA
            | BTRFS_FEATURE_INCOMPAT_NO_HOLES,
    );
    sb.set_dev_item(&sample_dev_item());
    sb.set_label(b"btrfs-test");

    let key = Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, SYS_CHUNK_START);
    let chunk = sys_chunk(SYS_CHUNK_START, SYS_CHUNK_LEN, SYS_CHUNK_START).to_bytes();
    let array = sb.sys_chunk_array_mut();
    key.write(&mut array[..Key::SIZE]);
    array[Key::SIZE..Key::SIZE + chunk.len()].copy_from_slice(&chunk);
    sb.set_sys_chunk_array_size((Key::SIZE + chunk.len()) as u32);

    checksum::set_checksum_with(&mut sb, CsumType::Crc32c);
    sb
}

/// 镜像构造选项
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOptions {
    /// METADATA chunk 使用 DUP
    pub dup_metadata: bool,
    /// 创建 uuid tree
    pub uuid_tree: bool,
    /// 额外的 incompat 位
    pub extra_incompat: u64,
}

fn leaf(start: u64, owner: u64) -> ExtentBuffer {
    let mut eb = ExtentBuffer::new_empty(start, NODESIZE as usize, owner, 0, GENERATION, &FSID);
    eb.set_chunk_tree_uuid(&CHUNK_TREE_UUID);
    eb
}

fn put(bdev: &mut BlockDev<MemoryDevice>, eb: &mut ExtentBuffer, physicals: &[u64]) {
    eb.set_header_flag(BTRFS_HEADER_FLAG_WRITTEN);
    eb.update_checksum(CsumType::Crc32c);
    for &physical in physicals {
        bdev.write_at(physical, eb.data()).unwrap();
    }
}

fn meta_physicals(logical: u64, dup: bool) -> Vec<u64> {
    let mut out = alloc::vec![logical];
    if dup {
        out.push(logical - META_CHUNK_START + META_DUP_PHYSICAL);
    }
    out
}

/// 构造一个 64 MiB 的单设备镜像
///
/// chunk tree 位于 SYSTEM chunk（恒等映射），其余树块位于 METADATA chunk。
/// fs tree 叶子中有一个根目录 INODE_ITEM。
pub fn build_image(opts: ImageOptions) -> MemoryDevice {
    let mut bdev = BlockDev::new(MemoryDevice::new(IMAGE_SIZE)).unwrap();

    let mut sb = sample_superblock();
    if opts.extra_incompat != 0 {
        sb.set_incompat_flags(sb.incompat_flags() | opts.extra_incompat);
    }

    // chunk tree
    let mut chunk_leaf = leaf(CHUNK_ROOT, BTRFS_CHUNK_TREE_OBJECTID);
    let mut dev_item = [0u8; DevItem::SIZE];
    sample_dev_item().write(&mut dev_item);
    chunk_leaf
        .push_item(&Key::new(BTRFS_DEV_ITEMS_OBJECTID, BTRFS_DEV_ITEM_KEY, 1), &dev_item)
        .unwrap();
    chunk_leaf
        .push_item(
            &Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, SYS_CHUNK_START),
            &sys_chunk(SYS_CHUNK_START, SYS_CHUNK_LEN, SYS_CHUNK_START).to_bytes(),
        )
        .unwrap();
    chunk_leaf
        .push_item(
            &Key::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, META_CHUNK_START),
            &meta_chunk(opts.dup_metadata).to_bytes(),
        )
        .unwrap();
    put(&mut bdev, &mut chunk_leaf, &[CHUNK_ROOT]);

    // 各棵树的叶子
    let mut trees: Vec<(u64, u64)> = alloc::vec![
        (BTRFS_EXTENT_TREE_OBJECTID, EXTENT_ROOT),
        (BTRFS_DEV_TREE_OBJECTID, DEV_ROOT),
        (BTRFS_FS_TREE_OBJECTID, FS_ROOT),
        (BTRFS_CSUM_TREE_OBJECTID, CSUM_ROOT),
    ];
    if opts.uuid_tree {
        trees.push((BTRFS_UUID_TREE_OBJECTID, UUID_ROOT));
    }

    let mut root_leaf = leaf(TREE_ROOT, BTRFS_ROOT_TREE_OBJECTID);
    for &(objectid, bytenr) in &trees {
        let mut eb = leaf(bytenr, objectid);
        if objectid == BTRFS_FS_TREE_OBJECTID {
            eb.push_item(
                &Key::new(BTRFS_FIRST_FREE_OBJECTID, BTRFS_INODE_ITEM_KEY, 0),
                &[0u8; 160],
            )
            .unwrap();
        }
        put(&mut bdev, &mut eb, &meta_physicals(bytenr, opts.dup_metadata));

        let item = RootItem::new(bytenr, GENERATION, 0);
        root_leaf
            .push_item(&Key::new(objectid, BTRFS_ROOT_ITEM_KEY, 0), item.as_bytes())
            .unwrap();
    }
    put(&mut bdev, &mut root_leaf, &meta_physicals(TREE_ROOT, opts.dup_metadata));

    checksum::set_checksum(&mut sb).unwrap();
    write_superblock(&mut bdev, &mut sb, SuperWriteIntent::All).unwrap();
    bdev.into_inner()
}

/// 可在多次打开之间共享的内存设备
///
/// 记录落在 chunk tree 及之后区域（树块区域）的读请求次数。
#[derive(Clone)]
pub struct SharedDevice {
    pub inner: Arc<Mutex<MemoryDevice>>,
    tree_reads: Arc<AtomicU64>,
}

impl SharedDevice {
    pub fn new(dev: MemoryDevice) -> Self {
        Self {
            inner: Arc::new(Mutex::new(dev)),
            tree_reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 树块区域的读请求次数
    pub fn tree_reads(&self) -> u64 {
        self.tree_reads.load(Ordering::SeqCst)
    }

    pub fn corrupt(&self, offset: u64) {
        self.inner.lock().corrupt(offset);
    }

    pub fn peek(&self, offset: u64, buf: &mut [u8]) {
        self.inner.lock().peek(offset, buf);
    }
}

impl BlockDevice for SharedDevice {
    fn block_size(&self) -> u32 {
        self.inner.lock().block_size()
    }

    fn sector_size(&self) -> u32 {
        self.inner.lock().sector_size()
    }

    fn total_blocks(&self) -> u64 {
        self.inner.lock().total_blocks()
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> crate::error::Result<usize> {
        let mut dev = self.inner.lock();
        if lba * dev.sector_size() as u64 >= CHUNK_ROOT {
            self.tree_reads.fetch_add(1, Ordering::SeqCst);
        }
        dev.read_blocks(lba, count, buf)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> crate::error::Result<usize> {
        self.inner.lock().write_blocks(lba, count, buf)
    }

    fn flush(&mut self) -> crate::error::Result<()> {
        self.inner.lock().flush()
    }
}

/// 以给定选项打开内存镜像
pub fn open_image(dev: &SharedDevice, flags: OpenFlags) -> crate::error::Result<FsInfo> {
    let dev: DynBlockDevice = Box::new(dev.clone());
    FsInfo::open_devices(
        alloc::vec![(dev, String::from("test-image"))],
        flags,
        FsConfig::default(),
    )
}

/// 按 metadump 格式编码 `(bytenr, data)` 列表
///
/// 没有 item 时输出一个空 cluster。
pub fn encode_metadump(items: &[(u64, Vec<u8>)], zlib: bool) -> Vec<u8> {
    use crate::restore::{ITEMS_PER_CLUSTER, METADUMP_BLOCK_SIZE, METADUMP_MAGIC};
    use byteorder::{ByteOrder, LittleEndian};
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    let empty: [(u64, Vec<u8>); 0] = [];
    let mut clusters: Vec<&[(u64, Vec<u8>)]> = items.chunks(ITEMS_PER_CLUSTER).collect();
    if clusters.is_empty() {
        clusters.push(&empty);
    }

    let mut out = Vec::new();
    for cluster in clusters {
        let start = out.len();
        let mut index = alloc::vec![0u8; METADUMP_BLOCK_SIZE];
        LittleEndian::write_u64(&mut index[0..8], METADUMP_MAGIC);
        LittleEndian::write_u64(&mut index[8..16], start as u64);
        LittleEndian::write_u32(&mut index[16..20], cluster.len() as u32);
        index[20] = zlib as u8;

        let mut payloads = Vec::new();
        for (i, (bytenr, data)) in cluster.iter().enumerate() {
            let stored = if zlib {
                let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(data).unwrap();
                enc.finish().unwrap()
            } else {
                data.clone()
            };
            let pos = 21 + i * 12;
            LittleEndian::write_u64(&mut index[pos..pos + 8], *bytenr);
            LittleEndian::write_u32(&mut index[pos + 8..pos + 12], stored.len() as u32);
            payloads.extend_from_slice(&stored);
        }

        out.extend_from_slice(&index);
        out.extend_from_slice(&payloads);
        let padded = (out.len() + METADUMP_BLOCK_SIZE - 1) / METADUMP_BLOCK_SIZE * METADUMP_BLOCK_SIZE;
        out.resize(padded, 0);
    }
    out
}

/// 从镜像中取出 superblock 与全部树块（逻辑地址即主条带物理地址）
pub fn metadump_items(dev: &MemoryDevice) -> Vec<(u64, Vec<u8>)> {
    let mut sb = alloc::vec![0u8; BTRFS_SUPER_INFO_SIZE];
    dev.peek(BTRFS_SUPER_INFO_OFFSET, &mut sb);
    let mut items = alloc::vec![(BTRFS_SUPER_INFO_OFFSET, sb)];

    for bytenr in [CHUNK_ROOT, TREE_ROOT, EXTENT_ROOT, DEV_ROOT, FS_ROOT, CSUM_ROOT, UUID_ROOT] {
        let mut block = alloc::vec![0u8; NODESIZE as usize];
        dev.peek(bytenr, &mut block);
        if block.iter().any(|&b| b != 0) {
            items.push((bytenr, block));
        }
    }
    items
}

/// 整个镜像的 metadump
pub fn metadump_of(dev: &MemoryDevice, zlib: bool) -> Vec<u8> {
    encode_metadump(&metadump_items(dev), zlib)
}
