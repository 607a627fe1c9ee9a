//! 备份根轮转
//!
//! superblock 末尾有 4 个备份根槽位，每次提交写入下一个槽位。
//! 当前 root tree 损坏时可以从最新的备份槽位重新打开文件系统。

use super::Superblock;
use crate::consts::BTRFS_NUM_BACKUP_ROOTS;
use crate::types::RootBackup;

/// 找到最佳备份根槽位
///
/// 跳过 generation 与 superblock 当前 generation 相同的槽位（它描述的就是当前状态），
/// 在其余槽位中选 tree root generation 最大者。全部为空时返回 0。
pub fn find_best_backup_root(sb: &Superblock) -> usize {
    let orig_gen = sb.generation();
    let mut best_gen = 0;
    let mut best_index = 0;

    for i in 0..BTRFS_NUM_BACKUP_ROOTS {
        let cur = sb.backup_root(i).tree_root_gen;
        if cur == orig_gen {
            continue;
        }
        if cur > best_gen {
            best_index = i;
            best_gen = cur;
        }
    }
    best_index
}

/// 把当前根写入下一个备份槽位
///
/// 若上一次使用的槽位已经记录了同一 generation 的 tree root，则原地覆盖它。
///
/// # 参数
/// * `sb` - superblock
/// * `backup` - 当前各树的根（`tree_root_gen` 为 root tree 根节点的 generation）
///
/// # 返回
/// 写入的槽位
pub fn backup_super_roots(sb: &mut Superblock, backup: &RootBackup) -> usize {
    let last = find_best_backup_root(sb);
    let mut next = (last + 1) % BTRFS_NUM_BACKUP_ROOTS;

    if sb.backup_root(last).tree_root_gen == backup.tree_root_gen {
        next = last;
    }

    sb.set_backup_root(next, backup);
    log::trace!(
        "[SUPER] backup roots slot {} <- tree root {:#x} gen {}",
        next,
        backup.tree_root,
        backup.tree_root_gen
    );
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(gen: u64) -> RootBackup {
        RootBackup {
            tree_root: gen * 0x4000,
            tree_root_gen: gen,
            ..Default::default()
        }
    }

    #[test]
    fn test_rotation_advances() {
        let mut sb = Superblock::default();
        let mut slots = alloc::vec::Vec::new();
        for gen in 1..=6 {
            sb.set_generation(gen);
            slots.push(backup_super_roots(&mut sb, &backup(gen)));
        }
        // 空表时最佳槽位为 0，第一次写入槽位 1
        assert_eq!(slots, [1, 2, 3, 0, 1, 2]);
        assert_eq!(sb.backup_root(2).tree_root_gen, 6);
    }

    #[test]
    fn test_same_generation_overwrites() {
        let mut sb = Superblock::default();
        sb.set_generation(3);
        let first = backup_super_roots(&mut sb, &backup(4));
        let second = backup_super_roots(&mut sb, &backup(4));
        assert_eq!(first, second);
    }

    #[test]
    fn test_best_skips_current_generation() {
        let mut sb = Superblock::default();
        sb.set_backup_root(0, &backup(8));
        sb.set_backup_root(1, &backup(9));
        sb.set_backup_root(2, &backup(7));
        sb.set_generation(9);
        assert_eq!(find_best_backup_root(&sb), 0);

        sb.set_generation(10);
        assert_eq!(find_best_backup_root(&sb), 1);
    }

    #[test]
    fn test_slot_zero_filled() {
        let mut sb = Superblock::default();
        sb.set_backup_root(0, &backup(3));
        sb.set_backup_root(
            1,
            &RootBackup {
                csum_root: 77,
                ..backup(1)
            },
        );
        sb.set_generation(4);

        let slot = backup_super_roots(&mut sb, &backup(4));
        assert_eq!(slot, 1);
        assert_eq!(sb.backup_root(1).tree_root_gen, 4);
        assert_eq!(sb.backup_root(1).csum_root, 0);
    }
}
