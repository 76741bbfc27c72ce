//! Cluster allocator
//!
//! Allocation is next-fit: each scan resumes just after the last cluster
//! handed out and wraps once around the table. A free-cluster hint lets
//! requests that cannot possibly succeed fail without scanning.

use super::fat_entry::FatEntry;
use super::table::{collect_bhs, AllocState, FatCursor, FatTable};
use crate::constants::fatx::{FATX_READA_SIZE, FATX_START_ENT};
use crate::filesys::{sync_buffers, BufferRef, FatxError};
use alloc::vec::Vec;
use log::{error, warn};

impl FatTable {
    /// Allocates `count` clusters linked into one chain ending in EOF
    ///
    /// Returns the clusters in chain order. If the scan fails after taking
    /// some clusters, the partial chain is freed again.
    pub fn allocate(&self, count: usize) -> Result<Vec<u32>, FatxError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut clusters = Vec::with_capacity(count);
        let result = {
            let mut state = self.lock();
            match state.known_free() {
                Some(free) if (free as usize) < count => return Err(FatxError::InsufficientSpace),
                _ => {}
            }

            let mut bhs = Vec::new();
            self.scan_free(&mut state, count, &mut clusters, &mut bhs)
                .and_then(|()| {
                    if self.sync {
                        sync_buffers(&*self.store, &bhs)?;
                    }
                    self.mirror_bhs(&bhs)
                })
        };

        if let Err(err) = result {
            if let Some(&first) = clusters.first() {
                if let Err(rollback) = self.free(first) {
                    error!("FATX-fs error: failed to release partial chain at {}: {}", first, rollback);
                }
            }
            return Err(err);
        }
        Ok(clusters)
    }

    /// Walks the table from the next-fit cursor, claiming free entries
    fn scan_free(
        &self,
        state: &mut AllocState,
        count: usize,
        clusters: &mut Vec<u32>,
        bhs: &mut Vec<BufferRef>,
    ) -> Result<(), FatxError> {
        let max_cluster = self.geometry.max_cluster;
        let mut cursor = FatCursor::new();
        let mut prev: Option<FatCursor> = None;
        let mut scanned = FATX_START_ENT;

        self.seek(&mut cursor, state.prev_free + 1);
        while scanned < max_cluster {
            if cursor.entry() >= max_cluster {
                self.seek(&mut cursor, FATX_START_ENT);
            }
            self.read_block(&mut cursor)?;

            loop {
                if self.ent_get(&cursor).is_free() {
                    let entry = cursor.entry();

                    self.ent_put(&cursor, FatEntry::Eof);
                    if let Some(prev) = &prev {
                        self.ent_put(prev, FatEntry::Used(entry));
                    }
                    collect_bhs(bhs, &cursor);

                    state.prev_free = entry;
                    if let Some(free) = state.free_clusters.as_mut() {
                        *free = free.saturating_sub(1);
                    }

                    clusters.push(entry);
                    if clusters.len() == count {
                        return Ok(());
                    }
                    prev = Some(cursor.clone());
                }

                scanned += 1;
                if scanned == max_cluster || !self.advance(&mut cursor) {
                    break;
                }
            }
        }

        // Every entry was visited; the table is full
        state.free_clusters = Some(0);
        state.free_valid = true;
        Err(FatxError::InsufficientSpace)
    }

    /// Frees the chain starting at `start`
    ///
    /// Contiguous runs of freed clusters are discarded as one request when
    /// the mount enables discard.
    pub fn free(&self, start: u32) -> Result<(), FatxError> {
        let mut state = self.lock();
        let mut cursor = FatCursor::new();
        let mut bhs = Vec::new();
        let mut first_cl = start;
        let mut cluster = start;

        loop {
            let next = self.read_entry(&mut cursor, cluster)?;
            if next.is_free() {
                if self.ratelimit().allow() {
                    error!("FATX-fs error: deleting FATX entry beyond EOF");
                }
                return Err(FatxError::BrokenChain);
            }

            if self.discard {
                let entry = cursor.entry();
                // Issue one request per contiguous run
                if next != FatEntry::Used(entry + 1) {
                    self.discard_run(first_cl, entry);
                    if let FatEntry::Used(next) = next {
                        first_cl = next;
                    }
                }
            }

            self.ent_put(&cursor, FatEntry::Free);
            if let Some(free) = state.free_clusters.as_mut() {
                *free += 1;
            }
            collect_bhs(&mut bhs, &cursor);

            match next {
                FatEntry::Used(n) => cluster = n,
                _ => break,
            }
        }

        if self.sync {
            sync_buffers(&*self.store, &bhs)?;
        }
        self.mirror_bhs(&bhs)
    }

    fn discard_run(&self, first: u32, last: u32) {
        let nr_clus = (last - first + 1) as u64;
        let start = self.geometry.clus_to_blknr(first);
        let count = nr_clus * self.geometry.sec_per_clus as u64;
        if let Err(err) = self.store.issue_discard(start, count) {
            warn!("FATX-fs: discard of clusters {}..={} failed: {}", first, last, err);
        }
    }

    /// Counts free clusters, or returns the hint when it is valid
    pub fn count_free(&self) -> Result<u32, FatxError> {
        let mut state = self.lock();
        if let Some(free) = state.known_free() {
            return Ok(free);
        }

        let max_cluster = self.geometry.max_cluster;
        let reada_blocks = (FATX_READA_SIZE / self.geometry.block_size).max(1) as u64;
        let mut cursor = FatCursor::new();
        let mut cur_block = 0u64;
        let mut free = 0;

        self.seek(&mut cursor, FATX_START_ENT);
        while cursor.entry() < max_cluster {
            if cur_block % reada_blocks == 0 {
                let rest = self.geometry.fat_length.saturating_sub(cur_block);
                self.reada(&cursor, reada_blocks.min(rest));
            }
            cur_block += 1;

            self.read_block(&mut cursor)?;
            loop {
                if self.ent_get(&cursor).is_free() {
                    free += 1;
                }
                if !self.advance(&mut cursor) {
                    break;
                }
            }
        }

        state.free_clusters = Some(free);
        state.free_valid = true;
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::fatx::fat_entry::FatWidth;
    use crate::filesys::fatx::geometry::MountOptions;
    use crate::filesys::fatx::table::tests::table_with;
    use crate::filesys::BlockStore;
    use alloc::sync::Arc;
    use alloc::vec;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::thread;

    fn chain(table: &FatTable, start: u32) -> Vec<u32> {
        let mut out = vec![start];
        let mut cur = start;
        while let FatEntry::Used(next) = table.get(cur).unwrap() {
            out.push(next);
            cur = next;
        }
        out
    }

    #[test]
    fn test_allocate_from_empty_table() {
        let (_, table) = table_with(FatWidth::Fat16, 10, 2, MountOptions::default());
        assert_eq!(table.prev_free(), 1);
        assert_eq!(table.count_free(), Ok(8));

        let clusters = table.allocate(2).unwrap();
        assert_eq!(clusters, vec![2, 3]);
        assert_eq!(table.get(2), Ok(FatEntry::Used(3)));
        assert_eq!(table.get(3), Ok(FatEntry::Eof));
        assert_eq!(table.prev_free(), 3);
        assert_eq!(table.free_clusters(), Some(6));
    }

    #[test]
    fn test_allocate_resumes_after_cursor() {
        let (_, table) = table_with(FatWidth::Fat16, 100, 1, MountOptions::default());
        table.allocate(3).unwrap();
        table.free(2).unwrap();

        // next-fit: the freed clusters are behind the cursor
        assert_eq!(table.allocate(2).unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_allocate_skips_used_and_wraps() {
        let (_, table) = table_with(FatWidth::Fat12, 20, 1, MountOptions::default());
        for entry in [2, 4, 17, 18] {
            table.set(entry, FatEntry::Eof, false).unwrap();
        }
        table.set_alloc_hint(16, None);

        let clusters = table.allocate(4).unwrap();
        assert_eq!(clusters, vec![19, 3, 5, 6]);
        assert_eq!(chain(&table, 19), clusters);
        assert_eq!(table.prev_free(), 6);
    }

    #[test]
    fn test_allocate_rejects_from_hint() {
        let (cache, table) = table_with(FatWidth::Fat16, 10, 1, MountOptions::default());
        assert_eq!(table.count_free(), Ok(8));
        table.set_alloc_hint(1, Some(1));

        let reads_before = cache.readahead_hints();
        assert_eq!(table.allocate(2), Err(FatxError::InsufficientSpace));
        assert_eq!(cache.readahead_hints(), reads_before);
        assert_eq!(table.get(2), Ok(FatEntry::Free));
    }

    #[test]
    fn test_exhaustion_rolls_back() {
        let (_, table) = table_with(FatWidth::Fat16, 10, 1, MountOptions::default());
        let taken = table.allocate(5).unwrap();
        assert_eq!(taken, vec![2, 3, 4, 5, 6]);

        // three clusters left, hint unknown
        table.set_alloc_hint(6, None);
        assert_eq!(table.allocate(4), Err(FatxError::InsufficientSpace));
        for entry in 7..10 {
            assert_eq!(table.get(entry), Ok(FatEntry::Free));
        }
        assert_eq!(chain(&table, 2), taken);
        assert_eq!(table.count_free(), Ok(3));
    }

    #[test]
    fn test_free_updates_hint() {
        let (_, table) = table_with(FatWidth::Fat32, 64, 2, MountOptions::default());
        assert_eq!(table.count_free(), Ok(62));

        let clusters = table.allocate(5).unwrap();
        assert_eq!(table.free_clusters(), Some(57));

        table.free(clusters[0]).unwrap();
        assert_eq!(table.free_clusters(), Some(62));
        for cluster in clusters {
            assert_eq!(table.get(cluster), Ok(FatEntry::Free));
        }
    }

    #[test]
    fn test_free_of_broken_chain() {
        let (_, table) = table_with(FatWidth::Fat16, 64, 1, MountOptions::default());
        table.set(10, FatEntry::Used(11), false).unwrap();
        assert_eq!(table.free(10), Err(FatxError::BrokenChain));
        assert_eq!(table.free(1), Err(FatxError::InvalidEntry(1)));
    }

    #[test]
    fn test_free_batches_discards() {
        let options = MountOptions {
            discard: true,
            ..MountOptions::default()
        };
        let (cache, table) = table_with(FatWidth::Fat16, 64, 1, options);
        // 10 -> 11 -> 12 -> 20 -> 21
        table.set(10, FatEntry::Used(11), false).unwrap();
        table.set(11, FatEntry::Used(12), false).unwrap();
        table.set(12, FatEntry::Used(20), false).unwrap();
        table.set(20, FatEntry::Used(21), false).unwrap();
        table.set(21, FatEntry::Eof, false).unwrap();

        table.free(10).unwrap();

        let g = table.geometry;
        let discarded = cache.with_device(|d| d.discarded().to_vec());
        assert_eq!(
            discarded,
            vec![(g.clus_to_blknr(10), 3), (g.clus_to_blknr(20), 2)]
        );
    }

    #[test]
    fn test_free_reaches_mirrors() {
        let (cache, table) = table_with(FatWidth::Fat16, 64, 2, MountOptions::default());
        let clusters = table.allocate(3).unwrap();
        table.free(clusters[0]).unwrap();

        let (offset, blocknr) = table.geometry.ent_blocknr(clusters[0]);
        let mirror = cache.bread(blocknr + table.geometry.fat_length).unwrap();
        assert_eq!(mirror.data()[offset..offset + 6], [0u8; 6]);
    }

    #[test]
    fn test_count_free_uses_readahead() {
        let (cache, table) = table_with(FatWidth::Fat16, 1000, 1, MountOptions::default());
        table.allocate(10).unwrap();
        assert_eq!(table.count_free(), Ok(988));
        assert!(cache.readahead_hints() > 0);

        // second call answers from the hint
        let hints = cache.readahead_hints();
        assert_eq!(table.count_free(), Ok(988));
        assert_eq!(cache.readahead_hints(), hints);
    }

    #[test]
    fn test_count_free_fat12_across_blocks() {
        let (_, table) = table_with(FatWidth::Fat12, 1000, 1, MountOptions::default());
        let mut rng = SmallRng::seed_from_u64(7);
        let mut used = 0;
        for entry in FATX_START_ENT..1000 {
            if rng.gen_bool(0.3) {
                table.set(entry, FatEntry::Eof, false).unwrap();
                used += 1;
            }
        }
        assert_eq!(table.count_free(), Ok(998 - used));
    }

    #[test]
    fn test_sync_mount_writes_through() {
        let options = MountOptions {
            sync: true,
            ..MountOptions::default()
        };
        let (cache, table) = table_with(FatWidth::Fat16, 64, 2, options);
        table.allocate(2).unwrap();

        let (offset, blocknr) = table.geometry.ent_blocknr(2);
        let mirror = blocknr + table.geometry.fat_length;
        let (primary, backup) =
            cache.with_device(|d| (d.block(blocknr)[offset], d.block(mirror)[offset]));
        assert_eq!((primary, backup), (3, 3));
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let (_, table) = table_with(FatWidth::Fat16, 2000, 2, MountOptions::default());
        let table = Arc::new(table);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for _ in 0..20 {
                        mine.extend(table.allocate(3).unwrap());
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 240);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 240);
        assert_eq!(table.count_free(), Ok(1998 - 240));
    }
}
