//! Per-inode cache of contiguous cluster runs
//!
//! Each inode remembers up to `FATX_MAX_CACHE` runs mapping a file-relative
//! cluster index to an on-disk cluster, so repeated lookups into a long
//! chain do not restart from the first cluster. Invalidation bumps an epoch;
//! a walk that began before the bump cannot publish its result afterwards.

use super::fat_entry::FatEntry;
use super::inode::FatxInode;
use super::table::FatCursor;
use super::Fatx;
use crate::constants::fatx::{FATX_CACHE_VALID, FATX_MAX_CACHE, FATX_START_ENT};
use crate::filesys::FatxError;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use spin::Mutex;

/// `nr_contig + 1` clusters starting at (`fcluster`, `dcluster`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRun {
    pub fcluster: u32,
    pub dcluster: u32,
    pub nr_contig: u32,
}

/// A run being built by a chain walk, stamped with the epoch it was read in
#[derive(Debug, Clone, Copy)]
pub struct CacheId {
    pub id: u32,
    pub run: ChainRun,
}

impl CacheId {
    fn new(id: u32, fcluster: u32, dcluster: u32) -> Self {
        Self {
            id,
            run: ChainRun {
                fcluster,
                dcluster,
                nr_contig: 0,
            },
        }
    }

    /// Extends the run by one cluster; false if `dcluster` breaks it
    fn contiguous(&mut self, dcluster: u32) -> bool {
        self.run.nr_contig += 1;
        self.run.dcluster as u64 + self.run.nr_contig as u64 == dcluster as u64
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, Copy)]
pub enum Lookup {
    /// Nearest run at or below the target; `offset` is how far into it to go
    Hit { cid: CacheId, offset: u32 },
    /// Nothing usable; `id` is the epoch a new walk should carry
    Miss { id: u32 },
}

struct CacheState {
    /// Most recently used first
    lru: ArrayVec<ChainRun, FATX_MAX_CACHE>,
    valid_id: u32,
}

pub struct ChainCache {
    state: Mutex<CacheState>,
}

impl Default for ChainCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainCache {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                lru: ArrayVec::new_const(),
                valid_id: FATX_CACHE_VALID + 1,
            }),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.state.lock().valid_id
    }

    /// Finds the run with the largest start not above `fclus`
    pub fn lookup(&self, fclus: u32) -> Lookup {
        let mut state = self.state.lock();

        let best = state
            .lru
            .iter()
            .enumerate()
            .filter(|(_, run)| run.fcluster <= fclus)
            .max_by_key(|(_, run)| run.fcluster)
            .map(|(idx, _)| idx);

        match best {
            Some(idx) => {
                let run = state.lru.remove(idx);
                state.lru.insert(0, run);

                let offset = if run.fcluster + run.nr_contig < fclus {
                    run.nr_contig
                } else {
                    fclus - run.fcluster
                };
                Lookup::Hit {
                    cid: CacheId {
                        id: state.valid_id,
                        run,
                    },
                    offset,
                }
            }
            None => Lookup::Miss { id: state.valid_id },
        }
    }

    /// Records a run found by a walk, unless the cache was invalidated since
    pub fn add(&self, cid: &CacheId) {
        let mut state = self.state.lock();
        if cid.id != FATX_CACHE_VALID && cid.id != state.valid_id {
            return;
        }

        let new = cid.run;
        if let Some(idx) = state.lru.iter().position(|run| run.fcluster == new.fcluster) {
            // Same start means same disk cluster; keep the longer run
            let mut run = state.lru.remove(idx);
            debug_assert_eq!(run.dcluster, new.dcluster);
            run.nr_contig = run.nr_contig.max(new.nr_contig);
            state.lru.insert(0, run);
            return;
        }

        if state.lru.is_full() {
            state.lru.pop();
        }
        state.lru.insert(0, new);
    }

    /// Drops every run and starts a new epoch
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.valid_id = state.valid_id.wrapping_add(1);
        if state.valid_id == FATX_CACHE_VALID {
            state.valid_id += 1;
        }
    }

    /// Cached runs, most recently used first
    pub fn runs(&self) -> Vec<ChainRun> {
        self.state.lock().lru.to_vec()
    }
}

/// Where a chain walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPos {
    /// The requested index exists
    Mapped { fcluster: u32, dcluster: u32 },
    /// The chain ended first; this is its last cluster
    EndOfChain { fcluster: u32, dcluster: u32 },
}

impl Fatx {
    /// Maps file-relative cluster `cluster` of `inode` to a disk cluster
    pub fn get_cluster(&self, inode: &FatxInode, cluster: u32) -> Result<ChainPos, FatxError> {
        let start = inode.start();
        if start == 0 {
            return Err(FatxError::BeyondEof);
        }
        let limit = self.geometry.max_cluster;
        if start < FATX_START_ENT || start >= limit {
            return Err(self.fs_error_ratelimit(FatxError::InvalidEntry(start), inode));
        }
        if cluster == 0 {
            return Ok(ChainPos::Mapped {
                fcluster: 0,
                dcluster: start,
            });
        }

        let (mut fclus, mut dclus, mut cid) = match inode.cache().lookup(cluster) {
            Lookup::Hit { cid, offset } => (
                cid.run.fcluster + offset,
                cid.run.dcluster + offset,
                cid,
            ),
            Lookup::Miss { id } => (0, start, CacheId::new(id, 0, start)),
        };

        let mut cursor = FatCursor::new();
        while fclus < cluster {
            // prevent the infinite loop of cluster chain
            if fclus > limit {
                return Err(self.fs_error_ratelimit(FatxError::ChainLoop, inode));
            }

            match self.fat.read_entry(&mut cursor, dclus)? {
                FatEntry::Free => {
                    return Err(self.fs_error_ratelimit(FatxError::BrokenChain, inode));
                }
                FatEntry::Eof | FatEntry::Bad => {
                    inode.cache().add(&cid);
                    return Ok(ChainPos::EndOfChain {
                        fcluster: fclus,
                        dcluster: dclus,
                    });
                }
                FatEntry::Used(next) if next < FATX_START_ENT || next >= limit => {
                    return Err(self.fs_error_ratelimit(FatxError::InvalidEntry(next), inode));
                }
                FatEntry::Used(next) => {
                    fclus += 1;
                    dclus = next;
                    if !cid.contiguous(dclus) {
                        cid = CacheId::new(cid.id, fclus, dclus);
                    }
                }
            }
        }

        inode.cache().add(&cid);
        Ok(ChainPos::Mapped {
            fcluster: fclus,
            dcluster: dclus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fcluster: u32, dcluster: u32, nr_contig: u32) -> ChainRun {
        ChainRun {
            fcluster,
            dcluster,
            nr_contig,
        }
    }

    fn add(cache: &ChainCache, r: ChainRun) {
        cache.add(&CacheId {
            id: cache.epoch(),
            run: r,
        });
    }

    #[test]
    fn test_lookup_picks_nearest_run_below() {
        let cache = ChainCache::new();
        add(&cache, run(0, 100, 3));
        add(&cache, run(10, 200, 4));

        match cache.lookup(12) {
            Lookup::Hit { cid, offset } => {
                assert_eq!(cid.run, run(10, 200, 4));
                assert_eq!(offset, 2);
            }
            Lookup::Miss { .. } => panic!("expected hit"),
        }

        // past the end of the run: resume from its last cluster
        match cache.lookup(8) {
            Lookup::Hit { cid, offset } => {
                assert_eq!(cid.run, run(0, 100, 3));
                assert_eq!(offset, 3);
            }
            Lookup::Miss { .. } => panic!("expected hit"),
        }
        assert_eq!(cache.runs()[0], run(0, 100, 3));
    }

    #[test]
    fn test_lookup_miss_on_empty() {
        let cache = ChainCache::new();
        assert!(matches!(cache.lookup(5), Lookup::Miss { id } if id == cache.epoch()));
    }

    #[test]
    fn test_merge_keeps_longer_run() {
        let cache = ChainCache::new();
        add(&cache, run(4, 50, 1));
        add(&cache, run(4, 50, 6));
        add(&cache, run(4, 50, 2));
        assert_eq!(cache.runs(), vec![run(4, 50, 6)]);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let cache = ChainCache::new();
        for i in 0..FATX_MAX_CACHE as u32 {
            add(&cache, run(i * 10, 100 + i * 10, 0));
        }
        // touch the oldest so the second-oldest is evicted instead
        assert!(matches!(cache.lookup(0), Lookup::Hit { .. }));
        add(&cache, run(500, 900, 0));

        let runs = cache.runs();
        assert_eq!(runs.len(), FATX_MAX_CACHE);
        assert_eq!(runs[0], run(500, 900, 0));
        assert!(runs.contains(&run(0, 100, 0)));
        assert!(!runs.iter().any(|r| r.fcluster == 10));
    }

    #[test]
    fn test_stale_epoch_is_dropped() {
        let cache = ChainCache::new();
        let stale = CacheId {
            id: cache.epoch(),
            run: run(0, 10, 5),
        };
        cache.invalidate();
        cache.add(&stale);
        assert!(cache.runs().is_empty());

        // the always-valid id bypasses the epoch check
        cache.add(&CacheId {
            id: FATX_CACHE_VALID,
            run: run(0, 10, 5),
        });
        assert_eq!(cache.runs().len(), 1);
    }

    #[test]
    fn test_invalidate_skips_reserved_id() {
        let cache = ChainCache::new();
        {
            let mut state = cache.state.lock();
            state.valid_id = u32::MAX;
        }
        cache.invalidate();
        assert_eq!(cache.epoch(), FATX_CACHE_VALID + 1);
    }
}
