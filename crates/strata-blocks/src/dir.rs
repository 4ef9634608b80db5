//! Block file creation and the hierarchical on-disk pool.
//!
//! Block files live two directory levels deep: `eXX/dYY/eXXYYZZZ.au`,
//! where `XX` and `YY` are hex bytes and `ZZZ` is drawn at random.
//! Four counters track the fill of every directory so allocation can
//! always find one with room, and directories whose file count drops
//! to zero are removed from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use strata_core::{Error, Result, SampleCount, SampleFormat};

use crate::block::{destruction_count, BlockFile, AU_EXTENSION, SUMMARY_EXTENSION};

const DIR_CAPACITY: u32 = 256;
// New mid-level directories opened under a top level per refill.
const MID_BATCH: usize = 32;

#[derive(Default)]
struct BalanceInfo {
    // A key lives in at most one of pool/full; 256 means full.
    top_pool: BTreeMap<u16, u32>,
    top_full: BTreeMap<u16, u32>,
    mid_pool: BTreeMap<u16, u32>,
    mid_full: BTreeMap<u16, u32>,
}

/// Creates block files and manages the per-project directory tree.
///
/// Holds a weak-reference registry of every block file it has named,
/// so that identical names are never handed out twice and directory
/// fill counters can be maintained as blocks die. The sweep of dead
/// registry entries runs lazily, before any allocation-sensitive
/// operation, driven by the global block destruction counter.
pub struct DirManager {
    data_dir: PathBuf,
    remove_on_drop: bool,
    registry: DashMap<String, Weak<BlockFile>>,
    balance: Mutex<BalanceInfo>,
    last_destruction_count: AtomicU64,
}

impl DirManager {
    /// Manage block files under an existing project directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Arc<DirManager> {
        Arc::new(DirManager::build(data_dir.into(), false))
    }

    /// Manage block files in a fresh directory under the system temp
    /// dir, removed again when the manager drops.
    pub fn temporary() -> Result<Arc<DirManager>> {
        let mut rng = rand::thread_rng();
        let base = std::env::temp_dir();
        let dir = loop {
            let candidate = base.join(format!("strata-project{:08x}", rng.gen::<u32>()));
            if !candidate.exists() {
                break candidate;
            }
        };
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(DirManager::build(dir, true)))
    }

    fn build(data_dir: PathBuf, remove_on_drop: bool) -> DirManager {
        // The top-level pool starts fully populated.
        let mut balance = BalanceInfo::default();
        for top in 0..DIR_CAPACITY as u16 {
            balance.top_pool.insert(top, 0);
        }
        DirManager {
            data_dir,
            remove_on_drop,
            registry: DashMap::new(),
            balance: Mutex::new(balance),
            last_destruction_count: AtomicU64::new(destruction_count()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Allocate a name, write the samples, and register the block.
    pub fn new_simple_block(
        &self,
        samples: &[f32],
        format: SampleFormat,
    ) -> Result<Arc<BlockFile>> {
        let (name, dir) = self.make_name()?;
        let path = dir.join(format!("{name}.{AU_EXTENSION}"));
        let block = BlockFile::new_simple(path, samples, format)?;
        self.registry.insert(name, Arc::downgrade(&block));
        Ok(block)
    }

    /// A silent block; no file, nothing to register.
    pub fn silent_block(&self, len: usize) -> Arc<BlockFile> {
        BlockFile::silent(len)
    }

    /// Allocate a name and build an alias block over an external file.
    pub fn new_alias_block(
        &self,
        alias_path: PathBuf,
        alias_start: SampleCount,
        len: usize,
        alias_channel: u16,
    ) -> Result<Arc<BlockFile>> {
        let (name, dir) = self.make_name()?;
        let summary_path = dir.join(format!("{name}.{SUMMARY_EXTENSION}"));
        let block = BlockFile::new_alias(
            summary_path,
            alias_path,
            alias_start,
            len,
            alias_channel,
        )?;
        self.registry.insert(name, Arc::downgrade(&block));
        Ok(block)
    }

    /// Share `block` by reference, or copy its file under a new name
    /// if the block is locked.
    pub fn copy_block(&self, block: &Arc<BlockFile>) -> Result<Arc<BlockFile>> {
        if !block.is_locked() {
            // Make sure the registry knows this block even when it
            // came from another project. Silent blocks have no name.
            if let Some(name) = block.name() {
                self.registry.insert(name, Arc::downgrade(block));
            }
            return Ok(Arc::clone(block));
        }

        let Some(old_path) = block.path().map(Path::to_owned) else {
            // Locked silent blocks only need an in-memory copy.
            return Ok(BlockFile::silent(block.len()));
        };

        let (name, dir) = self.make_name()?;
        let ext = old_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| AU_EXTENSION.to_owned());
        let new_path = dir.join(format!("{name}.{ext}"));
        std::fs::copy(&old_path, &new_path)
            .map_err(|_| Error::FileWrite { path: new_path.clone() })?;

        let copy = block.copy_to(Some(new_path));
        self.registry.insert(name, Arc::downgrade(&copy));
        Ok(copy)
    }

    /// Whether a base name is present in the registry with a live
    /// block behind it.
    pub fn contains_block(&self, name: &str) -> bool {
        self.registry
            .get(name)
            .map(|weak| weak.upgrade().is_some())
            .unwrap_or(false)
    }

    /// Number of live blocks in the registry (sweeps first).
    pub fn live_blocks(&self) -> usize {
        let mut balance = self.balance.lock();
        self.sweep(&mut balance);
        self.registry
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }

    /// Decide the name of the next block file and ensure its
    /// directory exists. Returns `(base_name, directory)`.
    fn make_name(&self) -> Result<(String, PathBuf)> {
        let mut balance = self.balance.lock();
        self.sweep(&mut balance);

        let mut rng = rand::thread_rng();
        let midkey;
        let name;
        let dir;

        loop {
            if balance.mid_pool.is_empty() {
                if let Some(topnum) = balance.top_pool.keys().next().copied() {
                    // This top level claims room for subdirs; open up
                    // to 32 fresh mid levels under it.
                    let mut added = 0;
                    for midnum in 0..DIR_CAPACITY as u16 {
                        let key = (topnum << 8) | midnum;
                        if balance_mid_add(&mut balance, topnum, key) {
                            added += 1;
                            if added >= MID_BATCH {
                                break;
                            }
                        }
                    }
                    if balance.mid_pool.is_empty() {
                        // The top level claimed space but every mid
                        // level is taken. Contain the fault and move
                        // on rather than looping forever.
                        warn!(topnum, "top-level directory fill desynchronized");
                        balance.top_pool.remove(&topnum);
                        balance.top_full.insert(topnum, DIR_CAPACITY);
                    }
                    continue;
                }
            }

            let (key, candidate) = if balance.mid_pool.is_empty() {
                // Absurdly large project: every pair is full. Keep
                // working with big filenames and randomized placement.
                let filenum: u32 = rng.gen_range(0..0x10_0000);
                let topnum: u16 = rng.gen_range(0..DIR_CAPACITY as u16);
                let midnum: u16 = rng.gen_range(0..DIR_CAPACITY as u16);
                (
                    (topnum << 8) | midnum,
                    format!("e{topnum:02x}{midnum:02x}{filenum:03x}"),
                )
            } else {
                let (&key, _) = balance.mid_pool.iter().next().unwrap();
                let topnum = key >> 8;
                let midnum = key & 0xff;
                let filenum: u32 = rng.gen_range(0..4096);
                (key, format!("e{topnum:02x}{midnum:02x}{filenum:03x}"))
            };

            if !self.contains_block(&candidate) {
                let candidate_dir = self.block_file_dir(&candidate)?;
                if disk_collision(&candidate_dir, &candidate) {
                    // An orphan file from a crash owns this name.
                    // Count it against the directory so a nearly-full
                    // directory of orphans cannot starve allocation.
                    warn!(name = %candidate, "orphan block file on disk");
                    balance_file_add(&mut balance, key);
                } else {
                    midkey = key;
                    name = candidate;
                    dir = candidate_dir;
                    break;
                }
            }
        }

        balance_file_add(&mut balance, midkey);
        Ok((name, dir))
    }

    /// `eTTMMFFF` lives in `<dataDir>/eTT/dMM/`, created on demand.
    fn block_file_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self
            .data_dir
            .join(&name[..3])
            .join(format!("d{}", &name[3..5]));
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir)
                .map_err(|_| Error::FileWrite { path: dir.clone() })?;
        }
        Ok(dir)
    }

    /// Drop dead registry entries, updating directory counters and
    /// removing empty directories. Runs only when blocks have been
    /// destroyed since the last sweep.
    fn sweep(&self, balance: &mut BalanceInfo) {
        let count = destruction_count();
        if self.last_destruction_count.swap(count, Ordering::AcqRel) == count {
            return;
        }
        let mut dead = Vec::new();
        for entry in self.registry.iter() {
            if entry.value().upgrade().is_none() {
                dead.push(entry.key().clone());
            }
        }
        for name in dead {
            self.registry.remove(&name);
            self.balance_del(balance, &name);
        }
    }

    fn balance_del(&self, balance: &mut BalanceInfo, name: &str) {
        let Some((topnum, midnum)) = parse_name(name) else {
            return;
        };
        let midkey = (topnum << 8) | midnum;

        if let Some(fill) = balance.mid_full.get_mut(&midkey) {
            *fill -= 1;
            if *fill < DIR_CAPACITY {
                let fill = balance.mid_full.remove(&midkey).unwrap();
                balance.mid_pool.insert(midkey, fill);
            }
            return;
        }

        let emptied = match balance.mid_pool.get_mut(&midkey) {
            Some(fill) => {
                *fill = fill.saturating_sub(1);
                *fill == 0
            }
            None => return,
        };
        if !emptied {
            return;
        }

        // Adding the key back is cheap, unlike the top pool, so the
        // entry can go away entirely.
        balance.mid_pool.remove(&midkey);
        let mid_dir = self
            .data_dir
            .join(format!("e{topnum:02x}"))
            .join(format!("d{midnum:02x}"));
        if let Err(e) = std::fs::remove_dir(&mid_dir) {
            debug!(dir = %mid_dir.display(), error = %e, "mid dir not removed");
        }

        if let Some(fill) = balance.top_full.get_mut(&topnum) {
            *fill -= 1;
            if *fill < DIR_CAPACITY {
                let fill = balance.top_full.remove(&topnum).unwrap();
                balance.top_pool.insert(topnum, fill);
            }
        } else if let Some(fill) = balance.top_pool.get_mut(&topnum) {
            *fill = fill.saturating_sub(1);
            if *fill == 0 {
                // Keep the top pool entry; only the directory goes.
                let top_dir = self.data_dir.join(format!("e{topnum:02x}"));
                if let Err(e) = std::fs::remove_dir(&top_dir) {
                    debug!(dir = %top_dir.display(), error = %e, "top dir not removed");
                }
            }
        }
    }
}

impl Drop for DirManager {
    fn drop(&mut self) {
        if self.remove_on_drop {
            if let Err(e) = std::fs::remove_dir_all(&self.data_dir) {
                debug!(dir = %self.data_dir.display(), error = %e, "temp dir not removed");
            }
        }
    }
}

/// Enter a mid-level key if it is not already tracked; returns
/// whether a new entry was made.
fn balance_mid_add(balance: &mut BalanceInfo, topnum: u16, midkey: u16) -> bool {
    if balance.mid_pool.contains_key(&midkey) || balance.mid_full.contains_key(&midkey) {
        return false;
    }
    balance.mid_pool.insert(midkey, 0);

    let fill = balance.top_pool.entry(topnum).or_insert(0);
    *fill += 1;
    if *fill >= DIR_CAPACITY {
        balance.top_pool.remove(&topnum);
        balance.top_full.insert(topnum, DIR_CAPACITY);
    }
    true
}

fn balance_file_add(balance: &mut BalanceInfo, midkey: u16) {
    if let Some(fill) = balance.mid_pool.get_mut(&midkey) {
        *fill += 1;
        if *fill >= DIR_CAPACITY {
            balance.mid_pool.remove(&midkey);
            balance.mid_full.insert(midkey, DIR_CAPACITY);
        }
    } else if let Some(fill) = balance.mid_full.get_mut(&midkey) {
        // Past 256/256/256 the counters keep counting anyway.
        *fill += 1;
    } else {
        balance.mid_pool.insert(midkey, 1);
    }
}

/// `eTTMMFFF` → `(TT, MM)`.
fn parse_name(name: &str) -> Option<(u16, u16)> {
    let bytes = name.as_bytes();
    if bytes.len() < 5 || bytes[0] != b'e' {
        return None;
    }
    let top = u16::from_str_radix(&name[1..3], 16).ok()?;
    let mid = u16::from_str_radix(&name[3..5], 16).ok()?;
    Some((top, mid))
}

/// Whether any file on disk shares this base name with any extension.
/// Defends against orphan files left behind by crashes.
fn disk_collision(dir: &Path, name: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let prefix = format!("{name}.");
    entries
        .flatten()
        .any(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_shape_and_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = DirManager::new(tmp.path());
        let block = dm.new_simple_block(&[0.5; 32], SampleFormat::Float).unwrap();

        let path = block.path().unwrap();
        let name = block.name().unwrap();
        assert_eq!(name.len(), 8);
        assert!(name.starts_with('e'));
        // <root>/eTT/dMM/eTTMMFFF.au
        let mid = path.parent().unwrap();
        let top = mid.parent().unwrap();
        assert_eq!(top.parent().unwrap(), tmp.path());
        assert_eq!(&name[..3], top.file_name().unwrap().to_str().unwrap());
        let mid_name = mid.file_name().unwrap().to_str().unwrap();
        assert_eq!(format!("d{}", &name[3..5]), mid_name);
        assert!(dm.contains_block(&name));
    }

    #[test]
    fn test_unique_names() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = DirManager::new(tmp.path());
        let mut names = std::collections::HashSet::new();
        let mut blocks = Vec::new();
        for _ in 0..64 {
            let b = dm.new_simple_block(&[0.1; 16], SampleFormat::Int16).unwrap();
            assert!(names.insert(b.name().unwrap()));
            blocks.push(b);
        }
        assert_eq!(dm.live_blocks(), 64);
    }

    #[test]
    fn test_sweep_removes_dead_entries_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = DirManager::new(tmp.path());
        let block = dm.new_simple_block(&[0.5; 32], SampleFormat::Float).unwrap();
        let name = block.name().unwrap();
        let dir = block.path().unwrap().parent().unwrap().to_owned();
        drop(block);

        // The lazy sweep runs on the next allocation-sensitive call.
        assert_eq!(dm.live_blocks(), 0);
        assert!(!dm.contains_block(&name));
        assert!(!dir.exists());
    }

    #[test]
    fn test_copy_block_unlocked_shares() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = DirManager::new(tmp.path());
        let block = dm.new_simple_block(&[0.5; 32], SampleFormat::Float).unwrap();
        let copy = dm.copy_block(&block).unwrap();
        assert!(Arc::ptr_eq(&block, &copy));
    }

    #[test]
    fn test_copy_block_locked_duplicates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = DirManager::new(tmp.path());
        let block = dm.new_simple_block(&[0.5; 32], SampleFormat::Float).unwrap();
        block.lock();
        let copy = dm.copy_block(&block).unwrap();
        assert!(!Arc::ptr_eq(&block, &copy));
        assert_ne!(block.path(), copy.path());
        assert!(copy.path().unwrap().exists());

        let mut a = vec![0f32; 32];
        let mut b = vec![0f32; 32];
        block.read_data(&mut a, 0, true).unwrap();
        copy.read_data(&mut b, 0, true).unwrap();
        assert_eq!(a, b);
        block.unlock();
    }

    #[test]
    fn test_orphan_on_disk_is_avoided() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = DirManager::new(tmp.path());
        // Seed an orphan under every name the first mid dir can draw:
        // too slow; instead plant one specific orphan and check that
        // allocation still succeeds and never reuses its name.
        let orphan_dir = tmp.path().join("e00").join("d00");
        std::fs::create_dir_all(&orphan_dir).unwrap();
        let orphan = orphan_dir.join("e0000123.au");
        std::fs::write(&orphan, b"junk").unwrap();

        let mut names = Vec::new();
        for _ in 0..32 {
            let b = dm.new_simple_block(&[0.0; 8], SampleFormat::Float).unwrap();
            names.push((b.name().unwrap(), b));
        }
        assert!(names.iter().all(|(n, _)| n != "e0000123"));
        assert!(orphan.exists());
    }

    #[test]
    fn test_temporary_dir_removed_on_drop() {
        let dm = DirManager::temporary().unwrap();
        let dir = dm.data_dir().to_owned();
        assert!(dir.is_dir());
        drop(dm);
        assert!(!dir.exists());
    }
}
