use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use crate::config::CORE_POINTS_PER_CORE;

/// Assignment of logical CPUs to frames, grouped by physical core.
///
/// Pinning hands out whole physical cores only: a frame gets every
/// hyper-thread sibling of each core it is assigned, and a physical core is
/// never split between two frames.
#[derive(Debug)]
pub struct ThreadAllocator {
    inner: Mutex<AllocState>,
}

#[derive(Debug)]
struct AllocState {
    /// Sibling groups, one per physical core, indexed by slot.
    groups: Vec<Vec<u32>>,
    /// Slot index -> free? Kept as a map so tests can inspect ordering.
    free: BTreeMap<usize, ()>,
}

impl ThreadAllocator {
    /// Build from an explicit topology: one inner vec of logical CPU ids
    /// per physical core.
    pub fn with_topology(groups: Vec<Vec<u32>>) -> Self {
        let free = (0..groups.len()).map(|i| (i, ())).collect();
        Self {
            inner: Mutex::new(AllocState { groups, free }),
        }
    }

    /// Discover the sibling groups from sysfs. Returns an empty allocator
    /// (pinning unavailable) when the topology cannot be read.
    pub fn from_sys() -> Self {
        Self::with_topology(read_sys_topology().unwrap_or_default())
    }

    /// Whether pinning is available at all on this host.
    pub fn available(&self) -> bool {
        !self.inner.lock().unwrap().groups.is_empty()
    }

    /// Reserve whole physical cores covering `core_points` hundredths.
    /// Returns the logical CPU ids, or `None` when pinning is unavailable
    /// or fewer than `core_points / 100` physical cores are free.
    pub fn reserve(&self, core_points: u32) -> Option<Vec<u32>> {
        let want = (core_points / CORE_POINTS_PER_CORE) as usize;
        if want == 0 {
            return None;
        }
        let mut state = self.inner.lock().unwrap();
        if state.groups.is_empty() || state.free.len() < want {
            return None;
        }
        let slots: Vec<usize> = state.free.keys().take(want).copied().collect();
        let mut cpus = Vec::new();
        for slot in slots {
            state.free.remove(&slot);
            cpus.extend(&state.groups[slot]);
        }
        cpus.sort_unstable();
        Some(cpus)
    }

    /// Return logical CPUs to the free set. Double-release is a no-op.
    pub fn release(&self, cpus: &[u32]) {
        let mut state = self.inner.lock().unwrap();
        for slot in 0..state.groups.len() {
            if state.groups[slot].iter().any(|c| cpus.contains(c)) {
                state.free.insert(slot, ());
            }
        }
    }

    /// All currently free logical CPU ids, sorted.
    pub fn free_cpus(&self) -> Vec<u32> {
        let state = self.inner.lock().unwrap();
        let mut cpus: Vec<u32> = state
            .free
            .keys()
            .flat_map(|slot| state.groups[*slot].iter().copied())
            .collect();
        cpus.sort_unstable();
        cpus
    }
}

/// Group logical CPUs by (package id, core id) from
/// `/sys/devices/system/cpu/cpuN/topology/`.
fn read_sys_topology() -> Option<Vec<Vec<u32>>> {
    let mut by_core: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
    let entries = fs::read_dir("/sys/devices/system/cpu").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id) = name
            .strip_prefix("cpu")
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let topo = entry.path().join("topology");
        let core_id = read_u32(&topo.join("core_id"))?;
        let pkg_id = read_u32(&topo.join("physical_package_id")).unwrap_or(0);
        by_core.entry((pkg_id, core_id)).or_default().push(id);
    }
    if by_core.is_empty() {
        return None;
    }
    let mut groups: Vec<Vec<u32>> = by_core.into_values().collect();
    for g in &mut groups {
        g.sort_unstable();
    }
    Some(groups)
}

fn read_u32(path: &std::path::Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4 physical cores, 8 logical (HT ratio 2), siblings paired.
    fn ht_allocator() -> ThreadAllocator {
        ThreadAllocator::with_topology(vec![
            vec![0, 4],
            vec![1, 5],
            vec![2, 6],
            vec![3, 7],
        ])
    }

    #[test]
    fn reserves_whole_sibling_groups() {
        let alloc = ht_allocator();
        let cpus = alloc.reserve(200).unwrap();
        assert_eq!(cpus.len(), 4); // two physical cores, two siblings each
        // Both siblings of every chosen core are present.
        for cpu in &cpus {
            let sibling = (cpu + 4) % 8;
            assert!(cpus.contains(&sibling));
        }
    }

    #[test]
    fn sequential_reservations_never_overlap() {
        let alloc = ht_allocator();
        let first = alloc.reserve(200).unwrap();
        let second = alloc.reserve(200).unwrap();
        assert!(first.iter().all(|c| !second.contains(c)));

        alloc.release(&first);
        alloc.release(&second);
        assert_eq!(alloc.free_cpus(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn refuses_when_not_enough_physical_cores() {
        let alloc = ht_allocator();
        assert!(alloc.reserve(500).is_none());
        assert_eq!(alloc.free_cpus().len(), 8);
    }

    #[test]
    fn sub_core_request_is_not_pinned() {
        let alloc = ht_allocator();
        assert!(alloc.reserve(50).is_none());
    }

    #[test]
    fn double_release_is_noop() {
        let alloc = ht_allocator();
        let cpus = alloc.reserve(100).unwrap();
        alloc.release(&cpus);
        alloc.release(&cpus);
        assert_eq!(alloc.free_cpus().len(), 8);
    }

    #[test]
    fn empty_topology_means_no_pinning() {
        let alloc = ThreadAllocator::with_topology(Vec::new());
        assert!(!alloc.available());
        assert!(alloc.reserve(100).is_none());
    }
}
