use std::collections::BTreeMap;

use tracing::debug;

use crate::{Address, DApp};

/// Time-ordered index of managed DApps plus their machine locations.
///
/// `dapps` is kept sorted by `shutdown_at` (ties keep insertion order). The
/// cursor caches the partition point relative to the last time passed to
/// [`DAppStore::advance`]: entries before it are due, entries from it onward
/// are still in the future. `None` means the store is empty.
#[derive(Debug, Clone, Default)]
pub struct DAppStore {
    block: u64,
    machines: BTreeMap<Address, String>,
    dapps: Vec<DApp>,
    cursor: Option<usize>,
}

impl DAppStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted parts, recomputing the cursor against `now`.
    ///
    /// Entries are re-sorted (stable) so a hand-edited or foreign snapshot
    /// cannot break the ordering invariant.
    pub fn from_parts(
        block: u64,
        machines: BTreeMap<Address, String>,
        mut dapps: Vec<DApp>,
        now: u128,
    ) -> Self {
        dapps.sort_by_key(|d| d.shutdown_at);
        let cursor = if dapps.is_empty() {
            None
        } else {
            Some(dapps.partition_point(|d| d.shutdown_at <= now))
        };
        Self {
            block,
            machines,
            dapps,
            cursor,
        }
    }

    /// Highest block whose events have been folded in.
    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn dapps(&self) -> &[DApp] {
        &self.dapps
    }

    pub fn machines(&self) -> &BTreeMap<Address, String> {
        &self.machines
    }

    pub fn location(&self, address: &Address) -> Option<&str> {
        self.machines.get(address).map(String::as_str)
    }

    pub fn get(&self, address: &Address) -> Option<&DApp> {
        self.dapps.iter().find(|d| &d.address == address)
    }

    pub fn len(&self) -> usize {
        self.dapps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dapps.is_empty()
    }

    /// Entries whose deadline is still ahead of `now`.
    pub fn live(&self, now: u128) -> impl Iterator<Item = &DApp> {
        let start = self.dapps.partition_point(|d| d.shutdown_at <= now);
        self.dapps[start..].iter()
    }

    /// Record (or overwrite) the machine location announced for `address`.
    pub fn upsert_location(&mut self, block: u64, address: Address, location: String) {
        self.block = self.block.max(block);
        self.machines.insert(address, location);
    }

    /// Insert or replace the entry for `dapp.address`, keeping the order.
    ///
    /// Returns the DApp when its deadline is still ahead of `now`, meaning the
    /// caller should start its node. A DApp that is already expired on arrival
    /// lands behind the cursor and is never reported by [`Self::advance`].
    pub fn upsert_workload(&mut self, block: u64, now: u128, dapp: DApp) -> Option<DApp> {
        self.block = self.block.max(block);
        let mut cursor = self.cursor.unwrap_or(0);

        if let Some(existing) = self.dapps.iter().position(|d| d.address == dapp.address) {
            let removed = self.dapps.remove(existing);
            if existing < cursor {
                cursor -= 1;
            }
            debug!(
                address = %removed.address,
                from = %removed.shutdown_at,
                to = %dapp.shutdown_at,
                "replacing deadline"
            );
        }

        let index = self.dapps.partition_point(|d| d.shutdown_at <= dapp.shutdown_at);
        if index < cursor || (index == cursor && dapp.shutdown_at <= now) {
            cursor += 1;
        }

        let start = dapp.is_live(now).then(|| dapp.clone());
        self.dapps.insert(index, dapp);
        self.cursor = Some(cursor);
        start
    }

    /// Move the cursor past every entry due at `now` and return those entries.
    ///
    /// Entries are returned once: a later call with the same or a later `now`
    /// only reports entries that crossed the boundary in between.
    pub fn advance(&mut self, now: u128) -> Vec<DApp> {
        if self.dapps.is_empty() {
            self.cursor = None;
            return Vec::new();
        }

        let mut cursor = self.cursor.unwrap_or(0);
        let mut due = Vec::new();
        while let Some(dapp) = self.dapps.get(cursor) {
            if dapp.shutdown_at > now {
                break;
            }
            due.push(dapp.clone());
            cursor += 1;
        }
        self.cursor = Some(cursor);
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u128 = 1_700_000_000_000;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes)
    }

    fn at(n: u8, offset: i64) -> DApp {
        DApp::new(addr(n), (NOW as i128 + offset as i128) as u128)
    }

    fn assert_sorted(store: &DAppStore) {
        assert!(
            store
                .dapps()
                .windows(2)
                .all(|w| w[0].shutdown_at <= w[1].shutdown_at),
            "dapps out of order: {:?}",
            store.dapps()
        );
    }

    fn assert_partition(store: &DAppStore, now: u128) {
        let cursor = store.cursor().unwrap_or(0);
        for (i, d) in store.dapps().iter().enumerate() {
            if i < cursor {
                assert!(d.shutdown_at <= now, "entry {i} before cursor is in the future");
            } else {
                assert!(d.shutdown_at > now, "entry {i} after cursor is already due");
            }
        }
    }

    #[test]
    fn empty_store_advance_returns_nothing() {
        let mut store = DAppStore::new();
        assert!(store.advance(NOW).is_empty());
        assert_eq!(store.cursor(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn tick_scenario_moves_cursor_step_by_step() {
        let mut store = DAppStore::new();

        assert!(store.upsert_workload(1, NOW, at(1, 1000)).is_some());
        assert_eq!(store.cursor(), Some(0));
        assert!(store.upsert_workload(2, NOW, at(2, 2000)).is_some());
        assert_eq!(store.cursor(), Some(0));
        assert!(store.upsert_workload(3, NOW, at(3, 4000)).is_some());
        assert_eq!(store.cursor(), Some(0));

        assert!(store.upsert_workload(4, NOW, at(4, -1000)).is_none());
        assert_eq!(store.cursor(), Some(1));
        assert!(store.upsert_workload(5, NOW, at(5, -4000)).is_none());
        assert_eq!(store.cursor(), Some(2));
        assert_eq!(store.block(), 5);

        let due = store.advance(NOW + 1000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].address, addr(1));
        assert_eq!(store.cursor(), Some(3));

        assert_eq!(store.advance(NOW + 2000).len(), 1);
        assert_eq!(store.cursor(), Some(4));

        assert!(store.advance(NOW + 3000).is_empty());
        assert_eq!(store.cursor(), Some(4));

        let due = store.advance(NOW + 4000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].address, addr(3));
        assert_eq!(store.cursor(), Some(5));
        assert_sorted(&store);
    }

    #[test]
    fn advance_twice_does_not_redeliver() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, 10));
        store.upsert_workload(1, NOW, at(2, 20));
        assert_eq!(store.advance(NOW + 20).len(), 2);
        assert!(store.advance(NOW + 20).is_empty());
        assert!(store.advance(NOW + 1_000).is_empty());
    }

    #[test]
    fn expired_on_arrival_is_never_reported() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, 500));
        store.advance(NOW);

        assert!(store.upsert_workload(2, NOW, at(2, 0)).is_none());
        assert!(store.upsert_workload(2, NOW, at(3, -10)).is_none());
        assert!(store.advance(NOW).is_empty());
        assert_partition(&store, NOW);
    }

    #[test]
    fn future_entry_inserted_at_cursor_is_still_reported() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, -100));
        store.upsert_workload(1, NOW, at(2, 1000));
        assert_eq!(store.cursor(), Some(1));

        // lands exactly at the cursor but is not due yet
        assert!(store.upsert_workload(2, NOW, at(3, 500)).is_some());
        assert_eq!(store.cursor(), Some(1));

        let due = store.advance(NOW + 500);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].address, addr(3));
    }

    #[test]
    fn replacing_an_entry_keeps_one_per_address() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, 1000));
        store.upsert_workload(2, NOW, at(2, 2000));
        store.upsert_workload(3, NOW, at(1, 3000));

        assert_eq!(store.len(), 2);
        assert_eq!(store.dapps()[0].address, addr(2));
        assert_eq!(store.dapps()[1].address, addr(1));
        assert_eq!(store.get(&addr(1)).map(|d| d.shutdown_at), Some(NOW + 3000));
    }

    #[test]
    fn replacing_a_past_entry_fixes_the_cursor() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, -2000));
        store.upsert_workload(1, NOW, at(2, -1000));
        store.upsert_workload(1, NOW, at(3, 1000));
        assert_eq!(store.cursor(), Some(2));

        // a top-up moves a due entry back into the future
        assert!(store.upsert_workload(2, NOW, at(1, 5000)).is_some());
        assert_eq!(store.cursor(), Some(1));
        assert_partition(&store, NOW);

        // and an extension that is still in the past stays behind the cursor
        assert!(store.upsert_workload(3, NOW, at(2, -500)).is_none());
        assert_eq!(store.cursor(), Some(1));
        assert_partition(&store, NOW);
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, 100));
        store.upsert_workload(1, NOW, at(2, 100));
        store.upsert_workload(1, NOW, at(3, 100));
        let order: Vec<_> = store.dapps().iter().map(|d| d.address).collect();
        assert_eq!(order, vec![addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn block_never_moves_backwards() {
        let mut store = DAppStore::new();
        store.upsert_location(10, addr(1), "QmA".into());
        store.upsert_location(4, addr(2), "QmB".into());
        store.upsert_workload(7, NOW, at(1, 100));
        assert_eq!(store.block(), 10);
        assert_eq!(store.location(&addr(2)), Some("QmB"));
    }

    #[test]
    fn location_overwrite_has_no_ordering_effect() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, 100));
        store.upsert_location(2, addr(1), "QmA".into());
        store.upsert_location(3, addr(1), "QmB".into());
        assert_eq!(store.location(&addr(1)), Some("QmB"));
        assert_eq!(store.cursor(), Some(0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn invariants_hold_over_mixed_operations() {
        // small deterministic LCG so the sequence is reproducible
        let mut seed: u64 = 0x5eed;
        let mut next = move |m: u64| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) % m
        };

        let mut store = DAppStore::new();
        let mut now = NOW;
        let mut reported = std::collections::HashSet::new();
        for step in 0..2_000u64 {
            match next(4) {
                0 => {
                    now += next(300) as u128;
                    for d in store.advance(now) {
                        reported.insert((d.address, d.shutdown_at));
                    }
                    assert_partition(&store, now);
                }
                _ => {
                    let offset = next(4_000) as i64 - 1_000;
                    let dapp = DApp::new(
                        addr(next(32) as u8),
                        (now as i128 + offset as i128) as u128,
                    );
                    let live = dapp.is_live(now);
                    assert_eq!(store.upsert_workload(step, now, dapp).is_some(), live);
                }
            }
            assert_sorted(&store);
            assert!(store.len() <= 32);
        }

        let before = reported.len();
        for d in store.advance(now) {
            assert!(reported.insert((d.address, d.shutdown_at)), "entry reported twice");
        }
        assert!(reported.len() >= before);
    }

    #[test]
    fn live_lists_future_entries() {
        let mut store = DAppStore::new();
        store.upsert_workload(1, NOW, at(1, -100));
        store.upsert_workload(1, NOW, at(2, 100));
        store.upsert_workload(1, NOW, at(3, 200));
        let live: Vec<_> = store.live(NOW).map(|d| d.address).collect();
        assert_eq!(live, vec![addr(2), addr(3)]);
    }

    #[test]
    fn from_parts_recomputes_cursor() {
        let dapps = vec![at(1, 1000), at(2, 500)];
        let store = DAppStore::from_parts(3, BTreeMap::new(), dapps.clone(), NOW);
        assert_eq!(store.dapps()[0].address, addr(2));
        assert_eq!(store.cursor(), Some(0));

        let store = DAppStore::from_parts(3, BTreeMap::new(), dapps.clone(), NOW + 700);
        assert_eq!(store.cursor(), Some(1));

        let store = DAppStore::from_parts(3, BTreeMap::new(), dapps, NOW + 2000);
        assert_eq!(store.cursor(), Some(2));

        let store = DAppStore::from_parts(3, BTreeMap::new(), vec![], NOW);
        assert_eq!(store.cursor(), None);
    }
}
