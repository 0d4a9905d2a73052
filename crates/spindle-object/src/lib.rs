#![forbid(unsafe_code)]
//! Object records and replica placement.
//!
//! `ObjectStore` maps object ids to their size, category, and three
//! replica placements, and keeps the `(disk, unit) -> object` reverse
//! index the request tracker resolves read completions through.
//!
//! Placement walks a three-stage fallback chain: the object's own
//! category ranges, then the ranges of correlated categories, then any
//! free space on the least-loaded disks. Replicas land on three distinct
//! disks or the write fails and rolls back whole.

use serde::Serialize;
use spindle_disk::DiskMap;
use spindle_error::{Result, SimError};
use spindle_types::{BlockList, DiskId, ObjectId, REPLICA_COUNT, Tag, UnitPos};
use std::collections::HashMap;

// ── Records ─────────────────────────────────────────────────────────────────

/// One placed copy of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replica {
    pub disk: DiskId,
    pub blocks: BlockList,
}

/// A live object and its three placements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub size: u32,
    pub tag: Tag,
    pub replicas: [Replica; REPLICA_COUNT],
}

// ── ObjectStore ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, ObjectRecord>,
    /// Per-disk `unit -> object` reverse index.
    reverse: Vec<HashMap<u32, ObjectId>>,
}

impl ObjectStore {
    #[must_use]
    pub fn new(disks: u32) -> Self {
        Self {
            objects: HashMap::new(),
            reverse: vec![HashMap::new(); disks as usize],
        }
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The object owning unit `u` on disk `d`, if any.
    #[must_use]
    pub fn object_of(&self, d: DiskId, u: UnitPos) -> Option<ObjectId> {
        self.reverse[d.index()].get(&u.0).copied()
    }

    /// Distinct ids with at least one unit on disk `d`, ascending.
    #[must_use]
    pub fn objects_on(&self, d: DiskId) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.reverse[d.index()].values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Create an object: place three replicas on three distinct disks and
    /// populate the reverse index.
    ///
    /// `related` is the object's category list sorted by descending read
    /// correlation; it drives the second stage of the fallback chain.
    pub fn create(
        &mut self,
        id: ObjectId,
        size: u32,
        tag: Tag,
        related: &[Tag],
        map: &mut DiskMap,
    ) -> Result<&ObjectRecord> {
        if self.objects.contains_key(&id) {
            return Err(SimError::DuplicateObject(id));
        }

        let mut placed: Vec<Replica> = Vec::with_capacity(REPLICA_COUNT);
        for _ in 0..REPLICA_COUNT {
            let used: Vec<DiskId> = placed.iter().map(|r| r.disk).collect();
            match place_replica(map, size, tag, related, &used) {
                Some(replica) => placed.push(replica),
                None => {
                    // Roll the earlier replicas back before reporting.
                    for r in &placed {
                        map.free(r.disk, &r.blocks);
                    }
                    tracing::debug!(
                        target: "spindle::object",
                        id = id.0,
                        size,
                        tag = tag.0,
                        placed = placed.len(),
                        "replica placement exhausted"
                    );
                    return Err(SimError::PlacementExhausted { size });
                }
            }
        }

        let replicas: [Replica; REPLICA_COUNT] = placed
            .try_into()
            .expect("exactly REPLICA_COUNT replicas placed");
        for r in &replicas {
            for u in r.blocks.units() {
                self.reverse[r.disk.index()].insert(u.0, id);
            }
        }
        let record = ObjectRecord {
            id,
            size,
            tag,
            replicas,
        };
        Ok(self.objects.entry(id).or_insert(record))
    }

    /// Destroy an object: free every replica and purge the reverse index.
    pub fn delete(&mut self, id: ObjectId, map: &mut DiskMap) -> Result<ObjectRecord> {
        let record = self
            .objects
            .remove(&id)
            .ok_or(SimError::UnknownObject(id))?;
        for r in &record.replicas {
            for u in r.blocks.units() {
                self.reverse[r.disk.index()].remove(&u.0);
            }
            map.free(r.disk, &r.blocks);
        }
        Ok(record)
    }
}

// ── Placement ───────────────────────────────────────────────────────────────

/// Place one replica, skipping disks in `used`.
///
/// Stage 1: the object's own category, on disks ordered by descending
/// category free space. Stage 2: correlated categories in descending
/// correlation order. Stage 3: any free space, least-loaded disk first.
fn place_replica(
    map: &mut DiskMap,
    size: u32,
    tag: Tag,
    related: &[Tag],
    used: &[DiskId],
) -> Option<Replica> {
    for try_tag in std::iter::once(tag).chain(related.iter().copied()) {
        let mut candidates: Vec<DiskId> = (1..=map.disk_count())
            .map(DiskId)
            .filter(|d| !used.contains(d) && map.tag_free(*d, try_tag) >= size)
            .collect();
        candidates.sort_by(|a, b| {
            map.tag_free(*b, try_tag)
                .cmp(&map.tag_free(*a, try_tag))
                .then(a.0.cmp(&b.0))
        });
        for d in candidates {
            if let Ok(blocks) = map.allocate_for(d, size, try_tag) {
                return Some(Replica { disk: d, blocks });
            }
        }
    }

    for d in map.least_loaded(map.disk_count() as usize) {
        if used.contains(&d) || map.free_count(d) < size {
            continue;
        }
        if let Ok(blocks) = map.allocate_anywhere(d, size) {
            tracing::debug!(
                target: "spindle::object",
                disk = d.0,
                size,
                tag = tag.0,
                "replica placed outside category ranges"
            );
            return Some(Replica { disk: d, blocks });
        }
    }

    None
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_types::{SimConfig, TagRange};

    fn cfg(n: u32, v: u32, m: u32) -> SimConfig {
        SimConfig {
            steps: 10,
            categories: m,
            disks: n,
            units_per_disk: v,
            tokens_per_step: 128,
        }
    }

    fn range(start: u32, end: u32, tag: u32) -> TagRange {
        TagRange {
            start: UnitPos(start),
            end: UnitPos(end),
            tag: Tag(tag),
        }
    }

    /// Four disks, category 1 on units 1..=10, category 2 on 11..=30.
    fn fixture() -> (ObjectStore, DiskMap) {
        let ranges = vec![vec![range(1, 10, 1), range(11, 30, 2)]; 4];
        let map = DiskMap::new(&cfg(4, 30, 2), ranges);
        (ObjectStore::new(4), map)
    }

    #[test]
    fn create_places_three_replicas_on_distinct_disks() {
        let (mut store, mut map) = fixture();
        let record = store
            .create(ObjectId(7), 3, Tag(1), &[Tag(2)], &mut map)
            .unwrap()
            .clone();

        let mut disks: Vec<DiskId> = record.replicas.iter().map(|r| r.disk).collect();
        disks.sort();
        disks.dedup();
        assert_eq!(disks.len(), 3);
        for r in &record.replicas {
            assert_eq!(r.blocks.total_len(), 3);
            for u in r.blocks.units() {
                assert_eq!(store.object_of(r.disk, u), Some(ObjectId(7)));
                assert!(!map.is_free(r.disk, u));
            }
        }
    }

    #[test]
    fn create_prefers_emptier_category_space() {
        let (mut store, mut map) = fixture();
        // Disk 1 loses most of category 1's space, so the first replica
        // should land elsewhere.
        map.allocate_for(DiskId(1), 8, Tag(1)).unwrap();
        let record = store
            .create(ObjectId(1), 4, Tag(1), &[], &mut map)
            .unwrap();
        assert!(record.replicas.iter().all(|r| r.disk != DiskId(1)));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (mut store, mut map) = fixture();
        store
            .create(ObjectId(5), 2, Tag(1), &[], &mut map)
            .unwrap();
        let free_before: Vec<u32> = (1..=4).map(|d| map.free_count(DiskId(d))).collect();
        assert!(matches!(
            store.create(ObjectId(5), 2, Tag(1), &[], &mut map),
            Err(SimError::DuplicateObject(ObjectId(5)))
        ));
        let free_after: Vec<u32> = (1..=4).map(|d| map.free_count(DiskId(d))).collect();
        assert_eq!(free_before, free_after);
    }

    #[test]
    fn falls_back_to_related_category() {
        let (mut store, mut map) = fixture();
        // Exhaust category 1 everywhere.
        for d in 1..=4 {
            map.allocate_for(DiskId(d), 10, Tag(1)).unwrap();
        }
        let record = store
            .create(ObjectId(9), 4, Tag(1), &[Tag(2)], &mut map)
            .unwrap();
        for r in &record.replicas {
            for u in r.blocks.units() {
                assert!(u.0 >= 11, "unit {u} should sit in category 2's ranges");
            }
        }
    }

    #[test]
    fn falls_back_to_anywhere_when_no_category_has_space() {
        // Category 1 owns everything; category 2 has no ranges at all, so
        // a category-2 write can only succeed through the untyped path.
        let ranges = vec![vec![range(1, 28, 1)]; 4];
        let mut map = DiskMap::new(&cfg(4, 30, 2), ranges);
        let mut store = ObjectStore::new(4);
        let record = store
            .create(ObjectId(3), 2, Tag(2), &[], &mut map)
            .unwrap();
        assert_eq!(record.replicas.len(), 3);
        for r in &record.replicas {
            assert_eq!(r.blocks.total_len(), 2);
        }
    }

    #[test]
    fn create_rolls_back_when_third_replica_cannot_fit() {
        // Only three disks, and disk 3 is almost full: the third replica
        // fails and the first two must be released.
        let ranges = vec![vec![range(1, 10, 1)]; 3];
        let mut map = DiskMap::new(&cfg(3, 10, 1), ranges);
        map.allocate_for(DiskId(3), 9, Tag(1)).unwrap();
        let mut store = ObjectStore::new(3);

        let free_before: Vec<u32> = (1..=3).map(|d| map.free_count(DiskId(d))).collect();
        assert!(matches!(
            store.create(ObjectId(1), 2, Tag(1), &[], &mut map),
            Err(SimError::PlacementExhausted { size: 2 })
        ));
        let free_after: Vec<u32> = (1..=3).map(|d| map.free_count(DiskId(d))).collect();
        assert_eq!(free_before, free_after);
        assert!(!store.contains(ObjectId(1)));
    }

    #[test]
    fn delete_frees_units_and_purges_reverse_index() {
        let (mut store, mut map) = fixture();
        let record = store
            .create(ObjectId(2), 5, Tag(2), &[], &mut map)
            .unwrap()
            .clone();
        let free_before: Vec<u32> = (1..=4).map(|d| map.free_count(DiskId(d))).collect();

        store.delete(ObjectId(2), &mut map).unwrap();
        for r in &record.replicas {
            for u in r.blocks.units() {
                assert!(map.is_free(r.disk, u));
                assert_eq!(store.object_of(r.disk, u), None);
            }
            assert_eq!(map.free_count(r.disk), free_before[r.disk.index()] + 5);
        }
        assert!(matches!(
            store.delete(ObjectId(2), &mut map),
            Err(SimError::UnknownObject(ObjectId(2)))
        ));
    }

    #[test]
    fn objects_on_lists_distinct_ids() {
        let (mut store, mut map) = fixture();
        store
            .create(ObjectId(1), 2, Tag(1), &[], &mut map)
            .unwrap();
        store
            .create(ObjectId(2), 2, Tag(1), &[], &mut map)
            .unwrap();
        // Both objects replicate across the four disks, so at least one
        // disk hosts both.
        let hosts: Vec<usize> = (1..=4)
            .map(|d| store.objects_on(DiskId(d)).len())
            .collect();
        assert!(hosts.iter().any(|&c| c == 2));
        assert_eq!(hosts.iter().sum::<usize>(), 6);
    }
}
