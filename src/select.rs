//! Top-k selection primitives.
//!
//! Two cooperating mechanisms turn raw distances into ranked lists:
//!
//! * a bitonic sorting network over fixed-width blocks plus [`merge_select`],
//!   which combines two sorted lists and keeps the `cap` smallest;
//! * [`BoundedHeap`], a max-heap of capacity `k` that accumulates results
//!   across many blocks.
//!
//! [`TopKArena`] holds one sorted top-k slot per work item. It is the host
//! mirror of the partial-result buffer written by `plan_knn.wgsl`, and every
//! slot has exactly one writer.

use crate::types::Neighbor;
use std::cmp::Ordering;

#[inline]
fn cmp_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance_sq
        .partial_cmp(&b.distance_sq)
        .unwrap_or(Ordering::Equal)
        .then(a.index.cmp(&b.index))
}

/// Sorts a power-of-two sized block in place with a bitonic network.
///
/// The compare-exchange sequence depends only on the block length, which is
/// what lets the device run it in lockstep.
///
/// # Panics
/// Panics if `block.len()` is not a power of two. [`sort_block`] pads to a
/// power-of-two width first.
pub fn bitonic_sort(block: &mut [Neighbor]) {
    let n = block.len();
    assert!(n.is_power_of_two(), "bitonic block length must be a power of 2");

    let mut size = 2;
    while size <= n {
        let mut stride = size / 2;
        while stride > 0 {
            for i in 0..n {
                let partner = i ^ stride;
                if partner > i {
                    let ascending = i & size == 0;
                    let out_of_order = cmp_neighbors(&block[i], &block[partner]) == Ordering::Greater;
                    if out_of_order == ascending {
                        block.swap(i, partner);
                    }
                }
            }
            stride /= 2;
        }
        size *= 2;
    }
}

/// Copies up to `width` entries into `scratch`, pads with empty slots and
/// sorts the block with [`bitonic_sort`].
pub fn sort_block(batch: &[Neighbor], width: usize, scratch: &mut Vec<Neighbor>) {
    debug_assert!(batch.len() <= width);
    scratch.clear();
    scratch.extend_from_slice(batch);
    scratch.resize(width, Neighbor::empty());
    bitonic_sort(scratch);
}

/// Merges two ascending lists and keeps the `cap` smallest entries.
///
/// Empty slots are dropped. No entry is discarded while a larger one is kept.
pub fn merge_select(a: &[Neighbor], b: &[Neighbor], cap: usize) -> Vec<Neighbor> {
    let mut out = Vec::with_capacity(cap.min(a.len() + b.len()));
    merge_select_into(a, b, cap, &mut out);
    out
}

/// [`merge_select`] writing into a caller-owned buffer.
pub fn merge_select_into(a: &[Neighbor], b: &[Neighbor], cap: usize, out: &mut Vec<Neighbor>) {
    out.clear();
    let (mut i, mut j) = (0, 0);
    while out.len() < cap {
        let next = match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) => {
                if cmp_neighbors(x, y) != Ordering::Greater {
                    i += 1;
                    *x
                } else {
                    j += 1;
                    *y
                }
            }
            (Some(x), None) => {
                i += 1;
                *x
            }
            (None, Some(y)) => {
                j += 1;
                *y
            }
            (None, None) => break,
        };
        if next.is_empty() {
            break;
        }
        out.push(next);
    }
}

/// Running minimum used by single-NN scoring.
#[inline]
pub fn running_min(best: Option<Neighbor>, candidate: Neighbor) -> Option<Neighbor> {
    match best {
        Some(b) if cmp_neighbors(&b, &candidate) != Ordering::Greater => Some(b),
        _ => Some(candidate),
    }
}

/// Max-heap of capacity `k` holding the smallest distances seen so far.
#[derive(Clone, Debug)]
pub struct BoundedHeap {
    items: Vec<Neighbor>,
    cap: usize,
}

impl BoundedHeap {
    /// Creates an empty heap holding at most `cap` entries.
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Number of retained entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing has been retained.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distance a candidate has to beat to be retained.
    ///
    /// Infinite until the heap is full, so every candidate is accepted then.
    #[inline]
    pub fn threshold(&self) -> f32 {
        if self.items.len() < self.cap {
            f32::INFINITY
        } else {
            self.items.first().map_or(f32::INFINITY, |n| n.distance_sq)
        }
    }

    /// Offers a candidate. Returns whether it was retained.
    pub fn push(&mut self, candidate: Neighbor) -> bool {
        if self.cap == 0 {
            return false;
        }
        if self.items.len() < self.cap {
            self.items.push(candidate);
            self.sift_up(self.items.len() - 1);
            return true;
        }
        if cmp_neighbors(&candidate, &self.items[0]) == Ordering::Less {
            self.items[0] = candidate;
            self.sift_down(0);
            return true;
        }
        false
    }

    /// Offers an ascending batch, stopping at the first rejected entry.
    ///
    /// Returns the number of entries retained.
    pub fn push_sorted(&mut self, batch: &[Neighbor]) -> usize {
        let mut taken = 0;
        for n in batch {
            if n.is_empty() || !self.push(*n) {
                break;
            }
            taken += 1;
        }
        taken
    }

    /// Consumes the heap and returns its entries in ascending order.
    pub fn into_sorted_vec(mut self) -> Vec<Neighbor> {
        self.items.sort_unstable_by(cmp_neighbors);
        self.items
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if cmp_neighbors(&self.items[i], &self.items[parent]) == Ordering::Greater {
                self.items.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.items.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut largest = i;
            if left < n && cmp_neighbors(&self.items[left], &self.items[largest]) == Ordering::Greater {
                largest = left;
            }
            if right < n && cmp_neighbors(&self.items[right], &self.items[largest]) == Ordering::Greater {
                largest = right;
            }
            if largest == i {
                break;
            }
            self.items.swap(i, largest);
            i = largest;
        }
    }
}

/// Fixed-size arena of sorted top-k slots, one per work item.
#[derive(Clone, Debug)]
pub struct TopKArena {
    k: usize,
    slots: Vec<Neighbor>,
}

impl TopKArena {
    /// Creates `num_slots` empty slots of width `k`.
    pub fn new(num_slots: usize, k: usize) -> Self {
        Self {
            k,
            slots: vec![Neighbor::empty(); num_slots * k],
        }
    }

    /// Rebuilds an arena from the device's parallel distance/index buffers.
    pub fn from_device(k: usize, dists: &[f32], indices: &[u32]) -> Self {
        let slots = dists
            .iter()
            .zip(indices)
            .map(|(&d, &i)| Neighbor::new(d, i))
            .collect();
        Self { k, slots }
    }

    /// Slot width.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of slots.
    #[inline]
    pub fn num_slots(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.slots.len() / self.k
        }
    }

    /// Entries of slot `s`, empty placeholders included.
    #[inline]
    pub fn slot(&self, s: usize) -> &[Neighbor] {
        &self.slots[s * self.k..(s + 1) * self.k]
    }

    /// All slots as one flat buffer, for disjoint parallel writers.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Neighbor] {
        &mut self.slots
    }

    /// Writes an ascending list into a slot buffer, padding with empty entries.
    pub fn fill_slot(slot: &mut [Neighbor], sorted: &[Neighbor]) {
        for (dst, src) in slot.iter_mut().zip(sorted.iter().chain(std::iter::repeat(&Neighbor::empty()))) {
            *dst = *src;
        }
    }

    /// Folds slots `range` into one ascending top-k list.
    pub fn reduce(&self, range: std::ops::Range<usize>) -> Vec<Neighbor> {
        let mut acc: Vec<Neighbor> = Vec::with_capacity(self.k);
        let mut next = Vec::with_capacity(self.k);
        for s in range {
            merge_select_into(&acc, self.slot(s), self.k, &mut next);
            std::mem::swap(&mut acc, &mut next);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn neighbors(dists: &[f32]) -> Vec<Neighbor> {
        dists
            .iter()
            .enumerate()
            .map(|(i, &d)| Neighbor::new(d, i as u32))
            .collect()
    }

    fn sorted_truncated(mut all: Vec<Neighbor>, cap: usize) -> Vec<f32> {
        all.sort_by(cmp_neighbors);
        all.truncate(cap);
        all.into_iter().map(|n| n.distance_sq).collect()
    }

    #[test]
    fn test_bitonic_sort_matches_std() {
        let mut rng = StdRng::seed_from_u64(7);
        for width in [2usize, 4, 8, 16, 32, 64] {
            let dists: Vec<f32> = (0..width).map(|_| rng.random_range(0.0..100.0)).collect();
            let mut block = neighbors(&dists);
            bitonic_sort(&mut block);
            let got: Vec<f32> = block.iter().map(|n| n.distance_sq).collect();
            assert_eq!(got, sorted_truncated(neighbors(&dists), width));
            // indices travel with their values
            for n in &block {
                assert_eq!(dists[n.index as usize], n.distance_sq);
            }
        }
    }

    #[test]
    fn test_sort_block_pads_with_empty() {
        let mut scratch = Vec::new();
        sort_block(&neighbors(&[3.0, 1.0, 2.0]), 8, &mut scratch);
        assert_eq!(scratch.len(), 8);
        assert_eq!(scratch[0].index, 1);
        assert_eq!(scratch[2].index, 0);
        assert!(scratch[3..].iter().all(|n| n.is_empty()));
    }

    #[test]
    fn test_merge_select_equals_sort_of_union() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let a_len = rng.random_range(0..40);
            let b_len = rng.random_range(0..20);
            let cap = rng.random_range(1..48);
            let mut a: Vec<Neighbor> = (0..a_len)
                .map(|i| Neighbor::new(rng.random_range(0.0..10.0), i))
                .collect();
            let mut b: Vec<Neighbor> = (0..b_len)
                .map(|i| Neighbor::new(rng.random_range(0.0..10.0), 1000 + i))
                .collect();
            a.sort_by(cmp_neighbors);
            b.sort_by(cmp_neighbors);

            let merged = merge_select(&a, &b, cap);
            let expected = sorted_truncated(a.iter().chain(&b).copied().collect(), cap);
            let got: Vec<f32> = merged.iter().map(|n| n.distance_sq).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_merge_select_32_by_16() {
        let a = neighbors(&(0..32).map(|i| (2 * i) as f32).collect::<Vec<_>>());
        let b: Vec<Neighbor> = (0..16).map(|i| Neighbor::new((2 * i + 1) as f32, 100 + i)).collect();
        let merged = merge_select(&a, &b, 16);
        let got: Vec<f32> = merged.iter().map(|n| n.distance_sq).collect();
        assert_eq!(got, (0..16).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_select_stops_at_empty() {
        let a = vec![Neighbor::new(1.0, 0), Neighbor::empty()];
        let b = vec![Neighbor::empty()];
        assert_eq!(merge_select(&a, &b, 4), vec![Neighbor::new(1.0, 0)]);
    }

    #[test]
    fn test_heap_keeps_k_smallest() {
        let mut rng = StdRng::seed_from_u64(3);
        let dists: Vec<f32> = (0..500).map(|_| rng.random_range(0.0..1.0)).collect();
        let mut heap = BoundedHeap::new(10);
        for n in neighbors(&dists) {
            heap.push(n);
        }
        let got: Vec<f32> = heap.into_sorted_vec().iter().map(|n| n.distance_sq).collect();
        assert_eq!(got, sorted_truncated(neighbors(&dists), 10));
    }

    #[test]
    fn test_heap_threshold_and_sorted_batches() {
        let mut heap = BoundedHeap::new(3);
        assert_eq!(heap.threshold(), f32::INFINITY);
        assert_eq!(heap.push_sorted(&neighbors(&[1.0, 2.0, 3.0, 4.0])), 3);
        assert_eq!(heap.threshold(), 3.0);

        let batch = vec![Neighbor::new(0.5, 9), Neighbor::new(2.5, 8), Neighbor::new(3.5, 7)];
        // 0.5 evicts 3.0, then 2.5 loses to the new maximum 2.0
        assert_eq!(heap.push_sorted(&batch), 1);
        let idx: Vec<u32> = heap.into_sorted_vec().iter().map(|n| n.index).collect();
        assert_eq!(idx, vec![9, 0, 1]);
    }

    #[test]
    fn test_heap_zero_capacity() {
        let mut heap = BoundedHeap::new(0);
        assert!(!heap.push(Neighbor::new(1.0, 0)));
        assert!(heap.is_empty());
    }

    #[test]
    fn test_running_min_prefers_lower_index_on_ties() {
        let best = running_min(None, Neighbor::new(2.0, 5));
        let best = running_min(best, Neighbor::new(2.0, 1));
        let best = running_min(best, Neighbor::new(3.0, 0));
        assert_eq!(best, Some(Neighbor::new(2.0, 1)));
    }

    #[test]
    fn test_arena_reduce_across_slots() {
        let mut arena = TopKArena::new(3, 2);
        {
            let flat = arena.as_mut_slice();
            let (s0, rest) = flat.split_at_mut(2);
            let (s1, s2) = rest.split_at_mut(2);
            TopKArena::fill_slot(s0, &[Neighbor::new(4.0, 0), Neighbor::new(5.0, 1)]);
            TopKArena::fill_slot(s1, &[Neighbor::new(1.0, 2)]);
            TopKArena::fill_slot(s2, &[Neighbor::new(0.5, 3), Neighbor::new(9.0, 4)]);
        }
        assert_eq!(arena.num_slots(), 3);
        assert!(arena.slot(1)[1].is_empty());
        let reduced = arena.reduce(0..3);
        assert_eq!(reduced, vec![Neighbor::new(0.5, 3), Neighbor::new(1.0, 2)]);
        assert!(arena.reduce(1..1).is_empty());
    }
}
