//! Per-round cryptographic scratch shared by every phase of a round.
//!
//! Precomputation kernels write the key vectors and the permutation;
//! realtime kernels read them. Concurrent kernel threads only ever touch
//! disjoint slot indices, so each vector is a [`GroupArray`] of per-slot
//! cells rather than one lock over the whole vector.
//!
//! Vectors are allocated at the expanded batch size so kernels may read them
//! for padding slots. The permutation shuffles only the real batch; padding
//! slots always map to themselves.

use crate::group::{CyclicGroup, GroupElement};
use crate::stream::GroupArray;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

#[derive(Debug)]
pub struct RoundBuffer {
    group: Arc<CyclicGroup>,
    batch_size: u32,
    expanded_batch_size: u32,

    pub r: GroupArray,
    pub s: GroupArray,
    pub t: GroupArray,
    pub u: GroupArray,
    pub v: GroupArray,

    pub r_inv: GroupArray,
    pub s_inv: GroupArray,
    pub t_inv: GroupArray,
    pub u_inv: GroupArray,
    pub v_inv: GroupArray,

    pub y_r: GroupArray,
    pub y_s: GroupArray,
    pub y_t: GroupArray,
    pub y_u: GroupArray,
    pub y_v: GroupArray,

    z: RwLock<GroupElement>,
    permutation: RwLock<Vec<u32>>,
    cypher_public_key: RwLock<GroupElement>,
}

impl RoundBuffer {
    /// Allocate every vector at `expanded_batch_size`, set to the group
    /// identity, with the identity permutation. An expanded size below
    /// `batch_size` is raised to it.
    pub fn new(group: Arc<CyclicGroup>, batch_size: u32, expanded_batch_size: u32) -> Self {
        let expanded_batch_size = expanded_batch_size.max(batch_size);
        let one = group.identity();
        let array = || GroupArray::filled(expanded_batch_size, &one);
        Self {
            batch_size,
            expanded_batch_size,
            r: array(),
            s: array(),
            t: array(),
            u: array(),
            v: array(),
            r_inv: array(),
            s_inv: array(),
            t_inv: array(),
            u_inv: array(),
            v_inv: array(),
            y_r: array(),
            y_s: array(),
            y_t: array(),
            y_u: array(),
            y_v: array(),
            z: RwLock::new(one.clone()),
            permutation: RwLock::new((0..expanded_batch_size).collect()),
            cypher_public_key: RwLock::new(one),
            group,
        }
    }

    pub fn group(&self) -> &Arc<CyclicGroup> {
        &self.group
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Length of every slot vector, padding included.
    pub fn expanded_batch_size(&self) -> u32 {
        self.expanded_batch_size
    }

    pub fn z(&self) -> GroupElement {
        self.z.read().clone()
    }

    pub fn set_z(&self, z: GroupElement) {
        *self.z.write() = z;
    }

    pub fn cypher_public_key(&self) -> GroupElement {
        self.cypher_public_key.read().clone()
    }

    pub fn set_cypher_public_key(&self, key: GroupElement) {
        *self.cypher_public_key.write() = key;
    }

    /// The permutation over the real batch.
    pub fn permutation(&self) -> Vec<u32> {
        self.permutation.read()[..self.batch_size as usize].to_vec()
    }

    /// Where slot `index` lands after permuting. Padding slots stay put.
    pub fn permuted_index(&self, index: u32) -> u32 {
        self.permutation.read()[index as usize]
    }

    /// Replace the permutation of the real batch. Returns false, leaving the
    /// old one in place, if `permutation` is not a bijection over
    /// `0..batch_size`.
    pub fn set_permutation(&self, mut permutation: Vec<u32>) -> bool {
        if !is_bijection(&permutation, self.batch_size) {
            return false;
        }
        permutation.extend(self.batch_size..self.expanded_batch_size);
        *self.permutation.write() = permutation;
        true
    }

    /// Draw a uniformly random permutation of the real batch (Fisher-Yates).
    pub fn shuffle_permutation<R: Rng + ?Sized>(&self, rng: &mut R) {
        let mut permutation = self.permutation.write();
        permutation[..self.batch_size as usize].shuffle(rng);
    }

    pub fn is_permutation(&self) -> bool {
        let permutation = self.permutation.read();
        let (real, padding) = permutation.split_at(self.batch_size as usize);
        is_bijection(real, self.batch_size)
            && padding.iter().copied().eq(self.batch_size..self.expanded_batch_size)
    }

    /// Overwrite every secret with the identity.
    pub fn erase(&self) {
        let one = self.group.identity();
        for array in [
            &self.r, &self.s, &self.t, &self.u, &self.v, &self.r_inv, &self.s_inv, &self.t_inv,
            &self.u_inv, &self.v_inv, &self.y_r, &self.y_s, &self.y_t, &self.y_u, &self.y_v,
        ] {
            array.fill(&one);
        }
        *self.z.write() = one.clone();
        *self.cypher_public_key.write() = one;
        *self.permutation.write() = (0..self.expanded_batch_size).collect();
    }
}

fn is_bijection(permutation: &[u32], size: u32) -> bool {
    if permutation.len() != size as usize {
        return false;
    }
    let mut seen = vec![false; permutation.len()];
    for &p in permutation {
        match seen.get_mut(p as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::tests::test_group;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn buffer(batch: u32) -> RoundBuffer {
        RoundBuffer::new(Arc::new(test_group()), batch, batch)
    }

    #[test]
    fn allocated_at_batch_size() {
        let b = buffer(8);
        assert_eq!(b.r.len(), 8);
        assert_eq!(b.y_v.len(), 8);
        assert_eq!(b.permutation(), (0..8).collect::<Vec<_>>());
        assert!(b.is_permutation());
    }

    #[test]
    fn padding_slots_are_allocated_and_fixed() {
        let b = RoundBuffer::new(Arc::new(test_group()), 6, 8);
        assert_eq!(b.batch_size(), 6);
        assert_eq!(b.expanded_batch_size(), 8);
        assert_eq!(b.r.len(), 8);
        assert_eq!(b.v_inv.get(7), b.group().identity());

        assert!(b.set_permutation(vec![5, 4, 3, 2, 1, 0]));
        assert_eq!(b.permutation(), vec![5, 4, 3, 2, 1, 0]);
        assert_eq!(b.permuted_index(0), 5);
        assert_eq!(b.permuted_index(7), 7);
        assert!(b.is_permutation());

        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        b.shuffle_permutation(&mut rng);
        assert!(b.is_permutation());
        assert_eq!((b.permuted_index(6), b.permuted_index(7)), (6, 7));
    }

    #[test]
    fn expanded_size_never_below_batch() {
        let b = RoundBuffer::new(Arc::new(test_group()), 6, 2);
        assert_eq!(b.expanded_batch_size(), 6);
        assert_eq!(b.s.len(), 6);
    }

    #[test]
    fn rejects_non_bijection() {
        let b = buffer(4);
        assert!(!b.set_permutation(vec![0, 1, 1, 3]));
        assert!(!b.set_permutation(vec![0, 1, 2]));
        assert!(!b.set_permutation(vec![0, 1, 2, 4]));
        assert!(b.set_permutation(vec![3, 2, 1, 0]));
        assert_eq!(b.permuted_index(0), 3);
    }

    #[test]
    fn erase_resets_secrets() {
        let b = buffer(4);
        let g = b.group().clone();
        b.r.set(2, g.generator());
        b.set_z(g.generator());
        b.set_permutation(vec![1, 0, 3, 2]);
        b.erase();
        assert_eq!(b.r.get(2), g.identity());
        assert_eq!(b.z(), g.identity());
        assert_eq!(b.permutation(), vec![0, 1, 2, 3]);
    }

    proptest! {
        #[test]
        fn shuffled_permutation_is_bijection(seed in any::<u64>(), batch in 1u32..200) {
            let b = buffer(batch);
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            b.shuffle_permutation(&mut rng);
            prop_assert!(b.is_permutation());
        }
    }
}
