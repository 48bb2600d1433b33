//! Cyclic group arithmetic used by kernels and streams.
//!
//! The group is passed explicitly from the round buffer to streams and
//! kernels; nothing here is process-global.

use crate::error::StreamError;
use num_bigint::BigUint;
use rand::RngCore;
use std::fmt;

/// An element of the multiplicative group modulo `p`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GroupElement(BigUint);

impl GroupElement {
    pub fn value(&self) -> &BigUint {
        &self.0
    }
}

impl fmt::Debug for GroupElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupElement({:x})", self.0)
    }
}

/// Multiplicative group of integers modulo a prime `p` with generator `g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclicGroup {
    p: BigUint,
    g: BigUint,
    byte_len: usize,
}

impl CyclicGroup {
    pub fn new(p: BigUint, g: BigUint) -> Self {
        let byte_len = p.to_bytes_be().len();
        Self { p, g, byte_len }
    }

    pub fn prime(&self) -> &BigUint {
        &self.p
    }

    /// Width in bytes of every serialized element.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn identity(&self) -> GroupElement {
        GroupElement(BigUint::from(1u32))
    }

    pub fn generator(&self) -> GroupElement {
        GroupElement(self.g.clone())
    }

    /// Reduce an arbitrary integer into the group. Zero maps to the identity.
    pub fn element(&self, value: BigUint) -> GroupElement {
        let reduced = value % &self.p;
        if reduced == BigUint::default() {
            self.identity()
        } else {
            GroupElement(reduced)
        }
    }

    pub fn in_group(&self, x: &GroupElement) -> bool {
        x.0 > BigUint::default() && x.0 < self.p
    }

    pub fn mul(&self, a: &GroupElement, b: &GroupElement) -> GroupElement {
        GroupElement((&a.0 * &b.0) % &self.p)
    }

    pub fn exp(&self, base: &GroupElement, exponent: &BigUint) -> GroupElement {
        GroupElement(base.0.modpow(exponent, &self.p))
    }

    /// Multiplicative inverse by Fermat's little theorem.
    pub fn inverse(&self, x: &GroupElement) -> GroupElement {
        let exponent = &self.p - BigUint::from(2u32);
        GroupElement(x.0.modpow(&exponent, &self.p))
    }

    pub fn random_element<R: RngCore + ?Sized>(&self, rng: &mut R) -> GroupElement {
        let mut bytes = vec![0u8; self.byte_len + 8];
        rng.fill_bytes(&mut bytes);
        self.element(BigUint::from_bytes_be(&bytes))
    }

    /// Decode a big-endian element, rejecting values outside `[1, p)`.
    pub fn element_from_bytes(&self, bytes: &[u8]) -> Result<GroupElement, StreamError> {
        let x = GroupElement(BigUint::from_bytes_be(bytes));
        if self.in_group(&x) {
            Ok(x)
        } else {
            Err(StreamError::NotInGroup)
        }
    }

    /// Encode an element as `byte_len` big-endian bytes.
    pub fn element_to_bytes(&self, x: &GroupElement) -> Vec<u8> {
        let raw = x.0.to_bytes_be();
        let mut out = vec![0u8; self.byte_len.saturating_sub(raw.len())];
        out.extend_from_slice(&raw);
        out
    }
}
