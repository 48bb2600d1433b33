//! Assignment accounting: per-module completion tracking over slot ranges.
//!
//! Every module owns one [`AssignmentList`]. Upstream modules report the
//! chunks they finished through [`AssignmentList::prime_outputs`]; an
//! assignment becomes ready once it has received `max_count` weight, which is
//! one full assignment's worth of slots from every input.

use crate::chunk::Chunk;
use crate::invariant_ppt::{
    assert_invariant, COMPLETION_OVERFLOW, THRESHOLD_RANGE, WEIGHT_OVERFLOW,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// One fixed-size contiguous slot range and the weight it has received.
#[derive(Debug)]
pub struct Assignment {
    start: u32,
    count: AtomicU32,
}

impl Assignment {
    fn new(start: u32) -> Self {
        Self {
            start,
            count: AtomicU32::new(0),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

/// Completion state for all assignments of one module, plus the start gate.
#[derive(Debug)]
pub struct AssignmentList {
    assignments: Vec<Assignment>,
    assignment_size: u32,
    chunk_size: u32,
    max_count: u32,
    threshold: u32,
    primed: AtomicU32,
    completed: AtomicU32,
    waiting: Mutex<Vec<Chunk>>,
}

impl AssignmentList {
    /// Build the list for a module covering `[0, expanded_batch_size)`.
    ///
    /// `num_inputs` is the number of upstream modules; a module with no
    /// inputs is fed externally and counts as one.
    pub fn new(
        expanded_batch_size: u32,
        assignment_size: u32,
        chunk_size: u32,
        num_inputs: usize,
        start_threshold: f32,
    ) -> Self {
        assert_invariant(
            THRESHOLD_RANGE,
            (0.0..=1.0).contains(&start_threshold),
            "start threshold must lie in [0, 1]",
            Some("AssignmentList::new"),
        );
        let num_assignments = expanded_batch_size.div_ceil(assignment_size.max(1));
        let assignments = (0..num_assignments)
            .map(|i| Assignment::new(i * assignment_size))
            .collect();
        let threshold =
            ((start_threshold * num_assignments as f32).ceil() as u32).min(num_assignments);

        Self {
            assignments,
            assignment_size,
            chunk_size,
            max_count: assignment_size * (num_inputs.max(1) as u32),
            threshold,
            primed: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            waiting: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn assignment_size(&self) -> u32 {
        self.assignment_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn primed(&self) -> u32 {
        self.primed.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Add the weight of `chunk` to the assignments it covers.
    ///
    /// Returns the chunks released downstream and how many were released.
    /// Assignments that filled before the threshold was crossed are held back
    /// and released together, in ascending slot order, by the call that
    /// crosses it.
    pub fn prime_outputs(&self, chunk: Chunk) -> (Vec<Chunk>, u32) {
        let mut ready = Vec::new();
        let mut position = chunk.begin();
        let mut remaining = chunk.len();

        while remaining > 0 {
            let index = (position / self.assignment_size) as usize;
            assert_invariant(
                WEIGHT_OVERFLOW,
                index < self.assignments.len(),
                "chunk extends past the last assignment",
                Some("AssignmentList::prime_outputs"),
            );
            let edge = (index as u32 + 1) * self.assignment_size - position;
            let weight = edge.min(remaining);

            let assignment = &self.assignments[index];
            let count = assignment.count.fetch_add(weight, Ordering::AcqRel) + weight;
            assert_invariant(
                WEIGHT_OVERFLOW,
                count <= self.max_count,
                "assignment weight exceeded max count",
                Some("AssignmentList::prime_outputs"),
            );
            if count == self.max_count {
                ready.push(Chunk::with_len(assignment.start, self.assignment_size));
            }

            position += weight;
            remaining -= weight;
        }

        if ready.is_empty() {
            return (ready, 0);
        }

        // The gate decision and the waiting list must change together, or a
        // chunk parked just after the threshold release would never leave.
        let mut waiting = self.waiting.lock();
        let loaded = self.primed.fetch_add(ready.len() as u32, Ordering::AcqRel);
        let new_primed = loaded + ready.len() as u32;

        if new_primed < self.threshold {
            waiting.append(&mut ready);
            return (Vec::new(), 0);
        }
        if loaded < self.threshold {
            let mut released = std::mem::take(&mut *waiting);
            released.append(&mut ready);
            released.sort_unstable();
            let n = released.len() as u32;
            return (released, n);
        }
        drop(waiting);

        let n = ready.len() as u32;
        (ready, n)
    }

    /// Record `n` assignments as handed to the module's input queue.
    ///
    /// Returns true exactly once, when every assignment has been handed over.
    pub fn denote_completed(&self, n: u32) -> bool {
        if n == 0 {
            return false;
        }
        let completed = self.completed.fetch_add(n, Ordering::AcqRel) + n;
        assert_invariant(
            COMPLETION_OVERFLOW,
            completed as usize <= self.assignments.len(),
            "more assignments completed than exist",
            Some("AssignmentList::denote_completed"),
        );
        completed as usize == self.assignments.len()
    }

    /// Assignments released so far must never outnumber those primed.
    pub fn is_consistent(&self) -> bool {
        let completed = self.completed();
        let primed = self.primed();
        completed <= primed && primed as usize <= self.assignments.len()
    }
}
