//! Minimal process-group interface for dropout-seed agreement.
//!
//! Quantizer dropout picks how many stages run on each call. Under data
//! parallel training every replica must pick the same number, so the seed is
//! agreed with one scalar all-reduce. This module only needs two operations:
//! the world size and a sum reduction of a single integer.

use std::sync::{Condvar, Mutex};

use crate::{Error, Result};

/// Collective operations used by the quantizer.
pub trait ProcessGroup: Send + Sync + std::fmt::Debug {
    /// Number of participating processes.
    fn world_size(&self) -> usize;

    /// Sum `value` across all processes. Blocks until every participant
    /// has contributed; every participant receives the same result.
    fn all_reduce_sum(&self, value: u64) -> Result<u64>;
}

/// Single-process group. The reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        Ok(value)
    }
}

#[derive(Debug, Default)]
struct ReduceState {
    arrived: usize,
    sum: u64,
    generation: u64,
    result: u64,
}

/// In-memory group for replicas running as threads of one process.
///
/// Each reduction round waits for `world_size` callers, then releases them
/// all with the sum of their contributions.
#[derive(Debug)]
pub struct LocalProcessGroup {
    world_size: usize,
    state: Mutex<ReduceState>,
    round_done: Condvar,
}

impl LocalProcessGroup {
    pub fn new(world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Config("world_size must be at least 1".into()));
        }
        Ok(Self {
            world_size,
            state: Mutex::new(ReduceState::default()),
            round_done: Condvar::new(),
        })
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Contract("process group lock poisoned".into()))?;

        let generation = state.generation;
        state.sum = state.sum.wrapping_add(value);
        state.arrived += 1;

        if state.arrived == self.world_size {
            state.result = state.sum;
            state.sum = 0;
            state.arrived = 0;
            state.generation += 1;
            self.round_done.notify_all();
            return Ok(state.result);
        }

        while state.generation == generation {
            state = self
                .round_done
                .wait(state)
                .map_err(|_| Error::Contract("process group lock poisoned".into()))?;
        }
        Ok(state.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_process_is_identity() {
        let group = SingleProcess;
        assert_eq!(group.world_size(), 1);
        assert_eq!(group.all_reduce_sum(1234).unwrap(), 1234);
    }

    #[test]
    fn local_group_sums_across_threads() {
        let world_size = 4;
        let group = Arc::new(LocalProcessGroup::new(world_size).unwrap());

        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let group = Arc::clone(&group);
                std::thread::spawn(move || {
                    let first = group.all_reduce_sum(rank as u64 + 1).unwrap();
                    let second = group.all_reduce_sum(10).unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, 1 + 2 + 3 + 4);
            assert_eq!(second, 40);
        }
    }

    #[test]
    fn local_group_rejects_empty_world() {
        assert!(LocalProcessGroup::new(0).is_err());
    }
}
