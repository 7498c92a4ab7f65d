//! Cross-worker gradient synchronization.
//!
//! The statistics update inside [`crate::loss::GradientAggregator`] is a
//! collective operation: every data-parallel worker must contribute its
//! per-class gradient sums and receive the identical total. [`Collective`] is
//! the seam; a process-group backend (NCCL, MPI, gloo) plugs in behind it.
//!
//! Contract: `all_reduce_sum` must be called the same number of times, in the
//! same relative order, by every participating worker. A worker that skips a
//! call leaves the others blocked — that is a liveness bug in the caller, not
//! a recoverable error.

use crate::error::{Error, Result};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Summing all-reduce across all participating workers.
pub trait Collective {
    /// Replace `buf` on every worker with the elementwise sum over all
    /// workers. Blocks until every worker has contributed.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Number of participating workers.
    fn world_size(&self) -> usize;
}

/// Single-worker "group": the sum over one participant is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn world_size(&self) -> usize {
        1
    }
}

struct Round {
    sum: Vec<f32>,
    arrived: usize,
    read: usize,
}

struct GroupShared {
    world_size: usize,
    rounds: Mutex<HashMap<u64, Round>>,
    all_arrived: Condvar,
}

/// In-process thread group performing a real summing all-reduce.
///
/// One handle per worker thread. Calls rendezvous by round number, so every
/// worker's n-th call reduces with every other worker's n-th call — the same
/// ordering contract a process-group backend imposes.
pub struct LocalGroup {
    shared: Arc<GroupShared>,
    round: Cell<u64>,
}

impl LocalGroup {
    /// Create `world_size` handles sharing one group, one per worker thread.
    pub fn group(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(GroupShared {
            world_size: world_size.max(1),
            rounds: Mutex::new(HashMap::new()),
            all_arrived: Condvar::new(),
        });
        (0..world_size.max(1))
            .map(|_| LocalGroup {
                shared: Arc::clone(&shared),
                round: Cell::new(0),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let round = self.round.get();
        self.round.set(round + 1);

        let mut rounds = self
            .shared
            .rounds
            .lock()
            .map_err(|_| Error::Comm("all-reduce lock poisoned".to_string()))?;

        // Contribute this worker's values.
        {
            let state = rounds.entry(round).or_insert_with(|| Round {
                sum: vec![0.0; buf.len()],
                arrived: 0,
                read: 0,
            });
            if state.sum.len() != buf.len() {
                return Err(Error::Comm(format!(
                    "all-reduce length mismatch in round {round}: {} vs {}",
                    state.sum.len(),
                    buf.len()
                )));
            }
            for (acc, v) in state.sum.iter_mut().zip(buf.iter()) {
                *acc += *v;
            }
            state.arrived += 1;
            if state.arrived == self.shared.world_size {
                self.shared.all_arrived.notify_all();
            }
        }

        // Wait for the rest of the group.
        loop {
            let arrived = rounds
                .get(&round)
                .map(|state| state.arrived)
                .ok_or_else(|| {
                    Error::Comm(format!("all-reduce round {round} vanished before completion"))
                })?;
            if arrived >= self.shared.world_size {
                break;
            }
            rounds = self
                .shared
                .all_arrived
                .wait(rounds)
                .map_err(|_| Error::Comm("all-reduce lock poisoned".to_string()))?;
        }

        // Read the total back out; the last reader retires the round.
        let state = rounds
            .get_mut(&round)
            .ok_or_else(|| Error::Comm(format!("all-reduce round {round} vanished")))?;
        buf.copy_from_slice(&state.sum);
        state.read += 1;
        if state.read == self.shared.world_size {
            rounds.remove(&round);
        }
        Ok(())
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }
}
