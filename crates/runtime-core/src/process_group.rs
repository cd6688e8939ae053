//! Process-group boundary and collective barrier
//!
//! The surrounding distributed runtime supplies rank, world size and a
//! barrier. [`LocalProcessGroup`] implements that boundary for ranks that
//! live as tasks in one process, which is how the coordinator is driven in
//! tests and single-node jobs.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::Rank;
use crate::{Error, Result};

/// Collective operations supplied by the distributed runtime
#[async_trait]
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    /// This worker's rank
    fn rank(&self) -> Rank;

    /// Number of workers in the group
    fn world_size(&self) -> usize;

    /// Block until every rank has reached the barrier named `barrier_id`
    async fn barrier(&self, barrier_id: &str) -> Result<()>;

    /// Whether this rank writes job-wide artifacts such as the completion marker
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

/// A group of one; barriers return immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcessGroup;

#[async_trait]
impl ProcessGroup for SingleProcessGroup {
    fn rank(&self) -> Rank {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn barrier(&self, _barrier_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Arrivals at one open barrier
#[derive(Debug)]
struct BarrierSlot {
    /// Expected number of participants
    expected: usize,

    /// Ranks that have arrived, in arrival order
    arrived: Vec<Rank>,

    /// Channels to release waiting ranks
    waiters: Vec<(Rank, oneshot::Sender<()>)>,
}

impl BarrierSlot {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            arrived: Vec::with_capacity(expected),
            waiters: Vec::new(),
        }
    }

    /// Record an arrival, returns true if the barrier should be released
    fn arrive(&mut self, rank: Rank) -> bool {
        self.arrived.push(rank);
        self.arrived.len() >= self.expected
    }
}

/// Barrier state shared by every rank of a [`LocalProcessGroup`]
#[derive(Debug)]
pub struct BarrierHub {
    world_size: usize,
    timeout: Duration,
    slots: DashMap<String, BarrierSlot>,
}

impl BarrierHub {
    fn new(world_size: usize, timeout: Duration) -> Self {
        Self {
            world_size,
            timeout,
            slots: DashMap::new(),
        }
    }

    /// Number of barriers some rank is still waiting on
    pub fn open_barriers(&self) -> usize {
        self.slots.len()
    }

    /// Take back a timed-out arrival so a retry of the same barrier can
    /// count this rank again; the slot goes once nobody is waiting on it
    fn withdraw(&self, barrier_id: &str, rank: Rank) {
        if let Some(mut slot) = self.slots.get_mut(barrier_id) {
            slot.arrived.retain(|r| *r != rank);
            slot.waiters.retain(|(r, _)| *r != rank);
        }
        self.slots
            .remove_if(barrier_id, |_, slot| slot.arrived.is_empty());
    }

    async fn wait(&self, barrier_id: &str, rank: Rank) -> Result<()> {
        let rx = {
            let mut slot = self
                .slots
                .entry(barrier_id.to_string())
                .or_insert_with(|| BarrierSlot::new(self.world_size));

            if slot.arrived.contains(&rank) {
                return Err(Error::Internal {
                    message: format!("rank {} arrived twice at barrier {}", rank, barrier_id),
                });
            }

            if slot.arrive(rank) {
                let waiters: Vec<_> = slot.waiters.drain(..).collect();
                drop(slot);
                self.slots.remove(barrier_id);

                for (_, waiter) in waiters {
                    let _ = waiter.send(());
                }
                debug!(barrier_id, rank, "Barrier released");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            slot.waiters.push((rank, tx));
            rx
        };

        debug!(barrier_id, rank, "Waiting at barrier");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ChannelClosed {
                channel: format!("barrier {}", barrier_id),
            }),
            Err(_) => {
                self.withdraw(barrier_id, rank);
                warn!(
                    barrier_id,
                    rank,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Barrier timed out"
                );
                Err(Error::BarrierTimeout {
                    barrier_id: barrier_id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// One rank's handle on an in-process group
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: Rank,
    hub: Arc<BarrierHub>,
}

impl LocalProcessGroup {
    /// Build handles for every rank of a `world_size`-rank group
    pub fn new_group(world_size: usize, timeout: Duration) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "process group needs at least one rank".to_string(),
            });
        }
        let hub = Arc::new(BarrierHub::new(world_size, timeout));
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                hub: Arc::clone(&hub),
            })
            .collect())
    }

    /// Shared barrier state
    pub fn hub(&self) -> &Arc<BarrierHub> {
        &self.hub
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    async fn barrier(&self, barrier_id: &str) -> Result<()> {
        self.hub.wait(barrier_id, self.rank).await
    }
}
