// calotopo/src/pipeline/pool.rs

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

use calocore::cell_info::CellInfo;
use calocore::cluster::ClusterSummary;
use calocore::tag::ClusterTag;

use crate::cluster::classify::Classification;
use crate::cluster::pairs::EdgeList;

/// Working memory of one event as it moves through the stages.
#[derive(Debug, Default)]
pub struct EventBuffers {
    pub cell_info: CellInfo,
    pub classification: Classification,
    pub edges: EdgeList,
    pub tags: Vec<ClusterTag>,
    pub summaries: Vec<ClusterSummary>,
}

impl EventBuffers {
    /// Load a new event, keeping allocations from the previous one.
    pub fn load(&mut self, cell_info: &CellInfo) {
        self.cell_info.copy_from(cell_info);
        self.edges.clear();
        self.tags.clear();
        self.summaries.clear();
    }
}

struct PoolState {
    free: Vec<EventBuffers>,
    created: usize,
}

/// Bounded pool of [`EventBuffers`].
///
/// `acquire` hands out a free buffer, creates one while below capacity (or always,
/// when growth is allowed) and otherwise blocks until a buffer is returned.
pub struct EventBufferPool {
    state: Mutex<PoolState>,
    returned: Condvar,
    capacity: usize,
    allow_growth: bool,
}

impl EventBufferPool {
    pub fn new(preallocated: usize, allow_growth: bool) -> Self {
        let free = (0..preallocated).map(|_| EventBuffers::default()).collect();
        EventBufferPool {
            state: Mutex::new(PoolState { free, created: preallocated }),
            returned: Condvar::new(),
            capacity: preallocated.max(1),
            allow_growth,
        }
    }

    /// Buffers that can exist at once without growth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allows_growth(&self) -> bool {
        self.allow_growth
    }

    #[inline]
    fn available(&self, state: &PoolState) -> usize {
        if self.allow_growth {
            usize::MAX
        } else {
            state.free.len() + self.capacity.saturating_sub(state.created)
        }
    }

    fn take(&self, state: &mut PoolState) -> PooledBuffers<'_> {
        let buffers = match state.free.pop() {
            Some(buffers) => buffers,
            None => {
                state.created += 1;
                if state.created > self.capacity {
                    log::debug!("event buffer pool grew to {} buffers", state.created);
                }
                EventBuffers::default()
            }
        };
        PooledBuffers { pool: self, buffers }
    }

    /// Check out one buffer. Blocks while the pool is exhausted, so a thread must
    /// not call this while it already holds every buffer of a bounded pool.
    pub fn acquire(&self) -> PooledBuffers<'_> {
        let mut state = self.state.lock();
        while self.available(&state) == 0 {
            self.returned.wait(&mut state);
        }
        self.take(&mut state)
    }

    /// Check out `count` buffers at once, blocking until all of them are available.
    /// A bounded pool hands out at most `capacity` buffers.
    pub fn acquire_many(&self, count: usize) -> Vec<PooledBuffers<'_>> {
        let count = if self.allow_growth { count } else { count.min(self.capacity) };
        let mut state = self.state.lock();
        while self.available(&state) < count {
            self.returned.wait(&mut state);
        }
        (0..count).map(|_| self.take(&mut state)).collect()
    }

    fn release(&self, buffers: EventBuffers) {
        self.state.lock().free.push(buffers);
        self.returned.notify_all();
    }

    /// Buffers created so far, in use or idle.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn idle(&self) -> usize {
        self.state.lock().free.len()
    }
}

/// A buffer checked out of an [`EventBufferPool`]; returned when dropped.
pub struct PooledBuffers<'a> {
    pool: &'a EventBufferPool,
    buffers: EventBuffers,
}

impl Deref for PooledBuffers<'_> {
    type Target = EventBuffers;

    fn deref(&self) -> &EventBuffers {
        &self.buffers
    }
}

impl DerefMut for PooledBuffers<'_> {
    fn deref_mut(&mut self) -> &mut EventBuffers {
        &mut self.buffers
    }
}

impl Drop for PooledBuffers<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffers));
    }
}
