// btoken_node/src/blockchain/reassembly.rs
// Ordered reassembly of items produced out of order. The archive loader
// feeds it from worker threads, the synchronizer from peer downloads.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

/// Pending items keyed by sequence index plus the cursor of the next index due.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    cursor: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(cursor: u64) -> Self {
        ReorderBuffer { cursor, pending: BTreeMap::new() }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_due(&self, index: u64) -> bool {
        index == self.cursor
    }

    /// Buffers `item`. Items behind the cursor or already buffered are dropped.
    pub fn insert(&mut self, index: u64, item: T) -> bool {
        if index < self.cursor || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, item);
        true
    }

    /// Hands out the item at the cursor and advances it.
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let item = self.pending.remove(&self.cursor)?;
        let index = self.cursor;
        self.cursor += 1;
        Some((index, item))
    }

    pub fn contains(&self, index: u64) -> bool {
        self.pending.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn reset(&mut self, cursor: u64) {
        self.cursor = cursor;
        self.pending.clear();
    }
}

/// Whether the consumer wants more items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// The item (and any buffered successors) went to the sink.
    Inserted,
    /// Not due yet; buffered while capacity allowed.
    Buffered,
    /// The reassembly has finished; the item was dropped.
    Exit,
}

struct ParkingState<T, S> {
    buffer: ReorderBuffer<T>,
    sink: S,
    exit: bool,
}

/// Thread-parking front of a `ReorderBuffer`. Producers whose item is not due
/// buffer it while fewer than `capacity` items wait, otherwise they park until
/// the cursor reaches their index. Whoever hands in the due item drains the
/// buffer into the sink, so the sink sees strictly ascending indices.
pub struct ParkingReassembly<T, S> {
    state: Mutex<ParkingState<T, S>>,
    turn: Condvar,
    capacity: usize,
}

impl<T, S, E> ParkingReassembly<T, S>
where
    S: FnMut(u64, T) -> Result<Flow, E>,
{
    pub fn new(cursor: u64, capacity: usize, sink: S) -> Self {
        ParkingReassembly {
            state: Mutex::new(ParkingState {
                buffer: ReorderBuffer::new(cursor),
                sink,
                exit: false,
            }),
            turn: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn submit(&self, index: u64, item: T) -> Result<Submitted, E> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if state.exit {
                return Ok(Submitted::Exit);
            }
            if state.buffer.is_due(index) {
                break;
            }
            if state.buffer.len() < self.capacity {
                state.buffer.insert(index, item);
                return Ok(Submitted::Buffered);
            }
            state = self.turn.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        state.buffer.insert(index, item);
        let ParkingState { buffer, sink, exit } = &mut *state;
        let mut result = Ok(Submitted::Inserted);
        while let Some((i, next)) = buffer.pop_ready() {
            match sink(i, next) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    *exit = true;
                    break;
                }
                Err(e) => {
                    *exit = true;
                    result = Err(e);
                    break;
                }
            }
        }
        if *exit {
            buffer.reset(buffer.cursor());
        }
        drop(state);
        self.turn.notify_all();
        result
    }

    /// Wakes every parked producer and makes further submissions no-ops.
    pub fn signal_exit(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.exit = true;
        drop(state);
        self.turn.notify_all();
    }

    pub fn is_exiting(&self) -> bool {
        self.state.lock().map(|state| state.exit).unwrap_or(true)
    }

    pub fn cursor(&self) -> u64 {
        self.state.lock().map(|state| state.buffer.cursor()).unwrap_or(0)
    }

    pub fn into_sink(self) -> S {
        self.state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()).sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn reorder_buffer_releases_in_order() {
        let mut buffer = ReorderBuffer::new(5);
        assert!(buffer.insert(7, "c"));
        assert!(buffer.insert(6, "b"));
        assert!(!buffer.insert(4, "stale"));
        assert!(!buffer.insert(6, "dup"));
        assert_eq!(buffer.pop_ready(), None);
        assert!(buffer.insert(5, "a"));
        let drained: Vec<_> = std::iter::from_fn(|| buffer.pop_ready()).collect();
        assert_eq!(drained, vec![(5, "a"), (6, "b"), (7, "c")]);
        assert_eq!(buffer.cursor(), 8);
    }

    #[test]
    fn permuted_submissions_reach_sink_in_order() {
        for seed in 0..20u64 {
            let mut order: Vec<u64> = (0..40).collect();
            let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(seed);
            order.shuffle(&mut rng);

            let mut seen = Vec::new();
            let reassembly = ParkingReassembly::new(0, 64, |index, item: (u64, Vec<u32>)| {
                assert_eq!(index, item.0);
                seen.push(item);
                Ok::<_, ()>(Flow::Continue)
            });
            for index in order {
                let items = vec![index as u32 * 10, index as u32 * 10 + 1];
                reassembly.submit(index, (index, items)).unwrap();
            }
            drop(reassembly);
            let indices: Vec<u64> = seen.iter().map(|(i, _)| *i).collect();
            assert_eq!(indices, (0..40).collect::<Vec<_>>());
            assert!(seen.iter().all(|(i, items)| items == &vec![*i as u32 * 10, *i as u32 * 10 + 1]));
        }
    }

    #[test]
    fn parked_workers_deliver_in_order_across_threads() {
        let count = 200u64;
        let claim = AtomicU64::new(0);
        let mut delivered = Vec::new();
        let reassembly = ParkingReassembly::new(0, 2, |index, item: u64| {
            assert_eq!(index, item);
            delivered.push(item);
            Ok::<_, ()>(Flow::Continue)
        });
        let reassembly = Arc::new(reassembly);
        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let reassembly = Arc::clone(&reassembly);
                let claim = &claim;
                scope.spawn(move || loop {
                    let index = claim.fetch_add(1, Ordering::SeqCst);
                    if index >= count {
                        break;
                    }
                    if (index + worker) % 3 == 0 {
                        std::thread::yield_now();
                    }
                    if reassembly.submit(index, index).unwrap() == Submitted::Exit {
                        break;
                    }
                });
            }
        });
        let reassembly = Arc::try_unwrap(reassembly).ok().expect("workers joined");
        assert_eq!(reassembly.cursor(), count);
        drop(reassembly.into_sink());
        assert_eq!(delivered, (0..count).collect::<Vec<_>>());
    }

    #[test]
    fn stop_wakes_parked_workers() {
        let reassembly = Arc::new(ParkingReassembly::new(0, 1, |index, _item: ()| {
            Ok::<_, ()>(if index == 1 { Flow::Stop } else { Flow::Continue })
        }));
        std::thread::scope(|scope| {
            let r = Arc::clone(&reassembly);
            // Buffered, then index 4 parks because capacity is one.
            assert_eq!(r.submit(3, ()).unwrap(), Submitted::Buffered);
            let parked = scope.spawn(move || r.submit(4, ()).unwrap());
            assert_eq!(reassembly.submit(0, ()).unwrap(), Submitted::Inserted);
            assert_eq!(reassembly.submit(1, ()).unwrap(), Submitted::Inserted);
            assert_eq!(parked.join().unwrap(), Submitted::Exit);
        });
        assert!(reassembly.is_exiting());
        assert_eq!(reassembly.submit(2, ()).unwrap(), Submitted::Exit);
    }

    #[test]
    fn sink_error_ends_reassembly() {
        let reassembly = ParkingReassembly::new(0, 4, |index, _item: ()| {
            if index == 2 { Err(index) } else { Ok(Flow::Continue) }
        });
        assert_eq!(reassembly.submit(2, ()).unwrap(), Submitted::Buffered);
        assert_eq!(reassembly.submit(1, ()).unwrap(), Submitted::Buffered);
        assert_eq!(reassembly.submit(0, ()), Err(2));
        assert!(reassembly.is_exiting());
        assert_eq!(reassembly.cursor(), 3);
    }
}
