//! The parallel work queue behind every parallel pass.
//!
//! Items are dealt round-robin to a fixed set of worker threads at
//! `add_item` time, so a thread processes its items in the order they were
//! dequeued while cross-thread order stays unspecified. Each worker builds
//! its per-thread data exactly once via the data initializer, folds its
//! items through the work function, and the partial outputs are reduced
//! serially once every worker has joined. There is no cancellation: a run
//! either completes or the process aborts.

use std::thread;

/// Default worker count: half the hardware concurrency. The target
/// environment is consistently hyperthreaded, and the physical core count
/// is where throughput tops out.
#[must_use]
pub fn default_num_threads() -> usize {
    let hw = thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
    (hw / 2).max(1)
}

/// A work queue fanning items across worker threads.
///
/// - `work(data, item) -> output` runs on the worker owning `item`;
/// - `reducer(a, b) -> c` must be associative; it folds outputs within each
///   worker and again across workers;
/// - `data_init(thread_index) -> data` runs exactly once per worker.
///
/// Work functions may mutate method bodies of disjoint classes in parallel;
/// mutations of the interning context must stay in single-threaded driver
/// phases.
pub struct WorkQueue<Item, Data, Output, WorkFn, ReduceFn, InitFn>
where
    WorkFn: Fn(&mut Data, Item) -> Output + Sync,
    ReduceFn: Fn(Output, Output) -> Output + Sync,
    InitFn: Fn(usize) -> Data + Sync,
{
    work: WorkFn,
    reducer: ReduceFn,
    data_init: InitFn,
    per_thread_items: Vec<Vec<Item>>,
    insert_idx: usize,
}

impl<Item, Data, Output, WorkFn, ReduceFn, InitFn>
    WorkQueue<Item, Data, Output, WorkFn, ReduceFn, InitFn>
where
    Item: Send,
    Output: Send,
    WorkFn: Fn(&mut Data, Item) -> Output + Sync,
    ReduceFn: Fn(Output, Output) -> Output + Sync,
    InitFn: Fn(usize) -> Data + Sync,
{
    /// Creates a queue with `num_threads` workers (at least one).
    pub fn new(work: WorkFn, reducer: ReduceFn, data_init: InitFn, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        WorkQueue {
            work,
            reducer,
            data_init,
            per_thread_items: (0..num_threads).map(|_| Vec::new()).collect(),
            insert_idx: 0,
        }
    }

    /// Queues an item. Called sequentially, before [`WorkQueue::run_all`].
    pub fn add_item(&mut self, item: Item) {
        let slot = self.insert_idx % self.per_thread_items.len();
        self.per_thread_items[slot].push(item);
        self.insert_idx += 1;
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insert_idx
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insert_idx == 0
    }

    /// Drains the queue across the workers and reduces the results.
    /// Returns `None` when the queue was empty.
    pub fn run_all(&mut self) -> Option<Output> {
        let batches: Vec<Vec<Item>> = self
            .per_thread_items
            .iter_mut()
            .map(std::mem::take)
            .collect();
        self.insert_idx = 0;

        let work = &self.work;
        let reducer = &self.reducer;
        let data_init = &self.data_init;

        let partials: Vec<Option<Output>> = thread::scope(|scope| {
            let handles: Vec<_> = batches
                .into_iter()
                .enumerate()
                .map(|(thread_idx, items)| {
                    scope.spawn(move || {
                        let mut data = data_init(thread_idx);
                        let mut acc: Option<Output> = None;
                        for item in items {
                            let out = work(&mut data, item);
                            acc = Some(match acc {
                                None => out,
                                Some(prev) => reducer(prev, out),
                            });
                        }
                        acc
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect()
        });

        // The workers are done; fold their partial outputs serially.
        partials.into_iter().flatten().reduce(|a, b| (self.reducer)(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sums_across_threads() {
        let mut queue = WorkQueue::new(
            |_data: &mut (), item: u64| item,
            |a, b| a + b,
            |_| (),
            4,
        );
        for i in 1..=100 {
            queue.add_item(i);
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.run_all(), Some(5050));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = WorkQueue::new(
            |_: &mut (), item: u64| item,
            |a, b| a + b,
            |_| (),
            2,
        );
        assert_eq!(queue.run_all(), None);
    }

    #[test]
    fn test_data_initializer_runs_once_per_thread() {
        static INITS: AtomicUsize = AtomicUsize::new(0);
        let mut queue = WorkQueue::new(
            |data: &mut usize, _item: u32| *data,
            |a, b| a.max(b),
            |idx| {
                INITS.fetch_add(1, Ordering::SeqCst);
                idx
            },
            3,
        );
        for i in 0..30 {
            queue.add_item(i);
        }
        let max_thread = queue.run_all().unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 3);
        assert!(max_thread < 3);
    }

    #[test]
    fn test_per_thread_order_is_dequeue_order() {
        // One thread: the fold must see items in insertion order.
        let mut queue = WorkQueue::new(
            |_: &mut (), item: u32| vec![item],
            |mut a: Vec<u32>, b| {
                a.extend(b);
                a
            },
            |_| (),
            1,
        );
        for i in 0..10 {
            queue.add_item(i);
        }
        assert_eq!(queue.run_all().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
