// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Delayed kernel delivery for the local pipeline. Discovery re-arms
//! itself with timer kernels, so the pool owns one thread holding a
//! min-heap of due times.

use crate::Job;
use crossbeam_channel::Sender;
use kernel::KernelPtr;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Entry {
    due: Instant,
    seq: u64,
    kernel: KernelPtr,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // reversed: BinaryHeap is a max-heap, we want the earliest due
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
    stopped: AtomicBool,
    seq: AtomicU64,
}

pub(crate) struct Timer {
    shared: Arc<Shared>,
    tx: Sender<Job>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn new(tx: Sender<Job>) -> Self {
        Self {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                cv: Condvar::new(),
                stopped: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
            tx,
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, name: &str) {
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || run(&shared, &tx))
            .expect("failed to spawn timer thread");
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn schedule(&self, delay: Duration, kernel: KernelPtr) {
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            kernel,
        };
        self.shared.heap.lock().push(entry);
        self.shared.cv.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: &Arc<Shared>, tx: &Sender<Job>) {
    let mut heap = shared.heap.lock();
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            heap.clear();
            return;
        }
        let now = Instant::now();
        match heap.peek().map(|e| e.due) {
            Some(due) if due <= now => {
                let entry = heap.pop().unwrap_or_else(|| unreachable!("peeked"));
                drop(heap);
                let _ = tx.send(Job::Kernel(entry.kernel));
                heap = shared.heap.lock();
            }
            Some(due) => {
                let _ = shared.cv.wait_for(&mut heap, due - now);
            }
            None => shared.cv.wait(&mut heap),
        }
    }
}
