//! Streaming Worker Pool
//!
//! Generic background loader used by the terrain streaming system:
//! - Fixed pool of named OS worker threads
//! - Priority heap ordered by `distance * importance`, then request frame, then submission order
//! - GPU memory accounting against a [`MemoryBudget`]
//! - Cooperative shutdown (flag, notify, join)

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use strata_platform::threading::{join_all, Thread};

use crate::memory::{MemoryBudget, MemoryStats};
use crate::{CoreError, CoreResult};

/// Priority of a load request; lower scores run first
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadPriority {
    /// Distance from the viewer (already LOD-weighted by the caller)
    pub distance: f32,
    /// Multiplier applied to distance
    pub importance: f32,
    /// Frame the request was issued on
    pub request_frame: u64,
}

impl LoadPriority {
    /// Create a priority with unit importance
    pub fn new(distance: f32, request_frame: u64) -> Self {
        Self {
            distance,
            importance: 1.0,
            request_frame,
        }
    }

    /// Ordering score
    pub fn score(&self) -> f32 {
        self.distance * self.importance
    }
}

/// Streaming limits per frame and for GPU memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingBudget {
    /// Hard GPU memory ceiling in bytes
    pub max_gpu_memory: usize,
    /// GPU memory the streamer settles at in bytes
    pub target_gpu_memory: usize,
    /// New load requests issued per update
    pub max_load_requests_per_frame: u32,
    /// Evictions performed per update
    pub max_unloads_per_frame: u32,
}

impl StreamingBudget {
    /// Memory part of the budget
    pub fn memory(&self) -> MemoryBudget {
        MemoryBudget::new(self.max_gpu_memory, self.target_gpu_memory)
    }
}

impl Default for StreamingBudget {
    fn default() -> Self {
        let memory = MemoryBudget::default();
        Self {
            max_gpu_memory: memory.max_bytes,
            target_gpu_memory: memory.target_bytes,
            max_load_requests_per_frame: 8,
            max_unloads_per_frame: 4,
        }
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

struct QueuedWork {
    priority: LoadPriority,
    sequence: u64,
    work: Work,
}

impl PartialEq for QueuedWork {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedWork {}

impl PartialOrd for QueuedWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedWork {
    // BinaryHeap pops the greatest element, so every key is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .score()
            .total_cmp(&self.priority.score())
            .then_with(|| other.priority.request_frame.cmp(&self.priority.request_frame))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedWork>,
    next_sequence: u64,
    running: bool,
    paused: bool,
    active: usize,
}

struct Shared {
    queue: Mutex<QueueState>,
    work_available: Condvar,
    idle: Condvar,
    gpu_memory: MemoryStats,
}

/// Priority-ordered background worker pool
pub struct StreamingManager {
    shared: Arc<Shared>,
    workers: Vec<Thread>,
    budget: StreamingBudget,
}

impl StreamingManager {
    /// Spawn `num_workers` workers named `{name}-{i}`
    pub fn new(name: &str, num_workers: usize, budget: StreamingBudget) -> CoreResult<Self> {
        if num_workers == 0 {
            return Err(CoreError::InvalidConfig(
                "streaming manager needs at least one worker".into(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                running: true,
                ..Default::default()
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            gpu_memory: MemoryStats::new(),
        });

        let mut manager = Self {
            shared,
            workers: Vec::with_capacity(num_workers),
            budget,
        };

        for i in 0..num_workers {
            let shared = manager.shared.clone();
            // On failure `manager` drops here, which stops the workers already spawned.
            let thread = Thread::spawn(format!("{}-{}", name, i), move || worker_loop(&shared))?;
            manager.workers.push(thread);
        }

        log::info!(
            "StreamingManager '{}': {} workers, budget {} / {} MB",
            name,
            num_workers,
            budget.target_gpu_memory / (1024 * 1024),
            budget.max_gpu_memory / (1024 * 1024)
        );

        Ok(manager)
    }

    /// Queue work to run on a worker thread
    pub fn submit_work<F>(&self, work: F, priority: LoadPriority)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            return;
        }
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.heap.push(QueuedWork {
            priority,
            sequence,
            work: Box::new(work),
        });
        drop(queue);
        self.shared.work_available.notify_one();
    }

    /// Work items waiting in the queue
    pub fn pending_work(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Work items currently executing
    pub fn active_work(&self) -> usize {
        self.shared.queue.lock().active
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop workers from picking up new work
    pub fn pause(&self) {
        self.shared.queue.lock().paused = true;
    }

    /// Let workers pick up work again
    pub fn resume(&self) {
        self.shared.queue.lock().paused = false;
        self.shared.work_available.notify_all();
    }

    /// Block until the queue is empty and no work is executing
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while queue.running && (queue.active > 0 || (!queue.heap.is_empty() && !queue.paused)) {
            self.shared.idle.wait(&mut queue);
        }
    }

    /// Current budget
    pub fn budget(&self) -> &StreamingBudget {
        &self.budget
    }

    /// Account GPU memory created for a loaded resource
    pub fn add_gpu_memory(&self, bytes: usize) {
        self.shared.gpu_memory.record_alloc(bytes);
    }

    /// Release accounted GPU memory
    pub fn remove_gpu_memory(&self, bytes: usize) {
        self.shared.gpu_memory.record_dealloc(bytes);
    }

    /// Accounted GPU memory in bytes
    pub fn current_gpu_memory(&self) -> usize {
        self.shared.gpu_memory.current()
    }

    /// Peak accounted GPU memory in bytes
    pub fn peak_gpu_memory(&self) -> usize {
        self.shared.gpu_memory.peak_usage()
    }

    /// Whether accounted memory exceeds the hard maximum
    pub fn is_over_budget(&self) -> bool {
        self.budget.memory().is_over_max(self.current_gpu_memory())
    }

    /// Whether accounted memory exceeds the target
    pub fn is_over_target(&self) -> bool {
        self.budget.memory().is_over_target(self.current_gpu_memory())
    }

    /// Stop and join all workers; queued work is discarded
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.running && self.workers.is_empty() {
                return;
            }
            queue.running = false;
        }
        self.shared.work_available.notify_all();
        self.shared.idle.notify_all();

        join_all(&mut self.workers);

        let discarded = {
            let mut queue = self.shared.queue.lock();
            let n = queue.heap.len();
            queue.heap.clear();
            n
        };
        if discarded > 0 {
            log::debug!("StreamingManager: discarded {} queued work items", discarded);
        }
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let item = {
            let mut queue = shared.queue.lock();
            while queue.running && (queue.heap.is_empty() || queue.paused) {
                shared.work_available.wait(&mut queue);
            }
            if !queue.running {
                return;
            }
            match queue.heap.pop() {
                Some(item) => {
                    queue.active += 1;
                    item
                }
                None => continue,
            }
        };

        (item.work)();

        let mut queue = shared.queue.lock();
        queue.active -= 1;
        if queue.active == 0 && queue.heap.is_empty() {
            shared.idle.notify_all();
        }
    }
}
