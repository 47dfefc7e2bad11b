use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::{PoolKind, PostTaskError, RunLoopError};

type PoolTask<L> = Box<dyn FnOnce(&mut L) + Send + 'static>;

struct PoolShared {
    outstanding: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl PoolShared {
    fn task_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }
}

/// Fixed set of named worker threads draining one task queue.
///
/// Each worker owns a local value of type `L`, built on the worker thread by the init
/// function. Tasks borrow it mutably, which is how thread-affine resources such as a
/// painting GL context live in a pool without being `Send`.
pub struct WorkerPool<L: 'static> {
    name: String,
    kind: PoolKind,
    sender: Option<Sender<PoolTask<L>>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl<L: 'static> WorkerPool<L> {
    pub fn new<F>(
        name: &str,
        kind: PoolKind,
        threads: usize,
        init: F,
    ) -> Result<Self, RunLoopError>
    where
        F: Fn(usize) -> L + Send + Sync + 'static,
    {
        assert!(threads > 0, "worker pool `{name}` needs at least one thread");

        let (sender, receiver) = unbounded::<PoolTask<L>>();
        let shared = Arc::new(PoolShared {
            outstanding: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        });
        let init = Arc::new(init);

        let mut pool = Self {
            name: name.to_owned(),
            kind,
            sender: Some(sender),
            workers: Vec::with_capacity(threads),
            shared,
        };
        for index in 0..threads {
            let receiver = receiver.clone();
            let shared = pool.shared.clone();
            let init = init.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}#{index}"))
                .spawn(move || worker_main(index, &*init, receiver, shared))?;
            pool.workers.push(handle);
        }
        tracing::debug!(pool = %pool.name, ?kind, threads, "worker pool started");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.workers.len()
    }

    /// Tasks queued or running. May be stale by the time the caller looks at it.
    pub fn number_of_tasks(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.number_of_tasks() < self.capacity()
    }

    pub fn post_task<T>(&self, task: T) -> Result<(), PostTaskError>
    where
        T: FnOnce(&mut L) + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return Err(PostTaskError::PoolClosed(self.kind));
        };
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if sender.send(Box::new(task)).is_err() {
            self.shared.task_finished();
            return Err(PostTaskError::PoolClosed(self.kind));
        }
        Ok(())
    }

    /// Blocks until every posted task has returned.
    pub fn wait_until_idle(&self) {
        let mut guard = self.shared.idle_lock.lock();
        while self.shared.outstanding.load(Ordering::Acquire) > 0 {
            self.shared.idle.wait(&mut guard);
        }
    }
}

fn worker_main<L>(
    index: usize,
    init: &(dyn Fn(usize) -> L + Send + Sync),
    receiver: Receiver<PoolTask<L>>,
    shared: Arc<PoolShared>,
) {
    let mut local = init(index);
    for task in receiver.iter() {
        task(&mut local);
        shared.task_finished();
    }
}

impl<L: 'static> Drop for WorkerPool<L> {
    fn drop(&mut self) {
        // Workers exit once the queue is drained and disconnected.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

impl<L: 'static> std::fmt::Debug for WorkerPool<L> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity())
            .field("number_of_tasks", &self.number_of_tasks())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub cpu_threads: usize,
    pub gpu_threads: usize,
}

impl PoolSizes {
    pub const MAX_CPU_THREADS: usize = 8;
    pub const MAX_GPU_THREADS: usize = 4;

    /// Sizes derived from the machine's logical core count.
    pub fn detect(can_use_accelerated_buffers: bool) -> Self {
        Self::for_cores(num_cpus::get(), can_use_accelerated_buffers)
    }

    pub fn for_cores(cores: usize, can_use_accelerated_buffers: bool) -> Self {
        let cpu_threads = (cores / 2).clamp(1, Self::MAX_CPU_THREADS);
        let gpu_threads = match (can_use_accelerated_buffers, cores >= 4) {
            (false, _) => 0,
            (true, true) => 2,
            (true, false) => 1,
        };
        Self {
            cpu_threads,
            gpu_threads,
        }
    }
}

/// Zero, one or two pools for tile replay: a CPU pool with worker state `C` and a GPU pool
/// with worker state `G`.
pub struct WorkerPoolPair<C: 'static, G: 'static> {
    cpu: Option<WorkerPool<C>>,
    gpu: Option<WorkerPool<G>>,
}

impl<C: 'static, G: 'static> WorkerPoolPair<C, G> {
    /// A size of zero leaves that pool out entirely.
    pub fn new<FC, FG>(
        sizes: PoolSizes,
        cpu_init: FC,
        gpu_init: FG,
    ) -> Result<Self, RunLoopError>
    where
        FC: Fn(usize) -> C + Send + Sync + 'static,
        FG: Fn(usize) -> G + Send + Sync + 'static,
    {
        let cpu = match sizes.cpu_threads {
            0 => None,
            threads => Some(WorkerPool::new(
                "CPU Painting Thread",
                PoolKind::Cpu,
                threads,
                cpu_init,
            )?),
        };
        let gpu = match sizes.gpu_threads {
            0 => None,
            threads => Some(WorkerPool::new(
                "GPU Painting Thread",
                PoolKind::Gpu,
                threads,
                gpu_init,
            )?),
        };
        Ok(Self { cpu, gpu })
    }

    pub fn empty() -> Self {
        Self {
            cpu: None,
            gpu: None,
        }
    }

    pub fn has_pool(&self, kind: PoolKind) -> bool {
        match kind {
            PoolKind::Cpu => self.cpu.is_some(),
            PoolKind::Gpu => self.gpu.is_some(),
        }
    }

    pub fn has_any_pool(&self) -> bool {
        self.cpu.is_some() || self.gpu.is_some()
    }

    pub fn capacity(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Cpu => self.cpu.as_ref().map_or(0, WorkerPool::capacity),
            PoolKind::Gpu => self.gpu.as_ref().map_or(0, WorkerPool::capacity),
        }
    }

    pub fn number_of_tasks(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Cpu => self.cpu.as_ref().map_or(0, WorkerPool::number_of_tasks),
            PoolKind::Gpu => self.gpu.as_ref().map_or(0, WorkerPool::number_of_tasks),
        }
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        PoolOccupancy {
            cpu_tasks: self.number_of_tasks(PoolKind::Cpu),
            cpu_capacity: self.capacity(PoolKind::Cpu),
            gpu_tasks: self.number_of_tasks(PoolKind::Gpu),
            gpu_capacity: self.capacity(PoolKind::Gpu),
        }
    }

    pub fn cpu(&self) -> Option<&WorkerPool<C>> {
        self.cpu.as_ref()
    }

    pub fn gpu(&self) -> Option<&WorkerPool<G>> {
        self.gpu.as_ref()
    }

    pub fn post_cpu_task<T>(&self, task: T) -> Result<(), PostTaskError>
    where
        T: FnOnce(&mut C) + Send + 'static,
    {
        self.cpu
            .as_ref()
            .ok_or(PostTaskError::PoolMissing(PoolKind::Cpu))?
            .post_task(task)
    }

    pub fn post_gpu_task<T>(&self, task: T) -> Result<(), PostTaskError>
    where
        T: FnOnce(&mut G) + Send + 'static,
    {
        self.gpu
            .as_ref()
            .ok_or(PostTaskError::PoolMissing(PoolKind::Gpu))?
            .post_task(task)
    }

    pub fn wait_until_idle(&self) {
        if let Some(cpu) = &self.cpu {
            cpu.wait_until_idle();
        }
        if let Some(gpu) = &self.gpu {
            gpu.wait_until_idle();
        }
    }
}

impl<C: 'static, G: 'static> std::fmt::Debug for WorkerPoolPair<C, G> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("WorkerPoolPair")
            .field("cpu", &self.cpu)
            .field("gpu", &self.gpu)
            .finish()
    }
}

/// Point-in-time snapshot of both pools, as read by the painting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolOccupancy {
    pub cpu_tasks: usize,
    pub cpu_capacity: usize,
    pub gpu_tasks: usize,
    pub gpu_capacity: usize,
}

impl PoolOccupancy {
    pub fn cpu_has_spare_capacity(&self) -> bool {
        self.cpu_tasks < self.cpu_capacity
    }

    pub fn gpu_has_spare_capacity(&self) -> bool {
        self.gpu_tasks < self.gpu_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn counts_outstanding_tasks_until_they_return() {
        let pool = WorkerPool::new("test", PoolKind::Cpu, 1, |_| ()).unwrap();
        let (release_sender, release_receiver) = bounded::<()>(0);
        pool.post_task(move |_| {
            release_receiver.recv().unwrap();
        })
        .unwrap();
        pool.post_task(|_| {}).unwrap();

        assert_eq!(pool.number_of_tasks(), 2);
        assert!(!pool.has_spare_capacity());

        release_sender.send(()).unwrap();
        pool.wait_until_idle();
        assert_eq!(pool.number_of_tasks(), 0);
        assert!(pool.has_spare_capacity());
    }

    #[test]
    fn worker_local_state_is_built_on_worker_and_persists() {
        let pool = WorkerPool::new("local", PoolKind::Gpu, 1, |index| {
            (index, std::thread::current().name().map(str::to_owned), 0u32)
        })
        .unwrap();
        let (sender, receiver) = bounded(2);
        for _ in 0..2 {
            let sender = sender.clone();
            pool.post_task(move |local: &mut (usize, Option<String>, u32)| {
                local.2 += 1;
                sender.send((local.0, local.1.clone(), local.2)).unwrap();
            })
            .unwrap();
        }
        let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, (0, Some("local#0".to_owned()), 1));
        assert_eq!(second.2, 2);
    }

    #[test]
    fn default_sizes_follow_core_count() {
        assert_eq!(
            PoolSizes::for_cores(16, true),
            PoolSizes {
                cpu_threads: 8,
                gpu_threads: 2
            }
        );
        assert_eq!(
            PoolSizes::for_cores(32, true).cpu_threads,
            PoolSizes::MAX_CPU_THREADS
        );
        assert_eq!(
            PoolSizes::for_cores(2, true),
            PoolSizes {
                cpu_threads: 1,
                gpu_threads: 1
            }
        );
        assert_eq!(PoolSizes::for_cores(1, false).cpu_threads, 1);
        assert_eq!(PoolSizes::for_cores(8, false).gpu_threads, 0);
    }

    #[test]
    fn missing_pool_is_reported_so_caller_can_run_inline() {
        let pair = WorkerPoolPair::<(), ()>::new(
            PoolSizes {
                cpu_threads: 1,
                gpu_threads: 0,
            },
            |_| (),
            |_| (),
        )
        .unwrap();
        assert!(pair.has_pool(PoolKind::Cpu));
        assert!(!pair.has_pool(PoolKind::Gpu));
        assert_eq!(
            pair.post_gpu_task(|_| {}),
            Err(PostTaskError::PoolMissing(PoolKind::Gpu))
        );
        assert_eq!(pair.capacity(PoolKind::Gpu), 0);
        assert!(pair.post_cpu_task(|_| {}).is_ok());
        pair.wait_until_idle();
    }
}
