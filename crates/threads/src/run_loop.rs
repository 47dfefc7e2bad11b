use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, unbounded};
use frame_scheduler::{CycleOutcome, FrameScheduler, ScheduleOutcome, SchedulerState};
use parking_lot::Mutex;

use crate::RunLoopError;

type LoopTask<S> = Box<dyn FnOnce(&mut S, &RunLoopHandle) + Send + 'static>;

struct LoopShared {
    scheduler: Mutex<FrameScheduler>,
    exiting: AtomicBool,
    thread_id: OnceLock<ThreadId>,
}

/// Cheap, cloneable access to the loop's scheduler from any thread.
#[derive(Clone)]
pub struct RunLoopHandle {
    shared: Arc<LoopShared>,
    wake: Sender<()>,
}

impl RunLoopHandle {
    pub fn schedule_update(&self) -> ScheduleOutcome {
        let outcome = self.shared.scheduler.lock().schedule_update();
        if outcome == ScheduleOutcome::WakeCompositor {
            self.wake();
        }
        outcome
    }

    pub fn suspend(&self) {
        self.shared.scheduler.lock().suspend();
    }

    pub fn resume(&self) {
        if self.shared.scheduler.lock().resume() {
            self.wake();
        }
    }

    pub fn stop_updates(&self) {
        self.shared.scheduler.lock().stop_updates();
    }

    pub fn is_active(&self) -> bool {
        self.shared.scheduler.lock().is_active()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.scheduler.lock().state()
    }

    pub fn completed_cycles(&self) -> u64 {
        self.shared.scheduler.lock().completed_cycles()
    }

    pub fn is_current(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    fn wake(&self) {
        match self.wake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("wake after compositing run loop exited");
            }
        }
    }
}

impl std::fmt::Debug for RunLoopHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RunLoopHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Dedicated thread that owns the compositing state `S` and runs update cycles on it.
///
/// `S` is created on the loop thread and never leaves it, so it may hold thread-bound
/// resources. Other threads reach it only through posted tasks.
pub struct CompositingRunLoop<S: 'static> {
    handle: RunLoopHandle,
    tasks: Option<Sender<LoopTask<S>>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: 'static> CompositingRunLoop<S> {
    pub fn spawn<I, U>(name: &str, init: I, update: U) -> Result<Self, RunLoopError>
    where
        I: FnOnce(&RunLoopHandle) -> S + Send + 'static,
        U: FnMut(&mut S, &RunLoopHandle) + Send + 'static,
    {
        let (wake_sender, wake_receiver) = bounded(1);
        let (task_sender, task_receiver) = unbounded::<LoopTask<S>>();
        let handle = RunLoopHandle {
            shared: Arc::new(LoopShared {
                scheduler: Mutex::new(FrameScheduler::new()),
                exiting: AtomicBool::new(false),
                thread_id: OnceLock::new(),
            }),
            wake: wake_sender,
        };

        let loop_handle = handle.clone();
        let thread = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let _ = loop_handle.shared.thread_id.set(thread::current().id());
            let state = init(&loop_handle);
            loop_main(state, update, loop_handle, task_receiver, wake_receiver);
        })?;
        tracing::debug!(name, "compositing run loop started");

        Ok(Self {
            handle,
            tasks: Some(task_sender),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &RunLoopHandle {
        &self.handle
    }

    pub fn is_current(&self) -> bool {
        self.handle.is_current()
    }

    pub fn schedule_update(&self) -> ScheduleOutcome {
        self.handle.schedule_update()
    }

    pub fn suspend(&self) {
        self.handle.suspend();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn stop_updates(&self) {
        self.handle.stop_updates();
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Queues `task` on the loop thread and returns immediately.
    pub fn perform_task<T>(&self, task: T) -> Result<(), RunLoopError>
    where
        T: FnOnce(&mut S, &RunLoopHandle) + Send + 'static,
    {
        let tasks = self.tasks.as_ref().ok_or(RunLoopError::Stopped)?;
        tasks.send(Box::new(task)).map_err(|_| RunLoopError::Stopped)
    }

    /// Runs `task` on the loop thread and blocks until it has returned.
    pub fn perform_task_sync<T, R>(&self, task: T) -> Result<R, RunLoopError>
    where
        T: FnOnce(&mut S, &RunLoopHandle) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            debug_assert!(false, "perform_task_sync called from the compositing thread");
            return Err(RunLoopError::Reentrant);
        }
        let (reply_sender, reply_receiver) = bounded(1);
        self.perform_task(move |state, handle| {
            let _ = reply_sender.send(task(state, handle));
        })?;
        reply_receiver.recv().map_err(|_| RunLoopError::Stopped)
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.stop_updates();
        self.handle.shared.exiting.store(true, Ordering::Release);
        self.tasks.take();
        self.handle.wake();
        if thread.join().is_err() {
            tracing::error!("compositing thread panicked");
        }
    }
}

fn loop_main<S, U>(
    mut state: S,
    mut update: U,
    handle: RunLoopHandle,
    tasks: Receiver<LoopTask<S>>,
    wake: Receiver<()>,
) where
    U: FnMut(&mut S, &RunLoopHandle),
{
    loop {
        select! {
            recv(tasks) -> task => match task {
                Ok(task) => task(&mut state, &handle),
                Err(_) => break,
            },
            recv(wake) -> _ => {}
        }
        if handle.shared.exiting.load(Ordering::Acquire) {
            break;
        }
        run_scheduled_update(&mut state, &mut update, &handle);
    }

    // Tasks queued before shutdown still run, in order, before `S` is dropped here.
    for task in tasks.try_iter() {
        task(&mut state, &handle);
    }
    tracing::debug!("compositing run loop exited");
}

fn run_scheduled_update<S, U>(state: &mut S, update: &mut U, handle: &RunLoopHandle)
where
    U: FnMut(&mut S, &RunLoopHandle),
{
    if !handle.shared.scheduler.lock().begin_update() {
        return;
    }
    update(state, handle);
    let outcome = handle.shared.scheduler.lock().update_completed();
    if outcome == CycleOutcome::Rescheduled {
        // Go around the loop once so queued tasks interleave with back-to-back cycles.
        handle.wake();
    }
}

impl<S: 'static> Drop for CompositingRunLoop<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: 'static> std::fmt::Debug for CompositingRunLoop<S> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CompositingRunLoop")
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn state_is_built_and_used_on_the_loop_thread() {
        // `Rc` is not `Send`; the loop must never move it across threads.
        let run_loop = CompositingRunLoop::spawn(
            "test-compositor",
            |_| Rc::new(Cell::new(0u32)),
            |state: &mut Rc<Cell<u32>>, _| state.set(state.get() + 1),
        )
        .unwrap();

        let on_loop = run_loop
            .perform_task_sync(|_, handle| handle.is_current())
            .unwrap();
        assert!(on_loop);
        assert!(!run_loop.is_current());
    }

    #[test]
    fn scheduled_update_runs_one_cycle_and_goes_idle() {
        let (cycle_sender, cycle_receiver) = bounded(8);
        let run_loop = CompositingRunLoop::spawn(
            "cycles",
            |_| 0u32,
            move |count: &mut u32, _| {
                *count += 1;
                cycle_sender.send(*count).unwrap();
            },
        )
        .unwrap();

        assert_eq!(run_loop.schedule_update(), ScheduleOutcome::WakeCompositor);
        assert_eq!(cycle_receiver.recv_timeout(Duration::from_secs(5)), Ok(1));
        let cycles = run_loop.perform_task_sync(|count, _| *count).unwrap();
        assert_eq!(cycles, 1);
        assert!(!run_loop.is_active());
    }

    #[test]
    fn requests_during_a_cycle_collapse_into_one_more() {
        let (entered_sender, entered_receiver) = bounded(8);
        let (release_sender, release_receiver) = bounded::<()>(8);
        let run_loop = CompositingRunLoop::spawn(
            "coalesce",
            |_| 0u32,
            move |count: &mut u32, _| {
                *count += 1;
                entered_sender.send(*count).unwrap();
                release_receiver.recv().unwrap();
            },
        )
        .unwrap();

        run_loop.schedule_update();
        assert_eq!(entered_receiver.recv_timeout(Duration::from_secs(5)), Ok(1));
        for _ in 0..3 {
            assert_eq!(run_loop.schedule_update(), ScheduleOutcome::Coalesced);
        }
        release_sender.send(()).unwrap();
        assert_eq!(entered_receiver.recv_timeout(Duration::from_secs(5)), Ok(2));
        release_sender.send(()).unwrap();

        let cycles = run_loop.perform_task_sync(|count, _| *count).unwrap();
        assert_eq!(cycles, 2);
        assert!(
            entered_receiver
                .recv_timeout(Duration::from_millis(50))
                .is_err()
        );
        assert_eq!(run_loop.handle().completed_cycles(), 2);
    }

    #[test]
    fn suspended_loop_runs_deferred_update_after_resume() {
        let (cycle_sender, cycle_receiver) = bounded(8);
        let run_loop = CompositingRunLoop::spawn(
            "suspend",
            |_| (),
            move |_: &mut (), _| cycle_sender.send(()).unwrap(),
        )
        .unwrap();

        run_loop.suspend();
        run_loop.suspend();
        assert_eq!(run_loop.schedule_update(), ScheduleOutcome::Deferred);
        run_loop.resume();
        assert!(cycle_receiver.recv_timeout(Duration::from_millis(50)).is_err());
        run_loop.resume();
        assert!(cycle_receiver.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn update_can_reschedule_itself() {
        let (cycle_sender, cycle_receiver) = bounded(8);
        let run_loop = CompositingRunLoop::spawn(
            "animate",
            |_| 0u32,
            move |frames: &mut u32, handle: &RunLoopHandle| {
                *frames += 1;
                cycle_sender.send(*frames).unwrap();
                if *frames < 3 {
                    handle.schedule_update();
                }
            },
        )
        .unwrap();

        run_loop.schedule_update();
        for expected in 1..=3 {
            assert_eq!(
                cycle_receiver.recv_timeout(Duration::from_secs(5)),
                Ok(expected)
            );
        }
    }

    #[test]
    fn queued_tasks_run_before_state_drops() {
        struct DropFlag(Sender<&'static str>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                let _ = self.0.send("dropped");
            }
        }

        let (sender, receiver) = unbounded();
        let task_sender = sender.clone();
        let run_loop =
            CompositingRunLoop::spawn("teardown", move |_| DropFlag(sender), |_, _| {}).unwrap();
        run_loop
            .perform_task(move |_, _| task_sender.send("task").unwrap())
            .unwrap();
        drop(run_loop);

        assert_eq!(receiver.recv(), Ok("task"));
        assert_eq!(receiver.recv(), Ok("dropped"));
    }
}
