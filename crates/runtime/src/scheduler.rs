//! Cooperative task executor.
//!
//! Single-threaded: tasks are poll functions driven through the dispatcher.
//! A poll step ends at `async_return` (done) or `async_yield`; the step is
//! *parked* when an intrinsic set the pending-park slot during it, otherwise
//! the task is immediately re-scheduled. External events (channel activity,
//! timer fire, blocking-job completion, socket readiness) wake every task
//! filed under the event's key.
//!
//! Cancellation is cooperative: `cancel` flips a flag and wakes the task;
//! the flag is observed at checkpoints and channel/I-O waits, which convert
//! the resumption into a `Cancelled` outcome, unwinding the poll frame so
//! the task's locals release.

use crate::error::{PanicKind, Unwind, VmResult, err};
use crate::heap::Heap;
use crate::interp::{FrameResult, Vm};
use crate::pool::{BlockingOutcome, BlockingPool};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};
use volt_core::FuncId;

/// Symbolic key a task parks under; many tasks may share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeKey {
    ChanSend(u64),
    ChanRecv(u64),
    NetAccept(i64),
    NetRead(i64),
    NetWrite(i64),
    Timer(u64),
    TaskDone(u64),
}

#[derive(Debug)]
pub enum TaskBody {
    /// A lowered poll function; the scheduler treats its state opaquely.
    Poll { func: FuncId },
    /// Runs on the blocking pool; completion arrives over the completion
    /// channel.
    Blocking,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Success(Value),
    Cancelled,
}

#[derive(Debug)]
pub struct Task {
    pub id: u64,
    pub body: TaskBody,
    /// Opaque state value threaded through polls.
    pub state: Value,
    /// Value delivered at the next resume (await result, received element).
    pub resume: Value,
    pub cancelled: bool,
    pub park: Option<WakeKey>,
    pub outcome: Option<TaskOutcome>,
    pub polling: bool,
}

impl Task {
    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Scheduler lifetime counters, surfaced through diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecStats {
    pub spawned: u64,
    pub completed: u64,
    pub polls: u64,
    pub wakes: u64,
    pub peak_live: u64,
}

#[derive(Default)]
pub struct Executor {
    tasks: FxHashMap<u64, Task>,
    ready: VecDeque<u64>,
    parked: FxHashMap<WakeKey, Vec<u64>>,
    timers: BinaryHeap<Reverse<(u64, u64)>>,
    scopes: Vec<Scope>,
    next_id: u64,
    pub stats: ExecStats,
}

/// Structured-concurrency scope: children cannot outlive it.
#[derive(Debug, Default)]
pub struct Scope {
    pub children: Vec<u64>,
    pub closed: bool,
}

impl Executor {
    pub fn new() -> Self {
        Executor::default()
    }

    pub fn create_task(&mut self, body: TaskBody, state: Value) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(
            id,
            Task {
                id,
                body,
                state,
                resume: Value::invalid(),
                cancelled: false,
                park: None,
                outcome: None,
                polling: false,
            },
        );
        self.stats.spawned += 1;
        let live = self.tasks.values().filter(|t| !t.is_done()).count() as u64;
        self.stats.peak_live = self.stats.peak_live.max(live);
        if matches!(self.tasks[&id].body, TaskBody::Poll { .. }) {
            self.ready.push_back(id);
        }
        debug!(task = id, "task created");
        id
    }

    pub fn task(&self, id: u64) -> Result<&Task, crate::error::VmError> {
        self.tasks
            .get(&id)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid task {id}")))
    }

    pub fn task_mut(&mut self, id: u64) -> Result<&mut Task, crate::error::VmError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid task {id}")))
    }

    pub fn park(&mut self, id: u64, key: WakeKey) {
        trace!(task = id, ?key, "park");
        if let Some(task) = self.tasks.get_mut(&id) {
            task.park = Some(key);
        }
        self.parked.entry(key).or_default().push(id);
    }

    fn unpark(&mut self, id: u64) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        let Some(key) = task.park.take() else {
            return false;
        };
        if let Some(list) = self.parked.get_mut(&key) {
            list.retain(|t| *t != id);
        }
        self.ready.push_back(id);
        self.stats.wakes += 1;
        true
    }

    /// Wake one task parked under `key`; returns whether one was found.
    pub fn wake_one(&mut self, key: WakeKey) -> bool {
        let Some(id) = self.parked.get(&key).and_then(|l| l.first().copied()) else {
            return false;
        };
        trace!(task = id, ?key, "wake");
        self.unpark(id)
    }

    /// Wake every task parked under `key`.
    pub fn wake_all(&mut self, key: WakeKey) -> usize {
        let ids = self.parked.get(&key).cloned().unwrap_or_default();
        let mut woken = 0;
        for id in ids {
            if self.unpark(id) {
                woken += 1;
            }
        }
        woken
    }

    /// Wake a specific task wherever it is parked (cancel, timer fire).
    pub fn wake_task(&mut self, id: u64) -> bool {
        self.unpark(id)
    }

    pub fn parked_count(&self, key: WakeKey) -> usize {
        self.parked.get(&key).map_or(0, |l| l.len())
    }

    pub fn pop_ready(&mut self) -> Option<u64> {
        while let Some(id) = self.ready.pop_front() {
            match self.tasks.get(&id) {
                Some(t) if !t.is_done() && !t.polling && t.park.is_none() => return Some(id),
                _ => {}
            }
        }
        None
    }

    pub fn add_timer(&mut self, deadline: u64, task: u64) {
        self.timers.push(Reverse((deadline, task)));
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.peek().map(|Reverse((d, _))| *d)
    }

    /// Pop timers at or before `now`, returning the tasks to wake.
    pub fn pop_due_timers(&mut self, now: u64) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, task))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            due.push(task);
        }
        due
    }

    pub fn live_task_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_done()).count()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ---- scopes ----

    pub fn scope_enter(&mut self) -> u64 {
        self.scopes.push(Scope::default());
        self.scopes.len() as u64
    }

    pub fn scope_mut(&mut self, id: u64) -> Result<&mut Scope, crate::error::VmError> {
        self.scopes
            .get_mut(id as usize - 1)
            .filter(|s| !s.closed)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid scope {id}")))
    }

    pub fn scope_children(&self, id: u64) -> Result<Vec<u64>, crate::error::VmError> {
        self.scopes
            .get(id as usize - 1)
            .map(|s| s.children.clone())
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid scope {id}")))
    }

    /// Shutdown: release values still held by task states, resumes, and
    /// results.
    pub fn release_residue(&mut self, heap: &mut Heap) {
        for task in self.tasks.values_mut() {
            let state = std::mem::replace(&mut task.state, Value::invalid());
            let resume = std::mem::replace(&mut task.resume, Value::invalid());
            let _ = heap.release_value(&state);
            let _ = heap.release_value(&resume);
            if let Some(TaskOutcome::Success(v)) = task.outcome.take() {
                let _ = heap.release_value(&v);
            }
        }
    }
}

impl Vm {
    /// Spawn a poll-function task with its initial state.
    pub(crate) fn spawn_poll_task(&mut self, func: FuncId, state: Value) -> u64 {
        self.exec.create_task(TaskBody::Poll { func }, state)
    }

    /// Spawn a computation on the blocking pool; its completion wakes the
    /// returned task id.
    pub(crate) fn spawn_blocking_job(
        &mut self,
        job: impl FnOnce() -> BlockingOutcome + Send + 'static,
    ) -> u64 {
        let id = self.exec.create_task(TaskBody::Blocking, Value::invalid());
        if self.pool.is_none() {
            self.pool = Some(BlockingPool::new(self.config.blocking_threads));
        }
        self.pool
            .as_mut()
            .expect("pool created above")
            .submit(id, job);
        id
    }

    /// Park the current task under `key`; the enclosing poll step must end
    /// with `async_yield` for the park to take effect.
    pub(crate) fn park_current(&mut self, key: WakeKey) -> VmResult<()> {
        let Some(_) = self.current_task else {
            return Err(err(
                PanicKind::AsyncBackendMissing,
                "park outside a task context",
            )
            .into());
        };
        self.pending_park = Some(key);
        Ok(())
    }

    /// Cancellation observation point.
    pub(crate) fn checkpoint(&mut self) -> VmResult<()> {
        if let Some(tid) = self.current_task {
            if self.exec.task(tid)?.cancelled {
                debug!(task = tid, "cancellation observed at checkpoint");
                return Err(Unwind::Cancelled);
            }
        }
        Ok(())
    }

    /// Whether the last channel/io intrinsic parked the current task. The
    /// lowered retry loop branches on this before yielding.
    pub(crate) fn task_parked(&self) -> bool {
        self.pending_park.is_some()
    }

    /// Run one poll step of `tid`.
    pub(crate) fn poll_task(&mut self, tid: u64) -> VmResult<()> {
        let (func, state, resume) = {
            let task = self.exec.task_mut(tid)?;
            if task.is_done() {
                return Ok(());
            }
            let TaskBody::Poll { func } = &task.body else {
                return Ok(());
            };
            let func = *func;
            task.polling = true;
            (
                func,
                std::mem::replace(&mut task.state, Value::invalid()),
                std::mem::replace(&mut task.resume, Value::invalid()),
            )
        };
        // Cancelled while parked on nothing observable: let the poll run;
        // the flag is observed at the next checkpoint inside.
        self.exec.stats.polls += 1;
        let floor = self.frames.len();
        let prev_task = self.current_task.replace(tid);
        let prev_park = self.pending_park.take();
        let resume = if matches!(resume.kind, crate::value::ValueKind::Invalid) {
            Value::unit(self.types.unit())
        } else {
            resume
        };
        trace!(task = tid, "poll");
        let result = self
            .push_frame(func, vec![state, resume], None)
            .and_then(|()| self.run_frames_until(floor));
        let park = self.pending_park.take();
        self.current_task = prev_task;
        self.pending_park = prev_park;
        self.exec.task_mut(tid)?.polling = false;
        match result {
            Ok(FrameResult::Done(v)) => {
                self.complete_task(tid, TaskOutcome::Success(v));
                Ok(())
            }
            Ok(FrameResult::Yield(state)) => {
                self.exec.task_mut(tid)?.state = state;
                match park {
                    Some(key) => self.exec.park(tid, key),
                    None => self.exec.ready_push(tid),
                }
                Ok(())
            }
            Err(Unwind::Cancelled) => {
                self.unwind_to(floor);
                self.complete_task(tid, TaskOutcome::Cancelled);
                Ok(())
            }
            Err(e) => {
                self.unwind_to(floor);
                Err(e)
            }
        }
    }

    pub(crate) fn complete_task(&mut self, tid: u64, outcome: TaskOutcome) {
        debug!(task = tid, cancelled = matches!(outcome, TaskOutcome::Cancelled), "task done");
        if let Ok(task) = self.exec.task_mut(tid) {
            task.outcome = Some(outcome);
        }
        self.exec.stats.completed += 1;
        self.exec.wake_all(WakeKey::TaskDone(tid));
    }

    /// One unit of executor work: drain completions, fire timers, poll one
    /// ready task. Returns whether anything happened.
    pub(crate) fn executor_progress(&mut self) -> VmResult<bool> {
        let mut progressed = self.drain_completions()? > 0;
        let now = self.host.monotonic_now();
        for tid in self.exec.pop_due_timers(now) {
            progressed |= self.exec.wake_task(tid);
        }
        if let Some(tid) = self.exec.pop_ready() {
            self.poll_task(tid)?;
            return Ok(true);
        }
        Ok(progressed)
    }

    /// Make progress or wait for an external event; panics with `deadlock`
    /// when nothing can ever arrive. `limit` bounds the wait for callers
    /// with their own deadline.
    pub(crate) fn idle_wait(&mut self, limit: Option<u64>) -> VmResult<()> {
        let next_timer = self.exec.next_deadline();
        let deadline = match (next_timer, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let outstanding = self.pool.as_ref().is_some_and(|p| p.outstanding > 0);
        if outstanding {
            let timeout = deadline.map(|d| {
                let now = self.host.monotonic_now();
                Duration::from_nanos(d.saturating_sub(now).max(1))
            });
            if let Some(pool) = self.pool.as_mut() {
                if let Some((tid, outcome)) = pool.wait_one(timeout) {
                    self.finish_blocking(tid, outcome)?;
                    return Ok(());
                }
            }
            if let Some(d) = deadline {
                self.host.wait_until(d);
            }
            return Ok(());
        }
        match deadline {
            Some(d) => {
                self.host.wait_until(d);
                Ok(())
            }
            None => Err(err(
                PanicKind::Deadlock,
                "all tasks are blocked and no external event is pending",
            )
            .into()),
        }
    }

    /// One blocking pump: progress if possible, otherwise wait.
    pub(crate) fn drive_one(&mut self) -> VmResult<()> {
        if self.executor_progress()? {
            return Ok(());
        }
        self.idle_wait(None)
    }

    fn drain_completions(&mut self) -> VmResult<usize> {
        let Some(pool) = self.pool.as_mut() else {
            return Ok(0);
        };
        let done = pool.try_drain();
        let n = done.len();
        for (tid, outcome) in done {
            self.finish_blocking(tid, outcome)?;
        }
        Ok(n)
    }

    fn finish_blocking(&mut self, tid: u64, outcome: BlockingOutcome) -> VmResult<()> {
        let cancelled = self.exec.task(tid)?.cancelled;
        let outcome = if cancelled {
            TaskOutcome::Cancelled
        } else {
            let v = match outcome {
                BlockingOutcome::Unit => Value::unit(self.types.unit()),
                BlockingOutcome::Int(n) => Value::int(n, self.types.int64()),
                BlockingOutcome::Err(msg) => {
                    let unit = self.types.unit();
                    self.erring_error_value(unit, crate::error::OsCode::Io, &msg)?
                }
            };
            TaskOutcome::Success(v)
        };
        self.complete_task(tid, outcome);
        Ok(())
    }

    /// Block until `tid` completes and deliver its outcome as an
    /// `Outcome<T>` tag value. Awaiting is repeatable: the stored result is
    /// cloned for share each time.
    pub(crate) fn await_task(&mut self, tid: u64) -> VmResult<Value> {
        if self.current_task == Some(tid) {
            return Err(err(PanicKind::Deadlock, format!("task {tid} awaiting itself")).into());
        }
        loop {
            if self.exec.task(tid)?.is_done() {
                break;
            }
            self.drive_one()?;
        }
        self.task_outcome_value(tid)
    }

    /// Clone the stored outcome of a finished task into an `Outcome<T>` tag.
    pub(crate) fn task_outcome_value(&mut self, tid: u64) -> VmResult<Value> {
        let success = match self.exec.task(tid)?.outcome.as_ref() {
            Some(TaskOutcome::Success(v)) => Some(v.clone()),
            Some(TaskOutcome::Cancelled) => None,
            None => {
                return Err(err(
                    PanicKind::Unimplemented,
                    format!("task {tid} has no outcome yet"),
                )
                .into());
            }
        };
        match success {
            Some(v) => {
                self.heap.retain_value(&v)?;
                self.outcome_success(v)
            }
            None => self.outcome_cancelled(),
        }
    }

    /// Cooperative cancel: flips the flag and wakes the task so the flag is
    /// observed at its next safe point. No-op on completed tasks.
    pub(crate) fn cancel_task(&mut self, tid: u64) -> VmResult<()> {
        let task = self.exec.task_mut(tid)?;
        if task.is_done() || task.cancelled {
            return Ok(());
        }
        task.cancelled = true;
        debug!(task = tid, "cancel requested");
        self.exec.wake_task(tid);
        Ok(())
    }

    /// Run `tid` against a timer: cancels it when the deadline passes first,
    /// then returns its (joined) outcome.
    pub(crate) fn timeout_task(&mut self, tid: u64, ms: u64) -> VmResult<Value> {
        let deadline = self.host.monotonic_now() + ms * 1_000_000;
        loop {
            if self.exec.task(tid)?.is_done() {
                return self.task_outcome_value(tid);
            }
            if self.host.monotonic_now() >= deadline {
                self.cancel_task(tid)?;
                return self.await_task(tid);
            }
            if !self.executor_progress()? {
                self.idle_wait(Some(deadline))?;
            }
        }
    }

    /// Sleep: parks on a timer inside a task, drives the executor while
    /// waiting in the synchronous context.
    pub(crate) fn sleep_ms(&mut self, ms: u64) -> VmResult<()> {
        let deadline = self.host.monotonic_now() + ms * 1_000_000;
        if let Some(tid) = self.current_task {
            self.checkpoint()?;
            self.exec.add_timer(deadline, tid);
            self.park_current(WakeKey::Timer(deadline))?;
            return Ok(());
        }
        loop {
            if self.host.monotonic_now() >= deadline {
                return Ok(());
            }
            if !self.executor_progress()? {
                self.idle_wait(Some(deadline))?;
            }
        }
    }

    // ---- structured scopes ----

    pub(crate) fn scope_register_child(&mut self, scope: u64, task: u64) -> VmResult<()> {
        self.exec.scope_mut(scope)?.children.push(task);
        Ok(())
    }

    pub(crate) fn scope_cancel_all(&mut self, scope: u64) -> VmResult<()> {
        for child in self.exec.scope_children(scope)? {
            self.cancel_task(child)?;
        }
        Ok(())
    }

    /// Await every child; outcome values are discarded.
    pub(crate) fn scope_join_all(&mut self, scope: u64) -> VmResult<()> {
        for child in self.exec.scope_children(scope)? {
            let outcome = self.await_task(child)?;
            self.release_owned(outcome)?;
        }
        Ok(())
    }

    /// Finalize: children cannot outlive the scope, so stragglers are
    /// cancelled and joined before it closes.
    pub(crate) fn scope_exit(&mut self, scope: u64) -> VmResult<()> {
        self.scope_cancel_all(scope)?;
        self.scope_join_all(scope)?;
        self.exec.scope_mut(scope)?.closed = true;
        Ok(())
    }
}

impl Executor {
    /// Re-schedule a yielded task.
    pub fn ready_push(&mut self, id: u64) {
        self.ready.push_back(id);
    }
}

// ---------------------------------------------------------------------------
// Intrinsic handlers
// ---------------------------------------------------------------------------

use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::value::ValueKind;

/// `__task_create(f, state?)`: spawn a poll-function task.
pub(crate) fn task_create(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let mut args = ctx.args;
    if args.is_empty() || args.len() > 2 {
        let got = args.len();
        for v in &args {
            let _ = vm.heap.release_value(v);
        }
        return Err(err(
            PanicKind::TypeMismatch,
            format!("__task_create expects 1 or 2 arguments, got {got}"),
        )
        .into());
    }
    let state = if args.len() == 2 {
        args.pop().expect("length checked")
    } else {
        Value::unit(vm.types.unit())
    };
    let func_v = args.pop().expect("length checked");
    let ValueKind::Func(func) = func_v.kind else {
        let msg = format!("__task_create: expected function, got {}", func_v.kind_name());
        let _ = vm.heap.release_value(&state);
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    let tid = vm.spawn_poll_task(func, state);
    let ty = vm.types.task_of(volt_core::TypeId::UNKNOWN);
    Ok(Value::int(tid as i64, ty))
}

/// `__task_state`: "ready" | "running" | "parked" | "done" | "cancelled".
pub(crate) fn task_state(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [t] = expect_args::<1>(vm, "__task_state", ctx.args)?;
    let tid = vm.task_id_of(&t)?;
    let task = vm.exec.task(tid)?;
    let state = if task.is_done() {
        "done"
    } else if task.cancelled {
        "cancelled"
    } else if task.polling {
        "running"
    } else if task.park.is_some() {
        "parked"
    } else {
        "ready"
    };
    let str_ty = vm.types.str_();
    let h = crate::rope::flat(&mut vm.heap, str_ty, state.to_string());
    Ok(Value::new(str_ty, ValueKind::Str(h)))
}

/// `clone`: task handles copy freely; heap values clone-for-share.
pub(crate) fn task_clone(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "clone", ctx.args)?;
    vm.heap.retain_value(&v)?;
    let clone = v.clone();
    vm.release_owned(v)?;
    Ok(clone)
}

pub(crate) fn task_cancel(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [t] = expect_args::<1>(vm, "cancel", ctx.args)?;
    let tid = vm.task_id_of(&t)?;
    vm.cancel_task(tid)?;
    Ok(Value::unit(vm.types.unit()))
}

/// `rt_task_parked`: whether the last channel/io intrinsic parked the
/// current task; the lowered retry loop yields when this is true.
pub(crate) fn task_parked(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_task_parked", ctx.args)?;
    Ok(Value::bool_(vm.task_parked(), vm.types.bool_()))
}

pub(crate) fn scope_enter(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_scope_enter", ctx.args)?;
    let id = vm.exec.scope_enter();
    Ok(Value::int(id as i64, vm.types.int64()))
}

pub(crate) fn scope_register_child(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [scope, task] = expect_args::<2>(vm, "rt_scope_register_child", ctx.args)?;
    let scope = arg_int(vm, "rt_scope_register_child", &scope)?;
    let tid = vm.task_id_of(&task)?;
    vm.scope_register_child(scope as u64, tid)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn scope_cancel_all(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [scope] = expect_args::<1>(vm, "rt_scope_cancel_all", ctx.args)?;
    let scope = arg_int(vm, "rt_scope_cancel_all", &scope)?;
    vm.scope_cancel_all(scope as u64)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn scope_join_all(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [scope] = expect_args::<1>(vm, "rt_scope_join_all", ctx.args)?;
    let scope = arg_int(vm, "rt_scope_join_all", &scope)?;
    vm.scope_join_all(scope as u64)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn scope_exit(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [scope] = expect_args::<1>(vm, "rt_scope_exit", ctx.args)?;
    let scope = arg_int(vm, "rt_scope_exit", &scope)?;
    vm.scope_exit(scope as u64)?;
    Ok(Value::unit(vm.types.unit()))
}
