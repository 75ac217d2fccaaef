//! Channels: FIFO queues connecting tasks (and the synchronous main
//! context).
//!
//! A channel has capacity zero (rendezvous) or a bound. Senders that cannot
//! make progress park on `channel_send(id)`, receivers on
//! `channel_recv(id)`; the synchronous variants drive the executor instead
//! of parking. Closing wakes every waiter: subsequent sends fail, receives
//! drain the queue and then yield `nothing`.

use crate::error::{PanicKind, VmResult, err};
use crate::heap::Heap;
use crate::interp::Vm;
use crate::scheduler::WakeKey;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::trace;
use volt_core::TypeId;

/// Per-channel lifetime counters, surfaced through the diagnostics
/// intrinsics.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChanStats {
    pub sends: u64,
    pub recvs: u64,
}

#[derive(Debug)]
pub struct Channel {
    pub queue: VecDeque<Value>,
    /// `None` = unbounded, `Some(0)` = rendezvous.
    pub capacity: Option<usize>,
    pub closed: bool,
    pub elem_ty: TypeId,
    pub stats: ChanStats,
    /// Synchronous receivers currently driving the executor for this
    /// channel; counted so rendezvous senders can see them.
    pub sync_recv_waiting: usize,
}

#[derive(Debug, Default)]
pub struct ChannelTable {
    chans: FxHashMap<u64, Channel>,
    next: u64,
}

impl ChannelTable {
    pub fn make(&mut self, capacity: Option<usize>, elem_ty: TypeId) -> u64 {
        self.next += 1;
        self.chans.insert(
            self.next,
            Channel {
                queue: VecDeque::new(),
                capacity,
                closed: false,
                elem_ty,
                stats: ChanStats::default(),
                sync_recv_waiting: 0,
            },
        );
        self.next
    }

    pub fn get(&self, id: u64) -> Result<&Channel, crate::error::VmError> {
        self.chans
            .get(&id)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid channel {id}")))
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut Channel, crate::error::VmError> {
        self.chans
            .get_mut(&id)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid channel {id}")))
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chans.keys().copied()
    }

    pub fn count(&self) -> usize {
        self.chans.len()
    }

    /// Shutdown: release every queued value so the leak check sees a clean
    /// heap.
    pub fn release_residue(&mut self, heap: &mut Heap) {
        for chan in self.chans.values_mut() {
            for v in chan.queue.drain(..) {
                let _ = heap.release_value(&v);
            }
        }
    }
}

/// Outcome of a non-blocking send. `Full` and `Closed` hand the unsent
/// value back so the caller keeps ownership.
#[derive(Debug)]
pub enum TrySend {
    Sent,
    Full(Value),
    Closed(Value),
}

/// Outcome of a non-blocking receive.
#[derive(Debug)]
pub enum TryRecv {
    Value(Value),
    Empty,
    Closed,
}

impl Vm {
    /// Attempt a send without blocking. `Sent` consumes the value; `Full`
    /// and `Closed` leave ownership with the caller.
    pub(crate) fn chan_try_send(&mut self, id: u64, v: Value) -> VmResult<TrySend> {
        let receivers =
            self.exec.parked_count(WakeKey::ChanRecv(id)) + self.chans.get(id)?.sync_recv_waiting;
        let chan = self.chans.get_mut(id)?;
        if chan.closed {
            return Ok(TrySend::Closed(v));
        }
        let room = match chan.capacity {
            // Rendezvous: hand off only when a receiver is already waiting.
            Some(0) => chan.queue.is_empty() && receivers > 0,
            Some(bound) => chan.queue.len() < bound,
            None => true,
        };
        if !room {
            return Ok(TrySend::Full(v));
        }
        chan.queue.push_back(v);
        chan.stats.sends += 1;
        trace!(channel = id, "send");
        self.exec.wake_one(WakeKey::ChanRecv(id));
        Ok(TrySend::Sent)
    }

    /// Attempt a receive without blocking.
    pub(crate) fn chan_try_recv(&mut self, id: u64) -> VmResult<TryRecv> {
        let chan = self.chans.get_mut(id)?;
        if let Some(v) = chan.queue.pop_front() {
            chan.stats.recvs += 1;
            trace!(channel = id, "recv");
            self.exec.wake_one(WakeKey::ChanSend(id));
            return Ok(TryRecv::Value(v));
        }
        if chan.closed {
            return Ok(TryRecv::Closed);
        }
        Ok(TryRecv::Empty)
    }

    /// Cooperative send from a task. Returns `true` if sent. On `false` the
    /// value has been released and the current task parked; the lowered
    /// retry loop re-evaluates the operand after waking. Send on a closed
    /// channel is fatal.
    pub(crate) fn chan_send_task(&mut self, id: u64, v: Value) -> VmResult<bool> {
        self.checkpoint()?;
        match self.chan_try_send(id, v)? {
            TrySend::Sent => Ok(true),
            TrySend::Closed(v) => {
                self.release_owned(v)?;
                Err(err(
                    PanicKind::TypeMismatch,
                    format!("send on closed channel {id}"),
                )
                .into())
            }
            TrySend::Full(v) => {
                self.release_owned(v)?;
                self.park_current(WakeKey::ChanSend(id))?;
                Ok(false)
            }
        }
    }

    /// Cooperative receive. `Ok(Some(option_value))` when resolved (either a
    /// value or end-of-stream); `Ok(None)` when the task parked and must
    /// retry after waking.
    pub(crate) fn chan_recv_task(&mut self, id: u64) -> VmResult<Option<Value>> {
        self.checkpoint()?;
        let elem_ty = self.chans.get(id)?.elem_ty;
        match self.chan_try_recv(id)? {
            TryRecv::Value(v) => {
                let some = self.option_some(v)?;
                Ok(Some(some))
            }
            TryRecv::Closed => {
                let nothing = self.option_nothing(elem_ty)?;
                Ok(Some(nothing))
            }
            TryRecv::Empty => {
                self.park_current(WakeKey::ChanRecv(id))?;
                // A rendezvous sender may be parked waiting for a receiver.
                self.exec.wake_all(WakeKey::ChanSend(id));
                Ok(None)
            }
        }
    }

    /// Blocking send from the synchronous context: drives the executor until
    /// the value is accepted. Send on a closed channel is fatal.
    pub(crate) fn chan_send_blocking(&mut self, id: u64, v: Value) -> VmResult<()> {
        let mut v = v;
        loop {
            match self.chan_try_send(id, v)? {
                TrySend::Sent => return Ok(()),
                TrySend::Closed(v) => {
                    self.release_owned(v)?;
                    return Err(err(
                        PanicKind::TypeMismatch,
                        format!("send on closed channel {id}"),
                    )
                    .into());
                }
                TrySend::Full(unsent) => {
                    v = self.hold_while_driving(unsent)?;
                }
            }
        }
    }

    /// Blocking receive from the synchronous context. Returns the element
    /// `Option` value.
    pub(crate) fn chan_recv_blocking(&mut self, id: u64) -> VmResult<Value> {
        let elem_ty = self.chans.get(id)?.elem_ty;
        self.chans.get_mut(id)?.sync_recv_waiting += 1;
        // Rendezvous senders wait for a visible receiver.
        self.exec.wake_all(WakeKey::ChanSend(id));
        let result = loop {
            match self.chan_try_recv(id) {
                Ok(TryRecv::Value(v)) => break self.option_some(v),
                Ok(TryRecv::Closed) => break self.option_nothing(elem_ty),
                Ok(TryRecv::Empty) => {
                    if let Err(e) = self.drive_one() {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        if let Ok(chan) = self.chans.get_mut(id) {
            chan.sync_recv_waiting -= 1;
        }
        result
    }

    /// Close a channel; idempotent. Wakes every waiter on both sides.
    pub(crate) fn chan_close(&mut self, id: u64) -> VmResult<()> {
        let chan = self.chans.get_mut(id)?;
        if chan.closed {
            return Ok(());
        }
        chan.closed = true;
        trace!(channel = id, "close");
        self.exec.wake_all(WakeKey::ChanSend(id));
        self.exec.wake_all(WakeKey::ChanRecv(id));
        Ok(())
    }

    /// One executor step while the synchronous context holds `v` across the
    /// wait. The value is simply threaded through; holding it here keeps
    /// ownership accounting obvious at the call site.
    fn hold_while_driving(&mut self, v: Value) -> VmResult<Value> {
        self.drive_one()?;
        Ok(v)
    }
}

// ---------------------------------------------------------------------------
// Intrinsic handlers
// ---------------------------------------------------------------------------

use crate::intrinsics::{CallCtx, arg_int, expect_args};
use volt_core::TypeKind;

/// `make_channel(capacity)` / `new::<Chan<T>>(capacity)`. Capacity 0 is a
/// rendezvous channel; a negative capacity means unbounded.
pub(crate) fn make_channel(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst_ty = ctx.dst_ty;
    let type_arg = ctx.type_args.first().copied();
    let [cap] = expect_args::<1>(vm, "make_channel", ctx.args)?;
    let cap = arg_int(vm, "make_channel", &cap)?;
    let capacity = if cap < 0 { None } else { Some(cap as usize) };
    let elem = match vm.types.kind(dst_ty) {
        Some(TypeKind::Chan(elem)) => *elem,
        _ => type_arg.unwrap_or_else(|| vm.types.unit()),
    };
    let id = vm.chans.make(capacity, elem);
    let ty = vm.types.chan_of(elem);
    Ok(Value::int(id as i64, ty))
}

/// `send(chan, v)` -> bool. Cooperative inside a task (false = parked, the
/// retry loop yields); blocking in the synchronous context.
pub(crate) fn send(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [chan, v] = expect_args::<2>(vm, "send", ctx.args)?;
    let id = match vm.chan_id_of(&chan) {
        Ok(id) => id,
        Err(e) => {
            let _ = vm.heap.release_value(&v);
            return Err(e);
        }
    };
    let sent = if vm.current_task.is_some() {
        vm.chan_send_task(id, v)?
    } else {
        vm.chan_send_blocking(id, v)?;
        true
    };
    Ok(Value::bool_(sent, vm.types.bool_()))
}

/// `recv(chan)` -> `Option<T>`. Inside a task an empty open channel parks
/// and the returned `nothing` is a placeholder the retry loop never uses.
pub(crate) fn recv(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [chan] = expect_args::<1>(vm, "recv", ctx.args)?;
    let id = vm.chan_id_of(&chan)?;
    if vm.current_task.is_some() {
        match vm.chan_recv_task(id)? {
            Some(option) => Ok(option),
            None => {
                let elem = vm.chans.get(id)?.elem_ty;
                vm.option_nothing(elem)
            }
        }
    } else {
        vm.chan_recv_blocking(id)
    }
}

/// `try_send(chan, v)` -> bool; never parks, false on full or closed.
pub(crate) fn try_send(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [chan, v] = expect_args::<2>(vm, "try_send", ctx.args)?;
    let id = match vm.chan_id_of(&chan) {
        Ok(id) => id,
        Err(e) => {
            let _ = vm.heap.release_value(&v);
            return Err(e);
        }
    };
    let sent = match vm.chan_try_send(id, v)? {
        TrySend::Sent => true,
        TrySend::Full(v) | TrySend::Closed(v) => {
            vm.release_owned(v)?;
            false
        }
    };
    Ok(Value::bool_(sent, vm.types.bool_()))
}

/// `try_recv(chan)` -> `Option<T>`; never parks.
pub(crate) fn try_recv(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [chan] = expect_args::<1>(vm, "try_recv", ctx.args)?;
    let id = vm.chan_id_of(&chan)?;
    let elem = vm.chans.get(id)?.elem_ty;
    match vm.chan_try_recv(id)? {
        TryRecv::Value(v) => vm.option_some(v),
        TryRecv::Empty | TryRecv::Closed => vm.option_nothing(elem),
    }
}

/// `close(chan)`; idempotent.
pub(crate) fn close(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [chan] = expect_args::<1>(vm, "close", ctx.args)?;
    let id = vm.chan_id_of(&chan)?;
    vm.chan_close(id)?;
    Ok(Value::unit(vm.types.unit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHost;
    use crate::value::ValueKind;
    use volt_core::{ModuleBuilder, TypeTable};

    fn vm() -> Vm {
        Vm::new(
            ModuleBuilder::new("t").build(),
            TypeTable::new(),
            Box::new(MockHost::new()),
        )
    }

    fn int(vm: &Vm, n: i64) -> Value {
        Value::int(n, vm.types.int64())
    }

    #[test]
    fn test_bounded_try_send_recv() {
        let mut vm = vm();
        let elem = vm.types.int64();
        let id = vm.chans.make(Some(1), elem);
        let v = int(&vm, 5);
        assert!(matches!(vm.chan_try_send(id, v).unwrap(), TrySend::Sent));
        // full at capacity 1
        let v = int(&vm, 6);
        assert!(matches!(vm.chan_try_send(id, v).unwrap(), TrySend::Full(_)));
        match vm.chan_try_recv(id).unwrap() {
            TryRecv::Value(v) => assert_eq!(v.as_int(), Some(5)),
            other => panic!("expected a value, got {other:?}"),
        }
        assert!(matches!(vm.chan_try_recv(id).unwrap(), TryRecv::Empty));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let mut vm = vm();
        let elem = vm.types.int64();
        let id = vm.chans.make(None, elem);
        let v = int(&vm, 1);
        assert!(matches!(vm.chan_try_send(id, v).unwrap(), TrySend::Sent));
        vm.chan_close(id).unwrap();
        // close is idempotent
        vm.chan_close(id).unwrap();
        // drains the queue first
        assert!(matches!(
            vm.chan_try_recv(id).unwrap(),
            TryRecv::Value(_)
        ));
        assert!(matches!(vm.chan_try_recv(id).unwrap(), TryRecv::Closed));
        // sends after close hand the value back
        let v = int(&vm, 2);
        assert!(matches!(
            vm.chan_try_send(id, v).unwrap(),
            TrySend::Closed(_)
        ));
    }

    #[test]
    fn test_rendezvous_needs_a_receiver() {
        let mut vm = vm();
        let elem = vm.types.int64();
        let id = vm.chans.make(Some(0), elem);
        // no receiver waiting: the handoff cannot happen yet
        let v = int(&vm, 9);
        assert!(matches!(vm.chan_try_send(id, v).unwrap(), TrySend::Full(_)));
        // a synchronous receiver makes the channel accept one value
        vm.chans.get_mut(id).unwrap().sync_recv_waiting = 1;
        let v = int(&vm, 9);
        assert!(matches!(vm.chan_try_send(id, v).unwrap(), TrySend::Sent));
        match vm.chan_try_recv(id).unwrap() {
            TryRecv::Value(v) => assert_eq!(v.as_int(), Some(9)),
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[test]
    fn test_queued_heap_values_release_at_shutdown() {
        let mut vm = vm();
        let str_ty = vm.types.str_();
        let elem = str_ty;
        let id = vm.chans.make(None, elem);
        let h = crate::rope::flat(&mut vm.heap, str_ty, "queued".to_string());
        let v = Value::new(str_ty, ValueKind::Str(h));
        assert!(matches!(vm.chan_try_send(id, v).unwrap(), TrySend::Sent));
        vm.chans.release_residue(&mut vm.heap);
        assert_eq!(vm.heap.stats().live_blocks, 0);
    }
}
