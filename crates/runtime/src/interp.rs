//! The instruction dispatcher: fetch, decode, execute.
//!
//! One `Vm` owns exactly one heap, one raw arena, one executor, one optional
//! recorder, and one optional tracer, passed in as explicit dependencies.
//! The loop drives the top frame through its basic blocks; terminators pop
//! frames (with implicit reverse-order drops) and deliver return values to
//! the caller's destination. Panics unwind every frame, run the same drops,
//! then the leak check; user code cannot catch them.

use crate::arena::RawMemory;
use crate::channel::ChannelTable;
use crate::config::VoltConfig;
use crate::error::{PanicKind, Unwind, VmError, VmResult, err};
use crate::file::FileTable;
use crate::frame::{Frame, Slot};
use crate::heap::{Heap, HeapStats};
use crate::host::Host;
use crate::pool::BlockingPool;
use crate::record::{Recorder, Replayer, Tracer};
use crate::scheduler::{Executor, WakeKey};
use crate::tcp::NetTable;
use crate::value::{Value, ValueKind};
use tracing::debug;
use volt_core::{Callee, FuncId, InstKind, LocalId, Module, Operand, Span, Terminator, TypeTable};

/// How a root frame (main or a task poll) finished.
#[derive(Debug)]
pub(crate) enum FrameResult {
    /// `return` / `async_return`: the frame's result value.
    Done(Value),
    /// `async_yield`: the state value handed back to the executor.
    Yield(Value),
}

pub struct Vm {
    pub(crate) module: Module,
    pub(crate) types: TypeTable,
    pub(crate) heap: Heap,
    pub(crate) raw: RawMemory,
    pub(crate) frames: Vec<Frame>,
    pub(crate) globals: Vec<Slot>,
    pub(crate) exec: Executor,
    pub(crate) chans: ChannelTable,
    pub(crate) files: FileTable,
    pub(crate) net: NetTable,
    pub(crate) host: Box<dyn Host>,
    pub(crate) pool: Option<BlockingPool>,
    pub(crate) recorder: Option<Recorder>,
    pub(crate) replayer: Option<Replayer>,
    pub(crate) tracer: Option<Box<dyn Tracer>>,
    pub(crate) config: VoltConfig,
    /// Task being polled right now; `None` in the synchronous context.
    pub(crate) current_task: Option<u64>,
    /// Park key set by an intrinsic during the current poll step.
    pub(crate) pending_park: Option<WakeKey>,
    frame_result: Option<FrameResult>,
    /// Local writes of the current instruction, for the tracer.
    pub(crate) writes: Vec<(LocalId, String)>,
}

impl Vm {
    pub fn new(module: Module, types: TypeTable, host: Box<dyn Host>) -> Self {
        let globals = module
            .globals
            .iter()
            .map(|g| Slot::uninit(Some(g.name.clone()), g.ty))
            .collect();
        Vm {
            module,
            types,
            heap: Heap::new(),
            raw: RawMemory::new(),
            frames: Vec::new(),
            globals,
            exec: Executor::new(),
            chans: ChannelTable::default(),
            files: FileTable::default(),
            net: NetTable::default(),
            host,
            pool: None,
            recorder: None,
            replayer: None,
            tracer: None,
            config: VoltConfig::default(),
            current_task: None,
            pending_park: None,
            frame_result: None,
            writes: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: VoltConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an event-log recorder writing NDJSON to `out`.
    pub fn with_recorder(mut self, out: Box<dyn std::io::Write>) -> Self {
        self.recorder = Some(Recorder::new(out));
        self
    }

    /// Attach a replayer validating execution against a recorded log.
    pub fn with_replayer(mut self, replayer: Replayer) -> Self {
        self.replayer = Some(replayer);
        self
    }

    pub fn with_tracer(mut self, tracer: Box<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Execute the module's entry function to completion and return the
    /// process exit code.
    pub fn run(&mut self) -> i32 {
        let result = self.run_program();
        match result {
            Ok(code) => self.finish(code),
            Err(Unwind::Exit(code)) => {
                self.unwind_to(0);
                self.finish(code)
            }
            Err(Unwind::Panic(e)) => self.finish_panic(e),
            Err(Unwind::Cancelled) => {
                // Cancellation outside a task is a dispatcher bug surfaced
                // as a panic rather than silently swallowed.
                self.finish_panic(err(
                    PanicKind::AsyncBackendMissing,
                    "cancellation reached the synchronous context",
                ))
            }
        }
    }

    fn run_program(&mut self) -> VmResult<i32> {
        let entry = self
            .module
            .entry
            .or_else(|| self.module.function_by_name("main"))
            .ok_or_else(|| err(PanicKind::Unimplemented, "module has no entry function"))?;
        self.push_frame(entry, Vec::new(), None)?;
        match self.run_frames_until(0)? {
            FrameResult::Done(v) => {
                let code = match v.kind {
                    ValueKind::Int(n) => n as i32,
                    _ => 0,
                };
                self.release_owned(v)?;
                Ok(code)
            }
            FrameResult::Yield(v) => {
                self.release_owned(v)?;
                Err(err(
                    PanicKind::AsyncBackendMissing,
                    "entry function yielded outside the executor",
                )
                .into())
            }
        }
    }

    /// Normal/exit shutdown: drop globals, release executor residue, leak
    /// check. A leak turns into the dedicated panic.
    fn finish(&mut self, code: i32) -> i32 {
        match self.shutdown() {
            Ok(()) => {
                if let Some(rec) = self.recorder.as_mut() {
                    rec.record_exit(code);
                }
                if let Some(rep) = self.replayer.as_mut() {
                    if let Err(e) = rep.expect_exit(code) {
                        return self.report_panic(e);
                    }
                }
                code
            }
            Err(e) => self.report_panic(e),
        }
    }

    fn finish_panic(&mut self, e: VmError) -> i32 {
        let code = self.report_panic(e);
        self.unwind_to(0);
        // Secondary leak failures surface too; the exit code stays 1.
        if let Err(leak) = self.shutdown() {
            self.emit_panic_message(&leak);
        }
        code
    }

    /// Write `panic: <message>` to stderr and the panic event to the log.
    fn report_panic(&mut self, e: VmError) -> i32 {
        let bt = self.backtrace();
        self.emit_panic_message(&e);
        let at = self.panic_location(&e);
        if let Some(rec) = self.recorder.as_mut() {
            rec.record_panic(e.kind.code(), &e.message, &at, &bt);
        }
        1
    }

    fn emit_panic_message(&mut self, e: &VmError) {
        debug!(kind = e.kind.code(), "panic: {}", e.message);
        let _ = self
            .host
            .write_stderr(format!("panic: {}\n", e.message).as_bytes());
    }

    fn panic_location(&self, e: &VmError) -> String {
        match e.span {
            Some(span) => format!("{}:{}", self.module.source, span),
            None => self.module.source.clone(),
        }
    }

    pub(crate) fn backtrace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                let func = self.module.function(f.func);
                if f.span.is_dummy() {
                    func.name.clone()
                } else {
                    format!("{} at {}:{}", func.name, self.module.source, f.span)
                }
            })
            .collect()
    }

    // ---- frame management ----

    pub(crate) fn push_frame(
        &mut self,
        func: FuncId,
        args: Vec<Value>,
        return_dst: Option<Option<volt_core::Place>>,
    ) -> VmResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            for v in &args {
                let _ = self.heap.release_value(v);
            }
            return Err(err(
                PanicKind::Unimplemented,
                format!("call depth limit of {} exceeded", self.config.max_call_depth),
            )
            .into());
        }
        let function = self.module.function(func);
        if args.len() != function.params as usize {
            let msg = format!(
                "{} expects {} argument(s), got {}",
                function.name,
                function.params,
                args.len()
            );
            for v in &args {
                let _ = self.heap.release_value(v);
            }
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
        let mut frame = Frame::new(func, function.entry, &function.locals);
        frame.return_dst = return_dst;
        self.frames.push(frame);
        let frame_idx = self.frames.len() - 1;
        let slot_tys: Vec<_> = (0..args.len())
            .map(|i| self.frames[frame_idx].slots[i].ty)
            .collect();
        for (i, (v, slot_ty)) in args.into_iter().zip(slot_tys).enumerate() {
            let v = self.retag_value(v, slot_ty)?;
            let slot = &mut self.frames[frame_idx].slots[i];
            slot.value = v;
            slot.initialized = true;
        }
        Ok(())
    }

    /// Run until the frame stack is back down to `floor`; the root frame's
    /// terminator reports how it finished.
    pub(crate) fn run_frames_until(&mut self, floor: usize) -> VmResult<FrameResult> {
        while self.frames.len() > floor {
            self.step()?;
        }
        self.frame_result.take().ok_or_else(|| {
            err(
                PanicKind::Unimplemented,
                "frame chain drained without a result",
            )
            .into()
        })
    }

    /// Pop frames down to `floor`, running implicit drops; used on panic and
    /// cancellation paths where secondary release failures are swallowed.
    pub(crate) fn unwind_to(&mut self, floor: usize) {
        while self.frames.len() > floor {
            let idx = self.frames.len() - 1;
            let _ = self.drop_frame_locals(idx);
            self.frames.pop();
        }
    }

    /// Implicit drops: strictly reverse declaration order, skipping moved,
    /// dropped, and never-initialized slots.
    fn drop_frame_locals(&mut self, frame_idx: usize) -> VmResult<()> {
        for i in (0..self.frames[frame_idx].slots.len()).rev() {
            let slot = &mut self.frames[frame_idx].slots[i];
            if !slot.needs_drop() {
                continue;
            }
            let v = std::mem::replace(&mut slot.value, Value::invalid());
            slot.dropped = true;
            slot.borrows = 0;
            self.heap.release_value(&v)?;
        }
        Ok(())
    }

    // ---- the dispatch loop ----

    fn step(&mut self) -> VmResult<()> {
        let frame_idx = self.frames.len() - 1;
        let frame = &self.frames[frame_idx];
        let function = self.module.function(frame.func);
        let block = function.block(frame.block);
        if frame.ip >= block.instructions.len() {
            let terminator = block.terminator.clone();
            let span = function.span;
            return self
                .exec_terminator(terminator)
                .map_err(|u| attach_span(u, span));
        }
        let instruction = block.instructions[frame.ip].clone();
        let span = instruction.span;
        self.frames[frame_idx].span = span;
        self.writes.clear();
        self.exec_instruction(instruction.kind)
            .map_err(|u| attach_span(u, span))?;
        if self.tracer.is_some() && !self.writes.is_empty() {
            let frame = &self.frames[frame_idx.min(self.frames.len() - 1)];
            let func_name = self.module.function(frame.func).name.clone();
            let writes = std::mem::take(&mut self.writes);
            if let Some(tracer) = self.tracer.as_mut() {
                tracer.instruction(&func_name, frame.block.0, frame.ip, &writes);
            }
        }
        // Advance unless this instruction changed the frame stack (a call
        // pushed a frame; the return path advances the caller instead).
        if self.frames.len() == frame_idx + 1 {
            self.frames[frame_idx].ip += 1;
        }
        Ok(())
    }

    fn exec_instruction(&mut self, kind: InstKind) -> VmResult<()> {
        match kind {
            InstKind::Assign { dst, rvalue } => {
                let v = self.eval_rvalue(&rvalue)?;
                self.write_place(&dst, v)
            }
            InstKind::Call {
                dst,
                callee,
                args,
                type_args,
            } => match callee {
                Callee::Func(func) => {
                    let values = self.eval_operands(args)?;
                    self.push_frame(func, values, Some(dst))
                }
                Callee::Name(name) => {
                    let values = self.eval_operands(args)?;
                    self.call_named(&name, dst, values, &type_args)
                }
            },
            InstKind::Drop { local } => self.exec_drop(local),
            InstKind::EndBorrow { local } => {
                let frame = self.frames.last_mut().expect("instruction needs a frame");
                let slot = &mut frame.slots[local.0 as usize];
                slot.borrows = slot.borrows.saturating_sub(1);
                Ok(())
            }
            InstKind::Await { dst, task } => {
                let tv = self.eval_operand(&task)?;
                let tid = self.task_id_of(&tv)?;
                let outcome = self.await_task(tid)?;
                match dst {
                    Some(place) => self.write_place(&place, outcome),
                    None => self.release_owned(outcome),
                }
            }
            InstKind::Spawn { dst, callee, args } => {
                let Callee::Func(func) = callee else {
                    return Err(err(
                        PanicKind::TypeMismatch,
                        "spawn requires a module function",
                    )
                    .into());
                };
                let mut values = self.eval_operands(args)?;
                let state = match values.len() {
                    0 => Value::unit(self.types.unit()),
                    1 => values.pop().expect("length checked"),
                    n => {
                        for v in &values {
                            let _ = self.heap.release_value(v);
                        }
                        return Err(err(
                            PanicKind::TypeMismatch,
                            format!("spawn takes at most one state argument, got {n}"),
                        )
                        .into());
                    }
                };
                let tid = self.spawn_poll_task(func, state);
                let ty = self.types.task_of(volt_core::TypeId::UNKNOWN);
                self.write_place(&dst, Value::int(tid as i64, ty))
            }
            InstKind::ChanSend { chan, value } => {
                let cv = self.eval_operand(&chan)?;
                let id = self.chan_id_of(&cv)?;
                let v = self.eval_operand(&value)?;
                self.chan_send_blocking(id, v)
            }
            InstKind::ChanRecv { dst, chan } => {
                let cv = self.eval_operand(&chan)?;
                let id = self.chan_id_of(&cv)?;
                let v = self.chan_recv_blocking(id)?;
                self.write_place(&dst, v)
            }
            InstKind::Nop => Ok(()),
        }
    }

    fn exec_drop(&mut self, local: LocalId) -> VmResult<()> {
        let frame = self.frames.last_mut().expect("instruction needs a frame");
        let slot = &mut frame.slots[local.0 as usize];
        slot.check_readable()?;
        slot.check_unborrowed()?;
        let v = std::mem::replace(&mut slot.value, Value::invalid());
        slot.dropped = true;
        self.heap.release_value(&v)?;
        Ok(())
    }

    fn exec_terminator(&mut self, terminator: Terminator) -> VmResult<()> {
        match terminator {
            Terminator::Return(op) => {
                let v = match op {
                    Some(op) => self.eval_operand(&op)?,
                    None => Value::unit(self.types.unit()),
                };
                self.return_from_frame(v, false)
            }
            Terminator::Goto(target) => {
                let frame = self.frames.last_mut().expect("terminator needs a frame");
                frame.block = target;
                frame.ip = 0;
                Ok(())
            }
            Terminator::If {
                cond,
                then_blk,
                else_blk,
            } => {
                let c = self.eval_operand(&cond)?;
                let target = match c.kind {
                    ValueKind::Bool(true) => then_blk,
                    ValueKind::Bool(false) => else_blk,
                    _ => {
                        let msg = format!("if condition is {}, not bool", c.kind_name());
                        self.release_owned(c)?;
                        return Err(err(PanicKind::TypeMismatch, msg).into());
                    }
                };
                let frame = self.frames.last_mut().expect("terminator needs a frame");
                frame.block = target;
                frame.ip = 0;
                Ok(())
            }
            Terminator::SwitchTag {
                scrutinee,
                arms,
                default,
            } => {
                let v = self.eval_operand(&scrutinee)?;
                let result = self.switch_target(&v, &arms, default);
                self.release_owned(v)?;
                let target = result?;
                let frame = self.frames.last_mut().expect("terminator needs a frame");
                frame.block = target;
                frame.ip = 0;
                Ok(())
            }
            Terminator::AsyncYield { state } => {
                let v = self.eval_operand(&state)?;
                if self.frames.last().is_some_and(|f| f.return_dst.is_some()) {
                    self.release_owned(v)?;
                    return Err(err(
                        PanicKind::AsyncBackendMissing,
                        "async_yield in a nested call frame",
                    )
                    .into());
                }
                if self.current_task.is_none() {
                    self.release_owned(v)?;
                    return Err(err(
                        PanicKind::AsyncBackendMissing,
                        "async_yield outside the executor",
                    )
                    .into());
                }
                let idx = self.frames.len() - 1;
                self.drop_frame_locals(idx)?;
                self.frames.pop();
                self.frame_result = Some(FrameResult::Yield(v));
                Ok(())
            }
            Terminator::AsyncReturn(op) => {
                let v = match op {
                    Some(op) => self.eval_operand(&op)?,
                    None => Value::unit(self.types.unit()),
                };
                self.return_from_frame(v, true)
            }
            Terminator::Unreachable => Err(err(
                PanicKind::Unimplemented,
                "entered unreachable code",
            )
            .into()),
        }
    }

    /// Shared tail of `return` and `async_return`: implicit drops, pop,
    /// deliver.
    fn return_from_frame(&mut self, v: Value, _async_form: bool) -> VmResult<()> {
        let return_dst = self
            .frames
            .last()
            .expect("terminator needs a frame")
            .return_dst
            .clone();
        let idx = self.frames.len() - 1;
        self.drop_frame_locals(idx)?;
        self.frames.pop();
        match return_dst {
            None => {
                self.frame_result = Some(FrameResult::Done(v));
                Ok(())
            }
            Some(dst) => {
                match dst {
                    Some(place) => self.write_place(&place, v)?,
                    None => self.release_owned(v)?,
                }
                if let Some(caller) = self.frames.last_mut() {
                    caller.ip += 1;
                }
                Ok(())
            }
        }
    }

    fn switch_target(
        &mut self,
        v: &Value,
        arms: &[(volt_core::Symbol, volt_core::BlockId)],
        default: Option<volt_core::BlockId>,
    ) -> VmResult<volt_core::BlockId> {
        let ValueKind::Tag(h) = v.kind else {
            return Err(err(
                PanicKind::SwitchTagNonTag,
                format!("switch_tag on {}", v.kind_name()),
            )
            .into());
        };
        let variant = self.tag_variant_of(h)?;
        for (sym, target) in arms {
            // Match by stable symbol first, by name for cross-compiled
            // layouts where the symbol spaces differ.
            if *sym == variant
                || self.types.symbol_name(*sym) == self.types.symbol_name(variant)
            {
                return Ok(*target);
            }
        }
        default.ok_or_else(|| {
            err(
                PanicKind::SwitchTagMissingDefault,
                format!(
                    "no case for variant `{}` and no default",
                    self.types.symbol_name(variant)
                ),
            )
            .into()
        })
    }

    // ---- small shared helpers ----

    pub(crate) fn eval_operands(&mut self, operands: Vec<Operand>) -> VmResult<Vec<Value>> {
        let mut values = Vec::with_capacity(operands.len());
        for op in &operands {
            match self.eval_operand(op) {
                Ok(v) => values.push(v),
                Err(e) => {
                    for v in &values {
                        let _ = self.heap.release_value(v);
                    }
                    return Err(e);
                }
            }
        }
        Ok(values)
    }

    pub(crate) fn release_owned(&mut self, v: Value) -> VmResult<()> {
        self.heap.release_value(&v)?;
        Ok(())
    }

    pub(crate) fn task_id_of(&self, v: &Value) -> VmResult<u64> {
        match v.kind {
            ValueKind::Int(id) => Ok(id as u64),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("expected a task handle, got {}", v.kind_name()),
            )
            .into()),
        }
    }

    pub(crate) fn chan_id_of(&self, v: &Value) -> VmResult<u64> {
        match v.kind {
            ValueKind::Int(id) => Ok(id as u64),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("expected a channel handle, got {}", v.kind_name()),
            )
            .into()),
        }
    }

    /// Shutdown: globals drop in reverse definition order, then executor and
    /// channel residue releases, then the leak scan.
    fn shutdown(&mut self) -> Result<(), VmError> {
        for i in (0..self.globals.len()).rev() {
            let slot = &mut self.globals[i];
            if !slot.needs_drop() {
                continue;
            }
            let v = std::mem::replace(&mut slot.value, Value::invalid());
            slot.dropped = true;
            let _ = self.heap.release_value(&v);
        }
        self.chans.release_residue(&mut self.heap);
        self.exec.release_residue(&mut self.heap);
        self.files.clear();
        self.net.clear();
        if let Some(msg) = self.heap.leak_message(5) {
            return Err(err(PanicKind::HeapLeak, format!("heap leak: {msg}")));
        }
        Ok(())
    }
}

fn attach_span(u: Unwind, span: Span) -> Unwind {
    match u {
        Unwind::Panic(e) => Unwind::Panic(e.at(span)),
        other => other,
    }
}
