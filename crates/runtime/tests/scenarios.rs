//! End-to-end scenarios driven through complete lowered modules.

use volt_core::{
    Callee, Const, FunctionBuilder, InstKind, ModuleBuilder, Operand, Place, Rvalue, Terminator,
    TypeTable,
};
use volt_runtime::{HeapStats, MockHost, MockOutput, Vm};

struct Run {
    code: i32,
    out: MockOutput,
    stats: HeapStats,
}

fn run(module: volt_core::Module, types: TypeTable) -> Run {
    run_with_host(module, types, MockHost::new())
}

fn run_with_host(module: volt_core::Module, types: TypeTable, host: MockHost) -> Run {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let out = host.output();
    let mut vm = Vm::new(module, types, Box::new(host));
    let code = vm.run();
    Run {
        code,
        out,
        stats: vm.heap_stats(),
    }
}

/// `dst = __to::<string>(src); rt_write_stdout(dst)`
fn emit_print_int(
    f: &mut FunctionBuilder,
    types: &mut TypeTable,
    src: volt_core::LocalId,
) {
    let str_ty = types.str_();
    let tmp = f.temp(str_ty);
    f.intrinsic(
        Some(Place::local(tmp)),
        "__to",
        vec![Operand::Copy(Place::local(src))],
        vec![str_ty],
    );
    f.intrinsic(
        None,
        "rt_write_stdout",
        vec![Operand::Copy(Place::local(tmp))],
        vec![],
    );
}

fn emit_print_text(f: &mut FunctionBuilder, types: &mut TypeTable, text: &str) {
    let str_ty = types.str_();
    let tmp = f.temp(str_ty);
    f.assign_use(tmp, Operand::Const(Const::Str(text.to_string())));
    f.intrinsic(
        None,
        "rt_write_stdout",
        vec![Operand::Copy(Place::local(tmp))],
        vec![],
    );
}

// ---------------------------------------------------------------------------
// 1. Reverse-order local drops
// ---------------------------------------------------------------------------

#[test]
fn test_locals_drop_in_reverse_order_and_heap_is_clean() {
    let mut types = TypeTable::new();
    let str_ty = types.str_();
    let int64 = types.int64();

    let mut f = FunctionBuilder::new("main");
    let a = f.local("a", str_ty);
    let b = f.local("b", str_ty);
    let c = f.local("c", str_ty);
    f.assign_use(a, Operand::Const(Const::Str("alpha".to_string())));
    f.assign_use(b, Operand::Const(Const::Str("beta".to_string())));
    f.assign_use(c, Operand::Const(Const::Str("gamma".to_string())));
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("drops");
    let main = m.add(f.build());
    m.entry(main);

    let r = run(m.build(), types);
    assert_eq!(r.code, 0);
    assert_eq!(r.out.stderr(), "");
    assert_eq!(r.stats.live_blocks, 0, "leak detector must find nothing");
    assert_eq!(r.stats.allocs, 3);
    assert_eq!(r.stats.frees, 3);
}

// ---------------------------------------------------------------------------
// 2. Use-after-move
// ---------------------------------------------------------------------------

#[test]
fn test_use_after_move_panics_and_releases_everything() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let arr_ty = types.array_of(int64);

    let mut f = FunctionBuilder::new("main");
    let x = f.local("x", arr_ty);
    let y = f.local("y", arr_ty);
    let n = f.local("n", int64);
    f.assign(
        Place::local(x),
        Rvalue::ArrayLit {
            ty: arr_ty,
            elems: vec![
                Operand::Const(Const::Int(1, int64)),
                Operand::Const(Const::Int(2, int64)),
                Operand::Const(Const::Int(3, int64)),
            ],
        },
    );
    f.assign_use(y, Operand::Move(Place::local(x)));
    f.intrinsic(
        Some(Place::local(n)),
        "__len",
        vec![Operand::Copy(Place::local(x))],
        vec![],
    );
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("moved");
    let main = m.add(f.build());
    m.entry(main);

    let r = run(m.build(), types);
    assert_eq!(r.code, 1);
    assert!(r.out.stderr().starts_with("panic:"), "stderr: {}", r.out.stderr());
    assert!(r.out.stderr().contains("use of moved `x`"));
    assert_eq!(r.stats.live_blocks, 0, "unwind must release x and y");
}

// ---------------------------------------------------------------------------
// 3. Tag pattern dispatch
// ---------------------------------------------------------------------------

#[test]
fn test_option_switch_dispatch() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let opt_ty = types.option_of(int64);
    let some = types.intern_symbol("Some");
    let nothing = types.intern_symbol("nothing");

    let mut f = FunctionBuilder::new("main");
    let o = f.local("o", opt_ty);
    let v = f.local("v", int64);
    f.intrinsic(
        Some(Place::local(o)),
        "Some",
        vec![Operand::Const(Const::Int(7, int64))],
        vec![int64],
    );
    let b_some = f.block();
    let b_none = f.block();
    let b_end = f.block();
    f.switch_to(volt_core::BlockId(0));
    f.terminate(Terminator::SwitchTag {
        scrutinee: Operand::Copy(Place::local(o)),
        arms: vec![(some, b_some), (nothing, b_none)],
        default: None,
    });

    f.switch_to(b_some);
    f.assign(
        Place::local(v),
        Rvalue::TagPayload {
            place: Place::local(o),
            variant: some,
            index: 0,
        },
    );
    emit_print_int(&mut f, &mut types, v);
    f.goto(b_end);

    f.switch_to(b_none);
    emit_print_text(&mut f, &mut types, "none");
    f.goto(b_end);

    f.switch_to(b_end);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("dispatch");
    let main = m.add(f.build());
    m.entry(main);

    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "7");
    assert_eq!(r.stats.live_blocks, 0);
}

// ---------------------------------------------------------------------------
// 4. Channel rendezvous
// ---------------------------------------------------------------------------

/// Poll function: send 42 on the channel carried in `state`; park-and-yield
/// until the rendezvous completes.
fn build_sender(types: &mut TypeTable) -> volt_core::Function {
    let int64 = types.int64();
    let unit = types.unit();
    let bool_ = types.bool_();
    let chan_ty = types.chan_of(int64);

    let mut f = FunctionBuilder::new("sender");
    let state = f.param("state", chan_ty);
    let _resume = f.param("resume", unit);
    let sent = f.temp(bool_);
    let parked = f.temp(bool_);
    let b_check = f.block();
    let b_yield = f.block();
    let b_done = f.block();

    f.switch_to(volt_core::BlockId(0));
    f.intrinsic(
        Some(Place::local(sent)),
        "send",
        vec![
            Operand::Copy(Place::local(state)),
            Operand::Const(Const::Int(42, int64)),
        ],
        vec![],
    );
    f.intrinsic(Some(Place::local(parked)), "rt_task_parked", vec![], vec![]);
    f.goto(b_check);

    f.switch_to(b_check);
    f.terminate(Terminator::If {
        cond: Operand::Copy(Place::local(parked)),
        then_blk: b_yield,
        else_blk: b_done,
    });

    f.switch_to(b_yield);
    f.terminate(Terminator::AsyncYield {
        state: Operand::Copy(Place::local(state)),
    });

    f.switch_to(b_done);
    f.terminate(Terminator::AsyncReturn(None));
    f.build()
}

/// Poll function: receive from the channel in `state`, print the value.
fn build_receiver(types: &mut TypeTable) -> volt_core::Function {
    let int64 = types.int64();
    let unit = types.unit();
    let bool_ = types.bool_();
    let chan_ty = types.chan_of(int64);
    let opt_ty = types.option_of(int64);
    let some = types.intern_symbol("Some");
    let nothing = types.intern_symbol("nothing");

    let mut f = FunctionBuilder::new("receiver");
    let state = f.param("state", chan_ty);
    let _resume = f.param("resume", unit);
    let r = f.temp(opt_ty);
    let parked = f.temp(bool_);
    let v = f.temp(int64);
    let b_check = f.block();
    let b_yield = f.block();
    let b_use = f.block();
    let b_some = f.block();
    let b_none = f.block();
    let b_done = f.block();

    f.switch_to(volt_core::BlockId(0));
    f.intrinsic(
        Some(Place::local(r)),
        "recv",
        vec![Operand::Copy(Place::local(state))],
        vec![],
    );
    f.intrinsic(Some(Place::local(parked)), "rt_task_parked", vec![], vec![]);
    f.goto(b_check);

    f.switch_to(b_check);
    f.terminate(Terminator::If {
        cond: Operand::Copy(Place::local(parked)),
        then_blk: b_yield,
        else_blk: b_use,
    });

    f.switch_to(b_yield);
    f.terminate(Terminator::AsyncYield {
        state: Operand::Copy(Place::local(state)),
    });

    f.switch_to(b_use);
    f.terminate(Terminator::SwitchTag {
        scrutinee: Operand::Copy(Place::local(r)),
        arms: vec![(some, b_some), (nothing, b_none)],
        default: None,
    });

    f.switch_to(b_some);
    f.assign(
        Place::local(v),
        Rvalue::TagPayload {
            place: Place::local(r),
            variant: some,
            index: 0,
        },
    );
    emit_print_int(&mut f, types, v);
    f.goto(b_done);

    f.switch_to(b_none);
    f.goto(b_done);

    f.switch_to(b_done);
    f.terminate(Terminator::AsyncReturn(None));
    f.build()
}

#[test]
fn test_channel_rendezvous_between_tasks() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let chan_ty = types.chan_of(int64);
    let task_ty = types.task_of(types.unit());
    let outcome_ty = types.outcome_of(types.unit());

    let mut m = ModuleBuilder::new("rendezvous");
    let sender = m.add(build_sender(&mut types));
    let receiver = m.add(build_receiver(&mut types));

    let mut f = FunctionBuilder::new("main");
    let ch = f.local("ch", chan_ty);
    let t1 = f.local("t1", task_ty);
    let t2 = f.local("t2", task_ty);
    let o1 = f.temp(outcome_ty);
    let o2 = f.temp(outcome_ty);
    f.intrinsic(
        Some(Place::local(ch)),
        "make_channel",
        vec![Operand::Const(Const::Int(0, int64))],
        vec![int64],
    );
    f.inst(InstKind::Spawn {
        dst: Place::local(t1),
        callee: Callee::Func(sender),
        args: vec![Operand::Copy(Place::local(ch))],
    });
    f.inst(InstKind::Spawn {
        dst: Place::local(t2),
        callee: Callee::Func(receiver),
        args: vec![Operand::Copy(Place::local(ch))],
    });
    f.inst(InstKind::Await {
        dst: Some(Place::local(o1)),
        task: Operand::Copy(Place::local(t1)),
    });
    f.inst(InstKind::Await {
        dst: Some(Place::local(o2)),
        task: Operand::Copy(Place::local(t2)),
    });
    f.ret(Some(Operand::Const(Const::Int(0, int64))));
    let main = m.add(f.build());
    m.entry(main);

    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "42");
    assert_eq!(r.stats.live_blocks, 0);
}

// ---------------------------------------------------------------------------
// 5. Timeout cancels a long task
// ---------------------------------------------------------------------------

/// Poll function: checkpoint up to 1000 times, yielding between iterations,
/// with the counter carried in the state value.
fn build_looper(types: &mut TypeTable) -> volt_core::Function {
    let int64 = types.int64();
    let bool_ = types.bool_();

    let mut f = FunctionBuilder::new("looper");
    let state = f.param("state", int64);
    let _resume = f.param("resume", types.unit());
    let done = f.temp(bool_);
    let next = f.temp(int64);
    let b_work = f.block();
    let b_done = f.block();

    f.switch_to(volt_core::BlockId(0));
    f.assign(
        Place::local(done),
        Rvalue::Binary {
            op: volt_core::BinOp::Ge,
            lhs: Operand::Copy(Place::local(state)),
            rhs: Operand::Const(Const::Int(1000, int64)),
        },
    );
    f.terminate(Terminator::If {
        cond: Operand::Copy(Place::local(done)),
        then_blk: b_done,
        else_blk: b_work,
    });

    f.switch_to(b_work);
    f.intrinsic(None, "checkpoint", vec![], vec![]);
    f.assign(
        Place::local(next),
        Rvalue::Binary {
            op: volt_core::BinOp::Add,
            lhs: Operand::Copy(Place::local(state)),
            rhs: Operand::Const(Const::Int(1, int64)),
        },
    );
    f.terminate(Terminator::AsyncYield {
        state: Operand::Copy(Place::local(next)),
    });

    f.switch_to(b_done);
    f.terminate(Terminator::AsyncReturn(Some(Operand::Const(Const::Int(
        0, int64,
    )))));
    f.build()
}

#[test]
fn test_timeout_cancels_and_await_agrees() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let func_ty = types.func();
    let task_ty = types.task_of(int64);
    let outcome_ty = types.outcome_of(int64);
    let success = types.intern_symbol("Success");
    let cancelled = types.intern_symbol("Cancelled");

    let mut m = ModuleBuilder::new("timeout");
    let looper = m.add(build_looper(&mut types));

    let mut f = FunctionBuilder::new("main");
    let fv = f.temp(func_ty);
    let t = f.local("t", task_ty);
    let first = f.local("first", outcome_ty);
    let second = f.local("second", outcome_ty);
    f.assign_use(fv, Operand::Const(Const::Func(looper)));
    f.intrinsic(
        Some(Place::local(t)),
        "__task_create",
        vec![
            Operand::Copy(Place::local(fv)),
            Operand::Const(Const::Int(0, int64)),
        ],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(first)),
        "timeout",
        vec![
            Operand::Copy(Place::local(t)),
            Operand::Const(Const::Int(5, int64)),
        ],
        vec![],
    );
    // print C for a cancelled first outcome, S otherwise
    let b_c1 = f.block();
    let b_s1 = f.block();
    let b_await = f.block();
    f.switch_to(volt_core::BlockId(0));
    f.terminate(Terminator::SwitchTag {
        scrutinee: Operand::Copy(Place::local(first)),
        arms: vec![(cancelled, b_c1), (success, b_s1)],
        default: None,
    });
    f.switch_to(b_c1);
    emit_print_text(&mut f, &mut types, "C");
    f.goto(b_await);
    f.switch_to(b_s1);
    emit_print_text(&mut f, &mut types, "S");
    f.goto(b_await);

    f.switch_to(b_await);
    f.inst(InstKind::Await {
        dst: Some(Place::local(second)),
        task: Operand::Copy(Place::local(t)),
    });
    let b_c2 = f.block();
    let b_s2 = f.block();
    let b_end = f.block();
    f.switch_to(b_await);
    f.terminate(Terminator::SwitchTag {
        scrutinee: Operand::Copy(Place::local(second)),
        arms: vec![(cancelled, b_c2), (success, b_s2)],
        default: None,
    });
    f.switch_to(b_c2);
    emit_print_text(&mut f, &mut types, "C");
    f.goto(b_end);
    f.switch_to(b_s2);
    emit_print_text(&mut f, &mut types, "S");
    f.goto(b_end);
    f.switch_to(b_end);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));
    let main = m.add(f.build());
    m.entry(main);

    // 0.1 ms per clock read: the 5 ms deadline passes long before the
    // 1000-iteration loop finishes.
    let host = MockHost::new().with_tick(100_000);
    let r = run_with_host(m.build(), types, host);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "CC");
    assert_eq!(r.stats.live_blocks, 0, "cancelled task state must release");
}

// ---------------------------------------------------------------------------
// 6. String rope flatten
// ---------------------------------------------------------------------------

#[test]
fn test_small_concats_stay_flat_and_flatten_is_idempotent() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let str_ty = types.str_();

    let mut f = FunctionBuilder::new("main");
    let acc = f.local("acc", str_ty);
    let bytes = f.local("bytes", int64);
    let cps = f.local("cps", int64);
    let bytes_after = f.local("bytes_after", int64);
    f.assign_use(acc, Operand::Const(Const::Str("a".to_string())));
    for c in 'b'..='z' {
        f.assign(
            Place::local(acc),
            Rvalue::Binary {
                op: volt_core::BinOp::Add,
                lhs: Operand::Copy(Place::local(acc)),
                rhs: Operand::Const(Const::Str(c.to_string())),
            },
        );
    }
    f.intrinsic(
        Some(Place::local(bytes)),
        "rt_string_len_bytes",
        vec![Operand::Copy(Place::local(acc))],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(cps)),
        "rt_string_len",
        vec![Operand::Copy(Place::local(acc))],
        vec![],
    );
    f.intrinsic(
        None,
        "rt_string_force_flatten",
        vec![Operand::Copy(Place::local(acc))],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(bytes_after)),
        "rt_string_len_bytes",
        vec![Operand::Copy(Place::local(acc))],
        vec![],
    );
    emit_print_int(&mut f, &mut types, bytes);
    emit_print_text(&mut f, &mut types, " ");
    emit_print_int(&mut f, &mut types, cps);
    emit_print_text(&mut f, &mut types, " ");
    emit_print_int(&mut f, &mut types, bytes_after);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("rope");
    let main = m.add(f.build());
    m.entry(main);

    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "26 26 26");
    assert_eq!(r.stats.live_blocks, 0);
}
