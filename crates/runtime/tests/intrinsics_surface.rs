//! Coverage for the intrinsic surface: raw memory, strings, channels
//! through the dedicated instructions, stdio, and introspection.

use volt_core::{
    Const, FunctionBuilder, InstKind, ModuleBuilder, Operand, Place, Rvalue, TypeTable,
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
    let out = host.output();
    let mut vm = Vm::new(module, types, Box::new(host));
    let code = vm.run();
    Run {
        code,
        out,
        stats: vm.heap_stats(),
    }
}

fn emit_print_int(f: &mut FunctionBuilder, types: &mut TypeTable, src: volt_core::LocalId) {
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

// ---------------------------------------------------------------------------
// Raw memory
// ---------------------------------------------------------------------------

#[test]
fn test_raw_alloc_memcpy_memmove_free() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let ptr_ty = types.ptr();

    let str_ty = types.str_();
    let mut f = FunctionBuilder::new("main");
    let p = f.local("p", ptr_ty);
    let q = f.local("q", ptr_ty);
    let text = f.local("text", str_ty);
    let src = f.local("src", ptr_ty);
    f.intrinsic(
        Some(Place::local(p)),
        "rt_alloc",
        vec![
            Operand::Const(Const::Int(8, int64)),
            Operand::Const(Const::Int(8, int64)),
        ],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(q)),
        "rt_alloc",
        vec![
            Operand::Const(Const::Int(8, int64)),
            Operand::Const(Const::Int(8, int64)),
        ],
        vec![],
    );
    // string bytes are a valid memcpy source; the pointer does not retain,
    // so the string stays rooted in its local
    f.assign_use(text, Operand::Const(Const::Str("hi".to_string())));
    f.intrinsic(
        Some(Place::local(src)),
        "rt_string_bytes_view",
        vec![Operand::Copy(Place::local(text))],
        vec![],
    );
    f.intrinsic(
        None,
        "rt_memcpy",
        vec![
            Operand::Copy(Place::local(p)),
            Operand::Copy(Place::local(src)),
            Operand::Const(Const::Int(2, int64)),
        ],
        vec![],
    );
    f.intrinsic(
        None,
        "rt_memmove",
        vec![
            Operand::Copy(Place::local(q)),
            Operand::Copy(Place::local(p)),
            Operand::Const(Const::Int(2, int64)),
        ],
        vec![],
    );
    for block in [p, q] {
        f.intrinsic(
            None,
            "rt_free",
            vec![
                Operand::Copy(Place::local(block)),
                Operand::Const(Const::Int(8, int64)),
                Operand::Const(Const::Int(8, int64)),
            ],
            vec![],
        );
    }
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("rawmem");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    // the source string is dropped with its local; the raw arena is not
    // part of the heap census
    assert_eq!(r.stats.live_blocks, 0);
}

#[test]
fn test_raw_free_with_wrong_size_is_fatal() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let ptr_ty = types.ptr();

    let mut f = FunctionBuilder::new("main");
    let p = f.local("p", ptr_ty);
    f.intrinsic(
        Some(Place::local(p)),
        "rt_alloc",
        vec![
            Operand::Const(Const::Int(16, int64)),
            Operand::Const(Const::Int(8, int64)),
        ],
        vec![],
    );
    f.intrinsic(
        None,
        "rt_free",
        vec![
            Operand::Copy(Place::local(p)),
            Operand::Const(Const::Int(8, int64)),
            Operand::Const(Const::Int(8, int64)),
        ],
        vec![],
    );
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("badfree");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 1);
    assert!(r.out.stderr().starts_with("panic:"));
}

// ---------------------------------------------------------------------------
// String intrinsics
// ---------------------------------------------------------------------------

#[test]
fn test_string_slice_index_eq() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let str_ty = types.str_();
    let bool_ = types.bool_();

    let mut f = FunctionBuilder::new("main");
    let s = f.local("s", str_ty);
    let part = f.local("part", str_ty);
    let c = f.local("c", int64);
    let same = f.local("same", bool_);
    let flag = f.local("flag", int64);
    f.assign_use(s, Operand::Const(Const::Str("hello world".to_string())));
    f.intrinsic(
        Some(Place::local(part)),
        "rt_string_slice",
        vec![
            Operand::Copy(Place::local(s)),
            Operand::Const(Const::Int(6, int64)),
            Operand::Const(Const::Int(5, int64)),
        ],
        vec![],
    );
    // code point 0 of the slice is 'w' (119)
    f.intrinsic(
        Some(Place::local(c)),
        "rt_string_index",
        vec![
            Operand::Copy(Place::local(part)),
            Operand::Const(Const::Int(0, int64)),
        ],
        vec![],
    );
    emit_print_int(&mut f, &mut types, c);
    f.intrinsic(
        Some(Place::local(same)),
        "rt_string_eq",
        vec![
            Operand::Copy(Place::local(part)),
            Operand::Const(Const::Str("world".to_string())),
        ],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(flag)),
        "__to",
        vec![Operand::Copy(Place::local(same))],
        vec![int64],
    );
    emit_print_int(&mut f, &mut types, flag);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("strops");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "1191");
    assert_eq!(r.stats.live_blocks, 0, "slice must release its base");
}

// ---------------------------------------------------------------------------
// Channel instructions (synchronous forms)
// ---------------------------------------------------------------------------

#[test]
fn test_chan_send_recv_instructions() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let chan_ty = types.chan_of(int64);
    let opt_ty = types.option_of(int64);
    let some = types.intern_symbol("Some");
    let nothing = types.intern_symbol("nothing");

    let mut f = FunctionBuilder::new("main");
    let ch = f.local("ch", chan_ty);
    let o = f.local("o", opt_ty);
    let v = f.local("v", int64);
    // buffered channel: the instruction forms complete without a peer
    f.intrinsic(
        Some(Place::local(ch)),
        "make_channel",
        vec![Operand::Const(Const::Int(4, int64))],
        vec![int64],
    );
    f.inst(InstKind::ChanSend {
        chan: Operand::Copy(Place::local(ch)),
        value: Operand::Const(Const::Int(27, int64)),
    });
    f.inst(InstKind::ChanRecv {
        dst: Place::local(o),
        chan: Operand::Copy(Place::local(ch)),
    });
    let from = f.current();
    let b_some = f.block();
    let b_none = f.block();
    let b_end = f.block();
    f.switch_to(from);
    f.terminate(volt_core::Terminator::SwitchTag {
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
    f.goto(b_end);
    f.switch_to(b_end);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("chaninst");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "27");
    assert_eq!(r.stats.live_blocks, 0);
}

#[test]
fn test_close_then_recv_drains_and_try_send_fails() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let chan_ty = types.chan_of(int64);
    let opt_ty = types.option_of(int64);
    let bool_ = types.bool_();
    let some = types.intern_symbol("Some");
    let nothing = types.intern_symbol("nothing");

    let mut f = FunctionBuilder::new("main");
    let ch = f.local("ch", chan_ty);
    let sent = f.local("sent", bool_);
    let o = f.local("o", opt_ty);
    let flag = f.local("flag", int64);
    f.intrinsic(
        Some(Place::local(ch)),
        "make_channel",
        vec![Operand::Const(Const::Int(4, int64))],
        vec![int64],
    );
    f.inst(InstKind::ChanSend {
        chan: Operand::Copy(Place::local(ch)),
        value: Operand::Const(Const::Int(1, int64)),
    });
    f.intrinsic(
        None,
        "close",
        vec![Operand::Copy(Place::local(ch))],
        vec![],
    );
    // try_send on the closed channel reports false, no panic
    f.intrinsic(
        Some(Place::local(sent)),
        "try_send",
        vec![
            Operand::Copy(Place::local(ch)),
            Operand::Const(Const::Int(2, int64)),
        ],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(flag)),
        "__to",
        vec![Operand::Copy(Place::local(sent))],
        vec![int64],
    );
    emit_print_int(&mut f, &mut types, flag);
    // first recv drains the queued value, second reports end of stream
    for expect_some in [true, false] {
        f.inst(InstKind::ChanRecv {
            dst: Place::local(o),
            chan: Operand::Copy(Place::local(ch)),
        });
        let from = f.current();
        let b_some = f.block();
        let b_none = f.block();
        let b_next = f.block();
        f.switch_to(from);
        f.terminate(volt_core::Terminator::SwitchTag {
            scrutinee: Operand::Copy(Place::local(o)),
            arms: vec![(some, b_some), (nothing, b_none)],
            default: None,
        });
        f.switch_to(b_some);
        emit_print_text(&mut f, &mut types, if expect_some { "S" } else { "?" });
        f.goto(b_next);
        f.switch_to(b_none);
        emit_print_text(&mut f, &mut types, if expect_some { "?" } else { "N" });
        f.goto(b_next);
        f.switch_to(b_next);
    }
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("chanclose");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    assert_eq!(r.out.stdout(), "0SN");
    assert_eq!(r.stats.live_blocks, 0);
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
// Stdio and environment
// ---------------------------------------------------------------------------

#[test]
fn test_argv_readline_parse_arg() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let str_ty = types.str_();
    let args_ty = types.array_of(str_ty);
    let opt_str = types.option_of(str_ty);
    let erring_int = types.erring_of(int64);
    let some = types.intern_symbol("Some");
    let nothing = types.intern_symbol("nothing");
    let success = types.intern_symbol("Success");
    let error = types.intern_symbol("error");

    let mut f = FunctionBuilder::new("main");
    let args = f.local("args", args_ty);
    let n = f.local("n", int64);
    let line = f.local("line", opt_str);
    let parsed = f.local("parsed", erring_int);
    let v = f.local("v", int64);
    f.intrinsic(Some(Place::local(args)), "rt_argv", vec![], vec![]);
    f.intrinsic(
        Some(Place::local(n)),
        "__len",
        vec![Operand::Copy(Place::local(args))],
        vec![],
    );
    emit_print_int(&mut f, &mut types, n);
    f.intrinsic(Some(Place::local(line)), "readline", vec![], vec![]);
    {
        let from = f.current();
        let b_some = f.block();
        let b_none = f.block();
        let b_next = f.block();
        f.switch_to(from);
        f.terminate(volt_core::Terminator::SwitchTag {
            scrutinee: Operand::Copy(Place::local(line)),
            arms: vec![(some, b_some), (nothing, b_none)],
            default: None,
        });
        f.switch_to(b_some);
        let text = f.temp(str_ty);
        f.assign(
            Place::local(text),
            Rvalue::TagPayload {
                place: Place::local(line),
                variant: some,
                index: 0,
            },
        );
        f.intrinsic(
            None,
            "rt_write_stdout",
            vec![Operand::Copy(Place::local(text))],
            vec![],
        );
        f.goto(b_next);
        f.switch_to(b_none);
        f.goto(b_next);
        f.switch_to(b_next);
    }
    f.intrinsic(
        Some(Place::local(parsed)),
        "rt_parse_arg",
        vec![Operand::Const(Const::Int(1, int64))],
        vec![],
    );
    {
        let from = f.current();
        let b_ok = f.block();
        let b_err = f.block();
        let b_next = f.block();
        f.switch_to(from);
        f.terminate(volt_core::Terminator::SwitchTag {
            scrutinee: Operand::Copy(Place::local(parsed)),
            arms: vec![(success, b_ok), (error, b_err)],
            default: None,
        });
        f.switch_to(b_ok);
        f.assign(
            Place::local(v),
            Rvalue::TagPayload {
                place: Place::local(parsed),
                variant: success,
                index: 0,
            },
        );
        emit_print_int(&mut f, &mut types, v);
        f.goto(b_next);
        f.switch_to(b_err);
        f.goto(b_next);
        f.switch_to(b_next);
    }
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("stdio");
    let main = m.add(f.build());
    m.entry(main);

    let host = MockHost::new()
        .with_args(&["volt", "37"])
        .with_stdin("first line\nrest");
    let r = run_with_host(m.build(), types, host);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    // argv length, the read line, then the parsed argument
    assert_eq!(r.out.stdout(), "2first line37");
    assert_eq!(r.stats.live_blocks, 0);
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

#[test]
fn test_size_align_default_and_clone() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let i8_ = types.int_of_width(8, true);
    let point_ty = types.struct_of("Point", &[("b", i8_), ("n", int64)]);
    let arr_ty = types.array_of(int64);

    let mut f = FunctionBuilder::new("main");
    let size = f.local("size", int64);
    let align = f.local("align", int64);
    let d = f.local("d", int64);
    let a = f.local("a", arr_ty);
    let b = f.local("b", arr_ty);
    let n = f.local("n", int64);
    f.intrinsic(Some(Place::local(size)), "size_of", vec![], vec![point_ty]);
    f.intrinsic(Some(Place::local(align)), "align_of", vec![], vec![point_ty]);
    emit_print_int(&mut f, &mut types, size);
    emit_print_int(&mut f, &mut types, align);
    f.intrinsic(Some(Place::local(d)), "default", vec![], vec![int64]);
    emit_print_int(&mut f, &mut types, d);
    // clone-for-share: both locals release the same array cleanly
    f.assign(
        Place::local(a),
        Rvalue::ArrayLit {
            ty: arr_ty,
            elems: vec![
                Operand::Const(Const::Int(1, int64)),
                Operand::Const(Const::Int(2, int64)),
            ],
        },
    );
    f.intrinsic(
        Some(Place::local(b)),
        "__clone",
        vec![Operand::Copy(Place::local(a))],
        vec![],
    );
    f.intrinsic(
        Some(Place::local(n)),
        "__len",
        vec![Operand::Copy(Place::local(b))],
        vec![],
    );
    emit_print_int(&mut f, &mut types, n);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("introspect");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    // Point { b: i8, n: i64 } -> size 16, align 8; default int 0; len 2
    assert_eq!(r.out.stdout(), "16802");
    assert_eq!(r.stats.live_blocks, 0, "shared array must fully release");
}

#[test]
fn test_heap_stats_intrinsic_counts_allocations() {
    let mut types = TypeTable::new();
    let int64 = types.int64();
    let str_ty = types.str_();
    let stats_ty = types.struct_of(
        "HeapStats",
        &[
            ("allocs", int64),
            ("frees", int64),
            ("live_blocks", int64),
            ("live_bytes", int64),
            ("rc_incs", int64),
            ("rc_decs", int64),
        ],
    );
    let live_sym = types.intern_symbol("live_blocks");

    let mut f = FunctionBuilder::new("main");
    let s = f.local("s", str_ty);
    let stats = f.local("stats", stats_ty);
    let live = f.local("live", int64);
    f.assign_use(s, Operand::Const(Const::Str("resident".to_string())));
    f.intrinsic(Some(Place::local(stats)), "rt_heap_stats", vec![], vec![]);
    f.assign_use(
        live,
        Operand::Copy(Place::local(stats).field(volt_core::FieldSel::Named(live_sym))),
    );
    emit_print_int(&mut f, &mut types, live);
    f.ret(Some(Operand::Const(Const::Int(0, int64))));

    let mut m = ModuleBuilder::new("heapstats");
    let main = m.add(f.build());
    m.entry(main);
    let r = run(m.build(), types);
    assert_eq!(r.code, 0, "stderr: {}", r.out.stderr());
    // only the resident string is live when the counters are sampled
    assert_eq!(r.out.stdout(), "1");
    assert_eq!(r.stats.live_blocks, 0);
}
