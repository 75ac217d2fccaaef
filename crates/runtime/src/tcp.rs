//! TCP intrinsics.
//!
//! Listeners and connections live in tables keyed by opaque integer
//! handles, touched only by the executor thread. The blocking
//! accept/read/write forms call straight into the host; the waitable forms
//! hand a readiness poll to the blocking pool and return a task handle for
//! the executor to await.

use crate::error::{OsCode, PanicKind, VmResult, err};
use crate::heap::ObjectPayload;
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::pool::BlockingOutcome;
use crate::rope;
use crate::value::{Value, ValueKind};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

#[derive(Default)]
pub struct NetTable {
    listeners: FxHashMap<i64, TcpListener>,
    conns: FxHashMap<i64, TcpStream>,
    next: i64,
}

impl NetTable {
    fn insert_listener(&mut self, listener: TcpListener) -> i64 {
        self.next += 1;
        self.listeners.insert(self.next, listener);
        self.next
    }

    fn insert_conn(&mut self, conn: TcpStream) -> i64 {
        self.next += 1;
        self.conns.insert(self.next, conn);
        self.next
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
        self.conns.clear();
    }
}

fn io_error(vm: &mut Vm, e: &std::io::Error) -> VmResult<Value> {
    let unit = vm.types.unit();
    vm.erring_error_value(unit, OsCode::from_io(e), &e.to_string())
}

fn addr_arg(vm: &mut Vm, name: &str, v: Value) -> VmResult<String> {
    match v.kind {
        ValueKind::Str(h) => {
            let addr = rope::materialize(&mut vm.heap, h)?;
            vm.release_owned(v)?;
            Ok(addr)
        }
        _ => {
            let msg = format!("{name}: expected address string, got {}", v.kind_name());
            vm.release_owned(v)?;
            Err(err(PanicKind::TypeMismatch, msg).into())
        }
    }
}

pub(crate) fn net_listen(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [addr] = expect_args::<1>(vm, "rt_net_listen", ctx.args)?;
    let addr = addr_arg(vm, "rt_net_listen", addr)?;
    match TcpListener::bind(&addr) {
        Ok(listener) => {
            let id = vm.net.insert_listener(listener);
            let v = Value::int(id, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn net_connect(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [addr] = expect_args::<1>(vm, "rt_net_connect", ctx.args)?;
    let addr = addr_arg(vm, "rt_net_connect", addr)?;
    match TcpStream::connect(&addr) {
        Ok(conn) => {
            let id = vm.net.insert_conn(conn);
            let v = Value::int(id, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

/// Blocking accept: the new connection's handle.
pub(crate) fn net_accept(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [l] = expect_args::<1>(vm, "rt_net_accept", ctx.args)?;
    let id = arg_int(vm, "rt_net_accept", &l)?;
    let Some(listener) = vm.net.listeners.get(&id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no listener {id}"));
    };
    match listener.accept() {
        Ok((conn, _)) => {
            let conn_id = vm.net.insert_conn(conn);
            let v = Value::int(conn_id, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

/// Blocking read of up to `max` bytes; an empty array is end-of-stream.
pub(crate) fn net_read(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [c, max] = expect_args::<2>(vm, "rt_net_read", ctx.args)?;
    let id = arg_int(vm, "rt_net_read", &c)?;
    let max = arg_int(vm, "rt_net_read", &max)?.max(0) as usize;
    let Some(conn) = vm.net.conns.get_mut(&id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no connection {id}"));
    };
    let mut buf = vec![0u8; max];
    match conn.read(&mut buf) {
        Ok(read) => {
            buf.truncate(read);
            let byte_ty = vm.types.int_of_width(8, false);
            let arr_ty = vm.types.array_of(byte_ty);
            let elems = buf
                .into_iter()
                .map(|b| Value::int(i64::from(b), byte_ty))
                .collect();
            let arr = vm.heap.alloc(arr_ty, ObjectPayload::Array(elems));
            let v = Value::new(arr_ty, ValueKind::Array(arr));
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn net_write(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [c, data] = expect_args::<2>(vm, "rt_net_write", ctx.args)?;
    let id = arg_int(vm, "rt_net_write", &c)?;
    let bytes = match data.kind {
        ValueKind::Str(h) => {
            let text = rope::materialize(&mut vm.heap, h)?;
            vm.release_owned(data)?;
            text.into_bytes()
        }
        ValueKind::Array(arr) => {
            let len = vm.array_len(arr)?;
            let mut out = Vec::with_capacity(len as usize);
            for i in 0..len {
                let elem = vm.array_get_snapshot(arr, i)?;
                let byte = elem.as_int().filter(|b| (0..=255).contains(b)).ok_or_else(|| {
                    err(PanicKind::TypeMismatch, "rt_net_write: array element is not a byte")
                })?;
                out.push(byte as u8);
            }
            vm.release_owned(data)?;
            out
        }
        _ => {
            let msg = format!("rt_net_write: cannot write {}", data.kind_name());
            vm.release_owned(data)?;
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
    };
    let Some(conn) = vm.net.conns.get_mut(&id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no connection {id}"));
    };
    match conn.write(&bytes) {
        Ok(written) => {
            let v = Value::int(written as i64, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn net_close(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h] = expect_args::<1>(vm, "rt_net_close", ctx.args)?;
    let id = arg_int(vm, "rt_net_close", &h)?;
    let removed = vm.net.listeners.remove(&id).is_some() || vm.net.conns.remove(&id).is_some();
    if removed {
        let unit_v = Value::unit(vm.types.unit());
        vm.erring_success_value(unit_v)
    } else {
        let unit = vm.types.unit();
        vm.erring_error_value(unit, OsCode::NotFound, &format!("no socket {id}"))
    }
}

/// Local address of a listener or connection, as "ip:port".
pub(crate) fn net_local_addr(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h] = expect_args::<1>(vm, "rt_net_local_addr", ctx.args)?;
    let id = arg_int(vm, "rt_net_local_addr", &h)?;
    let addr = vm
        .net
        .listeners
        .get(&id)
        .map(|l| l.local_addr())
        .or_else(|| vm.net.conns.get(&id).map(|c| c.local_addr()));
    match addr {
        Some(Ok(addr)) => {
            let str_ty = vm.types.str_();
            let h = rope::from_bytes(&mut vm.heap, str_ty, addr.to_string().as_bytes())?;
            let v = Value::new(str_ty, ValueKind::Str(h));
            vm.erring_success_value(v)
        }
        Some(Err(e)) => io_error(vm, &e),
        None => {
            let unit = vm.types.unit();
            vm.erring_error_value(unit, OsCode::NotFound, &format!("no socket {id}"))
        }
    }
}

/// Poll one fd for the given events on a pool thread. The fd stays owned by
/// the net table; the worker only waits on it.
fn spawn_fd_wait(vm: &mut Vm, fd: i32, events: i16) -> Value {
    let tid = vm.spawn_blocking_job(move || {
        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if rc < 0 {
            BlockingOutcome::Err(std::io::Error::last_os_error().to_string())
        } else {
            BlockingOutcome::Unit
        }
    });
    let ty = vm.types.task_of(volt_core::TypeId::UNKNOWN);
    Value::int(tid as i64, ty)
}

/// Waitable accept: a task that completes when the listener is readable.
pub(crate) fn net_wait_accept(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [l] = expect_args::<1>(vm, "rt_net_wait_accept", ctx.args)?;
    let id = arg_int(vm, "rt_net_wait_accept", &l)?;
    let Some(listener) = vm.net.listeners.get(&id) else {
        return Err(err(PanicKind::InvalidHandle, format!("no listener {id}")).into());
    };
    let fd = listener.as_raw_fd();
    Ok(spawn_fd_wait(vm, fd, libc::POLLIN))
}

pub(crate) fn net_wait_readable(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [c] = expect_args::<1>(vm, "rt_net_wait_readable", ctx.args)?;
    let id = arg_int(vm, "rt_net_wait_readable", &c)?;
    let Some(conn) = vm.net.conns.get(&id) else {
        return Err(err(PanicKind::InvalidHandle, format!("no connection {id}")).into());
    };
    let fd = conn.as_raw_fd();
    Ok(spawn_fd_wait(vm, fd, libc::POLLIN))
}

pub(crate) fn net_wait_writable(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [c] = expect_args::<1>(vm, "rt_net_wait_writable", ctx.args)?;
    let id = arg_int(vm, "rt_net_wait_writable", &c)?;
    let Some(conn) = vm.net.conns.get(&id) else {
        return Err(err(PanicKind::InvalidHandle, format!("no connection {id}")).into());
    };
    let fd = conn.as_raw_fd();
    Ok(spawn_fd_wait(vm, fd, libc::POLLOUT))
}
