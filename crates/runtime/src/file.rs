//! Filesystem intrinsics.
//!
//! Open files live in a table keyed by opaque integer handles; only the
//! executor thread touches it. Every operation returns `Erring<T>` — host
//! failures never unwind. An invalid path (empty or containing a NUL byte)
//! maps to the `InvalidPath` code before the host is consulted.

use crate::error::{OsCode, PanicKind, VmResult, err};
use crate::heap::ObjectPayload;
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::rope;
use crate::value::{Value, ValueKind};
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Default)]
pub struct FileTable {
    files: FxHashMap<i64, File>,
    next: i64,
}

impl FileTable {
    fn insert(&mut self, file: File) -> i64 {
        self.next += 1;
        self.files.insert(self.next, file);
        self.next
    }

    fn get_mut(&mut self, id: i64) -> Option<&mut File> {
        self.files.get_mut(&id)
    }

    fn remove(&mut self, id: i64) -> Option<File> {
        self.files.remove(&id)
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

/// Extract and validate a path argument. `Err` carries the ready-made
/// `Erring` error value for an invalid path.
fn path_arg(vm: &mut Vm, name: &str, v: Value) -> VmResult<Result<String, Value>> {
    let ValueKind::Str(h) = v.kind else {
        let msg = format!("{name}: expected path string, got {}", v.kind_name());
        vm.release_owned(v)?;
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    let path = rope::materialize(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    if path.is_empty() || path.contains('\0') {
        let unit = vm.types.unit();
        let e = vm.erring_error_value(unit, OsCode::InvalidPath, "invalid path")?;
        return Ok(Err(e));
    }
    Ok(Ok(path))
}

fn success_str(vm: &mut Vm, text: String) -> VmResult<Value> {
    let str_ty = vm.types.str_();
    let h = rope::from_bytes(&mut vm.heap, str_ty, text.as_bytes())?;
    let s = Value::new(str_ty, ValueKind::Str(h));
    vm.erring_success_value(s)
}

fn io_error(vm: &mut Vm, e: &std::io::Error) -> VmResult<Value> {
    let unit = vm.types.unit();
    vm.erring_error_value(unit, OsCode::from_io(e), &e.to_string())
}

/// Some path failures deserve more specific codes than io's.
fn classified_error(vm: &mut Vm, path: &str, e: &std::io::Error, want_file: bool) -> VmResult<Value> {
    let meta = std::fs::metadata(path);
    let unit = vm.types.unit();
    if let Ok(meta) = meta {
        if want_file && meta.is_dir() {
            return vm.erring_error_value(unit, OsCode::IsDir, &format!("{path} is a directory"));
        }
        if !want_file && !meta.is_dir() {
            return vm.erring_error_value(unit, OsCode::NotDir, &format!("{path} is not a directory"));
        }
    }
    io_error(vm, e)
}

pub(crate) fn fs_cwd(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_fs_cwd", ctx.args)?;
    match std::env::current_dir() {
        Ok(path) => success_str(vm, path.to_string_lossy().into_owned()),
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn fs_metadata(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_metadata", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_metadata", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::metadata(&path) {
        Ok(meta) => {
            let int64 = vm.types.int64();
            let bool_ = vm.types.bool_();
            let meta_ty = vm.types.struct_of(
                "Metadata",
                &[
                    ("size", int64),
                    ("is_dir", bool_),
                    ("is_file", bool_),
                    ("readonly", bool_),
                ],
            );
            let h = vm.heap.alloc(
                meta_ty,
                ObjectPayload::Struct(vec![
                    Value::int(meta.len() as i64, int64),
                    Value::bool_(meta.is_dir(), bool_),
                    Value::bool_(meta.is_file(), bool_),
                    Value::bool_(meta.permissions().readonly(), bool_),
                ]),
            );
            let v = Value::new(meta_ty, ValueKind::Struct(h));
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn fs_read_dir(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_read_dir", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_read_dir", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::read_dir(&path) {
        Ok(entries) => {
            let mut names: Vec<String> = Vec::new();
            for entry in entries {
                match entry {
                    Ok(entry) => names.push(entry.file_name().to_string_lossy().into_owned()),
                    Err(e) => return io_error(vm, &e),
                }
            }
            // host readdir order is arbitrary; keep output deterministic
            names.sort();
            let str_ty = vm.types.str_();
            let arr_ty = vm.types.array_of(str_ty);
            let mut elems = Vec::with_capacity(names.len());
            for name in names {
                let h = rope::from_bytes(&mut vm.heap, str_ty, name.as_bytes())?;
                elems.push(Value::new(str_ty, ValueKind::Str(h)));
            }
            let h = vm.heap.alloc(arr_ty, ObjectPayload::Array(elems));
            let v = Value::new(arr_ty, ValueKind::Array(h));
            vm.erring_success_value(v)
        }
        Err(e) => classified_error(vm, &path, &e, false),
    }
}

pub(crate) fn fs_mkdir(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_mkdir", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_mkdir", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::create_dir(&path) {
        Ok(()) => {
            let unit = Value::unit(vm.types.unit());
            vm.erring_success_value(unit)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn fs_remove_file(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_remove_file", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_remove_file", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::remove_file(&path) {
        Ok(()) => {
            let unit = Value::unit(vm.types.unit());
            vm.erring_success_value(unit)
        }
        Err(e) => classified_error(vm, &path, &e, true),
    }
}

pub(crate) fn fs_remove_dir(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_remove_dir", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_remove_dir", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::remove_dir(&path) {
        Ok(()) => {
            let unit = Value::unit(vm.types.unit());
            vm.erring_success_value(unit)
        }
        Err(e) => classified_error(vm, &path, &e, false),
    }
}

pub(crate) fn fs_open(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p, mode] = expect_args::<2>(vm, "rt_fs_open", ctx.args)?;
    let mode_text = match mode.kind {
        ValueKind::Str(h) => rope::materialize(&mut vm.heap, h)?,
        _ => {
            let msg = format!("rt_fs_open: mode is {}, not string", mode.kind_name());
            vm.release_owned(mode)?;
            vm.release_owned(p)?;
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
    };
    vm.release_owned(mode)?;
    let path = match path_arg(vm, "rt_fs_open", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    let mut options = OpenOptions::new();
    match mode_text.as_str() {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "rw" => options.read(true).write(true).create(true),
        other => {
            let unit = vm.types.unit();
            return vm.erring_error_value(
                unit,
                OsCode::Unsupported,
                &format!("unknown open mode `{other}`"),
            );
        }
    };
    match options.open(&path) {
        Ok(file) => {
            let id = vm.files.insert(file);
            let v = Value::int(id, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => classified_error(vm, &path, &e, true),
    }
}

fn file_handle_arg(vm: &mut Vm, name: &str, v: Value) -> VmResult<i64> {
    let id = arg_int(vm, name, &v)?;
    Ok(id)
}

pub(crate) fn fs_close(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h] = expect_args::<1>(vm, "rt_fs_close", ctx.args)?;
    let id = file_handle_arg(vm, "rt_fs_close", h)?;
    let unit_v = Value::unit(vm.types.unit());
    match vm.files.remove(id) {
        Some(_) => vm.erring_success_value(unit_v),
        None => {
            let unit = vm.types.unit();
            vm.erring_error_value(unit, OsCode::NotFound, &format!("no open file {id}"))
        }
    }
}

pub(crate) fn fs_read(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h, n] = expect_args::<2>(vm, "rt_fs_read", ctx.args)?;
    let id = file_handle_arg(vm, "rt_fs_read", h)?;
    let n = arg_int(vm, "rt_fs_read", &n)?.max(0) as usize;
    let Some(file) = vm.files.get_mut(id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no open file {id}"));
    };
    let mut buf = vec![0u8; n];
    match file.read(&mut buf) {
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

pub(crate) fn fs_write(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h, data] = expect_args::<2>(vm, "rt_fs_write", ctx.args)?;
    let id = file_handle_arg(vm, "rt_fs_write", h)?;
    let bytes = match data.kind {
        ValueKind::Str(s) => {
            let text = rope::materialize(&mut vm.heap, s)?;
            vm.release_owned(data)?;
            text.into_bytes()
        }
        ValueKind::Array(arr) => {
            let len = vm.array_len(arr)?;
            let mut out = Vec::with_capacity(len as usize);
            for i in 0..len {
                let elem = vm.array_get_snapshot(arr, i)?;
                let byte = elem.as_int().filter(|b| (0..=255).contains(b)).ok_or_else(|| {
                    err(PanicKind::TypeMismatch, "rt_fs_write: array element is not a byte")
                })?;
                out.push(byte as u8);
            }
            vm.release_owned(data)?;
            out
        }
        _ => {
            let msg = format!("rt_fs_write: cannot write {}", data.kind_name());
            vm.release_owned(data)?;
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
    };
    let Some(file) = vm.files.get_mut(id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no open file {id}"));
    };
    match file.write(&bytes) {
        Ok(written) => {
            let v = Value::int(written as i64, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

/// `rt_fs_seek(handle, pos, whence)`: whence 0 = start, 1 = current,
/// 2 = end. Returns the new offset.
pub(crate) fn fs_seek(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h, pos, whence] = expect_args::<3>(vm, "rt_fs_seek", ctx.args)?;
    let id = file_handle_arg(vm, "rt_fs_seek", h)?;
    let pos = arg_int(vm, "rt_fs_seek", &pos)?;
    let whence = arg_int(vm, "rt_fs_seek", &whence)?;
    let seek = match whence {
        0 => SeekFrom::Start(pos.max(0) as u64),
        1 => SeekFrom::Current(pos),
        2 => SeekFrom::End(pos),
        other => {
            return Err(err(
                PanicKind::TypeMismatch,
                format!("rt_fs_seek: invalid whence {other}"),
            )
            .into());
        }
    };
    let Some(file) = vm.files.get_mut(id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no open file {id}"));
    };
    match file.seek(seek) {
        Ok(offset) => {
            let v = Value::int(offset as i64, vm.types.int64());
            vm.erring_success_value(v)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn fs_flush(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [h] = expect_args::<1>(vm, "rt_fs_flush", ctx.args)?;
    let id = file_handle_arg(vm, "rt_fs_flush", h)?;
    let Some(file) = vm.files.get_mut(id) else {
        let unit = vm.types.unit();
        return vm.erring_error_value(unit, OsCode::NotFound, &format!("no open file {id}"));
    };
    match file.flush() {
        Ok(()) => {
            let unit_v = Value::unit(vm.types.unit());
            vm.erring_success_value(unit_v)
        }
        Err(e) => io_error(vm, &e),
    }
}

pub(crate) fn fs_read_file(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_read_file", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_read_file", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::read(&path) {
        Ok(bytes) => {
            let str_ty = vm.types.str_();
            match rope::from_bytes(&mut vm.heap, str_ty, &bytes) {
                Ok(h) => {
                    let s = Value::new(str_ty, ValueKind::Str(h));
                    vm.erring_success_value(s)
                }
                Err(e) => {
                    let unit = vm.types.unit();
                    vm.erring_error_value(unit, OsCode::InvalidData, &e.message)
                }
            }
        }
        Err(e) => classified_error(vm, &path, &e, true),
    }
}

pub(crate) fn fs_write_file(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p, data] = expect_args::<2>(vm, "rt_fs_write_file", ctx.args)?;
    let text = match data.kind {
        ValueKind::Str(h) => rope::materialize(&mut vm.heap, h)?,
        _ => {
            let msg = format!("rt_fs_write_file: cannot write {}", data.kind_name());
            vm.release_owned(data)?;
            vm.release_owned(p)?;
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
    };
    vm.release_owned(data)?;
    let path = match path_arg(vm, "rt_fs_write_file", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::write(&path, text.as_bytes()) {
        Ok(()) => {
            let unit_v = Value::unit(vm.types.unit());
            vm.erring_success_value(unit_v)
        }
        Err(e) => io_error(vm, &e),
    }
}

/// Final component of a path.
pub(crate) fn fs_file_name(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_file_name", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_file_name", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    let name = Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    success_str(vm, name)
}

/// "file", "dir", or "other".
pub(crate) fn fs_file_type(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [p] = expect_args::<1>(vm, "rt_fs_file_type", ctx.args)?;
    let path = match path_arg(vm, "rt_fs_file_type", p)? {
        Ok(path) => path,
        Err(e) => return Ok(e),
    };
    match std::fs::metadata(&path) {
        Ok(meta) => {
            let kind = if meta.is_file() {
                "file"
            } else if meta.is_dir() {
                "dir"
            } else {
                "other"
            };
            success_str(vm, kind.to_string())
        }
        Err(e) => io_error(vm, &e),
    }
}
