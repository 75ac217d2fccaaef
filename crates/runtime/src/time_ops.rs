//! Clock and timing intrinsics.
//!
//! `monotonic_now` reads the host's monotonic clock in nanoseconds. Sleeps
//! park on a timer inside a task and drive the executor in the synchronous
//! context; timeouts run a task against a deadline, cancelling it when the
//! timer fires first.

use crate::error::VmResult;
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::value::Value;

/// `monotonic_now`: a nanosecond duration since an arbitrary origin.
pub(crate) fn monotonic_now(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "monotonic_now", ctx.args)?;
    let now = vm.host.monotonic_now();
    Ok(Value::int(now as i64, vm.types.int64()))
}

/// `checkpoint`: a yield point where cancellation is observed.
pub(crate) fn checkpoint_intrinsic(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "checkpoint", ctx.args)?;
    vm.checkpoint()?;
    Ok(Value::unit(vm.types.unit()))
}

/// `sleep(ms)`.
pub(crate) fn sleep(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [ms] = expect_args::<1>(vm, "sleep", ctx.args)?;
    let ms = arg_int(vm, "sleep", &ms)?;
    vm.sleep_ms(ms.max(0) as u64)?;
    Ok(Value::unit(vm.types.unit()))
}

/// `timeout(task, ms)`: the task's outcome, or `Cancelled` when the timer
/// fires first.
pub(crate) fn timeout(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [task, ms] = expect_args::<2>(vm, "timeout", ctx.args)?;
    let tid = vm.task_id_of(&task)?;
    let ms = arg_int(vm, "timeout", &ms)?;
    vm.timeout_task(tid, ms.max(0) as u64)
}
