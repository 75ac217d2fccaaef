//! Volt runtime: the virtual machine behind the Volt language.
//!
//! Key design principles:
//! - Value: what programs talk about (ints, handles, references)
//! - Heap: every non-inline value is reference-counted with strict
//!   use-after-free, double-free, and leak detection
//! - Ownership is enforced at runtime through per-slot state machines and
//!   implicit reverse-order drops
//! - Concurrency is a single-threaded cooperative executor over lowered
//!   poll functions, with channels, timers, and a blocking pool

pub mod arena;
pub mod arithmetic;
pub mod array_ops;
pub mod bignum;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod file;
pub mod frame;
pub mod heap;
pub mod host;
pub mod interp;
pub mod intrinsics;
pub mod io;
pub mod map_ops;
pub mod place;
pub mod pool;
pub mod range_ops;
pub mod record;
pub mod rope;
pub mod scheduler;
pub mod string_ops;
pub mod tcp;
pub mod terminal;
pub mod time_ops;
pub mod value;
pub mod variant_ops;

// The embedding surface: build a module with volt-core, pick a host, run.
pub use config::VoltConfig;
pub use error::{OsCode, PanicKind, VmError};
pub use heap::HeapStats;
pub use host::{Host, MockHost, MockOutput, OsHost, TermEvent, Terminal};
pub use interp::Vm;
pub use record::{CollectTracer, Event, Recorder, Replayer, SharedLog, Tracer};
pub use value::{Handle, Location, LocationKind, RawHandle, Value, ValueKind};
