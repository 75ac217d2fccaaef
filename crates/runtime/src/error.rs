//! Runtime failure kinds and the unwinding control type.
//!
//! Every fatal runtime failure carries a kind code from a fixed set. Panics
//! are terminal for user code: the dispatcher short-circuits the current
//! frame and unwinds the call stack, running implicit drops at each frame.
//! Recoverable failures (filesystem, network, parsing) are expressed as
//! `Erring` values instead and never unwind.

use thiserror::Error;
use volt_core::Span;

/// Fixed set of fatal failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanicKind {
    TypeMismatch,
    OutOfBounds,
    UseBeforeInit,
    UseAfterMove,
    /// Use of a freed heap object through a bare handle.
    UseAfterFreeHeap,
    /// Use of a dropped slot, by name.
    UseAfterFreeSlot,
    DoubleFree,
    InvalidHandle,
    InvalidLocation,
    InvalidNumericConversion,
    IntOverflow,
    DerefNonReference,
    StoreImmutableRef,
    TagPayloadNonTag,
    TagPayloadTagMismatch,
    TagPayloadIndexOutOfRange,
    SwitchTagNonTag,
    SwitchTagMissingDefault,
    UnknownTagLayout,
    UnsupportedIntrinsic,
    Unimplemented,
    HeapLeak,
    AsyncBackendMissing,
    /// Channel or await that can never make progress on an idle executor.
    Deadlock,
    InvalidReplayLogFormat,
    ReplayMismatch,
    ReplayLogExhausted,
    /// `rt_panic`: a panic raised by the program itself.
    User,
}

impl PanicKind {
    /// Stable code string used in panic messages and the event log.
    pub fn code(&self) -> &'static str {
        match self {
            PanicKind::TypeMismatch => "type-mismatch",
            PanicKind::OutOfBounds => "out-of-bounds",
            PanicKind::UseBeforeInit => "use-before-init",
            PanicKind::UseAfterMove => "use-after-move",
            PanicKind::UseAfterFreeHeap => "use-after-free",
            PanicKind::UseAfterFreeSlot => "use-after-free-slot",
            PanicKind::DoubleFree => "double-free",
            PanicKind::InvalidHandle => "invalid-handle",
            PanicKind::InvalidLocation => "invalid-location",
            PanicKind::InvalidNumericConversion => "invalid-numeric-conversion",
            PanicKind::IntOverflow => "int-overflow",
            PanicKind::DerefNonReference => "dereference-of-non-reference",
            PanicKind::StoreImmutableRef => "store-through-immutable-reference",
            PanicKind::TagPayloadNonTag => "tag-payload-on-non-tag",
            PanicKind::TagPayloadTagMismatch => "tag-payload-tag-mismatch",
            PanicKind::TagPayloadIndexOutOfRange => "tag-payload-index-out-of-range",
            PanicKind::SwitchTagNonTag => "switch-tag-on-non-tag",
            PanicKind::SwitchTagMissingDefault => "switch-tag-missing-default",
            PanicKind::UnknownTagLayout => "unknown-tag-layout",
            PanicKind::UnsupportedIntrinsic => "unsupported-intrinsic",
            PanicKind::Unimplemented => "unimplemented",
            PanicKind::HeapLeak => "heap-leak-detected",
            PanicKind::AsyncBackendMissing => "async-backend-not-implemented",
            PanicKind::Deadlock => "deadlock",
            PanicKind::InvalidReplayLogFormat => "invalid-replay-log-format",
            PanicKind::ReplayMismatch => "replay-mismatch",
            PanicKind::ReplayLogExhausted => "replay-log-exhausted",
            PanicKind::User => "panic",
        }
    }
}

/// A fatal runtime failure: kind code, message, and the span of the
/// instruction that raised it (when known).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct VmError {
    pub kind: PanicKind,
    pub message: String,
    pub span: Option<Span>,
}

impl VmError {
    pub fn new(kind: PanicKind, message: impl Into<String>) -> Self {
        VmError {
            kind,
            message: message.into(),
            span: None,
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        if self.span.is_none() && !span.is_dummy() {
            self.span = Some(span);
        }
        self
    }
}

/// Shorthand constructor used throughout the runtime.
pub fn err(kind: PanicKind, message: impl Into<String>) -> VmError {
    VmError::new(kind, message)
}

/// Why the dispatcher is abandoning the current frame chain.
#[derive(Debug)]
pub enum Unwind {
    /// A fatal panic; unwinds every frame, exit code 1.
    Panic(VmError),
    /// The exit intrinsic; unwinds every frame with the given code.
    Exit(i32),
    /// Cooperative cancellation observed inside a task; unwinds to the
    /// task's poll boundary only.
    Cancelled,
}

impl From<VmError> for Unwind {
    fn from(e: VmError) -> Self {
        Unwind::Panic(e)
    }
}

pub type VmResult<T> = Result<T, Unwind>;

/// Error codes carried by the `error` variant of `Erring`, shared by all
/// OS-interface intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsCode {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidPath,
    NotDir,
    NotFile,
    IsDir,
    InvalidData,
    Io,
    Unsupported,
}

impl OsCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsCode::NotFound => "NotFound",
            OsCode::PermissionDenied => "PermissionDenied",
            OsCode::AlreadyExists => "AlreadyExists",
            OsCode::InvalidPath => "InvalidPath",
            OsCode::NotDir => "NotDir",
            OsCode::NotFile => "NotFile",
            OsCode::IsDir => "IsDir",
            OsCode::InvalidData => "InvalidData",
            OsCode::Io => "Io",
            OsCode::Unsupported => "Unsupported",
        }
    }

    pub fn from_io(e: &std::io::Error) -> OsCode {
        use std::io::ErrorKind::*;
        match e.kind() {
            NotFound => OsCode::NotFound,
            PermissionDenied => OsCode::PermissionDenied,
            AlreadyExists => OsCode::AlreadyExists,
            InvalidData => OsCode::InvalidData,
            Unsupported => OsCode::Unsupported,
            _ => OsCode::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(PanicKind::UseAfterMove.code(), "use-after-move");
        assert_eq!(PanicKind::HeapLeak.code(), "heap-leak-detected");
        assert_eq!(
            PanicKind::StoreImmutableRef.code(),
            "store-through-immutable-reference"
        );
    }

    #[test]
    fn test_span_attaches_once() {
        let e = err(PanicKind::OutOfBounds, "index 3 out of bounds")
            .at(Span::new(1, 1))
            .at(Span::new(9, 9));
        assert_eq!(e.span, Some(Span::new(1, 1)));
    }

    #[test]
    fn test_os_code_from_io() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(OsCode::from_io(&e), OsCode::NotFound);
    }
}
