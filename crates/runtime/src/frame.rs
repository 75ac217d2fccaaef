//! Activation records and the per-slot state machine.
//!
//! A slot is uninitialized until first written, then moves through moved or
//! dropped exactly once. Reads require initialized and neither moved nor
//! dropped; each violation has its own panic kind so programs fail with the
//! precise ownership error.

use crate::error::{PanicKind, VmError, err};
use crate::value::Value;
use volt_core::{BlockId, FuncId, LocalDecl, Place, Span, TypeId};

/// A local or global storage cell with ownership bookkeeping.
#[derive(Debug)]
pub struct Slot {
    pub value: Value,
    pub initialized: bool,
    pub moved: bool,
    pub dropped: bool,
    /// Open borrows of this slot; it cannot move or drop while nonzero.
    pub borrows: u32,
    /// Debug name carried for ownership panics.
    pub name: Option<String>,
    pub ty: TypeId,
}

impl Slot {
    pub fn uninit(name: Option<String>, ty: TypeId) -> Self {
        Slot {
            value: Value::invalid(),
            initialized: false,
            moved: false,
            dropped: false,
            borrows: 0,
            name,
            ty,
        }
    }

    pub fn from_decl(decl: &LocalDecl) -> Self {
        Slot::uninit(decl.name.clone(), decl.ty)
    }

    fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("`{name}`"),
            None => "temporary".to_string(),
        }
    }

    /// Read-safety gate: initialized and neither moved nor dropped.
    pub fn check_readable(&self) -> Result<(), VmError> {
        if !self.initialized {
            return Err(err(
                PanicKind::UseBeforeInit,
                format!("use of uninitialized {}", self.describe()),
            ));
        }
        if self.moved {
            return Err(err(
                PanicKind::UseAfterMove,
                format!("use of moved {}", self.describe()),
            ));
        }
        if self.dropped {
            return Err(err(
                PanicKind::UseAfterFreeSlot,
                format!("use of dropped {}", self.describe()),
            ));
        }
        Ok(())
    }

    /// True when scope exit must release this slot's value.
    pub fn needs_drop(&self) -> bool {
        self.initialized && !self.moved && !self.dropped
    }

    /// Guard for move/drop/overwrite while a borrow is open.
    pub fn check_unborrowed(&self) -> Result<(), VmError> {
        if self.borrows > 0 {
            return Err(err(
                PanicKind::InvalidLocation,
                format!(
                    "{} is still borrowed ({} open borrow(s))",
                    self.describe(),
                    self.borrows
                ),
            ));
        }
        Ok(())
    }

    /// Mark moved; ownership of the count transfers to the new holder.
    pub fn take_moved(&mut self) -> Result<Value, VmError> {
        self.check_readable()?;
        self.check_unborrowed()?;
        self.moved = true;
        Ok(std::mem::replace(&mut self.value, Value::invalid()))
    }
}

/// One activation record: a function, its cursor, and its slots.
#[derive(Debug)]
pub struct Frame {
    pub func: FuncId,
    pub block: BlockId,
    pub ip: usize,
    pub slots: Vec<Slot>,
    /// Span of the instruction currently executing, for panic locations.
    pub span: Span,
    /// Where the caller wants the return value; `None` for root frames
    /// (main and task polls).
    pub return_dst: Option<Option<Place>>,
}

impl Frame {
    pub fn new(func: FuncId, entry: BlockId, locals: &[LocalDecl]) -> Self {
        Frame {
            func,
            block: entry,
            ip: 0,
            slots: locals.iter().map(Slot::from_decl).collect(),
            span: Span::DUMMY,
            return_dst: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot::uninit(Some("x".to_string()), TypeId(0))
    }

    #[test]
    fn test_read_uninitialized() {
        let s = slot();
        assert_eq!(s.check_readable().unwrap_err().kind, PanicKind::UseBeforeInit);
        assert!(!s.needs_drop());
    }

    #[test]
    fn test_read_after_move() {
        let mut s = slot();
        s.value = Value::int(1, TypeId(0));
        s.initialized = true;
        let v = s.take_moved().unwrap();
        assert_eq!(v.as_int(), Some(1));
        let e = s.check_readable().unwrap_err();
        assert_eq!(e.kind, PanicKind::UseAfterMove);
        assert!(e.message.contains("`x`"));
        assert!(!s.needs_drop());
    }

    #[test]
    fn test_read_after_drop() {
        let mut s = slot();
        s.initialized = true;
        s.dropped = true;
        assert_eq!(
            s.check_readable().unwrap_err().kind,
            PanicKind::UseAfterFreeSlot
        );
    }

    #[test]
    fn test_borrow_blocks_move() {
        let mut s = slot();
        s.value = Value::int(1, TypeId(0));
        s.initialized = true;
        s.borrows = 1;
        assert_eq!(
            s.take_moved().unwrap_err().kind,
            PanicKind::InvalidLocation
        );
        s.borrows = 0;
        assert!(s.take_moved().is_ok());
    }
}
