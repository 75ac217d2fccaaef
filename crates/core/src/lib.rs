//! Volt program representation
//!
//! Shared ground between the front-end (out of tree) and the runtime:
//! - `program`: the mid-level IR the VM executes (functions, blocks,
//!   instructions, terminators, places)
//! - `types`: the type table (interner), tag layouts, struct layouts
//! - `layout`: size/align/offset queries over interned types
//! - `builder`: programmatic construction of modules, used by the test
//!   suites and by embedding front-ends

pub mod builder;
pub mod layout;
pub mod print;
pub mod program;
pub mod span;
pub mod types;

pub use builder::{FunctionBuilder, ModuleBuilder};
pub use layout::{Layout, LayoutError};
pub use program::{
    BasicBlock, BinOp, BlockId, Callee, Const, FieldSel, FuncId, Function, Global, GlobalId,
    InstKind, Instruction, LocalDecl, LocalId, Module, Operand, Place, PlaceRoot, Projection,
    Rvalue, Terminator, UnOp,
};
pub use span::Span;
pub use types::{IntClass, Symbol, TagVariant, TypeId, TypeKind, TypeTable};
