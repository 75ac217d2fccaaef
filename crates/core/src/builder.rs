//! Programmatic construction of modules and functions.
//!
//! Used by the runtime's test suites and by embedding front-ends. Function
//! ids can be reserved before their bodies exist so functions may reference
//! each other.

use crate::program::*;
use crate::span::Span;
use crate::types::TypeId;

pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        ModuleBuilder {
            module: Module {
                name: name.to_string(),
                source: format!("{name}.vt"),
                functions: Vec::new(),
                globals: Vec::new(),
                entry: None,
            },
        }
    }

    pub fn source(&mut self, source: &str) -> &mut Self {
        self.module.source = source.to_string();
        self
    }

    pub fn global(&mut self, name: &str, ty: TypeId) -> GlobalId {
        let id = GlobalId(self.module.globals.len() as u32);
        self.module.globals.push(Global {
            name: name.to_string(),
            ty,
        });
        id
    }

    /// Reserve an id for a function defined later (mutual recursion).
    pub fn reserve(&mut self, name: &str) -> FuncId {
        let id = FuncId(self.module.functions.len() as u32);
        self.module.functions.push(Function {
            name: name.to_string(),
            params: 0,
            locals: Vec::new(),
            blocks: Vec::new(),
            entry: BlockId(0),
            span: Span::DUMMY,
        });
        id
    }

    pub fn define(&mut self, id: FuncId, function: Function) {
        self.module.functions[id.0 as usize] = function;
    }

    pub fn add(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.module.functions.len() as u32);
        self.module.functions.push(function);
        id
    }

    /// Mark the entry function (the one the VM runs first).
    pub fn entry(&mut self, id: FuncId) -> &mut Self {
        self.module.entry = Some(id);
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}

/// Builds one function: declare locals, open blocks, push instructions.
///
/// Blocks start terminated by `Unreachable`; `terminate` replaces the
/// current block's terminator.
pub struct FunctionBuilder {
    function: Function,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        let mut f = FunctionBuilder {
            function: Function {
                name: name.to_string(),
                params: 0,
                locals: Vec::new(),
                blocks: Vec::new(),
                entry: BlockId(0),
                span: Span::DUMMY,
            },
            current: BlockId(0),
        };
        let entry = f.block();
        f.function.entry = entry;
        f
    }

    /// Declare a parameter local; parameters must be declared before other
    /// locals so argument binding lines up.
    pub fn param(&mut self, name: &str, ty: TypeId) -> LocalId {
        debug_assert_eq!(
            self.function.params as usize,
            self.function.locals.len(),
            "parameters must be declared first"
        );
        let id = self.local(name, ty);
        self.function.params += 1;
        id
    }

    pub fn local(&mut self, name: &str, ty: TypeId) -> LocalId {
        let id = LocalId(self.function.locals.len() as u32);
        self.function.locals.push(LocalDecl {
            name: Some(name.to_string()),
            ty,
            span: Span::DUMMY,
        });
        id
    }

    /// Anonymous temporary.
    pub fn temp(&mut self, ty: TypeId) -> LocalId {
        let id = LocalId(self.function.locals.len() as u32);
        self.function.locals.push(LocalDecl {
            name: None,
            ty,
            span: Span::DUMMY,
        });
        id
    }

    pub fn block(&mut self) -> BlockId {
        let id = BlockId(self.function.blocks.len() as u32);
        self.function.blocks.push(BasicBlock {
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        self.current = id;
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Block currently receiving instructions.
    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn inst(&mut self, kind: InstKind) {
        self.function.blocks[self.current.0 as usize]
            .instructions
            .push(Instruction {
                kind,
                span: Span::DUMMY,
            });
    }

    pub fn inst_at(&mut self, kind: InstKind, span: Span) {
        self.function.blocks[self.current.0 as usize]
            .instructions
            .push(Instruction { kind, span });
    }

    pub fn assign(&mut self, dst: Place, rvalue: Rvalue) {
        self.inst(InstKind::Assign { dst, rvalue });
    }

    /// `dst = operand`
    pub fn assign_use(&mut self, dst: LocalId, operand: Operand) {
        self.assign(Place::local(dst), Rvalue::Use(operand));
    }

    pub fn call(
        &mut self,
        dst: Option<Place>,
        callee: Callee,
        args: Vec<Operand>,
        type_args: Vec<TypeId>,
    ) {
        self.inst(InstKind::Call {
            dst,
            callee,
            args,
            type_args,
        });
    }

    /// Call a runtime intrinsic by name.
    pub fn intrinsic(
        &mut self,
        dst: Option<Place>,
        name: &str,
        args: Vec<Operand>,
        type_args: Vec<TypeId>,
    ) {
        self.call(dst, Callee::Name(name.to_string()), args, type_args);
    }

    pub fn drop_local(&mut self, local: LocalId) {
        self.inst(InstKind::Drop { local });
    }

    pub fn end_borrow(&mut self, local: LocalId) {
        self.inst(InstKind::EndBorrow { local });
    }

    pub fn terminate(&mut self, terminator: Terminator) {
        self.function.blocks[self.current.0 as usize].terminator = terminator;
    }

    pub fn ret(&mut self, operand: Option<Operand>) {
        self.terminate(Terminator::Return(operand));
    }

    pub fn goto(&mut self, target: BlockId) {
        self.terminate(Terminator::Goto(target));
    }

    pub fn build(self) -> Function {
        self.function
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeTable;

    #[test]
    fn test_build_minimal_module() {
        let types = TypeTable::new();
        let mut f = FunctionBuilder::new("main");
        let ret = f.local("ret", types.int64());
        f.assign_use(ret, Operand::Const(Const::Int(0, types.int64())));
        f.ret(Some(Operand::Copy(Place::local(ret))));

        let mut m = ModuleBuilder::new("demo");
        let main = m.add(f.build());
        m.entry(main);
        let module = m.build();

        assert_eq!(module.entry, Some(main));
        assert_eq!(module.function(main).blocks.len(), 1);
        assert_eq!(module.function(main).params, 0);
        assert_eq!(module.function_by_name("main"), Some(main));
    }

    #[test]
    fn test_params_bind_first() {
        let types = TypeTable::new();
        let mut f = FunctionBuilder::new("add1");
        let a = f.param("a", types.int64());
        let t = f.temp(types.int64());
        assert_eq!(a, LocalId(0));
        assert_eq!(t, LocalId(1));
        let built = f.build();
        assert_eq!(built.params, 1);
        assert_eq!(built.local(a).name.as_deref(), Some("a"));
        assert!(built.local(t).name.is_none());
    }

    #[test]
    fn test_reserve_then_define() {
        let mut m = ModuleBuilder::new("rec");
        let id = m.reserve("later");
        let f = FunctionBuilder::new("later");
        m.define(id, f.build());
        let module = m.build();
        assert_eq!(module.function(id).name, "later");
    }
}
