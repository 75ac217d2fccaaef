//! Human-readable rendering of modules for debugging and logs.

use crate::program::*;
use std::fmt;

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {} ({})", self.name, self.source)?;
        for (i, func) in self.functions.iter().enumerate() {
            write!(f, "fn{i} {func}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}({} params)", self.name, self.params)?;
        for (i, local) in self.locals.iter().enumerate() {
            writeln!(
                f,
                "  _{}: {} // {}",
                i,
                local.ty,
                local.name.as_deref().unwrap_or("-")
            )?;
        }
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "  bb{i}:")?;
            for inst in &block.instructions {
                writeln!(f, "    {:?}", inst.kind)?;
            }
            writeln!(f, "    -> {:?}", block.terminator)?;
        }
        Ok(())
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            PlaceRoot::Local(id) => write!(f, "_{}", id.0)?,
            PlaceRoot::Global(id) => write!(f, "g{}", id.0)?,
        }
        for proj in &self.projections {
            match proj {
                Projection::Deref => write!(f, ".*")?,
                Projection::Field(FieldSel::Index(i)) => write!(f, ".{i}")?,
                Projection::Field(FieldSel::Named(sym)) => write!(f, ".#{}", sym.0)?,
                Projection::Index(local) => write!(f, "[_{}]", local.0)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FunctionBuilder, ModuleBuilder};
    use crate::types::TypeTable;

    #[test]
    fn test_render_place() {
        let p = Place::local(LocalId(1)).deref().field(FieldSel::Index(2));
        assert_eq!(p.to_string(), "_1.*.2");
    }

    #[test]
    fn test_render_module() {
        let types = TypeTable::new();
        let mut f = FunctionBuilder::new("main");
        let ret = f.local("ret", types.int64());
        f.ret(Some(Operand::Copy(Place::local(ret))));
        let mut m = ModuleBuilder::new("demo");
        m.add(f.build());
        let out = m.build().to_string();
        assert!(out.contains("module demo"));
        assert!(out.contains("main(0 params)"));
        assert!(out.contains("bb0:"));
    }
}
