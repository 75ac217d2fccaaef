//! Type table: interned types, symbols, tag layouts, struct layouts.
//!
//! Every value the VM handles carries a `TypeId` into this table. The table
//! also interns variant/field names as `Symbol`s so tag dispatch compares
//! small integers instead of strings.
//!
//! `TypeId::UNKNOWN` is a sentinel for producers that have not specialized
//! yet; consumers that require a concrete type must not accept it.

use rustc_hash::FxHashMap;
use std::fmt;

/// Interned identifier for variant and field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

/// Index into the type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Sentinel for "producer has not specialized yet".
    pub const UNKNOWN: TypeId = TypeId(u32::MAX);

    pub fn is_unknown(&self) -> bool {
        *self == TypeId::UNKNOWN
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "ty?")
        } else {
            write!(f, "ty{}", self.0)
        }
    }
}

/// One variant of a tagged union: an interned name (its stable symbol) and
/// the ordered payload types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagVariant {
    pub name: Symbol,
    pub payload: Vec<TypeId>,
}

/// Structural description of an interned type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Unit,
    Bool,
    /// Signed fixed-width integer; width in bits (8, 16, 32, 64).
    Int(u8),
    /// Unsigned fixed-width integer; width in bits.
    Uint(u8),
    /// Arbitrary-precision signed integer.
    IntBig,
    /// Arbitrary-precision unsigned integer.
    UintBig,
    /// Arbitrary-precision float.
    FloatBig,
    Str,
    Array(TypeId),
    Map(TypeId, TypeId),
    Struct {
        name: Symbol,
        fields: Vec<(Symbol, TypeId)>,
    },
    Union {
        name: Symbol,
        variants: Vec<TagVariant>,
    },
    Ref(TypeId),
    RefMut(TypeId),
    /// Raw pointer into the byte arena (or string/array bytes).
    Ptr,
    Range(TypeId),
    Chan(TypeId),
    Task(TypeId),
    Func,
}

/// Signedness/width classification used by checked arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntClass {
    Signed(u8),
    Unsigned(u8),
    Big,
    BigUnsigned,
}

impl IntClass {
    pub fn is_signed(&self) -> bool {
        matches!(self, IntClass::Signed(_) | IntClass::Big)
    }

    pub fn is_arbitrary(&self) -> bool {
        matches!(self, IntClass::Big | IntClass::BigUnsigned)
    }
}

/// The interner for types and symbols.
///
/// Also the tag-layout provider and struct-layout resolver for the runtime:
/// given a union's `TypeId` it yields the ordered variants, given a struct's
/// `TypeId` it yields named fields in declared order.
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    interned: FxHashMap<TypeKind, TypeId>,
    symbols: Vec<Box<str>>,
    symbol_ids: FxHashMap<Box<str>, Symbol>,

    unit: TypeId,
    bool_: TypeId,
    int64: TypeId,
    uint64: TypeId,
    int_big: TypeId,
    uint_big: TypeId,
    float_big: TypeId,
    str_: TypeId,
    ptr: TypeId,
    func: TypeId,
    os_error: TypeId,
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = TypeTable {
            kinds: Vec::new(),
            interned: FxHashMap::default(),
            symbols: Vec::new(),
            symbol_ids: FxHashMap::default(),
            unit: TypeId(0),
            bool_: TypeId(0),
            int64: TypeId(0),
            uint64: TypeId(0),
            int_big: TypeId(0),
            uint_big: TypeId(0),
            float_big: TypeId(0),
            str_: TypeId(0),
            ptr: TypeId(0),
            func: TypeId(0),
            os_error: TypeId(0),
        };
        table.unit = table.intern(TypeKind::Unit);
        table.bool_ = table.intern(TypeKind::Bool);
        table.int64 = table.intern(TypeKind::Int(64));
        table.uint64 = table.intern(TypeKind::Uint(64));
        table.int_big = table.intern(TypeKind::IntBig);
        table.uint_big = table.intern(TypeKind::UintBig);
        table.float_big = table.intern(TypeKind::FloatBig);
        table.str_ = table.intern(TypeKind::Str);
        table.ptr = table.intern(TypeKind::Ptr);
        table.func = table.intern(TypeKind::Func);
        let code = table.intern_symbol("code");
        let message = table.intern_symbol("message");
        let os_error_name = table.intern_symbol("OsError");
        let str_ = table.str_;
        table.os_error = table.intern(TypeKind::Struct {
            name: os_error_name,
            fields: vec![(code, str_), (message, str_)],
        });
        table
    }

    // ---- symbols ----

    pub fn intern_symbol(&mut self, name: &str) -> Symbol {
        if let Some(sym) = self.symbol_ids.get(name) {
            return *sym;
        }
        let sym = Symbol(self.symbols.len() as u32);
        self.symbols.push(name.into());
        self.symbol_ids.insert(name.into(), sym);
        sym
    }

    /// Look up a symbol without interning it.
    pub fn find_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbol_ids.get(name).copied()
    }

    pub fn symbol_name(&self, sym: Symbol) -> &str {
        &self.symbols[sym.0 as usize]
    }

    // ---- interning ----

    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.interned.get(&kind) {
            return *id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    /// The structural kind of an interned type. `None` for the UNKNOWN
    /// sentinel and for ids from another table.
    pub fn kind(&self, ty: TypeId) -> Option<&TypeKind> {
        if ty.is_unknown() {
            return None;
        }
        self.kinds.get(ty.0 as usize)
    }

    // ---- builtin accessors ----

    pub fn unit(&self) -> TypeId {
        self.unit
    }
    pub fn bool_(&self) -> TypeId {
        self.bool_
    }
    pub fn int64(&self) -> TypeId {
        self.int64
    }
    pub fn uint64(&self) -> TypeId {
        self.uint64
    }
    pub fn int_big(&self) -> TypeId {
        self.int_big
    }
    pub fn uint_big(&self) -> TypeId {
        self.uint_big
    }
    pub fn float_big(&self) -> TypeId {
        self.float_big
    }
    pub fn str_(&self) -> TypeId {
        self.str_
    }
    pub fn ptr(&self) -> TypeId {
        self.ptr
    }
    pub fn func(&self) -> TypeId {
        self.func
    }

    /// The struct type carried by the `error` variant of `Erring`:
    /// `OsError { code: Str, message: Str }`.
    pub fn os_error(&self) -> TypeId {
        self.os_error
    }

    // ---- composite constructors ----

    pub fn int_of_width(&mut self, bits: u8, signed: bool) -> TypeId {
        if signed {
            self.intern(TypeKind::Int(bits))
        } else {
            self.intern(TypeKind::Uint(bits))
        }
    }

    pub fn array_of(&mut self, elem: TypeId) -> TypeId {
        self.intern(TypeKind::Array(elem))
    }

    pub fn map_of(&mut self, key: TypeId, value: TypeId) -> TypeId {
        self.intern(TypeKind::Map(key, value))
    }

    pub fn ref_of(&mut self, ty: TypeId) -> TypeId {
        self.intern(TypeKind::Ref(ty))
    }

    pub fn ref_mut_of(&mut self, ty: TypeId) -> TypeId {
        self.intern(TypeKind::RefMut(ty))
    }

    pub fn range_of(&mut self, elem: TypeId) -> TypeId {
        self.intern(TypeKind::Range(elem))
    }

    pub fn chan_of(&mut self, elem: TypeId) -> TypeId {
        self.intern(TypeKind::Chan(elem))
    }

    pub fn task_of(&mut self, result: TypeId) -> TypeId {
        self.intern(TypeKind::Task(result))
    }

    pub fn struct_of(&mut self, name: &str, fields: &[(&str, TypeId)]) -> TypeId {
        let name = self.intern_symbol(name);
        let fields = fields
            .iter()
            .map(|(n, t)| (self.intern_symbol(n), *t))
            .collect();
        self.intern(TypeKind::Struct { name, fields })
    }

    pub fn union_of(&mut self, name: &str, variants: &[(&str, &[TypeId])]) -> TypeId {
        let name = self.intern_symbol(name);
        let variants = variants
            .iter()
            .map(|(n, payload)| TagVariant {
                name: self.intern_symbol(n),
                payload: payload.to_vec(),
            })
            .collect();
        self.intern(TypeKind::Union { name, variants })
    }

    /// `Option<T>`: `Some(T) | nothing`.
    pub fn option_of(&mut self, ty: TypeId) -> TypeId {
        self.union_of("Option", &[("Some", &[ty]), ("nothing", &[])])
    }

    /// `Erring<T>`: `Success(T) | error(OsError)` — the sum returned by every
    /// fallible OS-interface intrinsic.
    pub fn erring_of(&mut self, ty: TypeId) -> TypeId {
        let err = self.os_error;
        self.union_of("Erring", &[("Success", &[ty]), ("error", &[err])])
    }

    /// `Outcome<T>`: `Success(T) | Cancelled` — the sum produced by awaiting
    /// a task.
    pub fn outcome_of(&mut self, ty: TypeId) -> TypeId {
        self.union_of("Outcome", &[("Success", &[ty]), ("Cancelled", &[])])
    }

    // ---- queries ----

    pub fn int_class(&self, ty: TypeId) -> Option<IntClass> {
        match self.kind(ty)? {
            TypeKind::Int(bits) => Some(IntClass::Signed(*bits)),
            TypeKind::Uint(bits) => Some(IntClass::Unsigned(*bits)),
            TypeKind::IntBig => Some(IntClass::Big),
            TypeKind::UintBig => Some(IntClass::BigUnsigned),
            _ => None,
        }
    }

    /// Tag layout of a union type: ordered variants with names and payloads.
    pub fn tag_layout(&self, ty: TypeId) -> Option<&[TagVariant]> {
        match self.kind(ty)? {
            TypeKind::Union { variants, .. } => Some(variants),
            _ => None,
        }
    }

    /// Struct layout: named fields in declared order.
    pub fn struct_fields(&self, ty: TypeId) -> Option<&[(Symbol, TypeId)]> {
        match self.kind(ty)? {
            TypeKind::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn field_index(&self, ty: TypeId, name: Symbol) -> Option<u32> {
        self.struct_fields(ty)?
            .iter()
            .position(|(n, _)| *n == name)
            .map(|i| i as u32)
    }

    pub fn variant_index(&self, ty: TypeId, name: Symbol) -> Option<u32> {
        self.tag_layout(ty)?
            .iter()
            .position(|v| v.name == name)
            .map(|i| i as u32)
    }

    pub fn variant(&self, ty: TypeId, name: Symbol) -> Option<&TagVariant> {
        self.tag_layout(ty)?.iter().find(|v| v.name == name)
    }

    /// Referent type of a reference type.
    pub fn deref_of(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty)? {
            TypeKind::Ref(inner) | TypeKind::RefMut(inner) => Some(*inner),
            _ => None,
        }
    }

    /// Element type of an array type.
    pub fn elem_of(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty)? {
            TypeKind::Array(elem) => Some(*elem),
            _ => None,
        }
    }

    /// Human-readable rendering for diagnostics.
    pub fn display(&self, ty: TypeId) -> String {
        let Some(kind) = self.kind(ty) else {
            return "?".to_string();
        };
        match kind {
            TypeKind::Unit => "unit".to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Int(bits) => format!("i{bits}"),
            TypeKind::Uint(bits) => format!("u{bits}"),
            TypeKind::IntBig => "int".to_string(),
            TypeKind::UintBig => "uint".to_string(),
            TypeKind::FloatBig => "float".to_string(),
            TypeKind::Str => "string".to_string(),
            TypeKind::Array(elem) => format!("[{}]", self.display(*elem)),
            TypeKind::Map(k, v) => format!("{{{}: {}}}", self.display(*k), self.display(*v)),
            TypeKind::Struct { name, .. } | TypeKind::Union { name, .. } => {
                self.symbol_name(*name).to_string()
            }
            TypeKind::Ref(inner) => format!("&{}", self.display(*inner)),
            TypeKind::RefMut(inner) => format!("&mut {}", self.display(*inner)),
            TypeKind::Ptr => "ptr".to_string(),
            TypeKind::Range(elem) => format!("range<{}>", self.display(*elem)),
            TypeKind::Chan(elem) => format!("chan<{}>", self.display(*elem)),
            TypeKind::Task(res) => format!("task<{}>", self.display(*res)),
            TypeKind::Func => "func".to_string(),
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}
