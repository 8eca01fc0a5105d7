//! Symbol table: the read-only input view the emitter consults to locate
//! definitions, parameter lists, storage classes and sizes.

use std::cell::Cell;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    /// 2-byte DS-relative pointer; also used for string literals.
    String,
}

impl ScalarType {
    /// Size in bytes (pointers are always 2 bytes wide, per §4.2 `size_of`).
    pub fn size(self) -> u32 {
        match self {
            ScalarType::Bool | ScalarType::Uint8 => 1,
            ScalarType::Uint16 => 2,
            ScalarType::Uint32 => 4,
            ScalarType::String => 2,
        }
    }
}

/// `ReturnSymbolType` in the original source adds `Void`; functions that
/// return nothing carry `None` here rather than a sixth `ScalarType` variant,
/// since a scalar type always denotes an addressable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Scalar(ScalarType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    FunctionPrototype,
    EntryPoint,
    SharedFunction,
    Label,
    ScalarVar,
    StringVar,
}

/// One entry per named entity known at compile time (`Symbol`).
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub scalar_type: Option<ScalarType>,
    pub return_type: Option<ReturnType>,
    /// 1-based for parameters; 0 for everything else.
    pub parameter_index: u32,
    /// `None` for globals/statics.
    pub parent: Option<String>,
    pub is_temp: bool,
    /// IR index of the first instruction (functions/labels), or the final
    /// byte offset in the static-data segment for statics once resolved.
    pub ip: Cell<i64>,
    /// Stack size of locals+params for functions; finalized frame offset for
    /// locals; size-until-finalization for statics.
    pub offset_or_size: Cell<i64>,
    /// Reference count for `SharedFunction` symbols, bumped once per `Call`
    /// IR op that targets it (see SPEC_FULL.md §B.1). Zero for every other
    /// kind of symbol.
    pub ref_count: Cell<u32>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind) -> Self {
        Symbol {
            name: name.into(),
            kind,
            scalar_type: None,
            return_type: None,
            parameter_index: 0,
            parent: None,
            is_temp: false,
            ip: Cell::new(0),
            offset_or_size: Cell::new(0),
            ref_count: Cell::new(0),
        }
    }

    pub fn size(&self) -> u32 {
        self.scalar_type.map(ScalarType::size).unwrap_or(0)
    }

    pub fn bump_ref_count(&self) -> u32 {
        debug_assert_eq!(self.kind, SymbolKind::SharedFunction);
        let n = self.ref_count.get() + 1;
        self.ref_count.set(n);
        n
    }
}

/// Immutable-after-construction (except for `ip`/`ref_count` bookkeeping)
/// table of every symbol known to the compile, keyed by `(parent, name)`
/// with a global fallback, as required by §3's resolution invariant.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_scope: HashMap<(Option<String>, String), usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn insert(&mut self, symbol: Symbol) -> usize {
        let key = (symbol.parent.clone(), symbol.name.clone());
        let idx = self.symbols.len();
        self.symbols.push(symbol);
        self.by_scope.insert(key, idx);
        idx
    }

    pub fn get(&self, idx: usize) -> &Symbol {
        &self.symbols[idx]
    }

    pub fn symbol_at(&self, idx: usize) -> Option<&Symbol> {
        self.symbols.get(idx)
    }

    /// Function-local lookup first, then global fallback, per §3's
    /// resolution invariant.
    pub fn lookup_variable(&self, scope: Option<&str>, name: &str) -> Option<&Symbol> {
        if let Some(scope) = scope {
            if let Some(&idx) = self
                .by_scope
                .get(&(Some(scope.to_string()), name.to_string()))
            {
                return Some(&self.symbols[idx]);
            }
        }
        self.by_scope
            .get(&(None, name.to_string()))
            .map(|&idx| &self.symbols[idx])
    }

    pub fn resolve_function(&self, name: &str) -> Option<&Symbol> {
        self.by_scope
            .get(&(None, name.to_string()))
            .map(|&idx| &self.symbols[idx])
            .filter(|s| {
                matches!(
                    s.kind,
                    SymbolKind::Function | SymbolKind::FunctionPrototype | SymbolKind::EntryPoint
                )
            })
    }

    pub fn resolve_shared_function(&self, name: &str) -> Option<&Symbol> {
        self.by_scope
            .get(&(None, name.to_string()))
            .map(|&idx| &self.symbols[idx])
            .filter(|s| s.kind == SymbolKind::SharedFunction)
    }

    /// Ordered by `parameter_index`, per §3's order-matches-push-order
    /// invariant.
    pub fn parameters_of(&self, function_name: &str) -> Vec<&Symbol> {
        let mut params: Vec<&Symbol> = self
            .symbols
            .iter()
            .filter(|s| {
                s.parent.as_deref() == Some(function_name) && s.parameter_index > 0
            })
            .collect();
        params.sort_by_key(|s| s.parameter_index);
        params
    }

    /// Local (non-parameter) scalar variables of `function_name`, in
    /// declaration order — used to lay out the negative-offset half of the
    /// stack frame (frame layout).
    pub fn locals_of(&self, function_name: &str) -> Vec<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| {
                s.kind == SymbolKind::ScalarVar
                    && s.parent.as_deref() == Some(function_name)
                    && s.parameter_index == 0
            })
            .collect()
    }

    pub fn resolve_label(&self, name: &str) -> Option<&Symbol> {
        self.by_scope
            .get(&(None, name.to_string()))
            .map(|&idx| &self.symbols[idx])
            .filter(|s| s.kind == SymbolKind::Label)
    }

    pub fn all_shared_functions(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::SharedFunction)
    }

    pub fn all_string_literals(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::StringVar)
    }

    pub fn all_static_scalars(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::ScalarVar && s.parent.is_none())
    }

    pub fn entry_point(&self) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| s.kind == SymbolKind::EntryPoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_lookup_shadows_global() {
        let mut table = SymbolTable::new();
        let mut global = Symbol::new("x", SymbolKind::ScalarVar);
        global.scalar_type = Some(ScalarType::Uint16);
        table.insert(global);

        let mut local = Symbol::new("x", SymbolKind::ScalarVar);
        local.scalar_type = Some(ScalarType::Uint8);
        local.parent = Some("Foo".to_string());
        table.insert(local);

        let found = table.lookup_variable(Some("Foo"), "x").unwrap();
        assert_eq!(found.scalar_type, Some(ScalarType::Uint8));

        let found_global = table.lookup_variable(Some("Bar"), "x").unwrap();
        assert_eq!(found_global.scalar_type, Some(ScalarType::Uint16));
    }

    #[test]
    fn parameters_are_ordered_by_index() {
        let mut table = SymbolTable::new();
        for (name, idx) in [("b", 2), ("a", 1)] {
            let mut s = Symbol::new(name, SymbolKind::ScalarVar);
            s.scalar_type = Some(ScalarType::Uint32);
            s.parent = Some("F".to_string());
            s.parameter_index = idx;
            table.insert(s);
        }
        let params = table.parameters_of("F");
        assert_eq!(params.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn shared_function_ref_count_starts_at_zero() {
        let sym = Symbol::new("PrintString", SymbolKind::SharedFunction);
        assert_eq!(sym.ref_count.get(), 0);
        sym.bump_ref_count();
        sym.bump_ref_count();
        assert_eq!(sym.ref_count.get(), 2);
    }
}
