// File: src/value.rs
//
// The `Value` type: Fun's tagged union of scalars and reference-counted
// compound types, plus the copy/equality/truthiness/stringification rules
// that the VM's opcode handlers rely on (spec §3.1).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::Bytecode;
use crate::map::FunMap;

/// A single Fun runtime value. Compounds (`Array`, `Map`) are shared via
/// `Rc<RefCell<_>>` — single VM, single thread, so no atomics are needed
/// (spec §5: cross-VM sharing is not supported, cycles cannot be built by
/// the language surface because reads always clone and writes always
/// replace).
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<FunMap>>),
    Function(Rc<Bytecode>),
}

impl Value {
    pub fn new_array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn new_map(map: FunMap) -> Self {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    pub fn empty_array() -> Self {
        Self::new_array(Vec::new())
    }

    pub fn empty_map() -> Self {
        Self::new_map(FunMap::new())
    }

    /// `deep_clone` recurses into Array/Map contents, producing fully
    /// independent copies. Function values stay a shared reference — the
    /// block itself is never duplicated (spec §3.1).
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Array(a) => {
                let cloned: Vec<Value> = a.borrow().iter().map(|v| v.deep_clone()).collect();
                Value::new_array(cloned)
            }
            Value::Map(m) => {
                let cloned = m.borrow().deep_clone();
                Value::new_map(cloned)
            }
            other => other.clone(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Map(_) => true,
            Value::Function(_) => true,
        }
    }

    /// Structural equality on same-tagged scalars; identity for Function
    /// and for Array/Map (the core leaves compound equality undefined
    /// beyond reference identity, spec §3.1); `Int`<->`Bool` interop
    /// compares numerically (`1 == true`, `0 == false`).
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Int(i), Value::Bool(b)) | (Value::Bool(b), Value::Int(i)) => {
                (*i != 0) == *b
            }
            _ => false,
        }
    }

    pub fn typeof_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "Number",
            Value::Float(_) => "Number",
            Value::Str(_) => "String",
            Value::Function(_) => "Function",
            Value::Array(_) => "Array",
            Value::Map(_) => "Map",
            Value::Nil => "Nil",
            Value::Bool(_) => "Number",
        }
    }

    /// Canonical text form used by `PRINT`: recursive for Array/Map
    /// (decided in SPEC_FULL.md §11, matching the spec's test scenarios).
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{}", f),
            Value::Str(s) => s.clone(),
            Value::Array(a) => {
                let items: Vec<String> = a.borrow().iter().map(|v| v.to_display_string()).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Map(m) => {
                let borrow = m.borrow();
                let items: Vec<String> = borrow
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {}", k, v.to_display_string()))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::Function(f) => format!("<function@{:p}>", Rc::as_ptr(f)),
        }
    }

    /// Canonical text form used by `TO_STRING`/`CAST string`: non-recursive
    /// summary for compounds (spec §4.2's `[array n=N]` form), allowed to
    /// diverge from `PRINT`'s recursive form per spec.md §9.
    pub fn to_string_summary(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{}", f),
            Value::Str(s) => s.clone(),
            Value::Array(a) => format!("[array n={}]", a.borrow().len()),
            Value::Map(m) => format!("[map n={}]", m.borrow().len()),
            Value::Function(f) => format!("<function@{:p}>", Rc::as_ptr(f)),
        }
    }

    /// `TO_NUMBER`: Int/Float pass through, String parsed as decimal
    /// (whitespace-tolerant, anything else yields 0), other types yield 0.
    pub fn to_number(&self) -> Value {
        match self {
            Value::Int(_) | Value::Float(_) => self.clone(),
            Value::Str(s) => {
                let trimmed = s.trim();
                match trimmed.parse::<i64>() {
                    Ok(n) => Value::Int(n),
                    Err(_) => Value::Int(0),
                }
            }
            _ => Value::Int(0),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_spec() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(1).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Str("x".to_string()).is_truthy());
        assert!(!Value::empty_array().is_truthy());
        assert!(Value::empty_map().is_truthy());
    }

    #[test]
    fn int_bool_equality_interop() {
        assert!(Value::Int(1).equals(&Value::Bool(true)));
        assert!(Value::Int(0).equals(&Value::Bool(false)));
        assert!(!Value::Int(2).equals(&Value::Bool(true)));
    }

    #[test]
    fn deep_clone_is_independent() {
        let inner = Value::new_array(vec![Value::Int(1), Value::Int(2)]);
        let outer = Value::new_array(vec![inner.clone()]);
        let cloned = outer.deep_clone();
        if let Value::Array(a) = &cloned {
            if let Value::Array(inner_clone) = &a.borrow()[0] {
                inner_clone.borrow_mut().push(Value::Int(3));
            }
        }
        if let Value::Array(a) = &inner {
            assert_eq!(a.borrow().len(), 2, "original must not observe the clone's mutation");
        }
    }

    #[test]
    fn display_string_is_recursive_for_arrays() {
        let arr = Value::new_array(vec![Value::Int(1), Value::Str("x".to_string())]);
        assert_eq!(arr.to_display_string(), "[1, x]");
        assert_eq!(arr.to_string_summary(), "[array n=2]");
    }
}
