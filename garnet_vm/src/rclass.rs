//! Classes, modules, objects, and method entries.
//!
//! User-defined methods are `{iseq, captured nesting}` records in
//! per-class method tables; builtin behavior for primitives lives in the
//! registry next to the machine's globals. The lookup machinery dispatches
//! on the entry variant, so no host-level closures are involved.

use crate::iseq::Iseq;
use crate::value::Value;
use crate::vm::{CallArgs, Vm, VmResult};
use garnet_core::intern::Symbol;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// A native method implementation.
pub type NativeFn = fn(&mut Vm, Value, &CallArgs) -> VmResult<Value>;

/// A user-defined method: the body plus the constant nesting captured at
/// definition time.
#[derive(Debug, Clone)]
pub struct IseqMethod {
    /// Method body.
    pub iseq: Rc<Iseq>,
    /// Constant nesting at the definition site.
    pub nesting: Vec<Value>,
}

/// An entry in a method table.
#[derive(Clone)]
pub enum Method {
    /// Defined in bytecode.
    Iseq(IseqMethod),
    /// Implemented natively.
    Native(NativeFn),
    /// Explicitly undefined: lookup stops here with a NoMethodError.
    Undefined,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iseq(m) => write!(f, "Method::Iseq({})", m.iseq.name),
            Self::Native(_) => write!(f, "Method::Native"),
            Self::Undefined => write!(f, "Method::Undefined"),
        }
    }
}

/// A class or module.
#[derive(Debug)]
pub struct RClass {
    /// Printable name.
    pub name: String,
    /// Superclass link; `None` for the root and for modules.
    pub superclass: Option<Rc<RefCell<RClass>>>,
    /// Constant table.
    pub constants: FxHashMap<Symbol, Value>,
    /// Instance method table.
    pub methods: FxHashMap<Symbol, Method>,
    /// Class variable table.
    pub cvars: FxHashMap<Symbol, Value>,
    /// Class-level instance variables.
    pub ivars: FxHashMap<Symbol, Value>,
    /// Modules have no instances and no superclass chain.
    pub module: bool,
    /// Lazily created singleton class; holds this class's class methods.
    pub singleton: Option<Rc<RefCell<RClass>>>,
}

impl RClass {
    /// Create a class with the given superclass.
    #[must_use]
    pub fn new(name: impl Into<String>, superclass: Option<Rc<RefCell<RClass>>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            name: name.into(),
            superclass,
            constants: FxHashMap::default(),
            methods: FxHashMap::default(),
            cvars: FxHashMap::default(),
            ivars: FxHashMap::default(),
            module: false,
            singleton: None,
        }))
    }

    /// Create a module.
    #[must_use]
    pub fn module(name: impl Into<String>) -> Rc<RefCell<Self>> {
        let class = Self::new(name, None);
        class.borrow_mut().module = true;
        class
    }

    /// Bind a method entry under `name`.
    pub fn define_method(&mut self, name: Symbol, method: Method) {
        self.methods.insert(name, method);
    }

    /// Find a method along the superclass chain. Returns the entry and
    /// the class that owns it (super resolution restarts above the owner).
    /// An `Undefined` entry stops the walk.
    #[must_use]
    pub fn lookup(
        class: &Rc<RefCell<RClass>>,
        name: &Symbol,
    ) -> Option<(Method, Rc<RefCell<RClass>>)> {
        let mut current = Some(Rc::clone(class));
        while let Some(c) = current {
            if let Some(method) = c.borrow().methods.get(name) {
                return Some((method.clone(), Rc::clone(&c)));
            }
            current = c.borrow().superclass.clone();
        }
        None
    }

    /// Check whether `class` appears in `child`'s ancestor chain.
    #[must_use]
    pub fn is_ancestor_of(class: &Rc<RefCell<RClass>>, child: &Rc<RefCell<RClass>>) -> bool {
        let mut current = Some(Rc::clone(child));
        while let Some(c) = current {
            if Rc::ptr_eq(&c, class) {
                return true;
            }
            current = c.borrow().superclass.clone();
        }
        false
    }

    /// Get or create the singleton class of a class.
    #[must_use]
    pub fn singleton_class(class: &Rc<RefCell<RClass>>) -> Rc<RefCell<RClass>> {
        if let Some(singleton) = class.borrow().singleton.clone() {
            return singleton;
        }
        let name = format!("#<Class:{}>", class.borrow().name);
        let parent_singleton = class
            .borrow()
            .superclass
            .as_ref()
            .map(Self::singleton_class);
        let singleton = Self::new(name, parent_singleton);
        class.borrow_mut().singleton = Some(Rc::clone(&singleton));
        singleton
    }
}

/// A plain object: a class pointer plus instance state.
#[derive(Debug)]
pub struct RObject {
    /// The object's class.
    pub class: Rc<RefCell<RClass>>,
    /// Instance variable table.
    pub ivars: FxHashMap<Symbol, Value>,
    /// Lazily created per-object singleton class.
    pub singleton: Option<Rc<RefCell<RClass>>>,
}

impl RObject {
    /// Create an instance of `class` with no instance variables.
    #[must_use]
    pub fn new(class: Rc<RefCell<RClass>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            class,
            ivars: FxHashMap::default(),
            singleton: None,
        }))
    }

    /// Get or create the object's singleton class.
    #[must_use]
    pub fn singleton_class(object: &Rc<RefCell<RObject>>) -> Rc<RefCell<RClass>> {
        if let Some(singleton) = object.borrow().singleton.clone() {
            return singleton;
        }
        let class = Rc::clone(&object.borrow().class);
        let name = format!("#<Class:#<{}>>", class.borrow().name);
        let singleton = RClass::new(name, Some(class));
        object.borrow_mut().singleton = Some(Rc::clone(&singleton));
        singleton
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_core::intern::intern;

    fn native_stub(_vm: &mut Vm, _recv: Value, _args: &CallArgs) -> VmResult<Value> {
        Ok(Value::Nil)
    }

    #[test]
    fn test_lookup_walks_superclass_chain() {
        let parent = RClass::new("Parent", None);
        parent
            .borrow_mut()
            .define_method(intern("greet"), Method::Native(native_stub));
        let child = RClass::new("Child", Some(Rc::clone(&parent)));

        let (method, owner) = RClass::lookup(&child, &intern("greet")).unwrap();
        assert!(matches!(method, Method::Native(_)));
        assert!(Rc::ptr_eq(&owner, &parent));
        assert!(RClass::lookup(&child, &intern("missing")).is_none());
    }

    #[test]
    fn test_undefined_entry_shadows_parent() {
        let parent = RClass::new("Parent", None);
        parent
            .borrow_mut()
            .define_method(intern("greet"), Method::Native(native_stub));
        let child = RClass::new("Child", Some(Rc::clone(&parent)));
        child
            .borrow_mut()
            .define_method(intern("greet"), Method::Undefined);

        let (method, _) = RClass::lookup(&child, &intern("greet")).unwrap();
        assert!(matches!(method, Method::Undefined));
    }

    #[test]
    fn test_ancestry() {
        let a = RClass::new("A", None);
        let b = RClass::new("B", Some(Rc::clone(&a)));
        assert!(RClass::is_ancestor_of(&a, &b));
        assert!(!RClass::is_ancestor_of(&b, &a));
    }

    #[test]
    fn test_singleton_class_is_cached() {
        let class = RClass::new("Widget", None);
        let s1 = RClass::singleton_class(&class);
        let s2 = RClass::singleton_class(&class);
        assert!(Rc::ptr_eq(&s1, &s2));
        assert_eq!(s1.borrow().name, "#<Class:Widget>");
    }
}
