//! Resolution procedures
//!
//! The compiler turns a dependency graph into a [`Procedure`]: a flat list of
//! stack-machine [`Op`]s whose operands index into a shared constants table.
//! A [`Backend`] turns a procedure into an [`Invoker`] that can be called
//! concurrently from any thread.
//!
//! Nested bodies (lifetime-managed creation, graph-shared slots, lazy
//! decorator targets) are procedures themselves, stored as constants.

mod backend;

pub use backend::{Backend, Interpreter, Invocation, Invoker};

use crate::decorator::{DecorateFn, InitializeFn};
use crate::lifetime::LifetimeStrategy;
use crate::metadata::{CastFn, ConstructFn, SetterFn};
use crate::registration::FactoryFn;
use crate::types::{CollectionKind, ServiceKey, TypeRef};
use crate::value::{DisposeCast, Instance};
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One stack-machine instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push a constant value.
    PushConstant(usize),
    /// Push a runtime argument of the invocation.
    PushArgument(usize),
    /// Copy the top of the stack into a frame local.
    StoreLocal(usize),
    /// Push the local if set, otherwise run `body` (which stores it).
    LoadLocalOr { slot: usize, body: usize },
    /// Pop `argc` arguments, push the constructed instance.
    Construct { constructor: usize, argc: usize },
    /// Push the result of a factory called with the runtime arguments.
    CallFactory(usize),
    /// Pop a value and assign it to a property of the instance on top.
    SetProperty(usize),
    /// Run an initializer on the instance on top.
    Initialize(usize),
    /// Replace the top instance with its decorated form.
    Decorate(usize),
    /// Re-type the top instance as a service type.
    Cast(usize),
    /// Record the disposable view of the top instance for the enclosing lifetime.
    Capture(usize),
    /// Pop `len` items, push them as one collection.
    NewCollection {
        kind: CollectionKind,
        item_type: usize,
        len: usize,
    },
    /// Let a lifetime strategy decide whether `body` runs.
    WithLifetime { lifetime: usize, body: usize },
    /// Push a `Lazy` that runs `body` in its own frame on first access.
    MakeLazy { service: usize, body: usize },
    /// Push a `Lazy` resolving a service through the container.
    ResolveLazy(usize),
    /// Push a `Func` resolving a service through the container.
    ResolveFunc { service: usize, arity: usize },
}

/// Operand of an [`Op`].
#[derive(Clone)]
pub enum Constant {
    Value(Instance),
    Type(TypeRef),
    Key(ServiceKey),
    Constructor { owner: TypeRef, invoke: ConstructFn },
    Factory(FactoryFn),
    Setter(SetterFn),
    Initializer(InitializeFn),
    Decorator(DecorateFn),
    Cast(CastFn),
    Disposer(DisposeCast),
    Lifetime {
        strategy: Arc<dyn LifetimeStrategy>,
        service: TypeRef,
    },
    Procedure(Arc<Procedure>),
}

impl Constant {
    fn dedup_key(&self) -> ConstantKey {
        match self {
            Constant::Value(value) => ConstantKey::Address(value.addr()),
            Constant::Type(ty) => ConstantKey::Type(ty.clone()),
            Constant::Key(key) => ConstantKey::Key(key.clone()),
            Constant::Constructor { invoke, .. } => ConstantKey::Address(address(invoke)),
            Constant::Factory(f) => ConstantKey::Address(address(f)),
            Constant::Setter(f) => ConstantKey::Address(address(f)),
            Constant::Initializer(f) => ConstantKey::Address(address(f)),
            Constant::Decorator(f) => ConstantKey::Address(address(f)),
            Constant::Cast(f) => ConstantKey::Address(address(f)),
            Constant::Disposer(f) => ConstantKey::Address(address(f)),
            Constant::Lifetime { strategy, .. } => ConstantKey::Address(address(strategy)),
            Constant::Procedure(p) => ConstantKey::Address(address(p)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Constant::Value(_) => "value",
            Constant::Type(_) => "type",
            Constant::Key(_) => "key",
            Constant::Constructor { .. } => "constructor",
            Constant::Factory(_) => "factory",
            Constant::Setter(_) => "setter",
            Constant::Initializer(_) => "initializer",
            Constant::Decorator(_) => "decorator",
            Constant::Cast(_) => "cast",
            Constant::Disposer(_) => "disposer",
            Constant::Lifetime { .. } => "lifetime",
            Constant::Procedure(_) => "procedure",
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Type(ty) => write!(f, "Type({ty})"),
            Constant::Key(key) => write!(f, "Key({key})"),
            Constant::Constructor { owner, .. } => write!(f, "Constructor({owner})"),
            Constant::Lifetime { strategy, service } => {
                write!(f, "Lifetime({}, {service})", strategy.lifetime())
            }
            other => f.write_str(other.kind()),
        }
    }
}

#[inline]
fn address<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

/// Constants are shared by identity; the table keeps every interned Arc
/// alive, so addresses stay unique.
#[derive(PartialEq, Eq, Hash)]
enum ConstantKey {
    Address(usize),
    Type(TypeRef),
    Key(ServiceKey),
}

#[derive(Default)]
struct TableState {
    items: Vec<Constant>,
    index: HashMap<ConstantKey, usize, RandomState>,
}

/// Append-only, de-duplicating constants table.
#[derive(Default)]
pub struct ConstantsTable {
    state: Mutex<TableState>,
}

impl ConstantsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `constant`, adding it on first use.
    pub fn intern(&self, constant: Constant) -> usize {
        let key = constant.dedup_key();
        let mut state = self.state.lock();
        if let Some(&index) = state.index.get(&key) {
            return index;
        }
        let index = state.items.len();
        state.items.push(constant);
        state.index.insert(key, index);
        index
    }

    /// Every constant interned so far.
    pub fn snapshot(&self) -> Arc<[Constant]> {
        Arc::from(self.state.lock().items.as_slice())
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConstantsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantsTable").field("len", &self.len()).finish()
    }
}

/// A compiled instruction sequence.
#[derive(Debug, Clone)]
pub struct Procedure {
    ops: Vec<Op>,
    locals: usize,
    result_type: Option<TypeRef>,
}

impl Procedure {
    #[inline]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Number of frame locals the procedure (and its nested bodies) use.
    #[inline]
    pub fn locals(&self) -> usize {
        self.locals
    }

    /// Static type of the value left on the stack.
    #[inline]
    pub fn result_type(&self) -> Option<&TypeRef> {
        self.result_type.as_ref()
    }
}

/// Appends ops while tracking the static type of every stack slot.
///
/// The type stack lets redundant casts be elided: casting a value that is
/// already known to have the target type emits nothing.
pub struct ProcedureBuilder<'t> {
    constants: &'t ConstantsTable,
    ops: Vec<Op>,
    types: Vec<TypeRef>,
}

impl<'t> ProcedureBuilder<'t> {
    pub fn new(constants: &'t ConstantsTable) -> Self {
        Self {
            constants,
            ops: Vec::new(),
            types: Vec::new(),
        }
    }

    /// A builder for a nested body sharing the same constants table.
    pub fn nested(&self) -> ProcedureBuilder<'t> {
        ProcedureBuilder::new(self.constants)
    }

    #[inline]
    fn intern(&self, constant: Constant) -> usize {
        self.constants.intern(constant)
    }

    #[inline]
    fn pop_types(&mut self, count: usize) {
        let keep = self.types.len().saturating_sub(count);
        self.types.truncate(keep);
    }

    #[inline]
    pub fn top_type(&self) -> Option<&TypeRef> {
        self.types.last()
    }

    /// Number of values on the stack after the ops emitted so far.
    #[inline]
    pub fn depth(&self) -> usize {
        self.types.len()
    }

    pub fn push_value(&mut self, value: Instance, ty: TypeRef) {
        let index = self.intern(Constant::Value(value));
        self.ops.push(Op::PushConstant(index));
        self.types.push(ty);
    }

    pub fn push_argument(&mut self, index: usize, ty: TypeRef) {
        self.ops.push(Op::PushArgument(index));
        self.types.push(ty);
    }

    pub fn store_local(&mut self, slot: usize) {
        self.ops.push(Op::StoreLocal(slot));
    }

    pub fn load_local_or(&mut self, slot: usize, body: Procedure) {
        let ty = body.result_type.clone();
        let body = self.intern(Constant::Procedure(Arc::new(body)));
        self.ops.push(Op::LoadLocalOr { slot, body });
        self.types.extend(ty);
    }

    pub fn construct(&mut self, owner: &TypeRef, invoke: &ConstructFn, argc: usize) {
        let constructor = self.intern(Constant::Constructor {
            owner: owner.clone(),
            invoke: Arc::clone(invoke),
        });
        self.ops.push(Op::Construct { constructor, argc });
        self.pop_types(argc);
        self.types.push(owner.clone());
    }

    pub fn call_factory(&mut self, factory: &FactoryFn, ty: TypeRef) {
        let index = self.intern(Constant::Factory(Arc::clone(factory)));
        self.ops.push(Op::CallFactory(index));
        self.types.push(ty);
    }

    pub fn set_property(&mut self, setter: &SetterFn) {
        let index = self.intern(Constant::Setter(Arc::clone(setter)));
        self.ops.push(Op::SetProperty(index));
        self.pop_types(1);
    }

    pub fn initialize(&mut self, initializer: &InitializeFn) {
        let index = self.intern(Constant::Initializer(Arc::clone(initializer)));
        self.ops.push(Op::Initialize(index));
    }

    pub fn decorate(&mut self, decorator: &DecorateFn) {
        let index = self.intern(Constant::Decorator(Arc::clone(decorator)));
        self.ops.push(Op::Decorate(index));
    }

    /// Cast the top value to `target`, unless it already has that type.
    pub fn cast(&mut self, target: &TypeRef, cast: &CastFn) {
        if self.top_type() == Some(target) {
            return;
        }
        let index = self.intern(Constant::Cast(Arc::clone(cast)));
        self.ops.push(Op::Cast(index));
        self.retype(target.clone());
    }

    /// Record that the top value already is a `ty` without emitting code.
    pub fn retype(&mut self, ty: TypeRef) {
        self.pop_types(1);
        self.types.push(ty);
    }

    pub fn capture(&mut self, disposer: &DisposeCast) {
        let index = self.intern(Constant::Disposer(Arc::clone(disposer)));
        self.ops.push(Op::Capture(index));
    }

    pub fn new_collection(
        &mut self,
        kind: CollectionKind,
        item_type: &TypeRef,
        len: usize,
        ty: TypeRef,
    ) {
        let item_type = self.intern(Constant::Type(item_type.clone()));
        self.ops.push(Op::NewCollection { kind, item_type, len });
        self.pop_types(len);
        self.types.push(ty);
    }

    pub fn with_lifetime(
        &mut self,
        strategy: &Arc<dyn LifetimeStrategy>,
        service: &TypeRef,
        body: Procedure,
    ) {
        let ty = body.result_type.clone().unwrap_or_else(|| service.clone());
        let lifetime = self.intern(Constant::Lifetime {
            strategy: Arc::clone(strategy),
            service: service.clone(),
        });
        let body = self.intern(Constant::Procedure(Arc::new(body)));
        self.ops.push(Op::WithLifetime { lifetime, body });
        self.types.push(ty);
    }

    pub fn make_lazy(&mut self, service: &TypeRef, body: Procedure) {
        let lazy = TypeRef::lazy(service.clone());
        let service = self.intern(Constant::Type(service.clone()));
        let body = self.intern(Constant::Procedure(Arc::new(body)));
        self.ops.push(Op::MakeLazy { service, body });
        self.types.push(lazy);
    }

    pub fn resolve_lazy(&mut self, key: ServiceKey, ty: TypeRef) {
        let index = self.intern(Constant::Key(key));
        self.ops.push(Op::ResolveLazy(index));
        self.types.push(ty);
    }

    pub fn resolve_func(&mut self, key: ServiceKey, arity: usize, ty: TypeRef) {
        let service = self.intern(Constant::Key(key));
        self.ops.push(Op::ResolveFunc { service, arity });
        self.types.push(ty);
    }

    pub fn finish(self, locals: usize) -> Procedure {
        Procedure {
            result_type: self.types.last().cloned(),
            ops: self.ops,
            locals,
        }
    }
}

impl fmt::Debug for ProcedureBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureBuilder")
            .field("ops", &self.ops)
            .field("types", &self.types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    #[test]
    fn test_constants_deduplicate_by_identity() {
        let table = ConstantsTable::new();
        let value = Instance::new(7u32);
        let a = table.intern(Constant::Value(value.clone()));
        let b = table.intern(Constant::Value(value));
        let c = table.intern(Constant::Value(Instance::new(7u32)));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let ty = table.intern(Constant::Type(TypeRef::named("A")));
        assert_eq!(ty, table.intern(Constant::Type(TypeRef::named("A"))));
        assert_eq!(table.snapshot().len(), 3);
    }

    #[test]
    fn test_redundant_cast_is_elided() {
        let table = ConstantsTable::new();
        let service = TypeRef::named("IService");
        let cast: CastFn =
            Arc::new(|instance: &Instance| -> Result<Instance> { Ok(instance.clone()) });

        let mut builder = ProcedureBuilder::new(&table);
        builder.push_value(Instance::new(1u8), TypeRef::named("Impl"));
        builder.cast(&service, &cast);
        builder.cast(&service, &cast);
        let procedure = builder.finish(0);

        let casts = procedure.ops().iter().filter(|op| matches!(op, Op::Cast(_))).count();
        assert_eq!(casts, 1);
        assert_eq!(procedure.result_type(), Some(&service));
    }

    #[test]
    fn test_type_stack_tracks_construct_and_collections() {
        let table = ConstantsTable::new();
        let invoke: ConstructFn = Arc::new(|_: &crate::metadata::Args| -> Result<Instance> {
            Ok(Instance::new(()))
        });
        let item = TypeRef::named("Item");

        let mut builder = ProcedureBuilder::new(&table);
        builder.push_argument(0, TypeRef::named("Arg"));
        builder.push_argument(1, TypeRef::named("Arg"));
        builder.construct(&item, &invoke, 2);
        assert_eq!(builder.depth(), 1);
        assert_eq!(builder.top_type(), Some(&item));

        builder.push_value(Instance::new(()), item.clone());
        builder.new_collection(CollectionKind::List, &item, 2, TypeRef::list(item.clone()));
        assert_eq!(builder.depth(), 1);
        assert_eq!(builder.top_type(), Some(&TypeRef::list(item)));
    }
}
