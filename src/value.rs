//! Type-erased values produced by the container
//!
//! Every resolved object travels as an [`Instance`]: an `Arc<dyn Any>` whose
//! payload is an `Arc<T>`. Wrapping the `Arc<T>` rather than `T` lets the
//! payload be a trait object, so `dyn ILogger` services downcast exactly like
//! concrete ones.

use crate::types::{CollectionKind, TypeRef};
use crate::{DiError, Result};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::trace;

/// A resolved, type-erased object.
#[derive(Clone)]
pub struct Instance {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Instance {
    /// Wrap an owned value.
    #[inline]
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an existing `Arc`, which may hold a trait object.
    #[inline]
    pub fn from_arc<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            value: Arc::new(value) as Arc<dyn Any + Send + Sync>,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Recover the payload as `Arc<T>`.
    #[inline]
    pub fn downcast<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.downcast_ref::<Arc<T>>().cloned()
    }

    /// Like [`downcast`](Self::downcast) but reports a `TypeMismatch`.
    #[inline]
    pub fn cast<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.downcast::<T>()
            .ok_or_else(|| DiError::type_mismatch(std::any::type_name::<T>(), self.type_name))
    }

    /// Rust type name of the payload.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// True when both handles refer to the same erased value.
    #[inline]
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.value) as *const () as usize
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("type", &self.type_name).finish()
    }
}

/// Implemented by services that release resources when their owner ends.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

/// Converts an instance into its disposable view, if it has one.
pub type DisposeCast = Arc<dyn Fn(&Instance) -> Option<Arc<dyn Disposable>> + Send + Sync>;

/// Disposer for instances whose payload is `Arc<T>`.
pub fn disposer_for<T: Disposable + 'static>() -> DisposeCast {
    Arc::new(|instance: &Instance| {
        instance
            .downcast::<T>()
            .map(|value| value as Arc<dyn Disposable>)
    })
}

type LazyInit = Box<dyn Fn() -> Result<Instance> + Send + Sync>;

/// Deferred resolution: the value is produced on first access, then reused.
pub struct Lazy {
    service: TypeRef,
    init: LazyInit,
    instance: OnceCell<Instance>,
}

impl Lazy {
    pub(crate) fn new(service: TypeRef, init: LazyInit) -> Self {
        Self {
            service,
            init,
            instance: OnceCell::new(),
        }
    }

    /// Get the value, creating it on first access.
    ///
    /// A failed creation is not cached; the next access retries.
    pub fn value(&self) -> Result<Instance> {
        self.instance
            .get_or_try_init(|| {
                #[cfg(feature = "logging")]
                trace!(
                    target: "dependency_resolver",
                    service = %self.service,
                    "Lazy value initializing on first access"
                );
                (self.init)()
            })
            .cloned()
    }

    /// Typed access to the value.
    #[inline]
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.value()?.cast::<T>()
    }

    #[inline]
    pub fn is_created(&self) -> bool {
        self.instance.get().is_some()
    }

    #[inline]
    pub fn service_type(&self) -> &TypeRef {
        &self.service
    }
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("service", &self.service)
            .field("created", &self.is_created())
            .finish()
    }
}

type FuncCall = Box<dyn Fn(&[Instance]) -> Result<Instance> + Send + Sync>;

/// A callable that resolves its service on every call.
///
/// A `Func<A.., T>` forwards its arguments to the resolution of `T` as
/// runtime arguments.
pub struct Func {
    service: TypeRef,
    arity: usize,
    call: FuncCall,
}

impl Func {
    pub(crate) fn new(service: TypeRef, arity: usize, call: FuncCall) -> Self {
        Self { service, arity, call }
    }

    /// Invoke without arguments.
    #[inline]
    pub fn call(&self) -> Result<Instance> {
        self.call_with(&[])
    }

    /// Invoke with runtime arguments; the count must match the arity.
    pub fn call_with(&self, args: &[Instance]) -> Result<Instance> {
        if args.len() != self.arity {
            return Err(DiError::ArityMismatch {
                expected: self.arity,
                supplied: args.len(),
            });
        }
        (self.call)(args)
    }

    #[inline]
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.call()?.cast::<T>()
    }

    #[inline]
    pub fn get_with<T: ?Sized + Send + Sync + 'static>(&self, args: &[Instance]) -> Result<Arc<T>> {
        self.call_with(args)?.cast::<T>()
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }

    #[inline]
    pub fn service_type(&self) -> &TypeRef {
        &self.service
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("service", &self.service)
            .field("arity", &self.arity)
            .finish()
    }
}

/// All instances collected for an enumerable, array, list or collection request.
#[derive(Debug, Clone)]
pub struct Instances {
    kind: CollectionKind,
    item_type: TypeRef,
    items: Vec<Instance>,
}

impl Instances {
    pub(crate) fn new(kind: CollectionKind, item_type: TypeRef, items: Vec<Instance>) -> Self {
        Self {
            kind,
            item_type,
            items,
        }
    }

    #[inline]
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    #[inline]
    pub fn item_type(&self) -> &TypeRef {
        &self.item_type
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instance> {
        self.items.iter()
    }

    /// Downcast every item, failing on the first mismatch.
    pub fn cast_all<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>> {
        self.items.iter().map(Instance::cast::<T>).collect()
    }

    pub fn into_vec(self) -> Vec<Instance> {
        self.items
    }
}

impl<'a> IntoIterator for &'a Instances {
    type Item = &'a Instance;
    type IntoIter = std::slice::Iter<'a, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
