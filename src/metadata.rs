//! Type metadata consumed by the resolver
//!
//! Rust has no runtime reflection, so implementing types describe themselves
//! with a [`TypeDescriptor`]: their constructors, injectable properties, the
//! service types they can be viewed as, and whether they are disposable. The
//! resolver only ever talks to a [`MetadataProvider`]; [`TypeCatalog`] is the
//! bundled implementation.
//!
//! # Example
//!
//! ```rust
//! use dependency_resolver::{TypeCatalog, TypeDescriptor, TypeRef, MetadataProvider};
//! use std::sync::Arc;
//!
//! trait Clock: Send + Sync {}
//! struct SystemClock;
//! impl Clock for SystemClock {}
//!
//! let catalog = TypeCatalog::new();
//! catalog.add(
//!     TypeDescriptor::of::<SystemClock>()
//!         .constructor(|()| SystemClock)
//!         .implements::<dyn Clock, _>(|c| c as Arc<dyn Clock>)
//!         .finish(),
//! );
//!
//! let described = catalog.describe(&TypeRef::of::<SystemClock>()).unwrap();
//! assert!(described.is_assignable_to(&TypeRef::of::<dyn Clock>()));
//! ```

use crate::types::TypeRef;
use crate::value::{disposer_for, Disposable, DisposeCast, Instance};
use crate::{DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Invokes a constructor with its resolved arguments.
pub type ConstructFn = Arc<dyn Fn(&Args) -> Result<Instance> + Send + Sync>;

/// Assigns a property value on an already constructed instance.
pub type SetterFn = Arc<dyn Fn(&Instance, Instance) -> Result<()> + Send + Sync>;

/// Re-types an implementing instance as one of its service types.
pub type CastFn = Arc<dyn Fn(&Instance) -> Result<Instance> + Send + Sync>;

/// A positional constructor parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    pub name: String,
    pub ty: TypeRef,
    pub position: usize,
}

/// A constructor of an implementing type.
#[derive(Clone)]
pub struct ConstructorInfo {
    params: Vec<ParameterInfo>,
    is_public: bool,
    invoke: ConstructFn,
}

impl ConstructorInfo {
    /// A public constructor taking `(name, type)` parameters in order.
    pub fn new<N: Into<String>>(
        params: impl IntoIterator<Item = (N, TypeRef)>,
        invoke: ConstructFn,
    ) -> Self {
        Self {
            params: params
                .into_iter()
                .enumerate()
                .map(|(position, (name, ty))| ParameterInfo {
                    name: name.into(),
                    ty,
                    position,
                })
                .collect(),
            is_public: true,
            invoke,
        }
    }

    /// Mark the constructor as not visible to the resolver.
    pub fn non_public(mut self) -> Self {
        self.is_public = false;
        self
    }

    #[inline]
    pub fn params(&self) -> &[ParameterInfo] {
        &self.params
    }

    #[inline]
    pub fn is_public(&self) -> bool {
        self.is_public
    }

    #[inline]
    pub(crate) fn invoker(&self) -> &ConstructFn {
        &self.invoke
    }
}

impl fmt::Debug for ConstructorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructorInfo")
            .field("params", &self.params)
            .field("is_public", &self.is_public)
            .finish()
    }
}

/// A settable member of an implementing type.
#[derive(Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub ty: TypeRef,
    pub is_public: bool,
    pub is_writable: bool,
    pub is_indexed: bool,
    setter: Option<SetterFn>,
}

impl PropertyInfo {
    /// A public, writable, non-indexed property.
    pub fn new(name: impl Into<String>, ty: TypeRef, setter: SetterFn) -> Self {
        Self {
            name: name.into(),
            ty,
            is_public: true,
            is_writable: true,
            is_indexed: false,
            setter: Some(setter),
        }
    }

    /// A property without a setter.
    pub fn read_only(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            is_public: true,
            is_writable: false,
            is_indexed: false,
            setter: None,
        }
    }

    pub fn non_public(mut self) -> Self {
        self.is_public = false;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    #[inline]
    pub(crate) fn setter(&self) -> Option<&SetterFn> {
        self.setter.as_ref()
    }
}

impl fmt::Debug for PropertyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyInfo")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("is_public", &self.is_public)
            .field("is_writable", &self.is_writable)
            .field("is_indexed", &self.is_indexed)
            .finish()
    }
}

/// Everything the resolver needs to know about one implementing type.
#[derive(Clone)]
pub struct TypeDescriptor {
    ty: TypeRef,
    constructors: Vec<ConstructorInfo>,
    properties: Vec<PropertyInfo>,
    casts: Vec<(TypeRef, CastFn)>,
    disposer: Option<DisposeCast>,
}

impl TypeDescriptor {
    /// Start describing `T`, identified by its nominal type reference.
    pub fn of<T: Send + Sync + 'static>() -> DescriptorBuilder<T> {
        Self::builder(TypeRef::of::<T>())
    }

    /// Start describing `T` under an explicit (typically generic) reference.
    pub fn builder<T: Send + Sync + 'static>(ty: TypeRef) -> DescriptorBuilder<T> {
        DescriptorBuilder {
            descriptor: TypeDescriptor {
                ty,
                constructors: Vec::new(),
                properties: Vec::new(),
                casts: Vec::new(),
                disposer: None,
            },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn type_ref(&self) -> &TypeRef {
        &self.ty
    }

    #[inline]
    pub fn constructors(&self) -> &[ConstructorInfo] {
        &self.constructors
    }

    #[inline]
    pub fn properties(&self) -> &[PropertyInfo] {
        &self.properties
    }

    #[inline]
    pub fn disposer(&self) -> Option<&DisposeCast> {
        self.disposer.as_ref()
    }

    /// The cast to `service`, if this type can be viewed as it.
    pub fn cast_to(&self, service: &TypeRef) -> Option<&CastFn> {
        self.casts
            .iter()
            .find(|(ty, _)| ty == service)
            .map(|(_, cast)| cast)
    }

    pub fn is_assignable_to(&self, service: &TypeRef) -> bool {
        self.ty == *service || self.cast_to(service).is_some()
    }

    /// Service types this implementing type can be cast to.
    pub fn service_types(&self) -> impl Iterator<Item = &TypeRef> {
        self.casts.iter().map(|(ty, _)| ty)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("ty", &self.ty)
            .field("constructors", &self.constructors.len())
            .field("properties", &self.properties.len())
            .field("casts", &self.casts.iter().map(|(ty, _)| ty).collect::<Vec<_>>())
            .field("disposable", &self.disposer.is_some())
            .finish()
    }
}

/// Typed builder for a [`TypeDescriptor`].
pub struct DescriptorBuilder<T> {
    descriptor: TypeDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> DescriptorBuilder<T> {
    /// Add a public constructor whose parameter types come from `D`.
    ///
    /// Parameters are named `arg0`, `arg1`, ...; use
    /// [`constructor_named`](Self::constructor_named) when the names matter.
    pub fn constructor<D, F>(self, f: F) -> Self
    where
        D: FromArgs,
        F: Fn(D) -> T + Send + Sync + 'static,
    {
        let names: Vec<String> = (0..D::param_types().len()).map(|i| format!("arg{i}")).collect();
        self.typed_constructor(names, f)
    }

    /// Add a public constructor with explicit parameter names.
    pub fn constructor_named<D, F>(self, names: &[&str], f: F) -> Self
    where
        D: FromArgs,
        F: Fn(D) -> T + Send + Sync + 'static,
    {
        let names = names.iter().map(|n| (*n).to_owned()).collect();
        self.typed_constructor(names, f)
    }

    fn typed_constructor<D, F>(mut self, names: Vec<String>, f: F) -> Self
    where
        D: FromArgs,
        F: Fn(D) -> T + Send + Sync + 'static,
    {
        let params = names.into_iter().zip(D::param_types());
        let invoke: ConstructFn = Arc::new(move |args: &Args| -> Result<Instance> {
            Ok(Instance::new(f(D::from_args(args)?)))
        });
        self.descriptor.constructors.push(ConstructorInfo::new(params, invoke));
        self
    }

    /// Add a fallible constructor over explicit `(name, type)` parameters.
    ///
    /// Use this for parameters of wrapper types such as `Lazy<T>` or
    /// `Enumerable<T>`, which have no Rust-level type to derive them from.
    pub fn try_constructor<N, F>(
        mut self,
        params: impl IntoIterator<Item = (N, TypeRef)>,
        f: F,
    ) -> Self
    where
        N: Into<String>,
        F: Fn(&Args) -> Result<T> + Send + Sync + 'static,
    {
        let invoke: ConstructFn = Arc::new(move |args: &Args| f(args).map(Instance::new));
        self.descriptor.constructors.push(ConstructorInfo::new(params, invoke));
        self
    }

    /// Add a prepared constructor.
    pub fn constructor_info(mut self, constructor: ConstructorInfo) -> Self {
        self.descriptor.constructors.push(constructor);
        self
    }

    /// Add a public, writable property of type `V`.
    pub fn property<V, F>(self, name: &str, f: F) -> Self
    where
        V: ?Sized + Send + Sync + 'static,
        F: Fn(&T, Arc<V>) + Send + Sync + 'static,
    {
        self.property_of(name, TypeRef::of::<V>(), move |target: &T, value: Instance| {
            f(target, value.cast::<V>()?);
            Ok(())
        })
    }

    /// Add a public, writable property under an explicit type reference.
    pub fn property_of<F>(mut self, name: &str, ty: TypeRef, f: F) -> Self
    where
        F: Fn(&T, Instance) -> Result<()> + Send + Sync + 'static,
    {
        let setter: SetterFn = Arc::new(move |target: &Instance, value: Instance| -> Result<()> {
            let target = target.cast::<T>()?;
            f(&target, value)
        });
        self.descriptor.properties.push(PropertyInfo::new(name, ty, setter));
        self
    }

    /// Add prepared property metadata.
    pub fn property_info(mut self, property: PropertyInfo) -> Self {
        self.descriptor.properties.push(property);
        self
    }

    /// Declare that `T` can serve as the nominal service type `I`.
    pub fn implements<I, F>(self, f: F) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Arc<I> + Send + Sync + 'static,
    {
        self.implements_as(TypeRef::of::<I>(), f)
    }

    /// Declare that `T` can serve as `service`, a possibly generic reference.
    pub fn implements_as<I, F>(mut self, service: TypeRef, f: F) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Arc<I> + Send + Sync + 'static,
    {
        let cast: CastFn = Arc::new(move |instance: &Instance| -> Result<Instance> {
            Ok(Instance::from_arc(f(instance.cast::<T>()?)))
        });
        self.descriptor.casts.push((service, cast));
        self
    }

    pub fn finish(self) -> TypeDescriptor {
        self.descriptor
    }
}

impl<T: Disposable + 'static> DescriptorBuilder<T> {
    /// Track instances of `T` for disposal by their lifetime's owner.
    pub fn disposable(mut self) -> Self {
        self.descriptor.disposer = Some(disposer_for::<T>());
        self
    }
}

/// Resolved constructor arguments, in parameter order.
pub struct Args {
    target: TypeRef,
    values: Vec<Instance>,
}

impl Args {
    pub(crate) fn new(target: TypeRef, values: Vec<Instance>) -> Self {
        Self { target, values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The type being constructed.
    #[inline]
    pub fn target(&self) -> &TypeRef {
        &self.target
    }

    pub fn instance(&self, index: usize) -> Result<&Instance> {
        self.values.get(index).ok_or_else(|| {
            DiError::creation_failed(
                &self.target,
                format!("constructor argument {index} missing ({} supplied)", self.values.len()),
            )
        })
    }

    /// Typed argument at `index`.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>> {
        let instance = self.instance(index)?;
        instance.downcast::<T>().ok_or_else(|| {
            DiError::creation_failed(
                &self.target,
                format!(
                    "constructor argument {index} is {}, expected {}",
                    instance.type_name(),
                    std::any::type_name::<T>()
                ),
            )
        })
    }
}

/// Constructor argument lists that can be derived from Rust types.
///
/// Implemented for `()` and tuples of `Arc<T>` up to eight elements.
pub trait FromArgs: Sized {
    fn param_types() -> Vec<TypeRef>;

    fn from_args(args: &Args) -> Result<Self>;
}

impl FromArgs for () {
    #[inline]
    fn param_types() -> Vec<TypeRef> {
        Vec::new()
    }

    #[inline]
    fn from_args(_args: &Args) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_from_args_tuple {
    ($($T:ident => $idx:tt),+) => {
        impl<$($T: ?Sized + Send + Sync + 'static),+> FromArgs for ($(Arc<$T>,)+) {
            #[inline]
            fn param_types() -> Vec<TypeRef> {
                vec![$(TypeRef::of::<$T>()),+]
            }

            #[inline]
            fn from_args(args: &Args) -> Result<Self> {
                Ok(($(args.get::<$T>($idx)?,)+))
            }
        }
    };
}

impl_from_args_tuple!(A => 0);
impl_from_args_tuple!(A => 0, B => 1);
impl_from_args_tuple!(A => 0, B => 1, C => 2);
impl_from_args_tuple!(A => 0, B => 1, C => 2, D => 3);
impl_from_args_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4);
impl_from_args_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
impl_from_args_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
impl_from_args_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);

/// Source of type metadata for implementing types.
pub trait MetadataProvider: Send + Sync {
    /// Describe `ty`, or `None` if nothing is known about it.
    fn describe(&self, ty: &TypeRef) -> Option<Arc<TypeDescriptor>>;

    /// True when an instance of `from` can be used where `to` is expected.
    fn is_assignable(&self, from: &TypeRef, to: &TypeRef) -> bool {
        from == to || self.describe(from).is_some_and(|d| d.is_assignable_to(to))
    }
}

type GenericDescriptorFn = Arc<dyn Fn(&[TypeRef]) -> Option<TypeDescriptor> + Send + Sync>;

/// Thread-safe catalog of type descriptors.
///
/// Generic implementing types register a factory under their open definition
/// (`Repo<$0>`); closed descriptors are produced on first request and
/// memoized.
pub struct TypeCatalog {
    concrete: DashMap<TypeRef, Arc<TypeDescriptor>, RandomState>,
    generic: DashMap<TypeRef, GenericDescriptorFn, RandomState>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self {
            concrete: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
            generic: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
        }
    }

    /// Add or replace a concrete descriptor.
    pub fn add(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.concrete
            .insert(descriptor.type_ref().clone(), Arc::clone(&descriptor));
        descriptor
    }

    /// Add a descriptor factory for every closing of `definition`.
    pub fn add_generic<F>(&self, definition: TypeRef, factory: F)
    where
        F: Fn(&[TypeRef]) -> Option<TypeDescriptor> + Send + Sync + 'static,
    {
        self.generic.insert(definition.definition(), Arc::new(factory));
    }

    pub fn contains(&self, ty: &TypeRef) -> bool {
        self.concrete.contains_key(ty)
            || (ty.is_generic() && self.generic.contains_key(&ty.definition()))
    }

    /// Number of concrete descriptors (closed generics included).
    pub fn len(&self) -> usize {
        self.concrete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concrete.is_empty() && self.generic.is_empty()
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataProvider for TypeCatalog {
    fn describe(&self, ty: &TypeRef) -> Option<Arc<TypeDescriptor>> {
        if let Some(found) = self.concrete.get(ty) {
            return Some(Arc::clone(found.value()));
        }
        if !ty.is_generic() || ty.is_open() {
            return None;
        }
        let factory = self.generic.get(&ty.definition()).map(|f| Arc::clone(f.value()))?;
        let descriptor = factory(ty.args())?;
        Some(
            self.concrete
                .entry(ty.clone())
                .or_insert_with(|| Arc::new(descriptor))
                .value()
                .clone(),
        )
    }
}

impl fmt::Debug for TypeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCatalog")
            .field("concrete", &self.concrete.len())
            .field("generic", &self.generic.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    trait Store: Send + Sync {
        fn name(&self) -> String;
    }

    struct Config {
        url: String,
    }

    struct SqlStore {
        config: Arc<Config>,
        label: Mutex<Option<Arc<String>>>,
    }

    impl Store for SqlStore {
        fn name(&self) -> String {
            self.config.url.clone()
        }
    }

    fn sql_store() -> TypeDescriptor {
        TypeDescriptor::of::<SqlStore>()
            .constructor_named(&["config"], |(config,): (Arc<Config>,)| SqlStore {
                config,
                label: Mutex::new(None),
            })
            .property::<String, _>("label", |store, value| *store.label.lock() = Some(value))
            .implements::<dyn Store, _>(|s| s as Arc<dyn Store>)
            .finish()
    }

    #[test]
    fn test_typed_constructor_derives_parameters() {
        let descriptor = sql_store();
        let ctor = &descriptor.constructors()[0];
        assert_eq!(ctor.params().len(), 1);
        assert_eq!(ctor.params()[0].name, "config");
        assert_eq!(ctor.params()[0].ty, TypeRef::of::<Config>());

        let args = Args::new(
            descriptor.type_ref().clone(),
            vec![Instance::new(Config { url: "sql://".into() })],
        );
        let built = (ctor.invoker())(&args).unwrap();
        let store = descriptor
            .cast_to(&TypeRef::of::<dyn Store>())
            .unwrap()(&built)
            .unwrap();
        assert_eq!(store.cast::<dyn Store>().unwrap().name(), "sql://");
    }

    #[test]
    fn test_constructor_reports_bad_arguments() {
        let descriptor = sql_store();
        let args = Args::new(descriptor.type_ref().clone(), vec![Instance::new(42u32)]);
        let err = (descriptor.constructors()[0].invoker())(&args).unwrap_err();
        assert!(matches!(err, DiError::CreationFailed { .. }));
    }

    #[test]
    fn test_property_setter() {
        let descriptor = sql_store();
        let store = Instance::new(SqlStore {
            config: Arc::new(Config { url: String::new() }),
            label: Mutex::new(None),
        });
        let property = &descriptor.properties()[0];
        (property.setter().unwrap())(&store, Instance::new(String::from("primary"))).unwrap();

        let store = store.cast::<SqlStore>().unwrap();
        assert_eq!(store.label.lock().as_deref().map(String::as_str), Some("primary"));
    }

    #[test]
    fn test_catalog_closes_generics() {
        struct Repo<T>(PhantomData<T>);
        struct User;

        let catalog = TypeCatalog::new();
        catalog.add_generic(TypeRef::generic("Repo", [TypeRef::param(0)]), |args| {
            if args[0] == TypeRef::of::<User>() {
                Some(
                    TypeDescriptor::builder::<Repo<User>>(TypeRef::generic("Repo", args.to_vec()))
                        .constructor(|()| Repo(PhantomData))
                        .finish(),
                )
            } else {
                None
            }
        });

        let closed = TypeRef::generic("Repo", [TypeRef::of::<User>()]);
        assert!(catalog.contains(&closed));
        let first = catalog.describe(&closed).unwrap();
        let second = catalog.describe(&closed).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(catalog.len(), 1);

        let unsupported = TypeRef::generic("Repo", [TypeRef::named("Order")]);
        assert!(catalog.describe(&unsupported).is_none());
    }

    #[test]
    fn test_assignability() {
        let catalog = TypeCatalog::new();
        catalog.add(sql_store());
        let sql = TypeRef::of::<SqlStore>();
        assert!(catalog.is_assignable(&sql, &TypeRef::of::<dyn Store>()));
        assert!(catalog.is_assignable(&sql, &sql));
        assert!(!catalog.is_assignable(&TypeRef::of::<dyn Store>(), &sql));
    }
}
