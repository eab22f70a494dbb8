//! The resolution container
//!
//! `Container` ties the pieces together: registrations go into the store,
//! hooks adjust how registrations are built, and resolution compiles each
//! requested `(type, name)` once per cache epoch into a procedure that is
//! then invoked on every request.

use crate::cache::ResolutionCache;
use crate::compiler;
use crate::decorator::{DecoratorRegistration, FallbackRule, Hooks, Initializer, ServiceOverride};
use crate::description::{
    ConstructionDescription, ConstructorSelector, DefaultPropertySelector, DependencyFactory,
    DependencyOverrides, DependencySite, MostResolvableConstructorSelector, PropertySelector,
};
use crate::emit::{Backend, Interpreter};
use crate::metadata::{MetadataProvider, TypeCatalog, TypeDescriptor};
use crate::registration::{FactoryFn, Insertion, Lifetime, Registration, RegistrationStore};
use crate::scope::{Disposables, Scope, ScopeGuard, ScopeManager};
use crate::types::{ServiceKey, TypeRef};
use crate::value::Instance;
use crate::{DiError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[cfg(feature = "logging")]
use tracing::{debug, trace, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Container behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Enumerable requests for `T` also include services whose
    /// implementing types can be viewed as `T`.
    pub enable_variance: bool,
    /// Inject public writable properties after construction.
    pub enable_property_injection: bool,
    /// Refuse replacing registrations once anything has been resolved.
    pub lock_on_first_resolve: bool,
    /// Expected number of service types.
    pub initial_capacity: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            enable_variance: true,
            enable_property_injection: true,
            lock_on_first_resolve: false,
            initial_capacity: 16,
        }
    }
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variance(mut self, enabled: bool) -> Self {
        self.enable_variance = enabled;
        self
    }

    pub fn property_injection(mut self, enabled: bool) -> Self {
        self.enable_property_injection = enabled;
        self
    }

    pub fn lock_on_first_resolve(mut self, enabled: bool) -> Self {
        self.lock_on_first_resolve = enabled;
        self
    }

    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }
}

/// Builds a [`Container`] with custom collaborators.
///
/// # Examples
///
/// ```rust
/// use dependency_resolver::{ContainerBuilder, ContainerOptions, Interpreter};
///
/// let container = ContainerBuilder::new()
///     .options(ContainerOptions::new().variance(false))
///     .backend(Interpreter)
///     .build();
/// assert!(!container.options().enable_variance);
/// ```
#[derive(Default)]
pub struct ContainerBuilder {
    options: ContainerOptions,
    metadata: Option<Arc<dyn MetadataProvider>>,
    constructor_selector: Option<Arc<dyn ConstructorSelector>>,
    property_selector: Option<Arc<dyn PropertySelector>>,
    backend: Option<Arc<dyn Backend>>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    /// Consult `provider` before the container's own [`TypeCatalog`].
    pub fn metadata_provider(mut self, provider: impl MetadataProvider + 'static) -> Self {
        self.metadata = Some(Arc::new(provider));
        self
    }

    pub fn constructor_selector(mut self, selector: impl ConstructorSelector + 'static) -> Self {
        self.constructor_selector = Some(Arc::new(selector));
        self
    }

    pub fn property_selector(mut self, selector: impl PropertySelector + 'static) -> Self {
        self.property_selector = Some(Arc::new(selector));
        self
    }

    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn build(self) -> Container {
        let capacity = self.options.initial_capacity;
        let backend = self.backend.unwrap_or_else(|| Arc::new(Interpreter));

        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            backend = backend.name(),
            variance = self.options.enable_variance,
            property_injection = self.options.enable_property_injection,
            "Creating resolution container"
        );

        Container {
            inner: Arc::new(ContainerInner {
                store: RegistrationStore::with_capacity(capacity),
                hooks: Hooks::new(),
                dependency_overrides: DependencyOverrides::new(),
                catalog: TypeCatalog::new(),
                metadata: self.metadata,
                constructor_selector: self
                    .constructor_selector
                    .unwrap_or_else(|| Arc::new(MostResolvableConstructorSelector)),
                property_selector: self
                    .property_selector
                    .unwrap_or_else(|| Arc::new(DefaultPropertySelector)),
                backend,
                cache: ResolutionCache::new(capacity),
                scopes: Arc::new(ScopeManager::new()),
                disposables: Disposables::default(),
                locked: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                options: self.options,
            }),
        }
    }
}

// =============================================================================
// Container
// =============================================================================

pub(crate) struct ContainerInner {
    pub options: ContainerOptions,
    pub store: RegistrationStore,
    pub hooks: Hooks,
    pub dependency_overrides: DependencyOverrides,
    pub catalog: TypeCatalog,
    pub metadata: Option<Arc<dyn MetadataProvider>>,
    pub constructor_selector: Arc<dyn ConstructorSelector>,
    pub property_selector: Arc<dyn PropertySelector>,
    pub backend: Arc<dyn Backend>,
    pub cache: ResolutionCache,
    pub scopes: Arc<ScopeManager>,
    /// Disposable per-container instances, in creation order.
    pub disposables: Disposables,
    pub locked: AtomicBool,
    pub disposed: AtomicBool,
}

impl ContainerInner {
    /// Metadata for `ty` from the configured provider, then the catalog.
    pub fn describe(&self, ty: &TypeRef) -> Option<Arc<TypeDescriptor>> {
        match &self.metadata {
            Some(provider) => provider.describe(ty).or_else(|| self.catalog.describe(ty)),
            None => self.catalog.describe(ty),
        }
    }
}

/// Resolves services from registrations.
///
/// Cloning a `Container` is cheap and yields a handle to the same
/// registrations, instances and scopes.
///
/// # Examples
///
/// ```rust
/// use dependency_resolver::{Container, Lifetime, TypeDescriptor};
/// use std::sync::Arc;
///
/// trait Greeter: Send + Sync {
///     fn greet(&self) -> String;
/// }
///
/// struct English;
/// impl Greeter for English {
///     fn greet(&self) -> String { "hello".into() }
/// }
///
/// let container = Container::new();
/// container.add_type(
///     TypeDescriptor::of::<English>()
///         .constructor(|()| English)
///         .implements::<dyn Greeter, _>(|e| e as Arc<dyn Greeter>)
///         .finish(),
/// );
/// container.register_service::<dyn Greeter, English>(Lifetime::PerContainer);
///
/// let greeter = container.get::<dyn Greeter>().unwrap();
/// assert_eq!(greeter.greet(), "hello");
/// assert!(Arc::ptr_eq(&greeter, &container.get::<dyn Greeter>().unwrap()));
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

/// A handle that does not keep the container alive.
#[derive(Clone)]
pub struct WeakContainer {
    inner: Weak<ContainerInner>,
}

impl WeakContainer {
    pub fn upgrade(&self) -> Option<Container> {
        self.inner.upgrade().map(|inner| Container { inner })
    }
}

impl fmt::Debug for WeakContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContainer")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Container {
    /// Create a container with default options.
    pub fn new() -> Self {
        ContainerBuilder::new().build()
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        ContainerBuilder::new().options(options).build()
    }

    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    #[inline]
    pub(crate) fn inner(&self) -> &ContainerInner {
        &self.inner
    }

    #[inline]
    pub(crate) fn disposables(&self) -> &Disposables {
        &self.inner.disposables
    }

    pub fn downgrade(&self) -> WeakContainer {
        WeakContainer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[inline]
    pub fn options(&self) -> &ContainerOptions {
        &self.inner.options
    }

    /// The built-in metadata catalog.
    ///
    /// Prefer [`add_type`](Self::add_type) once resolution has started, so
    /// cached construction plans see the new metadata.
    #[inline]
    pub fn catalog(&self) -> &TypeCatalog {
        &self.inner.catalog
    }

    /// Describe an implementing type to the container.
    pub fn add_type(&self, descriptor: TypeDescriptor) {
        let added = self.inner.catalog.add(descriptor);

        #[cfg(feature = "logging")]
        trace!(
            target: "dependency_resolver",
            implementing = %added.type_ref(),
            "Type metadata added"
        );
        #[cfg(not(feature = "logging"))]
        let _ = added;

        self.invalidate();
    }

    // =========================================================================
    // Registration Methods
    // =========================================================================

    /// Add a registration, replacing any with the same service type and name.
    ///
    /// Replacement is refused for read-only registrations and while the
    /// container is locked; the refusal is logged and the existing
    /// registration stays in effect.
    pub fn register(&self, registration: Registration) {
        #[cfg(feature = "logging")]
        let (service, name, lifetime) = (
            registration.service_type().clone(),
            registration.service_name().to_owned(),
            registration.lifetime(),
        );

        match self.inner.store.insert(registration, self.is_locked()) {
            Insertion::Added | Insertion::Replaced => {
                #[cfg(feature = "logging")]
                debug!(
                    target: "dependency_resolver",
                    service = %service,
                    name = %name,
                    lifetime = %lifetime,
                    "Service registered"
                );
                self.invalidate();
            }
            Insertion::Refused { reason: _reason } => {
                #[cfg(feature = "logging")]
                warn!(
                    target: "dependency_resolver",
                    service = %service,
                    name = %name,
                    reason = _reason,
                    "Registration replacement refused"
                );
            }
        }
    }

    /// Register `implementing` as `service`.
    pub fn register_type(&self, service: TypeRef, implementing: TypeRef, lifetime: Lifetime) {
        self.register(Registration::of_type(service, implementing).with_lifetime(lifetime));
    }

    pub fn register_named_type(
        &self,
        service: TypeRef,
        implementing: TypeRef,
        name: &str,
        lifetime: Lifetime,
    ) {
        self.register(
            Registration::of_type(service, implementing)
                .named(name)
                .with_lifetime(lifetime),
        );
    }

    /// Register `T` as the service `I`; `T` needs a descriptor.
    pub fn register_service<I, T>(&self, lifetime: Lifetime)
    where
        I: ?Sized + 'static,
        T: ?Sized + 'static,
    {
        self.register_type(TypeRef::of::<I>(), TypeRef::of::<T>(), lifetime);
    }

    pub fn register_named_service<I, T>(&self, name: &str, lifetime: Lifetime)
    where
        I: ?Sized + 'static,
        T: ?Sized + 'static,
    {
        self.register_named_type(TypeRef::of::<I>(), TypeRef::of::<T>(), name, lifetime);
    }

    /// Register a factory for `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dependency_resolver::{Container, Lifetime};
    /// use std::sync::Arc;
    ///
    /// struct Config { retries: u32 }
    ///
    /// let container = Container::new();
    /// container.register_factory(Lifetime::Transient, |_| Ok(Arc::new(Config { retries: 3 })));
    /// assert_eq!(container.get::<Config>().unwrap().retries, 3);
    /// ```
    pub fn register_factory<T, F>(&self, lifetime: Lifetime, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.register_named_factory("", lifetime, factory);
    }

    pub fn register_named_factory<T, F>(&self, name: &str, lifetime: Lifetime, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let factory: FactoryFn = Arc::new(move |container: &Container, _args: &[Instance]| {
            factory(container).map(Instance::from_arc)
        });
        self.register(
            Registration::factory(TypeRef::of::<T>(), factory)
                .named(name)
                .with_lifetime(lifetime),
        );
    }

    /// Register a factory that also receives the runtime arguments passed to
    /// [`get_instance_with_args`](Self::get_instance_with_args) or a `Func`.
    pub fn register_factory_with_args<T, F>(&self, name: &str, lifetime: Lifetime, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container, &[Instance]) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let factory: FactoryFn = Arc::new(move |container: &Container, args: &[Instance]| {
            factory(container, args).map(Instance::from_arc)
        });
        self.register(
            Registration::factory(TypeRef::of::<T>(), factory)
                .named(name)
                .with_lifetime(lifetime),
        );
    }

    /// Register an existing value; every request returns this same value.
    pub fn register_instance<T: ?Sized + Send + Sync + 'static>(&self, value: Arc<T>) {
        self.register_named_instance("", value);
    }

    pub fn register_named_instance<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        value: Arc<T>,
    ) {
        self.register(
            Registration::instance(TypeRef::of::<T>(), Instance::from_arc(value)).named(name),
        );
    }

    /// Register a construction described with [`Construction`](crate::Construction).
    pub fn register_construction(
        &self,
        service: TypeRef,
        name: &str,
        lifetime: Lifetime,
        description: ConstructionDescription,
    ) {
        self.register(
            Registration::construction(service, description)
                .named(name)
                .with_lifetime(lifetime),
        );
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Decorate every registration of `service` with `decorator`.
    ///
    /// Decorators wrap in registration order: the first one registered is
    /// innermost.
    pub fn decorate(&self, service: TypeRef, decorator: TypeRef) {
        self.decorate_with(DecoratorRegistration::new(service, decorator));
    }

    pub fn decorate_service<I, D>(&self)
    where
        I: ?Sized + 'static,
        D: ?Sized + 'static,
    {
        self.decorate(TypeRef::of::<I>(), TypeRef::of::<D>());
    }

    /// Decorate with a function over the inner instance.
    pub fn decorate_factory<I, F>(&self, decorate: F)
    where
        I: ?Sized + Send + Sync + 'static,
        F: Fn(&Container, Arc<I>) -> Result<Arc<I>> + Send + Sync + 'static,
    {
        self.decorate_with(DecoratorRegistration::factory(
            TypeRef::of::<I>(),
            move |container: &Container, inner: Instance| -> Result<Instance> {
                decorate(container, inner.cast::<I>()?).map(Instance::from_arc)
            },
        ));
    }

    pub fn decorate_with(&self, decorator: DecoratorRegistration) {
        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            service = %decorator.service_type(),
            "Decorator registered"
        );
        self.inner.hooks.add_decorator(decorator);
        self.invalidate();
    }

    /// Rewrite registrations matching `predicate` before they are compiled.
    ///
    /// A registration is rewritten once, the first time it is compiled.
    pub fn override_registrations<P, F>(&self, predicate: P, rewrite: F)
    where
        P: Fn(&Registration) -> bool + Send + Sync + 'static,
        F: Fn(&Container, Registration) -> Result<Registration> + Send + Sync + 'static,
    {
        self.inner.hooks.add_override(ServiceOverride::new(predicate, rewrite));
        self.invalidate();
    }

    /// Run `action` on every new instance of matching registrations.
    pub fn initialize<P, F>(&self, predicate: P, action: F)
    where
        P: Fn(&Registration) -> bool + Send + Sync + 'static,
        F: Fn(&Container, &Instance) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.hooks.add_initializer(Initializer::new(predicate, action));
        self.invalidate();
    }

    /// Run `action` on every new `T`, whether `T` is the service or the
    /// implementing type.
    pub fn initialize_type<T, F>(&self, action: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container, Arc<T>) -> Result<()> + Send + Sync + 'static,
    {
        let ty = TypeRef::of::<T>();
        self.initialize(
            move |registration: &Registration| {
                *registration.service_type() == ty || registration.implementing_type() == Some(&ty)
            },
            move |container: &Container, instance: &Instance| match instance.downcast::<T>() {
                Some(value) => action(container, value),
                None => Ok(()),
            },
        );
    }

    /// Supply services nothing is registered for.
    ///
    /// The produced registration is stored, so later requests for the same
    /// `(type, name)` no longer consult the rule.
    pub fn register_fallback<P, F>(&self, predicate: P, factory: F, lifetime: Lifetime)
    where
        P: Fn(&TypeRef, &str) -> bool + Send + Sync + 'static,
        F: Fn(&Container, &ServiceKey) -> Result<Instance> + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .add_fallback(FallbackRule::new(predicate, factory, lifetime));
        self.invalidate();
    }

    /// Produce every constructor parameter of type `T` with `factory`.
    pub fn register_constructor_dependency<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container, &DependencySite) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.inner
            .dependency_overrides
            .set_constructor(TypeRef::of::<T>(), typed_dependency(factory));
        self.invalidate();
    }

    /// Produce every injected property of type `T` with `factory`.
    pub fn register_property_dependency<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container, &DependencySite) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.inner
            .dependency_overrides
            .set_property(TypeRef::of::<T>(), typed_dependency(factory));
        self.invalidate();
    }

    // =========================================================================
    // Resolution Methods
    // =========================================================================

    /// Resolve `(ty, name)`.
    ///
    /// # Errors
    ///
    /// [`DiError::UnresolvableService`] when nothing can produce the service,
    /// or any error raised while building the dependency graph.
    pub fn get_instance(&self, ty: &TypeRef, name: &str) -> Result<Instance> {
        self.get_instance_with_args(ty, name, &[])
    }

    /// Resolve `(ty, name)`, forwarding `args` to the factories involved.
    pub fn get_instance_with_args(
        &self,
        ty: &TypeRef,
        name: &str,
        args: &[Instance],
    ) -> Result<Instance> {
        self.resolve(ty, name, args)?
            .ok_or_else(|| DiError::unresolvable(ty, name))
    }

    /// Like [`get_instance`](Self::get_instance), but `Ok(None)` when the
    /// requested service itself is unresolvable.
    ///
    /// Errors from inside the graph (a missing constructor dependency, a
    /// failing constructor) are still returned.
    pub fn try_get_instance(&self, ty: &TypeRef, name: &str) -> Result<Option<Instance>> {
        self.resolve(ty, name, &[])
    }

    /// Every registration of `ty`, in registration order.
    pub fn get_all_instances(&self, ty: &TypeRef) -> Result<Vec<Instance>> {
        let all = self
            .get_instance(&TypeRef::enumerable(ty.clone()), "")?
            .cast::<crate::value::Instances>()?;
        Ok(all.iter().cloned().collect())
    }

    /// Resolve the default registration of `T`.
    #[inline]
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.get_named::<T>("")
    }

    pub fn get_named<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.get_instance(&TypeRef::of::<T>(), name)?.cast::<T>()
    }

    pub fn get_with_args<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        args: &[Instance],
    ) -> Result<Arc<T>> {
        self.get_instance_with_args(&TypeRef::of::<T>(), name, args)?
            .cast::<T>()
    }

    pub fn try_get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        self.try_get_named::<T>("")
    }

    pub fn try_get_named<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Option<Arc<T>>> {
        self.try_get_instance(&TypeRef::of::<T>(), name)?
            .map(|instance| instance.cast::<T>())
            .transpose()
    }

    /// Every registration of `T`, in registration order.
    pub fn get_all<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>> {
        self.get_all_instances(&TypeRef::of::<T>())?
            .iter()
            .map(Instance::cast::<T>)
            .collect()
    }

    /// Inject the properties of an instance created outside the container.
    pub fn inject_properties(&self, instance: &Instance, ty: &TypeRef) -> Result<()> {
        self.check_not_disposed()?;
        let injector = self
            .inner
            .cache
            .injector_or_compile(ty, |epoch| compiler::compile_injector(self, epoch, ty))?;
        let scope = self.inner.scopes.current();
        injector.invoke(self, scope.as_ref(), std::slice::from_ref(instance))?;
        Ok(())
    }

    pub fn inject<T: Send + Sync + 'static>(&self, target: &Arc<T>) -> Result<()> {
        self.inject_properties(&Instance::from_arc(Arc::clone(target)), &TypeRef::of::<T>())
    }

    fn resolve(&self, ty: &TypeRef, name: &str, args: &[Instance]) -> Result<Option<Instance>> {
        self.check_not_disposed()?;
        let key = ServiceKey::new(ty.clone(), name);

        let compiled = self
            .inner
            .cache
            .get_or_compile(&key, |epoch| compiler::compile(self, epoch, &key))?;
        let Some(compiled) = compiled else {
            #[cfg(feature = "logging")]
            debug!(
                target: "dependency_resolver",
                service = %key,
                "Service is not resolvable"
            );
            return Ok(None);
        };

        if self.inner.options.lock_on_first_resolve && !self.is_locked() {
            self.lock();
        }

        #[cfg(feature = "logging")]
        trace!(
            target: "dependency_resolver",
            service = %key,
            "Resolving service"
        );

        let scope = self.inner.scopes.current();
        compiled.invoke(self, scope.as_ref(), args).map(Some)
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    /// Whether `(ty, name)` could be resolved, without building anything.
    pub fn can_get_instance(&self, ty: &TypeRef, name: &str) -> bool {
        compiler::can_resolve(&self.inner, ty, name)
    }

    #[inline]
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.can_get_instance(&TypeRef::of::<T>(), "")
    }

    /// Keys of every registration, in registration order.
    pub fn available_services(&self) -> Vec<ServiceKey> {
        self.inner.store.all().iter().map(|r| r.key()).collect()
    }

    pub fn registrations(&self) -> Vec<Arc<Registration>> {
        self.inner.store.all()
    }

    /// Number of registrations.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current cache epoch id.
    pub fn epoch(&self) -> u64 {
        self.inner.cache.epoch().id()
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Begin a scope on the calling thread, nested in its current scope.
    ///
    /// The scope ends when the guard drops or on [`ScopeGuard::end`].
    pub fn begin_scope(&self) -> ScopeGuard {
        let scope = self.inner.scopes.begin();
        ScopeGuard::new(scope, Arc::clone(&self.inner.scopes))
    }

    /// End `scope`.
    ///
    /// # Errors
    ///
    /// [`DiError::InvalidScopeEnd`] while a scope nested in it is active.
    pub fn end_scope(&self, scope: &Arc<Scope>) -> Result<()> {
        self.inner.scopes.end(scope)
    }

    /// The calling thread's current scope.
    pub fn current_scope(&self) -> Option<Arc<Scope>> {
        self.inner.scopes.current()
    }

    // =========================================================================
    // Lifecycle Methods
    // =========================================================================

    /// Refuse replacement of existing registrations from now on.
    ///
    /// New `(type, name)` registrations are still accepted.
    pub fn lock(&self) {
        if !self.inner.locked.swap(true, Ordering::AcqRel) {
            #[cfg(feature = "logging")]
            debug!(
                target: "dependency_resolver",
                services = self.len(),
                "Container locked"
            );
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::Acquire)
    }

    /// Drop every compiled procedure; the next requests recompile.
    pub fn invalidate(&self) {
        let _epoch = self.inner.cache.invalidate();

        #[cfg(feature = "logging")]
        trace!(
            target: "dependency_resolver",
            epoch = _epoch,
            "Resolution cache invalidated"
        );
    }

    /// Dispose per-container instances in creation order and refuse further
    /// resolution. Disposing twice is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            disposables = self.inner.disposables.len(),
            "Disposing container"
        );

        self.inner.disposables.dispose_all();
        self.inner.cache.invalidate();
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    #[inline]
    fn check_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DiError::ContainerDisposed);
        }
        Ok(())
    }
}

fn typed_dependency<T, F>(factory: F) -> DependencyFactory
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&Container, &DependencySite) -> Result<Arc<T>> + Send + Sync + 'static,
{
    Arc::new(move |container: &Container, site: &DependencySite| -> Result<Instance> {
        factory(container, site).map(Instance::from_arc)
    })
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registrations", &self.len())
            .field("decorators", &self.inner.hooks.decorator_count())
            .field("cache", &self.inner.cache)
            .field("locked", &self.is_locked())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Disposable;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    trait Logger: Send + Sync {
        fn name(&self) -> &'static str;
    }

    struct ConsoleLogger;
    impl Logger for ConsoleLogger {
        fn name(&self) -> &'static str {
            "console"
        }
    }

    struct Service {
        logger: Arc<dyn Logger>,
    }

    fn container() -> Container {
        let container = Container::new();
        container.add_type(
            TypeDescriptor::of::<ConsoleLogger>()
                .constructor(|()| ConsoleLogger)
                .implements::<dyn Logger, _>(|l| l as Arc<dyn Logger>)
                .finish(),
        );
        container.add_type(
            TypeDescriptor::of::<Service>()
                .constructor_named(&["logger"], |(logger,): (Arc<dyn Logger>,)| Service { logger })
                .finish(),
        );
        container
    }

    #[test]
    fn test_resolves_constructor_dependencies() {
        let container = container();
        container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::Transient);
        container.register_service::<Service, Service>(Lifetime::Transient);

        let service = container.get::<Service>().unwrap();
        assert_eq!(service.logger.name(), "console");
    }

    #[test]
    fn test_unresolvable_and_try_get() {
        let container = container();
        let err = container.get::<dyn Logger>().err().unwrap();
        assert!(err.is_unresolvable());
        assert!(container.try_get::<dyn Logger>().unwrap().is_none());

        // A missing dependency inside the graph is still an error
        container.register_service::<Service, Service>(Lifetime::Transient);
        assert!(matches!(
            container.try_get::<Service>(),
            Err(DiError::UnresolvedConstructorDependency { .. })
                | Err(DiError::NoResolvableConstructor { .. })
        ));
    }

    #[test]
    fn test_per_container_is_shared() {
        let container = container();
        container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
        let a = container.get::<dyn Logger>().unwrap();
        let b = container.get::<dyn Logger>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_replacement_invalidates_cache() {
        let container = Container::new();
        container.register_instance(Arc::new(1u32));
        assert_eq!(*container.get::<u32>().unwrap(), 1);

        let before = container.epoch();
        container.register_instance(Arc::new(2u32));
        assert!(container.epoch() > before);
        assert_eq!(*container.get::<u32>().unwrap(), 2);
    }

    #[test]
    fn test_lock_refuses_replacement_but_accepts_new_keys() {
        let container =
            Container::with_options(ContainerOptions::new().lock_on_first_resolve(true));
        container.register_instance(Arc::new(1u32));
        assert_eq!(*container.get::<u32>().unwrap(), 1);
        assert!(container.is_locked());

        container.register_instance(Arc::new(2u32));
        assert_eq!(*container.get::<u32>().unwrap(), 1);

        container.register_named_instance("other", Arc::new(3u32));
        assert_eq!(*container.get_named::<u32>("other").unwrap(), 3);
    }

    #[test]
    fn test_factory_receives_runtime_arguments() {
        let container = Container::new();
        container.register_factory_with_args("", Lifetime::Transient, |_, args: &[Instance]| {
            let base = args
                .first()
                .map(|a| a.cast::<u32>())
                .transpose()?
                .map_or(0, |v| *v);
            Ok(Arc::new(base + 1))
        });

        let value = container
            .get_with_args::<u32>("", &[Instance::new(41u32)])
            .unwrap();
        assert_eq!(*value, 42);
    }

    #[test]
    fn test_initializer_runs_on_new_instances() {
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let container = container();
        container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
        container.initialize_type::<ConsoleLogger, _>(|_, _| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        container.get::<dyn Logger>().unwrap();
        container.get::<dyn Logger>().unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_disposes_singletons_in_order() {
        struct Tracked(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl Disposable for Tracked {
            fn dispose(&self) {
                self.1.lock().push(self.0);
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let container = Container::new();
        for name in ["first", "second"] {
            let log = Arc::clone(&log);
            container.register(
                Registration::factory(
                    TypeRef::of::<Tracked>(),
                    Arc::new(move |_: &Container, _: &[Instance]| -> Result<Instance> {
                        Ok(Instance::new(Tracked(name, Arc::clone(&log))))
                    }),
                )
                .named(name)
                .with_lifetime(Lifetime::PerContainer)
                .disposable_with(crate::value::disposer_for::<Tracked>()),
            );
        }

        container.get_named::<Tracked>("first").unwrap();
        container.get_named::<Tracked>("second").unwrap();
        container.dispose();

        assert_eq!(*log.lock(), ["first", "second"]);
        assert!(matches!(container.get_named::<Tracked>("first"), Err(DiError::ContainerDisposed)));
    }

    #[test]
    fn test_can_get_instance_and_available_services() {
        let container = container();
        container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::Transient);

        assert!(container.contains::<dyn Logger>());
        assert!(container.can_get_instance(&TypeRef::lazy(TypeRef::of::<dyn Logger>()), ""));
        assert!(!container.contains::<Service>());

        let keys = container.available_services();
        assert_eq!(keys, vec![ServiceKey::new(TypeRef::of::<dyn Logger>(), "")]);
    }

    #[test]
    fn test_weak_handle() {
        let container = Container::new();
        let weak = container.downgrade();
        assert!(weak.upgrade().is_some());
        drop(container);
        assert!(weak.upgrade().is_none());
    }
}
