//! Decorators, overrides, initializers and fallback rules
//!
//! These hooks reshape what a registration produces without touching the
//! registration itself:
//!
//! - a decorator wraps the instance of a service in another implementation
//!   of the same service;
//! - an override rewrites a registration right before it is compiled;
//! - an initializer runs against every new instance of matching
//!   registrations;
//! - a fallback rule produces a registration on demand for requests
//!   nothing else can satisfy.

use crate::registration::{Lifetime, Registration};
use crate::types::{ServiceKey, TypeRef};
use crate::value::Instance;
use crate::{Container, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Decides whether a hook applies to a registration.
pub type RegistrationPredicate = Arc<dyn Fn(&Registration) -> bool + Send + Sync>;

/// Wraps an already created instance.
pub type DecorateFn = Arc<dyn Fn(&Container, Instance) -> Result<Instance> + Send + Sync>;

/// Runs against a newly created instance.
pub type InitializeFn = Arc<dyn Fn(&Container, &Instance) -> Result<()> + Send + Sync>;

/// Picks a decorator type for a registration, or none.
pub type DeferredDecoratorFn = Arc<dyn Fn(&Registration) -> Option<TypeRef> + Send + Sync>;

/// Rewrites a registration before it is compiled.
pub type OverrideFn = Arc<dyn Fn(&Container, Registration) -> Result<Registration> + Send + Sync>;

/// Builds the value for a request matched by a fallback rule.
pub type FallbackFactory = Arc<dyn Fn(&Container, &ServiceKey) -> Result<Instance> + Send + Sync>;

/// How a decorator produces its wrapper.
#[derive(Clone)]
pub enum DecoratorSource {
    /// Construct this type; exactly one constructor parameter receives the
    /// decorated instance. May be an open generic over the service's
    /// parameters.
    Type(TypeRef),
    /// Choose the decorator type per registration.
    Deferred(DeferredDecoratorFn),
    /// Call a function with the decorated instance.
    Factory(DecorateFn),
}

/// One decorator for a service type.
#[derive(Clone)]
pub struct DecoratorRegistration {
    service_type: TypeRef,
    source: DecoratorSource,
    predicate: Option<RegistrationPredicate>,
    index: u64,
}

impl DecoratorRegistration {
    /// Decorate `service_type` with `decorator_type`.
    pub fn new(service_type: TypeRef, decorator_type: TypeRef) -> Self {
        Self::with_source(service_type, DecoratorSource::Type(decorator_type))
    }

    pub fn deferred<F>(service_type: TypeRef, resolve: F) -> Self
    where
        F: Fn(&Registration) -> Option<TypeRef> + Send + Sync + 'static,
    {
        Self::with_source(service_type, DecoratorSource::Deferred(Arc::new(resolve)))
    }

    pub fn factory<F>(service_type: TypeRef, decorate: F) -> Self
    where
        F: Fn(&Container, Instance) -> Result<Instance> + Send + Sync + 'static,
    {
        Self::with_source(service_type, DecoratorSource::Factory(Arc::new(decorate)))
    }

    fn with_source(service_type: TypeRef, source: DecoratorSource) -> Self {
        Self {
            service_type,
            source,
            predicate: None,
            index: 0,
        }
    }

    /// Only decorate registrations matching `predicate`.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Registration) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    #[inline]
    pub fn service_type(&self) -> &TypeRef {
        &self.service_type
    }

    #[inline]
    pub fn source(&self) -> &DecoratorSource {
        &self.source
    }

    /// Insertion order; lower indexes sit closer to the decorated instance.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    fn matches(&self, registration: &Registration) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(registration))
    }

    /// The concrete decoration of `registration`, if this decorator applies.
    fn apply_to(&self, registration: &Registration) -> Option<AppliedDecorator> {
        let service = registration.service_type();
        let bindings = if self.service_type == *service {
            Vec::new()
        } else if self.service_type.is_open() {
            self.service_type.bind(service)?
        } else {
            return None;
        };
        if !self.matches(registration) {
            return None;
        }

        let kind = match &self.source {
            DecoratorSource::Type(ty) if ty.is_open() => {
                AppliedKind::Type(ty.substitute(&bindings))
            }
            DecoratorSource::Type(ty) => AppliedKind::Type(ty.clone()),
            DecoratorSource::Deferred(resolve) => AppliedKind::Type(resolve(registration)?),
            DecoratorSource::Factory(decorate) => AppliedKind::Factory(Arc::clone(decorate)),
        };
        Some(AppliedDecorator {
            index: self.index,
            kind,
        })
    }
}

impl fmt::Debug for DecoratorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            DecoratorSource::Type(ty) => ty.to_string(),
            DecoratorSource::Deferred(_) => "deferred".to_owned(),
            DecoratorSource::Factory(_) => "factory".to_owned(),
        };
        f.debug_struct("DecoratorRegistration")
            .field("service_type", &self.service_type)
            .field("source", &source)
            .field("index", &self.index)
            .finish()
    }
}

/// A decorator resolved against one registration.
#[derive(Clone)]
pub(crate) struct AppliedDecorator {
    pub index: u64,
    pub kind: AppliedKind,
}

#[derive(Clone)]
pub(crate) enum AppliedKind {
    Type(TypeRef),
    Factory(DecorateFn),
}

/// Rewrites matching registrations before compilation.
#[derive(Clone)]
pub struct ServiceOverride {
    predicate: RegistrationPredicate,
    rewrite: OverrideFn,
}

impl ServiceOverride {
    pub fn new<P, F>(predicate: P, rewrite: F) -> Self
    where
        P: Fn(&Registration) -> bool + Send + Sync + 'static,
        F: Fn(&Container, Registration) -> Result<Registration> + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            rewrite: Arc::new(rewrite),
        }
    }
}

/// Runs `action` on every new instance of matching registrations.
#[derive(Clone)]
pub struct Initializer {
    predicate: RegistrationPredicate,
    action: InitializeFn,
}

impl Initializer {
    pub fn new<P, F>(predicate: P, action: F) -> Self
    where
        P: Fn(&Registration) -> bool + Send + Sync + 'static,
        F: Fn(&Container, &Instance) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            action: Arc::new(action),
        }
    }

    #[inline]
    pub(crate) fn action(&self) -> &InitializeFn {
        &self.action
    }
}

/// Supplies services nothing is registered for.
#[derive(Clone)]
pub struct FallbackRule {
    predicate: Arc<dyn Fn(&TypeRef, &str) -> bool + Send + Sync>,
    factory: FallbackFactory,
    lifetime: Lifetime,
}

impl FallbackRule {
    pub fn new<P, F>(predicate: P, factory: F, lifetime: Lifetime) -> Self
    where
        P: Fn(&TypeRef, &str) -> bool + Send + Sync + 'static,
        F: Fn(&Container, &ServiceKey) -> Result<Instance> + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            factory: Arc::new(factory),
            lifetime,
        }
    }

    pub fn matches(&self, service_type: &TypeRef, service_name: &str) -> bool {
        (self.predicate)(service_type, service_name)
    }

    /// The registration this rule produces for one request.
    pub(crate) fn registration(&self, service_type: &TypeRef, service_name: &str) -> Registration {
        let key = ServiceKey::new(service_type.clone(), service_name);
        let factory = Arc::clone(&self.factory);
        Registration::factory(
            service_type.clone(),
            Arc::new(move |container: &Container, _args: &[Instance]| factory(container, &key)),
        )
        .named(service_name)
        .with_lifetime(self.lifetime)
    }
}

/// All registered hooks. Lists are snapshotted before user callbacks run.
pub(crate) struct Hooks {
    decorators: RwLock<Vec<Arc<DecoratorRegistration>>>,
    overrides: RwLock<Vec<ServiceOverride>>,
    initializers: RwLock<Vec<Initializer>>,
    fallbacks: RwLock<Vec<FallbackRule>>,
    next_index: AtomicU64,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            decorators: RwLock::new(Vec::new()),
            overrides: RwLock::new(Vec::new()),
            initializers: RwLock::new(Vec::new()),
            fallbacks: RwLock::new(Vec::new()),
            next_index: AtomicU64::new(0),
        }
    }

    pub fn add_decorator(&self, mut decorator: DecoratorRegistration) {
        decorator.index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.decorators.write().push(Arc::new(decorator));
    }

    pub fn add_override(&self, rule: ServiceOverride) {
        self.overrides.write().push(rule);
    }

    pub fn add_initializer(&self, initializer: Initializer) {
        self.initializers.write().push(initializer);
    }

    pub fn add_fallback(&self, rule: FallbackRule) {
        self.fallbacks.write().push(rule);
    }

    pub fn decorator_count(&self) -> usize {
        self.decorators.read().len()
    }

    /// Decorators applying to `registration`, innermost first.
    pub fn decorators_for(&self, registration: &Registration) -> Vec<AppliedDecorator> {
        let decorators = self.decorators.read().clone();
        let mut applied: Vec<AppliedDecorator> = decorators
            .iter()
            .filter_map(|d| d.apply_to(registration))
            .collect();
        applied.sort_by_key(|d| d.index);
        applied
    }

    /// Apply every matching override, in registration order.
    pub fn apply_overrides(
        &self,
        container: &Container,
        mut registration: Registration,
    ) -> Result<Registration> {
        let overrides = self.overrides.read().clone();
        for rule in overrides {
            if (rule.predicate)(&registration) {
                registration = (rule.rewrite)(container, registration)?;
            }
        }
        Ok(registration)
    }

    pub fn initializers_for(&self, registration: &Registration) -> Vec<Initializer> {
        let initializers = self.initializers.read().clone();
        initializers
            .into_iter()
            .filter(|i| (i.predicate)(registration))
            .collect()
    }

    /// The first fallback rule matching the request.
    pub fn fallback_for(&self, service_type: &TypeRef, service_name: &str) -> Option<FallbackRule> {
        let fallbacks = self.fallbacks.read().clone();
        fallbacks
            .into_iter()
            .find(|rule| rule.matches(service_type, service_name))
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("decorators", &self.decorators.read().len())
            .field("overrides", &self.overrides.read().len())
            .field("initializers", &self.initializers.read().len())
            .field("fallbacks", &self.fallbacks.read().len())
            .finish()
    }
}
