//! Service registrations and the registration store
//!
//! Uses DashMap for concurrent reads during resolution and writes during
//! registration. Registrations for one service type are kept in insertion
//! order so that enumerable requests see them in the order they were made.

use crate::description::ConstructionDescription;
use crate::lifetime::{strategy_for, LifetimeStrategy};
use crate::types::{ServiceKey, TypeRef};
use crate::value::{DisposeCast, Instance};
use crate::{Container, Result};
use ahash::RandomState;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Creates an instance from the container and any runtime arguments.
pub type FactoryFn = Arc<dyn Fn(&Container, &[Instance]) -> Result<Instance> + Send + Sync>;

/// How long a resolved instance is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifetime {
    /// New instance on every resolve, never tracked for disposal
    #[default]
    Transient,

    /// One instance per resolution graph: every reference to the same
    /// implementing type inside one top-level resolve shares it
    PerGraph,

    /// New instance on every resolve; disposables are tracked by the
    /// current scope
    PerRequest,

    /// One instance per scope, disposed when the scope ends
    PerScope,

    /// One instance per container, disposed with the container
    PerContainer,
}

impl Lifetime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifetime::Transient => "transient",
            Lifetime::PerGraph => "per_graph",
            Lifetime::PerRequest => "per_request",
            Lifetime::PerScope => "per_scope",
            Lifetime::PerContainer => "per_container",
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a registration produces its instance.
#[derive(Clone)]
pub enum ServiceSource {
    /// Construct an implementing type described by the metadata provider
    Type(TypeRef),
    /// Call a factory function
    Factory(FactoryFn),
    /// Return a pre-built value
    Instance(Instance),
    /// Use a construction description assembled with [`Construction`](crate::Construction)
    Construction(Arc<ConstructionDescription>),
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSource::Type(ty) => f.debug_tuple("Type").field(ty).finish(),
            ServiceSource::Factory(_) => f.write_str("Factory"),
            ServiceSource::Instance(value) => f.debug_tuple("Instance").field(value).finish(),
            ServiceSource::Construction(description) => f
                .debug_tuple("Construction")
                .field(&description.implementing_type)
                .finish(),
        }
    }
}

/// One `(service type, service name)` registration.
#[derive(Clone)]
pub struct Registration {
    service_type: TypeRef,
    service_name: String,
    source: ServiceSource,
    lifetime: Lifetime,
    strategy: Option<Arc<dyn LifetimeStrategy>>,
    disposer: Option<DisposeCast>,
    read_only: bool,
    prepared: bool,
    /// The open generic registration this one was closed from.
    origin: Option<ServiceKey>,
    sequence: u64,
}

impl Registration {
    pub fn new(service_type: TypeRef, source: ServiceSource) -> Self {
        Self {
            service_type,
            service_name: String::new(),
            source,
            lifetime: Lifetime::Transient,
            strategy: None,
            disposer: None,
            read_only: false,
            prepared: false,
            origin: None,
            sequence: 0,
        }
    }

    /// `service_type` implemented by `implementing_type`.
    pub fn of_type(service_type: TypeRef, implementing_type: TypeRef) -> Self {
        Self::new(service_type, ServiceSource::Type(implementing_type))
    }

    pub fn factory(service_type: TypeRef, factory: FactoryFn) -> Self {
        Self::new(service_type, ServiceSource::Factory(factory))
    }

    pub fn instance(service_type: TypeRef, value: Instance) -> Self {
        Self::new(service_type, ServiceSource::Instance(value))
    }

    pub fn construction(service_type: TypeRef, description: ConstructionDescription) -> Self {
        Self::new(service_type, ServiceSource::Construction(Arc::new(description)))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the lifetime; the registration gets a fresh lifetime strategy.
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self.strategy = strategy_for(lifetime);
        self
    }

    /// Track factory-produced instances for disposal.
    pub fn disposable_with(mut self, disposer: DisposeCast) -> Self {
        self.disposer = Some(disposer);
        self
    }

    /// Refuse later replacement of this registration.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[inline]
    pub fn service_type(&self) -> &TypeRef {
        &self.service_type
    }

    #[inline]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[inline]
    pub fn source(&self) -> &ServiceSource {
        &self.source
    }

    #[inline]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn implementing_type(&self) -> Option<&TypeRef> {
        match &self.source {
            ServiceSource::Type(ty) => Some(ty),
            ServiceSource::Construction(description) => Some(&description.implementing_type),
            _ => None,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.service_type.clone(), self.service_name.clone())
    }

    #[inline]
    pub(crate) fn strategy(&self) -> Option<&Arc<dyn LifetimeStrategy>> {
        self.strategy.as_ref()
    }

    #[inline]
    pub(crate) fn disposer(&self) -> Option<&DisposeCast> {
        self.disposer.as_ref()
    }

    #[inline]
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Overrides have already been applied to this registration.
    #[inline]
    pub(crate) fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    /// The closed registration produced from this open generic one.
    pub(crate) fn close(&self, service_type: TypeRef, implementing_type: TypeRef) -> Registration {
        Registration {
            service_type,
            service_name: self.service_name.clone(),
            source: ServiceSource::Type(implementing_type),
            lifetime: self.lifetime,
            strategy: strategy_for(self.lifetime),
            disposer: self.disposer.clone(),
            read_only: false,
            prepared: false,
            origin: Some(self.key()),
            sequence: 0,
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("service_type", &self.service_type)
            .field("service_name", &self.service_name)
            .field("source", &self.source)
            .field("lifetime", &self.lifetime)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Outcome of inserting into the store.
#[derive(Debug)]
pub(crate) enum Insertion {
    Added,
    Replaced,
    Refused { reason: &'static str },
}

/// Thread-safe registration storage.
///
/// Open generic registrations are stored under their definition
/// (`IRepo<$0>`) so a closed request can find them by `definition()`.
pub(crate) struct RegistrationStore {
    services: DashMap<TypeRef, Vec<Arc<Registration>>, RandomState>,
    sequence: AtomicU64,
}

impl RegistrationStore {
    /// Uses 8 shards; typical containers hold well under a hundred services.
    pub fn with_capacity(capacity: usize) -> Self {
        let shard_amount = if capacity <= 16 {
            8
        } else if capacity <= 64 {
            16
        } else {
            32
        };
        Self {
            services: DashMap::with_capacity_and_hasher_and_shard_amount(
                capacity,
                RandomState::new(),
                shard_amount,
            ),
            sequence: AtomicU64::new(1),
        }
    }

    #[inline]
    fn store_key(service_type: &TypeRef) -> TypeRef {
        if service_type.is_open() {
            service_type.definition()
        } else {
            service_type.clone()
        }
    }

    /// Insert or replace. Replacement is refused for read-only entries and
    /// while `locked`.
    pub fn insert(&self, mut registration: Registration, locked: bool) -> Insertion {
        let key = registration.key();
        let insertion = {
            let mut entries = self
                .services
                .entry(Self::store_key(&registration.service_type))
                .or_default();

            let existing = entries.iter().position(|r| {
                r.service_name == registration.service_name
                    && r.service_type == registration.service_type
            });

            match existing {
                Some(index) => {
                    if entries[index].read_only {
                        return Insertion::Refused { reason: "read-only" };
                    }
                    if locked {
                        return Insertion::Refused { reason: "locked" };
                    }
                    registration.sequence = entries[index].sequence;
                    entries[index] = Arc::new(registration);
                    Insertion::Replaced
                }
                None => {
                    registration.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                    entries.push(Arc::new(registration));
                    Insertion::Added
                }
            }
        };

        // Closings of a replaced open generic are stale
        if matches!(insertion, Insertion::Replaced) && key.service_type.is_open() {
            self.purge_derived(&key);
        }
        insertion
    }

    /// Drop the closed registrations derived from `origin`.
    fn purge_derived(&self, origin: &ServiceKey) {
        for mut entry in self.services.iter_mut() {
            entry
                .value_mut()
                .retain(|r| r.origin.as_ref() != Some(origin));
        }
    }

    /// Insert a registration derived during compilation (closed generics,
    /// fallback results) unless one already exists; returns the stored entry.
    pub fn insert_derived(&self, mut registration: Registration) -> Arc<Registration> {
        let mut entries = self
            .services
            .entry(Self::store_key(&registration.service_type))
            .or_default();

        if let Some(found) = entries.iter().find(|r| {
            r.service_name == registration.service_name
                && r.service_type == registration.service_type
        }) {
            return Arc::clone(found);
        }

        registration.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(registration);
        entries.push(Arc::clone(&registration));
        registration
    }

    /// Swap `original` for its rewritten form.
    ///
    /// When another caller already prepared the same entry, its result wins
    /// so that every procedure shares one lifetime strategy.
    pub fn update(
        &self,
        original: &Arc<Registration>,
        mut rewritten: Registration,
    ) -> Arc<Registration> {
        rewritten.sequence = original.sequence;
        let store_key = Self::store_key(&original.service_type);
        let Some(mut entries) = self.services.get_mut(&store_key) else {
            return Arc::new(rewritten);
        };
        let position = entries
            .iter()
            .position(|r| {
                r.service_name == original.service_name && r.service_type == original.service_type
            });

        match position {
            Some(index) if Arc::ptr_eq(&entries[index], original) => {
                let rewritten = Arc::new(rewritten);
                entries[index] = Arc::clone(&rewritten);
                rewritten
            }
            Some(index)
                if entries[index].prepared && entries[index].sequence == original.sequence =>
            {
                Arc::clone(&entries[index])
            }
            _ => Arc::new(rewritten),
        }
    }

    pub fn lookup(&self, service_type: &TypeRef, service_name: &str) -> Option<Arc<Registration>> {
        self.services.get(service_type).and_then(|entries| {
            entries
                .iter()
                .find(|r| r.service_name == service_name && r.service_type == *service_type)
                .cloned()
        })
    }

    #[inline]
    pub fn contains(&self, service_type: &TypeRef, service_name: &str) -> bool {
        self.lookup(service_type, service_name).is_some()
    }

    /// All registrations of a closed service type, in registration order.
    pub fn for_type(&self, service_type: &TypeRef) -> Vec<Arc<Registration>> {
        self.services
            .get(service_type)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn count_for(&self, service_type: &TypeRef) -> usize {
        self.services
            .get(service_type)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Open generic registrations whose service pattern matches `closed`,
    /// with the parameter bindings of each match.
    pub fn open_matches(&self, closed: &TypeRef) -> Vec<(Arc<Registration>, Vec<TypeRef>)> {
        if !closed.is_generic() || closed.is_open() {
            return Vec::new();
        }
        let Some(entries) = self.services.get(&closed.definition()) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|r| r.service_type.bind(closed).map(|bindings| (Arc::clone(r), bindings)))
            .collect()
    }

    /// Every closed service type with at least one registration.
    pub fn service_types(&self) -> Vec<TypeRef> {
        self.services
            .iter()
            .filter(|entry| !entry.key().is_open() && !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every registration, in registration order.
    pub fn all(&self) -> Vec<Arc<Registration>> {
        let mut all: Vec<Arc<Registration>> = self
            .services
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|r| r.sequence);
        all
    }

    pub fn len(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }
}

impl fmt::Debug for RegistrationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationStore")
            .field("count", &self.len())
            .finish()
    }
}
