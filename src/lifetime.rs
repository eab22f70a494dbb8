//! Lifetime strategies
//!
//! A strategy decides whether a compiled creation body runs or an existing
//! instance is reused. Every registration with a non-transient lifetime owns
//! its own strategy object, so two registrations never share instances.
//!
//! `Transient` and `PerGraph` have no strategy: transient instances are
//! created inline and graph-shared instances live in a local slot of the
//! resolution frame.

use crate::registration::Lifetime;
use crate::scope::{Disposables, Scope, ScopeId};
use crate::types::TypeRef;
use crate::value::{Disposable, Instance};
use crate::{DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// An instance fresh out of its creation body.
pub struct Created {
    pub instance: Instance,
    /// Disposable view of the instance, if its type is disposable.
    pub disposable: Option<Arc<dyn Disposable>>,
}

/// What a strategy can see of the resolution in progress.
pub struct LifetimeContext<'a> {
    pub service: &'a TypeRef,
    pub scope: Option<&'a Arc<Scope>>,
    /// Disposables owned by the container itself.
    pub container: &'a Disposables,
}

impl LifetimeContext<'_> {
    fn require_scope(&self) -> Result<&Arc<Scope>> {
        self.scope.ok_or_else(|| DiError::MissingScope {
            service: self.service.to_string(),
        })
    }
}

/// Decides reuse of instances across resolutions.
pub trait LifetimeStrategy: Send + Sync {
    /// Return an instance, calling `create` when a new one is needed.
    fn get_instance(
        &self,
        create: &mut dyn FnMut() -> Result<Created>,
        context: &LifetimeContext<'_>,
    ) -> Result<Instance>;

    fn lifetime(&self) -> Lifetime;
}

/// A fresh strategy for `lifetime`, or `None` when it needs none.
pub(crate) fn strategy_for(lifetime: Lifetime) -> Option<Arc<dyn LifetimeStrategy>> {
    match lifetime {
        Lifetime::Transient | Lifetime::PerGraph => None,
        Lifetime::PerRequest => Some(Arc::new(PerRequestLifetime)),
        Lifetime::PerScope => Some(Arc::new(PerScopeLifetime::new())),
        Lifetime::PerContainer => Some(Arc::new(PerContainerLifetime::new())),
    }
}

// =============================================================================
// PerContainer
// =============================================================================

/// One instance for the life of the container.
///
/// Concurrent first resolutions block on the cell, so exactly one instance
/// is ever created.
pub struct PerContainerLifetime {
    instance: OnceCell<Instance>,
}

impl PerContainerLifetime {
    pub fn new() -> Self {
        Self {
            instance: OnceCell::new(),
        }
    }
}

impl Default for PerContainerLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeStrategy for PerContainerLifetime {
    #[inline]
    fn get_instance(
        &self,
        create: &mut dyn FnMut() -> Result<Created>,
        context: &LifetimeContext<'_>,
    ) -> Result<Instance> {
        if let Some(instance) = self.instance.get() {
            return Ok(instance.clone());
        }
        self.instance
            .get_or_try_init(|| {
                #[cfg(feature = "logging")]
                debug!(
                    target: "dependency_resolver",
                    service = %context.service,
                    "Per-container instance initializing on first access"
                );

                let created = create()?;
                if let Some(disposable) = created.disposable {
                    context.container.track(disposable);
                }
                Ok(created.instance)
            })
            .cloned()
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::PerContainer
    }
}

// =============================================================================
// PerScope
// =============================================================================

/// One instance per scope; forgotten when the scope completes.
pub struct PerScopeLifetime {
    instances: Arc<DashMap<ScopeId, Instance, RandomState>>,
}

impl PerScopeLifetime {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(DashMap::with_hasher(RandomState::new())),
        }
    }

    /// Number of scopes currently holding an instance.
    pub fn live_scopes(&self) -> usize {
        self.instances.len()
    }
}

impl Default for PerScopeLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeStrategy for PerScopeLifetime {
    fn get_instance(
        &self,
        create: &mut dyn FnMut() -> Result<Created>,
        context: &LifetimeContext<'_>,
    ) -> Result<Instance> {
        let scope = context.require_scope()?;
        if let Some(existing) = self.instances.get(&scope.id()) {
            return Ok(existing.value().clone());
        }

        // The creation body may resolve other services, so it runs without
        // holding a shard lock.
        let created = create()?;
        let mut inserted = false;
        let instance = self
            .instances
            .entry(scope.id())
            .or_insert_with(|| {
                inserted = true;
                created.instance.clone()
            })
            .value()
            .clone();

        if inserted {
            if let Some(disposable) = created.disposable {
                scope.track(disposable);
            }
            let instances = Arc::downgrade(&self.instances);
            scope.on_completed(move |id| {
                if let Some(instances) = instances.upgrade() {
                    instances.remove(&id);
                }
            });

            #[cfg(feature = "logging")]
            trace!(
                target: "dependency_resolver",
                service = %context.service,
                scope_id = scope.id().id(),
                "Per-scope instance created"
            );
        }
        Ok(instance)
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::PerScope
    }
}

// =============================================================================
// PerRequest
// =============================================================================

/// A new instance every time; disposables are handed to the current scope.
#[derive(Debug, Default)]
pub struct PerRequestLifetime;

impl LifetimeStrategy for PerRequestLifetime {
    #[inline]
    fn get_instance(
        &self,
        create: &mut dyn FnMut() -> Result<Created>,
        context: &LifetimeContext<'_>,
    ) -> Result<Instance> {
        let created = create()?;
        if let Some(disposable) = created.disposable {
            context.require_scope()?.track(disposable);
        }
        Ok(created.instance)
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::PerRequest
    }
}

impl fmt::Debug for PerContainerLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerContainerLifetime")
            .field("created", &self.instance.get().is_some())
            .finish()
    }
}

impl fmt::Debug for PerScopeLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerScopeLifetime")
            .field("live_scopes", &self.live_scopes())
            .finish()
    }
}
