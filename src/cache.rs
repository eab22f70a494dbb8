//! Compiled procedure cache
//!
//! Everything derived from the registrations (compiled procedures,
//! construction descriptions, the constants table) lives in one [`Epoch`].
//! A structural change swaps in a fresh epoch instead of clearing maps in
//! place, so a compilation racing with a registration can never publish a
//! procedure built from stale decisions into the new epoch.

use crate::description::ConstructionDescription;
use crate::emit::{Constant, ConstantsTable, Invocation, Invoker, Procedure};
use crate::scope::Scope;
use crate::types::{ServiceKey, TypeRef};
use crate::value::Instance;
use crate::{Container, Result};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A procedure ready to run, bound to the constants it was compiled against.
#[derive(Clone)]
pub struct CompiledProcedure {
    procedure: Arc<Procedure>,
    constants: Arc<[Constant]>,
    invoker: Invoker,
}

impl CompiledProcedure {
    pub(crate) fn new(
        procedure: Arc<Procedure>,
        constants: Arc<[Constant]>,
        invoker: Invoker,
    ) -> Self {
        Self {
            procedure,
            constants,
            invoker,
        }
    }

    #[inline]
    pub fn invoke(
        &self,
        container: &Container,
        scope: Option<&Arc<Scope>>,
        args: &[Instance],
    ) -> Result<Instance> {
        (self.invoker)(&Invocation {
            container,
            constants: &self.constants,
            scope,
            args,
        })
    }

    #[inline]
    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }
}

impl fmt::Debug for CompiledProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProcedure")
            .field("ops", &self.procedure.ops().len())
            .field("constants", &self.constants.len())
            .finish()
    }
}

/// One generation of derived state.
pub(crate) struct Epoch {
    id: u64,
    procedures: DashMap<ServiceKey, CompiledProcedure, RandomState>,
    injectors: DashMap<TypeRef, CompiledProcedure, RandomState>,
    descriptions: DashMap<TypeRef, Arc<ConstructionDescription>, RandomState>,
    constants: ConstantsTable,
}

impl Epoch {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            procedures: DashMap::with_capacity_and_hasher_and_shard_amount(
                capacity,
                RandomState::new(),
                8,
            ),
            injectors: DashMap::with_hasher(RandomState::new()),
            descriptions: DashMap::with_capacity_and_hasher_and_shard_amount(
                capacity,
                RandomState::new(),
                8,
            ),
            constants: ConstantsTable::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn constants(&self) -> &ConstantsTable {
        &self.constants
    }

    pub fn description(&self, ty: &TypeRef) -> Option<Arc<ConstructionDescription>> {
        self.descriptions.get(ty).map(|d| Arc::clone(d.value()))
    }

    pub fn store_description(
        &self,
        ty: TypeRef,
        description: ConstructionDescription,
    ) -> Arc<ConstructionDescription> {
        Arc::clone(
            self.descriptions
                .entry(ty)
                .or_insert_with(|| Arc::new(description))
                .value(),
        )
    }

    pub fn compiled_count(&self) -> usize {
        self.procedures.len()
    }
}

/// Holds the current epoch.
pub(crate) struct ResolutionCache {
    current: RwLock<Arc<Epoch>>,
    generation: AtomicU64,
    capacity: usize,
}

impl ResolutionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(Epoch::new(0, capacity))),
            generation: AtomicU64::new(0),
            capacity,
        }
    }

    #[inline]
    pub fn epoch(&self) -> Arc<Epoch> {
        Arc::clone(&*self.current.read())
    }

    /// Drop all derived state; returns the new epoch id.
    pub fn invalidate(&self) -> u64 {
        let id = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.current.write() = Arc::new(Epoch::new(id, self.capacity));
        id
    }

    /// The cached procedure for `key`, compiling it on a miss.
    ///
    /// `compile` returns `Ok(None)` for an unresolvable request; misses are
    /// not cached. A result compiled against an epoch that has since been
    /// replaced is returned to the caller but not published.
    pub fn get_or_compile<F>(
        &self,
        key: &ServiceKey,
        compile: F,
    ) -> Result<Option<CompiledProcedure>>
    where
        F: FnOnce(&Arc<Epoch>) -> Result<Option<CompiledProcedure>>,
    {
        let epoch = self.epoch();
        if let Some(found) = epoch.procedures.get(key) {
            return Ok(Some(found.value().clone()));
        }
        let Some(compiled) = compile(&epoch)? else {
            return Ok(None);
        };
        Ok(Some(self.publish(&epoch, &epoch.procedures, key.clone(), compiled)))
    }

    /// Like [`get_or_compile`](Self::get_or_compile) for property injectors.
    pub fn injector_or_compile<F>(&self, ty: &TypeRef, compile: F) -> Result<CompiledProcedure>
    where
        F: FnOnce(&Arc<Epoch>) -> Result<CompiledProcedure>,
    {
        let epoch = self.epoch();
        if let Some(found) = epoch.injectors.get(ty) {
            return Ok(found.value().clone());
        }
        let compiled = compile(&epoch)?;
        Ok(self.publish(&epoch, &epoch.injectors, ty.clone(), compiled))
    }

    fn publish<K>(
        &self,
        epoch: &Arc<Epoch>,
        map: &DashMap<K, CompiledProcedure, RandomState>,
        key: K,
        compiled: CompiledProcedure,
    ) -> CompiledProcedure
    where
        K: std::hash::Hash + Eq,
    {
        if !Arc::ptr_eq(epoch, &*self.current.read()) {
            return compiled;
        }
        // First writer wins so every caller shares one procedure.
        map.entry(key).or_insert(compiled).value().clone()
    }
}

impl fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let epoch = self.epoch();
        f.debug_struct("ResolutionCache")
            .field("epoch", &epoch.id)
            .field("compiled", &epoch.compiled_count())
            .field("constants", &epoch.constants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{Backend, Interpreter, ProcedureBuilder};

    fn compile_constant(epoch: &Arc<Epoch>, value: u32) -> CompiledProcedure {
        let mut builder = ProcedureBuilder::new(epoch.constants());
        builder.push_value(Instance::new(value), TypeRef::of::<u32>());
        let procedure = Arc::new(builder.finish(0));
        CompiledProcedure::new(
            Arc::clone(&procedure),
            epoch.constants().snapshot(),
            Interpreter.compile(procedure),
        )
    }

    #[test]
    fn test_compiles_once_per_epoch() {
        let cache = ResolutionCache::new(0);
        let key = ServiceKey::new(TypeRef::of::<u32>(), "");
        let mut compiles = 0;

        for _ in 0..3 {
            cache
                .get_or_compile(&key, |epoch| {
                    compiles += 1;
                    Ok(Some(compile_constant(epoch, 1)))
                })
                .unwrap();
        }
        assert_eq!(compiles, 1);

        cache.invalidate();
        cache
            .get_or_compile(&key, |epoch| {
                compiles += 1;
                Ok(Some(compile_constant(epoch, 2)))
            })
            .unwrap();
        assert_eq!(compiles, 2);
    }

    #[test]
    fn test_misses_are_not_cached() {
        let cache = ResolutionCache::new(0);
        let key = ServiceKey::new(TypeRef::of::<u32>(), "");
        assert!(cache.get_or_compile(&key, |_| Ok(None)).unwrap().is_none());
        assert_eq!(cache.epoch().compiled_count(), 0);
    }

    #[test]
    fn test_stale_epoch_is_not_published() {
        let cache = ResolutionCache::new(0);
        let key = ServiceKey::new(TypeRef::of::<u32>(), "");

        let result = cache
            .get_or_compile(&key, |epoch| {
                let compiled = compile_constant(epoch, 1);
                cache.invalidate();
                Ok(Some(compiled))
            })
            .unwrap();
        assert!(result.is_some());
        assert_eq!(cache.epoch().compiled_count(), 0);
        assert_eq!(cache.epoch().id(), 1);
    }
}
