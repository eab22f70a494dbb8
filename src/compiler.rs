//! Dependency graph compilation
//!
//! The compiler walks the dependency graph of one request and emits a
//! single procedure that builds the whole graph. A request is matched
//! against, in order:
//!
//! 1. an exact `(type, name)` registration;
//! 2. `Lazy<T>`, `Func<A.., T>` and `Func<T>` wrappers;
//! 3. `Enumerable<T>`, `Array<T>`, `List<T>` and `Collection<T>`;
//! 4. the only registration of the type, when the request has no name;
//! 5. an open generic registration that can be closed over the request;
//! 6. the first matching fallback rule.
//!
//! Registrations currently being emitted are kept on a stack; meeting one
//! of them again is a recursive dependency.

use crate::cache::{CompiledProcedure, Epoch};
use crate::container::ContainerInner;
use crate::decorator::{AppliedDecorator, AppliedKind};
use crate::description::{
    describe, ConstructionDescription, Dependency, DependencySite, DescribeContext,
};
use crate::emit::{Procedure, ProcedureBuilder};
use crate::metadata::TypeDescriptor;
use crate::registration::{FactoryFn, Lifetime, Registration, ServiceSource};
use crate::types::{CollectionKind, ServiceKey, Shape, TypeRef};
use crate::value::{DisposeCast, Instance};
use crate::{Container, DiError, Result};
use ahash::RandomState;
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Compile the procedure for `key`, or `None` when nothing can satisfy it.
pub(crate) fn compile(
    container: &Container,
    epoch: &Arc<Epoch>,
    key: &ServiceKey,
) -> Result<Option<CompiledProcedure>> {
    let mut compiler = Compiler::new(container, epoch);
    let mut builder = ProcedureBuilder::new(epoch.constants());
    if !compiler.emit_service(&key.service_type, &key.service_name, &mut builder)? {
        return Ok(None);
    }
    let procedure = builder.finish(compiler.graph.count);

    #[cfg(feature = "logging")]
    debug!(
        target: "dependency_resolver",
        service = %key,
        ops = procedure.ops().len(),
        locals = procedure.locals(),
        epoch = epoch.id(),
        "Compiled resolution procedure"
    );

    Ok(Some(compiler.finish(procedure)))
}

/// Compile a procedure that injects the properties of its argument 0.
pub(crate) fn compile_injector(
    container: &Container,
    epoch: &Arc<Epoch>,
    ty: &TypeRef,
) -> Result<CompiledProcedure> {
    let mut compiler = Compiler::new(container, epoch);
    let descriptor = compiler.descriptor(ty)?;
    let description = compiler.describe(&descriptor, true, None)?;

    let mut builder = ProcedureBuilder::new(epoch.constants());
    builder.push_argument(0, ty.clone());
    compiler.emit_properties(&description, &mut builder)?;
    let procedure = builder.finish(compiler.graph.count);
    Ok(compiler.finish(procedure))
}

/// Whether `(ty, name)` could be resolved, without compiling anything.
pub(crate) fn can_resolve(inner: &ContainerInner, ty: &TypeRef, name: &str) -> bool {
    let store = &inner.store;
    if store.contains(ty, name) {
        return true;
    }
    match ty.shape() {
        Some(Shape::Lazy(inner_type)) | Some(Shape::Func(inner_type))
            if can_resolve(inner, inner_type, name) =>
        {
            return true;
        }
        Some(Shape::FuncWith { output, .. }) if can_resolve(inner, output, name) => return true,
        Some(Shape::Collection(..)) => return true,
        _ => {}
    }
    (name.is_empty() && store.count_for(ty) == 1)
        || store.open_matches(ty).iter().any(|(open, bindings)| {
            open.service_name() == name
                && matches!(open.source(), ServiceSource::Type(implementing)
                    if inner.describe(&implementing.substitute(bindings)).is_some())
        })
        || inner.hooks.fallback_for(ty, name).is_some()
}

/// Graph-local slots of one frame.
#[derive(Default)]
struct GraphLocals {
    slots: HashMap<TypeRef, usize, RandomState>,
    count: usize,
}

struct Compiler<'c> {
    container: &'c Container,
    inner: &'c ContainerInner,
    epoch: &'c Arc<Epoch>,
    emitting: Vec<ServiceKey>,
    graph: GraphLocals,
    saved_graphs: Vec<GraphLocals>,
}

impl<'c> Compiler<'c> {
    fn new(container: &'c Container, epoch: &'c Arc<Epoch>) -> Self {
        Self {
            container,
            inner: container.inner(),
            epoch,
            emitting: Vec::new(),
            graph: GraphLocals::default(),
            saved_graphs: Vec::new(),
        }
    }

    fn finish(&self, procedure: Procedure) -> CompiledProcedure {
        let procedure = Arc::new(procedure);
        CompiledProcedure::new(
            Arc::clone(&procedure),
            self.epoch.constants().snapshot(),
            self.inner.backend.compile(procedure),
        )
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Emit code leaving an instance of `ty` on the stack.
    ///
    /// Returns `false`, having emitted nothing, when the request cannot be
    /// satisfied.
    fn emit_service(
        &mut self,
        ty: &TypeRef,
        name: &str,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<bool> {
        let inner = self.inner;
        let store = &inner.store;
        if let Some(registration) = store.lookup(ty, name) {
            self.emit_registration(registration, b)?;
            return Ok(true);
        }

        if let Some(shape) = ty.shape() {
            if self.emit_wrapper(shape, ty, name, b)? {
                return Ok(true);
            }
        }

        if name.is_empty() {
            let candidates = store.for_type(ty);
            if let [only] = candidates.as_slice() {
                #[cfg(feature = "logging")]
                trace!(
                    target: "dependency_resolver",
                    service = %ty,
                    name = only.service_name(),
                    "Redirecting default request to the only named registration"
                );
                self.emit_registration(Arc::clone(only), b)?;
                return Ok(true);
            }
        }

        if let Some(registration) = self.close_generic(ty, name) {
            self.emit_registration(registration, b)?;
            return Ok(true);
        }

        if let Some(rule) = inner.hooks.fallback_for(ty, name) {
            #[cfg(feature = "logging")]
            debug!(
                target: "dependency_resolver",
                service = %ty,
                name = name,
                "Service supplied by fallback rule"
            );
            let registration = store.insert_derived(rule.registration(ty, name));
            self.emit_registration(registration, b)?;
            return Ok(true);
        }

        Ok(false)
    }

    fn emit_wrapper(
        &mut self,
        shape: Shape<'_>,
        ty: &TypeRef,
        name: &str,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<bool> {
        match shape {
            Shape::Lazy(inner) => {
                if !can_resolve(self.inner, inner, name) {
                    return Ok(false);
                }
                b.resolve_lazy(ServiceKey::new(inner.clone(), name), ty.clone());
            }
            Shape::FuncWith { params, output } => {
                if !can_resolve(self.inner, output, name) {
                    return Ok(false);
                }
                b.resolve_func(ServiceKey::new(output.clone(), name), params.len(), ty.clone());
            }
            Shape::Func(inner) => {
                if !can_resolve(self.inner, inner, name) {
                    return Ok(false);
                }
                b.resolve_func(ServiceKey::new(inner.clone(), name), 0, ty.clone());
            }
            Shape::Collection(kind, item) => self.emit_collection(kind, item, ty, b)?,
        }
        Ok(true)
    }

    /// All registrations of `item`, registration order, minus any that are
    /// being emitted right now.
    fn emit_collection(
        &mut self,
        kind: CollectionKind,
        item: &TypeRef,
        ty: &TypeRef,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let inner = self.inner;
        let store = &inner.store;
        let mut entries: Vec<(Arc<Registration>, Option<crate::metadata::CastFn>)> =
            store.for_type(item).into_iter().map(|r| (r, None)).collect();

        for (open, bindings) in store.open_matches(item) {
            if entries.iter().any(|(r, _)| r.service_name() == open.service_name()) {
                continue;
            }
            if let ServiceSource::Type(implementing) = open.source() {
                let closed = implementing.substitute(&bindings);
                if inner.describe(&closed).is_some() {
                    entries.push((store.insert_derived(open.close(item.clone(), closed)), None));
                }
            }
        }

        if inner.options.enable_variance {
            for other in store.service_types() {
                if other == *item || other.shape().is_some() {
                    continue;
                }
                let Some(cast) = inner
                    .describe(&other)
                    .and_then(|descriptor| descriptor.cast_to(item).cloned())
                else {
                    continue;
                };
                entries.extend(
                    store
                        .for_type(&other)
                        .into_iter()
                        .map(|r| (r, Some(Arc::clone(&cast)))),
                );
            }
        }

        entries.sort_by_key(|(r, _)| r.sequence());
        entries.retain(|(r, _)| !self.emitting.contains(&r.key()));

        let len = entries.len();
        for (registration, cast) in entries {
            self.emit_registration(registration, b)?;
            if let Some(cast) = cast {
                b.cast(item, &cast);
            }
        }
        b.new_collection(kind, item, len, ty.clone());
        Ok(())
    }

    fn close_generic(&self, ty: &TypeRef, name: &str) -> Option<Arc<Registration>> {
        let store = &self.inner.store;
        for (open, bindings) in store.open_matches(ty) {
            if open.service_name() != name {
                continue;
            }
            let ServiceSource::Type(implementing) = open.source() else {
                continue;
            };
            let closed = implementing.substitute(&bindings);
            if self.inner.describe(&closed).is_none() {
                #[cfg(feature = "logging")]
                debug!(
                    target: "dependency_resolver",
                    service = %ty,
                    implementing = %closed,
                    "Open generic registration cannot be closed over the request"
                );
                continue;
            }
            return Some(store.insert_derived(open.close(ty.clone(), closed)));
        }
        None
    }

    // =========================================================================
    // Registrations
    // =========================================================================

    fn emit_registration(
        &mut self,
        registration: Arc<Registration>,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let key = registration.key();
        if self.emitting.contains(&key) {
            let chain = self
                .emitting
                .iter()
                .chain(std::iter::once(&key))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(DiError::RecursiveDependency {
                service: key.service_type.to_string(),
                name: key.service_name,
                chain,
            });
        }

        self.emitting.push(key);
        let result = self.emit_registration_body(&registration, b);
        self.emitting.pop();
        result
    }

    fn emit_registration_body(
        &mut self,
        registration: &Arc<Registration>,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let registration = self.prepare(registration)?;
        let decorators = self.inner.hooks.decorators_for(&registration);
        // Registered values are decorated but never pass through a lifetime
        let strategy = match registration.source() {
            ServiceSource::Instance(_) => None,
            _ => registration.strategy(),
        };
        match strategy {
            Some(strategy) => {
                let mut body = b.nested();
                self.emit_layers(&registration, &decorators, &mut body)?;
                b.with_lifetime(strategy, registration.service_type(), body.finish(0));
            }
            None => self.emit_layers(&registration, &decorators, b)?,
        }
        Ok(())
    }

    /// Apply overrides once per registration and remember the result.
    fn prepare(&self, registration: &Arc<Registration>) -> Result<Arc<Registration>> {
        if registration.is_prepared() {
            return Ok(Arc::clone(registration));
        }
        let mut rewritten = self
            .inner
            .hooks
            .apply_overrides(self.container, (**registration).clone())?;
        rewritten.mark_prepared();
        Ok(self.inner.store.update(registration, rewritten))
    }

    /// Emit the registration wrapped in `layers`, the last one outermost.
    fn emit_layers(
        &mut self,
        registration: &Registration,
        layers: &[AppliedDecorator],
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let Some((outer, inner)) = layers.split_last() else {
            return self.emit_base(registration, b);
        };
        match &outer.kind {
            AppliedKind::Factory(decorate) => {
                self.emit_layers(registration, inner, b)?;
                b.decorate(decorate);
                b.retype(registration.service_type().clone());
                Ok(())
            }
            AppliedKind::Type(decorator) => self.emit_decorator(registration, decorator, inner, b),
        }
    }

    fn emit_decorator(
        &mut self,
        registration: &Registration,
        decorator: &TypeRef,
        inner: &[AppliedDecorator],
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let service = registration.service_type();
        let descriptor = self.descriptor(decorator)?;
        let description = self.describe(&descriptor, false, Some(service))?;

        let targets = description
            .constructor_dependencies
            .iter()
            .filter(|d| d.is_decorator_target)
            .count();
        if targets != 1 {
            return Err(DiError::InvalidDecorator {
                decorator: decorator.to_string(),
                service: service.to_string(),
                reason: format!(
                    "expected exactly one constructor parameter of type {service} \
                     or Lazy<{service}>, found {targets}"
                ),
            });
        }
        let constructor = description
            .constructor
            .as_ref()
            .ok_or_else(|| DiError::MissingPublicConstructor {
                type_name: decorator.to_string(),
            })?;

        #[cfg(feature = "logging")]
        trace!(
            target: "dependency_resolver",
            service = %service,
            decorator = %decorator,
            "Applying decorator"
        );

        for dependency in &description.constructor_dependencies {
            if !dependency.is_decorator_target {
                self.emit_dependency(dependency, decorator, b)?;
            } else if dependency.service_type == *service {
                self.emit_layers(registration, inner, b)?;
            } else {
                // Lazy target: the inner chain runs in its own frame on first access
                self.saved_graphs.push(std::mem::take(&mut self.graph));
                let mut body = b.nested();
                let emitted = self.emit_layers(registration, inner, &mut body);
                let locals = self.graph.count;
                self.graph = self.saved_graphs.pop().unwrap_or_default();
                emitted?;
                b.make_lazy(service, body.finish(locals));
            }
        }
        b.construct(decorator, constructor.invoker(), description.constructor_dependencies.len());
        self.emit_properties(&description, b)?;
        self.emit_cast(decorator, service, Some(&descriptor), true, b)
    }

    /// The undecorated instance, already cast to the service type.
    ///
    /// A registered value is pushed as is; initializers only run on
    /// instances the container creates.
    fn emit_base(
        &mut self,
        registration: &Registration,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let service = registration.service_type();
        match registration.source() {
            ServiceSource::Type(implementing) => {
                let descriptor = self.descriptor(implementing)?;
                let description = self.description(implementing, &descriptor)?;
                self.emit_construction(registration, &description, descriptor.disposer(), b)?;
                self.emit_cast(implementing, service, Some(&descriptor), true, b)
            }
            ServiceSource::Construction(description) => {
                let descriptor = self.inner.describe(&description.implementing_type);
                let disposer = descriptor
                    .as_ref()
                    .and_then(|d| d.disposer())
                    .or(registration.disposer());
                self.emit_construction(registration, description, disposer, b)?;
                self.emit_cast(
                    &description.implementing_type,
                    service,
                    descriptor.as_deref(),
                    false,
                    b,
                )
            }
            ServiceSource::Factory(factory) => {
                let description =
                    ConstructionDescription::from_factory(service.clone(), Arc::clone(factory));
                self.emit_construction(registration, &description, registration.disposer(), b)
            }
            ServiceSource::Instance(value) => {
                b.push_value(value.clone(), service.clone());
                Ok(())
            }
        }
    }

    /// Cast from the implementing type to the service type.
    ///
    /// When no cast is known a `strict` emission fails; otherwise the value
    /// is assumed to already be the service view.
    fn emit_cast(
        &self,
        implementing: &TypeRef,
        service: &TypeRef,
        descriptor: Option<&TypeDescriptor>,
        strict: bool,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        if implementing == service {
            return Ok(());
        }
        match descriptor.and_then(|d| d.cast_to(service)) {
            Some(cast) => b.cast(service, cast),
            None if strict => return Err(DiError::type_mismatch(service, implementing)),
            None => b.retype(service.clone()),
        }
        Ok(())
    }

    fn emit_construction(
        &mut self,
        registration: &Registration,
        description: &ConstructionDescription,
        disposer: Option<&DisposeCast>,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let capture = registration.strategy().and(disposer);
        if registration.lifetime() != Lifetime::PerGraph {
            return self.emit_creation(registration, description, capture, None, b);
        }

        let slot = self.graph_slot(&description.implementing_type);
        let mut body = b.nested();
        self.emit_creation(registration, description, capture, Some(slot), &mut body)?;
        b.load_local_or(slot, body.finish(0));
        Ok(())
    }

    fn emit_creation(
        &mut self,
        registration: &Registration,
        description: &ConstructionDescription,
        capture: Option<&DisposeCast>,
        slot: Option<usize>,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        let implementing = &description.implementing_type;
        match (&description.raw_factory, &description.constructor) {
            (Some(factory), _) => b.call_factory(factory, implementing.clone()),
            (None, Some(constructor)) => {
                for dependency in &description.constructor_dependencies {
                    self.emit_dependency(dependency, implementing, b)?;
                }
                b.construct(
                    implementing,
                    constructor.invoker(),
                    description.constructor_dependencies.len(),
                );
            }
            (None, None) => {
                return Err(DiError::MissingPublicConstructor {
                    type_name: implementing.to_string(),
                })
            }
        }

        if let Some(disposer) = capture {
            b.capture(disposer);
        }
        if let Some(slot) = slot {
            b.store_local(slot);
        }
        self.emit_properties(description, b)?;
        for initializer in self.inner.hooks.initializers_for(registration) {
            b.initialize(initializer.action());
        }
        Ok(())
    }

    fn emit_properties(
        &mut self,
        description: &ConstructionDescription,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<()> {
        for dependency in &description.property_dependencies {
            let DependencySite::Property(property) = &dependency.site else {
                continue;
            };
            let Some(setter) = property.setter() else {
                continue;
            };
            if self.emit_dependency(dependency, &description.implementing_type, b)? {
                b.set_property(setter);
            }
        }
        Ok(())
    }

    /// Emit one dependency value; `false` when an optional one is missing.
    fn emit_dependency(
        &mut self,
        dependency: &Dependency,
        target: &TypeRef,
        b: &mut ProcedureBuilder<'_>,
    ) -> Result<bool> {
        if let Some(factory) = &dependency.override_factory {
            let factory = Arc::clone(factory);
            let site = dependency.site.clone();
            let call: FactoryFn = Arc::new(move |container: &Container, _args: &[Instance]| {
                factory(container, &site)
            });
            b.call_factory(&call, dependency.service_type.clone());
            return Ok(true);
        }

        let ty = &dependency.service_type;
        let found = if dependency.service_name.is_empty() {
            self.emit_service(ty, "", b)? || self.emit_service(ty, dependency.site_name(), b)?
        } else {
            self.emit_service(ty, &dependency.service_name, b)?
        };
        if found || !dependency.is_required {
            return Ok(found);
        }

        Err(DiError::UnresolvedConstructorDependency {
            target: target.to_string(),
            parameter: dependency.site_name().to_owned(),
            service: ty.to_string(),
            name: dependency.service_name.clone(),
        })
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    fn graph_slot(&mut self, ty: &TypeRef) -> usize {
        let graph = &mut self.graph;
        if let Some(&slot) = graph.slots.get(ty) {
            return slot;
        }
        let slot = graph.count;
        graph.count += 1;
        graph.slots.insert(ty.clone(), slot);
        slot
    }

    fn descriptor(&self, ty: &TypeRef) -> Result<Arc<TypeDescriptor>> {
        self.inner.describe(ty).ok_or_else(|| DiError::MissingMetadata {
            type_name: ty.to_string(),
        })
    }

    /// Cached description of an implementing type.
    fn description(
        &self,
        ty: &TypeRef,
        descriptor: &TypeDescriptor,
    ) -> Result<Arc<ConstructionDescription>> {
        if let Some(found) = self.epoch.description(ty) {
            return Ok(found);
        }
        let description = self.describe(descriptor, false, None)?;
        Ok(self.epoch.store_description(ty.clone(), description))
    }

    fn describe(
        &self,
        descriptor: &TypeDescriptor,
        skip_constructor: bool,
        decorated: Option<&TypeRef>,
    ) -> Result<ConstructionDescription> {
        let inner = self.inner;
        let can_resolve = |ty: &TypeRef, name: &str| can_resolve(inner, ty, name);
        let context = DescribeContext {
            constructor_selector: inner.constructor_selector.as_ref(),
            property_selector: if inner.options.enable_property_injection {
                Some(inner.property_selector.as_ref())
            } else {
                None
            },
            overrides: &inner.dependency_overrides,
            can_resolve: &can_resolve,
        };
        describe(descriptor, skip_constructor, decorated, &context)
    }
}
