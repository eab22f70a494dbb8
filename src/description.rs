//! Construction descriptions
//!
//! A [`ConstructionDescription`] is the resolver's plan for building one
//! implementing type: the selected constructor, a [`Dependency`] for every
//! constructor parameter and injectable property, or a raw factory function.
//! Descriptions come from type metadata through the pluggable
//! [`ConstructorSelector`] and [`PropertySelector`], or are assembled by hand
//! with the [`Construction`] builder.

use crate::metadata::{
    Args, ConstructFn, ConstructorInfo, ParameterInfo, PropertyInfo, SetterFn, TypeDescriptor,
};
use crate::registration::FactoryFn;
use crate::types::{Shape, TypeRef};
use crate::value::Instance;
use crate::{Container, DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Where a dependency is injected.
#[derive(Debug, Clone)]
pub enum DependencySite {
    Parameter(ParameterInfo),
    Property(PropertyInfo),
}

impl DependencySite {
    /// Parameter or property name.
    pub fn name(&self) -> &str {
        match self {
            DependencySite::Parameter(p) => &p.name,
            DependencySite::Property(p) => &p.name,
        }
    }
}

/// Produces a dependency value in place of normal resolution.
pub type DependencyFactory =
    Arc<dyn Fn(&Container, &DependencySite) -> Result<Instance> + Send + Sync>;

/// One value a construction needs.
#[derive(Clone)]
pub struct Dependency {
    pub service_type: TypeRef,
    /// Explicit service name. Empty means "default, then the site name".
    pub service_name: String,
    pub is_required: bool,
    /// The slot that receives the decorated instance.
    pub is_decorator_target: bool,
    pub site: DependencySite,
    pub override_factory: Option<DependencyFactory>,
}

impl Dependency {
    fn new(service_type: TypeRef, site: DependencySite, is_required: bool) -> Self {
        Self {
            service_type,
            service_name: String::new(),
            is_required,
            is_decorator_target: false,
            site,
            override_factory: None,
        }
    }

    pub fn site_name(&self) -> &str {
        self.site.name()
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("service_type", &self.service_type)
            .field("service_name", &self.service_name)
            .field("site", &self.site.name())
            .field("is_required", &self.is_required)
            .field("is_decorator_target", &self.is_decorator_target)
            .field("overridden", &self.override_factory.is_some())
            .finish()
    }
}

/// How to build one implementing type.
#[derive(Clone)]
pub struct ConstructionDescription {
    pub implementing_type: TypeRef,
    pub constructor: Option<ConstructorInfo>,
    pub constructor_dependencies: Vec<Dependency>,
    pub property_dependencies: Vec<Dependency>,
    pub raw_factory: Option<FactoryFn>,
}

impl ConstructionDescription {
    /// A description that calls `factory` instead of a constructor.
    pub fn from_factory(implementing_type: TypeRef, factory: FactoryFn) -> Self {
        Self {
            implementing_type,
            constructor: None,
            constructor_dependencies: Vec::new(),
            property_dependencies: Vec::new(),
            raw_factory: Some(factory),
        }
    }

    /// The decorator target dependency, if any.
    pub fn decorator_target(&self) -> Option<&Dependency> {
        self.constructor_dependencies
            .iter()
            .find(|d| d.is_decorator_target)
    }
}

impl fmt::Debug for ConstructionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructionDescription")
            .field("implementing_type", &self.implementing_type)
            .field("constructor", &self.constructor)
            .field("constructor_dependencies", &self.constructor_dependencies)
            .field("property_dependencies", &self.property_dependencies)
            .field("raw_factory", &self.raw_factory.is_some())
            .finish()
    }
}

/// Chooses the constructor used to build a type.
pub trait ConstructorSelector: Send + Sync {
    /// `can_resolve(type, name)` reports whether a dependency could be bound.
    fn select(
        &self,
        descriptor: &TypeDescriptor,
        can_resolve: &dyn Fn(&TypeRef, &str) -> bool,
    ) -> Result<ConstructorInfo>;
}

/// Picks the public constructor with the most parameters that can all be
/// resolved, either by default name or by their parameter name.
///
/// A type with a single public constructor always gets that constructor;
/// missing dependencies then surface when the graph is compiled.
#[derive(Debug, Default, Clone, Copy)]
pub struct MostResolvableConstructorSelector;

impl ConstructorSelector for MostResolvableConstructorSelector {
    fn select(
        &self,
        descriptor: &TypeDescriptor,
        can_resolve: &dyn Fn(&TypeRef, &str) -> bool,
    ) -> Result<ConstructorInfo> {
        let mut candidates: Vec<&ConstructorInfo> = descriptor
            .constructors()
            .iter()
            .filter(|c| c.is_public())
            .collect();

        match candidates.len() {
            0 => Err(DiError::MissingPublicConstructor {
                type_name: descriptor.type_ref().to_string(),
            }),
            1 => Ok(candidates[0].clone()),
            _ => {
                // Stable sort keeps declaration order among equal arities
                candidates.sort_by(|a, b| b.params().len().cmp(&a.params().len()));
                candidates
                    .into_iter()
                    .find(|c| {
                        c.params()
                            .iter()
                            .all(|p| can_resolve(&p.ty, "") || can_resolve(&p.ty, &p.name))
                    })
                    .cloned()
                    .ok_or_else(|| DiError::NoResolvableConstructor {
                        type_name: descriptor.type_ref().to_string(),
                    })
            }
        }
    }
}

/// Chooses the properties injected after construction.
pub trait PropertySelector: Send + Sync {
    fn select(&self, descriptor: &TypeDescriptor) -> Vec<PropertyInfo>;
}

/// Public, writable, non-indexed properties.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPropertySelector;

impl DefaultPropertySelector {
    #[inline]
    pub fn is_injectable(property: &PropertyInfo) -> bool {
        property.is_public
            && property.is_writable
            && !property.is_indexed
            && property.setter().is_some()
    }
}

impl PropertySelector for DefaultPropertySelector {
    fn select(&self, descriptor: &TypeDescriptor) -> Vec<PropertyInfo> {
        descriptor
            .properties()
            .iter()
            .filter(|p| Self::is_injectable(p))
            .cloned()
            .collect()
    }
}

/// [`DefaultPropertySelector`] narrowed by a predicate.
pub struct FilteredPropertySelector<F> {
    filter: F,
}

impl<F> FilteredPropertySelector<F>
where
    F: Fn(&TypeDescriptor, &PropertyInfo) -> bool + Send + Sync,
{
    pub fn new(filter: F) -> Self {
        Self { filter }
    }
}

impl<F> PropertySelector for FilteredPropertySelector<F>
where
    F: Fn(&TypeDescriptor, &PropertyInfo) -> bool + Send + Sync,
{
    fn select(&self, descriptor: &TypeDescriptor) -> Vec<PropertyInfo> {
        descriptor
            .properties()
            .iter()
            .filter(|p| DefaultPropertySelector::is_injectable(p) && (self.filter)(descriptor, p))
            .cloned()
            .collect()
    }
}

/// Factories registered to supply dependencies of a given service type.
pub(crate) struct DependencyOverrides {
    constructor: DashMap<TypeRef, DependencyFactory, RandomState>,
    property: DashMap<TypeRef, DependencyFactory, RandomState>,
}

impl DependencyOverrides {
    pub fn new() -> Self {
        Self {
            constructor: DashMap::with_hasher(RandomState::new()),
            property: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn set_constructor(&self, ty: TypeRef, factory: DependencyFactory) {
        self.constructor.insert(ty, factory);
    }

    pub fn set_property(&self, ty: TypeRef, factory: DependencyFactory) {
        self.property.insert(ty, factory);
    }

    fn constructor_factory(&self, ty: &TypeRef) -> Option<DependencyFactory> {
        self.constructor.get(ty).map(|f| Arc::clone(f.value()))
    }

    fn property_factory(&self, ty: &TypeRef) -> Option<DependencyFactory> {
        self.property.get(ty).map(|f| Arc::clone(f.value()))
    }
}

/// Inputs for turning type metadata into a description.
pub(crate) struct DescribeContext<'a> {
    pub constructor_selector: &'a dyn ConstructorSelector,
    /// `None` when property injection is disabled.
    pub property_selector: Option<&'a dyn PropertySelector>,
    pub overrides: &'a DependencyOverrides,
    pub can_resolve: &'a dyn Fn(&TypeRef, &str) -> bool,
}

/// Build the description of `descriptor`'s type.
///
/// With `skip_constructor` only property dependencies are produced (used
/// to inject an existing instance). When `decorated` names a service type,
/// parameters of that type or of `Lazy<service>` are accepted during
/// constructor selection and marked as decorator targets.
pub(crate) fn describe(
    descriptor: &TypeDescriptor,
    skip_constructor: bool,
    decorated: Option<&TypeRef>,
    context: &DescribeContext<'_>,
) -> Result<ConstructionDescription> {
    let is_target = |ty: &TypeRef| match decorated {
        Some(service) => {
            ty == service || matches!(ty.shape(), Some(Shape::Lazy(inner)) if inner == service)
        }
        None => false,
    };

    let mut description = ConstructionDescription {
        implementing_type: descriptor.type_ref().clone(),
        constructor: None,
        constructor_dependencies: Vec::new(),
        property_dependencies: Vec::new(),
        raw_factory: None,
    };

    if !skip_constructor {
        let can_resolve =
            |ty: &TypeRef, name: &str| is_target(ty) || (context.can_resolve)(ty, name);
        let constructor = context.constructor_selector.select(descriptor, &can_resolve)?;
        description.constructor_dependencies = constructor
            .params()
            .iter()
            .map(|param| {
                let mut dependency = Dependency::new(
                    param.ty.clone(),
                    DependencySite::Parameter(param.clone()),
                    true,
                );
                dependency.is_decorator_target = is_target(&param.ty);
                if !dependency.is_decorator_target {
                    dependency.override_factory = context.overrides.constructor_factory(&param.ty);
                }
                dependency
            })
            .collect();
        description.constructor = Some(constructor);
    }

    if let Some(selector) = context.property_selector {
        description.property_dependencies = selector
            .select(descriptor)
            .into_iter()
            .map(|property| {
                let override_factory = context.overrides.property_factory(&property.ty);
                let mut dependency =
                    Dependency::new(property.ty.clone(), DependencySite::Property(property), false);
                dependency.override_factory = override_factory;
                dependency
            })
            .collect();
    }

    Ok(description)
}

/// Hand-built construction of `T`, bypassing metadata.
///
/// # Examples
///
/// ```rust
/// use dependency_resolver::{Construction, Container, Lifetime, TypeRef};
/// use std::sync::Arc;
///
/// struct Endpoint(String);
/// struct Client { endpoint: Arc<Endpoint> }
///
/// let container = Container::new();
/// container.register_instance(Arc::new(Endpoint("https://primary".into())));
/// container.register_construction(
///     TypeRef::of::<Client>(),
///     "",
///     Lifetime::Transient,
///     Construction::<Client>::of()
///         .arg_of::<Endpoint>("endpoint")
///         .build(|args| Ok(Client { endpoint: args.get(0)? })),
/// );
///
/// let client = container.get::<Client>().unwrap();
/// assert_eq!(client.endpoint.0, "https://primary");
/// ```
pub struct Construction<T> {
    implementing_type: TypeRef,
    params: Vec<(String, TypeRef, String)>,
    properties: Vec<PropertyInfo>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Construction<T> {
    pub fn of() -> Self {
        Self::new(TypeRef::of::<T>())
    }

    pub fn new(implementing_type: TypeRef) -> Self {
        Self {
            implementing_type,
            params: Vec::new(),
            properties: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Append a constructor argument resolved by default name, then by
    /// `param_name`.
    pub fn arg(mut self, param_name: &str, ty: TypeRef) -> Self {
        self.params.push((param_name.to_owned(), ty, String::new()));
        self
    }

    /// Append a constructor argument bound to the named service.
    pub fn arg_named(mut self, param_name: &str, ty: TypeRef, service_name: &str) -> Self {
        self.params.push((param_name.to_owned(), ty, service_name.to_owned()));
        self
    }

    pub fn arg_of<A: ?Sized + 'static>(self, param_name: &str) -> Self {
        self.arg(param_name, TypeRef::of::<A>())
    }

    /// Inject an optional property of type `V` after construction.
    pub fn property<V, F>(mut self, name: &str, f: F) -> Self
    where
        V: ?Sized + Send + Sync + 'static,
        F: Fn(&T, Arc<V>) + Send + Sync + 'static,
    {
        let setter: SetterFn = Arc::new(move |target: &Instance, value: Instance| -> Result<()> {
            let target = target.cast::<T>()?;
            f(&target, value.cast::<V>()?);
            Ok(())
        });
        self.properties.push(PropertyInfo::new(name, TypeRef::of::<V>(), setter));
        self
    }

    /// Finish with a constructor producing `T`.
    pub fn build<F>(self, f: F) -> ConstructionDescription
    where
        F: Fn(&Args) -> Result<T> + Send + Sync + 'static,
    {
        self.finish(Arc::new(move |args: &Args| f(args).map(Instance::new)))
    }

    /// Finish with a constructor producing the service view directly, for
    /// example `Arc<dyn Trait>`.
    pub fn build_as<I, F>(self, f: F) -> ConstructionDescription
    where
        I: ?Sized + Send + Sync + 'static,
        F: Fn(&Args) -> Result<Arc<I>> + Send + Sync + 'static,
    {
        self.finish(Arc::new(move |args: &Args| f(args).map(Instance::from_arc)))
    }

    fn finish(self, invoke: ConstructFn) -> ConstructionDescription {
        let constructor = ConstructorInfo::new(
            self.params.iter().map(|(name, ty, _)| (name.clone(), ty.clone())),
            invoke,
        );
        let constructor_dependencies = constructor
            .params()
            .iter()
            .zip(self.params)
            .map(|(param, (_, _, service_name))| {
                let mut dependency = Dependency::new(
                    param.ty.clone(),
                    DependencySite::Parameter(param.clone()),
                    true,
                );
                dependency.service_name = service_name;
                dependency
            })
            .collect();
        let property_dependencies = self
            .properties
            .into_iter()
            .map(|property| {
                Dependency::new(property.ty.clone(), DependencySite::Property(property), false)
            })
            .collect();

        ConstructionDescription {
            implementing_type: self.implementing_type,
            constructor: Some(constructor),
            constructor_dependencies,
            property_dependencies,
            raw_factory: None,
        }
    }
}
