//! Batch registration from discovered services
//!
//! A scanner (hand-written, generated by a build script, or a table in a
//! plugin) yields [`ServiceDescriptor`]s; [`Container::register_descriptors`]
//! turns each into a registration. [`CompositionRoot`] groups related
//! registrations into one unit that can be applied to a container.

use crate::registration::{Lifetime, Registration};
use crate::types::TypeRef;
use crate::Container;

#[cfg(feature = "logging")]
use tracing::debug;

/// One discovered `(service, implementing type, name, lifetime)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_type: TypeRef,
    pub implementing_type: TypeRef,
    pub service_name: String,
    pub lifetime: Lifetime,
}

impl ServiceDescriptor {
    pub fn new(service_type: TypeRef, implementing_type: TypeRef) -> Self {
        Self {
            service_type,
            implementing_type,
            service_name: String::new(),
            lifetime: Lifetime::Transient,
        }
    }

    /// `T` registered as the service `I`.
    #[inline]
    pub fn of<I: ?Sized + 'static, T: ?Sized + 'static>() -> Self {
        Self::new(TypeRef::of::<I>(), TypeRef::of::<T>())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn into_registration(self) -> Registration {
        Registration::of_type(self.service_type, self.implementing_type)
            .named(self.service_name)
            .with_lifetime(self.lifetime)
    }
}

/// A unit of registrations applied to a container in one go.
///
/// # Examples
///
/// ```rust
/// use dependency_resolver::{CompositionRoot, Container, Lifetime};
/// use std::sync::Arc;
///
/// struct Settings { verbose: bool }
///
/// struct SettingsModule;
///
/// impl CompositionRoot for SettingsModule {
///     fn compose(&self, container: &Container) {
///         container.register_factory(Lifetime::PerContainer, |_| {
///             Ok(Arc::new(Settings { verbose: true }))
///         });
///     }
/// }
///
/// let container = Container::new();
/// container.register_from(&SettingsModule);
/// assert!(container.get::<Settings>().unwrap().verbose);
/// ```
pub trait CompositionRoot {
    fn compose(&self, container: &Container);

    /// Human-readable name for logs
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl Container {
    /// Register every discovered service.
    pub fn register_descriptors<I>(&self, descriptors: I)
    where
        I: IntoIterator<Item = ServiceDescriptor>,
    {
        let mut _count = 0usize;
        for descriptor in descriptors {
            self.register(descriptor.into_registration());
            _count += 1;
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            count = _count,
            "Registered discovered services"
        );
    }

    /// Apply a composition root.
    pub fn register_from<R: CompositionRoot + ?Sized>(&self, root: &R) {
        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            root = root.name(),
            "Applying composition root"
        );
        root.compose(self);
    }
}

/// Build a [`ServiceDescriptor`].
///
/// ```rust
/// use dependency_resolver::{service, Lifetime};
///
/// trait Store: Send + Sync {}
/// struct MemoryStore;
///
/// let plain = service!(dyn Store => MemoryStore);
/// let shared = service!(dyn Store => MemoryStore, PerContainer);
/// let named = service!(dyn Store => MemoryStore, "memory", PerScope);
///
/// assert_eq!(plain.lifetime, Lifetime::Transient);
/// assert_eq!(shared.lifetime, Lifetime::PerContainer);
/// assert_eq!(named.service_name, "memory");
/// ```
#[macro_export]
macro_rules! service {
    ($service:ty => $implementing:ty) => {
        $crate::ServiceDescriptor::of::<$service, $implementing>()
    };
    ($service:ty => $implementing:ty, $lifetime:ident) => {
        $crate::ServiceDescriptor::of::<$service, $implementing>()
            .with_lifetime($crate::Lifetime::$lifetime)
    };
    ($service:ty => $implementing:ty, $name:expr, $lifetime:ident) => {
        $crate::ServiceDescriptor::of::<$service, $implementing>()
            .named($name)
            .with_lifetime($crate::Lifetime::$lifetime)
    };
}
