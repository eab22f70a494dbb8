//! # dependency-resolver
//!
//! A dependency resolution engine: register services, ask for one, and the
//! container builds the whole object graph behind it.
//!
//! ## Features
//!
//! - **Compiled resolution** - each requested service is compiled once into
//!   a procedure and cached until the registrations change
//! - **Lifetimes** - transient, per graph, per request, per scope and per
//!   container instances, with disposal tracking
//! - **Decorators** - type, function, conditional and open generic
//!   decorators applied in registration order
//! - **Wrappers** - `Lazy<T>`, `Func<T>`, `Func<A.., T>` and enumerable
//!   requests are understood without registering them
//! - **Open generics** - register `IRepo<$0> -> Repo<$0>` once, resolve any
//!   `IRepo<User>`
//! - **Observable** - optional `tracing` events, JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use dependency_resolver::{Container, Lifetime, TypeDescriptor};
//! use std::sync::Arc;
//!
//! trait Logger: Send + Sync {
//!     fn log(&self, message: &str) -> String;
//! }
//!
//! struct ConsoleLogger;
//! impl Logger for ConsoleLogger {
//!     fn log(&self, message: &str) -> String { format!("[console] {message}") }
//! }
//!
//! struct UserService {
//!     logger: Arc<dyn Logger>,
//! }
//!
//! let container = Container::new();
//!
//! // Describe the implementing types
//! container.add_type(
//!     TypeDescriptor::of::<ConsoleLogger>()
//!         .constructor(|()| ConsoleLogger)
//!         .implements::<dyn Logger, _>(|l| l as Arc<dyn Logger>)
//!         .finish(),
//! );
//! container.add_type(
//!     TypeDescriptor::of::<UserService>()
//!         .constructor_named(&["logger"], |(logger,): (Arc<dyn Logger>,)| UserService { logger })
//!         .finish(),
//! );
//!
//! // Register services
//! container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
//! container.register_service::<UserService, UserService>(Lifetime::Transient);
//!
//! // Resolve the graph
//! let users = container.get::<UserService>().unwrap();
//! assert_eq!(users.logger.log("hi"), "[console] hi");
//! ```
//!
//! ## Scopes
//!
//! ```rust
//! use dependency_resolver::{Container, Lifetime};
//! use std::sync::Arc;
//!
//! struct RequestContext;
//!
//! let container = Container::new();
//! container.register_factory(Lifetime::PerScope, |_| Ok(Arc::new(RequestContext)));
//!
//! // Per-scope services need an active scope
//! assert!(container.get::<RequestContext>().is_err());
//!
//! let scope = container.begin_scope();
//! let a = container.get::<RequestContext>().unwrap();
//! let b = container.get::<RequestContext>().unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! scope.end().unwrap();
//! ```
//!
//! ## Runtime types
//!
//! Rust has no runtime reflection. Services are keyed by [`TypeRef`]
//! (`TypeRef::of::<T>()` for any Rust type, or a structural name with
//! generic arguments), and implementing types describe their constructors,
//! properties and service views through [`TypeDescriptor`]s held by a
//! [`MetadataProvider`].

mod cache;
mod compiler;
mod container;
mod decorator;
mod description;
pub mod emit;
mod error;
mod lifetime;
#[cfg(feature = "logging")]
pub mod logging;
mod metadata;
mod provider;
mod registration;
mod scope;
mod types;
mod value;

pub use cache::CompiledProcedure;
pub use container::*;
pub use decorator::*;
pub use description::*;
pub use emit::{Backend, Interpreter, Invocation, Invoker};
pub use error::*;
pub use lifetime::*;
pub use metadata::*;
pub use provider::*;
pub use registration::*;
pub use scope::*;
pub use types::*;
pub use value::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CollectionKind, CompositionRoot, Construction, Container, ContainerOptions, DiError,
        Disposable, Func, Instance, Instances, Lazy, Lifetime, Registration, Result, ScopeGuard,
        TypeDescriptor, TypeRef,
    };
    pub use std::sync::Arc;
}
