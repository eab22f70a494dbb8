//! Decorators, open generics and scopes
//!
//! ```bash
//! cargo run --example decorators
//! ```

use dependency_resolver::prelude::*;
use std::time::Instant;

trait Handler: Send + Sync {
    fn handle(&self, command: &str) -> String;
}

struct PlaceOrder;
impl Handler for PlaceOrder {
    fn handle(&self, command: &str) -> String {
        format!("order placed: {command}")
    }
}

/// Measures the wrapped handler.
struct Timing {
    inner: Arc<dyn Handler>,
}
impl Handler for Timing {
    fn handle(&self, command: &str) -> String {
        let start = Instant::now();
        let result = self.inner.handle(command);
        format!("{result} ({:?})", start.elapsed())
    }
}

/// Rejects empty commands before they reach the wrapped handler.
struct Validation {
    inner: Arc<dyn Handler>,
}
impl Handler for Validation {
    fn handle(&self, command: &str) -> String {
        if command.is_empty() {
            return "rejected: empty command".into();
        }
        self.inner.handle(command)
    }
}

trait Repository: Send + Sync {
    fn entity(&self) -> &str;
}

struct MemoryRepository {
    entity: String,
}
impl Repository for MemoryRepository {
    fn entity(&self) -> &str {
        &self.entity
    }
}

fn main() -> Result<()> {
    #[cfg(any(feature = "logging-json", feature = "logging-pretty"))]
    dependency_resolver::logging::init();

    let container = Container::new();

    container.add_type(
        TypeDescriptor::of::<PlaceOrder>()
            .constructor(|()| PlaceOrder)
            .implements::<dyn Handler, _>(|h| h as Arc<dyn Handler>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Timing>()
            .constructor(|(inner,): (Arc<dyn Handler>,)| Timing { inner })
            .implements::<dyn Handler, _>(|h| h as Arc<dyn Handler>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Validation>()
            .constructor(|(inner,): (Arc<dyn Handler>,)| Validation { inner })
            .implements::<dyn Handler, _>(|h| h as Arc<dyn Handler>)
            .finish(),
    );

    container.register_service::<dyn Handler, PlaceOrder>(Lifetime::PerContainer);
    // Validation runs first because it is registered last
    container.decorate_service::<dyn Handler, Timing>();
    container.decorate_service::<dyn Handler, Validation>();

    let handler = container.get::<dyn Handler>()?;
    println!("{}", handler.handle("2 x coffee"));
    println!("{}", handler.handle(""));

    // IRepository<$0> -> MemoryRepository<$0>, closed on demand
    container
        .catalog()
        .add_generic(TypeRef::generic("MemoryRepository", [TypeRef::param(0)]), |args| {
            let entity = args[0].name().to_owned();
            let closed = TypeRef::generic("MemoryRepository", args.to_vec());
            Some(
                TypeDescriptor::builder::<MemoryRepository>(closed)
                    .constructor(move |()| MemoryRepository {
                        entity: entity.clone(),
                    })
                    .implements_as::<dyn Repository, _>(
                        TypeRef::generic("IRepository", args.to_vec()),
                        |r| r as Arc<dyn Repository>,
                    )
                    .finish(),
            )
        });
    container.register_type(
        TypeRef::generic("IRepository", [TypeRef::param(0)]),
        TypeRef::generic("MemoryRepository", [TypeRef::param(0)]),
        Lifetime::PerScope,
    );

    for request in ["customer", "invoice"] {
        let scope = container.begin_scope();
        let repo = container
            .get_instance(&TypeRef::generic("IRepository", [TypeRef::named(request)]), "")?
            .cast::<dyn Repository>()?;
        println!("{}: repository for {}", scope.id(), repo.entity());
        scope.end()?;
    }

    container.dispose();
    Ok(())
}
