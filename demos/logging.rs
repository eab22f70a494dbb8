//! Example demonstrating logging capabilities
//!
//! Run with JSON logging (production):
//! ```bash
//! cargo run --example logging --features logging-json
//! ```
//!
//! Run with pretty logging (development):
//! ```bash
//! cargo run --example logging --features logging-pretty
//! ```

use dependency_resolver::{Container, Lifetime, TypeDescriptor, TypeRef};
use std::sync::Arc;

#[allow(dead_code)]
struct Database {
    url: String,
}

#[allow(dead_code)]
struct UserService {
    db: Arc<Database>,
}

#[allow(dead_code)]
struct RequestContext {
    request_id: String,
}

fn main() {
    // Uses JSON if logging-json is enabled, pretty otherwise
    dependency_resolver::logging::init();

    println!("=== Dependency Resolver Logging Demo ===\n");

    // logs: "Creating resolution container"
    let container = Container::new();

    // logs: "Service registered"
    container.register_factory(Lifetime::PerContainer, |_| {
        Ok(Arc::new(Database {
            url: "postgres://localhost/mydb".into(),
        }))
    });
    container.add_type(
        TypeDescriptor::of::<UserService>()
            .constructor_named(&["db"], |(db,): (Arc<Database>,)| UserService { db })
            .finish(),
    );
    container.register_service::<UserService, UserService>(Lifetime::Transient);
    container.register_factory(Lifetime::PerScope, |_| {
        Ok(Arc::new(RequestContext {
            request_id: "req-12345".into(),
        }))
    });

    // logs: "Compiled resolution procedure"
    let _users = container.get::<UserService>().unwrap();

    // logs: "Service is not resolvable"
    let missing = container.try_get::<i32>().unwrap();
    assert!(missing.is_none());

    // logs: "Scope started", "Scope ended"
    {
        let _scope = container.begin_scope();
        let _ctx = container.get::<RequestContext>().unwrap();
    }

    // Fails outside of a scope
    assert!(container.get_instance(&TypeRef::of::<RequestContext>(), "").is_err());

    // logs: "Container locked"
    container.lock();

    // logs: "Disposing container"
    container.dispose();

    println!("\n=== Demo Complete ===");
    println!("Check the log output above to see structured logging in action!");
    println!("\nTip: Use --features logging-json for production (JSON output)");
    println!("     Use --features logging-pretty for development (colorful output)");
}
