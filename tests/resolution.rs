//! End-to-end resolution behavior

use dependency_resolver::{
    disposer_for, Construction, Container, ContainerOptions, DiError, Disposable, Func, Instance,
    Instances, Lazy, Lifetime, Registration, TypeDescriptor, TypeRef,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

// =============================================================================
// Fixtures
// =============================================================================

trait Logger: Send + Sync {
    fn name(&self) -> String;
}

struct ConsoleLogger;
impl Logger for ConsoleLogger {
    fn name(&self) -> String {
        "console".into()
    }
}

struct FileLogger;
impl Logger for FileLogger {
    fn name(&self) -> String {
        "file".into()
    }
}

trait Repo: Send + Sync {
    fn describe(&self) -> String;
}

struct ConsoleRepo {
    logger: Arc<dyn Logger>,
}
impl Repo for ConsoleRepo {
    fn describe(&self) -> String {
        format!("console repo via {}", self.logger.name())
    }
}

struct SqlRepo {
    logger: Arc<dyn Logger>,
}
impl Repo for SqlRepo {
    fn describe(&self) -> String {
        format!("sql repo via {}", self.logger.name())
    }
}

fn describe_loggers(container: &Container) {
    container.add_type(
        TypeDescriptor::of::<ConsoleLogger>()
            .constructor(|()| ConsoleLogger)
            .implements::<dyn Logger, _>(|l| l as Arc<dyn Logger>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<FileLogger>()
            .constructor(|()| FileLogger)
            .implements::<dyn Logger, _>(|l| l as Arc<dyn Logger>)
            .finish(),
    );
}

fn describe_repos(container: &Container) {
    container.add_type(
        TypeDescriptor::of::<ConsoleRepo>()
            .constructor_named(&["logger"], |(logger,): (Arc<dyn Logger>,)| ConsoleRepo { logger })
            .implements::<dyn Repo, _>(|r| r as Arc<dyn Repo>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<SqlRepo>()
            .constructor_named(&["logger"], |(logger,): (Arc<dyn Logger>,)| SqlRepo { logger })
            .implements::<dyn Repo, _>(|r| r as Arc<dyn Repo>)
            .finish(),
    );
}

fn logging_container() -> Container {
    let container = Container::new();
    describe_loggers(&container);
    describe_repos(&container);
    container
}

// =============================================================================
// Lifetimes
// =============================================================================

#[test]
fn test_singleton_resolution_is_idempotent() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);

    let first = container.get::<dyn Logger>().unwrap();
    for _ in 0..10 {
        assert!(Arc::ptr_eq(&first, &container.get::<dyn Logger>().unwrap()));
    }
}

#[test]
fn test_transient_instances_are_distinct() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::Transient);
    container.register_service::<dyn Repo, ConsoleRepo>(Lifetime::Transient);

    let a = container.get::<dyn Repo>().unwrap();
    let b = container.get::<dyn Repo>().unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
}

struct Unit;

struct Pair {
    left: Arc<Unit>,
    right: Arc<Unit>,
}

#[test]
fn test_per_graph_shares_within_one_resolution() {
    let container = Container::new();
    container.add_type(TypeDescriptor::of::<Unit>().constructor(|()| Unit).finish());
    container.add_type(
        TypeDescriptor::of::<Pair>()
            .constructor_named(&["left", "right"], |(left, right): (Arc<Unit>, Arc<Unit>)| {
                Pair { left, right }
            })
            .finish(),
    );
    container.register_service::<Unit, Unit>(Lifetime::PerGraph);
    container.register_service::<Pair, Pair>(Lifetime::Transient);

    let first = container.get::<Pair>().unwrap();
    assert!(Arc::ptr_eq(&first.left, &first.right));

    let second = container.get::<Pair>().unwrap();
    assert!(!Arc::ptr_eq(&first.left, &second.left));
}

struct Session {
    id: u32,
}

#[test]
fn test_per_container_created_once_across_threads() {
    static CREATED: AtomicU32 = AtomicU32::new(0);

    let container = Container::new();
    container.register_factory(Lifetime::PerContainer, |_| {
        let id = CREATED.fetch_add(1, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(5));
        Ok(Arc::new(Session { id }))
    });

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let container = container.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                container.get::<Session>().unwrap()
            })
        })
        .collect();

    let sessions: Vec<Arc<Session>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(sessions[0].id, 0);
}

// =============================================================================
// Scopes and disposal
// =============================================================================

struct Tracked {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Disposable for Tracked {
    fn dispose(&self) {
        self.log.lock().push(self.name);
    }
}

fn register_tracked(
    container: &Container,
    name: &'static str,
    lifetime: Lifetime,
    log: &Arc<Mutex<Vec<&'static str>>>,
) {
    let log = Arc::clone(log);
    container.register(
        Registration::factory(
            TypeRef::of::<Tracked>(),
            Arc::new(move |_: &Container, _: &[Instance]| -> dependency_resolver::Result<Instance> {
                Ok(Instance::new(Tracked {
                    name,
                    log: Arc::clone(&log),
                }))
            }),
        )
        .named(name)
        .with_lifetime(lifetime)
        .disposable_with(disposer_for::<Tracked>()),
    );
}

#[test]
fn test_scope_disposes_in_creation_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let container = Container::new();
    for name in ["alpha", "beta", "gamma"] {
        register_tracked(&container, name, Lifetime::PerScope, &log);
    }

    let scope = container.begin_scope();
    for name in ["beta", "gamma", "alpha", "beta"] {
        container.get_named::<Tracked>(name).unwrap();
    }
    assert!(log.lock().is_empty());

    scope.end().unwrap();
    assert_eq!(*log.lock(), ["beta", "gamma", "alpha"]);
}

#[test]
fn test_per_request_disposed_with_scope() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let container = Container::new();
    register_tracked(&container, "request", Lifetime::PerRequest, &log);

    {
        let _scope = container.begin_scope();
        let a = container.get_named::<Tracked>("request").unwrap();
        let b = container.get_named::<Tracked>("request").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
    assert_eq!(log.lock().len(), 2);

    // Without a scope there is nobody to hand the disposable to
    assert!(matches!(
        container.get_named::<Tracked>("request"),
        Err(DiError::MissingScope { .. })
    ));
}

#[test]
fn test_nested_scope_end_order() {
    let container = Container::new();
    let outer = container.begin_scope();
    let inner = container.begin_scope();

    assert!(matches!(
        container.end_scope(outer.scope()),
        Err(DiError::InvalidScopeEnd { .. })
    ));

    let completed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&completed);
    inner.on_completed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    inner.end().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(container.current_scope().map(|s| s.id()), Some(outer.id()));
    outer.end().unwrap();
    assert!(container.current_scope().is_none());
}

// =============================================================================
// Registration rules
// =============================================================================

#[test]
fn test_named_repositories_without_default_are_unresolvable() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::Transient);
    container.register_named_service::<dyn Repo, ConsoleRepo>("console", Lifetime::Transient);
    container.register_named_service::<dyn Repo, SqlRepo>("sql", Lifetime::Transient);

    assert!(matches!(
        container.get::<dyn Repo>(),
        Err(DiError::UnresolvableService { .. })
    ));

    let sql = container.get_named::<dyn Repo>("sql").unwrap();
    assert_eq!(sql.describe(), "sql repo via console");
}

#[test]
fn test_single_named_registration_serves_default_request() {
    let container = logging_container();
    container.register_named_service::<dyn Logger, FileLogger>("file", Lifetime::Transient);

    assert_eq!(container.get::<dyn Logger>().unwrap().name(), "file");
}

#[test]
fn test_enumerable_collects_in_registration_order() {
    let container = Container::with_options(ContainerOptions::new().variance(false));
    describe_loggers(&container);
    container.register_named_service::<dyn Logger, FileLogger>("b", Lifetime::Transient);
    container.register_named_service::<dyn Logger, ConsoleLogger>("a", Lifetime::Transient);
    container.register_named_service::<dyn Logger, FileLogger>("c", Lifetime::Transient);

    let names: Vec<String> = container
        .get_all::<dyn Logger>()
        .unwrap()
        .iter()
        .map(|l| l.name())
        .collect();
    assert_eq!(names, ["file", "console", "file"]);
}

#[test]
fn test_enumerable_includes_assignable_services_with_variance() {
    let container = logging_container();
    container.register_service::<dyn Logger, FileLogger>(Lifetime::Transient);
    container.register_service::<ConsoleLogger, ConsoleLogger>(Lifetime::Transient);

    let names: Vec<String> = container
        .get_all::<dyn Logger>()
        .unwrap()
        .iter()
        .map(|l| l.name())
        .collect();
    assert_eq!(names, ["file", "console"]);

    let strict = Container::with_options(ContainerOptions::new().variance(false));
    describe_loggers(&strict);
    strict.register_service::<dyn Logger, FileLogger>(Lifetime::Transient);
    strict.register_service::<ConsoleLogger, ConsoleLogger>(Lifetime::Transient);
    assert_eq!(strict.get_all::<dyn Logger>().unwrap().len(), 1);
}

trait Step: Send + Sync {
    fn steps(&self) -> usize;
}

struct Leaf;
impl Step for Leaf {
    fn steps(&self) -> usize {
        1
    }
}

struct Composite {
    children: Vec<Arc<dyn Step>>,
}
impl Step for Composite {
    fn steps(&self) -> usize {
        self.children.iter().map(|c| c.steps()).sum()
    }
}

#[test]
fn test_enumerable_excludes_the_composite_being_resolved() {
    let container = Container::new();
    container.add_type(
        TypeDescriptor::of::<Leaf>()
            .constructor(|()| Leaf)
            .implements::<dyn Step, _>(|h| h as Arc<dyn Step>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Composite>()
            .try_constructor(
                [("children", TypeRef::enumerable(TypeRef::of::<dyn Step>()))],
                |args| {
                    let children = args.get::<Instances>(0)?.cast_all::<dyn Step>()?;
                    Ok(Composite { children })
                },
            )
            .implements::<dyn Step, _>(|h| h as Arc<dyn Step>)
            .finish(),
    );
    container.register_service::<dyn Step, Composite>(Lifetime::Transient);
    container.register_named_service::<dyn Step, Leaf>("leaf", Lifetime::Transient);

    let composite = container.get::<dyn Step>().unwrap();
    assert_eq!(composite.steps(), 1);

    // Outside of the composite both registrations are collected
    assert_eq!(container.get_all::<dyn Step>().unwrap().len(), 2);
}

#[test]
fn test_enumerable_of_unknown_type_is_empty() {
    let container = Container::new();
    assert!(container.get_all::<dyn Logger>().unwrap().is_empty());
}

#[test]
fn test_new_registration_replaces_cached_procedure() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
    assert_eq!(container.get::<dyn Logger>().unwrap().name(), "console");

    container.register_service::<dyn Logger, FileLogger>(Lifetime::PerContainer);
    assert_eq!(container.get::<dyn Logger>().unwrap().name(), "file");
}

#[test]
fn test_read_only_registration_refuses_replacement() {
    let container = logging_container();
    container.register(
        Registration::of_type(TypeRef::of::<dyn Logger>(), TypeRef::of::<ConsoleLogger>())
            .read_only(),
    );
    container.register_service::<dyn Logger, FileLogger>(Lifetime::Transient);
    assert_eq!(container.get::<dyn Logger>().unwrap().name(), "console");
}

// =============================================================================
// Cycles
// =============================================================================

struct Chicken {
    _egg: Arc<Egg>,
}

struct Egg {
    _chicken: Arc<Chicken>,
}

#[test]
fn test_recursive_dependency_is_detected() {
    let container = Container::new();
    container.add_type(
        TypeDescriptor::of::<Chicken>()
            .constructor(|(egg,): (Arc<Egg>,)| Chicken { _egg: egg })
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Egg>()
            .constructor(|(chicken,): (Arc<Chicken>,)| Egg { _chicken: chicken })
            .finish(),
    );
    container.register_service::<Chicken, Chicken>(Lifetime::Transient);
    container.register_service::<Egg, Egg>(Lifetime::Transient);

    for _ in 0..2 {
        match container.get::<Chicken>() {
            Err(DiError::RecursiveDependency { chain, .. }) => {
                assert!(chain.contains("Chicken"));
                assert!(chain.contains("Egg"));
            }
            other => panic!("expected a recursive dependency, got {:?}", other.map(|_| ())),
        }
    }
}

struct Parent {
    child: Arc<Child>,
}

struct Child {
    parent: Arc<Lazy>,
}

#[test]
fn test_lazy_breaks_cycles() {
    let container = Container::new();
    container.add_type(
        TypeDescriptor::of::<Parent>()
            .constructor(|(child,): (Arc<Child>,)| Parent { child })
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Child>()
            .try_constructor([("parent", TypeRef::lazy(TypeRef::of::<Parent>()))], |args| {
                Ok(Child { parent: args.get(0)? })
            })
            .finish(),
    );
    container.register_service::<Parent, Parent>(Lifetime::PerContainer);
    container.register_service::<Child, Child>(Lifetime::Transient);

    let parent = container.get::<Parent>().unwrap();
    let back = parent.child.parent.get::<Parent>().unwrap();
    assert!(Arc::ptr_eq(&parent, &back));
}

// =============================================================================
// Decorators
// =============================================================================

trait Greeter: Send + Sync {
    fn greet(&self) -> String;
}

struct English;
impl Greeter for English {
    fn greet(&self) -> String {
        "hello".into()
    }
}

struct Exclaim {
    inner: Arc<dyn Greeter>,
}
impl Greeter for Exclaim {
    fn greet(&self) -> String {
        format!("{}!", self.inner.greet())
    }
}

struct Brackets {
    inner: Arc<dyn Greeter>,
}
impl Greeter for Brackets {
    fn greet(&self) -> String {
        format!("[{}]", self.inner.greet())
    }
}

fn greeter_container() -> Container {
    let container = Container::new();
    container.add_type(
        TypeDescriptor::of::<English>()
            .constructor(|()| English)
            .implements::<dyn Greeter, _>(|g| g as Arc<dyn Greeter>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Exclaim>()
            .constructor(|(inner,): (Arc<dyn Greeter>,)| Exclaim { inner })
            .implements::<dyn Greeter, _>(|g| g as Arc<dyn Greeter>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Brackets>()
            .constructor(|(inner,): (Arc<dyn Greeter>,)| Brackets { inner })
            .implements::<dyn Greeter, _>(|g| g as Arc<dyn Greeter>)
            .finish(),
    );
    container.register_service::<dyn Greeter, English>(Lifetime::Transient);
    container
}

#[test]
fn test_decorators_wrap_in_registration_order() {
    let container = greeter_container();
    container.decorate_service::<dyn Greeter, Exclaim>();
    container.decorate_service::<dyn Greeter, Brackets>();

    assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "[hello!]");
}

#[test]
fn test_function_decorator() {
    let container = greeter_container();
    container.decorate_service::<dyn Greeter, Exclaim>();
    container.decorate_factory::<dyn Greeter, _>(|_, inner| {
        Ok(Arc::new(Brackets { inner }) as Arc<dyn Greeter>)
    });
    container.decorate_service::<dyn Greeter, Exclaim>();

    assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "[hello!]!");
}

#[test]
fn test_registered_instance_is_decorated() {
    let container = Container::new();
    container.register_instance(Arc::new(1u32));
    container.decorate_factory::<u32, _>(|_, value| Ok(Arc::new(*value + 100)));

    assert_eq!(*container.get::<u32>().unwrap(), 101);
    assert_eq!(*container.get::<u32>().unwrap(), 101);
}

#[test]
fn test_registered_trait_instance_is_decorated() {
    let container = greeter_container();
    container.register_instance::<dyn Greeter>(Arc::new(English));
    container.decorate_service::<dyn Greeter, Exclaim>();

    assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "hello!");
}

struct Deferred {
    inner: Arc<Lazy>,
}
impl Greeter for Deferred {
    fn greet(&self) -> String {
        match self.inner.get::<dyn Greeter>() {
            Ok(inner) => format!("deferred {}", inner.greet()),
            Err(err) => err.to_string(),
        }
    }
}

#[test]
fn test_lazy_decorator_target() {
    static BUILT: AtomicU32 = AtomicU32::new(0);

    let container = Container::new();
    container.add_type(
        TypeDescriptor::of::<English>()
            .constructor(|()| {
                BUILT.fetch_add(1, Ordering::SeqCst);
                English
            })
            .implements::<dyn Greeter, _>(|g| g as Arc<dyn Greeter>)
            .finish(),
    );
    container.add_type(
        TypeDescriptor::of::<Deferred>()
            .try_constructor([("inner", TypeRef::lazy(TypeRef::of::<dyn Greeter>()))], |args| {
                Ok(Deferred { inner: args.get(0)? })
            })
            .implements::<dyn Greeter, _>(|g| g as Arc<dyn Greeter>)
            .finish(),
    );
    container.register_service::<dyn Greeter, English>(Lifetime::Transient);
    container.decorate_service::<dyn Greeter, Deferred>();

    let greeter = container.get::<dyn Greeter>().unwrap();
    assert_eq!(BUILT.load(Ordering::SeqCst), 0);
    assert_eq!(greeter.greet(), "deferred hello");
    assert_eq!(BUILT.load(Ordering::SeqCst), 1);
}

struct Ignores;
impl Greeter for Ignores {
    fn greet(&self) -> String {
        "ignored".into()
    }
}

#[test]
fn test_decorator_without_target_is_rejected() {
    let container = greeter_container();
    container.add_type(
        TypeDescriptor::of::<Ignores>()
            .constructor(|()| Ignores)
            .implements::<dyn Greeter, _>(|g| g as Arc<dyn Greeter>)
            .finish(),
    );
    container.decorate_service::<dyn Greeter, Ignores>();

    assert!(matches!(
        container.get::<dyn Greeter>(),
        Err(DiError::InvalidDecorator { .. })
    ));
}

#[test]
fn test_conditional_decorator() {
    let container = greeter_container();
    container.register_named_service::<dyn Greeter, English>("plain", Lifetime::Transient);
    container.decorate_with(
        dependency_resolver::DecoratorRegistration::new(
            TypeRef::of::<dyn Greeter>(),
            TypeRef::of::<Exclaim>(),
        )
        .when(|registration| registration.service_name().is_empty()),
    );

    assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "hello!");
    assert_eq!(container.get_named::<dyn Greeter>("plain").unwrap().greet(), "hello");
}

// =============================================================================
// Wrappers, generics and hooks
// =============================================================================

struct Greeting(String);

#[test]
fn test_func_forwards_arguments() {
    let container = Container::new();
    container.register_factory_with_args("", Lifetime::Transient, |_, args: &[Instance]| {
        let times = match args.first() {
            Some(arg) => *arg.cast::<usize>()?,
            None => 1,
        };
        Ok(Arc::new(Greeting("hi".repeat(times))))
    });

    let factory = container
        .get_instance(
            &TypeRef::func_with([TypeRef::of::<usize>()], TypeRef::of::<Greeting>()),
            "",
        )
        .unwrap()
        .cast::<Func>()
        .unwrap();
    assert_eq!(factory.arity(), 1);
    assert_eq!(factory.get_with::<Greeting>(&[Instance::new(3usize)]).unwrap().0, "hihihi");

    let plain = container
        .get_instance(&TypeRef::func(TypeRef::of::<Greeting>()), "")
        .unwrap()
        .cast::<Func>()
        .unwrap();
    assert_eq!(plain.get::<Greeting>().unwrap().0, "hi");
}

trait Repository: Send + Sync {
    fn entity(&self) -> String;
}

struct GenericRepo {
    entity: String,
}
impl Repository for GenericRepo {
    fn entity(&self) -> String {
        self.entity.clone()
    }
}

#[test]
fn test_open_generic_is_closed_on_request() {
    let container = Container::new();
    container
        .catalog()
        .add_generic(TypeRef::generic("Repo", [TypeRef::param(0)]), |args| {
            let entity = args[0].name().to_owned();
            Some(
                TypeDescriptor::builder::<GenericRepo>(TypeRef::generic("Repo", args.to_vec()))
                    .constructor(move |()| GenericRepo {
                        entity: entity.clone(),
                    })
                    .implements_as::<dyn Repository, _>(
                        TypeRef::generic("IRepo", args.to_vec()),
                        |r| r as Arc<dyn Repository>,
                    )
                    .finish(),
            )
        });
    container.register_type(
        TypeRef::generic("IRepo", [TypeRef::param(0)]),
        TypeRef::generic("Repo", [TypeRef::param(0)]),
        Lifetime::PerContainer,
    );

    let users = TypeRef::generic("IRepo", [TypeRef::named("User")]);
    let orders = TypeRef::generic("IRepo", [TypeRef::named("Order")]);

    let user_repo = container.get_instance(&users, "").unwrap().cast::<dyn Repository>().unwrap();
    let order_repo = container.get_instance(&orders, "").unwrap().cast::<dyn Repository>().unwrap();
    assert_eq!(user_repo.entity(), "User");
    assert_eq!(order_repo.entity(), "Order");

    let again = container.get_instance(&users, "").unwrap().cast::<dyn Repository>().unwrap();
    assert!(Arc::ptr_eq(&user_repo, &again));
}

struct CachedRepo {
    entity: String,
}
impl Repository for CachedRepo {
    fn entity(&self) -> String {
        format!("cached {}", self.entity)
    }
}

#[test]
fn test_replaced_open_generic_is_closed_again() {
    let container = Container::new();
    container
        .catalog()
        .add_generic(TypeRef::generic("Repo", [TypeRef::param(0)]), |args| {
            let entity = args[0].name().to_owned();
            Some(
                TypeDescriptor::builder::<GenericRepo>(TypeRef::generic("Repo", args.to_vec()))
                    .constructor(move |()| GenericRepo {
                        entity: entity.clone(),
                    })
                    .implements_as::<dyn Repository, _>(
                        TypeRef::generic("IRepo", args.to_vec()),
                        |r| r as Arc<dyn Repository>,
                    )
                    .finish(),
            )
        });
    container
        .catalog()
        .add_generic(TypeRef::generic("CachedRepo", [TypeRef::param(0)]), |args| {
            let entity = args[0].name().to_owned();
            Some(
                TypeDescriptor::builder::<CachedRepo>(TypeRef::generic("CachedRepo", args.to_vec()))
                    .constructor(move |()| CachedRepo {
                        entity: entity.clone(),
                    })
                    .implements_as::<dyn Repository, _>(
                        TypeRef::generic("IRepo", args.to_vec()),
                        |r| r as Arc<dyn Repository>,
                    )
                    .finish(),
            )
        });

    let open = TypeRef::generic("IRepo", [TypeRef::param(0)]);
    let users = TypeRef::generic("IRepo", [TypeRef::named("User")]);
    container.register_type(
        open.clone(),
        TypeRef::generic("Repo", [TypeRef::param(0)]),
        Lifetime::PerContainer,
    );
    let first = container.get_instance(&users, "").unwrap().cast::<dyn Repository>().unwrap();
    assert_eq!(first.entity(), "User");

    container.register_type(
        open,
        TypeRef::generic("CachedRepo", [TypeRef::param(0)]),
        Lifetime::PerContainer,
    );
    let second = container.get_instance(&users, "").unwrap().cast::<dyn Repository>().unwrap();
    assert_eq!(second.entity(), "cached User");
}

#[test]
fn test_fallback_rule_supplies_and_records_service() {
    let container = Container::new();
    container.register_fallback(
        |ty, _| ty.name().starts_with("setting:"),
        |_, key| Ok(Instance::new(format!("value of {}", key.service_type.name()))),
        Lifetime::PerContainer,
    );

    let timeout = TypeRef::named("setting:timeout");
    assert!(container.can_get_instance(&timeout, ""));
    let value = container.get_instance(&timeout, "").unwrap().cast::<String>().unwrap();
    assert_eq!(*value, "value of setting:timeout");
    assert_eq!(container.available_services().len(), 1);

    assert!(container.try_get_instance(&TypeRef::named("other"), "").unwrap().is_none());
}

struct Handler {
    logger: Mutex<Option<Arc<dyn Logger>>>,
}

#[test]
fn test_property_injection() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
    container.add_type(
        TypeDescriptor::of::<Handler>()
            .constructor(|()| Handler {
                logger: Mutex::new(None),
            })
            .property::<dyn Logger, _>("logger", |handler, logger| {
                *handler.logger.lock() = Some(logger)
            })
            .finish(),
    );
    container.register_service::<Handler, Handler>(Lifetime::Transient);

    let built = container.get::<Handler>().unwrap();
    assert_eq!(built.logger.lock().as_ref().map(|l| l.name()), Some("console".to_string()));

    let external = Arc::new(Handler {
        logger: Mutex::new(None),
    });
    container.inject(&external).unwrap();
    assert!(external.logger.lock().is_some());

    let without = Container::with_options(ContainerOptions::new().property_injection(false));
    describe_loggers(&without);
    without.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
    without.add_type(
        TypeDescriptor::of::<Handler>()
            .constructor(|()| Handler {
                logger: Mutex::new(None),
            })
            .property::<dyn Logger, _>("logger", |handler, logger| {
                *handler.logger.lock() = Some(logger)
            })
            .finish(),
    );
    without.register_service::<Handler, Handler>(Lifetime::Transient);
    assert!(without.get::<Handler>().unwrap().logger.lock().is_none());
}

struct Settings {
    key: String,
}

struct Client {
    settings: Arc<Settings>,
}

#[test]
fn test_constructor_dependency_override() {
    let container = Container::new();
    container.add_type(
        TypeDescriptor::of::<Client>()
            .constructor_named(&["primary_settings"], |(settings,): (Arc<Settings>,)| {
                Client { settings }
            })
            .finish(),
    );
    container.register_service::<Client, Client>(Lifetime::Transient);
    container.register_constructor_dependency::<Settings, _>(|_, site| {
        Ok(Arc::new(Settings {
            key: site.name().to_owned(),
        }))
    });

    assert_eq!(container.get::<Client>().unwrap().settings.key, "primary_settings");
}

#[test]
fn test_override_changes_lifetime() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::Transient);
    container.override_registrations(
        |registration| *registration.service_type() == TypeRef::of::<dyn Logger>(),
        |_, registration| Ok(registration.with_lifetime(Lifetime::PerContainer)),
    );

    let a = container.get::<dyn Logger>().unwrap();
    let b = container.get::<dyn Logger>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_construction_with_named_argument() {
    let container = Container::new();
    container.register_named_instance("primary", Arc::new(Settings { key: "one".into() }));
    container.register_named_instance("secondary", Arc::new(Settings { key: "two".into() }));
    container.register_construction(
        TypeRef::of::<Client>(),
        "",
        Lifetime::Transient,
        Construction::<Client>::of()
            .arg_named("settings", TypeRef::of::<Settings>(), "secondary")
            .build(|args| Ok(Client { settings: args.get(0)? })),
    );

    assert_eq!(container.get::<Client>().unwrap().settings.key, "two");
}

#[test]
fn test_unresolved_constructor_dependency_names_the_parameter() {
    let container = logging_container();
    container.register_service::<dyn Repo, SqlRepo>(Lifetime::Transient);

    match container.get::<dyn Repo>() {
        Err(DiError::UnresolvedConstructorDependency { parameter, .. }) => {
            assert_eq!(parameter, "logger")
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_resolution_after_dispose_fails() {
    let container = logging_container();
    container.register_service::<dyn Logger, ConsoleLogger>(Lifetime::PerContainer);
    container.get::<dyn Logger>().unwrap();
    container.dispose();
    assert!(container.is_disposed());
    assert!(matches!(container.get::<dyn Logger>(), Err(DiError::ContainerDisposed)));
}
