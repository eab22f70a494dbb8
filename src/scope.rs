//! Scope tracking
//!
//! A scope bounds the lifetime of `PerScope` instances and owns the
//! disposables created by `PerRequest` and `PerScope` registrations while it
//! is active. Scopes nest per thread: beginning a scope makes it the current
//! scope of the calling thread and the active child of the previous one.

use crate::value::Disposable;
use crate::{DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Unique scope identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Generate a new unique scope ID.
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Disposables owned by a scope or the container, disposed in the order
/// they were tracked.
#[derive(Default)]
pub struct Disposables {
    items: Mutex<Vec<Arc<dyn Disposable>>>,
}

impl Disposables {
    pub fn track(&self, disposable: Arc<dyn Disposable>) {
        self.items.lock().push(disposable);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Dispose everything tracked so far and forget it.
    pub fn dispose_all(&self) {
        let items = std::mem::take(&mut *self.items.lock());
        for item in items {
            item.dispose();
        }
    }
}

impl fmt::Debug for Disposables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposables").field("count", &self.len()).finish()
    }
}

type CompletionHandler = Box<dyn FnOnce(ScopeId) + Send>;

/// One node of a thread's scope tree.
pub struct Scope {
    id: ScopeId,
    thread: ThreadId,
    parent: Option<Arc<Scope>>,
    child: Mutex<Weak<Scope>>,
    disposables: Disposables,
    completed: Mutex<Vec<CompletionHandler>>,
    ended: AtomicBool,
}

impl Scope {
    fn new(parent: Option<Arc<Scope>>) -> Self {
        Self {
            id: ScopeId::next(),
            thread: thread::current().id(),
            parent,
            child: Mutex::new(Weak::new()),
            disposables: Disposables::default(),
            completed: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// The nested scope currently active inside this one.
    pub fn active_child(&self) -> Option<Arc<Scope>> {
        self.child.lock().upgrade().filter(|child| !child.is_ended())
    }

    /// Dispose `disposable` when this scope ends.
    pub fn track(&self, disposable: Arc<dyn Disposable>) {
        self.disposables.track(disposable);
    }

    /// Number of disposables waiting for the end of this scope.
    pub fn tracked(&self) -> usize {
        self.disposables.len()
    }

    /// Run `handler` when this scope ends, before its disposables are disposed.
    pub fn on_completed<F>(&self, handler: F)
    where
        F: FnOnce(ScopeId) + Send + 'static,
    {
        self.completed.lock().push(Box::new(handler));
    }

    fn complete(&self) {
        let handlers = std::mem::take(&mut *self.completed.lock());
        for handler in handlers {
            handler(self.id);
        }
        self.disposables.dispose_all();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("ended", &self.is_ended())
            .field("tracked", &self.tracked())
            .finish()
    }
}

/// Per-thread current scope bookkeeping.
pub(crate) struct ScopeManager {
    current: DashMap<ThreadId, Arc<Scope>, RandomState>,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self {
            current: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// The current scope of the calling thread.
    #[inline]
    pub fn current(&self) -> Option<Arc<Scope>> {
        if self.current.is_empty() {
            return None;
        }
        self.current
            .get(&thread::current().id())
            .map(|scope| Arc::clone(scope.value()))
    }

    /// Begin a scope nested in the calling thread's current scope.
    pub fn begin(&self) -> Arc<Scope> {
        let parent = self.current();
        let scope = Arc::new(Scope::new(parent.clone()));
        if let Some(parent) = &parent {
            *parent.child.lock() = Arc::downgrade(&scope);
        }
        self.current.insert(scope.thread, Arc::clone(&scope));

        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            scope_id = scope.id.id(),
            parent_scope_id = parent.as_ref().map(|p| p.id.id()),
            "Scope started"
        );

        scope
    }

    /// End `scope`, restore its parent as current and dispose what it owns.
    ///
    /// Ending an already ended scope is a no-op. Fails with
    /// [`DiError::InvalidScopeEnd`] while a nested scope is still active.
    pub fn end(&self, scope: &Arc<Scope>) -> Result<()> {
        if scope.is_ended() {
            return Ok(());
        }
        if let Some(child) = scope.active_child() {
            return Err(DiError::InvalidScopeEnd {
                scope: scope.id.id(),
                child: child.id.id(),
            });
        }
        if scope.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let is_current = self
            .current
            .get(&scope.thread)
            .is_some_and(|current| Arc::ptr_eq(current.value(), scope));
        if is_current {
            match &scope.parent {
                Some(parent) => {
                    self.current.insert(scope.thread, Arc::clone(parent));
                }
                None => {
                    self.current.remove(&scope.thread);
                }
            }
        }
        if let Some(parent) = &scope.parent {
            let mut child = parent.child.lock();
            if child.upgrade().is_some_and(|c| Arc::ptr_eq(&c, scope)) {
                *child = Weak::new();
            }
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "dependency_resolver",
            scope_id = scope.id.id(),
            disposables = scope.tracked(),
            "Scope ended"
        );

        scope.complete();
        Ok(())
    }
}

impl fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeManager")
            .field("active_threads", &self.current.len())
            .finish()
    }
}

/// Handle to a scope begun with [`Container::begin_scope`](crate::Container::begin_scope).
///
/// The scope ends when the guard is dropped, or earlier through
/// [`end`](Self::end).
///
/// # Examples
///
/// ```rust
/// use dependency_resolver::Container;
///
/// let container = Container::new();
/// {
///     let scope = container.begin_scope();
///     assert_eq!(container.current_scope().map(|s| s.id()), Some(scope.id()));
/// }
/// assert!(container.current_scope().is_none());
/// ```
pub struct ScopeGuard {
    scope: Arc<Scope>,
    manager: Arc<ScopeManager>,
}

impl ScopeGuard {
    pub(crate) fn new(scope: Arc<Scope>, manager: Arc<ScopeManager>) -> Self {
        Self { scope, manager }
    }

    /// End the scope now.
    pub fn end(&self) -> Result<()> {
        self.manager.end(&self.scope)
    }

    #[inline]
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }
}

impl std::ops::Deref for ScopeGuard {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.scope.is_ended() {
            return;
        }
        if let Err(_err) = self.manager.end(&self.scope) {
            #[cfg(feature = "logging")]
            warn!(
                target: "dependency_resolver",
                scope_id = self.scope.id.id(),
                error = %_err,
                "Scope dropped while a nested scope is still active"
            );
        }
    }
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopeGuard").field(&self.scope).finish()
    }
}
