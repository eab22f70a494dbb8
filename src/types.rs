//! Runtime type references
//!
//! Services are keyed by a structural [`TypeRef`] rather than a bare `TypeId`
//! so that generic service types can be opened, closed and decomposed at
//! runtime (`Lazy<T>`, `Func<T>`, `Enumerable<T>`, `IRepo<$0>`, ...).

use ahash::RandomState;
use once_cell::sync::Lazy;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub(crate) const LAZY: &str = "Lazy";
pub(crate) const FUNC: &str = "Func";
pub(crate) const ENUMERABLE: &str = "Enumerable";
pub(crate) const ARRAY: &str = "Array";
pub(crate) const LIST: &str = "List";
pub(crate) const COLLECTION: &str = "Collection";

/// The flavour of a multi-valued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Enumerable,
    Array,
    List,
    Collection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapperKind {
    Lazy,
    Func,
    Collection(CollectionKind),
}

// Read-only for the life of the process; classification never changes.
static WRAPPERS: Lazy<HashMap<&'static str, WrapperKind, RandomState>> = Lazy::new(|| {
    let mut map = HashMap::with_hasher(RandomState::new());
    map.insert(LAZY, WrapperKind::Lazy);
    map.insert(FUNC, WrapperKind::Func);
    map.insert(ENUMERABLE, WrapperKind::Collection(CollectionKind::Enumerable));
    map.insert(ARRAY, WrapperKind::Collection(CollectionKind::Array));
    map.insert(LIST, WrapperKind::Collection(CollectionKind::List));
    map.insert(COLLECTION, WrapperKind::Collection(CollectionKind::Collection));
    map
});

/// Structural decomposition of a well-known wrapper request.
#[derive(Debug, Clone, Copy)]
pub enum Shape<'a> {
    /// `Lazy<T>`
    Lazy(&'a TypeRef),
    /// `Func<T>`
    Func(&'a TypeRef),
    /// `Func<A.., T>`: a callable forwarding its arguments
    FuncWith {
        params: &'a [TypeRef],
        output: &'a TypeRef,
    },
    /// `Enumerable<T>`, `Array<T>`, `List<T>`, `Collection<T>`
    Collection(CollectionKind, &'a TypeRef),
}

/// A runtime type reference: a name plus generic arguments.
///
/// Two references are equal when their names and arguments are equal.
/// `TypeRef::param(i)` is the i-th generic parameter of an open generic.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeRef(Arc<TypeNode>);

#[derive(PartialEq, Eq, Hash)]
struct TypeNode {
    name: Cow<'static, str>,
    args: Vec<TypeRef>,
    param: Option<usize>,
}

impl TypeRef {
    /// Nominal reference to a Rust type (trait objects included).
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::named(std::any::type_name::<T>())
    }

    /// Nominal reference by name.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(Arc::new(TypeNode {
            name: name.into(),
            args: Vec::new(),
            param: None,
        }))
    }

    /// Generic reference `name<args..>`.
    pub fn generic(
        name: impl Into<Cow<'static, str>>,
        args: impl IntoIterator<Item = TypeRef>,
    ) -> Self {
        Self(Arc::new(TypeNode {
            name: name.into(),
            args: args.into_iter().collect(),
            param: None,
        }))
    }

    /// The generic parameter at `index`.
    pub fn param(index: usize) -> Self {
        Self(Arc::new(TypeNode {
            name: Cow::Owned(format!("${index}")),
            args: Vec::new(),
            param: Some(index),
        }))
    }

    pub fn lazy(inner: TypeRef) -> Self {
        Self::generic(LAZY, [inner])
    }

    pub fn func(output: TypeRef) -> Self {
        Self::generic(FUNC, [output])
    }

    /// `Func<params.., output>`
    pub fn func_with(params: impl IntoIterator<Item = TypeRef>, output: TypeRef) -> Self {
        let mut args: Vec<TypeRef> = params.into_iter().collect();
        args.push(output);
        Self::generic(FUNC, args)
    }

    pub fn enumerable(item: TypeRef) -> Self {
        Self::generic(ENUMERABLE, [item])
    }

    pub fn array(item: TypeRef) -> Self {
        Self::generic(ARRAY, [item])
    }

    pub fn list(item: TypeRef) -> Self {
        Self::generic(LIST, [item])
    }

    pub fn collection(item: TypeRef) -> Self {
        Self::generic(COLLECTION, [item])
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline]
    pub fn args(&self) -> &[TypeRef] {
        &self.0.args
    }

    #[inline]
    pub fn is_generic(&self) -> bool {
        !self.0.args.is_empty()
    }

    #[inline]
    pub fn as_param(&self) -> Option<usize> {
        self.0.param
    }

    /// True when a generic parameter appears anywhere in the reference.
    pub fn is_open(&self) -> bool {
        self.0.param.is_some() || self.0.args.iter().any(TypeRef::is_open)
    }

    /// The open definition of a generic reference: `IRepo<User>` -> `IRepo<$0>`.
    pub fn definition(&self) -> TypeRef {
        if !self.is_generic() {
            return self.clone();
        }
        Self::generic(self.0.name.clone(), (0..self.0.args.len()).map(TypeRef::param))
    }

    /// Unify an open pattern against a closed reference.
    ///
    /// Returns the parameter bindings indexed by parameter number, or `None`
    /// when the shapes differ or a parameter would be bound twice to
    /// different types.
    pub fn bind(&self, closed: &TypeRef) -> Option<Vec<TypeRef>> {
        let mut bindings: Vec<Option<TypeRef>> = Vec::new();
        if !Self::unify(self, closed, &mut bindings) {
            return None;
        }
        bindings.into_iter().collect()
    }

    fn unify(pattern: &TypeRef, closed: &TypeRef, bindings: &mut Vec<Option<TypeRef>>) -> bool {
        if let Some(index) = pattern.0.param {
            if bindings.len() <= index {
                bindings.resize(index + 1, None);
            }
            return match &bindings[index] {
                Some(bound) => bound == closed,
                None => {
                    bindings[index] = Some(closed.clone());
                    true
                }
            };
        }
        pattern.0.name == closed.0.name
            && pattern.0.args.len() == closed.0.args.len()
            && pattern
                .0
                .args
                .iter()
                .zip(closed.0.args.iter())
                .all(|(p, c)| Self::unify(p, c, bindings))
    }

    /// Replace generic parameters with the given bindings.
    pub fn substitute(&self, bindings: &[TypeRef]) -> TypeRef {
        if let Some(index) = self.0.param {
            return bindings.get(index).cloned().unwrap_or_else(|| self.clone());
        }
        if !self.is_open() {
            return self.clone();
        }
        Self::generic(
            self.0.name.clone(),
            self.0.args.iter().map(|arg| arg.substitute(bindings)),
        )
    }

    /// Classify a well-known wrapper request.
    pub fn shape(&self) -> Option<Shape<'_>> {
        let args = &self.0.args;
        match WRAPPERS.get(self.name())? {
            WrapperKind::Lazy if args.len() == 1 => Some(Shape::Lazy(&args[0])),
            WrapperKind::Func if args.len() == 1 => Some(Shape::Func(&args[0])),
            WrapperKind::Func if args.len() > 1 => {
                let (output, params) = args.split_last()?;
                Some(Shape::FuncWith { params, output })
            }
            WrapperKind::Collection(kind) if args.len() == 1 => {
                Some(Shape::Collection(*kind, &args[0]))
            }
            _ => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)?;
        if let Some((first, rest)) = self.0.args.split_first() {
            write!(f, "<{first}")?;
            for arg in rest {
                write!(f, ", {arg}")?;
            }
            f.write_str(">")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({self})")
    }
}

/// Composite cache key: service type plus service name (empty = default).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub service_type: TypeRef,
    pub service_name: String,
}

impl ServiceKey {
    #[inline]
    pub fn new(service_type: TypeRef, service_name: impl Into<String>) -> Self {
        Self {
            service_type,
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.service_name.is_empty() {
            write!(f, "{}", self.service_type)
        } else {
            write!(f, "{} ({})", self.service_type, self.service_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Repo {}
    struct User;

    #[test]
    fn test_nominal_references() {
        assert_eq!(TypeRef::of::<User>(), TypeRef::of::<User>());
        assert_ne!(TypeRef::of::<User>(), TypeRef::of::<dyn Repo>());
        assert!(TypeRef::of::<dyn Repo>().name().contains("Repo"));
    }

    #[test]
    fn test_bind_and_substitute() {
        let open = TypeRef::generic("IMap", [TypeRef::param(0), TypeRef::param(1)]);
        let closed = TypeRef::generic("IMap", [TypeRef::named("K"), TypeRef::named("V")]);

        let bindings = open.bind(&closed).unwrap();
        assert_eq!(bindings, vec![TypeRef::named("K"), TypeRef::named("V")]);

        let implementing = TypeRef::generic("Map", [TypeRef::param(1), TypeRef::param(0)]);
        assert_eq!(
            implementing.substitute(&bindings).to_string(),
            "Map<V, K>"
        );
    }

    #[test]
    fn test_bind_rejects_conflicting_parameters() {
        let open = TypeRef::generic("Pair", [TypeRef::param(0), TypeRef::param(0)]);
        let closed = TypeRef::generic("Pair", [TypeRef::named("A"), TypeRef::named("B")]);
        assert!(open.bind(&closed).is_none());

        let other = TypeRef::generic("Other", [TypeRef::named("A"), TypeRef::named("A")]);
        assert!(open.bind(&other).is_none());
    }

    #[test]
    fn test_definition() {
        let closed = TypeRef::generic("IRepo", [TypeRef::named("User")]);
        let definition = closed.definition();
        assert!(definition.is_open());
        assert!(!closed.is_open());
        assert_eq!(definition.to_string(), "IRepo<$0>");
    }

    #[test]
    fn test_shapes() {
        let inner = TypeRef::named("ILogger");
        assert!(matches!(
            TypeRef::lazy(inner.clone()).shape(),
            Some(Shape::Lazy(t)) if *t == inner
        ));
        assert!(matches!(TypeRef::func(inner.clone()).shape(), Some(Shape::Func(_))));
        match TypeRef::func_with([TypeRef::named("String")], inner.clone()).shape() {
            Some(Shape::FuncWith { params, output }) => {
                assert_eq!(params.len(), 1);
                assert_eq!(*output, inner);
            }
            other => panic!("unexpected shape {other:?}"),
        }
        assert!(matches!(
            TypeRef::list(inner.clone()).shape(),
            Some(Shape::Collection(CollectionKind::List, _))
        ));
        assert!(inner.shape().is_none());
    }
}
