//! Error types for dependency resolution

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while registering, compiling or resolving services
#[derive(Error, Debug, Clone)]
pub enum DiError {
    /// No registration, fallback rule or structural decomposition applies
    #[error("Unable to resolve service {service} (name: {name:?})")]
    UnresolvableService { service: String, name: String },

    /// The implementing type exposes no public constructor
    #[error("No public constructor found for {type_name}")]
    MissingPublicConstructor { type_name: String },

    /// Every constructor has at least one parameter that cannot be resolved
    #[error("No resolvable constructor found for {type_name}")]
    NoResolvableConstructor { type_name: String },

    /// A service depends on itself, directly or through other services
    #[error("Recursive dependency detected while resolving {service} (name: {name:?}): {chain}")]
    RecursiveDependency {
        service: String,
        name: String,
        chain: String,
    },

    /// A scope-dependent lifetime executed outside of any scope
    #[error("Attempt to create a scoped instance of {service} without a current scope")]
    MissingScope { service: String },

    /// A required constructor parameter could not be bound
    #[error(
        "Unresolved dependency [Target type: {target}, Parameter: {parameter}, Requested dependency: {service} (name: {name:?})]"
    )]
    UnresolvedConstructorDependency {
        target: String,
        parameter: String,
        service: String,
        name: String,
    },

    /// Attempt to end a scope that still has an active child scope
    #[error("Attempt to end scope-{scope} before its child scope-{child} has ended")]
    InvalidScopeEnd { scope: u64, child: u64 },

    /// A decorator does not declare exactly one decoration target
    #[error("Invalid decorator {decorator} for {service}: {reason}")]
    InvalidDecorator {
        decorator: String,
        service: String,
        reason: String,
    },

    /// The metadata provider knows nothing about the implementing type
    #[error("No type metadata available for {type_name}")]
    MissingMetadata { type_name: String },

    /// A value did not have the type the caller or a constructor expected
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// A procedure read a runtime argument that was not supplied
    #[error("Missing runtime argument {index} ({supplied} supplied)")]
    MissingArgument { index: usize, supplied: usize },

    /// A resolution delegate was invoked with the wrong number of arguments
    #[error("Expected {expected} runtime arguments, {supplied} supplied")]
    ArityMismatch { expected: usize, supplied: usize },

    /// Factory or constructor failed to create the service
    #[error("Failed to create {type_name}: {reason}")]
    CreationFailed { type_name: String, reason: String },

    /// The container has been disposed
    #[error("Container has been disposed")]
    ContainerDisposed,

    /// Error raised by user code (constructor, factory or initializer)
    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

impl DiError {
    /// Create an UnresolvableService error
    #[inline]
    pub fn unresolvable(service: impl ToString, name: &str) -> Self {
        Self::UnresolvableService {
            service: service.to_string(),
            name: name.to_owned(),
        }
    }

    /// Create a CreationFailed error
    #[inline]
    pub fn creation_failed(type_name: impl ToString, reason: impl Into<String>) -> Self {
        Self::CreationFailed {
            type_name: type_name.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a TypeMismatch error
    #[inline]
    pub fn type_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Wrap an error raised by user code
    #[inline]
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(error))
    }

    /// True when the requested service itself could not be resolved
    #[inline]
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, Self::UnresolvableService { .. })
    }
}

/// Result type alias for DI operations
pub type Result<T> = std::result::Result<T, DiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_service() {
        let err = DiError::unresolvable("dyn IRepo", "");
        assert!(err.to_string().contains("dyn IRepo"));
        assert!(err.is_unresolvable());

        let err = DiError::UnresolvedConstructorDependency {
            target: "ConsoleRepo".into(),
            parameter: "logger".into(),
            service: "dyn ILogger".into(),
            name: String::new(),
        };
        let message = err.to_string();
        assert!(message.contains("ConsoleRepo"));
        assert!(message.contains("logger"));
        assert!(!err.is_unresolvable());
    }

    #[test]
    fn test_custom_is_transparent() {
        let io = std::io::Error::other("disk on fire");
        let err = DiError::custom(io);
        assert_eq!(err.to_string(), "disk on fire");
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), "disk on fire");
    }
}
