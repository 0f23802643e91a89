//! Error types and result definitions for the Garnet runtime.
//!
//! The error hierarchy mirrors the executed language's exception classes:
//! every variant corresponds to an exception class the user program could
//! rescue, plus an internal kind for conditions that indicate a bug in the
//! machine itself.

use thiserror::Error;

/// The unified result type used throughout Garnet.
pub type GarnetResult<T> = Result<T, GarnetError>;

/// Runtime error covering every exception the instruction set can raise.
#[derive(Error, Debug, Clone)]
pub enum GarnetError {
    /// Name lookup failure (constants, globals).
    #[error("NameError: {message}")]
    Name {
        /// Error description.
        message: String,
    },

    /// Method lookup failure.
    #[error("NoMethodError: undefined method '{method}' for {receiver}")]
    NoMethod {
        /// The missing selector.
        method: String,
        /// Description of the receiver.
        receiver: String,
    },

    /// Dynamic type mismatch.
    #[error("TypeError: {message}")]
    Type {
        /// Error description.
        message: String,
    },

    /// Wrong arguments to a call.
    #[error("ArgumentError: {message}")]
    Argument {
        /// Error description.
        message: String,
    },

    /// Integer division by zero.
    #[error("ZeroDivisionError: divided by 0")]
    ZeroDivision,

    /// Mutation of a frozen object.
    #[error("FrozenError: can't modify frozen {type_name}")]
    Frozen {
        /// Type of the frozen receiver.
        type_name: String,
    },

    /// Invalid non-local jump (break/return outside a handler).
    #[error("LocalJumpError: {message}")]
    LocalJump {
        /// Error description.
        message: String,
    },

    /// Exception raised by user code.
    #[error("RuntimeError: {message}")]
    Runtime {
        /// Error description.
        message: String,
    },

    /// Malformed regular expression literal.
    #[error("RegexpError: {message}")]
    Regexp {
        /// Error description.
        message: String,
    },

    /// A semantic that is intentionally absent from this build.
    #[error("NotImplementedError: {message}")]
    NotImplemented {
        /// Error description.
        message: String,
    },

    /// Internal machine error (should never occur in correct bytecode).
    #[error("InternalError: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl GarnetError {
    /// Create a name error.
    #[must_use]
    pub fn name(message: impl Into<String>) -> Self {
        Self::Name {
            message: message.into(),
        }
    }

    /// Create a name error for an uninitialized constant.
    #[must_use]
    pub fn uninitialized_constant(name: &str) -> Self {
        Self::Name {
            message: format!("uninitialized constant {name}"),
        }
    }

    /// Create a no-method error.
    #[must_use]
    pub fn no_method(method: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self::NoMethod {
            method: method.into(),
            receiver: receiver.into(),
        }
    }

    /// Create a type error.
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create an argument error.
    #[must_use]
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    /// Create an arity mismatch error.
    #[must_use]
    pub fn arity(given: usize, expected: usize) -> Self {
        Self::Argument {
            message: format!("wrong number of arguments (given {given}, expected {expected})"),
        }
    }

    /// Create a frozen-object error.
    #[must_use]
    pub fn frozen(type_name: impl Into<String>) -> Self {
        Self::Frozen {
            type_name: type_name.into(),
        }
    }

    /// Create a local-jump error.
    #[must_use]
    pub fn local_jump(message: impl Into<String>) -> Self {
        Self::LocalJump {
            message: message.into(),
        }
    }

    /// Create a runtime error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a regexp error.
    #[must_use]
    pub fn regexp(message: impl Into<String>) -> Self {
        Self::Regexp {
            message: message.into(),
        }
    }

    /// Create a not-implemented error.
    #[must_use]
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the exception class name this error surfaces as.
    #[must_use]
    pub fn exception_class(&self) -> &'static str {
        match self {
            Self::Name { .. } => "NameError",
            Self::NoMethod { .. } => "NoMethodError",
            Self::Type { .. } => "TypeError",
            Self::Argument { .. } => "ArgumentError",
            Self::ZeroDivision => "ZeroDivisionError",
            Self::Frozen { .. } => "FrozenError",
            Self::LocalJump { .. } => "LocalJumpError",
            Self::Runtime { .. } => "RuntimeError",
            Self::Regexp { .. } => "RegexpError",
            Self::NotImplemented { .. } => "NotImplementedError",
            Self::Internal { .. } => "InternalError",
        }
    }
}
