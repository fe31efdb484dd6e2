//! Error types for the tiered execution engine

use std::fmt;
use thiserror::Error;

use crate::runtime::Value;

/// A single frame in a script stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name (or `"<anonymous>"` for anonymous functions)
    pub function_name: String,
    /// Bytecode offset of the active instruction
    pub pc: u32,
    /// Whether this is a native function
    pub is_native: bool,
}

impl StackFrame {
    /// Create a new stack frame
    pub fn new(function_name: impl Into<String>, pc: u32) -> Self {
        Self {
            function_name: function_name.into(),
            pc,
            is_native: false,
        }
    }

    /// Create a stack frame for a native function
    pub fn native(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            pc: 0,
            is_native: true,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_native {
            write!(f, "    at {} (native)", self.function_name)
        } else {
            write!(f, "    at {} (pc {})", self.function_name, self.pc)
        }
    }
}

/// A script stack trace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// Stack frames from innermost to outermost
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Create an empty stack trace
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Add a frame to the stack trace
    pub fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    /// Check if the stack trace is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Render as the `.stack` property of an error object
    pub fn render(&self, header: &str) -> String {
        let mut out = String::from(header);
        for frame in &self.frames {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{}", frame)?;
        }
        Ok(())
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Runtime error raised by the engine - TypeError, ReferenceError, etc.
    #[error("{kind}: {message}{}", if stack_trace.is_empty() { String::new() } else { format!("\n{}", stack_trace) })]
    RuntimeError {
        kind: ErrorKind,
        message: String,
        stack_trace: StackTrace,
    },

    /// A value thrown by script code with `throw`
    #[error("Uncaught {message}{}", if stack_trace.is_empty() { String::new() } else { format!("\n{}", stack_trace) })]
    Exception {
        value: Value,
        message: String,
        stack_trace: StackTrace,
    },

    /// Malformed bytecode rejected by the verifier
    #[error("VerifyError: {function}: {message}")]
    VerifyError { function: String, message: String },

    /// Optimizing compiler bailout
    #[error("CompileError: {0}")]
    CompileError(String),

    /// Invalid engine configuration
    #[error("ConfigError: {0}")]
    ConfigError(String),

    /// Internal engine error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Script error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// ReferenceError - undefined variable
    ReferenceError,
    /// RangeError - value out of range, including stack exhaustion
    RangeError,
    /// Generic Error - user-constructed Error objects
    GenericError,
}

impl ErrorKind {
    /// Name of the constructor producing this kind
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::GenericError => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Error {
    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::runtime_error(ErrorKind::TypeError, message)
    }

    /// Create a ReferenceError
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::runtime_error(ErrorKind::ReferenceError, message)
    }

    /// Create a RangeError
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::runtime_error(ErrorKind::RangeError, message)
    }

    /// Create a runtime error without a stack trace; the VM fills it in at the throw point
    pub fn runtime_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind,
            message: message.into(),
            stack_trace: StackTrace::new(),
        }
    }

    /// Stack exhaustion, counted on logical frames
    pub fn stack_overflow() -> Self {
        Self::range_error(messages::MAXIMUM_CALL_STACK)
    }

    /// Create a verifier error
    pub fn verify_error(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::VerifyError {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Whether script code can observe this error with `catch`
    pub fn is_catchable(&self) -> bool {
        matches!(self, Error::RuntimeError { .. } | Error::Exception { .. })
    }

    /// The stack trace attached to a catchable error
    pub fn stack_trace(&self) -> Option<&StackTrace> {
        match self {
            Error::RuntimeError { stack_trace, .. } | Error::Exception { stack_trace, .. } => {
                Some(stack_trace)
            }
            _ => None,
        }
    }

    /// Add stack trace to an error that does not carry one yet
    pub fn with_stack_trace(self, trace: StackTrace) -> Self {
        match self {
            Error::RuntimeError {
                kind,
                message,
                stack_trace,
            } if stack_trace.is_empty() => Error::RuntimeError {
                kind,
                message,
                stack_trace: trace,
            },
            Error::Exception {
                value,
                message,
                stack_trace,
            } if stack_trace.is_empty() => Error::Exception {
                value,
                message,
                stack_trace: trace,
            },
            other => other,
        }
    }

    /// The message part of the error, without kind prefix or stack
    pub fn message(&self) -> String {
        match self {
            Error::RuntimeError { kind, message, .. } => format!("{}: {}", kind, message),
            Error::Exception { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

/// Standardized error message templates
pub mod messages {
    pub const NOT_A_FUNCTION: &str = "is not a function";
    pub const NOT_A_CONSTRUCTOR: &str = "is not a constructor";
    pub const NOT_AN_OBJECT: &str = "is not an object";
    pub const CANNOT_READ_PROPERTY: &str = "Cannot read properties of";
    pub const CANNOT_SET_PROPERTY: &str = "Cannot set properties of";
    pub const IS_NOT_DEFINED: &str = "is not defined";
    pub const MAXIMUM_CALL_STACK: &str = "Maximum call stack size exceeded";

    /// Format a "X is not a function" error message
    pub fn not_a_function(name: &str) -> String {
        format!("{} {}", name, NOT_A_FUNCTION)
    }

    /// Format a "X is not a constructor" error message
    pub fn not_a_constructor(name: &str) -> String {
        format!("{} {}", name, NOT_A_CONSTRUCTOR)
    }

    /// Format a "Cannot read properties of undefined (reading 'x')" error message
    pub fn cannot_read_property(prop: &str, of: &str) -> String {
        format!("{} {} (reading '{}')", CANNOT_READ_PROPERTY, of, prop)
    }

    /// Format a "Cannot set properties of undefined (setting 'x')" error message
    pub fn cannot_set_property(prop: &str, of: &str) -> String {
        format!("{} {} (setting '{}')", CANNOT_SET_PROPERTY, of, prop)
    }

    /// Format a "X is not defined" error message
    pub fn not_defined(name: &str) -> String {
        format!("{} {}", name, IS_NOT_DEFINED)
    }

    /// Format the read-only assignment message
    pub fn read_only(prop: &str) -> String {
        format!("Cannot assign to read only property '{}' of object", prop)
    }

    /// Format the non-extensible addition message
    pub fn not_extensible(prop: &str) -> String {
        format!("Cannot add property {}, object is not extensible", prop)
    }

    /// Format the non-configurable delete message
    pub fn cannot_delete(prop: &str) -> String {
        format!("Cannot delete property '{}' of object", prop)
    }

    /// Format the redefinition message
    pub fn cannot_redefine(prop: &str) -> String {
        format!("Cannot redefine property: {}", prop)
    }
}
