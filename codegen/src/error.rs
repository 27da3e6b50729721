//! Result and error types for the code generator.

use thiserror::Error;

/// A fatal condition encountered while compiling a function.
///
/// The engine is correct by construction for well-formed adaptor input;
/// these errors indicate a pathological input (resource exhaustion) or an
/// engine bug, never a recoverable state. Adaptor contract violations are
/// debug assertions instead.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// No register could be allocated in the requested bank.
    #[error("unable to allocate a register in bank {0}")]
    RegisterExhausted(u8),
    /// The stack frame outgrew what the target's addressing forms reach.
    #[error("stack frame of {0} bytes exceeds the addressable range")]
    FrameTooLarge(u32),
    /// The text section outgrew the architecture's branch span.
    #[error("text section exceeds the addressable span of the target")]
    TextTooLarge,
    /// A constant or operation the back-end cannot express.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Object-file serialization failed.
    #[error("object emission failed: {0}")]
    Object(String),
}

/// Shorthand result type of compilation operations.
pub type CodegenResult<T> = Result<T, CodegenError>;
