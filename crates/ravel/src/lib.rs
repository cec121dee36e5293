//! Safe, typed marshaling layer for the Ravel array-compiler runtime.
//!
//! `ravel` describes multi-dimensional array buffers and lazily evaluated
//! computation handles, and hands them across the FFI boundary using the
//! exact binary descriptors defined in `ravel-sys`.
//!
//! The two central pieces:
//!
//! - [`BufferView`]: a non-owning, lifetime-scoped view over host memory that
//!   produces the runtime's fixed-layout buffer descriptor on demand, valid
//!   only within a scoped callback.
//! - [`Func`]: a deferred computation handle that is either a defined native
//!   node or a lazily materialized, memoized buffer parameter.
//!
//! Handles are reference counted but deliberately single-threaded (`Rc`,
//! `OnceCell`); sharing across threads is a compile error, not a data race.

pub mod buffer;
pub mod expr;
pub mod func;
pub mod index;
pub mod types;

pub use buffer::{AsBuffer, AsBufferMut, BufferView};
pub use expr::Expr;
pub use func::Func;
pub use index::{ExprIndex, Var, VarIndex};
pub use types::{ElemType, HostScalar};

pub type Result<T> = std::result::Result<T, RavelError>;

#[derive(thiserror::Error, Debug)]
pub enum RavelError {
    #[error("dimension arity mismatch: shape has {got} axes, buffer type has {expected}")]
    DimensionArity { expected: usize, got: usize },

    #[error("value {0} does not fit in 32 bits")]
    IntegerOverflow(i64),

    #[error("handle already finalized: {0}")]
    Rebinding(&'static str),

    #[error("invalid handle use: {0}")]
    InvalidHandleUse(&'static str),

    #[error("element type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: ElemType, got: ElemType },

    #[error("native evaluation failed: {0}")]
    NativeEvaluation(String),

    #[error("native runtime returned null pointer from {0}")]
    NullPtr(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Build a [`RavelError::NativeEvaluation`] from the runtime's last-error
/// message on this thread.
pub(crate) fn native_error() -> RavelError {
    let msg = unsafe {
        let p = ravel_sys::ravel_last_error();
        if p.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    };
    if msg.is_empty() {
        RavelError::NativeEvaluation("unknown native failure".into())
    } else {
        RavelError::NativeEvaluation(msg)
    }
}

/// Marshal a name to C, rejecting interior NUL bytes.
pub(crate) fn c_name(name: &str) -> Result<std::ffi::CString> {
    std::ffi::CString::new(name).map_err(|_| {
        RavelError::InvalidArgument(format!("name {name:?} contains an interior NUL byte"))
    })
}
