//! Thin wrappers over the runtime's expression algebra.
//!
//! The algebra itself lives on the native side; `Expr` only carries a shared
//! handle and the dynamic element-type tag the runtime computed for it. Just
//! enough surface is exposed to write definition bodies: literals, variable
//! references, and `+`/`-`/`*`.

use std::ptr::NonNull;
use std::rc::Rc;

use ravel_sys as sys;

use crate::index::Var;
use crate::types::ElemType;

struct NativeExpr {
    ptr: NonNull<sys::ravel_expr_t>,
}

impl Drop for NativeExpr {
    fn drop(&mut self) {
        unsafe { sys::ravel_free_expr(self.ptr.as_ptr()) }
    }
}

/// A shared handle to a native expression node.
#[derive(Clone)]
pub struct Expr {
    inner: Rc<NativeExpr>,
}

impl Expr {
    /// Take ownership of a raw expression handle, or `None` if it is null.
    pub(crate) fn wrap(raw: *mut sys::ravel_expr_t) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self {
            inner: Rc::new(NativeExpr { ptr }),
        })
    }

    /// Infallible constructors only: literals and pure arithmetic cannot
    /// fail in the runtime.
    fn wrap_new(raw: *mut sys::ravel_expr_t, what: &'static str) -> Self {
        match Self::wrap(raw) {
            Some(e) => e,
            None => panic!("{what} returned null"),
        }
    }

    pub(crate) fn raw(&self) -> *mut sys::ravel_expr_t {
        self.inner.ptr.as_ptr()
    }

    /// Element type the runtime assigns to this expression.
    pub fn elem_type(&self) -> ElemType {
        ElemType(unsafe { sys::ravel_expr_type(self.raw()) })
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expr")
            .field("type", &self.elem_type().to_string())
            .finish_non_exhaustive()
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Self::wrap_new(unsafe { sys::ravel_expr_int(v) }, "ravel_expr_int")
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Self::wrap_new(unsafe { sys::ravel_expr_float(v) }, "ravel_expr_float")
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        Self::wrap_new(unsafe { sys::ravel_var_expr(v.raw()) }, "ravel_var_expr")
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Self::from(&v)
    }
}

macro_rules! expr_binop {
    ($trait:ident, $method:ident, $ffi:ident) => {
        impl<Rhs: Into<Expr>> std::ops::$trait<Rhs> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Rhs) -> Expr {
                let rhs = rhs.into();
                Expr::wrap_new(
                    unsafe { sys::$ffi(self.raw(), rhs.raw()) },
                    stringify!($ffi),
                )
            }
        }

        impl<Rhs: Into<Expr>> std::ops::$trait<Rhs> for &Var {
            type Output = Expr;
            fn $method(self, rhs: Rhs) -> Expr {
                std::ops::$trait::$method(Expr::from(self), rhs)
            }
        }
    };
}

expr_binop!(Add, add, ravel_expr_add);
expr_binop!(Sub, sub, ravel_expr_sub);
expr_binop!(Mul, mul, ravel_expr_mul);
