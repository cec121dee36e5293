//! Loop variables and arity-checked indexing.
//!
//! [`VarIndex`] and [`ExprIndex`] certify, at compile time, the dimension
//! count an index value names: a single variable certifies one, a pair two,
//! and so on. `define`, `update`, and `at` bound their index argument by the
//! handle's dimension count, so an off-by-arity index is rejected by the
//! compiler before any foreign call is made.

use std::ptr::NonNull;
use std::rc::Rc;

use ravel_sys as sys;
use smallvec::{SmallVec, smallvec};

use crate::expr::Expr;
use crate::{RavelError, Result, c_name};

struct NativeVar {
    ptr: NonNull<sys::ravel_var_t>,
}

impl Drop for NativeVar {
    fn drop(&mut self) {
        unsafe { sys::ravel_free_var(self.ptr.as_ptr()) }
    }
}

/// A named loop variable, shared by reference counting.
#[derive(Clone)]
pub struct Var {
    inner: Rc<NativeVar>,
    name: String,
}

impl Var {
    pub fn new(name: &str) -> Result<Self> {
        let cname = c_name(name)?;
        let raw = unsafe { sys::ravel_var_new(cname.as_ptr()) };
        let ptr = NonNull::new(raw).ok_or(RavelError::NullPtr("ravel_var_new"))?;
        Ok(Self {
            inner: Rc::new(NativeVar { ptr }),
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn raw(&self) -> *mut sys::ravel_var_t {
        self.inner.ptr.as_ptr()
    }
}

impl std::fmt::Debug for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Var").field(&self.name).finish()
    }
}

/// An index value naming exactly `N` pure axes, as loop variables.
///
/// Used on the left-hand side of `define` and `update`.
pub trait VarIndex<const N: usize> {
    fn raw_vars(&self) -> SmallVec<[*mut sys::ravel_var_t; 4]>;
}

impl VarIndex<1> for &Var {
    fn raw_vars(&self) -> SmallVec<[*mut sys::ravel_var_t; 4]> {
        smallvec![self.raw()]
    }
}

impl VarIndex<2> for (&Var, &Var) {
    fn raw_vars(&self) -> SmallVec<[*mut sys::ravel_var_t; 4]> {
        smallvec![self.0.raw(), self.1.raw()]
    }
}

impl VarIndex<3> for (&Var, &Var, &Var) {
    fn raw_vars(&self) -> SmallVec<[*mut sys::ravel_var_t; 4]> {
        smallvec![self.0.raw(), self.1.raw(), self.2.raw()]
    }
}

impl VarIndex<4> for (&Var, &Var, &Var, &Var) {
    fn raw_vars(&self) -> SmallVec<[*mut sys::ravel_var_t; 4]> {
        smallvec![self.0.raw(), self.1.raw(), self.2.raw(), self.3.raw()]
    }
}

/// An index value certifying `N` call-site coordinates, as expressions.
///
/// Used by `at`: anything convertible to an expression indexes one axis,
/// tuples index two through four.
pub trait ExprIndex<const N: usize> {
    fn into_exprs(self) -> SmallVec<[Expr; 4]>;
}

impl<E: Into<Expr>> ExprIndex<1> for E {
    fn into_exprs(self) -> SmallVec<[Expr; 4]> {
        smallvec![self.into()]
    }
}

impl<A: Into<Expr>, B: Into<Expr>> ExprIndex<2> for (A, B) {
    fn into_exprs(self) -> SmallVec<[Expr; 4]> {
        smallvec![self.0.into(), self.1.into()]
    }
}

impl<A: Into<Expr>, B: Into<Expr>, C: Into<Expr>> ExprIndex<3> for (A, B, C) {
    fn into_exprs(self) -> SmallVec<[Expr; 4]> {
        smallvec![self.0.into(), self.1.into(), self.2.into()]
    }
}

impl<A: Into<Expr>, B: Into<Expr>, C: Into<Expr>, D: Into<Expr>> ExprIndex<4> for (A, B, C, D) {
    fn into_exprs(self) -> SmallVec<[Expr; 4]> {
        smallvec![self.0.into(), self.1.into(), self.2.into(), self.3.into()]
    }
}
