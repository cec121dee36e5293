//! Deferred computation handles.
//!
//! A [`Func`] is either a fully defined native computation node or a buffer
//! parameter that has not been materialized yet. Parameters are promoted
//! lazily: the first operation that needs the native object creates it (with
//! the stored name, if any) and memoizes the shared handle; every later use
//! reuses it. The handle itself never changes state — realizing a parameter
//! derives a fresh wrapper node on the native side instead.
//!
//! Handles are `Rc`-based and single-threaded by design; the memo cell is a
//! plain `OnceCell` with no synchronization.

use std::cell::{OnceCell, RefCell};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;

use ravel_sys as sys;
use smallvec::SmallVec;
use tracing::debug;

use crate::buffer::{AsBuffer, BufferView};
use crate::expr::Expr;
use crate::index::{ExprIndex, VarIndex};
use crate::types::HostScalar;
use crate::{RavelError, Result, c_name, native_error};

struct NativeFunc {
    ptr: NonNull<sys::ravel_func_t>,
}

impl Drop for NativeFunc {
    fn drop(&mut self) {
        unsafe { sys::ravel_free_func(self.ptr.as_ptr()) }
    }
}

struct NativeParam {
    ptr: NonNull<sys::ravel_param_t>,
}

impl Drop for NativeParam {
    fn drop(&mut self) {
        unsafe { sys::ravel_free_param(self.ptr.as_ptr()) }
    }
}

/// Name slot plus memoized native object of an unmaterialized parameter.
struct ParamCell {
    name: RefCell<Option<String>>,
    memo: OnceCell<Rc<NativeParam>>,
}

enum State {
    Defined(Rc<NativeFunc>),
    Param(ParamCell),
}

/// A deferred, array-valued computation over `N` axes of `T` elements.
///
/// Cloning shares the underlying state: a clone of a parameter handle sees
/// (and contributes to) the same memoized native object.
pub struct Func<T: HostScalar, const N: usize> {
    state: Rc<State>,
    _elem: PhantomData<T>,
}

impl<T: HostScalar, const N: usize> Clone for Func<T, N> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            _elem: PhantomData,
        }
    }
}

impl<T: HostScalar, const N: usize> std::fmt::Debug for Func<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Func");
        d.field("elem", &T::ELEM_TYPE.to_string()).field("ndim", &N);
        match &*self.state {
            State::Defined(_) => d.field("state", &"defined"),
            State::Param(cell) => d.field("state", &"param").field("name", &cell.name.borrow()),
        };
        d.finish_non_exhaustive()
    }
}

impl<T: HostScalar, const N: usize> Func<T, N> {
    // ── Construction ────────────────────────────────────────────────────

    /// A new, unnamed buffer-parameter placeholder.
    pub fn param() -> Self {
        Self {
            state: Rc::new(State::Param(ParamCell {
                name: RefCell::new(None),
                memo: OnceCell::new(),
            })),
            _elem: PhantomData,
        }
    }

    /// A buffer-parameter placeholder with a name.
    pub fn param_named(name: &str) -> Result<Self> {
        let f = Self::param();
        f.set_name(name)?;
        Ok(f)
    }

    /// Define a new computation node `name(index) = body`.
    ///
    /// Fails with [`RavelError::TypeMismatch`] if the body's element type
    /// disagrees with `T`.
    pub fn define(name: &str, index: impl VarIndex<N>, body: Expr) -> Result<Self> {
        let got = body.elem_type();
        if got != T::ELEM_TYPE {
            return Err(RavelError::TypeMismatch {
                expected: T::ELEM_TYPE,
                got,
            });
        }
        let cname = c_name(name)?;
        let vars = index.raw_vars();
        let raw = unsafe {
            sys::ravel_func_define(cname.as_ptr(), vars.as_ptr(), vars.len(), body.raw())
        };
        let ptr = NonNull::new(raw).ok_or_else(native_error)?;
        debug!(func = name, ndim = N, "defined computation node");
        Ok(Self {
            state: Rc::new(State::Defined(Rc::new(NativeFunc { ptr }))),
            _elem: PhantomData,
        })
    }

    // ── Naming ──────────────────────────────────────────────────────────

    /// Name a parameter before its first use.
    ///
    /// Legal exactly once, and only while the parameter is unmaterialized;
    /// any other handle state fails with [`RavelError::Rebinding`].
    pub fn set_name(&self, name: &str) -> Result<()> {
        let State::Param(cell) = &*self.state else {
            return Err(RavelError::Rebinding("cannot rename a defined computation"));
        };
        if cell.memo.get().is_some() {
            return Err(RavelError::Rebinding("parameter already materialized"));
        }
        c_name(name)?;
        let mut slot = cell.name.borrow_mut();
        if slot.is_some() {
            return Err(RavelError::Rebinding("parameter already named"));
        }
        *slot = Some(name.to_owned());
        Ok(())
    }

    // ── Materialization ─────────────────────────────────────────────────

    /// Get-or-create the native parameter object. Idempotent: the first
    /// call constructs and memoizes, later calls return the same handle.
    fn materialized_param(&self) -> Result<Rc<NativeParam>> {
        let State::Param(cell) = &*self.state else {
            return Err(RavelError::InvalidHandleUse(
                "defined computation has no buffer parameter",
            ));
        };
        if let Some(p) = cell.memo.get() {
            return Ok(Rc::clone(p));
        }
        let name = cell.name.borrow().clone();
        let cname = name.as_deref().map(c_name).transpose()?;
        let name_ptr = cname.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
        let raw = unsafe { sys::ravel_param_new(T::ELEM_TYPE.0, N as i32, name_ptr) };
        let ptr = NonNull::new(raw).ok_or(RavelError::NullPtr("ravel_param_new"))?;
        let param = Rc::new(NativeParam { ptr });
        let _ = cell.memo.set(Rc::clone(&param));
        debug!(
            name = name.as_deref().unwrap_or("<anonymous>"),
            ndim = N,
            "materialized buffer parameter"
        );
        Ok(param)
    }

    /// Whether this handle is still an unmaterialized parameter.
    pub fn is_pending_param(&self) -> bool {
        matches!(&*self.state, State::Param(cell) if cell.memo.get().is_none())
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Build the expression `self(index)`.
    ///
    /// Materializes a parameter on first use; never mutates a defined node.
    pub fn at(&self, index: impl ExprIndex<N>) -> Result<Expr> {
        let args = index.into_exprs();
        let raws: SmallVec<[*mut sys::ravel_expr_t; 4]> = args.iter().map(Expr::raw).collect();
        let raw = match &*self.state {
            State::Defined(f) => unsafe {
                sys::ravel_func_ref(f.ptr.as_ptr(), raws.as_ptr(), raws.len())
            },
            State::Param(_) => {
                let p = self.materialized_param()?;
                unsafe { sys::ravel_param_ref(p.ptr.as_ptr(), raws.as_ptr(), raws.len()) }
            }
        };
        Expr::wrap(raw).ok_or_else(native_error)
    }

    /// Append the update rule `self(index) = body` to a defined node.
    ///
    /// Mutates the referenced native object in place.
    pub fn update(&self, index: impl VarIndex<N>, body: Expr) -> Result<()> {
        let State::Defined(f) = &*self.state else {
            return Err(RavelError::InvalidHandleUse(
                "update requires a defined computation node",
            ));
        };
        let got = body.elem_type();
        if got != T::ELEM_TYPE {
            return Err(RavelError::TypeMismatch {
                expected: T::ELEM_TYPE,
                got,
            });
        }
        let vars = index.raw_vars();
        let rc = unsafe {
            sys::ravel_func_update(f.ptr.as_ptr(), vars.as_ptr(), vars.len(), body.raw())
        };
        if rc != 0 {
            return Err(native_error());
        }
        Ok(())
    }

    /// Bind a one-axis input container to this parameter.
    ///
    /// The runtime snapshots the data during the scoped borrow; the
    /// container is free to change afterwards.
    pub fn bind<B>(&self, data: &B) -> Result<()>
    where
        B: AsBuffer<Elem = T> + ?Sized,
    {
        if B::DIMS != N {
            return Err(RavelError::DimensionArity {
                expected: N,
                got: B::DIMS,
            });
        }
        let p = self.materialized_param()?;
        let rc = data.with_buffer(|raw| unsafe { sys::ravel_param_bind(p.ptr.as_ptr(), raw) })?;
        if rc != 0 {
            return Err(native_error());
        }
        debug!(ndim = N, "bound input buffer to parameter");
        Ok(())
    }

    /// Evaluate over the dense `[0, extent)` domain of each axis and return
    /// the filled host buffer.
    ///
    /// All-or-nothing: a native failure (free variables, unbound parameters)
    /// surfaces as [`RavelError::NativeEvaluation`] and nothing is returned.
    pub fn realize(&self, extents: [i64; N]) -> Result<Vec<T>> {
        let func = match &*self.state {
            State::Defined(f) => Rc::clone(f),
            // A parameter is never promoted: realize it through a freshly
            // derived wrapper node, leaving the handle untouched.
            State::Param(_) => {
                let p = self.materialized_param()?;
                let raw = unsafe { sys::ravel_param_func(p.ptr.as_ptr()) };
                let ptr = NonNull::new(raw).ok_or(RavelError::NullPtr("ravel_param_func"))?;
                Rc::new(NativeFunc { ptr })
            }
        };

        let mut numel: i64 = 1;
        for &e in &extents {
            if e < 0 {
                return Err(RavelError::InvalidArgument(format!(
                    "negative realization extent {e}"
                )));
            }
            numel = numel
                .checked_mul(e)
                .ok_or(RavelError::IntegerOverflow(e))?;
        }

        let mut out = vec![T::default(); numel as usize];
        let mut view = BufferView::<'_, T, N>::new_mut(&mut out, &extents)?;
        let status = view.with_raw(|raw| unsafe { sys::ravel_func_realize(func.ptr.as_ptr(), raw) });
        if status != 0 {
            return Err(native_error());
        }
        debug!(elements = numel, ndim = N, "realized computation");
        Ok(out)
    }
}
