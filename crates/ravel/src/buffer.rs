//! Buffer views — non-owning descriptors over host memory.
//!
//! A [`BufferView`] pairs a borrowed host pointer with per-axis dimension
//! records and produces the runtime's fixed-layout `ravel_buffer_t` on
//! demand. The descriptor is built on the stack inside [`BufferView::with_raw`]
//! and cannot outlive the callback, so the borrow discipline is strictly
//! LIFO: nothing handed to the runtime survives the call that produced it.

use std::marker::PhantomData;

use ravel_sys as sys;

use crate::{HostScalar, RavelError, Result};

/// Row-major strides for a validated shape: the rightmost axis varies
/// fastest and always has stride 1.
fn row_major_strides<const N: usize>(shape: &[i32; N]) -> Result<[i32; N]> {
    let mut strides = [1i32; N];
    let mut acc = 1i64;
    for axis in (0..N).rev() {
        strides[axis] = narrow(acc)?;
        acc = acc
            .checked_mul(shape[axis] as i64)
            .ok_or(RavelError::IntegerOverflow(acc))?;
    }
    Ok(strides)
}

fn narrow(v: i64) -> Result<i32> {
    i32::try_from(v).map_err(|_| RavelError::IntegerOverflow(v))
}

/// A typed view over externally owned memory, presentable to the runtime as
/// a buffer descriptor.
///
/// The view never owns the memory it describes; the borrow of the backing
/// storage is what keeps `host` valid. `N` is the compile-time dimension
/// count, checked against every runtime-provided shape.
pub struct BufferView<'a, T: HostScalar, const N: usize> {
    host: *mut u8,
    dims: [sys::ravel_dimension_t; N],
    _borrow: PhantomData<&'a mut [T]>,
}

impl<'a, T: HostScalar, const N: usize> BufferView<'a, T, N> {
    /// Dense row-major view over a contiguous slice.
    pub fn new(data: &'a [T], shape: &[i64]) -> Result<Self> {
        let dims = Self::dense_dims(shape, data.len())?;
        Ok(Self {
            host: data.as_ptr() as *mut u8,
            dims,
            _borrow: PhantomData,
        })
    }

    /// Dense row-major view over a mutable contiguous slice.
    pub fn new_mut(data: &'a mut [T], shape: &[i64]) -> Result<Self> {
        let dims = Self::dense_dims(shape, data.len())?;
        Ok(Self {
            host: data.as_mut_ptr() as *mut u8,
            dims,
            _borrow: PhantomData,
        })
    }

    /// View over a raw pointer with explicit strides (in elements).
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for every element reachable through
    /// `shape`/`strides` for the lifetime `'a`, and must not be aliased
    /// mutably while the view exists.
    pub unsafe fn from_raw_parts(ptr: *mut T, shape: &[i64], strides: &[i64]) -> Result<Self> {
        if strides.len() != N {
            return Err(RavelError::DimensionArity {
                expected: N,
                got: strides.len(),
            });
        }
        let extents = Self::narrow_shape(shape)?;
        let mut dims = [sys::ravel_dimension_t::default(); N];
        for axis in 0..N {
            dims[axis] = sys::ravel_dimension_t {
                min: 0,
                extent: extents[axis],
                stride: narrow(strides[axis])?,
                flags: 0,
            };
        }
        Ok(Self {
            host: ptr as *mut u8,
            dims,
            _borrow: PhantomData,
        })
    }

    fn narrow_shape(shape: &[i64]) -> Result<[i32; N]> {
        if shape.len() != N {
            return Err(RavelError::DimensionArity {
                expected: N,
                got: shape.len(),
            });
        }
        let mut extents = [0i32; N];
        for (axis, &extent) in shape.iter().enumerate() {
            if extent < 0 {
                return Err(RavelError::InvalidArgument(format!(
                    "negative extent {extent} on axis {axis}"
                )));
            }
            extents[axis] = narrow(extent)?;
        }
        Ok(extents)
    }

    fn dense_dims(shape: &[i64], backing_len: usize) -> Result<[sys::ravel_dimension_t; N]> {
        let extents = Self::narrow_shape(shape)?;
        let strides = row_major_strides(&extents)?;
        let numel: usize = extents.iter().map(|&e| e as usize).product();
        if numel > backing_len {
            return Err(RavelError::InvalidArgument(format!(
                "shape requires {numel} elements but the backing slice holds {backing_len}"
            )));
        }
        let mut dims = [sys::ravel_dimension_t::default(); N];
        for axis in 0..N {
            dims[axis] = sys::ravel_dimension_t {
                min: 0,
                extent: extents[axis],
                stride: strides[axis],
                flags: 0,
            };
        }
        Ok(dims)
    }

    /// Hand a pointer to the 56-byte descriptor to `action`.
    ///
    /// The descriptor lives on this call's stack frame and points into
    /// `self`; it is valid only for the dynamic extent of `action`. Host-only
    /// mode: `device` is 0 and `device_interface`/`padding` are null.
    pub fn with_raw<R>(&mut self, action: impl FnOnce(*mut sys::ravel_buffer_t) -> R) -> R {
        let mut raw = sys::ravel_buffer_t {
            device: 0,
            device_interface: std::ptr::null_mut(),
            host: self.host,
            flags: 0,
            ty: T::ELEM_TYPE.0,
            dimensions: N as i32,
            dim: self.dims.as_mut_ptr(),
            padding: std::ptr::null_mut(),
        };
        action(&mut raw)
    }

    /// Extent of each axis.
    pub fn extents(&self) -> [i32; N] {
        self.dims.map(|d| d.extent)
    }

    /// Stride of each axis, in elements.
    pub fn strides(&self) -> [i32; N] {
        self.dims.map(|d| d.stride)
    }
}

impl<T: HostScalar, const N: usize> std::fmt::Debug for BufferView<'_, T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("elem", &T::ELEM_TYPE.to_string())
            .field("extents", &self.extents())
            .field("strides", &self.strides())
            .finish_non_exhaustive()
    }
}

// ── Buffer-capable containers ───────────────────────────────────────────

/// Capability of a container to present its backing storage as a one-axis
/// buffer descriptor for the duration of a callback.
///
/// The container must not be resized or reallocated while the borrow is
/// active; the runtime only reads through descriptors obtained here.
pub trait AsBuffer {
    type Elem: HostScalar;

    /// Dimension count presented to the runtime.
    const DIMS: usize;

    fn with_buffer<R>(&self, action: impl FnOnce(*mut sys::ravel_buffer_t) -> R) -> Result<R>;
}

/// Mutable variant: the runtime may write through the descriptor.
pub trait AsBufferMut: AsBuffer {
    fn with_buffer_mut<R>(
        &mut self,
        action: impl FnOnce(*mut sys::ravel_buffer_t) -> R,
    ) -> Result<R>;
}

impl<T: HostScalar> AsBuffer for [T] {
    type Elem = T;
    const DIMS: usize = 1;

    fn with_buffer<R>(&self, action: impl FnOnce(*mut sys::ravel_buffer_t) -> R) -> Result<R> {
        let mut view = BufferView::<'_, T, 1>::new(self, &[self.len() as i64])?;
        Ok(view.with_raw(action))
    }
}

impl<T: HostScalar> AsBufferMut for [T] {
    fn with_buffer_mut<R>(
        &mut self,
        action: impl FnOnce(*mut sys::ravel_buffer_t) -> R,
    ) -> Result<R> {
        let mut view = BufferView::<'_, T, 1>::new_mut(self, &[self.len() as i64])?;
        Ok(view.with_raw(action))
    }
}

impl<T: HostScalar, const L: usize> AsBuffer for [T; L] {
    type Elem = T;
    const DIMS: usize = 1;

    fn with_buffer<R>(&self, action: impl FnOnce(*mut sys::ravel_buffer_t) -> R) -> Result<R> {
        self.as_slice().with_buffer(action)
    }
}

impl<T: HostScalar, const L: usize> AsBufferMut for [T; L] {
    fn with_buffer_mut<R>(
        &mut self,
        action: impl FnOnce(*mut sys::ravel_buffer_t) -> R,
    ) -> Result<R> {
        self.as_mut_slice().with_buffer_mut(action)
    }
}

impl<T: HostScalar> AsBuffer for Vec<T> {
    type Elem = T;
    const DIMS: usize = 1;

    fn with_buffer<R>(&self, action: impl FnOnce(*mut sys::ravel_buffer_t) -> R) -> Result<R> {
        self.as_slice().with_buffer(action)
    }
}

impl<T: HostScalar> AsBufferMut for Vec<T> {
    fn with_buffer_mut<R>(
        &mut self,
        action: impl FnOnce(*mut sys::ravel_buffer_t) -> R,
    ) -> Result<R> {
        self.as_mut_slice().with_buffer_mut(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_strides() {
        let data = vec![0f32; 24];
        let view = BufferView::<'_, f32, 3>::new(&data, &[2, 3, 4]).unwrap();
        assert_eq!(view.strides(), [12, 4, 1]);
        assert_eq!(view.extents(), [2, 3, 4]);
    }

    #[test]
    fn test_one_dim_stride_is_one() {
        let data = vec![0i32; 7];
        let view = BufferView::<'_, i32, 1>::new(&data, &[7]).unwrap();
        assert_eq!(view.strides(), [1]);
    }

    #[test]
    fn test_dimension_arity_mismatch() {
        let data = vec![0f32; 6];
        let err = BufferView::<'_, f32, 3>::new(&data, &[2, 3]).unwrap_err();
        match err {
            RavelError::DimensionArity { expected, got } => {
                assert_eq!(expected, 3);
                assert_eq!(got, 2);
            }
            other => panic!("expected DimensionArity, got {other:?}"),
        }
    }

    #[test]
    fn test_extent_overflow_boundary() {
        let ptr = std::ptr::NonNull::<u8>::dangling().as_ptr();
        // i32::MAX is exactly representable; one past it is not.
        let ok = unsafe {
            BufferView::<'_, u8, 1>::from_raw_parts(ptr, &[i32::MAX as i64], &[1])
        };
        assert!(ok.is_ok());
        let err = unsafe {
            BufferView::<'_, u8, 1>::from_raw_parts(ptr, &[i32::MAX as i64 + 1], &[1])
        };
        match err.unwrap_err() {
            RavelError::IntegerOverflow(v) => assert_eq!(v, i32::MAX as i64 + 1),
            other => panic!("expected IntegerOverflow, got {other:?}"),
        }
    }

    #[test]
    fn test_implicit_stride_product_overflow() {
        // The running product 70_000 * 70_000 exceeds i32 before the numel
        // check is ever reached.
        let data = vec![0f32; 1];
        let err = BufferView::<'_, f32, 3>::new(&data, &[1, 70_000, 70_000]).unwrap_err();
        match err {
            RavelError::IntegerOverflow(v) => assert_eq!(v, 4_900_000_000),
            other => panic!("expected IntegerOverflow, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_stride_overflow() {
        let ptr = std::ptr::NonNull::<u8>::dangling().as_ptr();
        let err = unsafe {
            BufferView::<'_, u8, 2>::from_raw_parts(ptr, &[2, 2], &[i32::MAX as i64 + 1, 1])
        };
        match err.unwrap_err() {
            RavelError::IntegerOverflow(v) => assert_eq!(v, i32::MAX as i64 + 1),
            other => panic!("expected IntegerOverflow, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_stride_is_accepted() {
        let ptr = std::ptr::NonNull::<u8>::dangling().as_ptr();
        let view =
            unsafe { BufferView::<'_, u8, 1>::from_raw_parts(ptr, &[4], &[-1]) }.unwrap();
        assert_eq!(view.strides(), [-1]);
    }

    #[test]
    fn test_negative_extent_is_rejected() {
        let data = vec![0f32; 4];
        let err = BufferView::<'_, f32, 1>::new(&data, &[-4]).unwrap_err();
        assert!(matches!(err, RavelError::InvalidArgument(_)));
    }

    #[test]
    fn test_backing_slice_too_short() {
        let data = vec![0f32; 5];
        let err = BufferView::<'_, f32, 2>::new(&data, &[2, 3]).unwrap_err();
        assert!(matches!(err, RavelError::InvalidArgument(_)));
    }

    #[test]
    fn test_with_raw_descriptor_fields() {
        let data = vec![1.5f32; 6];
        let mut view = BufferView::<'_, f32, 2>::new(&data, &[2, 3]).unwrap();
        view.with_raw(|raw| {
            let b = unsafe { &*raw };
            assert_eq!(b.device, 0);
            assert!(b.device_interface.is_null());
            assert!(b.padding.is_null());
            assert_eq!(b.host, data.as_ptr() as *mut u8);
            assert_eq!(b.ty, f32::ELEM_TYPE.0);
            assert_eq!(b.dimensions, 2);
            let dims = unsafe { std::slice::from_raw_parts(b.dim, 2) };
            assert_eq!(dims[0].extent, 2);
            assert_eq!(dims[0].stride, 3);
            assert_eq!(dims[1].extent, 3);
            assert_eq!(dims[1].stride, 1);
            assert_eq!(dims[0].min, 0);
            assert_eq!(dims[0].flags, 0);
        });
    }

    #[test]
    fn test_debug_formatting() {
        let data = vec![0f32; 6];
        let view = BufferView::<'_, f32, 2>::new(&data, &[2, 3]).unwrap();
        let s = format!("{view:?}");
        assert!(s.contains("f32"), "unexpected debug output: {s}");
        assert!(s.contains("extents"), "unexpected debug output: {s}");
    }

    #[test]
    fn test_vec_as_buffer() {
        let v = vec![1u16, 2, 3];
        v.with_buffer(|raw| {
            let b = unsafe { &*raw };
            assert_eq!(b.ty, u16::ELEM_TYPE.0);
            assert_eq!(b.dimensions, 1);
            let dims = unsafe { std::slice::from_raw_parts(b.dim, 1) };
            assert_eq!(dims[0].extent, 3);
            assert_eq!(dims[0].stride, 1);
        })
        .unwrap();
    }

    #[test]
    fn test_array_as_buffer_mut_writes_are_visible() {
        let mut a = [0i32; 3];
        a.with_buffer_mut(|raw| {
            let b = unsafe { &*raw };
            unsafe { *(b.host as *mut i32) = 42 };
        })
        .unwrap();
        assert_eq!(a[0], 42);
    }
}
