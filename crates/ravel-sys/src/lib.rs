//! C ABI surface of the Ravel array-compiler runtime.
//!
//! With the default `native` feature, all `ravel_*` entry points are
//! implemented in pure Rust by a small reference interpreter. With the `cpp`
//! feature, they link against the external runtime library instead.
//!
//! The descriptor structs in this module are a byte-for-byte contract with
//! independently compiled code: the runtime reads and writes them directly by
//! address, so their size, alignment, and field offsets are asserted at
//! compile time and must never change.

#![allow(non_camel_case_types)]

use std::mem::offset_of;

#[cfg(feature = "cpp")]
use libc::{c_char, c_int, size_t};

// ── Descriptor records (fixed binary layout) ────────────────────────────

/// One axis of an array view: origin, extent, and stride in elements.
///
/// `stride` may be negative (reverse iteration) or zero (broadcast).
/// 16 bytes, fields at offsets 0/4/8/12.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ravel_dimension_t {
    pub min: i32,
    pub extent: i32,
    pub stride: i32,
    pub flags: u32,
}

/// Scalar kind for [`ravel_type_t::code`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ravel_type_code_t {
    Int = 0,
    UInt = 1,
    Float = 2,
    Handle = 3,
}

/// Element-type tag: scalar kind, bit width, and vector lane count.
/// 4 bytes, matching the runtime's own type encoding.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ravel_type_t {
    pub code: ravel_type_code_t,
    pub bits: u8,
    pub lanes: u16,
}

impl ravel_type_t {
    pub const fn new(code: ravel_type_code_t, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    /// Size in bytes of a single scalar element.
    pub const fn bytes(self) -> usize {
        self.bits as usize / 8
    }
}

/// A view over externally owned multi-dimensional memory.
///
/// `host` is borrowed, never owned; `dim` points at `dimensions` axis
/// records that must stay valid for the duration of any call receiving this
/// descriptor. `device`/`device_interface` are zero/null in host-only mode
/// and `padding` is reserved and must be null.
///
/// 56 bytes on 64-bit targets, fields at offsets 0/8/16/24/32/36/40/48.
#[repr(C)]
#[derive(Debug)]
pub struct ravel_buffer_t {
    pub device: u64,
    pub device_interface: *mut core::ffi::c_void,
    pub host: *mut u8,
    pub flags: u64,
    pub ty: ravel_type_t,
    pub dimensions: i32,
    pub dim: *mut ravel_dimension_t,
    pub padding: *mut core::ffi::c_void,
}

// Layout contract with the external runtime. A failure here is an ABI break.
const _: () = {
    assert!(size_of::<ravel_dimension_t>() == 16);
    assert!(align_of::<ravel_dimension_t>() == 4);
    assert!(offset_of!(ravel_dimension_t, min) == 0);
    assert!(offset_of!(ravel_dimension_t, extent) == 4);
    assert!(offset_of!(ravel_dimension_t, stride) == 8);
    assert!(offset_of!(ravel_dimension_t, flags) == 12);

    assert!(size_of::<ravel_type_t>() == 4);
    assert!(offset_of!(ravel_type_t, code) == 0);
    assert!(offset_of!(ravel_type_t, bits) == 1);
    assert!(offset_of!(ravel_type_t, lanes) == 2);
};

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(size_of::<ravel_buffer_t>() == 56);
    assert!(align_of::<ravel_buffer_t>() == 8);
    assert!(offset_of!(ravel_buffer_t, device) == 0);
    assert!(offset_of!(ravel_buffer_t, device_interface) == 8);
    assert!(offset_of!(ravel_buffer_t, host) == 16);
    assert!(offset_of!(ravel_buffer_t, flags) == 24);
    assert!(offset_of!(ravel_buffer_t, ty) == 32);
    assert!(offset_of!(ravel_buffer_t, dimensions) == 36);
    assert!(offset_of!(ravel_buffer_t, dim) == 40);
    assert!(offset_of!(ravel_buffer_t, padding) == 48);
};

// ── Opaque handle types ─────────────────────────────────────────────────

/// Opaque handle to a loop variable.
#[repr(C)]
pub struct ravel_var_t {
    _private: [u8; 0],
}

/// Opaque handle to an expression node.
#[repr(C)]
pub struct ravel_expr_t {
    _private: [u8; 0],
}

/// Opaque handle to a buffer parameter (an as-yet-unbound input).
#[repr(C)]
pub struct ravel_param_t {
    _private: [u8; 0],
}

/// Opaque handle to a computation node.
#[repr(C)]
pub struct ravel_func_t {
    _private: [u8; 0],
}

// ── C++ FFI declarations (enabled with `cpp` feature) ───────────────────

#[cfg(feature = "cpp")]
unsafe extern "C" {
    pub fn ravel_var_new(name: *const c_char) -> *mut ravel_var_t;
    pub fn ravel_var_expr(v: *mut ravel_var_t) -> *mut ravel_expr_t;
    pub fn ravel_free_var(v: *mut ravel_var_t);

    pub fn ravel_expr_int(value: i32) -> *mut ravel_expr_t;
    pub fn ravel_expr_float(value: f32) -> *mut ravel_expr_t;
    pub fn ravel_expr_add(a: *mut ravel_expr_t, b: *mut ravel_expr_t) -> *mut ravel_expr_t;
    pub fn ravel_expr_sub(a: *mut ravel_expr_t, b: *mut ravel_expr_t) -> *mut ravel_expr_t;
    pub fn ravel_expr_mul(a: *mut ravel_expr_t, b: *mut ravel_expr_t) -> *mut ravel_expr_t;
    pub fn ravel_expr_type(e: *mut ravel_expr_t) -> ravel_type_t;
    pub fn ravel_free_expr(e: *mut ravel_expr_t);

    pub fn ravel_param_new(
        ty: ravel_type_t,
        dimensions: c_int,
        name: *const c_char,
    ) -> *mut ravel_param_t;
    pub fn ravel_param_ref(
        p: *mut ravel_param_t,
        args: *const *mut ravel_expr_t,
        nargs: size_t,
    ) -> *mut ravel_expr_t;
    pub fn ravel_param_func(p: *mut ravel_param_t) -> *mut ravel_func_t;
    pub fn ravel_param_bind(p: *mut ravel_param_t, buf: *mut ravel_buffer_t) -> c_int;
    pub fn ravel_free_param(p: *mut ravel_param_t);

    pub fn ravel_func_define(
        name: *const c_char,
        vars: *const *mut ravel_var_t,
        nvars: size_t,
        body: *mut ravel_expr_t,
    ) -> *mut ravel_func_t;
    pub fn ravel_func_update(
        f: *mut ravel_func_t,
        vars: *const *mut ravel_var_t,
        nvars: size_t,
        body: *mut ravel_expr_t,
    ) -> c_int;
    pub fn ravel_func_ref(
        f: *mut ravel_func_t,
        args: *const *mut ravel_expr_t,
        nargs: size_t,
    ) -> *mut ravel_expr_t;
    pub fn ravel_func_realize(f: *mut ravel_func_t, buf: *mut ravel_buffer_t) -> c_int;
    pub fn ravel_free_func(f: *mut ravel_func_t);

    pub fn ravel_last_error() -> *const c_char;
}

// ── Pure-Rust native implementation (enabled with `native` feature) ─────

#[cfg(feature = "native")]
mod native_impl;

#[cfg(feature = "native")]
pub use native_impl::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::ptr;

    const I32: ravel_type_t = ravel_type_t::new(ravel_type_code_t::Int, 32, 1);

    // Helper: 1-D dense descriptor over a mutable i32 slice.
    fn buffer_1d(data: &mut [i32], dim: &mut ravel_dimension_t) -> ravel_buffer_t {
        dim.min = 0;
        dim.extent = data.len() as i32;
        dim.stride = 1;
        dim.flags = 0;
        ravel_buffer_t {
            device: 0,
            device_interface: ptr::null_mut(),
            host: data.as_mut_ptr() as *mut u8,
            flags: 0,
            ty: I32,
            dimensions: 1,
            dim,
            padding: ptr::null_mut(),
        }
    }

    fn last_error_string() -> String {
        unsafe {
            let p = ravel_last_error();
            if p.is_null() {
                String::new()
            } else {
                CStr::from_ptr(p).to_string_lossy().into_owned()
            }
        }
    }

    #[test]
    fn test_dimension_byte_layout() {
        let d = ravel_dimension_t {
            min: -3,
            extent: 7,
            stride: -2,
            flags: 0xDEAD_BEEF,
        };
        let bytes =
            unsafe { std::slice::from_raw_parts(&d as *const _ as *const u8, size_of_val(&d)) };
        assert_eq!(i32::from_ne_bytes(bytes[0..4].try_into().unwrap()), -3);
        assert_eq!(i32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 7);
        assert_eq!(i32::from_ne_bytes(bytes[8..12].try_into().unwrap()), -2);
        assert_eq!(
            u32::from_ne_bytes(bytes[12..16].try_into().unwrap()),
            0xDEAD_BEEF
        );
    }

    #[test]
    fn test_type_tag_byte_layout() {
        let t = ravel_type_t::new(ravel_type_code_t::Float, 32, 1);
        let bytes =
            unsafe { std::slice::from_raw_parts(&t as *const _ as *const u8, size_of_val(&t)) };
        assert_eq!(bytes[0], 2); // Float
        assert_eq!(bytes[1], 32);
        assert_eq!(u16::from_ne_bytes(bytes[2..4].try_into().unwrap()), 1);
    }

    #[test]
    fn test_define_and_realize_identity() {
        unsafe {
            let v = ravel_var_new(c"i".as_ptr());
            let body = ravel_var_expr(v);
            let f = ravel_func_define(c"ident".as_ptr(), [v].as_ptr(), 1, body);
            assert!(!f.is_null(), "{}", last_error_string());

            let mut out = [0i32; 5];
            let mut dim = ravel_dimension_t::default();
            let mut buf = buffer_1d(&mut out, &mut dim);
            let rc = ravel_func_realize(f, &mut buf);
            assert_eq!(rc, 0, "{}", last_error_string());
            assert_eq!(out, [0, 1, 2, 3, 4]);

            ravel_free_expr(body);
            ravel_free_func(f);
            ravel_free_var(v);
        }
    }

    #[test]
    fn test_realize_respects_min_and_stride() {
        unsafe {
            let v = ravel_var_new(c"i".as_ptr());
            let body = ravel_var_expr(v);
            let f = ravel_func_define(c"ident".as_ptr(), [v].as_ptr(), 1, body);
            assert!(!f.is_null());

            // Domain [10, 13), written every other element.
            let mut out = [0i32; 6];
            let mut dim = ravel_dimension_t {
                min: 10,
                extent: 3,
                stride: 2,
                flags: 0,
            };
            let mut buf = ravel_buffer_t {
                device: 0,
                device_interface: ptr::null_mut(),
                host: out.as_mut_ptr() as *mut u8,
                flags: 0,
                ty: I32,
                dimensions: 1,
                dim: &mut dim,
                padding: ptr::null_mut(),
            };
            let rc = ravel_func_realize(f, &mut buf);
            assert_eq!(rc, 0, "{}", last_error_string());
            assert_eq!(out, [10, 0, 11, 0, 12, 0]);

            ravel_free_expr(body);
            ravel_free_func(f);
            ravel_free_var(v);
        }
    }

    #[test]
    fn test_update_rule_applies_after_pure_definition() {
        unsafe {
            let v = ravel_var_new(c"i".as_ptr());
            let body = ravel_var_expr(v);
            let f = ravel_func_define(c"acc".as_ptr(), [v].as_ptr(), 1, body);
            assert!(!f.is_null());

            // acc(i) = acc(i) + 100
            let iv = ravel_var_expr(v);
            let self_ref = ravel_func_ref(f, [iv].as_ptr(), 1);
            assert!(!self_ref.is_null());
            let hundred = ravel_expr_int(100);
            let upd = ravel_expr_add(self_ref, hundred);
            assert_eq!(ravel_func_update(f, [v].as_ptr(), 1, upd), 0);

            let mut out = [0i32; 4];
            let mut dim = ravel_dimension_t::default();
            let mut buf = buffer_1d(&mut out, &mut dim);
            assert_eq!(ravel_func_realize(f, &mut buf), 0);
            assert_eq!(out, [100, 101, 102, 103]);

            for e in [body, iv, self_ref, hundred, upd] {
                ravel_free_expr(e);
            }
            ravel_free_func(f);
            ravel_free_var(v);
        }
    }

    #[test]
    fn test_call_into_updated_func_sees_its_updates() {
        unsafe {
            // f(i) = i, then f(i) = f(i) + 100
            let v = ravel_var_new(c"i".as_ptr());
            let body = ravel_var_expr(v);
            let f = ravel_func_define(c"f".as_ptr(), [v].as_ptr(), 1, body);
            assert!(!f.is_null());
            let iv = ravel_var_expr(v);
            let self_ref = ravel_func_ref(f, [iv].as_ptr(), 1);
            let hundred = ravel_expr_int(100);
            let upd = ravel_expr_add(self_ref, hundred);
            assert_eq!(ravel_func_update(f, [v].as_ptr(), 1, upd), 0);

            // g(i) = f(i) + 1 must see f's full update chain.
            let jv = ravel_var_expr(v);
            let call = ravel_func_ref(f, [jv].as_ptr(), 1);
            let one = ravel_expr_int(1);
            let gbody = ravel_expr_add(call, one);
            let g = ravel_func_define(c"g".as_ptr(), [v].as_ptr(), 1, gbody);
            assert!(!g.is_null());

            let mut out = [0i32; 3];
            let mut dim = ravel_dimension_t::default();
            let mut buf = buffer_1d(&mut out, &mut dim);
            assert_eq!(ravel_func_realize(g, &mut buf), 0, "{}", last_error_string());
            assert_eq!(out, [101, 102, 103]);

            for e in [body, iv, self_ref, hundred, upd, jv, call, one, gbody] {
                ravel_free_expr(e);
            }
            ravel_free_func(g);
            ravel_free_func(f);
            ravel_free_var(v);
        }
    }

    #[test]
    fn test_unbound_param_reports_error() {
        unsafe {
            let p = ravel_param_new(I32, 1, c"input".as_ptr());
            assert!(!p.is_null());
            let f = ravel_param_func(p);
            assert!(!f.is_null());

            let mut out = [0i32; 3];
            let mut dim = ravel_dimension_t::default();
            let mut buf = buffer_1d(&mut out, &mut dim);
            assert_ne!(ravel_func_realize(f, &mut buf), 0);
            assert!(
                last_error_string().contains("unbound"),
                "unexpected message: {}",
                last_error_string()
            );

            ravel_free_func(f);
            ravel_free_param(p);
        }
    }

    #[test]
    fn test_bind_param_then_realize_through_func() {
        unsafe {
            let p = ravel_param_new(I32, 1, c"input".as_ptr());
            assert!(!p.is_null());

            let mut src = [3i32, 1, 4];
            let mut sdim = ravel_dimension_t::default();
            let mut sbuf = buffer_1d(&mut src, &mut sdim);
            assert_eq!(ravel_param_bind(p, &mut sbuf), 0, "{}", last_error_string());

            // f(i) = input(i) * 2
            let v = ravel_var_new(c"i".as_ptr());
            let iv = ravel_var_expr(v);
            let load = ravel_param_ref(p, [iv].as_ptr(), 1);
            assert!(!load.is_null());
            let two = ravel_expr_int(2);
            let body = ravel_expr_mul(load, two);
            let f = ravel_func_define(c"doubled".as_ptr(), [v].as_ptr(), 1, body);
            assert!(!f.is_null());

            let mut out = [0i32; 3];
            let mut dim = ravel_dimension_t::default();
            let mut buf = buffer_1d(&mut out, &mut dim);
            assert_eq!(ravel_func_realize(f, &mut buf), 0, "{}", last_error_string());
            assert_eq!(out, [6, 2, 8]);

            for e in [iv, load, two, body] {
                ravel_free_expr(e);
            }
            ravel_free_func(f);
            ravel_free_var(v);
            ravel_free_param(p);
        }
    }

    #[test]
    fn test_ref_arity_mismatch_is_rejected() {
        unsafe {
            let v = ravel_var_new(c"i".as_ptr());
            let body = ravel_var_expr(v);
            let f = ravel_func_define(c"ident".as_ptr(), [v].as_ptr(), 1, body);
            assert!(!f.is_null());

            let a = ravel_expr_int(0);
            let b = ravel_expr_int(1);
            let bad = ravel_func_ref(f, [a, b].as_ptr(), 2);
            assert!(bad.is_null());

            for e in [body, a, b] {
                ravel_free_expr(e);
            }
            ravel_free_func(f);
            ravel_free_var(v);
        }
    }

    #[test]
    fn test_expr_type_promotion() {
        unsafe {
            let i = ravel_expr_int(1);
            let x = ravel_expr_float(1.5);
            let s = ravel_expr_add(i, x);
            assert_eq!(
                ravel_expr_type(s),
                ravel_type_t::new(ravel_type_code_t::Float, 32, 1)
            );
            let ii = ravel_expr_mul(i, i);
            assert_eq!(ravel_expr_type(ii), I32);
            for e in [i, x, s, ii] {
                ravel_free_expr(e);
            }
        }
    }
}
