//! Pure-Rust implementation of the `ravel_*` C ABI entry points.
//!
//! A small reference interpreter stands in for the external array-compiler
//! runtime: expressions are trees over loop variables, parameter loads, and
//! function calls; `ravel_func_realize` walks the output buffer's domain and
//! writes one element per coordinate through the descriptor, honoring each
//! axis's `min`, `extent`, and `stride`. Arithmetic is carried in `f64` and
//! narrowed on store, which is exact for every element type up to 53 bits.
//!
//! # Safety
//!
//! All functions follow C ABI conventions: callers must pass valid pointers
//! obtained from other `ravel_*` functions, and must free each handle exactly
//! once via the matching `ravel_free_*` function. Buffer descriptors are read
//! within the call only and never retained.

#![allow(clippy::missing_safety_doc)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use libc::{c_char, c_int, size_t};

use crate::{ravel_buffer_t, ravel_dimension_t, ravel_type_code_t, ravel_type_t};
use crate::{ravel_expr_t, ravel_func_t, ravel_param_t, ravel_var_t};

const INT32: ravel_type_t = ravel_type_t::new(ravel_type_code_t::Int, 32, 1);
const FLOAT32: ravel_type_t = ravel_type_t::new(ravel_type_code_t::Float, 32, 1);

// ── Interpreter model ───────────────────────────────────────────────────

struct VarNode {
    name: String,
}

struct ParamNode {
    name: String,
    ty: ravel_type_t,
    dimensions: i32,
    data: Option<ParamData>,
}

/// Dense row-major snapshot of a bound input buffer.
struct ParamData {
    mins: Vec<i32>,
    extents: Vec<i32>,
    values: Vec<f64>,
}

struct Update {
    args: Vec<String>,
    value: Rc<ExprNode>,
}

struct FuncNode {
    name: String,
    args: Vec<String>,
    ty: ravel_type_t,
    body: Rc<ExprNode>,
    updates: Vec<Update>,
}

enum ExprNode {
    IntImm(i32),
    FloatImm(f32),
    Var(String),
    Add(Rc<ExprNode>, Rc<ExprNode>),
    Sub(Rc<ExprNode>, Rc<ExprNode>),
    Mul(Rc<ExprNode>, Rc<ExprNode>),
    Call(Rc<RefCell<FuncNode>>, Vec<Rc<ExprNode>>),
    Load(Rc<RefCell<ParamNode>>, Vec<Rc<ExprNode>>),
}

fn expr_type(e: &ExprNode) -> ravel_type_t {
    match e {
        ExprNode::IntImm(_) | ExprNode::Var(_) => INT32,
        ExprNode::FloatImm(_) => FLOAT32,
        ExprNode::Add(a, b) | ExprNode::Sub(a, b) | ExprNode::Mul(a, b) => {
            let (ta, tb) = (expr_type(a), expr_type(b));
            if ta.code == ravel_type_code_t::Float || tb.code == ravel_type_code_t::Float {
                FLOAT32
            } else {
                INT32
            }
        }
        ExprNode::Call(f, _) => f.borrow().ty,
        ExprNode::Load(p, _) => p.borrow().ty,
    }
}

// ── Error reporting ─────────────────────────────────────────────────────

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn set_error(msg: String) {
    let msg = CString::new(msg.replace('\0', "?")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = msg);
}

/// Message for the most recent failing call on this thread. The pointer is
/// valid until the next failing `ravel_*` call on the same thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ptr())
}

// ── Handle conversion helpers ───────────────────────────────────────────

fn box_var(v: Rc<VarNode>) -> *mut ravel_var_t {
    Box::into_raw(Box::new(v)) as *mut ravel_var_t
}

unsafe fn ref_var<'a>(p: *mut ravel_var_t) -> &'a Rc<VarNode> {
    unsafe { &*(p as *const Rc<VarNode>) }
}

fn box_expr(e: Rc<ExprNode>) -> *mut ravel_expr_t {
    Box::into_raw(Box::new(e)) as *mut ravel_expr_t
}

unsafe fn ref_expr<'a>(p: *mut ravel_expr_t) -> &'a Rc<ExprNode> {
    unsafe { &*(p as *const Rc<ExprNode>) }
}

fn box_param(p: Rc<RefCell<ParamNode>>) -> *mut ravel_param_t {
    Box::into_raw(Box::new(p)) as *mut ravel_param_t
}

unsafe fn ref_param<'a>(p: *mut ravel_param_t) -> &'a Rc<RefCell<ParamNode>> {
    unsafe { &*(p as *const Rc<RefCell<ParamNode>>) }
}

fn box_func(f: Rc<RefCell<FuncNode>>) -> *mut ravel_func_t {
    Box::into_raw(Box::new(f)) as *mut ravel_func_t
}

unsafe fn ref_func<'a>(p: *mut ravel_func_t) -> &'a Rc<RefCell<FuncNode>> {
    unsafe { &*(p as *const Rc<RefCell<FuncNode>>) }
}

unsafe fn name_or(p: *const c_char, fallback: impl FnOnce() -> String) -> String {
    if p.is_null() {
        fallback()
    } else {
        unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
    }
}

unsafe fn collect_exprs(args: *const *mut ravel_expr_t, nargs: size_t) -> Vec<Rc<ExprNode>> {
    if nargs == 0 {
        return Vec::new();
    }
    let raw = unsafe { std::slice::from_raw_parts(args, nargs) };
    raw.iter()
        .map(|&a| Rc::clone(unsafe { ref_expr(a) }))
        .collect()
}

unsafe fn collect_args(vars: *const *mut ravel_var_t, nvars: size_t) -> Vec<String> {
    if nvars == 0 {
        return Vec::new();
    }
    let raw = unsafe { std::slice::from_raw_parts(vars, nvars) };
    raw.iter()
        .map(|&v| unsafe { ref_var(v) }.name.clone())
        .collect()
}

static NEXT_ANON: AtomicU64 = AtomicU64::new(0);

fn anon_name(prefix: &str) -> String {
    format!("{prefix}${}", NEXT_ANON.fetch_add(1, Ordering::Relaxed))
}

// ── Buffer access through the descriptor ────────────────────────────────

/// Validated snapshot of a `ravel_buffer_t`, with typed element access.
struct BufAccess {
    host: *mut u8,
    dims: Vec<ravel_dimension_t>,
    ty: ravel_type_t,
}

impl BufAccess {
    unsafe fn from_raw(buf: *mut ravel_buffer_t) -> Result<Self, String> {
        if buf.is_null() {
            return Err("null buffer descriptor".into());
        }
        let b = unsafe { &*buf };
        if b.host.is_null() {
            return Err("buffer descriptor has null host pointer".into());
        }
        if !b.padding.is_null() {
            return Err("buffer descriptor padding field must be null".into());
        }
        if b.device != 0 || !b.device_interface.is_null() {
            return Err("device-backed buffers are not supported".into());
        }
        if b.dimensions < 0 || (b.dimensions > 0 && b.dim.is_null()) {
            return Err("buffer descriptor has invalid dimension array".into());
        }
        let dims = if b.dimensions == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(b.dim, b.dimensions as usize) }.to_vec()
        };
        if dims.iter().any(|d| d.extent < 0) {
            return Err("buffer dimension has negative extent".into());
        }
        if b.ty.lanes != 1 {
            return Err(format!("vector element types are not supported (lanes={})", b.ty.lanes));
        }
        Ok(Self {
            host: b.host,
            dims,
            ty: b.ty,
        })
    }

    fn elem_offset(&self, coords: &[i32]) -> isize {
        coords
            .iter()
            .zip(self.dims.iter())
            .map(|(&c, d)| (c - d.min) as isize * d.stride as isize)
            .sum()
    }

    fn read(&self, coords: &[i32]) -> Result<f64, String> {
        let off = self.elem_offset(coords) * self.ty.bytes() as isize;
        let p = unsafe { self.host.offset(off) };
        let v = unsafe {
            match (self.ty.code, self.ty.bits) {
                (ravel_type_code_t::Int, 8) => *(p as *const i8) as f64,
                (ravel_type_code_t::Int, 16) => *(p as *const i16) as f64,
                (ravel_type_code_t::Int, 32) => *(p as *const i32) as f64,
                (ravel_type_code_t::Int, 64) => *(p as *const i64) as f64,
                (ravel_type_code_t::UInt, 8) => *p as f64,
                (ravel_type_code_t::UInt, 16) => *(p as *const u16) as f64,
                (ravel_type_code_t::UInt, 32) => *(p as *const u32) as f64,
                (ravel_type_code_t::UInt, 64) => *(p as *const u64) as f64,
                (ravel_type_code_t::Float, 32) => *(p as *const f32) as f64,
                (ravel_type_code_t::Float, 64) => *(p as *const f64),
                (code, bits) => return Err(format!("unsupported element type {code:?}x{bits}")),
            }
        };
        Ok(v)
    }

    fn write(&self, coords: &[i32], v: f64) -> Result<(), String> {
        let off = self.elem_offset(coords) * self.ty.bytes() as isize;
        let p = unsafe { self.host.offset(off) };
        unsafe {
            match (self.ty.code, self.ty.bits) {
                (ravel_type_code_t::Int, 8) => *(p as *mut i8) = v as i8,
                (ravel_type_code_t::Int, 16) => *(p as *mut i16) = v as i16,
                (ravel_type_code_t::Int, 32) => *(p as *mut i32) = v as i32,
                (ravel_type_code_t::Int, 64) => *(p as *mut i64) = v as i64,
                (ravel_type_code_t::UInt, 8) => *p = v as u8,
                (ravel_type_code_t::UInt, 16) => *(p as *mut u16) = v as u16,
                (ravel_type_code_t::UInt, 32) => *(p as *mut u32) = v as u32,
                (ravel_type_code_t::UInt, 64) => *(p as *mut u64) = v as u64,
                (ravel_type_code_t::Float, 32) => *(p as *mut f32) = v as f32,
                (ravel_type_code_t::Float, 64) => *(p as *mut f64) = v,
                (code, bits) => return Err(format!("unsupported element type {code:?}x{bits}")),
            }
        }
        Ok(())
    }
}

/// Row-major walk of the domain: the last axis varies fastest.
fn for_each_coord(
    dims: &[ravel_dimension_t],
    f: &mut dyn FnMut(&[i32]) -> Result<(), String>,
) -> Result<(), String> {
    if dims.iter().any(|d| d.extent == 0) {
        return Ok(());
    }
    let mut coords: Vec<i32> = dims.iter().map(|d| d.min).collect();
    if dims.is_empty() {
        return f(&coords);
    }
    loop {
        f(&coords)?;
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            coords[axis] += 1;
            if coords[axis] < dims[axis].min + dims[axis].extent {
                break;
            }
            coords[axis] = dims[axis].min;
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────

/// The function currently being evaluated, so self-calls in update rules
/// read back the in-progress result instead of recursing.
struct SelfRef<'a> {
    func: *const RefCell<FuncNode>,
    target: SelfTarget<'a>,
}

/// Where a self-call finds the in-progress result: the output buffer during
/// a whole-domain realization, or a single point value during an inlined
/// point evaluation.
enum SelfTarget<'a> {
    Buffer(&'a BufAccess),
    Point { coords: &'a [i32], value: f64 },
}

fn eval(
    e: &ExprNode,
    env: &HashMap<String, f64>,
    current: Option<&SelfRef<'_>>,
) -> Result<f64, String> {
    match e {
        ExprNode::IntImm(v) => Ok(*v as f64),
        ExprNode::FloatImm(v) => Ok(*v as f64),
        ExprNode::Var(name) => env
            .get(name)
            .copied()
            .ok_or_else(|| format!("free variable \"{name}\" in expression")),
        ExprNode::Add(a, b) => Ok(eval(a, env, current)? + eval(b, env, current)?),
        ExprNode::Sub(a, b) => Ok(eval(a, env, current)? - eval(b, env, current)?),
        ExprNode::Mul(a, b) => Ok(eval(a, env, current)? * eval(b, env, current)?),
        ExprNode::Call(f, args) => {
            let coords = eval_coords(args, env, current)?;
            if let Some(s) = current
                && std::ptr::eq(Rc::as_ptr(f), s.func)
            {
                match &s.target {
                    SelfTarget::Buffer(buf) => return buf.read(&coords),
                    SelfTarget::Point { coords: at, value } => {
                        if coords.as_slice() == *at {
                            return Ok(*value);
                        }
                        // Self-call at another point restarts that point's
                        // full evaluation.
                    }
                }
            }
            eval_func_at(f, &coords)
        }
        ExprNode::Load(p, args) => {
            let coords = eval_coords(args, env, current)?;
            let param = p.borrow();
            let data = param
                .data
                .as_ref()
                .ok_or_else(|| format!("parameter \"{}\" is unbound", param.name))?;
            data.fetch(&param.name, &coords)
        }
    }
}

/// Evaluate `f` at a single point: the pure definition, then each update
/// rule in order. The function data is cloned out up front so nothing holds
/// the `RefCell` borrow while sub-expressions are evaluated.
fn eval_func_at(f: &Rc<RefCell<FuncNode>>, coords: &[i32]) -> Result<f64, String> {
    let (name, params, body, updates) = {
        let fb = f.borrow();
        (
            fb.name.clone(),
            fb.args.clone(),
            Rc::clone(&fb.body),
            fb.updates
                .iter()
                .map(|u| (u.args.clone(), Rc::clone(&u.value)))
                .collect::<Vec<_>>(),
        )
    };
    if coords.len() != params.len() {
        return Err(format!(
            "call to \"{name}\" has {} arguments but it has {} pure axes",
            coords.len(),
            params.len()
        ));
    }
    let point_env = |args: &[String]| -> HashMap<String, f64> {
        args.iter()
            .cloned()
            .zip(coords.iter().map(|&c| c as f64))
            .collect()
    };
    let mut value = eval(&body, &point_env(&params), None)?;
    for (uargs, uval) in &updates {
        let this = SelfRef {
            func: Rc::as_ptr(f),
            target: SelfTarget::Point { coords, value },
        };
        value = eval(uval, &point_env(uargs), Some(&this))?;
    }
    Ok(value)
}

fn eval_coords(
    args: &[Rc<ExprNode>],
    env: &HashMap<String, f64>,
    current: Option<&SelfRef<'_>>,
) -> Result<Vec<i32>, String> {
    args.iter()
        .map(|a| eval(a, env, current).map(|v| v as i32))
        .collect()
}

impl ParamData {
    fn fetch(&self, name: &str, coords: &[i32]) -> Result<f64, String> {
        if coords.len() != self.extents.len() {
            return Err(format!(
                "parameter \"{name}\" indexed with {} coordinates but has {} axes",
                coords.len(),
                self.extents.len()
            ));
        }
        let mut idx = 0usize;
        let mut stride = 1usize;
        for axis in (0..coords.len()).rev() {
            let c = coords[axis] - self.mins[axis];
            if c < 0 || c >= self.extents[axis] {
                return Err(format!(
                    "parameter \"{name}\" access out of bounds on axis {axis}: {}",
                    coords[axis]
                ));
            }
            idx += c as usize * stride;
            stride *= self.extents[axis] as usize;
        }
        Ok(self.values[idx])
    }
}

fn realize_into(f: &Rc<RefCell<FuncNode>>, buf: &BufAccess) -> Result<(), String> {
    let fb = f.borrow();
    if fb.args.len() != buf.dims.len() {
        return Err(format!(
            "func \"{}\" has {} pure axes but the output buffer has {}",
            fb.name,
            fb.args.len(),
            buf.dims.len()
        ));
    }
    if fb.ty != buf.ty {
        return Err(format!(
            "func \"{}\" produces {:?}x{} but the output buffer holds {:?}x{}",
            fb.name, fb.ty.code, fb.ty.bits, buf.ty.code, buf.ty.bits
        ));
    }

    let this = SelfRef {
        func: Rc::as_ptr(f),
        target: SelfTarget::Buffer(buf),
    };

    // Pure definition pass, then each update rule in definition order.
    for_each_coord(&buf.dims, &mut |coords| {
        let env: HashMap<String, f64> = fb
            .args
            .iter()
            .cloned()
            .zip(coords.iter().map(|&c| c as f64))
            .collect();
        buf.write(coords, eval(&fb.body, &env, Some(&this))?)
    })?;

    for up in &fb.updates {
        for_each_coord(&buf.dims, &mut |coords| {
            let env: HashMap<String, f64> = up
                .args
                .iter()
                .cloned()
                .zip(coords.iter().map(|&c| c as f64))
                .collect();
            buf.write(coords, eval(&up.value, &env, Some(&this))?)
        })?;
    }
    Ok(())
}

// ── Vars and expressions ────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_var_new(name: *const c_char) -> *mut ravel_var_t {
    let name = unsafe { name_or(name, || anon_name("v")) };
    box_var(Rc::new(VarNode { name }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_var_expr(v: *mut ravel_var_t) -> *mut ravel_expr_t {
    let var = unsafe { ref_var(v) };
    box_expr(Rc::new(ExprNode::Var(var.name.clone())))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_free_var(v: *mut ravel_var_t) {
    if !v.is_null() {
        drop(unsafe { Box::from_raw(v as *mut Rc<VarNode>) });
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_expr_int(value: i32) -> *mut ravel_expr_t {
    box_expr(Rc::new(ExprNode::IntImm(value)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_expr_float(value: f32) -> *mut ravel_expr_t {
    box_expr(Rc::new(ExprNode::FloatImm(value)))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_expr_add(
    a: *mut ravel_expr_t,
    b: *mut ravel_expr_t,
) -> *mut ravel_expr_t {
    let (a, b) = unsafe { (ref_expr(a), ref_expr(b)) };
    box_expr(Rc::new(ExprNode::Add(Rc::clone(a), Rc::clone(b))))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_expr_sub(
    a: *mut ravel_expr_t,
    b: *mut ravel_expr_t,
) -> *mut ravel_expr_t {
    let (a, b) = unsafe { (ref_expr(a), ref_expr(b)) };
    box_expr(Rc::new(ExprNode::Sub(Rc::clone(a), Rc::clone(b))))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_expr_mul(
    a: *mut ravel_expr_t,
    b: *mut ravel_expr_t,
) -> *mut ravel_expr_t {
    let (a, b) = unsafe { (ref_expr(a), ref_expr(b)) };
    box_expr(Rc::new(ExprNode::Mul(Rc::clone(a), Rc::clone(b))))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_expr_type(e: *mut ravel_expr_t) -> ravel_type_t {
    expr_type(unsafe { ref_expr(e) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_free_expr(e: *mut ravel_expr_t) {
    if !e.is_null() {
        drop(unsafe { Box::from_raw(e as *mut Rc<ExprNode>) });
    }
}

// ── Buffer parameters ───────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_param_new(
    ty: ravel_type_t,
    dimensions: c_int,
    name: *const c_char,
) -> *mut ravel_param_t {
    if dimensions < 0 {
        set_error(format!("parameter dimension count {dimensions} is negative"));
        return std::ptr::null_mut();
    }
    let name = unsafe { name_or(name, || anon_name("param")) };
    box_param(Rc::new(RefCell::new(ParamNode {
        name,
        ty,
        dimensions,
        data: None,
    })))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_param_ref(
    p: *mut ravel_param_t,
    args: *const *mut ravel_expr_t,
    nargs: size_t,
) -> *mut ravel_expr_t {
    let param = unsafe { ref_param(p) };
    let dims = param.borrow().dimensions as usize;
    if nargs != dims {
        set_error(format!(
            "parameter \"{}\" indexed with {} arguments but has {} axes",
            param.borrow().name,
            nargs,
            dims
        ));
        return std::ptr::null_mut();
    }
    let args = unsafe { collect_exprs(args, nargs) };
    box_expr(Rc::new(ExprNode::Load(Rc::clone(param), args)))
}

/// Derive a fresh wrapper func `p_im(i0, .., in) = p(i0, .., in)`.
///
/// A new native object is returned on every call; the parameter itself is
/// never promoted.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_param_func(p: *mut ravel_param_t) -> *mut ravel_func_t {
    let param = unsafe { ref_param(p) };
    let (name, ty, ndim) = {
        let pb = param.borrow();
        (pb.name.clone(), pb.ty, pb.dimensions as usize)
    };
    let args: Vec<String> = (0..ndim).map(|i| format!("_i{i}")).collect();
    let arg_exprs: Vec<Rc<ExprNode>> = args
        .iter()
        .map(|a| Rc::new(ExprNode::Var(a.clone())))
        .collect();
    box_func(Rc::new(RefCell::new(FuncNode {
        name: format!("{name}_im"),
        args,
        ty,
        body: Rc::new(ExprNode::Load(Rc::clone(param), arg_exprs)),
        updates: Vec::new(),
    })))
}

/// Snapshot the host data described by `buf` into the parameter.
///
/// The descriptor and its host memory are only read during this call;
/// rebinding replaces the previous snapshot.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_param_bind(
    p: *mut ravel_param_t,
    buf: *mut ravel_buffer_t,
) -> c_int {
    let param = unsafe { ref_param(p) };
    let access = match unsafe { BufAccess::from_raw(buf) } {
        Ok(a) => a,
        Err(msg) => {
            set_error(msg);
            return 1;
        }
    };
    {
        let pb = param.borrow();
        if access.dims.len() != pb.dimensions as usize {
            set_error(format!(
                "parameter \"{}\" has {} axes but the bound buffer has {}",
                pb.name,
                pb.dimensions,
                access.dims.len()
            ));
            return 1;
        }
        if access.ty != pb.ty {
            set_error(format!(
                "parameter \"{}\" holds {:?}x{} but the bound buffer holds {:?}x{}",
                pb.name, pb.ty.code, pb.ty.bits, access.ty.code, access.ty.bits
            ));
            return 1;
        }
    }

    let mut values = Vec::new();
    let copy = for_each_coord(&access.dims, &mut |coords| {
        values.push(access.read(coords)?);
        Ok(())
    });
    if let Err(msg) = copy {
        set_error(msg);
        return 1;
    }
    param.borrow_mut().data = Some(ParamData {
        mins: access.dims.iter().map(|d| d.min).collect(),
        extents: access.dims.iter().map(|d| d.extent).collect(),
        values,
    });
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_free_param(p: *mut ravel_param_t) {
    if !p.is_null() {
        drop(unsafe { Box::from_raw(p as *mut Rc<RefCell<ParamNode>>) });
    }
}

// ── Computation nodes ───────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_func_define(
    name: *const c_char,
    vars: *const *mut ravel_var_t,
    nvars: size_t,
    body: *mut ravel_expr_t,
) -> *mut ravel_func_t {
    if body.is_null() {
        set_error("func definition has null body".into());
        return std::ptr::null_mut();
    }
    let name = unsafe { name_or(name, || anon_name("f")) };
    let args = unsafe { collect_args(vars, nvars) };
    let body = Rc::clone(unsafe { ref_expr(body) });
    let ty = expr_type(&body);
    box_func(Rc::new(RefCell::new(FuncNode {
        name,
        args,
        ty,
        body,
        updates: Vec::new(),
    })))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_func_update(
    f: *mut ravel_func_t,
    vars: *const *mut ravel_var_t,
    nvars: size_t,
    body: *mut ravel_expr_t,
) -> c_int {
    let func = unsafe { ref_func(f) };
    if body.is_null() {
        set_error("update definition has null body".into());
        return 1;
    }
    let body = Rc::clone(unsafe { ref_expr(body) });
    let args = unsafe { collect_args(vars, nvars) };
    // Typing the body may visit calls back into `func`, so it must happen
    // before the mutable borrow below.
    let ty = expr_type(&body);

    let mut fb = func.borrow_mut();
    if args.len() != fb.args.len() {
        set_error(format!(
            "update of \"{}\" names {} axes but it has {}",
            fb.name,
            args.len(),
            fb.args.len()
        ));
        return 1;
    }
    if ty != fb.ty {
        set_error(format!(
            "update of \"{}\" produces {:?}x{} but it holds {:?}x{}",
            fb.name, ty.code, ty.bits, fb.ty.code, fb.ty.bits
        ));
        return 1;
    }
    fb.updates.push(Update { args, value: body });
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_func_ref(
    f: *mut ravel_func_t,
    args: *const *mut ravel_expr_t,
    nargs: size_t,
) -> *mut ravel_expr_t {
    let func = unsafe { ref_func(f) };
    let arity = func.borrow().args.len();
    if nargs != arity {
        set_error(format!(
            "func \"{}\" indexed with {} arguments but has {} axes",
            func.borrow().name,
            nargs,
            arity
        ));
        return std::ptr::null_mut();
    }
    let args = unsafe { collect_exprs(args, nargs) };
    box_expr(Rc::new(ExprNode::Call(Rc::clone(func), args)))
}

/// Evaluate `f` over the domain of `buf` and fill its host memory.
///
/// Synchronous; returns nonzero and sets `ravel_last_error` on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_func_realize(
    f: *mut ravel_func_t,
    buf: *mut ravel_buffer_t,
) -> c_int {
    let func = unsafe { ref_func(f) };
    let access = match unsafe { BufAccess::from_raw(buf) } {
        Ok(a) => a,
        Err(msg) => {
            set_error(msg);
            return 1;
        }
    };
    match realize_into(func, &access) {
        Ok(()) => 0,
        Err(msg) => {
            set_error(msg);
            1
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ravel_free_func(f: *mut ravel_func_t) {
    if !f.is_null() {
        drop(unsafe { Box::from_raw(f as *mut Rc<RefCell<FuncNode>>) });
    }
}
