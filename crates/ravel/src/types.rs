//! Element-type tags and the host-scalar capability.

use ravel_sys as sys;
use sys::ravel_type_code_t as code;

/// Element-type tag in the runtime's (code, bits, lanes) encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ElemType(pub sys::ravel_type_t);

impl ElemType {
    pub const fn new(c: code, bits: u8) -> Self {
        Self(sys::ravel_type_t::new(c, bits, 1))
    }

    /// Size in bytes of one scalar element.
    pub const fn bytes(self) -> usize {
        self.0.bytes()
    }
}

impl std::fmt::Display for ElemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.0.code {
            code::Int => "i",
            code::UInt => "u",
            code::Float => "f",
            code::Handle => "handle",
        };
        write!(f, "{prefix}{}", self.0.bits)?;
        if self.0.lanes != 1 {
            write!(f, "x{}", self.0.lanes)?;
        }
        Ok(())
    }
}

/// Capability of a host scalar type to serve as a buffer element.
///
/// The tag must describe the type's exact in-memory representation: the
/// runtime reads and writes host memory through raw pointers using only
/// this encoding.
pub trait HostScalar: Copy + Default + 'static {
    const ELEM_TYPE: ElemType;
}

macro_rules! host_scalar {
    ($($t:ty => $code:ident, $bits:expr;)*) => {
        $(impl HostScalar for $t {
            const ELEM_TYPE: ElemType = ElemType::new(code::$code, $bits);
        })*
    };
}

host_scalar! {
    i8 => Int, 8;
    i16 => Int, 16;
    i32 => Int, 32;
    i64 => Int, 64;
    u8 => UInt, 8;
    u16 => UInt, 16;
    u32 => UInt, 32;
    u64 => UInt, 64;
    f32 => Float, 32;
    f64 => Float, 64;
}
