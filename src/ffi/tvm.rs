//! TVM-FFI packed-call ABI.
//!
//! Kernel modules export every entry point as `__tvm_ffi_<name>` with the
//! safe-call signature below. Arguments travel as an array of `TVMFFIAny`,
//! a 16-byte tagged value.

use std::ffi::c_void;

use super::dlpack::{DLManagedTensorVersioned, DLTensor};

pub const EXPORT_SYMBOL_PREFIX: &str = "__tvm_ffi_";

// Type indices for POD values.
pub const TYPE_INDEX_NONE: i32 = 0;
pub const TYPE_INDEX_INT: i32 = 1;
pub const TYPE_INDEX_BOOL: i32 = 2;
pub const TYPE_INDEX_FLOAT: i32 = 3;
pub const TYPE_INDEX_DLTENSOR_PTR: i32 = 7;
// Everything at or above this index is a ref-counted object.
pub const TYPE_INDEX_STATIC_OBJECT_BEGIN: i32 = 64;
pub const TYPE_INDEX_ERROR: i32 = 67;
pub const TYPE_INDEX_TENSOR: i32 = 70;
pub const TYPE_INDEX_ARRAY: i32 = 71;

#[repr(C)]
#[derive(Clone, Copy)]
pub union TVMFFIAnyValue {
    pub v_int64: i64,
    pub v_float64: f64,
    pub v_ptr: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TVMFFIAny {
    pub type_index: i32,
    pub zero_padding: u32,
    pub value: TVMFFIAnyValue,
}

impl std::fmt::Debug for TVMFFIAny {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: every union member is 8 bytes of plain data; reading as i64 is always valid.
        let raw = unsafe { self.value.v_int64 };
        f.debug_struct("TVMFFIAny")
            .field("type_index", &self.type_index)
            .field("value", &format_args!("{raw:#x}"))
            .finish()
    }
}

/// Common header of every TVM-FFI object.
#[repr(C)]
pub struct TVMFFIObject {
    pub combined_ref_count: u64,
    pub type_index: i32,
    pub padding: u32,
    pub deleter: Option<unsafe extern "C" fn(*mut TVMFFIObject, i32)>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TVMFFIByteArray {
    pub data: *const u8,
    pub size: usize,
}

/// Payload that follows the object header of an error object.
#[repr(C)]
pub struct TVMFFIErrorCell {
    pub kind: TVMFFIByteArray,
    pub message: TVMFFIByteArray,
    pub backtrace: TVMFFIByteArray,
}

pub type TVMFFISafeCallFn = unsafe extern "C" fn(
    handle: *mut c_void,
    args: *const TVMFFIAny,
    num_args: i32,
    result: *mut TVMFFIAny,
) -> i32;
pub type TVMFFIObjectDecRefFn = unsafe extern "C" fn(obj: *mut c_void) -> i32;
pub type TVMFFIErrorMoveFromRaisedFn = unsafe extern "C" fn(result: *mut *mut c_void);
/// Takes ownership of `from` on success; on failure the caller still owns it.
pub type TVMFFITensorFromDLPackVersionedFn = unsafe extern "C" fn(
    from: *mut DLManagedTensorVersioned,
    require_alignment: i32,
    require_contiguous: i32,
    out: *mut *mut c_void,
) -> i32;

pub fn any_none() -> TVMFFIAny {
    TVMFFIAny {
        type_index: TYPE_INDEX_NONE,
        zero_padding: 0,
        value: TVMFFIAnyValue { v_int64: 0 },
    }
}

pub fn any_i64(value: i64) -> TVMFFIAny {
    TVMFFIAny {
        type_index: TYPE_INDEX_INT,
        zero_padding: 0,
        value: TVMFFIAnyValue { v_int64: value },
    }
}

pub fn any_f64(value: f64) -> TVMFFIAny {
    TVMFFIAny {
        type_index: TYPE_INDEX_FLOAT,
        zero_padding: 0,
        value: TVMFFIAnyValue { v_float64: value },
    }
}

pub fn any_bool(value: bool) -> TVMFFIAny {
    TVMFFIAny {
        type_index: TYPE_INDEX_BOOL,
        zero_padding: 0,
        value: TVMFFIAnyValue {
            v_int64: i64::from(value),
        },
    }
}

pub fn any_dltensor_ptr(tensor: *const DLTensor) -> TVMFFIAny {
    TVMFFIAny {
        type_index: TYPE_INDEX_DLTENSOR_PTR,
        zero_padding: 0,
        value: TVMFFIAnyValue {
            v_ptr: tensor.cast_mut().cast(),
        },
    }
}

/// Borrowed object argument. The caller keeps its reference.
pub fn any_object(type_index: i32, handle: *mut c_void) -> TVMFFIAny {
    TVMFFIAny {
        type_index,
        zero_padding: 0,
        value: TVMFFIAnyValue { v_ptr: handle },
    }
}

/// Object handle carried by `any`, if it holds a ref-counted object.
pub fn any_object_handle(any: &TVMFFIAny) -> Option<*mut c_void> {
    if any.type_index < TYPE_INDEX_STATIC_OBJECT_BEGIN {
        return None;
    }
    // SAFETY: object-typed values always store the handle in `v_ptr`.
    let ptr = unsafe { any.value.v_ptr };
    (!ptr.is_null()).then_some(ptr)
}

/// Read `kind: message` out of an error object.
///
/// # Safety
/// `obj` must be a live TVM-FFI error object.
pub unsafe fn error_object_message(obj: *mut c_void) -> String {
    let header = std::mem::size_of::<TVMFFIObject>();
    let cell = &*(obj.cast::<u8>().add(header) as *const TVMFFIErrorCell);
    let kind = byte_array_to_string(cell.kind);
    let message = byte_array_to_string(cell.message);
    if kind.is_empty() {
        message
    } else {
        format!("{kind}: {message}")
    }
}

unsafe fn byte_array_to_string(bytes: TVMFFIByteArray) -> String {
    if bytes.data.is_null() || bytes.size == 0 {
        return String::new();
    }
    let slice = std::slice::from_raw_parts(bytes.data, bytes.size);
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<TVMFFIAny>(), 16);
    }

    #[test]
    fn scalar_constructors_tag_values() {
        let v = any_i64(-7);
        assert_eq!(v.type_index, TYPE_INDEX_INT);
        assert_eq!(unsafe { v.value.v_int64 }, -7);

        let v = any_bool(true);
        assert_eq!(v.type_index, TYPE_INDEX_BOOL);
        assert_eq!(unsafe { v.value.v_int64 }, 1);

        let v = any_f64(0.125);
        assert_eq!(v.type_index, TYPE_INDEX_FLOAT);
        assert_eq!(unsafe { v.value.v_float64 }, 0.125);

        assert_eq!(any_none().type_index, TYPE_INDEX_NONE);
    }

    #[test]
    fn pod_values_carry_no_object_handle() {
        assert!(any_object_handle(&any_i64(3)).is_none());
        assert!(any_object_handle(&any_none()).is_none());
    }

    #[test]
    fn object_values_expose_their_handle() {
        let mut slot = 0u64;
        let handle: *mut c_void = (&mut slot as *mut u64).cast();
        let v = any_object(TYPE_INDEX_TENSOR, handle);
        assert_eq!(v.type_index, TYPE_INDEX_TENSOR);
        assert_eq!(any_object_handle(&v), Some(handle));
        assert!(any_object_handle(&any_object(TYPE_INDEX_TENSOR, std::ptr::null_mut())).is_none());
    }

    #[test]
    fn error_message_reads_kind_and_message() {
        #[repr(C)]
        struct FakeError {
            header: TVMFFIObject,
            cell: TVMFFIErrorCell,
        }
        let kind = b"ValueError";
        let message = b"bad plan";
        let mut fake = FakeError {
            header: TVMFFIObject {
                combined_ref_count: 1,
                type_index: TYPE_INDEX_ERROR,
                padding: 0,
                deleter: None,
            },
            cell: TVMFFIErrorCell {
                kind: TVMFFIByteArray {
                    data: kind.as_ptr(),
                    size: kind.len(),
                },
                message: TVMFFIByteArray {
                    data: message.as_ptr(),
                    size: message.len(),
                },
                backtrace: TVMFFIByteArray {
                    data: std::ptr::null(),
                    size: 0,
                },
            },
        };
        let text = unsafe { error_object_message((&mut fake as *mut FakeError).cast()) };
        assert_eq!(text, "ValueError: bad plan");
    }
}
