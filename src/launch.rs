//! Positional argument packing for packed-call entry points.

use std::ffi::c_void;
use std::marker::PhantomData;

use crate::error::DispatchResult;
use crate::ffi::tvm::{
    any_bool, any_f64, any_i64, any_none, any_object, any_object_handle, TVMFFIAny,
    TVMFFIErrorMoveFromRaisedFn, TVMFFIObjectDecRefFn, TVMFFITensorFromDLPackVersionedFn,
    TYPE_INDEX_TENSOR,
};
use crate::tensor::{to_boundary, BoundaryTensor, Tensor};

/// TVM-FFI runtime entry points a module links against.
#[derive(Debug, Clone, Copy)]
pub struct FfiRuntime {
    pub tensor_from_dlpack: TVMFFITensorFromDLPackVersionedFn,
    pub decref: TVMFFIObjectDecRefFn,
    pub move_from_raised: Option<TVMFFIErrorMoveFromRaisedFn>,
}

struct TensorArg<'t> {
    index: usize,
    name: &'static str,
    boundary: BoundaryTensor<'t>,
}

/// Ordered argument list for one entry point call.
///
/// Tensors are wrapped into boundary descriptors as they are pushed; the
/// descriptors live as long as the builder, so every pointer in the list stays
/// valid until the call returns.
pub struct FfiArgs<'t> {
    values: Vec<TVMFFIAny>,
    tensors: Vec<TensorArg<'t>>,
}

impl<'t> FfiArgs<'t> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            tensors: Vec::new(),
        }
    }

    pub fn tensor(&mut self, tensor: &'t Tensor<'_>, name: &'static str) -> DispatchResult<&mut Self> {
        let boundary = to_boundary(tensor, name)?;
        let view = boundary.as_any();
        self.tensors.push(TensorArg {
            index: self.values.len(),
            name,
            boundary,
        });
        self.values.push(view);
        Ok(self)
    }

    /// Absent tensors are passed as `None`; present ones must be defined.
    pub fn optional_tensor(
        &mut self,
        tensor: Option<&'t Tensor<'_>>,
        name: &'static str,
    ) -> DispatchResult<&mut Self> {
        match tensor {
            Some(tensor) => self.tensor(tensor, name),
            None => Ok(self.none()),
        }
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        self.values.push(any_i64(value));
        self
    }

    pub fn float(&mut self, value: f64) -> &mut Self {
        self.values.push(any_f64(value));
        self
    }

    pub fn boolean(&mut self, value: bool) -> &mut Self {
        self.values.push(any_bool(value));
        self
    }

    pub fn none(&mut self) -> &mut Self {
        self.values.push(any_none());
        self
    }

    /// Forward a value returned by an earlier call. Ownership stays with `value`.
    pub fn value(&mut self, value: &'t FfiValue<'_>) -> &mut Self {
        self.values.push(value.any);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values as pushed; tensors appear as `DLTensor*` views.
    pub fn as_slice(&self) -> &[TVMFFIAny] {
        &self.values
    }

    /// Final argument array for a call.
    ///
    /// With a runtime, every tensor is handed over as a versioned DLPack
    /// descriptor wrapped in a Tensor object; the objects are released when
    /// the returned value drops. Without one, tensors stay `DLTensor*` views.
    pub(crate) fn pack(&self, runtime: Option<&FfiRuntime>) -> Result<PackedArgs, &'static str> {
        let mut packed = PackedArgs {
            values: self.values.clone(),
            objects: Vec::new(),
            decref: runtime.map(|r| r.decref),
        };
        let Some(runtime) = runtime else {
            return Ok(packed);
        };
        packed.objects.reserve(self.tensors.len());
        for arg in &self.tensors {
            let managed = arg.boundary.export();
            let mut handle: *mut c_void = std::ptr::null_mut();
            // SAFETY: `managed` is a fresh descriptor; ownership moves to the runtime on success.
            let code = unsafe { (runtime.tensor_from_dlpack)(managed, 0, 0, &mut handle) };
            if code != 0 || handle.is_null() {
                // SAFETY: not consumed, so it is still ours to free.
                unsafe {
                    if let Some(deleter) = (*managed).deleter {
                        deleter(managed);
                    }
                }
                return Err(arg.name);
            }
            packed.objects.push(handle);
            packed.values[arg.index] = any_object(TYPE_INDEX_TENSOR, handle);
        }
        Ok(packed)
    }
}

/// Argument array handed to one call, owning the objects created for it.
pub(crate) struct PackedArgs {
    values: Vec<TVMFFIAny>,
    objects: Vec<*mut c_void>,
    decref: Option<TVMFFIObjectDecRefFn>,
}

impl PackedArgs {
    pub(crate) fn as_slice(&self) -> &[TVMFFIAny] {
        &self.values
    }
}

impl Drop for PackedArgs {
    fn drop(&mut self) {
        if let Some(decref) = self.decref {
            for &object in &self.objects {
                // SAFETY: each handle carries the one reference created in `pack`.
                unsafe { decref(object) };
            }
        }
    }
}

/// Value returned from an entry point.
///
/// Object values hold one reference, released on drop through the module that
/// produced them.
pub struct FfiValue<'m> {
    any: TVMFFIAny,
    decref: Option<TVMFFIObjectDecRefFn>,
    _module: PhantomData<&'m ()>,
}

impl<'m> FfiValue<'m> {
    pub(crate) fn new(any: TVMFFIAny, decref: Option<TVMFFIObjectDecRefFn>) -> Self {
        Self {
            any,
            decref,
            _module: PhantomData,
        }
    }

    pub fn as_any(&self) -> &TVMFFIAny {
        &self.any
    }

    pub fn type_index(&self) -> i32 {
        self.any.type_index
    }

    pub fn object_handle(&self) -> Option<*mut c_void> {
        any_object_handle(&self.any)
    }
}

impl Drop for FfiValue<'_> {
    fn drop(&mut self) {
        if let (Some(handle), Some(decref)) = (self.object_handle(), self.decref) {
            // SAFETY: the handle carries one reference owned by this value.
            unsafe { decref(handle) };
        }
    }
}

impl std::fmt::Debug for FfiValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FfiValue").field(&self.any).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::ffi::tvm::{
        TYPE_INDEX_ARRAY, TYPE_INDEX_BOOL, TYPE_INDEX_DLTENSOR_PTR, TYPE_INDEX_FLOAT,
        TYPE_INDEX_INT, TYPE_INDEX_NONE,
    };
    use crate::ffi::tvm::TVMFFIAnyValue;
    use crate::error::DispatchError;

    #[test]
    fn packs_in_push_order_with_type_tags() {
        let data = [0i32; 3];
        let t = Tensor::from_host_slice(&data, &[3]).unwrap();
        let mut args = FfiArgs::with_capacity(5);
        args.tensor(&t, "indptr")
            .unwrap()
            .int(4)
            .float(0.5)
            .boolean(false)
            .none();

        let tags: Vec<i32> = args.as_slice().iter().map(|a| a.type_index).collect();
        assert_eq!(
            tags,
            vec![
                TYPE_INDEX_DLTENSOR_PTR,
                TYPE_INDEX_INT,
                TYPE_INDEX_FLOAT,
                TYPE_INDEX_BOOL,
                TYPE_INDEX_NONE
            ]
        );
        assert_eq!(args.len(), 5);
    }

    #[test]
    fn optional_tensor_absent_is_none() {
        let mut args = FfiArgs::with_capacity(1);
        args.optional_tensor(None, "lse").unwrap();
        assert_eq!(args.as_slice()[0].type_index, TYPE_INDEX_NONE);
    }

    #[test]
    fn optional_tensor_present_but_undefined_fails() {
        let t = Tensor::undefined();
        let mut args = FfiArgs::with_capacity(1);
        let err = args.optional_tensor(Some(&t), "alibi_slopes").err().unwrap();
        assert!(matches!(err, DispatchError::UndefinedTensor("alibi_slopes")));
    }

    thread_local! {
        static DECREFS: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn count_decref(_obj: *mut c_void) -> i32 {
        DECREFS.with(|c| c.set(c.get() + 1));
        0
    }

    #[test]
    fn object_values_release_on_drop() {
        let mut dummy = 0u64;
        let obj = TVMFFIAny {
            type_index: TYPE_INDEX_ARRAY,
            zero_padding: 0,
            value: TVMFFIAnyValue {
                v_ptr: (&mut dummy as *mut u64).cast(),
            },
        };
        DECREFS.with(|c| c.set(0));
        {
            let value = FfiValue::new(obj, Some(count_decref));
            let mut args = FfiArgs::with_capacity(1);
            args.value(&value);
            assert_eq!(args.as_slice()[0].type_index, TYPE_INDEX_ARRAY);
        }
        assert_eq!(DECREFS.with(Cell::get), 1);

        drop(FfiValue::new(any_i64(1), Some(count_decref)));
        assert_eq!(DECREFS.with(Cell::get), 1);
    }
}
