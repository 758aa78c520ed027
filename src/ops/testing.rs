//! In-process modules that record the arguments they are called with, plus a
//! minimal TVM-FFI runtime for them.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::dtype::ScalarType;
use crate::error::DispatchResult;
use crate::ffi::dlpack::{DLManagedTensorVersioned, DLTensor};
use crate::ffi::tvm::{
    any_i64, TVMFFIAny, TVMFFIObject, TVMFFISafeCallFn, TYPE_INDEX_BOOL, TYPE_INDEX_DLTENSOR_PTR,
    TYPE_INDEX_FLOAT, TYPE_INDEX_INT, TYPE_INDEX_NONE, TYPE_INDEX_TENSOR,
};
use crate::kernel_cache::{KernelModule, ModuleCache};
use crate::launch::FfiRuntime;
use crate::ops::DispatchContext;
use crate::tensor::from_boundary;

/// Tensor object layout: header, then the `DLTensor` consumers read.
#[repr(C)]
struct TensorObject {
    header: TVMFFIObject,
    dl_tensor: DLTensor,
    managed: *mut DLManagedTensorVersioned,
}

thread_local! {
    static LIVE_TENSORS: Cell<usize> = const { Cell::new(0) };
    static REJECT_TENSORS: Cell<bool> = const { Cell::new(false) };
}

/// Tensor objects created on this thread and not yet released.
pub fn live_tensor_objects() -> usize {
    LIVE_TENSORS.with(Cell::get)
}

/// Make tensor conversion fail on this thread.
pub fn reject_tensors(reject: bool) {
    REJECT_TENSORS.with(|r| r.set(reject));
}

unsafe extern "C" fn tensor_from_dlpack(
    from: *mut DLManagedTensorVersioned,
    _require_alignment: i32,
    _require_contiguous: i32,
    out: *mut *mut c_void,
) -> i32 {
    if REJECT_TENSORS.with(Cell::get) {
        return -1;
    }
    let object = Box::new(TensorObject {
        header: TVMFFIObject {
            combined_ref_count: 1,
            type_index: TYPE_INDEX_TENSOR,
            padding: 0,
            deleter: None,
        },
        dl_tensor: (*from).dl_tensor,
        managed: from,
    });
    *out = Box::into_raw(object).cast();
    LIVE_TENSORS.with(|n| n.set(n.get() + 1));
    0
}

unsafe extern "C" fn object_decref(obj: *mut c_void) -> i32 {
    let header = obj.cast::<TVMFFIObject>();
    (*header).combined_ref_count -= 1;
    if (*header).combined_ref_count == 0 && (*header).type_index == TYPE_INDEX_TENSOR {
        let object = Box::from_raw(obj.cast::<TensorObject>());
        if let Some(deleter) = (*object.managed).deleter {
            deleter(object.managed);
        }
        LIVE_TENSORS.with(|n| n.set(n.get() - 1));
    }
    0
}

pub fn runtime() -> FfiRuntime {
    FfiRuntime {
        tensor_from_dlpack,
        decref: object_decref,
        move_from_raised: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    None,
    Int(i64),
    Bool(bool),
    Float(f64),
    Tensor {
        shape: Vec<i64>,
        dtype: ScalarType,
        data: usize,
        /// Contents of 1-D host integer tensors.
        values: Option<Vec<i64>>,
        /// Passed as a Tensor object rather than a `DLTensor*`.
        object: bool,
    },
    Other(i32),
}

impl Arg {
    pub fn shape(&self) -> &[i64] {
        match self {
            Arg::Tensor { shape, .. } => shape,
            other => panic!("expected tensor, got {other:?}"),
        }
    }

    pub fn values(&self) -> &[i64] {
        match self {
            Arg::Tensor {
                values: Some(values),
                ..
            } => values,
            other => panic!("expected host index tensor, got {other:?}"),
        }
    }
}

thread_local! {
    static CALLS: RefCell<Vec<Vec<Arg>>> = const { RefCell::new(Vec::new()) };
}

/// Calls recorded on this thread since the last take.
pub fn take_calls() -> Vec<Vec<Arg>> {
    CALLS.with(|calls| std::mem::take(&mut *calls.borrow_mut()))
}

unsafe fn decode(any: &TVMFFIAny) -> Arg {
    match any.type_index {
        TYPE_INDEX_NONE => Arg::None,
        TYPE_INDEX_INT => Arg::Int(any.value.v_int64),
        TYPE_INDEX_BOOL => Arg::Bool(any.value.v_int64 != 0),
        TYPE_INDEX_FLOAT => Arg::Float(any.value.v_float64),
        TYPE_INDEX_DLTENSOR_PTR | TYPE_INDEX_TENSOR => {
            let object = any.type_index == TYPE_INDEX_TENSOR;
            let dl = if object {
                std::ptr::addr_of!((*any.value.v_ptr.cast::<TensorObject>()).dl_tensor)
            } else {
                any.value.v_ptr as *const DLTensor
            };
            let view = from_boundary(dl).expect("recorded tensor is valid");
            let values = (view.device().is_host() && view.ndim() == 1 && view.dtype().is_integer())
                .then(|| view.to_host_i64().ok())
                .flatten();
            Arg::Tensor {
                shape: view.shape().to_vec(),
                dtype: view.dtype(),
                data: view.data_ptr() as usize,
                values,
                object,
            }
        }
        other => Arg::Other(other),
    }
}

/// Records its arguments and returns the argument count as an integer.
pub unsafe extern "C" fn record(
    _handle: *mut c_void,
    args: *const TVMFFIAny,
    num_args: i32,
    result: *mut TVMFFIAny,
) -> i32 {
    let args = std::slice::from_raw_parts(args, num_args as usize);
    let decoded = args.iter().map(|a| decode(a)).collect();
    CALLS.with(|calls| calls.borrow_mut().push(decoded));
    *result = any_i64(i64::from(num_args));
    0
}

pub struct FakeContext {
    pub cache: ModuleCache,
    pub config: DispatchConfig,
    pub pdl: bool,
    pub resolved: RefCell<Vec<String>>,
}

impl FakeContext {
    pub fn new(pdl: bool) -> Self {
        let base = std::env::temp_dir().join("gllm-dispatch-fake-modules-absent");
        Self {
            cache: ModuleCache::new(),
            config: DispatchConfig::with_base_dir(base),
            pdl,
            resolved: RefCell::new(Vec::new()),
        }
    }

    pub fn with_module(self, token: &str, entries: &[&str]) -> Self {
        let module = KernelModule::from_entries(
            token,
            entries.iter().map(|name| (*name, record as TVMFFISafeCallFn)),
        )
        .with_runtime(runtime());
        self.cache.insert(token, module);
        self
    }
}

impl DispatchContext for FakeContext {
    fn resolve(&self, token: &str) -> DispatchResult<Arc<KernelModule>> {
        self.resolved.borrow_mut().push(token.to_string());
        self.cache.get_or_load(&self.config, token)
    }

    fn enable_pdl(&self) -> DispatchResult<bool> {
        Ok(self.pdl)
    }
}
