//! Raw C ABI shared with precompiled kernel modules.
//!
//! `dlpack` describes tensor memory, `tvm` describes the packed-call
//! convention used to invoke module entry points.

pub mod dlpack;
pub mod tvm;

pub use dlpack::{
    DLDataType, DLDevice, DLManagedTensorVersioned, DLPackVersion, DLTensor, KDL_CPU, KDL_CUDA,
    KDL_CUDA_HOST,
};
pub use tvm::{
    any_bool, any_dltensor_ptr, any_f64, any_i64, any_none, any_object, any_object_handle,
    TVMFFIAny,
};
