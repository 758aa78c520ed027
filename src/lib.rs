//! gllm-dispatch: dispatch layer for precompiled attention/normalization kernels.
//!
//! Requests (batched prefill, batched decode, RMSNorm, gated activations,
//! rotary embedding, paged-cache writes, matmul) are mapped onto kernel
//! modules built ahead of time and stored in a versioned on-disk cache:
//! - **Canonical tokens**: one module per dtype/shape/feature combination
//! - **Zero-copy boundary**: tensors cross as DLPack 1.x descriptors
//! - **Packed calls**: entry points follow the TVM-FFI calling convention
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_dispatch::{KernelDispatcher, Tensor};
//!
//! let dispatcher = KernelDispatcher::from_env()?;
//! dispatcher.act_and_mul(&out, &input, "silu")?;
//! ```

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod ffi;
pub mod kernel_cache;
pub mod kernel_dispatcher;
pub mod launch;
pub mod ops;
pub mod tensor;
pub mod uri;

pub use config::DispatchConfig;
pub use device::{CapabilityProbe, DeviceCapability, FixedProbe};
#[cfg(feature = "cuda")]
pub use device::CudaProbe;
pub use dtype::{Element, ScalarType};
pub use error::{DispatchError, DispatchResult};
pub use kernel_cache::{module_path, KernelModule, ModuleCache, ModuleFunction};
pub use kernel_dispatcher::KernelDispatcher;
pub use launch::{FfiArgs, FfiRuntime, FfiValue};
pub use ops::{
    act_and_mul, apply_rope_pos_ids_cos_sin_cache, batch_decode, batch_prefill, compute_sm_scale,
    matmul, reshape_paged_cache, rmsnorm, seq_lens_from_indptr, ActivationMode, AttentionOptions,
    BatchDecodeParams, BatchPrefillParams, DispatchContext, KvLayout, MaskMode,
};
pub use ops::batch_prefill::PrefillOptions;
pub use tensor::{
    from_boundary, to_boundary, BoundaryTensor, DeviceKind, HostAllocator, HostTensor,
    OwnedTensor, Tensor, TensorAllocator,
};
#[cfg(feature = "cuda")]
pub use tensor::{CudaAllocator, CudaTensor};
pub use uri::{activation_uri, BatchDecodeUri, BatchPrefillUri, PosEncodingMode, PrefillBackend};
