//! Operation dispatchers.
//!
//! Every dispatcher follows the same order: validate enumerated parameters and
//! tensor definedness, derive the module token, resolve the module, then pack
//! the positional arguments and call the entry point. Outputs are written in
//! place except for [`matmul`](matmul::matmul).

use std::sync::Arc;

use crate::error::{DispatchError, DispatchResult};
use crate::kernel_cache::KernelModule;
use crate::tensor::Tensor;

pub mod activation;
pub mod batch_decode;
pub mod batch_prefill;
pub mod matmul;
pub mod norm;
pub mod paged_cache;
pub mod rope;

#[cfg(test)]
pub(crate) mod testing;

pub use activation::{act_and_mul, ActivationMode};
pub use batch_decode::{batch_decode, BatchDecodeParams};
pub use batch_prefill::{batch_prefill, BatchPrefillParams};
pub use matmul::matmul;
pub use norm::rmsnorm;
pub use paged_cache::reshape_paged_cache;
pub use rope::apply_rope_pos_ids_cos_sin_cache;

/// What a dispatcher needs from its environment.
pub trait DispatchContext {
    /// Module registered under `token`, loading it on first use.
    fn resolve(&self, token: &str) -> DispatchResult<Arc<KernelModule>>;

    /// Whether kernels may use programmatic dependent launch.
    fn enable_pdl(&self) -> DispatchResult<bool>;
}

/// KV cache memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KvLayout {
    /// `[.., seq, heads, dim]`
    #[default]
    Nhd,
    /// `[.., heads, seq, dim]`
    Hnd,
}

impl KvLayout {
    pub fn code(self) -> i64 {
        match self {
            KvLayout::Nhd => 0,
            KvLayout::Hnd => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MaskMode {
    NonCausal,
    #[default]
    Causal,
    Custom,
    MultiItemScoring,
}

impl MaskMode {
    pub fn code(self) -> i64 {
        match self {
            MaskMode::NonCausal => 0,
            MaskMode::Causal => 1,
            MaskMode::Custom => 2,
            MaskMode::MultiItemScoring => 3,
        }
    }
}

/// Knobs shared by decode and prefill attention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionOptions {
    pub pos_encoding_mode: crate::uri::PosEncodingMode,
    /// Left window size; negative disables the sliding window.
    pub window_left: i64,
    /// Logit soft cap; values <= 0 disable capping.
    pub logits_soft_cap: f64,
    pub kv_layout: KvLayout,
    /// Softmax scale; `1/sqrt(head_dim_qk)` when unset.
    pub sm_scale: Option<f64>,
    pub rope_scale: f64,
    pub rope_theta: f64,
    pub enable_cuda_graph: bool,
}

impl Default for AttentionOptions {
    fn default() -> Self {
        Self {
            pos_encoding_mode: crate::uri::PosEncodingMode::None,
            window_left: -1,
            logits_soft_cap: 0.0,
            kv_layout: KvLayout::Nhd,
            sm_scale: None,
            rope_scale: 1.0,
            rope_theta: 1e4,
            enable_cuda_graph: false,
        }
    }
}

impl AttentionOptions {
    pub fn use_sliding_window(&self) -> bool {
        self.window_left >= 0
    }

    pub fn use_logits_soft_cap(&self) -> bool {
        self.logits_soft_cap > 0.0
    }

    pub fn sm_scale_for(&self, head_dim_qk: i64) -> f64 {
        self.sm_scale
            .unwrap_or_else(|| compute_sm_scale(head_dim_qk))
    }

    pub fn rope_rcp_scale(&self) -> f64 {
        1.0 / self.rope_scale
    }

    pub fn rope_rcp_theta(&self) -> f64 {
        1.0 / self.rope_theta
    }
}

/// Default attention scale, `1/sqrt(head_dim)`.
pub fn compute_sm_scale(head_dim: i64) -> f64 {
    1.0 / (head_dim as f64).sqrt()
}

/// Per-sequence lengths from a cumulative-length array.
pub fn seq_lens_from_indptr(indptr: &[i64]) -> Vec<i64> {
    indptr.windows(2).map(|w| w[1] - w[0]).collect()
}

pub(crate) fn require_defined(tensor: &Tensor<'_>, name: &'static str) -> DispatchResult<()> {
    if tensor.is_defined() {
        Ok(())
    } else {
        Err(DispatchError::UndefinedTensor(name))
    }
}

pub(crate) fn require_ndim(tensor: &Tensor<'_>, name: &'static str, ndim: usize) -> DispatchResult<()> {
    if tensor.ndim() == ndim {
        Ok(())
    } else {
        Err(DispatchError::shape(name, format!("{ndim}-D"), tensor.shape()))
    }
}

/// Extent of `dim`, or a shape error naming the tensor.
pub(crate) fn dim(tensor: &Tensor<'_>, name: &'static str, dim: isize) -> DispatchResult<i64> {
    tensor.size(dim).ok_or_else(|| {
        DispatchError::shape(name, format!("a dimension at index {dim}"), tensor.shape())
    })
}
