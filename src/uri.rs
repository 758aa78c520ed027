//! Canonical module identifiers.
//!
//! A token names exactly one precompiled module. Field order and encoding are
//! fixed; two descriptors render to the same token iff every field matches.

use std::fmt;
use std::str::FromStr;

use crate::dtype::ScalarType;
use crate::error::{DispatchError, DispatchResult};

/// Positional encoding baked into an attention module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PosEncodingMode {
    #[default]
    None,
    RopeLlama,
    Alibi,
}

impl PosEncodingMode {
    pub fn code(self) -> i64 {
        match self {
            PosEncodingMode::None => 0,
            PosEncodingMode::RopeLlama => 1,
            PosEncodingMode::Alibi => 2,
        }
    }
}

/// Prefill kernel generation. `Fa3` modules are built for sm90 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrefillBackend {
    #[default]
    Fa2,
    Fa3,
}

impl PrefillBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            PrefillBackend::Fa2 => "fa2",
            PrefillBackend::Fa3 => "fa3",
        }
    }
}

impl FromStr for PrefillBackend {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fa2" => Ok(PrefillBackend::Fa2),
            "fa3" => Ok(PrefillBackend::Fa3),
            other => Err(DispatchError::InvalidArgument {
                param: "prefill backend",
                value: other.to_string(),
                allowed: "fa2, fa3",
            }),
        }
    }
}

impl fmt::Display for PrefillBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Descriptor of a batched decode module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchDecodeUri {
    pub dtype_q: ScalarType,
    pub dtype_kv: ScalarType,
    pub dtype_o: ScalarType,
    pub dtype_idx: ScalarType,
    pub head_dim_qk: i64,
    pub head_dim_vo: i64,
    pub pos_encoding_mode: PosEncodingMode,
    pub use_sliding_window: bool,
    pub use_logits_soft_cap: bool,
}

impl BatchDecodeUri {
    pub fn render(&self) -> DispatchResult<String> {
        Ok(format!(
            "batch_decode_with_kv_cache_{}",
            render_common(
                self.dtype_q,
                self.dtype_kv,
                self.dtype_o,
                self.dtype_idx,
                self.head_dim_qk,
                self.head_dim_vo,
                self.pos_encoding_mode,
                self.use_sliding_window,
                self.use_logits_soft_cap,
            )?
        ))
    }
}

/// Descriptor of a batched prefill module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchPrefillUri {
    pub backend: PrefillBackend,
    pub dtype_q: ScalarType,
    pub dtype_kv: ScalarType,
    pub dtype_o: ScalarType,
    pub dtype_idx: ScalarType,
    pub head_dim_qk: i64,
    pub head_dim_vo: i64,
    pub pos_encoding_mode: PosEncodingMode,
    pub use_sliding_window: bool,
    pub use_logits_soft_cap: bool,
    pub use_fp16_qk_reduction: bool,
}

impl BatchPrefillUri {
    pub fn render(&self) -> DispatchResult<String> {
        let mut token = format!(
            "batch_prefill_with_kv_cache_{}_f16qk_{}",
            render_common(
                self.dtype_q,
                self.dtype_kv,
                self.dtype_o,
                self.dtype_idx,
                self.head_dim_qk,
                self.head_dim_vo,
                self.pos_encoding_mode,
                self.use_sliding_window,
                self.use_logits_soft_cap,
            )?,
            py_bool(self.use_fp16_qk_reduction)
        );
        if self.backend == PrefillBackend::Fa3 {
            token.push_str("_sm90");
        }
        Ok(token)
    }
}

#[allow(clippy::too_many_arguments)]
fn render_common(
    dtype_q: ScalarType,
    dtype_kv: ScalarType,
    dtype_o: ScalarType,
    dtype_idx: ScalarType,
    head_dim_qk: i64,
    head_dim_vo: i64,
    pos_encoding_mode: PosEncodingMode,
    use_sliding_window: bool,
    use_logits_soft_cap: bool,
) -> DispatchResult<String> {
    Ok(format!(
        "dtype_q_{}_dtype_kv_{}_dtype_o_{}_dtype_idx_{}_head_dim_qk_{}_head_dim_vo_{}_posenc_{}_use_swa_{}_use_logits_cap_{}",
        dtype_q.filename_safe()?,
        dtype_kv.filename_safe()?,
        dtype_o.filename_safe()?,
        dtype_idx.filename_safe()?,
        head_dim_qk,
        head_dim_vo,
        pos_encoding_mode.code(),
        py_bool(use_sliding_window),
        py_bool(use_logits_soft_cap),
    ))
}

/// Token (and entry point) of a gated activation module.
pub fn activation_uri(mode: &str) -> String {
    format!("{mode}_and_mul")
}

/// Token of a dense matmul module.
pub fn matmul_uri(dtype_in: ScalarType, dtype_out: ScalarType) -> DispatchResult<String> {
    Ok(format!(
        "matmul_dtype_in_{}_dtype_o_{}",
        dtype_in.filename_safe()?,
        dtype_out.filename_safe()?
    ))
}
