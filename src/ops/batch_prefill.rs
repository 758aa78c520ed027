//! Batched prefill attention over ragged (unpaged) key/value tensors.

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{
    dim, require_defined, require_ndim, seq_lens_from_indptr, AttentionOptions, DispatchContext,
    MaskMode,
};
use crate::tensor::{HostTensor, OwnedTensor, Tensor};
use crate::uri::{BatchPrefillUri, PrefillBackend};

/// Prefill-only knobs on top of [`AttentionOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefillOptions {
    pub backend: PrefillBackend,
    pub use_fp16_qk_reduction: bool,
    pub mask_mode: MaskMode,
    /// Fixed KV split size; `-1` lets the planner choose.
    pub fixed_split_size: i64,
    pub disable_split_kv: bool,
    pub num_colocated_ctas: i64,
    pub token_pos_in_items_len: i64,
}

impl Default for PrefillOptions {
    fn default() -> Self {
        Self {
            backend: PrefillBackend::Fa2,
            use_fp16_qk_reduction: false,
            mask_mode: MaskMode::Causal,
            fixed_split_size: -1,
            disable_split_kv: false,
            num_colocated_ctas: 0,
            token_pos_in_items_len: 0,
        }
    }
}

/// Inputs of one prefill step.
#[derive(Debug, Clone)]
pub struct BatchPrefillParams<'a> {
    pub float_workspace: &'a Tensor<'a>,
    pub int_workspace: &'a Tensor<'a>,
    pub page_locked_int_workspace: &'a Tensor<'a>,
    /// `[total_q, num_qo_heads, head_dim_qk]`
    pub query: &'a Tensor<'a>,
    /// `[total_kv, num_kv_heads, head_dim_qk]`
    pub key: &'a Tensor<'a>,
    /// `[total_kv, num_kv_heads, head_dim_vo]`
    pub value: &'a Tensor<'a>,
    pub q_cu_seq_lens: &'a Tensor<'a>,
    pub kv_cu_seq_lens: &'a Tensor<'a>,
    pub output: &'a Tensor<'a>,
    pub output_lse: Option<&'a Tensor<'a>>,
    pub custom_mask: Option<&'a Tensor<'a>>,
    pub mask_indptr: Option<&'a Tensor<'a>>,
    pub alibi_slopes: Option<&'a Tensor<'a>>,
    pub prefix_len_ptr: Option<&'a Tensor<'a>>,
    pub token_pos_in_items_ptr: Option<&'a Tensor<'a>>,
    pub max_item_len_ptr: Option<&'a Tensor<'a>>,
    pub options: AttentionOptions,
    pub prefill: PrefillOptions,
}

impl<'a> BatchPrefillParams<'a> {
    /// Params with the required tensors and every optional input absent.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        float_workspace: &'a Tensor<'a>,
        int_workspace: &'a Tensor<'a>,
        page_locked_int_workspace: &'a Tensor<'a>,
        query: &'a Tensor<'a>,
        key: &'a Tensor<'a>,
        value: &'a Tensor<'a>,
        q_cu_seq_lens: &'a Tensor<'a>,
        kv_cu_seq_lens: &'a Tensor<'a>,
        output: &'a Tensor<'a>,
    ) -> Self {
        Self {
            float_workspace,
            int_workspace,
            page_locked_int_workspace,
            query,
            key,
            value,
            q_cu_seq_lens,
            kv_cu_seq_lens,
            output,
            output_lse: None,
            custom_mask: None,
            mask_indptr: None,
            alibi_slopes: None,
            prefix_len_ptr: None,
            token_pos_in_items_ptr: None,
            max_item_len_ptr: None,
            options: AttentionOptions::default(),
            prefill: PrefillOptions::default(),
        }
    }

    fn validate(&self) -> DispatchResult<()> {
        for (tensor, name) in [
            (self.float_workspace, "float_workspace"),
            (self.int_workspace, "int_workspace"),
            (self.page_locked_int_workspace, "page_locked_int_workspace"),
            (self.query, "query"),
            (self.key, "key"),
            (self.value, "value"),
            (self.q_cu_seq_lens, "q_cu_seq_lens"),
            (self.kv_cu_seq_lens, "kv_cu_seq_lens"),
            (self.output, "output"),
        ] {
            require_defined(tensor, name)?;
        }
        require_ndim(self.query, "query", 3)?;
        require_ndim(self.key, "key", 3)?;
        require_ndim(self.value, "value", 3)?;
        require_ndim(self.q_cu_seq_lens, "q_cu_seq_lens", 1)?;
        if self.kv_cu_seq_lens.shape() != self.q_cu_seq_lens.shape() {
            return Err(DispatchError::shape(
                "kv_cu_seq_lens",
                format!("{:?}", self.q_cu_seq_lens.shape()),
                self.kv_cu_seq_lens.shape(),
            ));
        }
        if self.q_cu_seq_lens.shape()[0] < 1 {
            return Err(DispatchError::shape("q_cu_seq_lens", "[batch + 1]", self.q_cu_seq_lens.shape()));
        }
        if self.prefill.mask_mode == MaskMode::Custom {
            if self.custom_mask.is_none() {
                return Err(DispatchError::UndefinedTensor("custom_mask"));
            }
            if self.mask_indptr.is_none() {
                return Err(DispatchError::UndefinedTensor("mask_indptr"));
            }
        }
        Ok(())
    }

    pub fn uri(&self) -> DispatchResult<BatchPrefillUri> {
        Ok(BatchPrefillUri {
            backend: self.prefill.backend,
            dtype_q: self.query.dtype(),
            dtype_kv: self.key.dtype(),
            dtype_o: self.output.dtype(),
            dtype_idx: self.q_cu_seq_lens.dtype(),
            head_dim_qk: dim(self.query, "query", -1)?,
            head_dim_vo: dim(self.value, "value", -1)?,
            pos_encoding_mode: self.options.pos_encoding_mode,
            use_sliding_window: self.options.use_sliding_window(),
            use_logits_soft_cap: self.options.use_logits_soft_cap(),
            use_fp16_qk_reduction: self.prefill.use_fp16_qk_reduction,
        })
    }
}

/// Plan the ragged batch on the module, then run prefill writing into `output`.
pub fn batch_prefill<C: DispatchContext + ?Sized>(
    ctx: &C,
    params: &BatchPrefillParams<'_>,
) -> DispatchResult<()> {
    params.validate()?;
    let uri = params.uri()?;
    let token = uri.render()?;
    let module = ctx.resolve(&token)?;
    let plan = module.function("plan")?;
    let ragged_run = module.function("ragged_run")?;

    let opts = &params.options;
    let prefill = &params.prefill;
    let num_qo_heads = params.query.shape()[1];
    let num_kv_heads = params.key.shape()[1];
    let sm_scale = opts.sm_scale_for(uri.head_dim_qk);
    let enable_pdl = ctx.enable_pdl()?;

    let qo_indptr = params.q_cu_seq_lens.to_host_i64()?;
    let kv_indptr = params.kv_cu_seq_lens.to_host_i64()?;
    let kv_len = seq_lens_from_indptr(&kv_indptr);
    let batch_size = qo_indptr.len() as i64 - 1;
    let total_num_rows = qo_indptr.last().copied().unwrap_or(0);

    let qo_indptr_buf = HostTensor::from_i64_values(&qo_indptr, params.q_cu_seq_lens.dtype())?;
    let kv_indptr_buf = HostTensor::from_i64_values(&kv_indptr, params.kv_cu_seq_lens.dtype())?;
    let kv_len_buf = HostTensor::from_i64_values(&kv_len, params.kv_cu_seq_lens.dtype())?;
    let qo_indptr_host = qo_indptr_buf.view();
    let kv_indptr_host = kv_indptr_buf.view();
    let kv_len_host = kv_len_buf.view();

    let mut plan_args = FfiArgs::with_capacity(19);
    plan_args
        .tensor(params.float_workspace, "float_workspace")?
        .tensor(params.int_workspace, "int_workspace")?
        .tensor(params.page_locked_int_workspace, "page_locked_int_workspace")?
        .tensor(&qo_indptr_host, "qo_indptr_host")?
        .tensor(&kv_indptr_host, "kv_indptr_host")?
        .tensor(&kv_len_host, "kv_len_arr_host")?
        .int(total_num_rows)
        .int(batch_size)
        .int(num_qo_heads)
        .int(num_kv_heads)
        .int(1) // page_size: ragged KV
        .boolean(opts.enable_cuda_graph)
        .int(uri.head_dim_qk)
        .int(uri.head_dim_vo)
        .boolean(prefill.mask_mode == MaskMode::Causal)
        .int(opts.window_left)
        .int(prefill.fixed_split_size)
        .boolean(prefill.disable_split_kv)
        .int(prefill.num_colocated_ctas);
    let plan_info = plan.call(&plan_args)?;
    log::debug!(
        "Planned prefill {}: batch={} rows={} qo_heads={} kv_heads={}",
        token,
        batch_size,
        total_num_rows,
        num_qo_heads,
        num_kv_heads
    );

    let mut run_args = FfiArgs::with_capacity(25);
    run_args
        .tensor(params.float_workspace, "float_workspace")?
        .tensor(params.int_workspace, "int_workspace")?
        .value(&plan_info)
        .tensor(params.query, "query")?
        .tensor(params.key, "key")?
        .tensor(params.value, "value")?
        .tensor(params.q_cu_seq_lens, "q_cu_seq_lens")?
        .tensor(params.kv_cu_seq_lens, "kv_cu_seq_lens")?
        .tensor(params.output, "output")?
        .optional_tensor(params.output_lse, "output_lse")?
        .int(prefill.mask_mode.code())
        .int(opts.kv_layout.code())
        .int(opts.window_left)
        .boolean(enable_pdl)
        .optional_tensor(params.custom_mask, "custom_mask")?
        .optional_tensor(params.mask_indptr, "mask_indptr")?
        .optional_tensor(params.alibi_slopes, "alibi_slopes")?
        .optional_tensor(params.prefix_len_ptr, "prefix_len_ptr")?
        .optional_tensor(params.token_pos_in_items_ptr, "token_pos_in_items_ptr")?
        .optional_tensor(params.max_item_len_ptr, "max_item_len_ptr")?
        .float(opts.logits_soft_cap)
        .float(sm_scale)
        .float(opts.rope_rcp_scale())
        .float(opts.rope_rcp_theta())
        .int(prefill.token_pos_in_items_len);
    ragged_run.call(&run_args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use half::bf16;

    use super::*;
    use crate::dtype::ScalarType;
    use crate::ops::testing::{take_calls, Arg, FakeContext};

    const TOKEN: &str = "batch_prefill_with_kv_cache_dtype_q_bf16_dtype_kv_bf16_dtype_o_bf16_dtype_idx_i32_head_dim_qk_128_head_dim_vo_128_posenc_0_use_swa_False_use_logits_cap_False_f16qk_False";

    #[test]
    fn plans_then_ragged_runs() {
        let ws = vec![0u8; 32];
        let q = vec![bf16::ZERO; 10 * 4 * 128];
        let kv = vec![bf16::ZERO; 12 * 2 * 128];
        let q_cu = vec![0i32, 3, 7, 10];
        let kv_cu = vec![0i32, 4, 9, 12];
        let out = vec![bf16::ZERO; 10 * 4 * 128];

        let ws = Tensor::from_host_slice(&ws, &[32]).unwrap();
        let q = Tensor::from_host_slice(&q, &[10, 4, 128]).unwrap();
        let kv = Tensor::from_host_slice(&kv, &[12, 2, 128]).unwrap();
        let q_cu = Tensor::from_host_slice(&q_cu, &[4]).unwrap();
        let kv_cu = Tensor::from_host_slice(&kv_cu, &[4]).unwrap();
        let out = Tensor::from_host_slice(&out, &[10, 4, 128]).unwrap();

        let params = BatchPrefillParams::new(&ws, &ws, &ws, &q, &kv, &kv, &q_cu, &kv_cu, &out);
        assert_eq!(params.uri().unwrap().render().unwrap(), TOKEN);

        let ctx = FakeContext::new(false).with_module(TOKEN, &["plan", "ragged_run"]);
        batch_prefill(&ctx, &params).unwrap();

        let calls = take_calls();
        assert_eq!(calls.len(), 2);
        let plan = &calls[0];
        assert_eq!(plan.len(), 19);
        assert_eq!(plan[3].values(), &[0, 3, 7, 10]);
        assert_eq!(plan[4].values(), &[0, 4, 9, 12]);
        assert_eq!(plan[5].values(), &[4, 5, 3]);
        assert!(matches!(&plan[5], Arg::Tensor { dtype: ScalarType::I32, .. }));
        assert_eq!(plan[6], Arg::Int(10)); // total_num_rows
        assert_eq!(plan[7], Arg::Int(3)); // batch_size
        assert_eq!(plan[8], Arg::Int(4));
        assert_eq!(plan[9], Arg::Int(2));
        assert_eq!(plan[10], Arg::Int(1));
        assert_eq!(plan[14], Arg::Bool(true)); // causal
        assert_eq!(plan[16], Arg::Int(-1));
        assert_eq!(plan[17], Arg::Bool(false));
        assert_eq!(plan[18], Arg::Int(0));

        let run = &calls[1];
        assert_eq!(run.len(), 25);
        assert_eq!(run[2], Arg::Int(19));
        assert_eq!(run[10], Arg::Int(1)); // mask mode
        assert_eq!(run[11], Arg::Int(0));
        assert_eq!(run[12], Arg::Int(-1));
        assert_eq!(run[13], Arg::Bool(false));
        for aux in &run[14..20] {
            assert_eq!(*aux, Arg::None);
        }
        assert_eq!(run[21], Arg::Float(1.0 / (128f64).sqrt()));
        assert_eq!(run[23], Arg::Float(1e-4));
        assert_eq!(run[24], Arg::Int(0));
    }

    #[test]
    fn fa3_backend_and_non_causal_mask() {
        let ws = vec![0u8; 8];
        let q = vec![bf16::ZERO; 2 * 1 * 64];
        let idx = vec![0i32, 2];
        let ws = Tensor::from_host_slice(&ws, &[8]).unwrap();
        let q = Tensor::from_host_slice(&q, &[2, 1, 64]).unwrap();
        let idx = Tensor::from_host_slice(&idx, &[2]).unwrap();

        let mut params = BatchPrefillParams::new(&ws, &ws, &ws, &q, &q, &q, &idx, &idx, &q);
        params.prefill.backend = PrefillBackend::Fa3;
        params.prefill.mask_mode = MaskMode::NonCausal;
        let token = params.uri().unwrap().render().unwrap();
        assert!(token.ends_with("_f16qk_False_sm90"));

        let ctx = FakeContext::new(true).with_module(&token, &["plan", "ragged_run"]);
        batch_prefill(&ctx, &params).unwrap();
        let calls = take_calls();
        assert_eq!(calls[0][14], Arg::Bool(false));
        assert_eq!(calls[1][10], Arg::Int(0));
        assert_eq!(calls[1][13], Arg::Bool(true));
    }

    #[test]
    fn custom_mask_mode_requires_mask() {
        let ws = vec![0u8; 8];
        let q = vec![bf16::ZERO; 64];
        let idx = vec![0i32, 1];
        let ws = Tensor::from_host_slice(&ws, &[8]).unwrap();
        let q = Tensor::from_host_slice(&q, &[1, 1, 64]).unwrap();
        let idx = Tensor::from_host_slice(&idx, &[2]).unwrap();

        let mut params = BatchPrefillParams::new(&ws, &ws, &ws, &q, &q, &q, &idx, &idx, &q);
        params.prefill.mask_mode = MaskMode::Custom;
        let ctx = FakeContext::new(false);
        assert!(matches!(
            batch_prefill(&ctx, &params),
            Err(DispatchError::UndefinedTensor("custom_mask"))
        ));
        assert!(ctx.resolved.borrow().is_empty());
    }

    #[test]
    fn mismatched_indptr_lengths_are_rejected() {
        let ws = vec![0u8; 8];
        let q = vec![bf16::ZERO; 64];
        let q_cu = vec![0i32, 1];
        let kv_cu = vec![0i32, 1, 1];
        let ws = Tensor::from_host_slice(&ws, &[8]).unwrap();
        let q = Tensor::from_host_slice(&q, &[1, 1, 64]).unwrap();
        let q_cu = Tensor::from_host_slice(&q_cu, &[2]).unwrap();
        let kv_cu = Tensor::from_host_slice(&kv_cu, &[3]).unwrap();

        let params = BatchPrefillParams::new(&ws, &ws, &ws, &q, &q, &q, &q_cu, &kv_cu, &q);
        let ctx = FakeContext::new(false);
        assert!(matches!(
            batch_prefill(&ctx, &params),
            Err(DispatchError::ShapeMismatch { name: "kv_cu_seq_lens", .. })
        ));
    }
}
