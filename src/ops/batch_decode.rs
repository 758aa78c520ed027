//! Batched decode attention over a paged KV cache.

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{dim, require_defined, require_ndim, AttentionOptions, DispatchContext, KvLayout};
use crate::tensor::{HostTensor, OwnedTensor, Tensor};
use crate::uri::BatchDecodeUri;

/// Inputs of one decode step. Workspaces and caches are owned by the caller.
#[derive(Debug, Clone)]
pub struct BatchDecodeParams<'a> {
    pub float_workspace: &'a Tensor<'a>,
    pub int_workspace: &'a Tensor<'a>,
    pub page_locked_int_workspace: &'a Tensor<'a>,
    /// `[batch, num_qo_heads, head_dim_qk]`
    pub query: &'a Tensor<'a>,
    /// `[num_pages, page_size, num_kv_heads, head_dim]` for NHD
    pub k_cache: &'a Tensor<'a>,
    pub v_cache: &'a Tensor<'a>,
    /// `[batch + 1]`, one query row per request.
    pub q_cu_seq_lens: &'a Tensor<'a>,
    pub paged_kv_indptr: &'a Tensor<'a>,
    pub paged_kv_indices: &'a Tensor<'a>,
    pub paged_kv_last_page_len: &'a Tensor<'a>,
    pub output: &'a Tensor<'a>,
    pub output_lse: Option<&'a Tensor<'a>>,
    pub alibi_slopes: Option<&'a Tensor<'a>>,
    pub options: AttentionOptions,
}

impl BatchDecodeParams<'_> {
    fn validate(&self) -> DispatchResult<()> {
        for (tensor, name) in [
            (self.float_workspace, "float_workspace"),
            (self.int_workspace, "int_workspace"),
            (self.page_locked_int_workspace, "page_locked_int_workspace"),
            (self.query, "query"),
            (self.k_cache, "k_cache"),
            (self.v_cache, "v_cache"),
            (self.q_cu_seq_lens, "q_cu_seq_lens"),
            (self.paged_kv_indptr, "paged_kv_indptr"),
            (self.paged_kv_indices, "paged_kv_indices"),
            (self.paged_kv_last_page_len, "paged_kv_last_page_len"),
            (self.output, "output"),
        ] {
            require_defined(tensor, name)?;
        }
        require_ndim(self.query, "query", 3)?;
        require_ndim(self.k_cache, "k_cache", 4)?;
        require_ndim(self.v_cache, "v_cache", 4)?;
        require_ndim(self.q_cu_seq_lens, "q_cu_seq_lens", 1)?;
        require_ndim(self.paged_kv_indptr, "paged_kv_indptr", 1)?;
        if self.paged_kv_indptr.shape() != self.q_cu_seq_lens.shape() {
            return Err(DispatchError::shape(
                "paged_kv_indptr",
                format!("{:?}", self.q_cu_seq_lens.shape()),
                self.paged_kv_indptr.shape(),
            ));
        }
        if self.q_cu_seq_lens.shape()[0] < 1 {
            return Err(DispatchError::shape("q_cu_seq_lens", "[batch + 1]", self.q_cu_seq_lens.shape()));
        }
        Ok(())
    }

    /// `(page_size, num_kv_heads)` read from the key cache layout.
    fn cache_geometry(&self) -> (i64, i64) {
        let shape = self.k_cache.shape();
        match self.options.kv_layout {
            KvLayout::Nhd => (shape[1], shape[2]),
            KvLayout::Hnd => (shape[2], shape[1]),
        }
    }

    pub fn uri(&self) -> DispatchResult<BatchDecodeUri> {
        Ok(BatchDecodeUri {
            dtype_q: self.query.dtype(),
            dtype_kv: self.k_cache.dtype(),
            dtype_o: self.output.dtype(),
            dtype_idx: self.paged_kv_indptr.dtype(),
            head_dim_qk: dim(self.query, "query", -1)?,
            head_dim_vo: dim(self.v_cache, "v_cache", -1)?,
            pos_encoding_mode: self.options.pos_encoding_mode,
            use_sliding_window: self.options.use_sliding_window(),
            use_logits_soft_cap: self.options.use_logits_soft_cap(),
        })
    }
}

/// Plan the batch on the module, then run decode writing into `output`.
pub fn batch_decode<C: DispatchContext + ?Sized>(
    ctx: &C,
    params: &BatchDecodeParams<'_>,
) -> DispatchResult<()> {
    params.validate()?;
    let uri = params.uri()?;
    let token = uri.render()?;
    let module = ctx.resolve(&token)?;
    let plan = module.function("plan")?;
    let run = module.function("run")?;

    let opts = &params.options;
    let batch_size = params.q_cu_seq_lens.shape()[0] - 1;
    let num_qo_heads = params.query.shape()[1];
    let (page_size, num_kv_heads) = params.cache_geometry();
    let sm_scale = opts.sm_scale_for(uri.head_dim_qk);
    let enable_pdl = ctx.enable_pdl()?;

    let indptr_buf = HostTensor::from_i64_values(
        &params.paged_kv_indptr.to_host_i64()?,
        params.paged_kv_indptr.dtype(),
    )?;
    let empty_q_buf = HostTensor::zeros(&[0], params.query.dtype())?;
    let empty_kv_buf = HostTensor::zeros(&[0], params.k_cache.dtype())?;
    let indptr_host = indptr_buf.view();
    let empty_q = empty_q_buf.view();
    let empty_kv = empty_kv_buf.view();

    let mut plan_args = FfiArgs::with_capacity(15);
    plan_args
        .tensor(params.float_workspace, "float_workspace")?
        .tensor(params.int_workspace, "int_workspace")?
        .tensor(params.page_locked_int_workspace, "page_locked_int_workspace")?
        .tensor(&indptr_host, "paged_kv_indptr_host")?
        .int(batch_size)
        .int(num_qo_heads)
        .int(num_kv_heads)
        .int(page_size)
        .boolean(opts.enable_cuda_graph)
        .int(opts.window_left)
        .float(opts.logits_soft_cap)
        .int(uri.head_dim_qk)
        .int(uri.head_dim_vo)
        .tensor(&empty_q, "empty_q_data")?
        .tensor(&empty_kv, "empty_kv_data")?;
    let plan_info = plan.call(&plan_args)?;
    log::debug!(
        "Planned decode {}: batch={} qo_heads={} kv_heads={} page_size={}",
        token,
        batch_size,
        num_qo_heads,
        num_kv_heads,
        page_size
    );

    let mut run_args = FfiArgs::with_capacity(19);
    run_args
        .tensor(params.float_workspace, "float_workspace")?
        .tensor(params.int_workspace, "int_workspace")?
        .value(&plan_info)
        .tensor(params.query, "query")?
        .tensor(params.k_cache, "k_cache")?
        .tensor(params.v_cache, "v_cache")?
        .tensor(params.paged_kv_indptr, "paged_kv_indptr")?
        .tensor(params.paged_kv_indices, "paged_kv_indices")?
        .tensor(params.paged_kv_last_page_len, "paged_kv_last_page_len")?
        .tensor(params.output, "output")?
        .optional_tensor(params.output_lse, "output_lse")?
        .int(opts.kv_layout.code())
        .int(opts.window_left)
        .boolean(enable_pdl)
        .optional_tensor(params.alibi_slopes, "alibi_slopes")?
        .float(opts.logits_soft_cap)
        .float(sm_scale)
        .float(opts.rope_rcp_scale())
        .float(opts.rope_rcp_theta());
    run.call(&run_args)?;
    Ok(())
}
