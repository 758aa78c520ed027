//! Rotary position embedding with a precomputed cos/sin cache.

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{require_defined, require_ndim, DispatchContext};
use crate::tensor::Tensor;

pub const ROPE_URI: &str = "rope";

/// Rotate `q`/`k` by the positions in `pos_ids`, writing into `q_rope`/`k_rope`.
///
/// `cos_sin_cache` is `[max_position, rotary_dim]` with the cosine half first.
/// `interleave` selects GPT-J style pairs instead of NeoX halves.
#[allow(clippy::too_many_arguments)]
pub fn apply_rope_pos_ids_cos_sin_cache<C: DispatchContext + ?Sized>(
    ctx: &C,
    q: &Tensor<'_>,
    k: &Tensor<'_>,
    q_rope: &Tensor<'_>,
    k_rope: &Tensor<'_>,
    cos_sin_cache: &Tensor<'_>,
    pos_ids: &Tensor<'_>,
    interleave: bool,
) -> DispatchResult<()> {
    for (tensor, name) in [
        (q, "q"),
        (k, "k"),
        (q_rope, "q_rope"),
        (k_rope, "k_rope"),
        (cos_sin_cache, "cos_sin_cache"),
        (pos_ids, "pos_ids"),
    ] {
        require_defined(tensor, name)?;
    }
    require_ndim(cos_sin_cache, "cos_sin_cache", 2)?;
    require_ndim(pos_ids, "pos_ids", 1)?;
    if q_rope.shape() != q.shape() {
        return Err(DispatchError::shape("q_rope", format!("{:?}", q.shape()), q_rope.shape()));
    }
    if k_rope.shape() != k.shape() {
        return Err(DispatchError::shape("k_rope", format!("{:?}", k.shape()), k_rope.shape()));
    }
    let nnz = q.size(0);
    if nnz.is_none() || k.size(0) != nnz || pos_ids.size(0) != nnz {
        return Err(DispatchError::shape(
            "pos_ids",
            format!("one position per token of q ({nnz:?})"),
            pos_ids.shape(),
        ));
    }

    let module = ctx.resolve(ROPE_URI)?;
    let function = module.function("apply_rope_pos_ids_cos_sin_cache")?;
    let mut args = FfiArgs::with_capacity(7);
    args.tensor(q, "q")?
        .tensor(k, "k")?
        .tensor(q_rope, "q_rope")?
        .tensor(k_rope, "k_rope")?
        .tensor(cos_sin_cache, "cos_sin_cache")?
        .tensor(pos_ids, "pos_ids")?
        .boolean(interleave);
    function.call(&args)?;
    Ok(())
}
