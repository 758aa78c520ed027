//! Scatter freshly computed keys/values into a paged KV cache.

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{require_defined, require_ndim, DispatchContext};
use crate::tensor::Tensor;

pub const RESHAPE_PAGED_CACHE_URI: &str = "reshape_paged_cache";

/// Write token `i` of `keys`/`values` to cache slot `slot_ids[i]`.
///
/// Slot `s` addresses block `s / block_size`, row `s % block_size`.
pub fn reshape_paged_cache<C: DispatchContext + ?Sized>(
    ctx: &C,
    slot_ids: &Tensor<'_>,
    keys: &Tensor<'_>,
    values: &Tensor<'_>,
    key_cache: &Tensor<'_>,
    value_cache: &Tensor<'_>,
) -> DispatchResult<()> {
    for (tensor, name) in [
        (slot_ids, "slot_ids"),
        (keys, "keys"),
        (values, "values"),
        (key_cache, "key_cache"),
        (value_cache, "value_cache"),
    ] {
        require_defined(tensor, name)?;
    }
    require_ndim(slot_ids, "slot_ids", 1)?;
    require_ndim(keys, "keys", 3)?;
    require_ndim(key_cache, "key_cache", 4)?;
    if values.shape() != keys.shape() {
        return Err(DispatchError::shape("values", format!("{:?}", keys.shape()), values.shape()));
    }
    if value_cache.shape() != key_cache.shape() {
        return Err(DispatchError::shape(
            "value_cache",
            format!("{:?}", key_cache.shape()),
            value_cache.shape(),
        ));
    }
    if slot_ids.shape()[0] != keys.shape()[0] {
        return Err(DispatchError::shape(
            "slot_ids",
            format!("[{}]", keys.shape()[0]),
            slot_ids.shape(),
        ));
    }
    let (heads, head_dim) = (keys.shape()[1], keys.shape()[2]);
    if key_cache.shape()[2] != heads || key_cache.shape()[3] != head_dim {
        return Err(DispatchError::shape(
            "key_cache",
            format!("[n_blocks, block_size, {heads}, {head_dim}]"),
            key_cache.shape(),
        ));
    }

    let module = ctx.resolve(RESHAPE_PAGED_CACHE_URI)?;
    let function = module.function(RESHAPE_PAGED_CACHE_URI)?;
    let mut args = FfiArgs::with_capacity(5);
    args.tensor(slot_ids, "slot_ids")?
        .tensor(keys, "keys")?
        .tensor(values, "values")?
        .tensor(key_cache, "key_cache")?
        .tensor(value_cache, "value_cache")?;
    function.call(&args)?;
    Ok(())
}
