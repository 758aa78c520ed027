//! RMS normalization dispatch.

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{dim, require_defined, DispatchContext};
use crate::tensor::Tensor;

pub const NORM_URI: &str = "norm";

/// `output = input / rms(input) * weight` over the last dimension.
pub fn rmsnorm<C: DispatchContext + ?Sized>(
    ctx: &C,
    output: &Tensor<'_>,
    input: &Tensor<'_>,
    weight: &Tensor<'_>,
    eps: f64,
) -> DispatchResult<()> {
    require_defined(output, "output")?;
    require_defined(input, "input")?;
    require_defined(weight, "weight")?;
    let hidden = dim(input, "input", -1)?;
    if weight.ndim() != 1 || weight.shape()[0] != hidden {
        return Err(DispatchError::shape("weight", format!("[{hidden}]"), weight.shape()));
    }
    if output.shape() != input.shape() {
        return Err(DispatchError::shape(
            "output",
            format!("{:?}", input.shape()),
            output.shape(),
        ));
    }

    let module = ctx.resolve(NORM_URI)?;
    let function = module.function("rmsnorm")?;
    let mut args = FfiArgs::with_capacity(5);
    args.tensor(output, "output")?
        .tensor(input, "input")?
        .tensor(weight, "weight")?
        .float(eps)
        .boolean(ctx.enable_pdl()?);
    function.call(&args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use half::bf16;

    use super::*;
    use crate::ops::testing::{take_calls, Arg, FakeContext};

    #[test]
    fn packs_output_input_weight_eps_pdl() {
        let ctx = FakeContext::new(false).with_module(NORM_URI, &["rmsnorm"]);
        let out = vec![bf16::ZERO; 8];
        let input = vec![bf16::ONE; 8];
        let weight = vec![bf16::ONE; 4];
        let out_t = Tensor::from_host_slice(&out, &[2, 4]).unwrap();
        let input_t = Tensor::from_host_slice(&input, &[2, 4]).unwrap();
        let weight_t = Tensor::from_host_slice(&weight, &[4]).unwrap();

        rmsnorm(&ctx, &out_t, &input_t, &weight_t, 1e-6).unwrap();

        let calls = take_calls();
        let args = &calls[0];
        assert_eq!(args.len(), 5);
        assert!(matches!(&args[0], Arg::Tensor { data, .. } if *data == out.as_ptr() as usize));
        assert!(matches!(&args[1], Arg::Tensor { data, .. } if *data == input.as_ptr() as usize));
        assert_eq!(args[2].shape(), &[4]);
        assert_eq!(args[3], Arg::Float(1e-6));
        assert_eq!(args[4], Arg::Bool(false));
    }

    #[test]
    fn weight_length_must_match_hidden() {
        let ctx = FakeContext::new(false).with_module(NORM_URI, &["rmsnorm"]);
        let out = vec![bf16::ZERO; 8];
        let weight = vec![bf16::ONE; 3];
        let out_t = Tensor::from_host_slice(&out, &[2, 4]).unwrap();
        let weight_t = Tensor::from_host_slice(&weight, &[3]).unwrap();
        let err = rmsnorm(&ctx, &out_t, &out_t, &weight_t, 1e-6).unwrap_err();
        assert!(matches!(err, DispatchError::ShapeMismatch { name: "weight", .. }));
    }

    #[test]
    fn undefined_weight_is_rejected() {
        let ctx = FakeContext::new(false).with_module(NORM_URI, &["rmsnorm"]);
        let out = vec![bf16::ZERO; 4];
        let out_t = Tensor::from_host_slice(&out, &[1, 4]).unwrap();
        let err = rmsnorm(&ctx, &out_t, &out_t, &Tensor::undefined(), 1e-6).unwrap_err();
        assert!(matches!(err, DispatchError::UndefinedTensor("weight")));
    }
}
