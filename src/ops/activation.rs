//! Gated activations: `out = act(input[.., :d]) * input[.., d:]`.

use std::fmt;
use std::str::FromStr;

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{dim, require_defined, DispatchContext};
use crate::tensor::Tensor;
use crate::uri::activation_uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationMode {
    Silu,
    Gelu,
    GeluTanh,
}

impl ActivationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationMode::Silu => "silu",
            ActivationMode::Gelu => "gelu",
            ActivationMode::GeluTanh => "gelu_tanh",
        }
    }
}

impl FromStr for ActivationMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silu" => Ok(ActivationMode::Silu),
            "gelu" => Ok(ActivationMode::Gelu),
            "gelu_tanh" => Ok(ActivationMode::GeluTanh),
            other => Err(DispatchError::InvalidArgument {
                param: "act mode",
                value: other.to_string(),
                allowed: "silu, gelu, gelu_tanh",
            }),
        }
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fused activation-and-multiply. The mode is checked before any module lookup.
pub fn act_and_mul<C: DispatchContext + ?Sized>(
    ctx: &C,
    out: &Tensor<'_>,
    input: &Tensor<'_>,
    act_mode: &str,
) -> DispatchResult<()> {
    let mode: ActivationMode = act_mode.parse()?;
    require_defined(out, "out")?;
    require_defined(input, "input")?;
    let d = dim(out, "out", -1)?;
    let d_in = dim(input, "input", -1)?;
    if d_in != 2 * d {
        return Err(DispatchError::shape(
            "input",
            format!("last dim {} (2 x out)", 2 * d),
            input.shape(),
        ));
    }

    let uri = activation_uri(mode.as_str());
    let module = ctx.resolve(&uri)?;
    let function = module.function(&uri)?;
    let mut args = FfiArgs::with_capacity(3);
    args.tensor(out, "out")?
        .tensor(input, "input")?
        .boolean(ctx.enable_pdl()?);
    function.call(&args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::*;
    use crate::ops::testing::{take_calls, Arg, FakeContext};

    #[test]
    fn invalid_mode_fails_before_resolution() {
        let ctx = FakeContext::new(false);
        let out = vec![f16::ZERO; 4];
        let input = vec![f16::ZERO; 8];
        let out = Tensor::from_host_slice(&out, &[1, 4]).unwrap();
        let input = Tensor::from_host_slice(&input, &[1, 8]).unwrap();

        let err = act_and_mul(&ctx, &out, &input, "relu").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported act mode: relu, only support silu, gelu, gelu_tanh"
        );
        assert!(ctx.resolved.borrow().is_empty());
    }

    #[test]
    fn calls_named_entry_with_pdl_flag() {
        let ctx = FakeContext::new(true).with_module("gelu_tanh_and_mul", &["gelu_tanh_and_mul"]);
        let out = vec![f16::ZERO; 6];
        let input = vec![f16::ZERO; 12];
        let out_t = Tensor::from_host_slice(&out, &[2, 3]).unwrap();
        let input_t = Tensor::from_host_slice(&input, &[2, 6]).unwrap();

        act_and_mul(&ctx, &out_t, &input_t, "gelu_tanh").unwrap();

        let calls = take_calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0];
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].shape(), &[2, 3]);
        assert_eq!(args[1].shape(), &[2, 6]);
        assert_eq!(args[2], Arg::Bool(true));
        assert_eq!(*ctx.resolved.borrow(), vec!["gelu_tanh_and_mul".to_string()]);
    }

    #[test]
    fn input_must_be_twice_output_width() {
        let ctx = FakeContext::new(false).with_module("silu_and_mul", &["silu_and_mul"]);
        let out = vec![f16::ZERO; 4];
        let input = vec![f16::ZERO; 4];
        let out = Tensor::from_host_slice(&out, &[1, 4]).unwrap();
        let input = Tensor::from_host_slice(&input, &[1, 4]).unwrap();
        assert!(matches!(
            act_and_mul(&ctx, &out, &input, "silu"),
            Err(DispatchError::ShapeMismatch { name: "input", .. })
        ));
        assert!(ctx.resolved.borrow().is_empty());
    }

    #[test]
    fn missing_module_surfaces_path() {
        let ctx = FakeContext::new(false);
        let out = vec![f16::ZERO; 2];
        let input = vec![f16::ZERO; 4];
        let out = Tensor::from_host_slice(&out, &[2]).unwrap();
        let input = Tensor::from_host_slice(&input, &[4]).unwrap();
        let err = act_and_mul(&ctx, &out, &input, "silu").unwrap_err();
        assert!(err.to_string().contains("silu_and_mul/silu_and_mul.so"));
    }
}
