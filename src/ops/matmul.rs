//! Dense matmul with optional bias: `out = a @ b + bias`.

use crate::error::{DispatchError, DispatchResult};
use crate::launch::FfiArgs;
use crate::ops::{require_defined, require_ndim, DispatchContext};
use crate::tensor::{OwnedTensor, Tensor, TensorAllocator};
use crate::uri::matmul_uri;

/// `a: [m, k]`, `b: [k, n]`, `bias: [n]`. Returns a fresh `[m, n]` tensor with
/// `a`'s dtype on `a`'s device.
pub fn matmul<C, A>(
    ctx: &C,
    a: &Tensor<'_>,
    b: &Tensor<'_>,
    bias: Option<&Tensor<'_>>,
    allocator: &A,
) -> DispatchResult<A::Output>
where
    C: DispatchContext + ?Sized,
    A: TensorAllocator + ?Sized,
{
    require_defined(a, "a")?;
    require_defined(b, "b")?;
    require_ndim(a, "a", 2)?;
    require_ndim(b, "b", 2)?;
    let (m, k) = (a.shape()[0], a.shape()[1]);
    let n = b.shape()[1];
    if b.shape()[0] != k {
        return Err(DispatchError::shape("b", format!("[{k}, n]"), b.shape()));
    }
    if b.dtype() != a.dtype() {
        return Err(DispatchError::InvalidArgument {
            param: "matmul dtype",
            value: format!("{:?} x {:?}", a.dtype(), b.dtype()),
            allowed: "matching input dtypes",
        });
    }
    if let Some(bias) = bias {
        require_defined(bias, "bias")?;
        if bias.shape() != [n] {
            return Err(DispatchError::shape("bias", format!("[{n}]"), bias.shape()));
        }
    }

    let dtype_out = a.dtype();
    let token = matmul_uri(a.dtype(), dtype_out)?;
    let module = ctx.resolve(&token)?;
    let function = module.function("run")?;

    let out = allocator.alloc(&[m, n], dtype_out, a.device())?;
    {
        let out_view = out.view();
        let mut args = FfiArgs::with_capacity(5);
        args.tensor(&out_view, "out")?
            .tensor(a, "a")?
            .tensor(b, "b")?
            .optional_tensor(bias, "bias")?
            .boolean(ctx.enable_pdl()?);
        function.call(&args)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::*;
    use crate::dtype::ScalarType;
    use crate::ops::testing::{take_calls, Arg, FakeContext};
    use crate::tensor::HostAllocator;

    const TOKEN: &str = "matmul_dtype_in_f16_dtype_o_f16";

    #[test]
    fn allocates_output_and_passes_it_first() {
        let ctx = FakeContext::new(true).with_module(TOKEN, &["run"]);
        let a = vec![f16::ONE; 2 * 3];
        let b = vec![f16::ONE; 3 * 5];
        let a_t = Tensor::from_host_slice(&a, &[2, 3]).unwrap();
        let b_t = Tensor::from_host_slice(&b, &[3, 5]).unwrap();

        let out = matmul(&ctx, &a_t, &b_t, None, &HostAllocator).unwrap();
        assert_eq!(out.shape(), &[2, 5]);
        assert_eq!(out.dtype(), ScalarType::F16);

        let calls = take_calls();
        let args = &calls[0];
        assert_eq!(args.len(), 5);
        assert!(matches!(&args[0], Arg::Tensor { shape, data, .. }
            if shape == &[2, 5] && *data == out.view().data_ptr() as usize));
        assert_eq!(args[3], Arg::None);
        assert_eq!(args[4], Arg::Bool(true));
    }

    #[test]
    fn bias_is_checked_against_n() {
        let ctx = FakeContext::new(false).with_module(TOKEN, &["run"]);
        let a = vec![f16::ONE; 4];
        let bias = vec![f16::ZERO; 3];
        let a_t = Tensor::from_host_slice(&a, &[2, 2]).unwrap();
        let bias_t = Tensor::from_host_slice(&bias, &[3]).unwrap();
        let err = matmul(&ctx, &a_t, &a_t, Some(&bias_t), &HostAllocator).unwrap_err();
        assert!(matches!(err, DispatchError::ShapeMismatch { name: "bias", .. }));

        let bias = vec![f16::ZERO; 2];
        let bias_t = Tensor::from_host_slice(&bias, &[2]).unwrap();
        matmul(&ctx, &a_t, &a_t, Some(&bias_t), &HostAllocator).unwrap();
        assert_eq!(take_calls()[0][3].shape(), &[2]);
    }

    #[test]
    fn inner_dims_must_agree() {
        let ctx = FakeContext::new(false);
        let a = vec![f16::ONE; 6];
        let a_t = Tensor::from_host_slice(&a, &[2, 3]).unwrap();
        let err = matmul(&ctx, &a_t, &a_t, None, &HostAllocator).unwrap_err();
        assert!(matches!(err, DispatchError::ShapeMismatch { name: "b", .. }));
    }

    #[test]
    fn f32_inputs_have_no_module() {
        let ctx = FakeContext::new(false);
        let a = vec![0f32; 4];
        let a_t = Tensor::from_host_slice(&a, &[2, 2]).unwrap();
        let err = matmul(&ctx, &a_t, &a_t, None, &HostAllocator).unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedDtype(ScalarType::F32)));
        assert!(ctx.resolved.borrow().is_empty());
    }
}
