//! Kernel dispatcher facade.
//!
//! Owns the configuration, the module cache and the capability probe, and
//! exposes every operation as a method. Share it behind an `Arc`; all methods
//! take `&self`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::device::{default_probe, CapabilityCache, CapabilityProbe, DeviceCapability};
use crate::error::DispatchResult;
use crate::kernel_cache::{module_path, KernelModule, ModuleCache};
use crate::ops::{self, BatchDecodeParams, BatchPrefillParams, DispatchContext};
use crate::tensor::{Tensor, TensorAllocator};

pub struct KernelDispatcher {
    config: DispatchConfig,
    modules: ModuleCache,
    capabilities: CapabilityCache,
}

impl Default for KernelDispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl KernelDispatcher {
    /// Dispatcher probing devices through the CUDA driver when available.
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_probe(config, default_probe())
    }

    pub fn with_probe(config: DispatchConfig, probe: Box<dyn CapabilityProbe>) -> Self {
        log::info!(
            "Kernel dispatcher: modules under {:?}, device cuda:{}",
            config.module_root(),
            config.device_index
        );
        Self {
            config,
            modules: ModuleCache::new(),
            capabilities: CapabilityCache::new(probe),
        }
    }

    /// Build from `GLLM_DISPATCH_*` / `GLLM_DEVICE`.
    pub fn from_env() -> DispatchResult<Self> {
        Ok(Self::new(DispatchConfig::from_env()?))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }

    pub fn module_path(&self, token: &str) -> PathBuf {
        module_path(&self.config, token)
    }

    pub fn capability(&self) -> DispatchResult<DeviceCapability> {
        self.capabilities.capability(self.config.device_index)
    }

    /// Load the module for `token` ahead of the first dispatch.
    pub fn preload(&self, token: &str) -> DispatchResult<Arc<KernelModule>> {
        self.modules.get_or_load(&self.config, token)
    }

    /// Serve `token` from `module` instead of the on-disk cache.
    pub fn register_module(&self, token: &str, module: KernelModule) -> Arc<KernelModule> {
        self.modules.insert(token, module)
    }

    pub fn act_and_mul(&self, out: &Tensor<'_>, input: &Tensor<'_>, act_mode: &str) -> DispatchResult<()> {
        ops::act_and_mul(self, out, input, act_mode)
    }

    pub fn rmsnorm(
        &self,
        output: &Tensor<'_>,
        input: &Tensor<'_>,
        weight: &Tensor<'_>,
        eps: f64,
    ) -> DispatchResult<()> {
        ops::rmsnorm(self, output, input, weight, eps)
    }

    pub fn batch_decode(&self, params: &BatchDecodeParams<'_>) -> DispatchResult<()> {
        ops::batch_decode(self, params)
    }

    pub fn batch_prefill(&self, params: &BatchPrefillParams<'_>) -> DispatchResult<()> {
        ops::batch_prefill(self, params)
    }

    pub fn matmul<A: TensorAllocator + ?Sized>(
        &self,
        a: &Tensor<'_>,
        b: &Tensor<'_>,
        bias: Option<&Tensor<'_>>,
        allocator: &A,
    ) -> DispatchResult<A::Output> {
        ops::matmul(self, a, b, bias, allocator)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn apply_rope_pos_ids_cos_sin_cache(
        &self,
        q: &Tensor<'_>,
        k: &Tensor<'_>,
        q_rope: &Tensor<'_>,
        k_rope: &Tensor<'_>,
        cos_sin_cache: &Tensor<'_>,
        pos_ids: &Tensor<'_>,
        interleave: bool,
    ) -> DispatchResult<()> {
        ops::apply_rope_pos_ids_cos_sin_cache(self, q, k, q_rope, k_rope, cos_sin_cache, pos_ids, interleave)
    }

    pub fn reshape_paged_cache(
        &self,
        slot_ids: &Tensor<'_>,
        keys: &Tensor<'_>,
        values: &Tensor<'_>,
        key_cache: &Tensor<'_>,
        value_cache: &Tensor<'_>,
    ) -> DispatchResult<()> {
        ops::reshape_paged_cache(self, slot_ids, keys, values, key_cache, value_cache)
    }
}

impl DispatchContext for KernelDispatcher {
    fn resolve(&self, token: &str) -> DispatchResult<Arc<KernelModule>> {
        self.modules.get_or_load(&self.config, token)
    }

    fn enable_pdl(&self) -> DispatchResult<bool> {
        self.capabilities.enable_pdl(self.config.device_index)
    }
}

impl std::fmt::Debug for KernelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDispatcher")
            .field("config", &self.config)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;

    use half::f16;

    use super::*;
    use crate::device::FixedProbe;
    use crate::error::DispatchError;
    use crate::ffi::tvm::{TVMFFIAny, TVMFFISafeCallFn};

    fn dispatcher(major: u32) -> KernelDispatcher {
        let config = DispatchConfig::with_base_dir(std::env::temp_dir().join("gllm-dispatch-none"));
        KernelDispatcher::with_probe(config, Box::new(FixedProbe(DeviceCapability::new(major, 0))))
    }

    #[test]
    fn dispatcher_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KernelDispatcher>();
    }

    unsafe extern "C" fn expect_pdl(
        _handle: *mut c_void,
        args: *const TVMFFIAny,
        num_args: i32,
        _result: *mut TVMFFIAny,
    ) -> i32 {
        let args = std::slice::from_raw_parts(args, num_args as usize);
        // The last argument is the PDL flag; fail unless it is set.
        if args[num_args as usize - 1].value.v_int64 == 1 {
            0
        } else {
            -1
        }
    }

    #[test]
    fn pdl_follows_probed_capability() {
        let out = vec![f16::ZERO; 4];
        let input = vec![f16::ZERO; 8];
        let out_t = Tensor::from_host_slice(&out, &[4]).unwrap();
        let input_t = Tensor::from_host_slice(&input, &[8]).unwrap();

        for (major, ok) in [(9, true), (8, false)] {
            let d = dispatcher(major);
            d.register_module(
                "silu_and_mul",
                KernelModule::from_entries("silu_and_mul", [("silu_and_mul", expect_pdl as TVMFFISafeCallFn)]),
            );
            assert_eq!(d.act_and_mul(&out_t, &input_t, "silu").is_ok(), ok);
        }
    }

    #[test]
    fn module_path_uses_config() {
        let d = dispatcher(9);
        assert!(d
            .module_path("norm")
            .ends_with("0.5.0/80_89_90a/cached_ops/norm/norm.so"));
        assert!(matches!(
            d.preload("norm"),
            Err(DispatchError::ModuleNotFound { .. })
        ));
        assert!(d.modules().is_empty());
    }
}
