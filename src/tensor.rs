//! Tensor views and their DLPack boundary descriptors.
//!
//! `Tensor` never owns memory. `BoundaryTensor` borrows a `Tensor` and hands a
//! `DLManagedTensorVersioned` to kernel modules; the borrow keeps the
//! descriptor from outliving the memory it describes.

use std::ffi::c_void;
use std::marker::PhantomData;

use crate::dtype::{Element, ScalarType};
use crate::error::{DispatchError, DispatchResult};
use crate::ffi::dlpack::{DLDevice, DLManagedTensorVersioned, DLPackVersion, DLTensor};
use crate::ffi::dlpack::{KDL_CPU, KDL_CUDA, KDL_CUDA_HOST};
use crate::ffi::tvm::{any_dltensor_ptr, TVMFFIAny};

/// Device kind for tensor placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda(u32),
    /// Page-locked host memory visible to CUDA.
    CudaHost,
}

impl DeviceKind {
    pub fn is_host(self) -> bool {
        matches!(self, DeviceKind::Cpu | DeviceKind::CudaHost)
    }

    pub fn to_dl(self) -> DLDevice {
        match self {
            DeviceKind::Cpu => DLDevice {
                device_type: KDL_CPU,
                device_id: 0,
            },
            DeviceKind::Cuda(id) => DLDevice {
                device_type: KDL_CUDA,
                device_id: id as i32,
            },
            DeviceKind::CudaHost => DLDevice {
                device_type: KDL_CUDA_HOST,
                device_id: 0,
            },
        }
    }

    pub fn from_dl(device: DLDevice) -> Option<Self> {
        match device.device_type {
            KDL_CPU => Some(DeviceKind::Cpu),
            KDL_CUDA => u32::try_from(device.device_id).ok().map(DeviceKind::Cuda),
            KDL_CUDA_HOST => Some(DeviceKind::CudaHost),
            _ => None,
        }
    }
}

/// Non-owning strided view over host or device memory.
///
/// A null data pointer marks an undefined tensor, the equivalent of an absent
/// optional argument.
#[derive(Debug, Clone)]
pub struct Tensor<'a> {
    data: *mut c_void,
    shape: Vec<i64>,
    strides: Vec<i64>,
    dtype: ScalarType,
    device: DeviceKind,
    byte_offset: u64,
    _marker: PhantomData<&'a mut [u8]>,
}

fn contiguous_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1].max(1);
    }
    strides
}

/// Element count of `shape`. Negative extents and counts that do not fit in
/// `usize` are shape errors.
fn checked_numel(name: &'static str, shape: &[i64]) -> DispatchResult<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| usize::try_from(d).ok().and_then(|d| acc.checked_mul(d)))
        .ok_or_else(|| DispatchError::shape(name, "non-negative extents with an addressable size", shape))
}

/// Byte size of a `shape` x `dtype` buffer, bounded by `isize::MAX`.
fn checked_bytes(name: &'static str, shape: &[i64], dtype: ScalarType) -> DispatchResult<usize> {
    checked_numel(name, shape)?
        .checked_mul(dtype.size_bytes())
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or_else(|| DispatchError::shape(name, "an addressable byte size", shape))
}

fn check_numel(shape: &[i64], len: usize) -> DispatchResult<()> {
    if checked_numel("host slice", shape)? != len {
        return Err(DispatchError::shape(
            "host slice",
            format!("{len} elements"),
            shape,
        ));
    }
    Ok(())
}

impl<'a> Tensor<'a> {
    pub fn undefined() -> Self {
        Self {
            data: std::ptr::null_mut(),
            shape: Vec::new(),
            strides: Vec::new(),
            dtype: ScalarType::F16,
            device: DeviceKind::Cpu,
            byte_offset: 0,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// `data` must stay valid for the described extent for `'a`.
    pub unsafe fn from_raw_parts(
        data: *mut c_void,
        shape: &[i64],
        strides: &[i64],
        dtype: ScalarType,
        device: DeviceKind,
        byte_offset: u64,
    ) -> Self {
        Self {
            data,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            dtype,
            device,
            byte_offset,
            _marker: PhantomData,
        }
    }

    /// Row-major view.
    ///
    /// # Safety
    /// Same contract as [`Tensor::from_raw_parts`].
    pub unsafe fn contiguous(
        data: *mut c_void,
        shape: &[i64],
        dtype: ScalarType,
        device: DeviceKind,
    ) -> Self {
        Self::from_raw_parts(data, shape, &contiguous_strides(shape), dtype, device, 0)
    }

    pub fn from_host_slice<T: Element>(data: &'a [T], shape: &[i64]) -> DispatchResult<Self> {
        check_numel(shape, data.len())?;
        // SAFETY: the slice outlives the view through `'a`.
        Ok(unsafe {
            Self::contiguous(
                data.as_ptr().cast_mut().cast(),
                shape,
                T::DTYPE,
                DeviceKind::Cpu,
            )
        })
    }

    /// Host view that kernels may write through.
    pub fn from_host_slice_mut<T: Element>(
        data: &'a mut [T],
        shape: &[i64],
    ) -> DispatchResult<Self> {
        check_numel(shape, data.len())?;
        // SAFETY: the exclusive borrow outlives the view through `'a`.
        Ok(unsafe { Self::contiguous(data.as_mut_ptr().cast(), shape, T::DTYPE, DeviceKind::Cpu) })
    }

    #[cfg(feature = "cuda")]
    pub fn from_cuda_slice<T, S>(
        slice: &'a S,
        stream: &'a cudarc::driver::CudaStream,
        shape: &[i64],
    ) -> DispatchResult<Self>
    where
        T: Element,
        S: cudarc::driver::DevicePtr<T> + cudarc::driver::DeviceSlice<T>,
    {
        check_numel(shape, cudarc::driver::DeviceSlice::len(slice))?;
        let ordinal = stream.context().ordinal() as u32;
        let (ptr, _sync) = slice.device_ptr(stream);
        // SAFETY: the device allocation outlives the view through `'a`.
        Ok(unsafe {
            Self::contiguous(ptr as *mut c_void, shape, T::DTYPE, DeviceKind::Cuda(ordinal))
        })
    }

    pub fn is_defined(&self) -> bool {
        !self.data.is_null()
    }

    pub fn data_ptr(&self) -> *mut c_void {
        self.data
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Extent of `dim`; negative values count from the back.
    pub fn size(&self, dim: isize) -> Option<i64> {
        let ndim = self.shape.len() as isize;
        let idx = if dim < 0 { dim + ndim } else { dim };
        if (0..ndim).contains(&idx) {
            Some(self.shape[idx as usize])
        } else {
            None
        }
    }

    /// Copy a 1-D integer tensor to the host as `i64`.
    pub fn to_host_i64(&self) -> DispatchResult<Vec<i64>> {
        if !self.is_defined() {
            return Err(DispatchError::UndefinedTensor("index tensor"));
        }
        if self.ndim() != 1 {
            return Err(DispatchError::shape("index tensor", "1-D", &self.shape));
        }
        let read: fn(&[u8]) -> i64 = match self.dtype {
            ScalarType::I8 => |c| i64::from(c[0] as i8),
            ScalarType::U8 => |c| i64::from(c[0]),
            ScalarType::I32 => |c| i64::from(bytemuck::pod_read_unaligned::<i32>(c)),
            ScalarType::U32 => |c| i64::from(bytemuck::pod_read_unaligned::<u32>(c)),
            ScalarType::I64 => |c| bytemuck::pod_read_unaligned::<i64>(c),
            ScalarType::U64 => |c| bytemuck::pod_read_unaligned::<u64>(c) as i64,
            other => {
                return Err(DispatchError::InvalidArgument {
                    param: "index dtype",
                    value: format!("{other:?}"),
                    allowed: "i8, u8, i32, u32, i64, u64",
                })
            }
        };
        let elem = self.dtype.size_bytes();
        let bytes = self.read_bytes()?;
        Ok(bytes.chunks_exact(elem).map(read).collect())
    }

    /// Raw bytes of a 1-D tensor, gathered in index order.
    fn read_bytes(&self) -> DispatchResult<Vec<u8>> {
        let len = self.shape[0].max(0) as usize;
        let elem = self.dtype.size_bytes();
        let total = checked_bytes("index tensor", &self.shape, self.dtype)?;
        let stride = self.strides.first().copied().unwrap_or(1);
        let base = self.data.cast::<u8>();
        match self.device {
            DeviceKind::Cpu | DeviceKind::CudaHost => {
                let mut out = Vec::with_capacity(total);
                for i in 0..len {
                    let offset = self.byte_offset as isize + (i as isize) * (stride as isize) * elem as isize;
                    // SAFETY: the view contract guarantees the extent is readable.
                    let chunk = unsafe { std::slice::from_raw_parts(base.offset(offset), elem) };
                    out.extend_from_slice(chunk);
                }
                Ok(out)
            }
            DeviceKind::Cuda(ordinal) => {
                if len > 1 && stride != 1 {
                    return Err(DispatchError::shape(
                        "index tensor",
                        "unit stride on device",
                        &self.strides,
                    ));
                }
                let ptr = base as u64 + self.byte_offset;
                copy_device_bytes(ordinal, ptr, total)
            }
        }
    }
}

#[cfg(feature = "cuda")]
fn copy_device_bytes(ordinal: u32, ptr: u64, len: usize) -> DispatchResult<Vec<u8>> {
    use cudarc::driver::{result, CudaContext};

    let ctx = CudaContext::new(ordinal as usize)?;
    ctx.bind_to_thread()?;
    let mut out = vec![0u8; len];
    if len > 0 {
        // SAFETY: the caller's view covers `len` bytes at `ptr` on this device.
        unsafe { result::memcpy_dtoh_sync(&mut out, ptr)? };
    }
    Ok(out)
}

#[cfg(not(feature = "cuda"))]
fn copy_device_bytes(_ordinal: u32, _ptr: u64, _len: usize) -> DispatchResult<Vec<u8>> {
    Err(DispatchError::Cuda(
        "reading device memory requires the `cuda` feature".to_string(),
    ))
}

/// Owned, zero-initialised, 64-byte aligned host buffer.
pub struct HostTensor {
    ptr: *mut u8,
    len_bytes: usize,
    shape: Vec<i64>,
    dtype: ScalarType,
}

unsafe impl Send for HostTensor {}
unsafe impl Sync for HostTensor {}

const HOST_ALIGN: usize = 64;

impl HostTensor {
    pub fn zeros(shape: &[i64], dtype: ScalarType) -> DispatchResult<Self> {
        let len_bytes = checked_bytes("host tensor", shape, dtype)?;
        // Empty tensors still need a non-null, aligned data pointer to count as defined.
        let ptr = if len_bytes == 0 {
            HOST_ALIGN as *mut u8
        } else {
            let layout = std::alloc::Layout::from_size_align(len_bytes, HOST_ALIGN)
                .map_err(|e| DispatchError::Config(format!("layout error: {e}")))?;
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            ptr
        };
        Ok(Self {
            ptr,
            len_bytes,
            shape: shape.to_vec(),
            dtype,
        })
    }

    pub fn from_slice<T: Element>(data: &[T], shape: &[i64]) -> DispatchResult<Self> {
        check_numel(shape, data.len())?;
        let mut tensor = Self::zeros(shape, T::DTYPE)?;
        tensor.as_mut_slice::<T>()?.copy_from_slice(data);
        Ok(tensor)
    }

    /// 1-D tensor of `dtype` holding `values`, narrowed to the element type.
    pub fn from_i64_values(values: &[i64], dtype: ScalarType) -> DispatchResult<Self> {
        let shape = [values.len() as i64];
        match dtype {
            ScalarType::I32 => {
                let narrowed: Vec<i32> = values.iter().map(|&v| v as i32).collect();
                Self::from_slice(&narrowed, &shape)
            }
            ScalarType::U32 => {
                let narrowed: Vec<u32> = values.iter().map(|&v| v as u32).collect();
                Self::from_slice(&narrowed, &shape)
            }
            ScalarType::I64 => Self::from_slice(values, &shape),
            ScalarType::U64 => {
                let widened: Vec<u64> = values.iter().map(|&v| v as u64).collect();
                Self::from_slice(&widened, &shape)
            }
            other => Err(DispatchError::InvalidArgument {
                param: "index dtype",
                value: format!("{other:?}"),
                allowed: "i32, u32, i64, u64",
            }),
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len_bytes == 0 {
            return &[];
        }
        // SAFETY: ptr owns len_bytes initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len_bytes) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.len_bytes == 0 {
            return &mut [];
        }
        // SAFETY: ptr owns len_bytes initialised bytes and `self` is borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len_bytes) }
    }

    pub fn as_slice<T: Element>(&self) -> DispatchResult<&[T]> {
        self.check_element::<T>()?;
        Ok(bytemuck::cast_slice(self.as_bytes()))
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> DispatchResult<&mut [T]> {
        self.check_element::<T>()?;
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    fn check_element<T: Element>(&self) -> DispatchResult<()> {
        if T::DTYPE != self.dtype {
            return Err(DispatchError::InvalidArgument {
                param: "element type",
                value: format!("{:?}", T::DTYPE),
                allowed: "the tensor's own dtype",
            });
        }
        Ok(())
    }
}

impl Drop for HostTensor {
    fn drop(&mut self) {
        if self.len_bytes > 0 {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.len_bytes, HOST_ALIGN) {
                // SAFETY: allocated in `zeros` with the same layout.
                unsafe { std::alloc::dealloc(self.ptr, layout) };
            }
        }
    }
}

impl std::fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// Tensor that owns its storage and can lend a view.
pub trait OwnedTensor: Send {
    fn view(&self) -> Tensor<'_>;
}

impl OwnedTensor for HostTensor {
    fn view(&self) -> Tensor<'_> {
        // SAFETY: the view borrows `self`, which owns the allocation.
        unsafe { Tensor::contiguous(self.ptr.cast(), &self.shape, self.dtype, DeviceKind::Cpu) }
    }
}

/// Allocates output tensors for operations that return a fresh result.
pub trait TensorAllocator {
    type Output: OwnedTensor;

    fn alloc(
        &self,
        shape: &[i64],
        dtype: ScalarType,
        device: DeviceKind,
    ) -> DispatchResult<Self::Output>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostAllocator;

impl TensorAllocator for HostAllocator {
    type Output = HostTensor;

    fn alloc(
        &self,
        shape: &[i64],
        dtype: ScalarType,
        device: DeviceKind,
    ) -> DispatchResult<HostTensor> {
        if !device.is_host() {
            return Err(DispatchError::InvalidArgument {
                param: "allocation device",
                value: format!("{device:?}"),
                allowed: "cpu, cuda host",
            });
        }
        HostTensor::zeros(shape, dtype)
    }
}

#[cfg(feature = "cuda")]
pub use self::cuda_alloc::{CudaAllocator, CudaTensor};

#[cfg(feature = "cuda")]
mod cuda_alloc {
    use std::sync::Arc;

    use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DevicePtr};

    use super::*;

    /// Zeroed device buffer owned on a CUDA stream.
    pub struct CudaTensor {
        buf: CudaSlice<u8>,
        stream: Arc<CudaStream>,
        shape: Vec<i64>,
        dtype: ScalarType,
        ordinal: u32,
    }

    impl OwnedTensor for CudaTensor {
        fn view(&self) -> Tensor<'_> {
            let (ptr, _sync) = self.buf.device_ptr(&self.stream);
            // SAFETY: the view borrows `self`, which owns the device allocation.
            unsafe {
                Tensor::contiguous(
                    ptr as *mut c_void,
                    &self.shape,
                    self.dtype,
                    DeviceKind::Cuda(self.ordinal),
                )
            }
        }
    }

    pub struct CudaAllocator {
        stream: Arc<CudaStream>,
        ordinal: u32,
    }

    impl CudaAllocator {
        pub fn new(ordinal: usize) -> DispatchResult<Self> {
            let ctx = CudaContext::new(ordinal)?;
            Ok(Self {
                stream: ctx.default_stream(),
                ordinal: ordinal as u32,
            })
        }
    }

    impl TensorAllocator for CudaAllocator {
        type Output = CudaTensor;

        fn alloc(
            &self,
            shape: &[i64],
            dtype: ScalarType,
            device: DeviceKind,
        ) -> DispatchResult<CudaTensor> {
            if device != DeviceKind::Cuda(self.ordinal) {
                return Err(DispatchError::InvalidArgument {
                    param: "allocation device",
                    value: format!("{device:?}"),
                    allowed: "the allocator's cuda device",
                });
            }
            let bytes = checked_bytes("cuda tensor", shape, dtype)?.max(1);
            let buf = self.stream.alloc_zeros::<u8>(bytes)?;
            Ok(CudaTensor {
                buf,
                stream: Arc::clone(&self.stream),
                shape: shape.to_vec(),
                dtype,
                ordinal: self.ordinal,
            })
        }
    }
}

/// Heap block holding a versioned descriptor with its shape and stride
/// storage. `manager_ctx` points back at the block.
struct ManagedBlock {
    managed: DLManagedTensorVersioned,
    shape: Box<[i64]>,
    strides: Box<[i64]>,
}

impl ManagedBlock {
    fn new(template: DLTensor, mut shape: Box<[i64]>, mut strides: Box<[i64]>) -> Box<Self> {
        let mut block = Box::new(Self {
            managed: DLManagedTensorVersioned {
                version: DLPackVersion::CURRENT,
                manager_ctx: std::ptr::null_mut(),
                deleter: Some(free_managed_block),
                flags: 0,
                dl_tensor: DLTensor {
                    ndim: shape.len() as i32,
                    shape: shape.as_mut_ptr(),
                    strides: strides.as_mut_ptr(),
                    ..template
                },
            },
            shape,
            strides,
        });
        block.managed.manager_ctx = (&mut *block as *mut ManagedBlock).cast();
        block
    }
}

/// Deleter of exported descriptors: frees the block that owns them.
unsafe extern "C" fn free_managed_block(managed: *mut DLManagedTensorVersioned) {
    if !managed.is_null() {
        drop(Box::from_raw((*managed).manager_ctx.cast::<ManagedBlock>()));
    }
}

/// DLPack descriptor for one tensor argument of one call.
///
/// Borrows the viewed tensor, so neither the descriptor nor any copy exported
/// from it can be built for memory that is already gone.
pub struct BoundaryTensor<'t> {
    block: Box<ManagedBlock>,
    _marker: PhantomData<&'t ()>,
}

impl<'t> BoundaryTensor<'t> {
    /// Plain `DLTensor*` view, valid while `self` lives.
    pub fn as_dltensor_ptr(&self) -> *const DLTensor {
        &self.block.managed.dl_tensor
    }

    pub fn as_any(&self) -> TVMFFIAny {
        any_dltensor_ptr(self.as_dltensor_ptr())
    }

    /// Versioned descriptor owned by whoever receives it.
    ///
    /// Shape and strides are copied into the returned block, which is freed
    /// by its `deleter`. The data pointer is still borrowed for `'t`.
    pub fn export(&self) -> *mut DLManagedTensorVersioned {
        let dl = self.block.managed.dl_tensor;
        let block = ManagedBlock::new(dl, self.block.shape.clone(), self.block.strides.clone());
        let raw = Box::into_raw(block);
        // SAFETY: `raw` is a live, uniquely owned block.
        unsafe { std::ptr::addr_of_mut!((*raw).managed) }
    }
}

impl std::fmt::Debug for BoundaryTensor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryTensor")
            .field("dl_tensor", &self.block.managed.dl_tensor)
            .finish()
    }
}

/// Wrap `tensor` in a DLPack descriptor without copying data.
///
/// `name` identifies the argument in the error raised for undefined tensors.
pub fn to_boundary<'t>(tensor: &'t Tensor<'_>, name: &'static str) -> DispatchResult<BoundaryTensor<'t>> {
    if !tensor.is_defined() {
        return Err(DispatchError::UndefinedTensor(name));
    }
    let template = DLTensor {
        data: tensor.data,
        device: tensor.device.to_dl(),
        ndim: 0,
        dtype: tensor.dtype.to_dl(),
        shape: std::ptr::null_mut(),
        strides: std::ptr::null_mut(),
        byte_offset: tensor.byte_offset,
    };
    Ok(BoundaryTensor {
        block: ManagedBlock::new(
            template,
            tensor.shape.clone().into_boxed_slice(),
            tensor.strides.clone().into_boxed_slice(),
        ),
        _marker: PhantomData,
    })
}

/// Rebuild a view from a DLPack tensor.
///
/// # Safety
/// `dl` must point to a valid `DLTensor` whose memory outlives `'a`.
pub unsafe fn from_boundary<'a>(dl: *const DLTensor) -> DispatchResult<Tensor<'a>> {
    let dl = &*dl;
    let dtype = ScalarType::from_dl(dl.dtype).ok_or_else(|| DispatchError::InvalidArgument {
        param: "dlpack dtype",
        value: format!("{:?}", dl.dtype),
        allowed: "scalar types with one lane",
    })?;
    let device = DeviceKind::from_dl(dl.device).ok_or_else(|| DispatchError::InvalidArgument {
        param: "dlpack device",
        value: format!("{:?}", dl.device),
        allowed: "cpu, cuda, cuda host",
    })?;
    let ndim = dl.ndim.max(0) as usize;
    let shape: Vec<i64> = if ndim == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(dl.shape, ndim).to_vec()
    };
    let strides = if ndim == 0 {
        Vec::new()
    } else if dl.strides.is_null() {
        contiguous_strides(&shape)
    } else {
        std::slice::from_raw_parts(dl.strides, ndim).to_vec()
    };
    Ok(Tensor::from_raw_parts(
        dl.data,
        &shape,
        &strides,
        dtype,
        device,
        dl.byte_offset,
    ))
}
