//! Vulkan compute backend for the quill tensor library
//!
//! The host builds a graph of tensors; for every node tagged with the GPU
//! backend it calls [`VulkanBackend::compute_forward`], which offloads
//! matrix multiplication and elementwise multiplication to a
//! Vulkan-capable device. Everything the backend owns (device, queues,
//! pipelines, buffer pool, pinned-memory registry) lives in the
//! [`VulkanBackend`] handle.

mod buffer;
mod device;
mod error;
mod ops;
mod pipeline;
mod tensor;
mod transfer;

#[cfg(feature = "self-test")]
mod selftest;

use std::sync::Arc;

use ash::vk;
use log::{debug, warn};

use gpu_allocator::MemoryLocation;

pub use buffer::{Buffer, BufferPool, PinnedRegistry, SubBuffer};
pub use device::{BackendConfig, Queue, Sequence, Submission};
pub use error::{Result, VulkanError};
pub use pipeline::{DescriptorPoolMode, MatmulSize};
pub use tensor::{
    dequantize_row_q4_0, quantize_row_q4_0, Backend, BlockQ4_0, ComputeParams, DType, Op,
    TaskPhase, Tensor, TensorData,
};

use device::{DeviceShared, TRANSFER_QUEUE_COUNT};
use pipeline::Pipelines;

/// The backend handle: one device, its queues, pipelines, buffer pool, and
/// pinned-host registry. Initialized once, passed explicitly to every
/// entry point, torn down once on drop.
pub struct VulkanBackend {
    pipelines: Pipelines,
    compute_queue: Arc<Queue>,
    transfer_queues: [Arc<Queue>; TRANSFER_QUEUE_COUNT],
    pool: BufferPool,
    pinned: PinnedRegistry,
    shared: Arc<DeviceShared>,
}

impl VulkanBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let boot = device::bootstrap(&config)?;
        let shared = boot.shared;

        let pipelines = Pipelines::load(&shared, &config.shader_dir)?;

        let compute_queue = Queue::new(
            shared.clone(),
            boot.compute_queue_family,
            0,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
        )?;

        // If the transfer family is the compute family, queue 0 belongs to
        // compute and transfer uses the following indices. With no spare
        // queues the transfer slots alias the compute queue.
        let queue_index_offset =
            if boot.compute_queue_family == boot.transfer_queue_family { 1 } else { 0 };
        let make_transfer = |i: u32| -> Result<Arc<Queue>> {
            if boot.transfer_queue_count > 0 {
                Queue::new(
                    shared.clone(),
                    boot.transfer_queue_family,
                    queue_index_offset + (i % boot.transfer_queue_count),
                    vk::PipelineStageFlags::TRANSFER,
                )
            } else {
                Ok(compute_queue.clone())
            }
        };
        let transfer_queues = [make_transfer(0)?, make_transfer(1)?];

        let pool = BufferPool::new(shared.clone());
        let pinned = PinnedRegistry::new();

        Ok(Self {
            pipelines,
            compute_queue,
            transfer_queues,
            pool,
            pinned,
            shared,
        })
    }

    pub fn device_name(&self) -> String {
        self.shared.device_name()
    }

    pub fn fp16_support(&self) -> bool {
        self.shared.fp16
    }

    /// Allocate pinned host memory: a host-visible, host-cached device
    /// buffer whose mapping is handed to the host as an ordinary pointer.
    /// Transfers from or to it skip the staging copy. Returns `None` when
    /// pinning is disabled via `QUILL_VK_NO_PINNED` or the allocation has
    /// no host mapping; the caller then falls back to plain memory.
    pub fn host_malloc(&self, size: usize) -> Option<*mut u8> {
        if std::env::var_os("QUILL_VK_NO_PINNED").is_some() {
            return None;
        }

        let buf = match Buffer::new(&self.shared, size, MemoryLocation::GpuToCpu) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(
                    "failed to allocate {:.2} MB of pinned memory: {err}",
                    size as f64 / 1024.0 / 1024.0
                );
                return None;
            }
        };
        let Some(ptr) = buf.host_ptr() else {
            warn!(
                "failed to allocate {:.2} MB of pinned memory: no host mapping",
                size as f64 / 1024.0 / 1024.0
            );
            return None;
        };

        self.pinned.insert(ptr, size, buf);
        Some(ptr)
    }

    /// Release a pointer previously returned by [`host_malloc`].
    ///
    /// [`host_malloc`]: VulkanBackend::host_malloc
    pub fn host_free(&self, ptr: *mut u8) {
        if self.pinned.remove(ptr).is_none() {
            warn!("host_free: pointer not in the pinned registry");
        }
    }

    /// Upload a 2-D host tensor into a fresh device buffer and re-backend
    /// the tensor: its data becomes a device-buffer handle and its backend
    /// becomes GPU. Higher-rank weights are unsupported.
    pub fn transform_tensor(&self, data: *mut u8, tensor: &mut Tensor) -> Result<()> {
        assert!(tensor.ne[2] == 1 && tensor.ne[3] == 1);

        let size = tensor.dtype.row_size(tensor.elem_count() as usize);
        let buf = Buffer::new(&self.shared, size, MemoryLocation::GpuOnly)?;
        debug!("transform_tensor: uploading {size} bytes");

        tensor.data = TensorData::Host(data);
        let tr0q = &self.transfer_queues[0];
        let mut seqs = vec![transfer::h2d_tensor_2d(
            &buf,
            0,
            tensor,
            0,
            0,
            tr0q,
            &self.pinned,
            Vec::new(),
            Vec::new(),
            None,
        )?];
        tr0q.submit(&mut seqs, vk::Fence::null())?;
        tr0q.wait_idle()?;

        tensor.data = TensorData::Device(buf);
        tensor.backend = Backend::Gpu;
        Ok(())
    }

    /// Drop the device buffer installed by [`transform_tensor`].
    ///
    /// [`transform_tensor`]: VulkanBackend::transform_tensor
    pub fn free_data(&self, tensor: &mut Tensor) {
        if tensor.backend != Backend::Gpu {
            return;
        }
        if tensor.device_buffer().is_some() {
            tensor.data = TensorData::None;
        }
    }

    /// Allocate a device-local buffer outside the pool.
    pub fn create_buffer(&self, size: usize) -> Result<Arc<Buffer>> {
        Buffer::new(&self.shared, size, MemoryLocation::GpuOnly)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Synchronous write of `data` into `dst` at `offset`.
    pub fn buffer_write(&self, dst: &Arc<Buffer>, offset: usize, data: &[u8]) -> Result<()> {
        transfer::buffer_write(
            dst,
            offset,
            data.as_ptr(),
            data.len(),
            &self.transfer_queues[0],
            &self.pinned,
        )
    }

    /// Synchronous read of `out.len()` bytes from `src` at `offset`.
    pub fn buffer_read(&self, src: &Arc<Buffer>, offset: usize, out: &mut [u8]) -> Result<()> {
        transfer::buffer_read(
            src,
            offset,
            out.as_mut_ptr(),
            out.len(),
            &self.transfer_queues[0],
            &self.pinned,
        )
    }

    /// Synchronous 2-D write with row pitch padded to `align` bytes; the
    /// padded columns read back as zero.
    #[allow(clippy::too_many_arguments)]
    pub fn buffer_write_2d_zeropad(
        &self,
        dst: &Arc<Buffer>,
        offset: usize,
        data: &[u8],
        spitch: usize,
        width: usize,
        height: usize,
        align: usize,
    ) -> Result<()> {
        let tr0q = &self.transfer_queues[0];
        let seq = transfer::buffer_write_2d_async_zeropad(
            dst,
            offset,
            data.as_ptr(),
            spitch,
            width,
            height,
            align,
            tr0q,
            &self.pinned,
            Vec::new(),
            Vec::new(),
        )?;
        tr0q.submit_and_wait(&mut vec![seq])
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.device_wait_idle().ok();
        }
        self.pool.clear();
        self.pinned.clear();
    }
}
