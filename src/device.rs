//! Device bootstrap, queue topology, and the submission builder
//!
//! The backend drives one compute queue and two transfer queues. Inter-queue
//! ordering is expressed only through binary semaphores carried by
//! [`Submission`]s; intra-queue ordering is submit order.

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Result, VulkanError};

pub(crate) const TRANSFER_QUEUE_COUNT: usize = 2;

/// Number of batch iterations accumulated before sequences are flushed to
/// their queues.
pub(crate) const SUBMIT_BATCH: usize = 3;

const EXT_16BIT_STORAGE: &CStr = c"VK_KHR_16bit_storage";
const EXT_SHADER_FLOAT16_INT8: &CStr = c"VK_KHR_shader_float16_int8";

/// Backend configuration. The device index may be overridden through the
/// `QUILL_VK_DEVICE` environment variable; `QUILL_VK_NO_PINNED` disables
/// pinned host allocations.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub device_index: usize,
    pub shader_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let device_index = std::env::var("QUILL_VK_DEVICE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Self {
            device_index,
            shader_dir: PathBuf::from("vk_shaders"),
        }
    }
}

/// Shared device context: instance, logical device, allocator.
///
/// Everything that owns device resources holds an `Arc` of this, so the
/// device outlives all buffers, pipelines, and queues. The allocator must
/// be dropped before the device is destroyed.
pub(crate) struct DeviceShared {
    /// Keeps the Vulkan loader alive for the lifetime of the device.
    #[allow(dead_code)]
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    #[allow(dead_code)]
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub device: ash::Device,
    pub fp16: bool,
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
}

impl DeviceShared {
    pub fn min_storage_offset_align(&self) -> usize {
        (self.properties.limits.min_storage_buffer_offset_alignment as usize).max(1)
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Find a queue family with the required flags, preferring one without any
/// of the avoided flags, enough queues, and distinct from the already
/// chosen compute family. Each constraint is relaxed in turn.
pub(crate) fn find_queue_family_index(
    props: &[vk::QueueFamilyProperties],
    required: vk::QueueFlags,
    avoid: vk::QueueFlags,
    compute_index: Option<u32>,
    min_num_queues: u32,
) -> Result<u32> {
    let not_compute = |i: u32| compute_index != Some(i);

    for (i, p) in props.iter().enumerate() {
        if p.queue_count >= min_num_queues
            && not_compute(i as u32)
            && p.queue_flags.intersects(required)
            && !p.queue_flags.intersects(avoid)
        {
            return Ok(i as u32);
        }
    }
    for (i, p) in props.iter().enumerate() {
        if p.queue_count >= min_num_queues
            && not_compute(i as u32)
            && p.queue_flags.intersects(required)
        {
            return Ok(i as u32);
        }
    }
    for (i, p) in props.iter().enumerate() {
        if p.queue_count >= min_num_queues && p.queue_flags.intersects(required) {
            return Ok(i as u32);
        }
    }
    for (i, p) in props.iter().enumerate() {
        if p.queue_flags.intersects(required) {
            return Ok(i as u32);
        }
    }

    warn!("no suitable queue family index found");
    for p in props {
        warn!("queues: {} flags: {:?}", p.queue_count, p.queue_flags);
    }
    Err(VulkanError::NoSuitableQueueFamily)
}

pub(crate) struct BootstrapResult {
    pub shared: Arc<DeviceShared>,
    pub compute_queue_family: u32,
    pub transfer_queue_family: u32,
    /// Number of dedicated transfer queues actually available (0 means the
    /// transfer slots alias the compute queue).
    pub transfer_queue_count: u32,
}

/// Create the instance and logical device, negotiate fp16, and choose the
/// compute and transfer queue families.
pub(crate) fn bootstrap(config: &BackendConfig) -> Result<BootstrapResult> {
    let entry = unsafe { ash::Entry::load()? };

    let app_name = c"quill-vulkan";
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name)
        .application_version(1)
        .api_version(vk::API_VERSION_1_2);

    #[cfg(feature = "validation")]
    let layers = [c"VK_LAYER_KHRONOS_validation".as_ptr()];
    #[cfg(not(feature = "validation"))]
    let layers: [*const std::ffi::c_char; 0] = [];

    let instance_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers);
    let instance = unsafe { entry.create_instance(&instance_info, None)? };

    let physical_devices = unsafe { instance.enumerate_physical_devices()? };
    if physical_devices.is_empty() {
        return Err(VulkanError::NoDevices);
    }
    let physical_device = *physical_devices
        .get(config.device_index)
        .ok_or(VulkanError::InvalidDeviceIndex(config.device_index))?;

    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    info!("using {}", unsafe {
        CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy()
    });

    // fp16 requires both extensions and the shaderFloat16 feature bit.
    let ext_props =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    let mut fp16_storage = false;
    let mut fp16_compute = false;
    for p in &ext_props {
        let name = unsafe { CStr::from_ptr(p.extension_name.as_ptr()) };
        if name == EXT_16BIT_STORAGE {
            fp16_storage = true;
        } else if name == EXT_SHADER_FLOAT16_INT8 {
            fp16_compute = true;
        }
    }
    if !fp16_storage {
        return Err(VulkanError::MissingExtension("VK_KHR_16bit_storage"));
    }

    let mut vk11 = vk::PhysicalDeviceVulkan11Features::default();
    let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vk11)
        .push_next(&mut vk12);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    let fp16 = fp16_storage && fp16_compute && vk12.shader_float16 == vk::TRUE;
    if vk11.storage_buffer16_bit_access != vk::TRUE {
        warn!("device does not support 16-bit storage buffers");
    }

    let queue_family_props =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let compute_queue_family = find_queue_family_index(
        &queue_family_props,
        vk::QueueFlags::COMPUTE,
        vk::QueueFlags::GRAPHICS,
        None,
        1,
    )?;
    let transfer_queue_family = find_queue_family_index(
        &queue_family_props,
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::COMPUTE
            | vk::QueueFlags::GRAPHICS
            | vk::QueueFlags::VIDEO_DECODE_KHR
            | vk::QueueFlags::PROTECTED
            | vk::QueueFlags::OPTICAL_FLOW_NV,
        Some(compute_queue_family),
        TRANSFER_QUEUE_COUNT as u32,
    )?;

    let available = queue_family_props[transfer_queue_family as usize].queue_count;
    let mut transfer_queue_count = TRANSFER_QUEUE_COUNT as u32;
    if transfer_queue_count > available {
        transfer_queue_count = if compute_queue_family == transfer_queue_family {
            available.saturating_sub(1)
        } else {
            available
        };
    }

    for (i, p) in queue_family_props.iter().enumerate() {
        debug!("queue family {}: queues {} flags {:?}", i, p.queue_count, p.queue_flags);
    }
    info!(
        "compute queue family {} transfer queue family {}",
        compute_queue_family, transfer_queue_family
    );

    let priorities = [1.0f32; 1 + TRANSFER_QUEUE_COUNT];
    let mut queue_infos = Vec::new();
    if compute_queue_family != transfer_queue_family {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(compute_queue_family)
                .queue_priorities(&priorities[..1]),
        );
        if transfer_queue_count > 0 {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(transfer_queue_family)
                    .queue_priorities(&priorities[..transfer_queue_count as usize]),
            );
        }
    } else {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(transfer_queue_family)
                .queue_priorities(&priorities[..1 + transfer_queue_count as usize]),
        );
    }

    let mut extensions = vec![EXT_16BIT_STORAGE.as_ptr()];
    if fp16 {
        info!("16-bit kernels enabled");
        extensions.push(EXT_SHADER_FLOAT16_INT8.as_ptr());
    }

    let mut enable_vk11 =
        vk::PhysicalDeviceVulkan11Features::default().storage_buffer16_bit_access(true);
    let mut enable_vk12 = vk::PhysicalDeviceVulkan12Features::default().shader_float16(fp16);

    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut enable_vk11)
        .push_next(&mut enable_vk12);

    let device = unsafe { instance.create_device(physical_device, &device_info, None)? };

    let allocator = Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: Default::default(),
    })?;

    let shared = Arc::new(DeviceShared {
        entry,
        instance,
        physical_device,
        properties,
        device,
        fp16,
        allocator: ManuallyDrop::new(Mutex::new(allocator)),
    });

    Ok(BootstrapResult {
        shared,
        compute_queue_family,
        transfer_queue_family,
        transfer_queue_count,
    })
}

/// One command buffer plus the semaphores its submit waits on and signals.
pub struct Submission {
    pub cmd: vk::CommandBuffer,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// An ordered list of submissions dispatched together on one queue.
pub type Sequence = Vec<Submission>;

struct QueueRing {
    pool: vk::CommandPool,
    cmd_buffers: Vec<vk::CommandBuffer>,
    cmd_buffer_idx: usize,
    semaphores: Vec<vk::Semaphore>,
    semaphore_idx: usize,
}

/// A device queue with a transient command pool and rolling command-buffer
/// and semaphore rings. Only the holder of the internal mutex may submit.
pub struct Queue {
    shared: Arc<DeviceShared>,
    pub family_index: u32,
    pub queue: vk::Queue,
    pub stage_flags: vk::PipelineStageFlags,
    ring: Mutex<QueueRing>,
}

impl Queue {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        family_index: u32,
        queue_index: u32,
        stage_flags: vk::PipelineStageFlags,
    ) -> Result<Arc<Self>> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family_index);
        let pool = unsafe { shared.device.create_command_pool(&pool_info, None)? };
        let queue = unsafe { shared.device.get_device_queue(family_index, queue_index) };

        Ok(Arc::new(Self {
            shared,
            family_index,
            queue,
            stage_flags,
            ring: Mutex::new(QueueRing {
                pool,
                cmd_buffers: Vec::new(),
                cmd_buffer_idx: 0,
                semaphores: Vec::new(),
                semaphore_idx: 0,
            }),
        }))
    }

    pub(crate) fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    /// Take the next command buffer from the ring, allocating on demand.
    pub fn create_cmd_buffer(&self) -> Result<vk::CommandBuffer> {
        let mut ring = self.ring.lock();
        if ring.cmd_buffers.len() > ring.cmd_buffer_idx {
            let buf = ring.cmd_buffers[ring.cmd_buffer_idx];
            ring.cmd_buffer_idx += 1;
            return Ok(buf);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ring.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buf = unsafe { self.shared.device.allocate_command_buffers(&alloc_info)?[0] };
        ring.cmd_buffers.push(buf);
        ring.cmd_buffer_idx += 1;
        Ok(buf)
    }

    /// Take the next semaphore from the ring, creating on demand. Recycled
    /// semaphores are only valid again after `wait_idle` + `cleanup`.
    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut ring = self.ring.lock();
        if ring.semaphores.len() > ring.semaphore_idx {
            let sem = ring.semaphores[ring.semaphore_idx];
            ring.semaphore_idx += 1;
            return Ok(sem);
        }

        let sem = unsafe {
            self.shared
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        ring.semaphores.push(sem);
        ring.semaphore_idx += 1;
        Ok(sem)
    }

    /// Allocate a command buffer and wrap it with wait/signal lists; the
    /// caller records and ends the buffer itself.
    pub fn create_submission(
        &self,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
    ) -> Result<Submission> {
        Ok(Submission {
            cmd: self.create_cmd_buffer()?,
            wait_semaphores,
            signal_semaphores,
        })
    }

    /// Begin a one-time-submit command buffer with empty semaphore lists.
    pub fn begin_submission(&self) -> Result<Submission> {
        let s = self.create_submission(Vec::new(), Vec::new())?;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.shared.device.begin_command_buffer(s.cmd, &begin)? };
        Ok(s)
    }

    pub fn end_submission(
        &self,
        s: &mut Submission,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
    ) -> Result<()> {
        unsafe { self.shared.device.end_command_buffer(s.cmd)? };
        s.wait_semaphores = wait_semaphores;
        s.signal_semaphores = signal_semaphores;
        Ok(())
    }

    /// Batch-submit all pending sequences in one `queue_submit` and clear
    /// the list. The queue mutex is held for the duration of the submit.
    pub fn submit(&self, sequences: &mut Vec<Sequence>, fence: vk::Fence) -> Result<()> {
        if sequences.is_empty() {
            return Ok(());
        }

        let ring = self.ring.lock();
        {
            let mut stage_masks: Vec<Vec<vk::PipelineStageFlags>> = Vec::new();
            for sequence in sequences.iter() {
                for submission in sequence {
                    stage_masks.push(vec![self.stage_flags; submission.wait_semaphores.len()]);
                }
            }

            let mut submit_infos = Vec::new();
            let mut idx = 0;
            for sequence in sequences.iter() {
                for submission in sequence {
                    submit_infos.push(
                        vk::SubmitInfo::default()
                            .wait_semaphores(&submission.wait_semaphores)
                            .wait_dst_stage_mask(&stage_masks[idx])
                            .command_buffers(std::slice::from_ref(&submission.cmd))
                            .signal_semaphores(&submission.signal_semaphores),
                    );
                    idx += 1;
                }
            }

            unsafe { self.shared.device.queue_submit(self.queue, &submit_infos, fence)? };
        }
        drop(ring);

        sequences.clear();
        Ok(())
    }

    /// Submit with a fence and block until the device has drained it.
    pub fn submit_and_wait(&self, sequences: &mut Vec<Sequence>) -> Result<()> {
        let device = &self.shared.device;
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let res = self.submit(sequences, fence).and_then(|()| {
            unsafe { device.wait_for_fences(&[fence], true, u64::MAX)? };
            Ok(())
        });
        unsafe { device.destroy_fence(fence, None) };
        res
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _ring = self.ring.lock();
        unsafe { self.shared.device.queue_wait_idle(self.queue)? };
        Ok(())
    }

    /// Reset both rings and the command pool. Valid only once all work
    /// submitted on this queue has completed (enforce with `wait_idle`).
    pub fn cleanup(&self) -> Result<()> {
        let mut ring = self.ring.lock();
        ring.semaphore_idx = 0;
        unsafe {
            self.shared
                .device
                .reset_command_pool(ring.pool, vk::CommandPoolResetFlags::empty())?
        };
        ring.cmd_buffer_idx = 0;
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let ring = self.ring.get_mut();
        unsafe {
            for sem in ring.semaphores.drain(..) {
                self.shared.device.destroy_semaphore(sem, None);
            }
            self.shared.device.destroy_command_pool(ring.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(count: u32, flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_prefers_dedicated() {
        // 0: graphics+compute, 1: compute-only, 2: transfer-only
        let props = [
            family(1, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(1, vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(2, vk::QueueFlags::TRANSFER),
        ];
        let compute = find_queue_family_index(
            &props,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
            None,
            1,
        )
        .unwrap();
        assert_eq!(compute, 1);

        let transfer = find_queue_family_index(
            &props,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS,
            Some(compute),
            2,
        )
        .unwrap();
        assert_eq!(transfer, 2);
    }

    #[test]
    fn queue_family_falls_back_to_compute_family() {
        // Single all-purpose family: transfer search must relax the
        // compute-family exclusion.
        let props = [family(
            2,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let compute = find_queue_family_index(
            &props,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
            None,
            1,
        )
        .unwrap();
        assert_eq!(compute, 0);

        let transfer = find_queue_family_index(
            &props,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS,
            Some(compute),
            2,
        )
        .unwrap();
        assert_eq!(transfer, 0);
    }

    #[test]
    fn queue_family_ignores_min_count_last() {
        let props = [family(1, vk::QueueFlags::TRANSFER)];
        let idx = find_queue_family_index(
            &props,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::empty(),
            None,
            4,
        )
        .unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn queue_family_error_when_absent() {
        let props = [family(1, vk::QueueFlags::GRAPHICS)];
        assert!(find_queue_family_index(
            &props,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::empty(),
            None,
            1,
        )
        .is_err());
    }
}
