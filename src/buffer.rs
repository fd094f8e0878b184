//! Device buffers, the recycling pool, and the pinned-host registry

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use log::warn;
use parking_lot::Mutex;

use crate::device::{DeviceShared, Queue};
use crate::error::Result;

/// Fixed capacity of the recycling pool.
pub(crate) const MAX_POOL_BUFFERS: usize = 256;

#[derive(Default)]
struct StagingBuffers {
    write: Option<Arc<Buffer>>,
    read: Option<Arc<Buffer>>,
}

/// A device allocation with optional lazily-created staging siblings and a
/// record of the queue family that last acquired ownership.
///
/// The mapped host pointer is non-null exactly when the memory location is
/// host-visible. It is only dereferenced from the thread driving an op.
pub struct Buffer {
    shared: Arc<DeviceShared>,
    pub buffer: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
    pub location: MemoryLocation,
    pub size: usize,
    host_ptr: Option<NonNull<u8>>,
    staging: Mutex<StagingBuffers>,
    qf_owner: AtomicU32,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(
        shared: &Arc<DeviceShared>,
        size: usize,
        location: MemoryLocation,
    ) -> Result<Arc<Self>> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as u64)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { shared.device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { shared.device.get_buffer_memory_requirements(buffer) };
        let allocation = shared.allocator.lock().allocate(&AllocationCreateDesc {
            name: "quill_buffer",
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            shared
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?
        };

        let host_ptr = allocation.mapped_ptr().map(|p| p.cast());

        Ok(Arc::new(Self {
            shared: shared.clone(),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            location,
            size,
            host_ptr,
            staging: Mutex::new(StagingBuffers::default()),
            qf_owner: AtomicU32::new(vk::QUEUE_FAMILY_IGNORED),
        }))
    }

    pub fn host_visible(&self) -> bool {
        self.host_ptr.is_some()
    }

    pub fn host_ptr(&self) -> Option<*mut u8> {
        self.host_ptr.map(|p| p.as_ptr())
    }

    pub(crate) fn qf_owner(&self) -> u32 {
        self.qf_owner.load(Ordering::Relaxed)
    }

    pub(crate) fn set_qf_owner(&self, family: u32) {
        self.qf_owner.store(family, Ordering::Relaxed);
    }

    /// Host-visible sibling used to stage writes into this buffer.
    pub(crate) fn write_staging(&self) -> Result<Arc<Buffer>> {
        let mut staging = self.staging.lock();
        if let Some(b) = &staging.write {
            return Ok(b.clone());
        }
        let b = Buffer::new(&self.shared, self.size, MemoryLocation::CpuToGpu)?;
        staging.write = Some(b.clone());
        Ok(b)
    }

    /// Host-visible, host-cached sibling used to stage reads out.
    pub(crate) fn read_staging(&self) -> Result<Arc<Buffer>> {
        let mut staging = self.staging.lock();
        if let Some(b) = &staging.read {
            return Ok(b.clone());
        }
        let b = Buffer::new(&self.shared, self.size, MemoryLocation::GpuToCpu)?;
        staging.read = Some(b.clone());
        Ok(b)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            if let Err(err) = self.shared.allocator.lock().free(allocation) {
                warn!("failed to free buffer allocation: {err}");
            }
        }
        unsafe { self.shared.device.destroy_buffer(self.buffer, None) };
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Buffer {{ size: {}, location: {:?}, qf_owner: {} }}",
            self.size,
            self.location,
            self.qf_owner()
        )
    }
}

/// A (buffer, offset, size) view used for argument passing; owns nothing
/// beyond a reference to the buffer.
#[derive(Clone)]
pub struct SubBuffer {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub size: u64,
}

impl SubBuffer {
    pub fn whole(buffer: &Arc<Buffer>) -> Self {
        Self {
            buffer: buffer.clone(),
            offset: 0,
            size: buffer.size as u64,
        }
    }

    pub fn new(buffer: &Arc<Buffer>, offset: u64, size: u64) -> Self {
        Self {
            buffer: buffer.clone(),
            offset,
            size,
        }
    }
}

/// Emit buffer-memory barriers for the given views on `q`'s command buffer.
///
/// A buffer whose recorded owner differs from `q`'s family gets a
/// queue-family-ownership transfer barrier and its owner record is updated;
/// otherwise a plain barrier is emitted only when `force_sync` is set.
pub(crate) fn sync_buffers(
    cmd: vk::CommandBuffer,
    buffers: &[SubBuffer],
    q: &Queue,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    force_sync: bool,
) {
    let mut barriers = Vec::new();

    for sub in buffers {
        let owner = sub.buffer.qf_owner();
        if owner != vk::QUEUE_FAMILY_IGNORED && owner != q.family_index {
            sub.buffer.set_qf_owner(q.family_index);
            barriers.push(
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(owner)
                    .dst_queue_family_index(q.family_index)
                    .buffer(sub.buffer.buffer)
                    .offset(sub.offset)
                    .size(sub.size),
            );
        } else if force_sync {
            barriers.push(
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(sub.buffer.buffer)
                    .offset(sub.offset)
                    .size(sub.size),
            );
        }
    }

    if barriers.is_empty() {
        return;
    }

    unsafe {
        q.device().cmd_pipeline_barrier(
            cmd,
            q.stage_flags,
            q.stage_flags,
            vk::DependencyFlags::empty(),
            &[],
            &barriers,
            &[],
        );
    }
}

/// Pick the best-fit slot (smallest free buffer that fits) and the worst
/// slot (largest free buffer) in one scan.
fn scan_slots(sizes: &[Option<usize>], request: usize) -> (Option<usize>, Option<usize>) {
    let mut best: Option<(usize, usize)> = None;
    let mut worst: Option<(usize, usize)> = None;
    for (i, size) in sizes.iter().enumerate() {
        let Some(size) = *size else { continue };
        if size >= request && best.map_or(true, |(_, s)| size < s) {
            best = Some((i, size));
        }
        if worst.map_or(true, |(_, s)| size > s) {
            worst = Some((i, size));
        }
    }
    (best.map(|(i, _)| i), worst.map(|(i, _)| i))
}

/// Fixed-capacity pool of recyclable device-local buffers, best-fit by
/// size. On a full miss the largest free buffer is destroyed to reclaim
/// memory before a fresh allocation.
pub struct BufferPool {
    shared: Arc<DeviceShared>,
    slots: Mutex<Vec<Option<Arc<Buffer>>>>,
    allocations: AtomicUsize,
}

impl BufferPool {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        let mut slots = Vec::with_capacity(MAX_POOL_BUFFERS);
        slots.resize_with(MAX_POOL_BUFFERS, || None);
        Self {
            shared,
            slots: Mutex::new(slots),
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn malloc(&self, size: usize) -> Result<Arc<Buffer>> {
        let mut slots = self.slots.lock();

        let sizes: Vec<Option<usize>> = slots
            .iter()
            .map(|s| s.as_ref().map(|b| b.size))
            .collect();
        let (best, worst) = scan_slots(&sizes, size);

        if let Some(i) = best {
            if let Some(buf) = slots[i].take() {
                return Ok(buf);
            }
        }
        if let Some(i) = worst {
            // No free buffer fits; destroy the largest to reclaim memory.
            slots[i] = None;
        }
        drop(slots);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Buffer::new(&self.shared, size, MemoryLocation::GpuOnly)
    }

    pub fn free(&self, buffer: Arc<Buffer>) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                // Reset the owner so the next use needs no ownership barrier.
                buffer.set_qf_owner(vk::QUEUE_FAMILY_IGNORED);
                *slot = Some(buffer);
                return;
            }
        }
        warn!("buffer pool full, dropping buffer of {} bytes", buffer.size);
    }

    /// Number of fresh device allocations made through the pool.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }
}

/// Host allocations backed by host-visible device memory, keyed by start
/// address for range lookup.
pub struct PinnedRegistry {
    entries: Mutex<BTreeMap<usize, (usize, Arc<Buffer>)>>,
}

impl PinnedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, ptr: *mut u8, size: usize, buffer: Arc<Buffer>) {
        self.entries.lock().insert(ptr as usize, (size, buffer));
    }

    /// Find the pinned buffer containing `ptr`, returning it with the byte
    /// offset of `ptr` inside the buffer.
    pub(crate) fn lookup(&self, ptr: *const u8) -> Option<(Arc<Buffer>, usize)> {
        let addr = ptr as usize;
        let entries = self.entries.lock();
        let (&start, (size, buffer)) = entries.range(..=addr).next_back()?;
        if addr < start + size {
            Some((buffer.clone(), addr - start))
        } else {
            None
        }
    }

    pub(crate) fn remove(&self, ptr: *const u8) -> Option<Arc<Buffer>> {
        let addr = ptr as usize;
        let mut entries = self.entries.lock();
        let (&start, &(size, _)) = entries.range(..=addr).next_back()?;
        if addr < start + size {
            entries.remove(&start).map(|(_, b)| b)
        } else {
            None
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_picks_smallest_fit() {
        let sizes = [Some(4096), None, Some(1024), Some(2048)];
        let (best, worst) = scan_slots(&sizes, 1000);
        assert_eq!(best, Some(2));
        assert_eq!(worst, Some(0));
    }

    #[test]
    fn scan_reports_eviction_victim_on_miss() {
        let sizes = [Some(512), Some(256)];
        let (best, worst) = scan_slots(&sizes, 1024);
        assert_eq!(best, None);
        assert_eq!(worst, Some(0));
    }

    #[test]
    fn scan_empty_pool() {
        let sizes = [None, None];
        assert_eq!(scan_slots(&sizes, 16), (None, None));
    }

    #[test]
    fn scan_exact_fit_wins_over_larger() {
        let sizes = [Some(2048), Some(1024)];
        let (best, _) = scan_slots(&sizes, 1024);
        assert_eq!(best, Some(1));
    }
}
