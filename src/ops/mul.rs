//! Elementwise broadcast multiply
//!
//! `dst = src0 * src1` for f32 tensors, with src1 already resident on the
//! device (the host uploads scale tensors once and reuses them). src1's
//! outer dimensions broadcast over src0's.

use ash::vk;
use bytemuck::bytes_of;

use crate::buffer::{sync_buffers, SubBuffer};
use crate::device::Sequence;
use crate::error::Result;
use crate::tensor::{Backend, DType, Tensor};
use crate::transfer::{align_size, buffer_read_async, h2d_tensor_2d};
use crate::VulkanBackend;

/// Push constants of the `mul_f32` kernel: row shape, row strides, and
/// per-operand element offsets.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MulParams {
    pub ncols: i32,
    pub nrows: i32,
    pub stride_x: i32,
    pub stride_y: i32,
    pub stride_d: i32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub offset_d: i32,
}

/// First src1 row used by batch `(i3, i2)` under broadcast.
pub(crate) fn broadcast_row(i3: i64, i2: i64, ne13: i64, ne12: i64, ne11: i64) -> i64 {
    (i3 % ne13) * ne12 * ne11 + (i2 % ne12) * ne11
}

impl VulkanBackend {
    pub(crate) fn mul(&self, src0: &Tensor, src1: &Tensor, dst: &Tensor) -> Result<()> {
        assert!(
            src0.dtype == DType::F32 && src1.dtype == DType::F32 && dst.dtype == DType::F32
        );
        self.mul_f32(src0, src1, dst)
    }

    fn mul_f32(&self, src0: &Tensor, src1: &Tensor, dst: &Tensor) -> Result<()> {
        assert_eq!(src1.backend, Backend::Gpu);

        let ne00 = src0.ne[0];
        let ne01 = src0.ne[1];
        let ne02 = src0.ne[2];
        let ne03 = src0.ne[3];
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let ne12 = src1.ne[2];
        let ne13 = src1.ne[3];
        let nb10 = src1.nb[0];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        assert_eq!(nb10, 4);

        let batch_ne = (ne00 * ne01) as usize;
        let buf_sz = align_size(4 * batch_ne, self.shared.min_storage_offset_align());
        let batches = (ne02 * ne03) as usize;

        let d_y = src1
            .device_buffer()
            .expect("GPU tensor without a device buffer")
            .clone();
        let d_x = self.pool.malloc(buf_sz * batches)?;
        let d_d = self.pool.malloc(buf_sz * batches)?;

        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();

        self.pipelines.mul_f32.allocate_descriptor_sets(batches)?;

        let compq = &self.compute_queue;
        let tr0q = &self.transfer_queues[0];
        let tr1q = &self.transfer_queues[1];

        let multi_batch = ne03 > 1 || ne02 > 1;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it = (i03 * ne02 + i02) as usize;
                let i1 = broadcast_row(i03, i02, ne13, ne12, ne11);
                let pc = MulParams {
                    ncols: ne00 as i32,
                    nrows: ne01 as i32,
                    stride_x: ne00 as i32,
                    stride_y: ne00 as i32,
                    stride_d: ne00 as i32,
                    offset_x: 0,
                    offset_y: (i1 * ne10) as i32,
                    offset_d: 0,
                };

                let d_ptr = unsafe {
                    dst.host_ptr()
                        .expect("mul destination must be a host tensor")
                        .add(i02 as usize * nb2 + i03 as usize * nb3)
                };

                if multi_batch {
                    let buf_offset = buf_sz * it;

                    let s_x = compq.create_semaphore()?;
                    let s_mm = compq.create_semaphore()?;

                    transfer_0_seqs.push(h2d_tensor_2d(
                        &d_x,
                        buf_offset,
                        src0,
                        i03,
                        i02,
                        tr0q,
                        &self.pinned,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                    tr0q.submit(&mut transfer_0_seqs, vk::Fence::null())?;

                    let mut s = compq.begin_submission()?;
                    sync_buffers(
                        s.cmd,
                        &[SubBuffer::whole(&d_x), SubBuffer::whole(&d_y)],
                        compq,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        false,
                    );
                    sync_buffers(
                        s.cmd,
                        &[SubBuffer::whole(&d_d)],
                        compq,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_WRITE,
                        false,
                    );
                    self.pipelines.mul_f32.dispatch(
                        s.cmd,
                        &[
                            SubBuffer::new(&d_x, buf_offset as u64, buf_sz as u64),
                            SubBuffer::whole(&d_y),
                            SubBuffer::new(&d_d, buf_offset as u64, buf_sz as u64),
                        ],
                        bytes_of(&pc),
                        [ne00 as u32, ne01 as u32, 1],
                    );
                    compq.end_submission(&mut s, vec![s_x], vec![s_mm])?;
                    compute_seqs.push(vec![s]);

                    transfer_1_seqs.push(buffer_read_async(
                        &d_d,
                        buf_offset,
                        d_ptr,
                        4 * batch_ne,
                        tr1q,
                        &self.pinned,
                        vec![s_mm],
                        Vec::new(),
                        None,
                    )?);

                    compq.submit(&mut compute_seqs, vk::Fence::null())?;
                    tr1q.submit(&mut transfer_1_seqs, vk::Fence::null())?;
                } else {
                    // Single batch: pack upload, compute, and readback into
                    // one compute-queue command buffer.
                    let mut s = compq.begin_submission()?;
                    h2d_tensor_2d(
                        &d_x,
                        0,
                        src0,
                        i03,
                        i02,
                        compq,
                        &self.pinned,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;

                    sync_buffers(
                        s.cmd,
                        &[SubBuffer::whole(&d_x), SubBuffer::whole(&d_y)],
                        compq,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        true,
                    );
                    sync_buffers(
                        s.cmd,
                        &[SubBuffer::whole(&d_d)],
                        compq,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_WRITE,
                        false,
                    );
                    self.pipelines.mul_f32.dispatch(
                        s.cmd,
                        &[
                            SubBuffer::new(&d_x, 0, buf_sz as u64),
                            SubBuffer::whole(&d_y),
                            SubBuffer::new(&d_d, 0, buf_sz as u64),
                        ],
                        bytes_of(&pc),
                        [ne00 as u32, ne01 as u32, 1],
                    );

                    buffer_read_async(
                        &d_d,
                        0,
                        d_ptr,
                        4 * batch_ne,
                        compq,
                        &self.pinned,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;
                    compq.end_submission(&mut s, Vec::new(), Vec::new())?;
                    compute_seqs.push(vec![s]);

                    compq.submit(&mut compute_seqs, vk::Fence::null())?;
                }
            }
        }

        if multi_batch {
            tr1q.wait_idle()?;
            tr0q.cleanup()?;
            tr1q.cleanup()?;
            compq.cleanup()?;
        } else {
            compq.wait_idle()?;
            compq.cleanup()?;
        }

        self.pipelines.mul_f32.cleanup();

        self.pool.free(d_x);
        self.pool.free(d_d);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_repeats_outer_dims() {
        // src1 shape (_, 32, 1, 1) broadcast over (_, 32, 2, 1): both
        // batches read row 0.
        assert_eq!(broadcast_row(0, 0, 1, 1, 32), 0);
        assert_eq!(broadcast_row(0, 1, 1, 1, 32), 0);
    }

    #[test]
    fn broadcast_indexes_matching_dims() {
        // Matching outer dims: batch (i3, i2) maps to its own row block.
        assert_eq!(broadcast_row(0, 1, 2, 3, 4), 4);
        assert_eq!(broadcast_row(1, 2, 2, 3, 4), 3 * 4 + 2 * 4);
    }

    #[test]
    fn mul_params_layout() {
        assert_eq!(std::mem::size_of::<MulParams>(), 8 * 4);
    }
}
