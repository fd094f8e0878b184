//! Matrix multiplication orchestrators
//!
//! Three paths: plain f32, quantized/f16 through the three-queue pipeline,
//! and the matrix-vector specialization. All batches `(i3, i2)` of a 4-D
//! problem are streamed over the queues with per-batch semaphores; split-K
//! adds a reduction dispatch behind a full barrier.

use ash::vk;
use bytemuck::bytes_of;
use log::debug;

use crate::buffer::{sync_buffers, SubBuffer};
use crate::device::{Queue, Sequence, SUBMIT_BATCH};
use crate::error::{Result, VulkanError};
use crate::pipeline::{ceil_div, MatmulSize, Pipeline};
use crate::tensor::{Backend, DType, Tensor};
use crate::transfer::{align_size, buffer_read_async, h2d_tensor_2d};
use crate::VulkanBackend;

/// Push constants shared by every matmul kernel: problem shape, row
/// strides, and the per-work-group K slice.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatmulParams {
    pub m: i32,
    pub n: i32,
    pub k: i32,
    pub stride_a: i32,
    pub stride_b: i32,
    pub stride_d: i32,
    pub k_split: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SplitKReduceParams {
    pub m: i32,
    pub n: i32,
    pub split_k: i32,
}

/// Push constants of the `f32_to_f16` and `dequant_q4_0` pipelines.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConvertParams {
    pub nrows: i32,
    pub ncols: i32,
    pub stride_src: i32,
    pub stride_dst: i32,
}

/// Push constants of the fused dequantize-matvec kernels.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatVecParams {
    pub ncols: i32,
}

/// Partition K into 4 slices when the reduction is deep but the output
/// tile coverage is low; otherwise keep a single pass.
pub(crate) fn guess_split_k(m: i64, n: i64, k: i64) -> i32 {
    if k > 128 && (m < 128 || n < 128) {
        4
    } else {
        1
    }
}

/// Tile footprint by output extents: 32 and 64 are the cutoffs below which
/// the larger tiles cannot be filled.
pub(crate) fn tile_for(m: i64, n: i64) -> MatmulSize {
    if m <= 32 || n <= 32 {
        MatmulSize::S
    } else if m <= 64 || n <= 64 {
        MatmulSize::M
    } else {
        MatmulSize::L
    }
}

impl VulkanBackend {
    /// Record one matmul (plus the split-K reduction when requested) as a
    /// single compute submission.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn matmul(
        &self,
        pipeline: &Pipeline,
        a: SubBuffer,
        b: SubBuffer,
        d: SubBuffer,
        m: i32,
        n: i32,
        k: i32,
        stride_a: i32,
        stride_b: i32,
        stride_d: i32,
        split_k: i32,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
    ) -> Result<Sequence> {
        let mut s = q.begin_submission()?;
        sync_buffers(
            s.cmd,
            &[a.clone(), b.clone()],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::SHADER_READ,
            false,
        );
        sync_buffers(
            s.cmd,
            &[d.clone()],
            q,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::SHADER_WRITE,
            false,
        );

        if split_k == 1 {
            let pc = MatmulParams {
                m,
                n,
                k,
                stride_a,
                stride_b,
                stride_d,
                k_split: k,
            };
            pipeline.dispatch(s.cmd, &[a, b, d], bytes_of(&pc), [m as u32, n as u32, 1]);
            q.end_submission(&mut s, wait_semaphores, signal_semaphores)?;
            return Ok(vec![s]);
        }

        // First pass writes split_k partial results, the reduction sums
        // them into the first m*n elements of the same buffer.
        let pc = MatmulParams {
            m,
            n,
            k,
            stride_a,
            stride_b,
            stride_d,
            k_split: ceil_div(stride_a as u32, split_k as u32) as i32,
        };
        pipeline.dispatch(
            s.cmd,
            &[a, b, d.clone()],
            bytes_of(&pc),
            [(m * split_k) as u32, n as u32, 1],
        );
        sync_buffers(
            s.cmd,
            &[d.clone()],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            true,
        );
        let pc = SplitKReduceParams { m, n, split_k };
        self.pipelines
            .split_k_reduce
            .dispatch(s.cmd, &[d], bytes_of(&pc), [m as u32, n as u32, 1]);
        q.end_submission(&mut s, wait_semaphores, signal_semaphores)?;
        Ok(vec![s])
    }

    /// Plain f32 × f32 batched matmul over the three-queue pipeline.
    pub(crate) fn mul_mat_f32(&self, src0: &Tensor, src1: &Tensor, dst: &Tensor) -> Result<()> {
        let ne00 = src0.ne[0];
        let ne01 = src0.ne[1];
        let ne02 = src0.ne[2];
        let ne03 = src0.ne[3];
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];
        debug_assert_eq!(ne00, ne10);

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;

        let split_k = guess_split_k(ne01, ne11, ne10);
        let tile = tile_for(ne01, ne11);
        let kpad = align_size(
            ne10 as usize,
            self.pipelines.matmul_f32.get(tile, false).align as usize,
        );
        let pipeline = self
            .pipelines
            .matmul(false, false, tile, ne10 as usize == kpad)?;
        debug!(
            "mul_mat_f32 m={} n={} k={} split_k={} pipeline={}",
            ne01, ne11, ne10, split_k, pipeline.name
        );

        let oa = self.shared.min_storage_offset_align();
        let x_sz = align_size(4 * x_ne, oa);
        let y_sz = align_size(4 * y_ne, oa);
        let d_sz = align_size(4 * d_ne * split_k as usize, oa);

        let batches = (ne02 * ne03) as usize;
        let load_x = src0.backend != Backend::Gpu;

        let d_x = if load_x {
            self.pool.malloc(x_sz * batches)?
        } else {
            src0.device_buffer()
                .expect("GPU tensor without a device buffer")
                .clone()
        };
        let d_y = self.pool.malloc(y_sz * batches)?;
        let d_d = self.pool.malloc(d_sz * batches)?;

        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();

        pipeline.allocate_descriptor_sets(batches)?;
        if split_k > 1 {
            self.pipelines.split_k_reduce.allocate_descriptor_sets(batches)?;
        }

        let compq = &self.compute_queue;
        let tr0q = &self.transfer_queues[0];
        let tr1q = &self.transfer_queues[1];

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it = (i03 * ne02 + i02) as usize;
                let x_offset = if load_x { x_sz * it } else { 0 };
                let y_offset = y_sz * it;
                let d_offset = d_sz * it;

                let s_y = compq.create_semaphore()?;
                let mut mm_semaphores = vec![s_y];
                if load_x {
                    let s_x = compq.create_semaphore()?;
                    mm_semaphores.push(s_x);
                    transfer_0_seqs.push(h2d_tensor_2d(
                        &d_x,
                        x_offset,
                        src0,
                        i03,
                        i02,
                        tr0q,
                        &self.pinned,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                }
                tr0q.submit(&mut transfer_0_seqs, vk::Fence::null())?;

                transfer_1_seqs.push(h2d_tensor_2d(
                    &d_y,
                    y_offset,
                    src1,
                    i03,
                    i02,
                    tr1q,
                    &self.pinned,
                    Vec::new(),
                    vec![s_y],
                    None,
                )?);

                let s_mm = compq.create_semaphore()?;
                compute_seqs.push(self.matmul(
                    pipeline,
                    SubBuffer::new(&d_x, x_offset as u64, x_sz as u64),
                    SubBuffer::new(&d_y, y_offset as u64, y_sz as u64),
                    SubBuffer::new(&d_d, d_offset as u64, d_sz as u64),
                    ne01 as i32,
                    ne11 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne01 as i32,
                    split_k,
                    compq,
                    mm_semaphores,
                    vec![s_mm],
                )?);

                let d_ptr = unsafe {
                    dst.host_ptr()
                        .expect("matmul destination must be a host tensor")
                        .add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                transfer_0_seqs.push(buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    tr0q,
                    &self.pinned,
                    vec![s_mm],
                    Vec::new(),
                    None,
                )?);

                tr1q.submit(&mut transfer_1_seqs, vk::Fence::null())?;
                compq.submit(&mut compute_seqs, vk::Fence::null())?;
            }
        }

        tr0q.submit(&mut transfer_0_seqs, vk::Fence::null())?;
        tr0q.wait_idle()?;

        tr0q.cleanup()?;
        tr1q.cleanup()?;
        compq.cleanup()?;

        pipeline.cleanup();
        self.pipelines.split_k_reduce.cleanup();

        if load_x {
            self.pool.free(d_x);
        }
        self.pool.free(d_y);
        self.pool.free(d_d);
        Ok(())
    }

    /// Quantized / f16 batched matmul. Uploads run on the two transfer
    /// queues, dequantization and the matmul on the compute queue, with
    /// per-batch semaphores and batched submits.
    pub(crate) fn mul_mat_q_f16(&self, src0: &Tensor, src1: &Tensor, dst: &Tensor) -> Result<()> {
        let ne00 = src0.ne[0];
        let ne01 = src0.ne[1];
        let ne02 = src0.ne[2];
        let ne03 = src0.ne[3];
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];
        debug_assert_eq!(ne00, ne10);

        let compq = &self.compute_queue;
        let tr0q = &self.transfer_queues[0];
        let tr1q = &self.transfer_queues[1];

        let f16_f32_kernel = src1.dtype == DType::F32;
        let qx_needs_dequant = src0.dtype != DType::F16;
        let qy_needs_dequant = src1.dtype != DType::F16 && !f16_f32_kernel;
        let dq = qx_needs_dequant || qy_needs_dequant;

        let load_x = src0.backend != Backend::Gpu;
        let load_y = src1.backend != Backend::Gpu;

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;

        let split_k = guess_split_k(ne01, ne11, ne10);
        let tile = tile_for(ne01, ne11);
        let kpad = align_size(
            ne10 as usize,
            self.pipelines.matmul_f32.get(tile, false).align as usize,
        );
        let pipeline = self
            .pipelines
            .matmul(true, !f16_f32_kernel, tile, ne10 as usize == kpad)?;
        debug!(
            "mul_mat_q_f16 m={} n={} k={} split_k={} pipeline={}",
            ne01, ne11, ne10, split_k, pipeline.name
        );

        let oa = self.shared.min_storage_offset_align();
        let qx_sz = align_size(src0.dtype.row_size(x_ne), oa);
        let qy_sz = align_size(src1.dtype.row_size(y_ne), oa);
        let x_sz = align_size(2 * x_ne, oa);
        let y_sz = align_size(if f16_f32_kernel { 4 * y_ne } else { 2 * y_ne }, oa);
        let d_sz = align_size(4 * d_ne * split_k as usize, oa);

        let batches = (ne02 * ne03) as usize;

        let d_qx = if load_x {
            self.pool.malloc(qx_sz * batches)?
        } else {
            src0.device_buffer()
                .expect("GPU tensor without a device buffer")
                .clone()
        };
        let d_qy = if load_y {
            self.pool.malloc(qy_sz * batches)?
        } else {
            src1.device_buffer()
                .expect("GPU tensor without a device buffer")
                .clone()
        };
        let d_x = if qx_needs_dequant {
            self.pool.malloc(x_sz * batches)?
        } else {
            assert_eq!(qx_sz, x_sz);
            d_qx.clone()
        };
        let d_y = if qy_needs_dequant {
            self.pool.malloc(y_sz * batches)?
        } else {
            assert_eq!(qy_sz, y_sz);
            d_qy.clone()
        };
        let d_d = self.pool.malloc(d_sz * batches)?;

        let to_fp16_0 = self.pipelines.to_fp16(src0.dtype);
        let to_fp16_1 = self.pipelines.to_fp16(src1.dtype);
        assert!(!qx_needs_dequant || to_fp16_0.is_some());
        assert!(!qy_needs_dequant || to_fp16_1.is_some());

        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_2_seqs: Vec<Sequence> = Vec::new();

        pipeline.allocate_descriptor_sets(batches)?;
        if qx_needs_dequant {
            if let Some(p) = to_fp16_0 {
                p.allocate_descriptor_sets(batches)?;
            }
        }
        if qy_needs_dequant {
            if let Some(p) = to_fp16_1 {
                p.allocate_descriptor_sets(batches)?;
            }
        }
        if split_k > 1 {
            self.pipelines.split_k_reduce.allocate_descriptor_sets(batches)?;
        }

        let mut submit_counter = 0usize;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it = (i03 * ne02 + i02) as usize;
                let qx_offset = if load_x { qx_sz * it } else { 0 };
                let qy_offset = if load_y { qy_sz * it } else { 0 };
                let x_offset = x_sz * it;
                let y_offset = y_sz * it;
                let d_offset = d_sz * it;

                let s_mm = compq.create_semaphore()?;
                let mut q_semaphores: Vec<vk::Semaphore> = Vec::new();
                let mut mm_semaphores: Vec<vk::Semaphore> = Vec::new();

                submit_counter += 1;

                if load_x {
                    let s_x = tr0q.create_semaphore()?;
                    if qx_needs_dequant {
                        q_semaphores.push(s_x);
                    } else {
                        mm_semaphores.push(s_x);
                    }
                    transfer_0_seqs.push(h2d_tensor_2d(
                        &d_qx,
                        qx_offset,
                        src0,
                        i03,
                        i02,
                        tr0q,
                        &self.pinned,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                }
                if it == 0 || submit_counter >= SUBMIT_BATCH {
                    tr0q.submit(&mut transfer_0_seqs, vk::Fence::null())?;
                }

                if load_y {
                    let s_y = tr1q.create_semaphore()?;
                    if qy_needs_dequant {
                        q_semaphores.push(s_y);
                    } else {
                        mm_semaphores.push(s_y);
                    }
                    transfer_1_seqs.push(h2d_tensor_2d(
                        &d_qy,
                        qy_offset,
                        src1,
                        i03,
                        i02,
                        tr1q,
                        &self.pinned,
                        Vec::new(),
                        vec![s_y],
                        None,
                    )?);
                }
                if it == 0 || submit_counter >= SUBMIT_BATCH {
                    tr1q.submit(&mut transfer_1_seqs, vk::Fence::null())?;
                }

                if dq {
                    let s_q = tr0q.create_semaphore()?;
                    let mut s = compq.begin_submission()?;
                    if qx_needs_dequant {
                        let p = to_fp16_0.ok_or(VulkanError::Fp16Unsupported)?;
                        let pc = ConvertParams {
                            nrows: ne01 as i32,
                            ncols: ne10 as i32,
                            stride_src: ne10 as i32,
                            stride_dst: ne10 as i32,
                        };
                        sync_buffers(
                            s.cmd,
                            &[SubBuffer::new(&d_qx, qx_offset as u64, qx_sz as u64)],
                            compq,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::SHADER_READ,
                            false,
                        );
                        sync_buffers(
                            s.cmd,
                            &[SubBuffer::new(&d_x, x_offset as u64, x_sz as u64)],
                            compq,
                            vk::AccessFlags::SHADER_READ,
                            vk::AccessFlags::SHADER_WRITE,
                            false,
                        );
                        p.dispatch(
                            s.cmd,
                            &[
                                SubBuffer::new(&d_qx, qx_offset as u64, qx_sz as u64),
                                SubBuffer::new(&d_x, x_offset as u64, x_sz as u64),
                            ],
                            bytes_of(&pc),
                            [x_ne as u32, 1, 1],
                        );
                    }
                    if qy_needs_dequant {
                        let p = to_fp16_1.ok_or(VulkanError::Fp16Unsupported)?;
                        let pc = ConvertParams {
                            nrows: ne11 as i32,
                            ncols: ne10 as i32,
                            stride_src: ne10 as i32,
                            stride_dst: ne10 as i32,
                        };
                        sync_buffers(
                            s.cmd,
                            &[SubBuffer::new(&d_qy, qy_offset as u64, qy_sz as u64)],
                            compq,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::SHADER_READ,
                            false,
                        );
                        sync_buffers(
                            s.cmd,
                            &[SubBuffer::new(&d_y, y_offset as u64, y_sz as u64)],
                            compq,
                            vk::AccessFlags::SHADER_READ,
                            vk::AccessFlags::SHADER_WRITE,
                            false,
                        );
                        p.dispatch(
                            s.cmd,
                            &[
                                SubBuffer::new(&d_qy, qy_offset as u64, qy_sz as u64),
                                SubBuffer::new(&d_y, y_offset as u64, y_sz as u64),
                            ],
                            bytes_of(&pc),
                            [y_ne as u32, 1, 1],
                        );
                    }
                    compq.end_submission(&mut s, std::mem::take(&mut q_semaphores), vec![s_q])?;
                    compute_seqs.push(vec![s]);
                    mm_semaphores.push(s_q);
                }

                compute_seqs.push(self.matmul(
                    pipeline,
                    SubBuffer::new(&d_x, x_offset as u64, x_sz as u64),
                    SubBuffer::new(&d_y, y_offset as u64, y_sz as u64),
                    SubBuffer::new(&d_d, d_offset as u64, d_sz as u64),
                    ne01 as i32,
                    ne11 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne01 as i32,
                    split_k,
                    compq,
                    mm_semaphores,
                    vec![s_mm],
                )?);

                if it == 0 || submit_counter >= SUBMIT_BATCH {
                    compq.submit(&mut compute_seqs, vk::Fence::null())?;
                }

                let d_ptr = unsafe {
                    dst.host_ptr()
                        .expect("matmul destination must be a host tensor")
                        .add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                transfer_2_seqs.push(buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    tr0q,
                    &self.pinned,
                    vec![s_mm],
                    Vec::new(),
                    None,
                )?);

                #[cfg(feature = "check-kernels")]
                {
                    tr0q.submit(&mut transfer_2_seqs, vk::Fence::null())?;
                    tr0q.wait_idle()?;
                    let mut chk = vec![0f32; d_ne];
                    crate::transfer::buffer_read(
                        &d_d,
                        d_offset,
                        chk.as_mut_ptr() as *mut u8,
                        4 * d_ne,
                        tr0q,
                        &self.pinned,
                    )?;
                    let out = unsafe { std::slice::from_raw_parts(d_ptr as *const f32, d_ne) };
                    let err = out
                        .iter()
                        .zip(&chk)
                        .map(|(a, b)| (a - b).abs() as f64)
                        .sum::<f64>()
                        / d_ne as f64;
                    if err > 0.01 {
                        log::error!(
                            "matmul verification failed at batch ({i03}, {i02}): avg err {err}"
                        );
                    }
                }

                if it == 0 || submit_counter >= SUBMIT_BATCH {
                    tr0q.submit(&mut transfer_2_seqs, vk::Fence::null())?;
                    submit_counter = 0;
                }
            }
        }

        tr0q.submit(&mut transfer_0_seqs, vk::Fence::null())?;
        tr1q.submit(&mut transfer_1_seqs, vk::Fence::null())?;
        compq.submit(&mut compute_seqs, vk::Fence::null())?;
        tr0q.submit(&mut transfer_2_seqs, vk::Fence::null())?;

        tr0q.wait_idle()?;

        tr0q.cleanup()?;
        tr1q.cleanup()?;
        compq.cleanup()?;

        pipeline.cleanup();
        if qx_needs_dequant {
            if let Some(p) = to_fp16_0 {
                p.cleanup();
            }
        }
        if qy_needs_dequant {
            if let Some(p) = to_fp16_1 {
                p.cleanup();
            }
        }
        self.pipelines.split_k_reduce.cleanup();

        if qx_needs_dequant {
            self.pool.free(d_x);
        }
        if qy_needs_dequant {
            self.pool.free(d_y);
        }
        self.pool.free(d_d);
        if load_x {
            self.pool.free(d_qx);
        }
        if load_y {
            self.pool.free(d_qy);
        }
        Ok(())
    }

    /// N == 1 specialization: fused dequantize + mat-vec on the compute
    /// queue, with upload, dispatch, and readback packed into one command
    /// buffer per batch.
    pub(crate) fn mul_mat_vec_q_f16(
        &self,
        src0: &Tensor,
        src1: &Tensor,
        dst: &Tensor,
    ) -> Result<()> {
        let ne00 = src0.ne[0];
        let ne01 = src0.ne[1];
        let ne02 = src0.ne[2];
        let ne03 = src0.ne[3];
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        assert_eq!(ne11, 1);

        let compq = &self.compute_queue;
        let f16_f32_kernel = src1.dtype == DType::F32;
        let qy_needs_dequant = src1.dtype != DType::F16 && !f16_f32_kernel;

        let load_x = src0.backend != Backend::Gpu;
        let load_y = src1.backend != Backend::Gpu;

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;

        let oa = self.shared.min_storage_offset_align();
        let qx_sz = align_size(src0.dtype.row_size(x_ne), oa);
        let qy_sz = align_size(src1.dtype.row_size(y_ne), oa);
        let y_sz = align_size(if f16_f32_kernel { 4 * y_ne } else { 2 * y_ne }, oa);
        let d_sz = align_size(4 * d_ne, oa);

        let batches = (ne02 * ne03) as usize;

        let d_qx = if load_x {
            self.pool.malloc(qx_sz * batches)?
        } else {
            src0.device_buffer()
                .expect("GPU tensor without a device buffer")
                .clone()
        };
        let d_qy = if load_y {
            self.pool.malloc(qy_sz * batches)?
        } else {
            src1.device_buffer()
                .expect("GPU tensor without a device buffer")
                .clone()
        };
        let d_y = if qy_needs_dequant {
            self.pool.malloc(y_sz * batches)?
        } else {
            assert_eq!(qy_sz, y_sz);
            d_qy.clone()
        };
        let d_d = self.pool.malloc(d_sz * batches)?;

        let to_fp16_1 = self.pipelines.to_fp16(src1.dtype);
        assert!(!qy_needs_dequant || to_fp16_1.is_some());
        let dmmv = self
            .pipelines
            .dequantize_mul_mat_vec(src0.dtype, !f16_f32_kernel)
            .ok_or(VulkanError::Fp16Unsupported)?;
        debug!(
            "mul_mat_vec m={} k={} batches={} pipeline={}",
            ne01, ne00, batches, dmmv.name
        );

        if qy_needs_dequant {
            if let Some(p) = to_fp16_1 {
                p.allocate_descriptor_sets(batches)?;
            }
        }
        dmmv.allocate_descriptor_sets(batches)?;

        let mut seqs: Vec<Sequence> = Vec::new();
        let mut submit_counter = 0usize;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it = (i03 * ne02 + i02) as usize;
                let qx_offset = if load_x { qx_sz * it } else { 0 };
                let qy_offset = if load_y { qy_sz * it } else { 0 };
                let y_offset = y_sz * it;
                let d_offset = d_sz * it;

                submit_counter += 1;

                let mut s = compq.begin_submission()?;

                if load_x {
                    h2d_tensor_2d(
                        &d_qx,
                        qx_offset,
                        src0,
                        i03,
                        i02,
                        compq,
                        &self.pinned,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;
                }
                if load_y {
                    h2d_tensor_2d(
                        &d_qy,
                        qy_offset,
                        src1,
                        i03,
                        i02,
                        compq,
                        &self.pinned,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;
                }

                if qy_needs_dequant {
                    let p = to_fp16_1.ok_or(VulkanError::Fp16Unsupported)?;
                    let pc = ConvertParams {
                        nrows: ne11 as i32,
                        ncols: ne10 as i32,
                        stride_src: ne10 as i32,
                        stride_dst: ne10 as i32,
                    };
                    sync_buffers(
                        s.cmd,
                        &[SubBuffer::new(&d_qy, qy_offset as u64, qy_sz as u64)],
                        compq,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        true,
                    );
                    sync_buffers(
                        s.cmd,
                        &[SubBuffer::new(&d_y, y_offset as u64, y_sz as u64)],
                        compq,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_WRITE,
                        false,
                    );
                    p.dispatch(
                        s.cmd,
                        &[
                            SubBuffer::new(&d_qy, qy_offset as u64, qy_sz as u64),
                            SubBuffer::new(&d_y, y_offset as u64, y_sz as u64),
                        ],
                        bytes_of(&pc),
                        [y_ne as u32, 1, 1],
                    );
                }

                let pc = MatVecParams { ncols: ne00 as i32 };
                sync_buffers(
                    s.cmd,
                    &[
                        SubBuffer::new(&d_qx, qx_offset as u64, qx_sz as u64),
                        SubBuffer::new(&d_y, y_offset as u64, y_sz as u64),
                    ],
                    compq,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    true,
                );
                sync_buffers(
                    s.cmd,
                    &[SubBuffer::new(&d_d, d_offset as u64, d_sz as u64)],
                    compq,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::SHADER_WRITE,
                    false,
                );
                dmmv.dispatch(
                    s.cmd,
                    &[
                        SubBuffer::new(&d_qx, qx_offset as u64, qx_sz as u64),
                        SubBuffer::new(&d_y, y_offset as u64, y_sz as u64),
                        SubBuffer::new(&d_d, d_offset as u64, d_sz as u64),
                    ],
                    bytes_of(&pc),
                    [ne01 as u32, 1, 1],
                );

                let d_ptr = unsafe {
                    dst.host_ptr()
                        .expect("matmul destination must be a host tensor")
                        .add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    compq,
                    &self.pinned,
                    Vec::new(),
                    Vec::new(),
                    Some(&mut s),
                )?;

                compq.end_submission(&mut s, Vec::new(), Vec::new())?;
                seqs.push(vec![s]);

                if it == 0 || submit_counter >= SUBMIT_BATCH {
                    compq.submit(&mut seqs, vk::Fence::null())?;
                    submit_counter = 0;
                }
            }
        }

        compq.submit(&mut seqs, vk::Fence::null())?;
        compq.wait_idle()?;
        compq.cleanup()?;

        if qy_needs_dequant {
            if let Some(p) = to_fp16_1 {
                p.cleanup();
            }
        }
        dmmv.cleanup();

        if qy_needs_dequant {
            self.pool.free(d_y);
        }
        self.pool.free(d_d);
        if load_x {
            self.pool.free(d_qx);
        }
        if load_y {
            self.pool.free(d_qy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_k_heuristic() {
        // Deep reduction with a narrow output gets split.
        assert_eq!(guess_split_k(128, 110, 622), 4);
        assert_eq!(guess_split_k(32, 4096, 4096), 4);
        // Wide outputs or shallow reductions stay single-pass.
        assert_eq!(guess_split_k(128, 128, 622), 1);
        assert_eq!(guess_split_k(64, 64, 128), 1);
        assert_eq!(guess_split_k(512, 512, 64), 1);
    }

    #[test]
    fn tile_selection_thresholds() {
        assert_eq!(tile_for(32, 4096), MatmulSize::S);
        assert_eq!(tile_for(4096, 17), MatmulSize::S);
        assert_eq!(tile_for(64, 4096), MatmulSize::M);
        assert_eq!(tile_for(128, 64), MatmulSize::M);
        assert_eq!(tile_for(128, 110), MatmulSize::L);
        assert_eq!(tile_for(128, 128), MatmulSize::L);
        assert_eq!(tile_for(4096, 512), MatmulSize::L);
    }

    #[test]
    fn split_k_slices_cover_k() {
        let k = 622;
        let split_k = guess_split_k(128, 110, k);
        let slice = ceil_div(k as u32, split_k as u32);
        assert!(slice * split_k as u32 >= k as u32);
        assert!(slice * (split_k as u32 - 1) < k as u32);
    }

    #[test]
    fn push_constant_sizes_match_kernels() {
        assert_eq!(std::mem::size_of::<MatmulParams>(), 7 * 4);
        assert_eq!(std::mem::size_of::<SplitKReduceParams>(), 3 * 4);
        assert_eq!(std::mem::size_of::<ConvertParams>(), 4 * 4);
        assert_eq!(std::mem::size_of::<MatVecParams>(), 4);
    }
}
