//! Developer micro-benchmarks
//!
//! Compiled only with the `self-test` feature and driven from the GPU
//! integration tests or a host binary during bring-up; never part of the
//! production runtime. Matmul results are checked against a host reference
//! GEMM with `op(X) = transpose`, column-major output.

use std::time::Instant;

use bytemuck::{cast_slice, cast_slice_mut};
use half::f16;
use log::info;
use rand::Rng;

use crate::buffer::SubBuffer;
use crate::device::Sequence;
use crate::error::Result;
use crate::pipeline::MatmulSize;
use crate::tensor::{DType, Tensor, TensorData};
use crate::transfer;
use crate::VulkanBackend;

/// Column-major reference: d[c*m + r] = sum_i x[r*k + i] * y[c*k + i].
pub fn reference_gemm(m: usize, n: usize, k: usize, x: &[f32], y: &[f32]) -> Vec<f32> {
    let mut d = vec![0.0f32; m * n];
    for c in 0..n {
        for r in 0..m {
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += x[r * k + i] * y[c * k + i];
            }
            d[c * m + r] = acc;
        }
    }
    d
}

impl VulkanBackend {
    /// Round-trip `ne` random floats through a device-local buffer and
    /// report bandwidth plus the average element error (expected 0).
    pub fn test_transfer(&self, ne: usize) -> Result<f64> {
        let buffer = self.create_buffer(4 * ne)?;

        let mut rng = rand::thread_rng();
        let x: Vec<f32> = (0..ne).map(|_| rng.gen::<f32>()).collect();
        let mut y = vec![0.0f32; ne];

        let begin = Instant::now();
        self.buffer_write(&buffer, 0, cast_slice(&x))?;
        self.transfer_queues[0].wait_idle()?;
        let to_gpu = begin.elapsed();

        let begin = Instant::now();
        self.buffer_read(&buffer, 0, cast_slice_mut(&mut y))?;
        let from_gpu = begin.elapsed();

        let avg_err =
            x.iter().zip(&y).map(|(a, b)| (a - b).abs() as f64).sum::<f64>() / ne as f64;

        let kb = (4 * ne) as f64 / 1024.0;
        info!(
            "TRANSFER {kb:.0} KB to_gpu {:?} from_gpu {:?} avg_err={avg_err}",
            to_gpu, from_gpu
        );

        self.transfer_queues[0].cleanup()?;
        Ok(avg_err)
    }

    /// Write an f16 matrix with rows zero-padded to `align` and verify
    /// both the data region and the padding on readback.
    pub fn test_buffer_write_zeropad(&self, m: usize, k: usize, align: usize) -> Result<()> {
        let kpad = transfer::align_size(k, align);

        let d_x = self.pool.malloc(2 * kpad * m)?;

        let mut rng = rand::thread_rng();
        let x: Vec<f16> = (0..m * k).map(|_| f16::from_f32(rng.gen::<f32>())).collect();

        self.buffer_write_2d_zeropad(&d_x, 0, cast_slice(&x), 2 * k, 2 * k, m, 2 * align)?;

        let mut x_chk = vec![f16::ZERO; kpad * m];
        self.buffer_read(&d_x, 0, cast_slice_mut(&mut x_chk))?;

        for midx in 0..m {
            for kidx in 0..kpad {
                let got = x_chk[midx * kpad + kidx];
                if kidx < k {
                    assert_eq!(
                        got,
                        x[midx * k + kidx],
                        "data mismatch at row {midx} col {kidx}"
                    );
                } else {
                    assert_eq!(
                        got.to_f32(),
                        0.0,
                        "padding not zero at row {midx} col {kidx}"
                    );
                }
            }
        }

        info!("ZEROPAD m={m} k={k} align={align} ok");

        self.transfer_queues[0].cleanup()?;
        self.pool.free(d_x);
        Ok(())
    }

    /// Convert an f32 matrix to f16 on the device and compare against the
    /// host conversion staged through `h2d_tensor_2d_f32_to_f16`.
    pub fn test_f32_to_f16(&self, m: usize, k: usize) -> Result<f64> {
        use crate::ops::matmul::ConvertParams;

        let ne = m * k;
        let d_x = self.create_buffer(4 * ne)?;
        let d_y = self.create_buffer(2 * ne)?;
        let d_y2 = self.create_buffer(2 * ne)?;

        let mut rng = rand::thread_rng();
        let x: Vec<f32> = (0..ne).map(|_| rng.gen::<f32>()).collect();

        self.buffer_write(&d_x, 0, cast_slice(&x))?;
        self.transfer_queues[0].wait_idle()?;

        self.pipelines.f32_to_f16.allocate_descriptor_sets(1)?;

        let compq = &self.compute_queue;
        let mut s = compq.begin_submission()?;
        let pc = ConvertParams {
            nrows: m as i32,
            ncols: k as i32,
            stride_src: k as i32,
            stride_dst: k as i32,
        };
        crate::buffer::sync_buffers(
            s.cmd,
            &[SubBuffer::whole(&d_x)],
            compq,
            ash::vk::AccessFlags::TRANSFER_WRITE,
            ash::vk::AccessFlags::SHADER_READ,
            false,
        );
        crate::buffer::sync_buffers(
            s.cmd,
            &[SubBuffer::whole(&d_y)],
            compq,
            ash::vk::AccessFlags::SHADER_READ,
            ash::vk::AccessFlags::SHADER_WRITE,
            false,
        );
        self.pipelines.f32_to_f16.dispatch(
            s.cmd,
            &[SubBuffer::whole(&d_x), SubBuffer::whole(&d_y)],
            bytemuck::bytes_of(&pc),
            [ne as u32, 1, 1],
        );
        compq.end_submission(&mut s, Vec::new(), Vec::new())?;
        let mut seqs: Vec<Sequence> = vec![vec![s]];
        compq.submit(&mut seqs, ash::vk::Fence::null())?;
        compq.wait_idle()?;

        // Host-side staged conversion of the same data.
        let mut src = Tensor::new(DType::F32, [k as i64, m as i64, 1, 1]);
        src.data = TensorData::Host(x.as_ptr() as *mut u8);
        let tr0q = &self.transfer_queues[0];
        let mut seqs = vec![transfer::h2d_tensor_2d_f32_to_f16(
            &d_y2,
            0,
            &src,
            0,
            0,
            tr0q,
            Vec::new(),
            Vec::new(),
        )?];
        tr0q.submit_and_wait(&mut seqs)?;

        let mut y = vec![f16::ZERO; ne];
        let mut y2 = vec![f16::ZERO; ne];
        self.buffer_read(&d_y, 0, cast_slice_mut(&mut y))?;
        self.buffer_read(&d_y2, 0, cast_slice_mut(&mut y2))?;

        let avg_err = x
            .iter()
            .zip(&y)
            .map(|(a, b)| (a - b.to_f32()).abs() as f64)
            .sum::<f64>()
            / ne as f64;
        for (device, host) in y.iter().zip(&y2) {
            assert_eq!(device.to_bits(), host.to_bits());
        }

        info!("F32_TO_F16 m={m} k={k} avg_err={avg_err}");

        self.pipelines.f32_to_f16.cleanup();
        compq.cleanup()?;
        tr0q.cleanup()?;
        Ok(avg_err)
    }

    /// Run `num_it` f32 matmuls of a fixed tile size and compare the last
    /// result against the host reference. Returns the average element
    /// error.
    pub fn test_matmul_f32(
        &self,
        m: usize,
        n: usize,
        k: usize,
        num_it: usize,
        split_k: i32,
        size: MatmulSize,
    ) -> Result<f64> {
        let p = self.pipelines.matmul_f32.get(size, false);
        let kpad = transfer::align_size(k, p.align as usize);

        let d_x = self.pool.malloc(4 * kpad * m)?;
        let d_y = self.pool.malloc(4 * kpad * n)?;
        let d_d = self.pool.malloc(4 * m * n * split_k as usize)?;

        let mut rng = rand::thread_rng();
        let x: Vec<f32> = (0..m * k).map(|_| rng.gen::<f32>()).collect();
        let y: Vec<f32> = (0..n * k).map(|_| rng.gen::<f32>()).collect();

        self.buffer_write_2d_zeropad(
            &d_x,
            0,
            cast_slice(&x),
            4 * k,
            4 * k,
            m,
            4 * p.align as usize,
        )?;
        self.buffer_write_2d_zeropad(
            &d_y,
            0,
            cast_slice(&y),
            4 * k,
            4 * k,
            n,
            4 * p.align as usize,
        )?;
        self.transfer_queues[0].wait_idle()?;

        p.allocate_descriptor_sets(num_it)?;
        if split_k > 1 {
            self.pipelines.split_k_reduce.allocate_descriptor_sets(num_it)?;
        }

        let begin = Instant::now();
        let mut seqs: Vec<Sequence> = Vec::new();
        for _ in 0..num_it {
            seqs.push(self.matmul(
                p,
                SubBuffer::whole(&d_x),
                SubBuffer::whole(&d_y),
                SubBuffer::whole(&d_d),
                m as i32,
                n as i32,
                k as i32,
                kpad as i32,
                kpad as i32,
                m as i32,
                split_k,
                &self.compute_queue,
                Vec::new(),
                Vec::new(),
            )?);
        }
        self.compute_queue.submit(&mut seqs, ash::vk::Fence::null())?;
        self.compute_queue.wait_idle()?;
        let elapsed = begin.elapsed();

        let mut d = vec![0.0f32; m * n];
        self.buffer_read(&d_d, 0, cast_slice_mut(&mut d))?;

        let d_chk = reference_gemm(m, n, k, &x, &y);
        let avg_err = d
            .iter()
            .zip(&d_chk)
            .map(|(a, b)| (a - b).abs() as f64)
            .sum::<f64>()
            / (m * n) as f64;

        info!(
            "MATMUL_F32 {size:?} m={m} n={n} k={k} split_k={split_k} {:.3}ms/it avg_err={avg_err}",
            elapsed.as_secs_f64() * 1000.0 / num_it as f64
        );

        self.transfer_queues[0].cleanup()?;
        self.transfer_queues[1].cleanup()?;
        self.compute_queue.cleanup()?;
        p.cleanup();
        self.pipelines.split_k_reduce.cleanup();

        self.pool.free(d_x);
        self.pool.free(d_y);
        self.pool.free(d_d);
        Ok(avg_err)
    }

    /// f16 variant of [`test_matmul_f32`]; a no-op returning 0 when the
    /// device lacks fp16 kernels.
    ///
    /// [`test_matmul_f32`]: VulkanBackend::test_matmul_f32
    pub fn test_matmul_f16(
        &self,
        m: usize,
        n: usize,
        k: usize,
        num_it: usize,
        split_k: i32,
        size: MatmulSize,
    ) -> Result<f64> {
        let Some(family) = &self.pipelines.matmul_f16 else {
            return Ok(0.0);
        };
        let p = family.get(size, false);
        let kpad = transfer::align_size(k, p.align as usize);

        let d_x = self.pool.malloc(2 * kpad * m)?;
        let d_y = self.pool.malloc(2 * kpad * n)?;
        let d_d = self.pool.malloc(4 * m * n * split_k as usize)?;

        let mut rng = rand::thread_rng();
        let x: Vec<f16> = (0..m * k).map(|_| f16::from_f32(rng.gen::<f32>())).collect();
        let y: Vec<f16> = (0..n * k).map(|_| f16::from_f32(rng.gen::<f32>())).collect();

        self.buffer_write_2d_zeropad(
            &d_x,
            0,
            cast_slice(&x),
            2 * k,
            2 * k,
            m,
            2 * p.align as usize,
        )?;
        self.buffer_write_2d_zeropad(
            &d_y,
            0,
            cast_slice(&y),
            2 * k,
            2 * k,
            n,
            2 * p.align as usize,
        )?;
        self.transfer_queues[0].wait_idle()?;

        p.allocate_descriptor_sets(num_it)?;
        if split_k > 1 {
            self.pipelines.split_k_reduce.allocate_descriptor_sets(num_it)?;
        }

        let begin = Instant::now();
        let mut seqs: Vec<Sequence> = Vec::new();
        for _ in 0..num_it {
            seqs.push(self.matmul(
                p,
                SubBuffer::whole(&d_x),
                SubBuffer::whole(&d_y),
                SubBuffer::whole(&d_d),
                m as i32,
                n as i32,
                k as i32,
                kpad as i32,
                kpad as i32,
                m as i32,
                split_k,
                &self.compute_queue,
                Vec::new(),
                Vec::new(),
            )?);
        }
        self.compute_queue.submit(&mut seqs, ash::vk::Fence::null())?;
        self.compute_queue.wait_idle()?;
        let elapsed = begin.elapsed();

        let mut d = vec![0.0f32; m * n];
        self.buffer_read(&d_d, 0, cast_slice_mut(&mut d))?;

        let fx: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
        let fy: Vec<f32> = y.iter().map(|v| v.to_f32()).collect();
        let d_chk = reference_gemm(m, n, k, &fx, &fy);
        let avg_err = d
            .iter()
            .zip(&d_chk)
            .map(|(a, b)| (a - b).abs() as f64)
            .sum::<f64>()
            / (m * n) as f64;

        info!(
            "MATMUL_F16 {size:?} m={m} n={n} k={k} split_k={split_k} {:.3}ms/it avg_err={avg_err}",
            elapsed.as_secs_f64() * 1000.0 / num_it as f64
        );

        self.transfer_queues[0].cleanup()?;
        self.transfer_queues[1].cleanup()?;
        self.compute_queue.cleanup()?;
        p.cleanup();
        self.pipelines.split_k_reduce.cleanup();

        self.pool.free(d_x);
        self.pool.free(d_y);
        self.pool.free(d_d);
        Ok(avg_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_gemm_identity() {
        // X = I (2x2, rows along k), Y = arbitrary.
        let x = [1.0, 0.0, 0.0, 1.0];
        let y = [3.0, 5.0, 7.0, 11.0];
        let d = reference_gemm(2, 2, 2, &x, &y);
        // Column-major: d[c*m + r] = y[c*k + r]
        assert_eq!(d, vec![3.0, 5.0, 7.0, 11.0]);
    }
}
