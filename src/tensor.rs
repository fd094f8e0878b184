//! Tensor contract consumed by the backend
//!
//! The host graph hands the backend tensors described by this module. The
//! `Q4_0` block layout matches the GGML wire format so that quantized model
//! weights can be uploaded untouched.

use std::sync::Arc;

use half::f16;

use crate::buffer::Buffer;

/// Element types the backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    /// 32 4-bit weights per block, f16 scale, 4.5 bits/weight.
    Q4_0,
}

impl DType {
    /// Size in bytes of one element (one block for quantized types).
    pub fn type_size(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => std::mem::size_of::<BlockQ4_0>(),
        }
    }

    /// Number of weights packed into one element.
    pub fn block_size(&self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 => BlockQ4_0::WEIGHTS_PER_BLOCK,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Q4_0)
    }

    /// Bytes needed to store `n` weights of this type.
    pub fn row_size(&self, n: usize) -> usize {
        self.type_size() * n / self.block_size()
    }
}

/// Where a tensor's data currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cpu,
    Gpu,
    GpuSplit,
}

/// Operators the host graph may ask this backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    None,
    Mul,
    MulMat,
}

/// Opaque payload of a tensor.
#[derive(Debug, Clone)]
pub enum TensorData {
    None,
    /// Host allocation, possibly pinned. The pointer is owned by the host.
    Host(*mut u8),
    /// Device-resident buffer, installed by `transform_tensor`.
    Device(Arc<Buffer>),
}

/// A node of the host computation graph, as seen by this backend.
///
/// Row-major with explicit byte strides; `ne` are element counts per
/// dimension, `nb` byte strides. A layout is contiguous iff
/// `nb[0] == type_size` and `nb[1] == type_size * ne[0] / block_size`.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub op: Op,
    pub dtype: DType,
    pub backend: Backend,
    pub ne: [i64; 4],
    pub nb: [usize; 4],
    pub data: TensorData,
    pub src0: Option<Box<Tensor>>,
    pub src1: Option<Box<Tensor>>,
}

impl Tensor {
    /// A leaf tensor with contiguous strides and no payload.
    pub fn new(dtype: DType, ne: [i64; 4]) -> Self {
        let mut nb = [0usize; 4];
        nb[0] = dtype.type_size();
        nb[1] = dtype.row_size(ne[0] as usize);
        nb[2] = nb[1] * ne[1] as usize;
        nb[3] = nb[2] * ne[2] as usize;
        Self {
            op: Op::None,
            dtype,
            backend: Backend::Cpu,
            ne,
            nb,
            data: TensorData::None,
            src0: None,
            src1: None,
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.nb[0] == self.dtype.type_size()
            && self.nb[1] == self.dtype.row_size(self.ne[0] as usize)
    }

    pub fn host_ptr(&self) -> Option<*mut u8> {
        match &self.data {
            TensorData::Host(p) => Some(*p),
            _ => None,
        }
    }

    pub fn device_buffer(&self) -> Option<&Arc<Buffer>> {
        match &self.data {
            TensorData::Device(b) => Some(b),
            _ => None,
        }
    }

    pub fn elem_count(&self) -> i64 {
        self.ne[0] * self.ne[1] * self.ne[2] * self.ne[3]
    }
}

/// Phase of the host's compute pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Init,
    Compute,
    Finalize,
}

/// Per-invocation parameters handed down by the host scheduler.
#[derive(Debug, Clone, Copy)]
pub struct ComputeParams {
    pub phase: TaskPhase,
    /// Worker index; the backend only executes on worker 0.
    pub ith: usize,
    pub nth: usize,
}

impl ComputeParams {
    pub fn primary() -> Self {
        Self {
            phase: TaskPhase::Compute,
            ith: 0,
            nth: 1,
        }
    }
}

/// Q4_0 block: f16 scale plus 32 packed 4-bit weights.
/// Layout must match ggml-quants.h for GPU compatibility.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlockQ4_0 {
    /// Scale factor (delta) for dequantization.
    pub d: f16,
    /// Packed nibbles: weight[2*i] | (weight[2*i+1] << 4).
    pub qs: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == 18);
const _: () = assert!(std::mem::align_of::<BlockQ4_0>() == 2);

impl BlockQ4_0 {
    pub const WEIGHTS_PER_BLOCK: usize = 32;

    pub const fn zeroed() -> Self {
        Self {
            d: f16::ZERO,
            qs: [0; 16],
        }
    }

    /// Raw unsigned weight in 0..=15.
    pub fn weight(&self, idx: usize) -> u8 {
        assert!(idx < Self::WEIGHTS_PER_BLOCK);
        let shift = (idx & 1) * 4;
        (self.qs[idx / 2] >> shift) & 0x0F
    }

    /// Dequantize a single weight to f32.
    pub fn dequantize(&self, idx: usize) -> f32 {
        (self.weight(idx) as i8 - 8) as f32 * self.d.to_f32()
    }
}

/// Reference Q4_0 quantization, matching ggml-quants.c.
pub fn quantize_row_q4_0(src: &[f32], dst: &mut [BlockQ4_0]) {
    assert_eq!(src.len(), dst.len() * BlockQ4_0::WEIGHTS_PER_BLOCK);

    for (i, block) in dst.iter_mut().enumerate() {
        let input = &src[i * BlockQ4_0::WEIGHTS_PER_BLOCK..(i + 1) * BlockQ4_0::WEIGHTS_PER_BLOCK];

        // Scale is max/-8, where max is the absolutely-largest value.
        let mut max = 0.0f32;
        let mut amax = 0.0f32;
        for &v in input {
            if amax < v.abs() {
                amax = v.abs();
                max = v;
            }
        }

        let d = max / -8.0;
        block.d = f16::from_f32(d);

        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        for j in 0..16 {
            let x0 = (input[j * 2] * id + 8.5).floor().clamp(0.0, 15.0) as u8;
            let x1 = (input[j * 2 + 1] * id + 8.5).floor().clamp(0.0, 15.0) as u8;
            block.qs[j] = x0 | (x1 << 4);
        }
    }
}

/// Reference Q4_0 dequantization.
pub fn dequantize_row_q4_0(src: &[BlockQ4_0], dst: &mut [f32]) {
    assert_eq!(dst.len(), src.len() * BlockQ4_0::WEIGHTS_PER_BLOCK);

    for (i, block) in src.iter().enumerate() {
        let out = &mut dst[i * BlockQ4_0::WEIGHTS_PER_BLOCK..];
        for j in 0..BlockQ4_0::WEIGHTS_PER_BLOCK {
            out[j] = block.dequantize(j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q4_0_layout() {
        assert_eq!(std::mem::size_of::<BlockQ4_0>(), 18);
        assert_eq!(std::mem::align_of::<BlockQ4_0>(), 2);
        assert_eq!(DType::Q4_0.type_size(), 18);
        assert_eq!(DType::Q4_0.block_size(), 32);
    }

    #[test]
    fn q4_0_roundtrip() {
        let original: Vec<f32> = (0..64).map(|i| i as f32 * 0.1 - 3.0).collect();
        let mut quantized = [BlockQ4_0::zeroed(); 2];
        let mut dequantized = [0.0f32; 64];

        quantize_row_q4_0(&original, &mut quantized);
        dequantize_row_q4_0(&quantized, &mut dequantized);

        for (orig, deq) in original.iter().zip(dequantized.iter()) {
            let diff = (orig - deq).abs();
            assert!(diff < 0.3, "diff too large: {} vs {} ({})", orig, deq, diff);
        }
    }

    #[test]
    fn q4_0_weight_extraction() {
        let mut block = BlockQ4_0::zeroed();
        block.d = f16::from_f32(0.5);
        block.qs[0] = 0x0F;
        block.qs[1] = 0xF0;

        assert_eq!(block.weight(0), 15);
        assert_eq!(block.weight(1), 0);
        assert_eq!(block.weight(2), 0);
        assert_eq!(block.weight(3), 15);

        assert_eq!(block.dequantize(0), 0.5 * 7.0);
        assert_eq!(block.dequantize(1), 0.5 * -8.0);
    }

    #[test]
    fn contiguity() {
        let t = Tensor::new(DType::F32, [8, 4, 1, 1]);
        assert!(t.is_contiguous());
        assert_eq!(t.nb, [4, 32, 128, 128]);

        let q = Tensor::new(DType::Q4_0, [64, 2, 1, 1]);
        assert!(q.is_contiguous());
        // 64 weights = 2 blocks of 18 bytes per row
        assert_eq!(q.nb[1], 36);

        let mut strided = Tensor::new(DType::F32, [8, 4, 1, 1]);
        strided.nb[1] = 64;
        assert!(!strided.is_contiguous());
    }
}
