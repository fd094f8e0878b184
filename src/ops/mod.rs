//! Operator dispatch
//!
//! The host graph calls [`VulkanBackend::compute_forward`] for every node;
//! the dispatcher decides whether this backend can run the node and routes
//! it to an orchestrator. Returning `false` makes the host fall back to its
//! CPU path.

pub(crate) mod matmul;
mod mul;

use crate::error::Result;
use crate::tensor::{Backend, ComputeParams, DType, Op, TaskPhase, Tensor};
use crate::VulkanBackend;

fn supported_matmul_type(dtype: DType) -> bool {
    matches!(dtype, DType::F32 | DType::F16) || dtype.is_quantized()
}

/// Whether the matmul orchestrators accept this node: supported operand
/// types, f32 destination, and either a problem large enough to be worth
/// the transfer or weights already resident on the device.
pub(crate) fn can_mul_mat(src0: &Tensor, src1: &Tensor, dst: &Tensor) -> bool {
    let ne10 = src1.ne[0];
    let ne0 = dst.ne[0];
    let ne1 = dst.ne[1];

    supported_matmul_type(src0.dtype)
        && supported_matmul_type(src1.dtype)
        && dst.dtype == DType::F32
        && ((ne0 >= 32 && ne1 >= 32 && ne10 >= 32) || src0.backend == Backend::Gpu)
}

impl VulkanBackend {
    /// Dispatcher entry. `Ok(false)` means the node is not handled here;
    /// `Ok(true)` covers both executed nodes and deliberate skips
    /// (secondary workers, non-compute phases).
    pub fn compute_forward(&self, params: &ComputeParams, tensor: &Tensor) -> Result<bool> {
        let any_on_device = tensor.backend == Backend::Gpu
            || tensor
                .src0
                .as_ref()
                .is_some_and(|t| matches!(t.backend, Backend::Gpu | Backend::GpuSplit))
            || tensor
                .src1
                .as_ref()
                .is_some_and(|t| t.backend == Backend::Gpu);

        let (src0, src1) = match (&tensor.src0, &tensor.src1) {
            (Some(a), Some(b)) => (a.as_ref(), b.as_ref()),
            _ => return Ok(false),
        };

        match tensor.op {
            Op::Mul => {
                if !any_on_device {
                    return Ok(false);
                }
            }
            Op::MulMat => {
                if !any_on_device && !can_mul_mat(src0, src1, tensor) {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }

        // The backend is driven only from the primary worker during the
        // compute phase.
        if params.ith != 0 {
            return Ok(true);
        }
        if params.phase != TaskPhase::Compute {
            return Ok(true);
        }

        match tensor.op {
            Op::Mul => self.mul(src0, src1, tensor)?,
            Op::MulMat => self.mul_mat(src0, src1, tensor)?,
            Op::None => return Ok(false),
        }

        Ok(true)
    }

    pub(crate) fn mul_mat(&self, src0: &Tensor, src1: &Tensor, dst: &Tensor) -> Result<()> {
        assert!(can_mul_mat(src0, src1, dst));

        if src0.dtype == DType::F32 && src1.dtype == DType::F32 {
            self.mul_mat_f32(src0, src1, dst)
        } else if src1.ne[1] == 1 && (src0.dtype == DType::F16 || src0.dtype.is_quantized()) {
            self.mul_mat_vec_q_f16(src0, src1, dst)
        } else {
            self.mul_mat_q_f16(src0, src1, dst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;

    fn mul_mat_node(
        src0_dtype: DType,
        src1_dtype: DType,
        dst_dtype: DType,
        m: i64,
        n: i64,
        k: i64,
    ) -> Tensor {
        let src0 = Tensor::new(src0_dtype, [k, m, 1, 1]);
        let src1 = Tensor::new(src1_dtype, [k, n, 1, 1]);
        let mut dst = Tensor::new(dst_dtype, [m, n, 1, 1]);
        dst.op = Op::MulMat;
        dst.src0 = Some(Box::new(src0));
        dst.src1 = Some(Box::new(src1));
        dst
    }

    #[test]
    fn accepts_large_f32_matmul() {
        let node = mul_mat_node(DType::F32, DType::F32, DType::F32, 128, 110, 622);
        let src0 = node.src0.as_ref().unwrap();
        let src1 = node.src1.as_ref().unwrap();
        assert!(can_mul_mat(src0, src1, &node));
    }

    #[test]
    fn rejects_small_cpu_matmul() {
        let node = mul_mat_node(DType::F32, DType::F32, DType::F32, 16, 16, 16);
        let src0 = node.src0.as_ref().unwrap();
        let src1 = node.src1.as_ref().unwrap();
        assert!(!can_mul_mat(src0, src1, &node));
    }

    #[test]
    fn accepts_small_matmul_with_resident_weights() {
        let mut node = mul_mat_node(DType::Q4_0, DType::F32, DType::F32, 16, 1, 64);
        node.src0.as_mut().unwrap().backend = Backend::Gpu;
        node.src0.as_mut().unwrap().data = TensorData::None;
        let src0 = node.src0.as_ref().unwrap();
        let src1 = node.src1.as_ref().unwrap();
        assert!(can_mul_mat(src0, src1, &node));
    }

    #[test]
    fn rejects_f16_destination() {
        let node = mul_mat_node(DType::F16, DType::F32, DType::F16, 128, 128, 128);
        let src0 = node.src0.as_ref().unwrap();
        let src1 = node.src1.as_ref().unwrap();
        assert!(!can_mul_mat(src0, src1, &node));
    }
}
