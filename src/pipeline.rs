//! Compute pipelines and descriptor-set vending
//!
//! Each pipeline is immutable after construction and carries a pool of
//! pre-allocated descriptor sets handed out through a rolling cursor. The
//! cursor is reset between ops instead of freeing sets, so descriptor
//! allocation cost is paid once per high-water mark.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use log::debug;
use parking_lot::Mutex;

use crate::buffer::SubBuffer;
use crate::device::DeviceShared;
use crate::error::{Result, VulkanError};
use crate::tensor::DType;

pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Convert problem extents to a dispatch grid via the pipeline's
/// work-group denominators.
pub(crate) fn workgroups(elements: [u32; 3], denoms: [u32; 3]) -> [u32; 3] {
    [
        ceil_div(elements[0], denoms[0]),
        ceil_div(elements[1], denoms[1]),
        ceil_div(elements[2], denoms[2]),
    ]
}

/// How descriptor sets are allocated on this device. Some vendors (notably
/// AMD) reject multiple sets from one pool and need the single-pool
/// fallback; probed once with a trial allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPoolMode {
    Unknown,
    /// One pool holds many sets.
    Multi,
    /// One pool per set.
    Single,
}

const MULTI_POOL_SETS: u32 = 128;

struct DescriptorState {
    pools: Vec<vk::DescriptorPool>,
    sets: Vec<vk::DescriptorSet>,
    next: usize,
}

/// A compute program: SPIR-V module, layouts, baked specialization
/// constants, and its descriptor-set pool.
pub struct Pipeline {
    shared: Arc<DeviceShared>,
    pub name: String,
    module: vk::ShaderModule,
    dsl: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub push_constant_size: u32,
    pub parameter_count: u32,
    pub wg_denoms: [u32; 3],
    pub align: u32,
    pool_mode: DescriptorPoolMode,
    state: Mutex<DescriptorState>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        shared: &Arc<DeviceShared>,
        mode: &mut DescriptorPoolMode,
        shader_dir: &Path,
        name: &str,
        shader: &str,
        parameter_count: u32,
        push_constant_size: u32,
        wg_denoms: [u32; 3],
        specialization: &[i32],
        align: u32,
    ) -> Result<Self> {
        assert!(parameter_count > 0);
        assert!(wg_denoms.iter().all(|&d| d > 0));

        let device = &shared.device;

        let path = shader_dir.join(format!("{shader}.spv"));
        let bytes = std::fs::read(&path).map_err(|source| VulkanError::ShaderLoad {
            path: path.clone(),
            source,
        })?;
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|source| {
            VulkanError::ShaderLoad { path, source }
        })?;
        let module_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.create_shader_module(&module_info, None)? };

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..parameter_count)
            .map(|i| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let dsl = unsafe { device.create_descriptor_set_layout(&dsl_info, None)? };

        if *mode == DescriptorPoolMode::Unknown {
            *mode = probe_descriptor_pool_mode(device, dsl, parameter_count)?;
            debug!("descriptor pool mode: {:?}", mode);
        }

        let mut pools = Vec::new();
        if *mode == DescriptorPoolMode::Multi {
            let pool_size = vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(parameter_count * MULTI_POOL_SETS);
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(MULTI_POOL_SETS)
                .pool_sizes(std::slice::from_ref(&pool_size));
            pools.push(unsafe { device.create_descriptor_pool(&pool_info, None)? });
        }

        let pcr = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&dsl))
            .push_constant_ranges(std::slice::from_ref(&pcr));
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        let entries: Vec<vk::SpecializationMapEntry> = (0..specialization.len())
            .map(|i| vk::SpecializationMapEntry {
                constant_id: i as u32,
                offset: (i * std::mem::size_of::<i32>()) as u32,
                size: std::mem::size_of::<i32>(),
            })
            .collect();
        let spec_data = bytemuck::cast_slice(specialization);
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(spec_data);

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main")
            .specialization_info(&spec_info);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipeline = unsafe {
            device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        }
        .map_err(|(_, e)| VulkanError::Vulkan(e))?[0];

        Ok(Self {
            shared: shared.clone(),
            name: name.to_string(),
            module,
            dsl,
            layout,
            pipeline,
            push_constant_size,
            parameter_count,
            wg_denoms,
            align,
            pool_mode: *mode,
            state: Mutex::new(DescriptorState {
                pools,
                sets: Vec::new(),
                next: 0,
            }),
        })
    }

    /// Ensure at least `n` descriptor sets exist. Orchestrators size this
    /// to their dispatch count before issuing any work.
    pub fn allocate_descriptor_sets(&self, n: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.sets.len() >= n {
            return Ok(());
        }

        if self.pool_mode == DescriptorPoolMode::Multi {
            let count = n - state.sets.len();
            let layouts = vec![self.dsl; count];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(state.pools[0])
                .set_layouts(&layouts);
            let sets = unsafe { self.shared.device.allocate_descriptor_sets(&alloc_info)? };
            state.sets.extend(sets);
        } else {
            while state.sets.len() < n {
                let pool_size = vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(self.parameter_count);
                let pool_info = vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1)
                    .pool_sizes(std::slice::from_ref(&pool_size));
                let pool = unsafe { self.shared.device.create_descriptor_pool(&pool_info, None)? };
                state.pools.push(pool);

                let alloc_info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(std::slice::from_ref(&self.dsl));
                let sets = unsafe { self.shared.device.allocate_descriptor_sets(&alloc_info)? };
                state.sets.extend(sets);
            }
        }
        Ok(())
    }

    /// Reset the rolling cursor; pools and sets stay allocated for reuse
    /// across ops.
    pub fn cleanup(&self) {
        self.state.lock().next = 0;
    }

    /// Record one dispatch: bind the next descriptor set, write the buffer
    /// bindings and push constants, and dispatch a grid derived from the
    /// problem extents.
    pub fn dispatch(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[SubBuffer],
        push_constants: &[u8],
        elements: [u32; 3],
    ) {
        assert_eq!(buffers.len(), self.parameter_count as usize);
        assert_eq!(push_constants.len(), self.push_constant_size as usize);

        let set = {
            let mut state = self.state.lock();
            assert!(
                state.next < state.sets.len(),
                "descriptor sets exhausted for pipeline {}",
                self.name
            );
            let set = state.sets[state.next];
            state.next += 1;
            set
        };

        let infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|sub| {
                vk::DescriptorBufferInfo::default()
                    .buffer(sub.buffer.buffer)
                    .offset(sub.offset)
                    .range(sub.size)
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(i as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();

        let device = &self.shared.device;
        let [wg0, wg1, wg2] = workgroups(elements, self.wg_denoms);
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
            device.cmd_push_constants(
                cmd,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constants,
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                &[set],
                &[],
            );
            device.cmd_dispatch(cmd, wg0, wg1, wg2);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let device = &self.shared.device;
        let state = self.state.get_mut();
        unsafe {
            for pool in state.pools.drain(..) {
                device.destroy_descriptor_pool(pool, None);
            }
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.dsl, None);
            device.destroy_shader_module(self.module, None);
        }
    }
}

/// Trial-allocate two sets from one pool; `OUT_OF_POOL_MEMORY` means the
/// device needs one pool per set.
fn probe_descriptor_pool_mode(
    device: &ash::Device,
    dsl: vk::DescriptorSetLayout,
    parameter_count: u32,
) -> Result<DescriptorPoolMode> {
    const PROBE_SETS: u32 = 2;

    let pool_size = vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(parameter_count * PROBE_SETS);
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(PROBE_SETS)
        .pool_sizes(std::slice::from_ref(&pool_size));
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

    let layouts = [dsl; PROBE_SETS as usize];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let mode = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(_) => Ok(DescriptorPoolMode::Multi),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Ok(DescriptorPoolMode::Single),
        Err(e) => Err(VulkanError::Vulkan(e)),
    };

    unsafe { device.destroy_descriptor_pool(pool, None) };
    mode
}

/// Matmul tile footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulSize {
    S,
    M,
    L,
}

/// One matmul shader in its three tile sizes, aligned and unaligned.
pub(crate) struct MatmulFamily {
    pub s: Pipeline,
    pub m: Pipeline,
    pub l: Pipeline,
    pub aligned_s: Pipeline,
    pub aligned_m: Pipeline,
    pub aligned_l: Pipeline,
}

impl MatmulFamily {
    fn load(
        shared: &Arc<DeviceShared>,
        mode: &mut DescriptorPoolMode,
        shader_dir: &Path,
        shader: &str,
    ) -> Result<Self> {
        const WARPTILE_L: [i32; 9] = [128, 128, 128, 16, 64, 64, 2, 4, 4];
        const WARPTILE_M: [i32; 9] = [128, 64, 64, 16, 32, 32, 2, 4, 2];
        const WARPTILE_S: [i32; 9] = [32, 32, 32, 8, 32, 32, 2, 2, 2];
        const PC_SIZE: u32 = 7 * 4;

        let aligned = format!("{shader}_aligned");
        let mk = |mode: &mut DescriptorPoolMode,
                  suffix: &str,
                  file: &str,
                  denoms: [u32; 3],
                  warptile: &[i32],
                  align: u32|
         -> Result<Pipeline> {
            Pipeline::create(
                shared,
                mode,
                shader_dir,
                &format!("{shader}_{suffix}"),
                file,
                3,
                PC_SIZE,
                denoms,
                warptile,
                align,
            )
        };

        Ok(Self {
            l: mk(mode, "l", shader, [128, 128, 1], &WARPTILE_L, 128)?,
            m: mk(mode, "m", shader, [64, 64, 1], &WARPTILE_M, 64)?,
            s: mk(mode, "s", shader, [32, 32, 1], &WARPTILE_S, 32)?,
            aligned_l: mk(mode, "aligned_l", &aligned, [128, 128, 1], &WARPTILE_L, 128)?,
            aligned_m: mk(mode, "aligned_m", &aligned, [64, 64, 1], &WARPTILE_M, 64)?,
            aligned_s: mk(mode, "aligned_s", &aligned, [32, 32, 1], &WARPTILE_S, 32)?,
        })
    }

    pub fn get(&self, size: MatmulSize, aligned: bool) -> &Pipeline {
        match (size, aligned) {
            (MatmulSize::S, false) => &self.s,
            (MatmulSize::M, false) => &self.m,
            (MatmulSize::L, false) => &self.l,
            (MatmulSize::S, true) => &self.aligned_s,
            (MatmulSize::M, true) => &self.aligned_m,
            (MatmulSize::L, true) => &self.aligned_l,
        }
    }
}

/// All pipelines of the backend, loaded once at init. fp16 kernels exist
/// only on fp16-capable devices.
pub(crate) struct Pipelines {
    pub matmul_f32: MatmulFamily,
    pub matmul_f16: Option<MatmulFamily>,
    pub matmul_f16_f32: Option<MatmulFamily>,
    pub split_k_reduce: Pipeline,
    pub dmmv_f16: Option<Pipeline>,
    pub dmmv_q4_0: Option<Pipeline>,
    pub dmmv_f16_f32: Pipeline,
    pub dmmv_q4_0_f32: Pipeline,
    pub f32_to_f16: Pipeline,
    pub dequant_q4_0: Pipeline,
    pub mul_f32: Pipeline,
}

impl Pipelines {
    pub fn load(shared: &Arc<DeviceShared>, shader_dir: &Path) -> Result<Self> {
        let mut mode = DescriptorPoolMode::Unknown;
        let m = &mut mode;

        let matmul_f32 = MatmulFamily::load(shared, m, shader_dir, "matmul_f32")?;
        let (matmul_f16, matmul_f16_f32, dmmv_f16, dmmv_q4_0) = if shared.fp16 {
            (
                Some(MatmulFamily::load(shared, m, shader_dir, "matmul_f16")?),
                Some(MatmulFamily::load(shared, m, shader_dir, "matmul_f16_f32")?),
                Some(Pipeline::create(
                    shared,
                    m,
                    shader_dir,
                    "dequant_mul_mat_vec_f16",
                    "dequant_mul_mat_vec_f16",
                    3,
                    4,
                    [1, 1, 1],
                    &[],
                    1,
                )?),
                Some(Pipeline::create(
                    shared,
                    m,
                    shader_dir,
                    "dequant_mul_mat_vec_q4_0",
                    "dequant_mul_mat_vec_q4_0",
                    3,
                    4,
                    [1, 1, 1],
                    &[],
                    1,
                )?),
            )
        } else {
            (None, None, None, None)
        };

        let split_k_reduce = Pipeline::create(
            shared,
            m,
            shader_dir,
            "matmul_split_k_reduce",
            "matmul_split_k_reduce",
            1,
            3 * 4,
            [32, 32, 1],
            &[],
            1,
        )?;
        let f32_to_f16 = Pipeline::create(
            shared,
            m,
            shader_dir,
            "f32_to_f16",
            "f32_to_f16",
            2,
            4 * 4,
            [64, 1, 1],
            &[],
            1,
        )?;
        let dequant_q4_0 = Pipeline::create(
            shared,
            m,
            shader_dir,
            "dequant_q4_0",
            "dequant_q4_0",
            2,
            4 * 4,
            [256 * 32, 1, 1],
            &[],
            1,
        )?;
        let dmmv_f16_f32 = Pipeline::create(
            shared,
            m,
            shader_dir,
            "dequant_mul_mat_vec_f16_f32",
            "dequant_mul_mat_vec_f16_f32",
            3,
            4,
            [1, 1, 1],
            &[],
            1,
        )?;
        let dmmv_q4_0_f32 = Pipeline::create(
            shared,
            m,
            shader_dir,
            "dequant_mul_mat_vec_q4_0_f32",
            "dequant_mul_mat_vec_q4_0_f32",
            3,
            4,
            [1, 1, 1],
            &[],
            1,
        )?;
        let mul_f32 = Pipeline::create(
            shared,
            m,
            shader_dir,
            "mul_f32",
            "mul_f32",
            3,
            8 * 4,
            [32, 32, 1],
            &[],
            1,
        )?;

        Ok(Self {
            matmul_f32,
            matmul_f16,
            matmul_f16_f32,
            split_k_reduce,
            dmmv_f16,
            dmmv_q4_0,
            dmmv_f16_f32,
            dmmv_q4_0_f32,
            f32_to_f16,
            dequant_q4_0,
            mul_f32,
        })
    }

    /// Pipeline converting a whole tensor of `dtype` to f16, if one exists.
    pub fn to_fp16(&self, dtype: DType) -> Option<&Pipeline> {
        match dtype {
            DType::Q4_0 => Some(&self.dequant_q4_0),
            DType::F32 => Some(&self.f32_to_f16),
            DType::F16 => None,
        }
    }

    /// Fused dequantize + matrix-vector pipeline for `dtype`, by y-operand
    /// precision.
    pub fn dequantize_mul_mat_vec(&self, dtype: DType, f16_y: bool) -> Option<&Pipeline> {
        match dtype {
            DType::Q4_0 => {
                if f16_y {
                    self.dmmv_q4_0.as_ref()
                } else {
                    Some(&self.dmmv_q4_0_f32)
                }
            }
            DType::F16 => {
                if f16_y {
                    self.dmmv_f16.as_ref()
                } else {
                    Some(&self.dmmv_f16_f32)
                }
            }
            DType::F32 => None,
        }
    }

    /// Matmul pipeline for the operand precisions, tile size, and K
    /// alignment. The (f32 x, f16 y) combination is a host bug.
    pub fn matmul(
        &self,
        bit16_x: bool,
        bit16_y: bool,
        size: MatmulSize,
        aligned: bool,
    ) -> Result<&Pipeline> {
        let family = match (bit16_x, bit16_y) {
            (false, false) => &self.matmul_f32,
            (true, true) => self.matmul_f16.as_ref().ok_or(VulkanError::Fp16Unsupported)?,
            (true, false) => self
                .matmul_f16_f32
                .as_ref()
                .ok_or(VulkanError::Fp16Unsupported)?,
            (false, true) => panic!("f32 x with f16 y is not a valid matmul combination"),
        };
        Ok(family.get(size, aligned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_derivation_rounds_up() {
        assert_eq!(workgroups([128, 110, 1], [64, 64, 1]), [2, 2, 1]);
        assert_eq!(workgroups([1, 1, 1], [128, 128, 1]), [1, 1, 1]);
        assert_eq!(workgroups([129, 64, 3], [64, 64, 2]), [3, 1, 2]);
    }

    #[test]
    fn ceil_div_basics() {
        assert_eq!(ceil_div(1, 1), 1);
        assert_eq!(ceil_div(622, 128), 5);
        assert_eq!(ceil_div(512, 128), 4);
    }
}
