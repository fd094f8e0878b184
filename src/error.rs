//! Error types for the Vulkan backend

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VulkanError {
    #[error("vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("gpu allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("no Vulkan devices found")]
    NoDevices,

    #[error("invalid device index: {0}")]
    InvalidDeviceIndex(usize),

    #[error("no suitable queue family found")]
    NoSuitableQueueFamily,

    #[error("required device extension {0} is missing")]
    MissingExtension(&'static str),

    #[error("failed to load shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device does not support fp16 kernels")]
    Fp16Unsupported,
}

pub type Result<T> = std::result::Result<T, VulkanError>;
