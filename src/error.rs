// Error types for the GPU layer
//
// Structural failures (instance, device, swapchain, pipeline) are fatal:
// they are logged once here and propagated up to the application, which
// terminates. Everything else is recoverable by the caller.

use ash::vk;
use thiserror::Error;

pub type GpuResult<T> = Result<T, GpuError>;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(vk::Result),

    #[error("Swapchain is out of date")]
    OutOfDate,

    #[error("Timed out waiting for the GPU")]
    Timeout,

    #[error("GPU device lost")]
    DeviceLost,

    #[error("Surface doesn't support present on the selected GPU")]
    SurfaceUnsupported,

    #[error("No suitable GPU found")]
    NoSuitableGpu,

    #[error("No queue family supports {0}")]
    MissingQueueFamily(&'static str),

    #[error("Descriptor pools exhausted")]
    PoolExhausted,

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    #[error("Failed to create {what}: {source}")]
    Creation {
        what: &'static str,
        #[source]
        source: Box<GpuError>,
    },
}

impl GpuError {
    /// True for errors the frame loop cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GpuError::Creation { .. }
                | GpuError::SurfaceUnsupported
                | GpuError::NoSuitableGpu
                | GpuError::MissingQueueFamily(_)
                | GpuError::Loading(_)
                | GpuError::DeviceLost
        )
    }

    pub fn invalid_usage(message: impl Into<String>) -> Self {
        GpuError::InvalidUsage(message.into())
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::OutOfDate,
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => GpuError::Timeout,
            other => GpuError::Vulkan(other),
        }
    }
}

/// Log a structural creation failure and wrap it as fatal.
pub(crate) fn fatal(what: &'static str, err: GpuError) -> GpuError {
    if let GpuError::Creation { .. } = err {
        return err;
    }
    log::error!("FATAL: failed to create {}: {}", what, err);
    GpuError::Creation {
        what,
        source: Box::new(err),
    }
}
