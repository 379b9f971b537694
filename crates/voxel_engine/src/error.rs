//! Error types for the rendering core
//!
//! Every fallible operation returns [`RenderResult`]. Backend calls report raw
//! `vk::Result` codes; the helpers here attach context and sort those codes
//! into the error classes the engine acts on.

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;

/// Misuse of a GPU resource by the caller.
///
/// These are programmer errors. In debug builds the engine raises them
/// immediately; release builds may degrade gracefully where a policy allows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceMisuse {
    /// A transfer endpoint refers to an allocation that is not valid
    #[error("buffer allocation is not valid")]
    InvalidBuffer,

    /// A mesh was drawn before its geometry reached the GPU
    #[error("mesh has no GPU allocation")]
    UnuploadedMesh,

    /// The allocation has already been destroyed
    #[error("allocation was already destroyed")]
    AlreadyDestroyed,

    /// The allocation belongs to a different allocator
    #[error("allocation belongs to another allocator")]
    ForeignAllocation,

    /// A buffer operation received an image allocation or the reverse
    #[error("expected a {expected} allocation")]
    WrongKind {
        /// Kind the operation needed
        expected: &'static str,
    },

    /// Upload data does not fit the destination allocation
    #[error("upload of {requested} bytes exceeds allocation of {capacity} bytes")]
    UploadTooLarge {
        /// Bytes the caller tried to write
        requested: u64,
        /// Size of the destination allocation
        capacity: u64,
    },

    /// A frame slot was recorded while its previous submission may still run
    #[error("frame slot {index} is still in flight")]
    FrameSlotNotReady {
        /// Slot index
        index: usize,
    },

    /// A frame was recorded with no scene loaded
    #[error("no scene is loaded")]
    NoScene,

    /// The presentation chain is not in a state that allows the operation
    #[error("presentation chain is {state}")]
    ChainNotReady {
        /// Name of the current chain state
        state: &'static str,
    },
}

/// Errors raised by the rendering core
#[derive(Error, Debug)]
pub enum RenderError {
    /// No adapter satisfied the device requirements
    #[error("no suitable GPU: {reason}")]
    DeviceSelection {
        /// Why every candidate was rejected
        reason: String,
    },

    /// A GPU object could not be created
    #[error("failed to create {what}: {result:?}")]
    ResourceCreation {
        /// Object being created
        what: &'static str,
        /// Result code the backend reported
        result: vk::Result,
    },

    /// An asset on disk could not be read or decoded
    #[error("failed to load asset '{path}': {reason}")]
    AssetLoad {
        /// Path the caller supplied
        path: String,
        /// Decoder or I/O message
        reason: String,
    },

    /// The presentation surface no longer matches the chain
    #[error("presentation surface is out of date")]
    StaleSurface,

    /// A resource was used against its lifecycle rules
    #[error("invalid resource use: {0}")]
    InvalidResourceUse(#[from] ResourceMisuse),

    /// A GPU call failed outside resource creation
    #[error("{context} failed: {result:?}")]
    Api {
        /// Operation that failed
        context: &'static str,
        /// Result code the backend reported
        result: vk::Result,
    },

    /// The device was lost and cannot be recovered
    #[error("GPU device lost during {context}")]
    DeviceLost {
        /// Operation that observed the loss
        context: &'static str,
    },

    /// Renderer configuration was rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The window system failed
    #[error("window error: {0}")]
    Window(String),
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    /// Classify a failed GPU call made in `context`.
    pub fn from_vk(context: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => Self::StaleSurface,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost { context },
            result => Self::Api { context, result },
        }
    }

    /// Returns true when the engine absorbs this error inside a tick
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StaleSurface)
    }
}

/// Map a creation failure for `what`.
///
/// Out-of-date and device-lost codes keep their own classes because the
/// caller reacts to those differently from an ordinary creation failure.
pub fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |result| match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::StaleSurface,
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost { context: what },
        result => RenderError::ResourceCreation { what, result },
    }
}

/// Map a failed call that does not create anything.
pub fn api(context: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |result| RenderError::from_vk(context, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_codes_are_stale() {
        assert!(matches!(
            RenderError::from_vk("acquire", vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderError::StaleSurface
        ));
        assert!(matches!(
            RenderError::from_vk("present", vk::Result::SUBOPTIMAL_KHR),
            RenderError::StaleSurface
        ));
        assert!(RenderError::StaleSurface.is_recoverable());
    }

    #[test]
    fn test_device_lost_is_fatal() {
        let error = RenderError::from_vk("submit", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(error, RenderError::DeviceLost { context: "submit" }));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_creation_keeps_object_name() {
        let error = creation("depth image")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(
            error.to_string(),
            "failed to create depth image: ERROR_OUT_OF_DEVICE_MEMORY"
        );
    }

    #[test]
    fn test_misuse_converts() {
        let error: RenderError = ResourceMisuse::AlreadyDestroyed.into();
        assert!(matches!(
            error,
            RenderError::InvalidResourceUse(ResourceMisuse::AlreadyDestroyed)
        ));
    }
}
