//! Adapter selection and the logical device
//!
//! [`DeviceContext::select`] scores every adapter the instance reports, opens
//! the winner and fetches its graphics, present and transfer queues. The
//! context is created once and destroyed last, after all GPU work completed.

use std::collections::BTreeSet;

use ash::vk;

use crate::backend::{GpuDevice, GpuInstance, SurfaceSupport};
use crate::error::{api, creation, RenderError, RenderResult};
use crate::presentation;

/// Device extension every adapter must expose
pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";

/// Capabilities of one queue family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCaps {
    /// Operations the family supports
    pub flags: vk::QueueFlags,
    /// Number of queues in the family
    pub queue_count: u32,
    /// Whether the family can present to the engine surface
    pub supports_present: bool,
}

/// Everything selection needs to know about a physical adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Driver-reported device name
    pub name: String,
    /// Backend handle
    pub handle: vk::PhysicalDevice,
    /// Discrete, integrated, virtual, ...
    pub device_type: vk::PhysicalDeviceType,
    /// Supported device extension names
    pub extensions: Vec<String>,
    /// Whether anisotropic sampling is available
    pub sampler_anisotropy: bool,
    /// Largest supported anisotropy
    pub max_sampler_anisotropy: f32,
    /// Largest 2D image dimension
    pub max_image_dimension_2d: u32,
    /// Queue families in index order
    pub queue_families: Vec<QueueFamilyCaps>,
    /// Surface capabilities when paired with the engine surface
    pub surface: SurfaceSupport,
}

impl AdapterInfo {
    /// Discrete GPUs are treated as dedicated devices
    pub fn is_dedicated(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|available| available == name)
    }
}

/// Features and extensions a device must provide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequirements {
    /// Extension names to enable
    pub extensions: Vec<String>,
    /// Require anisotropic sampling
    pub sampler_anisotropy: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            sampler_anisotropy: true,
        }
    }
}

impl DeviceRequirements {
    /// Name of the first requirement `adapter` fails, if any
    pub fn first_missing(&self, adapter: &AdapterInfo) -> Option<String> {
        if let Some(extension) = self.extensions.iter().find(|e| !adapter.has_extension(e)) {
            return Some(format!("extension {extension}"));
        }
        if self.sampler_anisotropy && !adapter.sampler_anisotropy {
            return Some("feature samplerAnisotropy".to_string());
        }
        None
    }
}

/// Family indices for the three queues the core uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family used for drawing
    pub graphics: u32,
    /// Family used for presentation
    pub present: u32,
    /// Family used for staging copies
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Resolve all three families, or `None` if graphics or present is missing.
    ///
    /// Transfer prefers a family with transfer but neither graphics nor compute
    /// support, and falls back to the graphics family. Present prefers the
    /// graphics family when it can present.
    pub fn resolve(families: &[QueueFamilyCaps]) -> Option<Self> {
        let indexed = || families.iter().enumerate().filter(|(_, f)| f.queue_count > 0);

        let graphics = indexed()
            .find(|(_, f)| f.flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i)?;

        let present = if families[graphics].supports_present {
            graphics
        } else {
            indexed().find(|(_, f)| f.supports_present).map(|(i, _)| i)?
        };

        let transfer = indexed()
            .find(|(_, f)| {
                f.flags.contains(vk::QueueFlags::TRANSFER)
                    && !f.flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map_or(graphics, |(i, _)| i);

        Some(Self {
            graphics: u32::try_from(graphics).ok()?,
            present: u32::try_from(present).ok()?,
            transfer: u32::try_from(transfer).ok()?,
        })
    }

    /// Whether copies run on a family other than graphics
    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }

    /// Distinct family indices in ascending order
    pub fn unique(&self) -> Vec<u32> {
        [self.graphics, self.present, self.transfer]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Added for a discrete GPU
pub const DEDICATED_BONUS: u64 = 1000;

/// Score an adapter; zero means unusable.
///
/// The image size limit only breaks ties and stays below [`DEDICATED_BONUS`].
pub fn score_adapter(adapter: &AdapterInfo, requirements: &DeviceRequirements) -> u64 {
    if requirements.first_missing(adapter).is_some()
        || QueueFamilyIndices::resolve(&adapter.queue_families).is_none()
        || !presentation::is_usable(&adapter.surface)
    {
        return 0;
    }

    let mut score = 1 + (u64::from(adapter.max_image_dimension_2d) / 64).min(DEDICATED_BONUS - 2);
    if adapter.is_dedicated() {
        score += DEDICATED_BONUS;
    }
    score
}

/// Highest scoring adapter, first in enumeration order on ties
pub fn pick_adapter<'a>(
    adapters: &'a [AdapterInfo],
    requirements: &DeviceRequirements,
) -> RenderResult<&'a AdapterInfo> {
    let mut best: Option<(&AdapterInfo, u64)> = None;
    for adapter in adapters {
        let score = score_adapter(adapter, requirements);
        log::debug!("Adapter '{}' scored {}", adapter.name, score);
        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((adapter, score));
        }
    }

    best.map(|(adapter, _)| adapter).ok_or_else(|| {
        let reason = if adapters.is_empty() {
            "no adapters reported".to_string()
        } else {
            adapters
                .iter()
                .map(|a| format!("{}: {}", a.name, rejection_reason(a, requirements)))
                .collect::<Vec<_>>()
                .join("; ")
        };
        RenderError::DeviceSelection { reason }
    })
}

fn rejection_reason(adapter: &AdapterInfo, requirements: &DeviceRequirements) -> String {
    if let Some(missing) = requirements.first_missing(adapter) {
        format!("missing {missing}")
    } else if QueueFamilyIndices::resolve(&adapter.queue_families).is_none() {
        "no graphics or present queue".to_string()
    } else {
        "surface has no formats or present modes".to_string()
    }
}

/// Selected adapter, its logical device and queues
pub struct DeviceContext<D: GpuDevice> {
    adapter: AdapterInfo,
    families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
    device: D,
}

impl<D: GpuDevice> DeviceContext<D> {
    /// Pick the best adapter and open it
    pub fn select<I>(instance: &I, requirements: &DeviceRequirements) -> RenderResult<Self>
    where
        I: GpuInstance<Device = D>,
    {
        let adapters = instance
            .enumerate_adapters()
            .map_err(api("adapter enumeration"))?;
        let adapter = pick_adapter(&adapters, requirements)?.clone();
        let families = QueueFamilyIndices::resolve(&adapter.queue_families).ok_or_else(|| {
            RenderError::DeviceSelection {
                reason: format!("{} lost its queue families", adapter.name),
            }
        })?;

        let device = instance
            .create_device(&adapter, &families, requirements)
            .map_err(creation("logical device"))?;

        log::info!(
            "Selected GPU: {} ({:?}), queues graphics={} present={} transfer={}",
            adapter.name,
            adapter.device_type,
            families.graphics,
            families.present,
            families.transfer
        );

        Ok(Self {
            graphics_queue: device.queue(families.graphics),
            present_queue: device.queue(families.present),
            transfer_queue: device.queue(families.transfer),
            adapter,
            families,
            device,
        })
    }

    /// Backend device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Selected adapter
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// Resolved queue families
    pub fn families(&self) -> QueueFamilyIndices {
        self.families
    }

    /// Queue used for drawing
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Queue used for presentation
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Queue used for staging copies
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Whether the adapter is a dedicated GPU
    pub fn is_dedicated(&self) -> bool {
        self.adapter.is_dedicated()
    }

    /// Block until all device work completes
    pub fn wait_idle(&self) -> RenderResult<()> {
        self.device.wait_idle().map_err(api("device wait idle"))
    }

    /// Consume the context, handing back the device for teardown
    pub fn into_device(self) -> D {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessAdapter;

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            flags,
            queue_count: 1,
            supports_present: present,
        }
    }

    #[test]
    fn test_dedicated_transfer_family_is_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, true),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let indices = QueueFamilyIndices::resolve(&families).unwrap();
        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, 0);
        assert_eq!(indices.transfer, 2);
        assert!(indices.has_dedicated_transfer());
        assert_eq!(indices.unique(), vec![0, 2]);
    }

    #[test]
    fn test_transfer_falls_back_to_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true)];
        let indices = QueueFamilyIndices::resolve(&families).unwrap();
        assert_eq!(indices.transfer, indices.graphics);
        assert!(!indices.has_dedicated_transfer());
    }

    #[test]
    fn test_present_on_separate_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::TRANSFER, true),
        ];
        let indices = QueueFamilyIndices::resolve(&families).unwrap();
        assert_eq!(indices.present, 1);
    }

    #[test]
    fn test_missing_graphics_is_unresolved() {
        let families = [family(vk::QueueFlags::TRANSFER, true)];
        assert!(QueueFamilyIndices::resolve(&families).is_none());
    }

    #[test]
    fn test_discrete_complete_beats_integrated_incomplete() {
        let requirements = DeviceRequirements::default();
        let discrete = HeadlessAdapter::discrete("Discrete").build();
        let integrated = HeadlessAdapter::integrated("Integrated")
            .without_extension(SWAPCHAIN_EXTENSION)
            .build();

        assert!(score_adapter(&discrete, &requirements) > 1000);
        assert_eq!(score_adapter(&integrated, &requirements), 0);

        let adapters = [integrated, discrete];
        let picked = pick_adapter(&adapters, &requirements).unwrap();
        assert_eq!(picked.name, "Discrete");
    }

    #[test]
    fn test_only_incomplete_adapter_fails_selection() {
        let requirements = DeviceRequirements::default();
        let adapters = [HeadlessAdapter::integrated("Integrated")
            .without_extension(SWAPCHAIN_EXTENSION)
            .build()];
        let error = pick_adapter(&adapters, &requirements).unwrap_err();
        match error {
            RenderError::DeviceSelection { reason } => {
                assert!(reason.contains("VK_KHR_swapchain"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unusable_surface_scores_zero() {
        let adapter = HeadlessAdapter::discrete("No modes").without_present_modes().build();
        assert_eq!(score_adapter(&adapter, &DeviceRequirements::default()), 0);
    }

    #[test]
    fn test_discrete_bonus_outweighs_image_limit() {
        let requirements = DeviceRequirements::default();
        let discrete = HeadlessAdapter::discrete("Discrete").max_image_dimension(4096).build();
        for limit in [4096 + 999, 16384, u32::MAX] {
            let integrated = HeadlessAdapter::integrated("Integrated")
                .max_image_dimension(limit)
                .build();
            assert!(score_adapter(&discrete, &requirements) > score_adapter(&integrated, &requirements));
        }
    }

    #[test]
    fn test_image_limit_breaks_ties() {
        let requirements = DeviceRequirements::default();
        let small = HeadlessAdapter::integrated("Small").max_image_dimension(8192).build();
        let large = HeadlessAdapter::integrated("Large").max_image_dimension(16384).build();
        assert!(score_adapter(&large, &requirements) > score_adapter(&small, &requirements));
        assert!(score_adapter(&large, &requirements) < DEDICATED_BONUS);
    }
}
