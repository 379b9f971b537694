//! Textures sampled by materials
//!
//! Images are decoded on the CPU, packed into one GPU image (one layer per
//! input for array textures) and uploaded through the staging path.

use std::path::{Path, PathBuf};

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::backend::{GpuDevice, ImageDesc, SamplerDesc};
use crate::device::DeviceContext;
use crate::error::{creation, RenderError, RenderResult};
use crate::memory::{Allocation, MemoryAllocator};

/// Texel filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    /// Nearest texel, the usual choice for voxel art
    Nearest,
    /// Bilinear
    Linear,
}

/// Behaviour outside the 0..1 texture coordinate range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapMode {
    /// Tile
    Repeat,
    /// Tile with mirroring
    MirroredRepeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

/// Sampler parameters of a material
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Min and mag filter
    pub filter: FilterMode,
    /// Address mode on every axis
    pub wrap: WrapMode,
    /// Request anisotropic filtering when the adapter supports it
    pub anisotropy: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            filter: FilterMode::Nearest,
            wrap: WrapMode::Repeat,
            anisotropy: true,
        }
    }
}

impl SamplerConfig {
    /// Backend sampler parameters; anisotropy is capped by `max_anisotropy`
    /// and by what the adapter reports
    pub fn to_desc(&self, supported: bool, adapter_max: f32, max_anisotropy: f32) -> SamplerDesc {
        SamplerDesc {
            filter: match self.filter {
                FilterMode::Nearest => vk::Filter::NEAREST,
                FilterMode::Linear => vk::Filter::LINEAR,
            },
            address_mode: match self.wrap {
                WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
                WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
                WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            },
            anisotropy: (self.anisotropy && supported && max_anisotropy >= 1.0)
                .then(|| max_anisotropy.min(adapter_max).max(1.0)),
        }
    }
}

/// Decoded pixels, tightly packed row by row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channels per pixel (1..=4)
    pub channels: u8,
    /// Pixel data
    pub pixels: Vec<u8>,
}

/// Image decoding collaborator
pub trait ImageDecoder {
    /// Decode the image at `path`
    fn decode(&self, path: &Path) -> RenderResult<DecodedImage>;
}

/// Decoder reading files through the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDecoder;

impl ImageDecoder for FileDecoder {
    fn decode(&self, path: &Path) -> RenderResult<DecodedImage> {
        log::debug!("Loading image from: {:?}", path);
        let img = image::open(path).map_err(|e| RenderError::AssetLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let channels = img.color().channel_count().clamp(1, 4);
        let (width, height) = (img.width(), img.height());
        let pixels = match channels {
            1 => img.to_luma8().into_raw(),
            2 => img.to_luma_alpha8().into_raw(),
            3 => img.to_rgb8().into_raw(),
            _ => img.to_rgba8().into_raw(),
        };
        log::info!("Loaded image {}x{} ({} channels) from {:?}", width, height, channels, path);
        Ok(DecodedImage {
            width,
            height,
            channels,
            pixels,
        })
    }
}

/// Layers packed into one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedLayers {
    /// Common layer width
    pub width: u32,
    /// Common layer height
    pub height: u32,
    /// Channels per texel after packing (1, 2 or 4)
    pub channels: u8,
    /// Number of layers
    pub layers: u32,
    /// Layer-major texel data
    pub data: Vec<u8>,
}

impl PackedLayers {
    /// GPU format matching the packed channel count
    pub fn format(&self) -> vk::Format {
        match self.channels {
            1 => vk::Format::R8_UNORM,
            2 => vk::Format::R8G8_UNORM,
            _ => vk::Format::R8G8B8A8_SRGB,
        }
    }

    /// Layer size
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// Pad every image to the largest width, height and channel count.
///
/// Three channels widen to four since RGB8 is rarely sampleable. Padding
/// texels are zero; absent alpha reads as opaque.
pub fn pack_layers(images: &[DecodedImage]) -> PackedLayers {
    let width = images.iter().map(|i| i.width).max().unwrap_or(1).max(1);
    let height = images.iter().map(|i| i.height).max().unwrap_or(1).max(1);
    let channels = match images.iter().map(|i| i.channels).max().unwrap_or(4) {
        3 => 4,
        c => c.clamp(1, 4),
    };

    let texel = usize::from(channels);
    let layer_len = width as usize * height as usize * texel;
    let mut data = vec![0; layer_len * images.len()];
    for (layer, image) in images.iter().enumerate() {
        let src_texel = usize::from(image.channels.max(1));
        let base = layer * layer_len;
        for y in 0..image.height as usize {
            for x in 0..image.width as usize {
                let src = (y * image.width as usize + x) * src_texel;
                let dst = base + (y * width as usize + x) * texel;
                let Some(pixel) = image.pixels.get(src..src + src_texel) else {
                    continue;
                };
                let copied = src_texel.min(texel);
                data[dst..dst + copied].copy_from_slice(&pixel[..copied]);
                if texel == 4 && src_texel < 4 {
                    data[dst + 3] = u8::MAX;
                }
            }
        }
    }

    PackedLayers {
        width,
        height,
        channels,
        layers: images.len() as u32,
        data,
    }
}

/// GPU image, view and sampler built from one or more image files
#[derive(Debug)]
pub struct Texture {
    allocation: Allocation,
    view: vk::ImageView,
    sampler: vk::Sampler,
    format: vk::Format,
    extent: vk::Extent2D,
    layers: u32,
}

impl Texture {
    /// Decode `paths`, upload them and build the sampler.
    ///
    /// Without `is_array` only the first path is used.
    #[allow(clippy::too_many_arguments)]
    pub fn create<D: GpuDevice>(
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
        decoder: &dyn ImageDecoder,
        paths: &[PathBuf],
        is_array: bool,
        sampler: &SamplerConfig,
        max_anisotropy: f32,
    ) -> RenderResult<Self> {
        let paths = if is_array {
            paths
        } else {
            if paths.len() > 1 {
                log::warn!("Material lists {} textures but is not an array; using the first", paths.len());
            }
            &paths[..paths.len().min(1)]
        };
        if paths.is_empty() {
            return Err(RenderError::AssetLoad {
                path: String::new(),
                reason: "material has no textures".to_string(),
            });
        }

        let images = paths
            .iter()
            .map(|path| decoder.decode(path))
            .collect::<RenderResult<Vec<_>>>()?;
        let packed = pack_layers(&images);
        let format = packed.format();
        let extent = packed.extent();

        let mut allocation = allocator.create_image(
            ctx,
            &ImageDesc {
                extent,
                format,
                usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                array_layers: packed.layers,
            },
        )?;

        match Self::finish(ctx, allocator, &allocation, &packed, is_array, sampler, max_anisotropy) {
            Ok((view, sampler)) => {
                log::debug!(
                    "Created texture {}x{} with {} layer(s), {:?}",
                    extent.width,
                    extent.height,
                    packed.layers,
                    format
                );
                Ok(Self {
                    allocation,
                    view,
                    sampler,
                    format,
                    extent,
                    layers: packed.layers,
                })
            }
            Err(error) => {
                ctx.wait_idle()?;
                allocator.flush(ctx)?;
                allocator.destroy_image(ctx, &mut allocation)?;
                Err(error)
            }
        }
    }

    fn finish<D: GpuDevice>(
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
        allocation: &Allocation,
        packed: &PackedLayers,
        is_array: bool,
        sampler: &SamplerConfig,
        max_anisotropy: f32,
    ) -> RenderResult<(vk::ImageView, vk::Sampler)> {
        allocator.upload_to_image(ctx, allocation, &packed.data, packed.extent(), packed.layers)?;

        let view = allocator.create_image_view(
            ctx,
            allocation,
            packed.format(),
            vk::ImageAspectFlags::COLOR,
            packed.layers,
            is_array,
        )?;

        let device = ctx.device();
        let adapter = ctx.adapter();
        let desc = sampler.to_desc(
            adapter.sampler_anisotropy,
            adapter.max_sampler_anisotropy,
            max_anisotropy,
        );
        match device.create_sampler(&desc) {
            Ok(sampler) => Ok((view, sampler)),
            Err(error) => {
                device.destroy_image_view(view);
                Err(creation("texture sampler")(error))
            }
        }
    }

    /// Image view covering every layer
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Layer size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of layers
    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Image allocation
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Free the view, sampler and image. The caller has waited for the device to go idle.
    pub fn destroy<D: GpuDevice>(
        mut self,
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
    ) -> RenderResult<()> {
        let device = ctx.device();
        device.destroy_sampler(self.sampler);
        device.destroy_image_view(self.view);
        allocator.destroy_image(ctx, &mut self.allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::backend::headless::{GpuCall, HeadlessInstance, ObjectKind};
    use crate::device::DeviceRequirements;

    /// Decoder serving images from memory
    #[derive(Default)]
    struct MemoryDecoder {
        images: HashMap<PathBuf, DecodedImage>,
    }

    impl MemoryDecoder {
        fn with(mut self, path: &str, image: DecodedImage) -> Self {
            self.images.insert(PathBuf::from(path), image);
            self
        }
    }

    impl ImageDecoder for MemoryDecoder {
        fn decode(&self, path: &Path) -> RenderResult<DecodedImage> {
            self.images.get(path).cloned().ok_or_else(|| RenderError::AssetLoad {
                path: path.display().to_string(),
                reason: "not found".to_string(),
            })
        }
    }

    fn solid(width: u32, height: u32, channels: u8, value: u8) -> DecodedImage {
        DecodedImage {
            width,
            height,
            channels,
            pixels: vec![value; (width * height) as usize * usize::from(channels)],
        }
    }

    #[test]
    fn test_pack_pads_to_largest() {
        let packed = pack_layers(&[solid(2, 2, 4, 9), solid(1, 1, 1, 7)]);
        assert_eq!((packed.width, packed.height, packed.channels, packed.layers), (2, 2, 4, 2));
        assert_eq!(packed.data.len(), 2 * 2 * 4 * 2);
        assert_eq!(packed.format(), vk::Format::R8G8B8A8_SRGB);

        let second = &packed.data[16..];
        // gray lands in red with opaque alpha
        assert_eq!(&second[..4], &[7, 0, 0, 255]);
        // padding stays zero
        assert_eq!(&second[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_pack_widens_rgb() {
        let packed = pack_layers(&[solid(1, 1, 3, 5)]);
        assert_eq!(packed.channels, 4);
        assert_eq!(packed.data, vec![5, 5, 5, 255]);

        let gray = pack_layers(&[solid(1, 1, 1, 5)]);
        assert_eq!(gray.format(), vk::Format::R8_UNORM);
    }

    #[test]
    fn test_sampler_anisotropy_is_capped() {
        let config = SamplerConfig::default();
        assert_eq!(config.to_desc(true, 8.0, 16.0).anisotropy, Some(8.0));
        assert_eq!(config.to_desc(false, 8.0, 16.0).anisotropy, None);
        let linear = SamplerConfig {
            filter: FilterMode::Linear,
            wrap: WrapMode::ClampToEdge,
            anisotropy: false,
        };
        let desc = linear.to_desc(true, 16.0, 16.0);
        assert_eq!(desc.filter, vk::Filter::LINEAR);
        assert_eq!(desc.address_mode, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(desc.anisotropy, None);
    }

    #[test]
    fn test_file_decoder_names_missing_path() {
        let error = FileDecoder
            .decode(Path::new("does/not/exist.png"))
            .unwrap_err();
        match error {
            RenderError::AssetLoad { path, .. } => assert!(path.contains("exist.png")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_file_decoder_reads_png() {
        let path = std::env::temp_dir().join("voxel_engine_texture_test.png");
        image::RgbaImage::from_pixel(3, 2, image::Rgba([1, 2, 3, 4]))
            .save(&path)
            .unwrap();
        let decoded = FileDecoder.decode(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((decoded.width, decoded.height, decoded.channels), (3, 2, 4));
        assert_eq!(&decoded.pixels[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_array_texture_lifecycle() {
        let instance = HeadlessInstance::default();
        let probe = instance.probe();
        let ctx = DeviceContext::select(&instance, &DeviceRequirements::default()).unwrap();
        let mut allocator = MemoryAllocator::new(&ctx, 8, u64::MAX).unwrap();
        let decoder = MemoryDecoder::default()
            .with("grass.png", solid(16, 16, 4, 1))
            .with("dirt.png", solid(8, 8, 4, 2));

        let texture = Texture::create(
            &ctx,
            &mut allocator,
            &decoder,
            &[PathBuf::from("grass.png"), PathBuf::from("dirt.png")],
            true,
            &SamplerConfig::default(),
            16.0,
        )
        .unwrap();
        assert_eq!(texture.layers(), 2);
        assert_eq!(texture.extent(), vk::Extent2D { width: 16, height: 16 });
        assert!(probe.calls().iter().any(|c| matches!(
            c,
            GpuCall::CreateImage { layers: 2, .. }
        )));
        assert_eq!(probe.live(ObjectKind::Sampler), 1);

        ctx.wait_idle().unwrap();
        allocator.drain_completed(&ctx).unwrap();
        texture.destroy(&ctx, &mut allocator).unwrap();
        assert_eq!(allocator.live_allocations(), 0);
        assert_eq!(probe.live(ObjectKind::Sampler), 0);
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_one_layer_array_texture_uses_array_view() {
        let instance = HeadlessInstance::default();
        let probe = instance.probe();
        let ctx = DeviceContext::select(&instance, &DeviceRequirements::default()).unwrap();
        let mut allocator = MemoryAllocator::new(&ctx, 8, u64::MAX).unwrap();
        let decoder = MemoryDecoder::default().with("grass.png", solid(4, 4, 4, 1));

        let texture = Texture::create(
            &ctx,
            &mut allocator,
            &decoder,
            &[PathBuf::from("grass.png")],
            true,
            &SamplerConfig::default(),
            16.0,
        )
        .unwrap();
        assert_eq!(texture.layers(), 1);
        assert!(probe.calls().iter().any(|c| matches!(
            c,
            GpuCall::CreateImageView { view, view_type: vk::ImageViewType::TYPE_2D_ARRAY, layer_count: 1 }
                if *view == texture.view()
        )));

        ctx.wait_idle().unwrap();
        allocator.drain_completed(&ctx).unwrap();
        texture.destroy(&ctx, &mut allocator).unwrap();
    }

    #[test]
    fn test_decode_failure_creates_nothing() {
        let instance = HeadlessInstance::default();
        let ctx = DeviceContext::select(&instance, &DeviceRequirements::default()).unwrap();
        let mut allocator = MemoryAllocator::new(&ctx, 8, u64::MAX).unwrap();

        let error = Texture::create(
            &ctx,
            &mut allocator,
            &MemoryDecoder::default(),
            &[PathBuf::from("missing.png")],
            false,
            &SamplerConfig::default(),
            16.0,
        )
        .unwrap_err();
        assert!(matches!(error, RenderError::AssetLoad { ref path, .. } if path == "missing.png"));
        assert_eq!(allocator.live_allocations(), 0);
    }
}
