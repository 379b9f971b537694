//! GPU memory allocation and staged uploads
//!
//! [`MemoryAllocator`] hands out [`Allocation`] handles for buffers and images
//! and tracks every live one, so lifecycle mistakes surface as
//! [`ResourceMisuse`] instead of undefined GPU behavior.
//!
//! Host data reaches device-local memory through a staging buffer copied on
//! the transfer queue. When the transfer family differs from the graphics
//! family the copy ends with a queue family release, and a second submission
//! on the graphics queue acquires ownership. Staging memory is not freed on
//! the spot: each upload leaves an entry in a bounded deferred-free queue that
//! the engine drains once per tick, releasing entries whose fence signaled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use slotmap::{new_key_type, SlotMap};

use crate::backend::{
    BufferBarrier, BufferDesc, GpuDevice, ImageBarrier, ImageDesc, ImageViewDesc, MemoryLocation,
};
use crate::device::DeviceContext;
use crate::error::{api, creation, RenderError, RenderResult, ResourceMisuse};
use crate::recorder::CommandRecorder;

new_key_type! {
    /// Key of an allocation record
    pub struct AllocationKey;
}

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// What an allocation backs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// A buffer
    Buffer,
    /// A 2D or array image
    Image,
}

/// Handle to GPU memory owned by a [`MemoryAllocator`]
///
/// Valid from successful creation until passed to
/// [`MemoryAllocator::destroy`]. Not `Clone`: the handle is the ownership.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    key: AllocationKey,
    owner: u64,
    kind: AllocationKind,
    size: u64,
    valid: bool,
}

impl Allocation {
    /// Whether the allocation has not been destroyed
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Buffer or image
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

struct Record<M> {
    resource: Resource,
    memory: M,
}

/// Instrumentation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Allocations currently alive
    pub live: usize,
    /// Bytes held by live allocations
    pub live_bytes: u64,
    /// Allocations created so far
    pub created: u64,
    /// Allocations destroyed so far
    pub destroyed: u64,
    /// Staging uploads awaiting cleanup
    pub pending_frees: usize,
    /// Staging uploads already cleaned up
    pub completed_uploads: u64,
}

/// Resources of one upload released once its fence signals
struct PendingFree<M> {
    fence: vk::Fence,
    staging: vk::Buffer,
    staging_memory: M,
    command_buffers: Vec<(vk::CommandPool, vk::CommandBuffer)>,
    semaphore: Option<vk::Semaphore>,
}

impl<M> PendingFree<M> {
    fn release<D: GpuDevice<Memory = M>>(self, device: &D) {
        device.destroy_buffer(self.staging, self.staging_memory);
        for (pool, command_buffer) in self.command_buffers {
            device.free_command_buffer(pool, command_buffer);
        }
        if let Some(semaphore) = self.semaphore {
            device.destroy_semaphore(semaphore);
        }
        if self.fence != vk::Fence::null() {
            device.destroy_fence(self.fence);
        }
    }
}

/// Bounded queue of uploads whose staging resources await release
pub struct DeferredFreeQueue<M> {
    entries: VecDeque<PendingFree<M>>,
    capacity: usize,
}

impl<M> DeferredFreeQueue<M> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Entries not yet released
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing awaits release
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every entry whose fence has signaled; never blocks
    fn drain_completed<D: GpuDevice<Memory = M>>(&mut self, device: &D) -> RenderResult<usize> {
        let mut released = 0;
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            if device.fence_signaled(entry.fence).map_err(api("fence status"))? {
                entry.release(device);
                released += 1;
            } else {
                remaining.push_back(entry);
            }
        }
        self.entries = remaining;
        Ok(released)
    }

    /// Make room for one entry, waiting on the oldest if the queue is full
    fn reserve<D: GpuDevice<Memory = M>>(&mut self, device: &D, timeout: u64) -> RenderResult<usize> {
        let mut released = self.drain_completed(device)?;
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.entries.pop_front() else { break };
            log::debug!("Deferred-free queue full, waiting on oldest upload");
            if let Err(error) = device.wait_for_fence(oldest.fence, timeout) {
                self.entries.push_front(oldest);
                return Err(api("staging fence wait")(error));
            }
            oldest.release(device);
            released += 1;
        }
        Ok(released)
    }

    /// Wait for and release everything
    fn flush<D: GpuDevice<Memory = M>>(&mut self, device: &D, timeout: u64) -> RenderResult<usize> {
        let mut released = 0;
        while let Some(entry) = self.entries.pop_front() {
            if let Err(error) = device.wait_for_fence(entry.fence, timeout) {
                self.entries.push_front(entry);
                return Err(api("staging fence wait")(error));
            }
            entry.release(device);
            released += 1;
        }
        Ok(released)
    }
}

/// Where an uploaded resource is consumed
#[derive(Debug, Clone, Copy)]
struct Consumer {
    stage: vk::PipelineStageFlags,
    access: vk::AccessFlags,
}

const VERTEX_INPUT: Consumer = Consumer {
    stage: vk::PipelineStageFlags::VERTEX_INPUT,
    access: vk::AccessFlags::from_raw(
        vk::AccessFlags::VERTEX_ATTRIBUTE_READ.as_raw() | vk::AccessFlags::INDEX_READ.as_raw(),
    ),
};

const FRAGMENT_SAMPLING: Consumer = Consumer {
    stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
    access: vk::AccessFlags::SHADER_READ,
};

/// Allocates GPU memory and moves host data into it
pub struct MemoryAllocator<D: GpuDevice> {
    id: u64,
    records: SlotMap<AllocationKey, Record<D::Memory>>,
    stats: AllocatorStats,
    transfer_pool: vk::CommandPool,
    graphics_pool: Option<vk::CommandPool>,
    pending: DeferredFreeQueue<D::Memory>,
    fence_timeout: u64,
}

impl<D: GpuDevice> MemoryAllocator<D> {
    /// Create an allocator with room for `max_pending_uploads` in-flight uploads
    pub fn new(
        ctx: &DeviceContext<D>,
        max_pending_uploads: usize,
        fence_timeout: u64,
    ) -> RenderResult<Self> {
        let device = ctx.device();
        let families = ctx.families();
        let transfer_pool = device
            .create_command_pool(families.transfer, true)
            .map_err(creation("transfer command pool"))?;
        let graphics_pool = if families.has_dedicated_transfer() {
            match device.create_command_pool(families.graphics, true) {
                Ok(pool) => Some(pool),
                Err(error) => {
                    device.destroy_command_pool(transfer_pool);
                    return Err(creation("ownership command pool")(error));
                }
            }
        } else {
            None
        };

        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            records: SlotMap::with_key(),
            stats: AllocatorStats::default(),
            transfer_pool,
            graphics_pool,
            pending: DeferredFreeQueue::new(max_pending_uploads),
            fence_timeout,
        })
    }

    /// Current instrumentation counters
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            pending_frees: self.pending.len(),
            ..self.stats
        }
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.records.len()
    }

    fn register(&mut self, resource: Resource, memory: D::Memory, size: u64) -> Allocation {
        let kind = match resource {
            Resource::Buffer(_) => AllocationKind::Buffer,
            Resource::Image(_) => AllocationKind::Image,
        };
        let key = self.records.insert(Record { resource, memory });
        self.stats.live += 1;
        self.stats.live_bytes += size;
        self.stats.created += 1;
        Allocation {
            key,
            owner: self.id,
            kind,
            size,
            valid: true,
        }
    }

    fn record(&self, allocation: &Allocation) -> RenderResult<&Record<D::Memory>> {
        if allocation.owner != self.id {
            return Err(ResourceMisuse::ForeignAllocation.into());
        }
        if !allocation.valid {
            return Err(ResourceMisuse::AlreadyDestroyed.into());
        }
        self.records
            .get(allocation.key)
            .ok_or_else(|| ResourceMisuse::AlreadyDestroyed.into())
    }

    /// Buffer handle behind `allocation`
    pub fn buffer(&self, allocation: &Allocation) -> RenderResult<vk::Buffer> {
        match self.record(allocation)?.resource {
            Resource::Buffer(buffer) => Ok(buffer),
            Resource::Image(_) => Err(ResourceMisuse::WrongKind { expected: "buffer" }.into()),
        }
    }

    /// Image handle behind `allocation`
    pub fn image(&self, allocation: &Allocation) -> RenderResult<vk::Image> {
        match self.record(allocation)?.resource {
            Resource::Image(image) => Ok(image),
            Resource::Buffer(_) => Err(ResourceMisuse::WrongKind { expected: "image" }.into()),
        }
    }

    /// Create a device-local buffer; contents are not zeroed
    pub fn create_buffer(
        &mut self,
        ctx: &DeviceContext<D>,
        usage: vk::BufferUsageFlags,
        size: u64,
    ) -> RenderResult<Allocation> {
        let desc = BufferDesc {
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        };
        let (buffer, memory) = ctx
            .device()
            .create_buffer(&desc)
            .map_err(creation("buffer"))?;
        log::trace!("Created buffer {:?} ({} bytes)", buffer, size);
        Ok(self.register(Resource::Buffer(buffer), memory, size))
    }

    /// Create a device-local 2D image, optionally with several layers
    pub fn create_image(
        &mut self,
        ctx: &DeviceContext<D>,
        desc: &ImageDesc,
    ) -> RenderResult<Allocation> {
        let (image, memory) = ctx
            .device()
            .create_image(desc)
            .map_err(creation("image"))?;
        let size = u64::from(desc.extent.width)
            * u64::from(desc.extent.height)
            * u64::from(desc.array_layers)
            * bytes_per_texel(desc.format);
        Ok(self.register(Resource::Image(image), memory, size))
    }

    /// Create a view over every layer of an image allocation.
    ///
    /// Array views are `TYPE_2D_ARRAY` even with a single layer.
    pub fn create_image_view(
        &self,
        ctx: &DeviceContext<D>,
        allocation: &Allocation,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        layer_count: u32,
        is_array: bool,
    ) -> RenderResult<vk::ImageView> {
        let image = self.image(allocation)?;
        let view_type = if is_array {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        ctx.device()
            .create_image_view(&ImageViewDesc {
                image,
                format,
                aspect,
                view_type,
                layer_count,
            })
            .map_err(creation("image view"))
    }

    /// Free an allocation. The caller guarantees the GPU no longer uses it.
    pub fn destroy(
        &mut self,
        ctx: &DeviceContext<D>,
        allocation: &mut Allocation,
    ) -> RenderResult<()> {
        if allocation.owner != self.id {
            return Err(ResourceMisuse::ForeignAllocation.into());
        }
        if !allocation.valid {
            return Err(ResourceMisuse::AlreadyDestroyed.into());
        }
        let record = self
            .records
            .remove(allocation.key)
            .ok_or(ResourceMisuse::AlreadyDestroyed)?;
        match record.resource {
            Resource::Buffer(buffer) => ctx.device().destroy_buffer(buffer, record.memory),
            Resource::Image(image) => ctx.device().destroy_image(image, record.memory),
        }
        allocation.valid = false;
        self.stats.live -= 1;
        self.stats.live_bytes -= allocation.size;
        self.stats.destroyed += 1;
        Ok(())
    }

    /// Alias of [`destroy`](Self::destroy) for image allocations
    pub fn destroy_image(
        &mut self,
        ctx: &DeviceContext<D>,
        allocation: &mut Allocation,
    ) -> RenderResult<()> {
        if allocation.kind != AllocationKind::Image {
            return Err(ResourceMisuse::WrongKind { expected: "image" }.into());
        }
        self.destroy(ctx, allocation)
    }

    /// Copy `data` into the start of a buffer allocation through a staging buffer.
    ///
    /// Returns once the copy is submitted; staging memory is released by a
    /// later [`drain_completed`](Self::drain_completed).
    pub fn upload_to_buffer(
        &mut self,
        ctx: &DeviceContext<D>,
        allocation: &Allocation,
        data: &[u8],
    ) -> RenderResult<()> {
        let dst = self.buffer(allocation).map_err(|error| match error {
            RenderError::InvalidResourceUse(ResourceMisuse::AlreadyDestroyed) => {
                ResourceMisuse::InvalidBuffer.into()
            }
            other => other,
        })?;
        let size = data.len() as u64;
        if size > allocation.size {
            return Err(ResourceMisuse::UploadTooLarge {
                requested: size,
                capacity: allocation.size,
            }
            .into());
        }
        if size == 0 {
            return Ok(());
        }

        let families = ctx.families();
        let dedicated = families.has_dedicated_transfer();
        let ignored = vk::QUEUE_FAMILY_IGNORED;
        let (src_family, dst_family) = if dedicated {
            (families.transfer, families.graphics)
        } else {
            (ignored, ignored)
        };

        self.submit_staged(ctx, data, |recorder, staging| {
            let recorder = recorder.copy_buffer(staging, dst, size);
            recorder.buffer_barrier(BufferBarrier {
                buffer: dst,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: if dedicated {
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE
                } else {
                    VERTEX_INPUT.stage
                },
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: if dedicated {
                    vk::AccessFlags::empty()
                } else {
                    VERTEX_INPUT.access
                },
                src_family,
                dst_family,
            })
        }, |recorder| {
            recorder.buffer_barrier(BufferBarrier {
                buffer: dst,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: VERTEX_INPUT.stage,
                src_access: vk::AccessFlags::empty(),
                dst_access: VERTEX_INPUT.access,
                src_family,
                dst_family,
            })
        })
    }

    /// Copy tightly packed layers into an image allocation and leave it in
    /// `SHADER_READ_ONLY_OPTIMAL`, owned by the graphics family.
    pub fn upload_to_image(
        &mut self,
        ctx: &DeviceContext<D>,
        allocation: &Allocation,
        data: &[u8],
        extent: vk::Extent2D,
        layer_count: u32,
    ) -> RenderResult<()> {
        let image = self.image(allocation)?;
        let families = ctx.families();
        let dedicated = families.has_dedicated_transfer();
        let ignored = vk::QUEUE_FAMILY_IGNORED;
        let (src_family, dst_family) = if dedicated {
            (families.transfer, families.graphics)
        } else {
            (ignored, ignored)
        };
        let to_shader_read = |src_stage, dst_stage, src_access, dst_access| ImageBarrier {
            image,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage,
            dst_stage,
            src_access,
            dst_access,
            src_family,
            dst_family,
            layer_count,
        };

        self.submit_staged(ctx, data, |recorder, staging| {
            let recorder = recorder
                .image_barrier(ImageBarrier {
                    image,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::empty(),
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                    src_family: ignored,
                    dst_family: ignored,
                    layer_count,
                })
                .copy_buffer_to_image(staging, image, extent, layer_count);
            if dedicated {
                recorder.image_barrier(to_shader_read(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::empty(),
                ))
            } else {
                recorder.image_barrier(to_shader_read(
                    vk::PipelineStageFlags::TRANSFER,
                    FRAGMENT_SAMPLING.stage,
                    vk::AccessFlags::TRANSFER_WRITE,
                    FRAGMENT_SAMPLING.access,
                ))
            }
        }, |recorder| {
            recorder.image_barrier(to_shader_read(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                FRAGMENT_SAMPLING.stage,
                vk::AccessFlags::empty(),
                FRAGMENT_SAMPLING.access,
            ))
        })
    }

    /// Stage `data`, record the transfer with `transfer`, and when the
    /// families differ record the ownership acquire with `acquire` on the
    /// graphics queue. Resources end up in the deferred-free queue.
    fn submit_staged<'d>(
        &mut self,
        ctx: &'d DeviceContext<D>,
        data: &[u8],
        transfer: impl FnOnce(CommandRecorder<'d, D>, vk::Buffer) -> CommandRecorder<'d, D>,
        acquire: impl FnOnce(CommandRecorder<'d, D>) -> CommandRecorder<'d, D>,
    ) -> RenderResult<()> {
        let device = ctx.device();
        let released = self.pending.reserve(device, self.fence_timeout)?;
        self.stats.completed_uploads += released as u64;

        let (staging, mut staging_memory) = device
            .create_buffer(&BufferDesc {
                size: data.len() as u64,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::HostVisible,
            })
            .map_err(creation("staging buffer"))?;

        if let Err(error) = device.write_memory(&mut staging_memory, 0, data) {
            device.destroy_buffer(staging, staging_memory);
            return Err(api("staging write")(error));
        }

        let mut entry = PendingFree {
            fence: vk::Fence::null(),
            staging,
            staging_memory,
            command_buffers: Vec::with_capacity(2),
            semaphore: None,
        };

        match self.record_and_submit(ctx, &mut entry, transfer, acquire) {
            Ok(()) => {
                self.pending.entries.push_back(entry);
                Ok(())
            }
            Err(error) => {
                // Part of the transfer may already be queued.
                if let Err(idle) = device.wait_idle() {
                    log::warn!("Device idle wait after failed upload: {:?}", idle);
                }
                entry.release(device);
                Err(error)
            }
        }
    }

    fn record_and_submit<'d>(
        &self,
        ctx: &'d DeviceContext<D>,
        entry: &mut PendingFree<D::Memory>,
        transfer: impl FnOnce(CommandRecorder<'d, D>, vk::Buffer) -> CommandRecorder<'d, D>,
        acquire: impl FnOnce(CommandRecorder<'d, D>) -> CommandRecorder<'d, D>,
    ) -> RenderResult<()> {
        let device = ctx.device();

        let transfer_cmd = device
            .allocate_command_buffer(self.transfer_pool)
            .map_err(creation("transfer command buffer"))?;
        entry.command_buffers.push((self.transfer_pool, transfer_cmd));

        let fence = device.create_fence(false).map_err(creation("upload fence"))?;
        entry.fence = fence;

        let recorder = transfer(CommandRecorder::begin(device, transfer_cmd)?, entry.staging);
        let recorded = recorder.end()?;

        match self.graphics_pool {
            None => recorded.submit(ctx.transfer_queue(), Some(fence)),
            Some(graphics_pool) => {
                let semaphore = device
                    .create_semaphore()
                    .map_err(creation("ownership semaphore"))?;
                entry.semaphore = Some(semaphore);
                recorded.submit_with(ctx.transfer_queue(), &[], &[semaphore], None)?;

                let acquire_cmd = device
                    .allocate_command_buffer(graphics_pool)
                    .map_err(creation("ownership command buffer"))?;
                entry.command_buffers.push((graphics_pool, acquire_cmd));
                let acquired = acquire(CommandRecorder::begin(device, acquire_cmd)?).end()?;
                acquired.submit_with(
                    ctx.graphics_queue(),
                    &[(semaphore, vk::PipelineStageFlags::ALL_COMMANDS)],
                    &[],
                    Some(fence),
                )
            }
        }
    }

    /// Release staging resources of finished uploads without blocking
    pub fn drain_completed(&mut self, ctx: &DeviceContext<D>) -> RenderResult<usize> {
        let released = self.pending.drain_completed(ctx.device())?;
        self.stats.completed_uploads += released as u64;
        if released > 0 {
            log::trace!("Released {} staging uploads", released);
        }
        Ok(released)
    }

    /// Wait for every pending upload and release its staging resources
    pub fn flush(&mut self, ctx: &DeviceContext<D>) -> RenderResult<usize> {
        let released = self.pending.flush(ctx.device(), self.fence_timeout)?;
        self.stats.completed_uploads += released as u64;
        Ok(released)
    }

    /// Tear down the allocator, freeing anything still alive
    pub fn destroy_all(mut self, ctx: &DeviceContext<D>) -> RenderResult<()> {
        let flushed = self.flush(ctx);
        let device = ctx.device();
        if !self.records.is_empty() {
            log::warn!(
                "MemoryAllocator dropped with {} live allocations",
                self.records.len()
            );
        }
        for (_, record) in self.records.drain() {
            match record.resource {
                Resource::Buffer(buffer) => device.destroy_buffer(buffer, record.memory),
                Resource::Image(image) => device.destroy_image(image, record.memory),
            }
        }
        if let Some(pool) = self.graphics_pool.take() {
            device.destroy_command_pool(pool);
        }
        device.destroy_command_pool(self.transfer_pool);
        flushed.map(|_| ())
    }
}

fn bytes_per_texel(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => 2,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{GpuCall, HeadlessAdapter, HeadlessInstance, HeadlessProbe, ObjectKind};
    use crate::backend::GpuCommand;
    use crate::device::DeviceRequirements;

    fn context(instance: &HeadlessInstance) -> DeviceContext<crate::backend::headless::HeadlessDevice> {
        DeviceContext::select(instance, &DeviceRequirements::default()).unwrap()
    }

    fn setup(dedicated_transfer: bool) -> (
        HeadlessProbe,
        DeviceContext<crate::backend::headless::HeadlessDevice>,
    ) {
        let adapter = if dedicated_transfer {
            HeadlessAdapter::discrete("GPU").with_dedicated_transfer().build()
        } else {
            HeadlessAdapter::discrete("GPU").build()
        };
        let instance = HeadlessInstance::new(vec![adapter]);
        let probe = instance.probe();
        (probe, context(&instance))
    }

    #[test]
    fn test_allocation_valid_until_destroyed() {
        let (_, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let mut allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 64)
            .unwrap();
        assert!(allocation.is_valid());
        assert_eq!(allocator.stats().live, 1);

        allocator.destroy(&ctx, &mut allocation).unwrap();
        assert!(!allocation.is_valid());
        assert_eq!(allocator.stats().live, 0);
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_double_destroy_is_rejected() {
        let (probe, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let mut allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::INDEX_BUFFER, 16)
            .unwrap();
        allocator.destroy(&ctx, &mut allocation).unwrap();

        let error = allocator.destroy(&ctx, &mut allocation).unwrap_err();
        assert!(matches!(
            error,
            RenderError::InvalidResourceUse(ResourceMisuse::AlreadyDestroyed)
        ));
        assert_eq!(probe.count(|c| matches!(c, GpuCall::DestroyBuffer(_))), 1);
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_upload_after_destroy_is_invalid_buffer() {
        let (_, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let mut allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 16)
            .unwrap();
        allocator.destroy(&ctx, &mut allocation).unwrap();

        let error = allocator.upload_to_buffer(&ctx, &allocation, &[0; 16]).unwrap_err();
        assert!(matches!(
            error,
            RenderError::InvalidResourceUse(ResourceMisuse::InvalidBuffer)
        ));
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_foreign_allocation_is_rejected() {
        let (_, ctx) = setup(false);
        let mut first = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let mut second = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let mut allocation = first
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 16)
            .unwrap();

        assert!(matches!(
            second.destroy(&ctx, &mut allocation),
            Err(RenderError::InvalidResourceUse(ResourceMisuse::ForeignAllocation))
        ));
        assert!(allocation.is_valid());
        first.destroy(&ctx, &mut allocation).unwrap();
        first.destroy_all(&ctx).unwrap();
        second.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_oversized_upload_is_rejected() {
        let (_, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 4)
            .unwrap();
        assert!(matches!(
            allocator.upload_to_buffer(&ctx, &allocation, &[0; 8]),
            Err(RenderError::InvalidResourceUse(ResourceMisuse::UploadTooLarge { .. }))
        ));
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_same_family_upload_copies_and_defers_staging() {
        let (probe, ctx) = setup(false);
        probe.set_auto_complete(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 4)
            .unwrap();
        let dst = allocator.buffer(&allocation).unwrap();

        allocator.upload_to_buffer(&ctx, &allocation, &[9, 8, 7, 6]).unwrap();
        assert_eq!(probe.buffer_contents(dst), Some(vec![9, 8, 7, 6]));
        assert_eq!(probe.count(|c| matches!(c, GpuCall::Submit { .. })), 1);
        assert_eq!(allocator.stats().pending_frees, 1);
        assert_eq!(probe.live(ObjectKind::Buffer), 2);

        // GPU still busy: draining releases nothing and does not block.
        assert_eq!(allocator.drain_completed(&ctx).unwrap(), 0);
        assert_eq!(probe.count(|c| matches!(c, GpuCall::WaitFence(_))), 0);

        probe.complete_pending();
        assert_eq!(allocator.drain_completed(&ctx).unwrap(), 1);
        assert_eq!(allocator.stats().pending_frees, 0);
        assert_eq!(probe.live(ObjectKind::Buffer), 1);
        assert_eq!(probe.live(ObjectKind::Fence), 0);
        assert!(probe.violations().is_empty(), "{:?}", probe.violations());
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_dedicated_transfer_upload_transfers_ownership() {
        let (probe, ctx) = setup(true);
        let families = ctx.families();
        assert!(families.has_dedicated_transfer());
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::INDEX_BUFFER, 8)
            .unwrap();
        probe.clear_calls();

        allocator.upload_to_buffer(&ctx, &allocation, &[1; 8]).unwrap();

        let submits: Vec<_> = probe
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GpuCall::Submit { queue, fence, waits, signals, .. } => Some((queue, fence, waits, signals)),
                _ => None,
            })
            .collect();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0].0, ctx.transfer_queue());
        assert_eq!((submits[0].1, submits[0].3), (None, 1));
        assert_eq!(submits[1].0, ctx.graphics_queue());
        assert!(submits[1].1.is_some());
        assert_eq!(submits[1].2, 1);

        let barriers: Vec<_> = probe
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GpuCall::Record { command: GpuCommand::BufferBarrier(b), .. } => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 2);
        for barrier in &barriers {
            assert_eq!(barrier.src_family, families.transfer);
            assert_eq!(barrier.dst_family, families.graphics);
        }

        allocator.drain_completed(&ctx).unwrap();
        assert_eq!(probe.live(ObjectKind::Semaphore), 0);
        assert_eq!(probe.live(ObjectKind::CommandBuffer), 0);
        allocator.destroy_all(&ctx).unwrap();
        assert!(probe.violations().is_empty(), "{:?}", probe.violations());
    }

    #[test]
    fn test_full_queue_waits_on_oldest() {
        let (probe, ctx) = setup(false);
        probe.set_auto_complete(false);
        let mut allocator = MemoryAllocator::new(&ctx, 2, 1_000_000).unwrap();
        let allocation = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 4)
            .unwrap();

        for _ in 0..3 {
            allocator.upload_to_buffer(&ctx, &allocation, &[0; 4]).unwrap();
        }
        assert_eq!(allocator.stats().pending_frees, 2);
        assert_eq!(probe.count(|c| matches!(c, GpuCall::WaitFence(_))), 1);
        assert_eq!(allocator.stats().completed_uploads, 1);

        allocator.flush(&ctx).unwrap();
        assert_eq!(allocator.stats().pending_frees, 0);
        allocator.destroy_all(&ctx).unwrap();
        assert_eq!(probe.live_total(), 0);
    }

    #[test]
    fn test_image_upload_transitions_layouts() {
        let (probe, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let extent = vk::Extent2D { width: 2, height: 2 };
        let mut allocation = allocator
            .create_image(
                &ctx,
                &ImageDesc {
                    extent,
                    format: vk::Format::R8G8B8A8_SRGB,
                    usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                    array_layers: 1,
                },
            )
            .unwrap();
        allocator
            .upload_to_image(&ctx, &allocation, &[255; 16], extent, 1)
            .unwrap();

        let layouts: Vec<_> = probe
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GpuCall::Record { command: GpuCommand::ImageBarrier(b), .. } => {
                    Some((b.old_layout, b.new_layout))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                ),
            ]
        );
        allocator.drain_completed(&ctx).unwrap();
        allocator.destroy_image(&ctx, &mut allocation).unwrap();
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_single_layer_array_view_keeps_array_type() {
        let (probe, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        let mut allocation = allocator
            .create_image(
                &ctx,
                &ImageDesc {
                    extent: vk::Extent2D { width: 4, height: 4 },
                    format: vk::Format::R8G8B8A8_SRGB,
                    usage: vk::ImageUsageFlags::SAMPLED,
                    array_layers: 1,
                },
            )
            .unwrap();
        let format = vk::Format::R8G8B8A8_SRGB;
        let aspect = vk::ImageAspectFlags::COLOR;
        let array = allocator
            .create_image_view(&ctx, &allocation, format, aspect, 1, true)
            .unwrap();
        let plain = allocator
            .create_image_view(&ctx, &allocation, format, aspect, 1, false)
            .unwrap();

        let view_types: Vec<_> = probe
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GpuCall::CreateImageView { view, view_type, layer_count: 1 } => Some((view, view_type)),
                _ => None,
            })
            .collect();
        assert_eq!(
            view_types,
            vec![
                (array, vk::ImageViewType::TYPE_2D_ARRAY),
                (plain, vk::ImageViewType::TYPE_2D),
            ]
        );

        ctx.device().destroy_image_view(array);
        ctx.device().destroy_image_view(plain);
        allocator.destroy_image(&ctx, &mut allocation).unwrap();
        assert!(matches!(
            allocator.create_image_view(&ctx, &allocation, format, aspect, 1, true),
            Err(RenderError::InvalidResourceUse(_))
        ));
        allocator.destroy_all(&ctx).unwrap();
    }

    #[test]
    fn test_failed_creation_is_classified() {
        let (probe, ctx) = setup(false);
        let mut allocator = MemoryAllocator::new(&ctx, 4, 1_000_000).unwrap();
        probe.fail_next(ObjectKind::Buffer, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let error = allocator
            .create_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, 4)
            .unwrap_err();
        assert!(matches!(
            error,
            RenderError::ResourceCreation { what: "buffer", result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY }
        ));
        assert_eq!(allocator.stats().live, 0);
        allocator.destroy_all(&ctx).unwrap();
    }
}
