//! Frames in flight
//!
//! Each [`FrameSlot`] owns the synchronization objects and command buffer of
//! one frame. [`FrameRing`] hands them out round-robin. A slot only records
//! after its fence has been waited on, so at most `len - 1` frames run ahead of
//! the CPU.

use ash::vk;

use crate::backend::GpuDevice;
use crate::device::DeviceContext;
use crate::error::{api, creation, RenderError, RenderResult, ResourceMisuse};
use crate::recorder::CommandRecorder;

/// Synchronization objects and command buffer for one frame
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    image_acquired: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    command_buffer: vk::CommandBuffer,
    ready: bool,
}

impl FrameSlot {
    /// Position in the ring
    pub fn index(&self) -> usize {
        self.index
    }

    /// Signaled when the acquired image can be written
    pub fn image_acquired(&self) -> vk::Semaphore {
        self.image_acquired
    }

    /// Signaled when rendering into the image finished
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished
    }

    /// Signaled when the GPU finished this slot's submission
    pub fn in_flight(&self) -> vk::Fence {
        self.in_flight
    }

    /// Command buffer recorded every time the slot comes around
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Whether the previous submission is known to be complete
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Fixed ring of frame slots on the graphics queue family
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    pool: vk::CommandPool,
    current: usize,
    fence_timeout: u64,
}

impl FrameRing {
    /// Create `count` slots; fences start signaled so the first wait returns at once
    pub fn new<D: GpuDevice>(
        ctx: &DeviceContext<D>,
        count: usize,
        fence_timeout: u64,
    ) -> RenderResult<Self> {
        let device = ctx.device();
        let pool = device
            .create_command_pool(ctx.families().graphics, false)
            .map_err(creation("frame command pool"))?;
        let mut ring = Self {
            slots: Vec::with_capacity(count),
            pool,
            current: 0,
            fence_timeout,
        };

        for index in 0..count.max(1) {
            match Self::create_slot(device, pool, index) {
                Ok(slot) => ring.slots.push(slot),
                Err(error) => {
                    ring.destroy(ctx);
                    return Err(error);
                }
            }
        }
        log::debug!("Created {} frame slots", ring.slots.len());
        Ok(ring)
    }

    fn create_slot<D: GpuDevice>(
        device: &D,
        pool: vk::CommandPool,
        index: usize,
    ) -> RenderResult<FrameSlot> {
        let image_acquired = device
            .create_semaphore()
            .map_err(creation("image-acquired semaphore"))?;
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(error) => {
                device.destroy_semaphore(image_acquired);
                return Err(creation("render-finished semaphore")(error));
            }
        };
        let in_flight = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(error) => {
                device.destroy_semaphore(image_acquired);
                device.destroy_semaphore(render_finished);
                return Err(creation("frame fence")(error));
            }
        };
        let command_buffer = match device.allocate_command_buffer(pool) {
            Ok(command_buffer) => command_buffer,
            Err(error) => {
                device.destroy_semaphore(image_acquired);
                device.destroy_semaphore(render_finished);
                device.destroy_fence(in_flight);
                return Err(creation("frame command buffer")(error));
            }
        };
        Ok(FrameSlot {
            index,
            image_acquired,
            render_finished,
            in_flight,
            command_buffer,
            ready: false,
        })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring has at least one slot
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the slot the next tick uses
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Slot the next tick uses
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Block until the current slot's previous submission finished
    pub fn wait_current<D: GpuDevice>(&mut self, ctx: &DeviceContext<D>) -> RenderResult<()> {
        let slot = &mut self.slots[self.current];
        if slot.ready {
            return Ok(());
        }
        match ctx.device().wait_for_fence(slot.in_flight, self.fence_timeout) {
            Ok(()) => {
                slot.ready = true;
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => {
                log::warn!("Frame slot {} fence timed out", slot.index);
                Err(RenderError::Api {
                    context: "frame fence wait",
                    result: vk::Result::TIMEOUT,
                })
            }
            Err(result) => Err(RenderError::from_vk("frame fence wait", result)),
        }
    }

    /// Unsignal the current fence ahead of a submission that will signal it
    pub fn reset_current<D: GpuDevice>(&self, ctx: &DeviceContext<D>) -> RenderResult<()> {
        let slot = self.current();
        if !slot.ready {
            return Err(ResourceMisuse::FrameSlotNotReady { index: slot.index }.into());
        }
        ctx.device()
            .reset_fence(slot.in_flight)
            .map_err(api("frame fence reset"))
    }

    /// Start recording the current slot's command buffer
    pub fn begin_recording<'d, D: GpuDevice>(
        &self,
        ctx: &'d DeviceContext<D>,
    ) -> RenderResult<CommandRecorder<'d, D>> {
        let slot = self.current();
        if !slot.ready {
            return Err(ResourceMisuse::FrameSlotNotReady { index: slot.index }.into());
        }
        CommandRecorder::begin(ctx.device(), slot.command_buffer)
    }

    /// Record that the current slot's work was submitted
    pub fn mark_submitted(&mut self) {
        self.slots[self.current].ready = false;
    }

    /// Swap in a fresh image-acquired semaphore.
    ///
    /// Used after a suboptimal acquire left the old one with a pending signal.
    /// Waits for the device to go idle first.
    pub fn replace_acquire_signal<D: GpuDevice>(&mut self, ctx: &DeviceContext<D>) -> RenderResult<()> {
        ctx.wait_idle()?;
        let device = ctx.device();
        let fresh = device
            .create_semaphore()
            .map_err(creation("image-acquired semaphore"))?;
        let slot = &mut self.slots[self.current];
        device.destroy_semaphore(std::mem::replace(&mut slot.image_acquired, fresh));
        log::debug!("Replaced image-acquired semaphore of slot {}", slot.index);
        Ok(())
    }

    /// Move to the next slot
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len().max(1);
    }

    /// Destroy every slot and the pool. The caller has waited for the device to go idle.
    pub fn destroy<D: GpuDevice>(&mut self, ctx: &DeviceContext<D>) {
        let device = ctx.device();
        for slot in self.slots.drain(..) {
            device.free_command_buffer(self.pool, slot.command_buffer);
            device.destroy_fence(slot.in_flight);
            device.destroy_semaphore(slot.render_finished);
            device.destroy_semaphore(slot.image_acquired);
        }
        if self.pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.pool);
            self.pool = vk::CommandPool::null();
        }
    }
}
