use ash::{vk, Device};

use super::pipeline::PUSH_CONSTANT_STAGES;
use crate::backend::GpuCommand;

/// Translate one recorded command into the matching `vkCmd*` call
pub(super) fn record(device: &Device, cmd: vk::CommandBuffer, command: &GpuCommand) {
    unsafe {
        match *command {
            GpuCommand::SetViewport(viewport) => device.cmd_set_viewport(cmd, 0, &[viewport]),
            GpuCommand::SetScissor(scissor) => device.cmd_set_scissor(cmd, 0, &[scissor]),
            GpuCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_color,
                clear_depth,
            } => {
                let clear_values = [
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    },
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: clear_depth,
                            stencil: 0,
                        },
                    },
                ];
                let begin_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(render_pass)
                    .framebuffer(framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .clear_values(&clear_values);
                device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            }
            GpuCommand::EndRenderPass => device.cmd_end_render_pass(cmd),
            GpuCommand::BindPipeline(pipeline) => {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
            }
            GpuCommand::BindDescriptorSet { layout, set } => device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            ),
            GpuCommand::PushMatrix {
                layout,
                offset,
                matrix,
            } => device.cmd_push_constants(
                cmd,
                layout,
                PUSH_CONSTANT_STAGES,
                offset,
                bytemuck::cast_slice(&matrix),
            ),
            GpuCommand::BindVertexBuffer { buffer, offset } => {
                device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[offset])
            }
            GpuCommand::BindIndexBuffer { buffer, offset } => {
                device.cmd_bind_index_buffer(cmd, buffer, offset, vk::IndexType::UINT32)
            }
            GpuCommand::DrawIndexed { index_count } => {
                device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0)
            }
            GpuCommand::CopyBuffer { src, dst, size } => device.cmd_copy_buffer(
                cmd,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            ),
            GpuCommand::CopyBufferToImage {
                src,
                dst,
                extent,
                layer_count,
            } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count,
                    },
                    image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    image_extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                };
                device.cmd_copy_buffer_to_image(
                    cmd,
                    src,
                    dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            GpuCommand::BufferBarrier(barrier) => {
                let buffer_barrier = vk::BufferMemoryBarrier::builder()
                    .buffer(barrier.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
                    .src_queue_family_index(barrier.src_family)
                    .dst_queue_family_index(barrier.dst_family)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    barrier.src_stage,
                    barrier.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer_barrier],
                    &[],
                );
            }
            GpuCommand::ImageBarrier(barrier) => {
                let image_barrier = vk::ImageMemoryBarrier::builder()
                    .image(barrier.image)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
                    .src_queue_family_index(barrier.src_family)
                    .dst_queue_family_index(barrier.dst_family)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: barrier.layer_count,
                    })
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    barrier.src_stage,
                    barrier.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_barrier],
                );
            }
        }
    }
}
