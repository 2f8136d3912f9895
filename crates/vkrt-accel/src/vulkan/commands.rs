//! One-time command buffer execution.
//!
//! Every acceleration structure build is recorded into a transient command
//! buffer, submitted, and waited on before the call returns.

use ash::vk;

use super::error::{RtError, RtResult};
use super::VulkanContext;

/// Synchronous command execution service used by the builders.
pub trait CommandExecutor {
    /// Allocate and begin a single-use command buffer.
    unsafe fn begin_one_time(&self) -> RtResult<vk::CommandBuffer>;

    /// End, submit and block until the GPU has finished `cmd`, then free it.
    unsafe fn end_one_time(&self, cmd: vk::CommandBuffer) -> RtResult<()>;
}

/// Transient command pool bound to the graphics queue.
pub struct CommandManager {
    transient_pool: vk::CommandPool,
    queue: vk::Queue,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager.
    pub unsafe fn new(ctx: &VulkanContext) -> RtResult<Self> {
        let graphics_family = ctx.queue_families.graphics
            .ok_or_else(|| RtError::Submission("No graphics queue family".to_string()))?;

        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = ctx.device.create_command_pool(&transient_info, None)
            .map_err(RtError::vk("vkCreateCommandPool"))?;

        Ok(Self {
            transient_pool,
            queue: ctx.graphics_queue,
            device: ctx.device.clone(),
        })
    }

    /// Destroy the command pool.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
        self.transient_pool = vk::CommandPool::null();
    }
}

impl CommandExecutor for CommandManager {
    unsafe fn begin_one_time(&self) -> RtResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self.device.allocate_command_buffers(&alloc_info)
            .map_err(RtError::vk("vkAllocateCommandBuffers"))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(RtError::Submission(format!("Failed to begin command buffer: {:?}", e)));
        }

        Ok(cmd)
    }

    unsafe fn end_one_time(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        let command_buffers = [cmd];

        let result = (|| {
            self.device.end_command_buffer(cmd)
                .map_err(|e| RtError::Submission(format!("Failed to end command buffer: {:?}", e)))?;

            let submit_info = vk::SubmitInfo::default()
                .command_buffers(&command_buffers);

            self.device.queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(|e| RtError::Submission(format!("Failed to submit command buffer: {:?}", e)))?;

            self.device.queue_wait_idle(self.queue)
                .map_err(|e| RtError::Submission(format!("Failed to wait for queue: {:?}", e)))
        })();

        self.device.free_command_buffers(self.transient_pool, &command_buffers);

        if let Err(e) = &result {
            log::error!("{}", e);
        }
        result
    }
}
