//! Command pool, per-submission command buffer records and barriers

use ash::{vk, Device};

use super::sync::Fence;
use super::{VulkanError, VulkanResult};

/// Texture units addressable through the shared descriptor layout
pub const MAX_TEXTURE_UNITS: u32 = 16;
/// Storage buffer slots addressable through the shared descriptor layout
pub const MAX_STORAGE_BUFFERS: u32 = 8;
/// Storage image slots addressable through the shared descriptor layout
pub const MAX_STORAGE_TEXTURES: u32 = 8;

/// First binding of the texel buffer range
pub const TEXEL_BUFFER_BINDING: u32 = MAX_TEXTURE_UNITS;
/// First binding of the storage buffer range
pub const STORAGE_BUFFER_BINDING: u32 = 2 * MAX_TEXTURE_UNITS;
/// First binding of the storage image range
pub const STORAGE_TEXTURE_BINDING: u32 = STORAGE_BUFFER_BINDING + MAX_STORAGE_BUFFERS;

const SETS_PER_POOL: u32 = 128;

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, command_pool })
    }

    /// Allocate one primary command buffer
    pub fn allocate(&self) -> VulkanResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info).map_err(VulkanError::Api)? };
        buffers
            .into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
    }

    /// Return a command buffer to the pool
    pub fn free(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
    }

    /// Record `record` into a throwaway command buffer, submit it and wait
    pub fn run_one_time(&self, queue: vk::Queue, record: impl FnOnce(&Device, vk::CommandBuffer)) -> VulkanResult<()> {
        let cmd = self.allocate()?;
        let result = (|| {
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device
                    .begin_command_buffer(cmd, &begin_info)
                    .map_err(VulkanError::Api)?;
            }
            record(&self.device, cmd);
            unsafe {
                self.device.end_command_buffer(cmd).map_err(VulkanError::Api)?;
            }

            let fence = Fence::new(self.device.clone(), false)?;
            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                self.device
                    .queue_submit(queue, &[submit_info.build()], fence.handle())
                    .map_err(VulkanError::Api)?;
            }
            fence.wait(u64::MAX)
        })();
        self.free(cmd);
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Descriptor pools owned by one command buffer, reset when it is recycled
pub struct DescriptorArena {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorArena {
    /// Empty arena; the first pool is created on first allocation
    pub const fn new() -> Self {
        Self { pools: Vec::new() }
    }

    fn create_pool(device: &Device) -> VulkanResult<vk::DescriptorPool> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: MAX_TEXTURE_UNITS * SETS_PER_POOL,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                descriptor_count: MAX_TEXTURE_UNITS * SETS_PER_POOL,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_STORAGE_BUFFERS * SETS_PER_POOL,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_STORAGE_TEXTURES * SETS_PER_POOL,
            },
        ];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);
        unsafe { device.create_descriptor_pool(&create_info, None).map_err(VulkanError::Api) }
    }

    /// Allocate a set with `layout`, growing the arena when the last pool is full
    pub fn allocate(&mut self, device: &Device, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout];
        if let Some(&pool) = self.pools.last() {
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => return sets.into_iter().next().ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY)),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(e) => return Err(VulkanError::Api(e)),
            }
        }

        let pool = Self::create_pool(device)?;
        self.pools.push(pool);
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info).map_err(VulkanError::Api)? };
        sets.into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    /// Free every set allocated so far
    pub fn reset(&mut self, device: &Device) {
        for &pool in &self.pools {
            unsafe {
                let _ = device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty());
            }
        }
    }

    /// Destroy the pools
    pub fn destroy(&mut self, device: &Device) {
        for pool in self.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}

/// One command buffer and everything that lives exactly as long as its execution
pub struct FrameCommands {
    /// Native command buffer
    pub cmd: vk::CommandBuffer,
    /// Signaled when the submission completes
    pub fence: Fence,
    /// Completion index assigned at submission
    pub index: Option<u64>,
    /// Attachment views created for render encoders
    pub transient_views: Vec<vk::ImageView>,
    /// Descriptor sets for draws and dispatches
    pub descriptors: DescriptorArena,
}

impl FrameCommands {
    /// Allocate a fresh command buffer with an unsignaled fence
    pub fn new(pool: &CommandPool, device: &Device) -> VulkanResult<Self> {
        let cmd = pool.allocate()?;
        let fence = match Fence::new(device.clone(), false) {
            Ok(fence) => fence,
            Err(e) => {
                pool.free(cmd);
                return Err(e);
            }
        };
        Ok(Self {
            cmd,
            fence,
            index: None,
            transient_views: Vec::new(),
            descriptors: DescriptorArena::new(),
        })
    }

    /// Start recording
    pub fn begin(&self, device: &Device) -> VulkanResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(self.cmd, &begin_info).map_err(VulkanError::Api) }
    }

    /// Prepare for reuse once execution has completed
    pub fn recycle(&mut self, device: &Device) -> VulkanResult<()> {
        self.release_views(device);
        self.descriptors.reset(device);
        self.index = None;
        self.fence.reset()?;
        unsafe {
            device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)
        }
    }

    fn release_views(&mut self, device: &Device) {
        for view in self.transient_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    /// Destroy everything owned by this record
    pub fn destroy(mut self, pool: &CommandPool, device: &Device) {
        self.release_views(device);
        self.descriptors.destroy(device);
        pool.free(self.cmd);
    }
}

/// Make every earlier write visible to every later access
pub fn full_barrier(device: &Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier.build()],
            &[],
            &[],
        );
    }
}

/// Move a freshly created image from `UNDEFINED` to `GENERAL`
pub fn initialize_layout(device: &Device, cmd: vk::CommandBuffer, image: vk::Image, range: vk::ImageSubresourceRange) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_ranges_do_not_overlap() {
        assert_eq!(TEXEL_BUFFER_BINDING, 16);
        assert_eq!(STORAGE_BUFFER_BINDING, 32);
        assert_eq!(STORAGE_TEXTURE_BINDING, 40);
        assert!(TEXEL_BUFFER_BINDING + MAX_TEXTURE_UNITS <= STORAGE_BUFFER_BINDING);
    }
}
