//! Buffer and image allocation
//!
//! One `vk::DeviceMemory` per resource. Host-visible memory is mapped once at
//! creation and stays mapped until the resource is destroyed.

use ash::{vk, Device};

use super::context::VulkanContext;
use super::{VulkanError, VulkanResult};
use crate::render::backend::{BufferDesc, MemoryLocation, TextureDesc};
use crate::render::types::{BufferUsageFlags, PixelFormat, TextureType};

/// Find a memory type index matching `type_filter` with all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize].property_flags.contains(properties)
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

/// Property flags to try in order for a memory location
fn memory_preferences(location: MemoryLocation) -> &'static [vk::MemoryPropertyFlags] {
    const DEVICE: &[vk::MemoryPropertyFlags] = &[vk::MemoryPropertyFlags::DEVICE_LOCAL];
    const UPLOAD: &[vk::MemoryPropertyFlags] = &[
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    ];
    const READBACK: &[vk::MemoryPropertyFlags] = &[
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
        ),
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    ];

    match location {
        MemoryLocation::DeviceLocal => DEVICE,
        MemoryLocation::HostUpload => UPLOAD,
        MemoryLocation::HostReadback => READBACK,
    }
}

/// Allocate memory for `requirements`, optionally dedicated to one resource
fn allocate(
    context: &VulkanContext,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    dedicated: vk::MemoryDedicatedAllocateInfoBuilder<'_>,
    use_dedicated: bool,
) -> VulkanResult<(vk::DeviceMemory, vk::MemoryPropertyFlags)> {
    let memory_properties = &context.physical_device.memory_properties;
    let type_index = memory_preferences(location)
        .iter()
        .find_map(|&flags| find_memory_type(memory_properties, requirements.memory_type_bits, flags).ok())
        .ok_or(VulkanError::NoSuitableMemoryType)?;
    let flags = memory_properties.memory_types[type_index as usize].property_flags;

    let mut dedicated = dedicated;
    let mut alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);
    if use_dedicated {
        alloc_info = alloc_info.push_next(&mut dedicated);
    }

    let memory = unsafe {
        context.raw().allocate_memory(&alloc_info, None).map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                VulkanError::OutOfMemory {
                    requested: requirements.size,
                }
            }
            other => VulkanError::Api(other),
        })?
    };
    Ok((memory, flags))
}

/// Buffer with its own memory
pub struct VulkanBuffer {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Size in bytes as requested
    pub size: u64,
    /// Persistent mapping for host-visible memory
    pub mapped: Option<*mut u8>,
    /// Whether the mapping is coherent
    pub coherent: bool,
    /// View used when bound as a texel buffer
    pub texel_view: Option<vk::BufferView>,
    /// Debug label
    pub label: Option<String>,
}

fn buffer_usage(usage: BufferUsageFlags) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    let table = [
        (BufferUsageFlags::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsageFlags::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsageFlags::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsageFlags::TEXEL, vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER),
        (BufferUsageFlags::SHADER_STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsageFlags::INDIRECT_ARGUMENTS, vk::BufferUsageFlags::INDIRECT_BUFFER),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

impl VulkanBuffer {
    /// Create, allocate, bind and map a buffer
    pub fn new(context: &VulkanContext, desc: &BufferDesc) -> VulkanResult<Self> {
        let device = context.raw();
        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size.max(4))
            .usage(buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None).map_err(VulkanError::Api)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let dedicated = vk::MemoryDedicatedAllocateInfo::builder().buffer(buffer);
        let (memory, flags) = match allocate(context, requirements, desc.location, dedicated, desc.dedicated) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut this = Self {
            buffer,
            memory,
            size: desc.size,
            mapped: None,
            coherent: flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            texel_view: None,
            label: desc.label.clone(),
        };

        let result: VulkanResult<()> = (|| unsafe {
            device.bind_buffer_memory(buffer, memory, 0).map_err(VulkanError::Api)?;
            if desc.location.is_host_visible() {
                let ptr = device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(VulkanError::Api)?;
                this.mapped = Some(ptr.cast::<u8>());
            }
            if let Some(format) = desc.texel_format.filter(|_| desc.usage.contains(BufferUsageFlags::TEXEL)) {
                let view_info = vk::BufferViewCreateInfo::builder()
                    .buffer(buffer)
                    .format(vk_format(format))
                    .offset(0)
                    .range(vk::WHOLE_SIZE);
                this.texel_view = Some(device.create_buffer_view(&view_info, None).map_err(VulkanError::Api)?);
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(this),
            Err(e) => {
                this.destroy(device);
                Err(e)
            }
        }
    }

    /// Release the buffer, its view and its memory
    pub fn destroy(self, device: &Device) {
        unsafe {
            if let Some(view) = self.texel_view {
                device.destroy_buffer_view(view, None);
            }
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Image with its own memory and a sampled view covering every layer and mip
pub struct VulkanTexture {
    /// Image handle
    pub image: vk::Image,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// View of the whole image
    pub view: vk::ImageView,
    /// Native format
    pub format: vk::Format,
    /// Aspects of the format
    pub aspect: vk::ImageAspectFlags,
    /// Creation parameters
    pub desc: TextureDesc,
}

impl VulkanTexture {
    /// Create, allocate and bind an image and its full view
    pub fn new(context: &VulkanContext, desc: &TextureDesc, format: vk::Format) -> VulkanResult<Self> {
        let device = context.raw();
        let aspect = aspect_flags(desc.format);

        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.render_target {
            usage |= if desc.format.is_depth() {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }
        if desc.storage {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let (image_type, depth, layers, flags) = match desc.texture_type {
            TextureType::Tex2D => (vk::ImageType::TYPE_2D, 1, 1, vk::ImageCreateFlags::empty()),
            TextureType::Array => (vk::ImageType::TYPE_2D, 1, desc.layers, vk::ImageCreateFlags::empty()),
            TextureType::Volume => (vk::ImageType::TYPE_3D, desc.layers, 1, vk::ImageCreateFlags::empty()),
            TextureType::Cube => (vk::ImageType::TYPE_2D, 1, 6, vk::ImageCreateFlags::CUBE_COMPATIBLE),
        };

        let create_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth,
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(layers.max(1))
            .samples(sample_count(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&create_info, None).map_err(VulkanError::Api)? };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let dedicated = vk::MemoryDedicatedAllocateInfo::builder().image(image);
        let (memory, _) = match allocate(context, requirements, MemoryLocation::DeviceLocal, dedicated, desc.render_target) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)
                .and_then(|()| {
                    let sampled_aspect = if desc.format.is_depth() {
                        vk::ImageAspectFlags::DEPTH
                    } else {
                        vk::ImageAspectFlags::COLOR
                    };
                    let mips = desc.mip_levels.max(1);
                    create_view(device, image, format, sampled_aspect, view_type(desc.texture_type), 0, layers.max(1), 0, mips)
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            format,
            aspect,
            desc: desc.clone(),
        })
    }

    /// Subresource range covering the whole image
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    /// Create a 2D view of one slice and mip, for use as an attachment
    pub fn attachment_view(&self, device: &Device, slice: u32, mip: u32) -> VulkanResult<vk::ImageView> {
        let (view_type, layer) = if self.desc.texture_type == TextureType::Volume {
            (vk::ImageViewType::TYPE_3D, 0)
        } else {
            (vk::ImageViewType::TYPE_2D, slice)
        };
        create_view(device, self.image, self.format, self.aspect, view_type, layer, 1, mip, 1)
    }

    /// Release the view, image and memory
    pub fn destroy(self, device: &Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn create_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    view_type: vk::ImageViewType,
    base_layer: u32,
    layer_count: u32,
    base_mip: u32,
    mip_count: u32,
) -> VulkanResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: base_layer,
            layer_count,
        });
    unsafe { device.create_image_view(&view_info, None).map_err(VulkanError::Api) }
}

const fn view_type(texture_type: TextureType) -> vk::ImageViewType {
    match texture_type {
        TextureType::Tex2D => vk::ImageViewType::TYPE_2D,
        TextureType::Array => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureType::Volume => vk::ImageViewType::TYPE_3D,
        TextureType::Cube => vk::ImageViewType::CUBE,
    }
}

/// Sample count flag for a sample count, rounded down to a power of two
pub const fn sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 | 3 => vk::SampleCountFlags::TYPE_2,
        4..=7 => vk::SampleCountFlags::TYPE_4,
        8..=15 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_16,
    }
}

/// Native format for a pixel format, before depth fallbacks
pub const fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::R8Unorm => vk::Format::R8_UNORM,
        PixelFormat::R32Float => vk::Format::R32_SFLOAT,
        PixelFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        PixelFormat::R32Uint => vk::Format::R32_UINT,
        PixelFormat::Depth16 => vk::Format::D16_UNORM,
        PixelFormat::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        PixelFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

/// Aspects covered by a pixel format
pub const fn aspect_flags(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::from_raw(vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw())
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            properties.memory_types[i].property_flags = *flags;
        }
        properties
    }

    #[test]
    fn test_memory_type_respects_filter_and_flags() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        assert_eq!(find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).ok(), Some(0));
        assert_eq!(find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_CACHED).ok(), Some(2));
        assert_eq!(find_memory_type(&props, 0b011, vk::MemoryPropertyFlags::HOST_VISIBLE).ok(), Some(1));
        assert!(matches!(
            find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Err(VulkanError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn test_buffer_usage_always_allows_copies() {
        let flags = buffer_usage(BufferUsageFlags::VERTEX | BufferUsageFlags::TEXEL);
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }

    #[test]
    fn test_depth_stencil_aspects() {
        assert_eq!(
            aspect_flags(PixelFormat::Depth24Stencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_flags(PixelFormat::Depth32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect_flags(PixelFormat::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
        assert_eq!(sample_count(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count(0), vk::SampleCountFlags::TYPE_1);
    }
}
