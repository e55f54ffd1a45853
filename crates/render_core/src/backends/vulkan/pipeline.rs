//! Programs, the shared pipeline layout and lazily built graphics pipelines

use std::collections::HashMap;
use std::ffi::CString;

use ash::{vk, Device};

use super::commands::{
    MAX_STORAGE_BUFFERS, MAX_STORAGE_TEXTURES, MAX_TEXTURE_UNITS, STORAGE_BUFFER_BINDING,
    STORAGE_TEXTURE_BINDING, TEXEL_BUFFER_BINDING,
};
use super::convert;
use super::{VulkanError, VulkanResult};
use crate::render::backend::{ActiveUniform, ProgramDesc, ShaderCode, UniformUpload};
use crate::render::shader::{ShaderStage, UniformInfo, UniformType};
use crate::render::types::{BlendState, ColorChannelMask};

/// Stages every binding and push constant range is visible to
const SHADER_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::ALL_GRAPHICS.as_raw() | vk::ShaderStageFlags::COMPUTE.as_raw(),
);

/// Descriptor set layout and pipeline layout shared by every program
pub struct SharedLayouts {
    /// The single descriptor set layout
    pub set_layout: vk::DescriptorSetLayout,
    /// Pipeline layout: one set plus the push constant block
    pub pipeline_layout: vk::PipelineLayout,
    /// Bytes in the push constant block
    pub push_constant_size: u32,
}

impl SharedLayouts {
    /// Build the fixed binding ranges and a push constant range of `push_constant_size` bytes
    pub fn new(device: &Device, push_constant_size: u32) -> VulkanResult<Self> {
        let range = |ty: vk::DescriptorType, first: u32, count: u32| {
            (first..first + count).map(move |binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(SHADER_STAGES)
                    .build()
            })
        };
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = range(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 0, MAX_TEXTURE_UNITS)
            .chain(range(vk::DescriptorType::UNIFORM_TEXEL_BUFFER, TEXEL_BUFFER_BINDING, MAX_TEXTURE_UNITS))
            .chain(range(vk::DescriptorType::STORAGE_BUFFER, STORAGE_BUFFER_BINDING, MAX_STORAGE_BUFFERS))
            .chain(range(vk::DescriptorType::STORAGE_IMAGE, STORAGE_TEXTURE_BINDING, MAX_STORAGE_TEXTURES))
            .collect();

        let set_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_info, None).map_err(VulkanError::Api)? };

        let set_layouts = [set_layout];
        let push_ranges = [vk::PushConstantRange {
            stage_flags: SHADER_STAGES,
            offset: 0,
            size: push_constant_size,
        }];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(VulkanError::Api(e));
            }
        };

        Ok(Self {
            set_layout,
            pipeline_layout,
            push_constant_size,
        })
    }

    /// Push a program's whole uniform block
    pub fn push(&self, device: &Device, cmd: vk::CommandBuffer, block: &[u32]) {
        if block.is_empty() {
            return;
        }
        unsafe {
            device.cmd_push_constants(cmd, self.pipeline_layout, SHADER_STAGES, 0, bytemuck::cast_slice(block));
        }
    }

    /// Destroy both layouts
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Where one uniform lives in the push constant block, in 32-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSlot {
    /// Word offset of element 0
    pub offset: usize,
    /// Words between array elements
    pub element_stride: usize,
    /// Columns per element, 1 for scalars and vectors
    pub columns: usize,
    /// Words between columns
    pub column_stride: usize,
    /// Data words per column
    pub rows: usize,
    /// Array length
    pub count: usize,
}

impl PushSlot {
    /// std430 placement of `info` at or after `cursor`, returns the slot and the next free word
    pub fn place(info: &UniformInfo, cursor: usize) -> (Self, usize) {
        let align_of = |rows: usize| match rows {
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let (columns, rows) = if info.base_type == UniformType::Matrix {
            (info.matrix.columns as usize, info.matrix.rows as usize)
        } else {
            (1, info.components.max(1) as usize)
        };
        let column_stride = align_of(rows);
        let element_stride = if columns == 1 {
            if info.count > 1 { column_stride } else { rows }
        } else {
            columns * column_stride
        };
        let offset = cursor.next_multiple_of(column_stride);
        let slot = Self {
            offset,
            element_stride,
            columns,
            column_stride,
            rows,
            count: info.count,
        };
        (slot, offset + element_stride * info.count.max(1))
    }

    /// Copy tightly packed `words` for `count` elements into `block`
    pub fn write(&self, block: &mut [u32], words: &[u32], count: usize) {
        let packed = self.columns * self.rows;
        for element in 0..count.min(self.count) {
            for column in 0..self.columns {
                let src = (element * packed + column * self.rows)..(element * packed + (column + 1) * self.rows);
                let dst = self.offset + element * self.element_stride + column * self.column_stride;
                if let (Some(src), Some(dst)) = (words.get(src), block.get_mut(dst..dst + self.rows)) {
                    dst.copy_from_slice(src);
                }
            }
        }
    }
}

/// Render state baked into a graphics pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Blend equation
    pub blend: BlendState,
    /// Color write mask
    pub mask: ColorChannelMask,
    /// Line polygon mode
    pub wireframe: bool,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Formats of the color attachments
    pub color_formats: Vec<vk::Format>,
    /// Depth attachment format or `UNDEFINED`
    pub depth_format: vk::Format,
    /// Stencil attachment format or `UNDEFINED`
    pub stencil_format: vk::Format,
    /// Sample count of the pass
    pub samples: vk::SampleCountFlags,
}

struct StageModule {
    stage: ShaderStage,
    module: vk::ShaderModule,
    entry_point: CString,
}

/// A linked program: its modules, uniform block and every pipeline built from it
pub struct VulkanProgram {
    /// Debug label
    pub label: String,
    stages: Vec<StageModule>,
    /// Pipeline built at link time for compute programs
    pub compute_pipeline: Option<vk::Pipeline>,
    pipelines: HashMap<PipelineKey, vk::Pipeline>,
    slots: Vec<Option<PushSlot>>,
    /// Current push constant contents
    pub block: Vec<u32>,
}

/// Everything a successful link reports back
pub struct LinkOutput {
    /// The program
    pub program: VulkanProgram,
    /// Active uniforms with their locations
    pub uniforms: Vec<ActiveUniform>,
    /// Active storage block names
    pub storage_blocks: Vec<String>,
}

const fn stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

impl VulkanProgram {
    /// Create modules from SPIR-V and lay out the uniform block
    ///
    /// Errors are link logs; the caller turns them into a link failure.
    pub fn link(device: &Device, layouts: &SharedLayouts, desc: &ProgramDesc<'_>) -> Result<LinkOutput, String> {
        let mut uniforms = Vec::new();
        let mut slots = Vec::new();
        let mut cursor = 0;
        for (location, info) in desc.reflection.uniforms().enumerate() {
            uniforms.push(ActiveUniform {
                name: if info.count > 1 {
                    format!("{}[0]", info.name)
                } else {
                    info.name.clone()
                },
                location: location as i32,
                count: info.count,
            });
            if info.base_type.is_resource() {
                slots.push(None);
            } else {
                let (slot, next) = PushSlot::place(info, cursor);
                slots.push(Some(slot));
                cursor = next;
            }
        }

        let block_bytes = cursor * std::mem::size_of::<u32>();
        if block_bytes > layouts.push_constant_size as usize {
            return Err(format!(
                "uniforms need {} bytes of push constants, the device allows {}",
                block_bytes, layouts.push_constant_size
            ));
        }

        let mut program = Self {
            label: desc.label.to_string(),
            stages: Vec::new(),
            compute_pipeline: None,
            pipelines: HashMap::new(),
            slots,
            block: vec![0; cursor],
        };

        for source in desc.stages {
            let ShaderCode::Spirv(words) = &source.code else {
                program.destroy(device);
                return Err(format!("{:?} stage: runtime compilation unsupported, SPIR-V required", source.stage));
            };
            let Ok(entry_point) = CString::new(source.entry_point.as_str()) else {
                program.destroy(device);
                return Err(format!("{:?} stage: invalid entry point", source.stage));
            };
            let module_info = vk::ShaderModuleCreateInfo::builder().code(words);
            match unsafe { device.create_shader_module(&module_info, None) } {
                Ok(module) => program.stages.push(StageModule {
                    stage: source.stage,
                    module,
                    entry_point,
                }),
                Err(e) => {
                    program.destroy(device);
                    return Err(format!("{:?} stage: {e:?}", source.stage));
                }
            }
        }

        if let Some(compute) = program.stages.iter().find(|s| s.stage == ShaderStage::Compute) {
            let stage = vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(compute.module)
                .name(&compute.entry_point)
                .build();
            let info = vk::ComputePipelineCreateInfo::builder()
                .stage(stage)
                .layout(layouts.pipeline_layout)
                .build();
            match unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None) } {
                Ok(pipelines) => program.compute_pipeline = pipelines.into_iter().next(),
                Err((_, e)) => {
                    program.destroy(device);
                    return Err(format!("compute pipeline: {e:?}"));
                }
            }
        }

        let storage_blocks = desc.reflection.storage_blocks().map(|info| info.name.clone()).collect();
        Ok(LinkOutput {
            program,
            uniforms,
            storage_blocks,
        })
    }

    /// Write uniform data at `location`; resource uniforms have no block storage
    pub fn set_uniform(&mut self, location: i32, upload: &UniformUpload<'_>) {
        let slot = usize::try_from(location)
            .ok()
            .and_then(|index| self.slots.get(index).copied().flatten());
        if let Some(slot) = slot {
            slot.write(&mut self.block, upload.words, upload.count);
        }
    }

    /// Pipeline for `key`, built on first use
    pub fn graphics_pipeline(
        &mut self,
        device: &Device,
        layouts: &SharedLayouts,
        key: &PipelineKey,
    ) -> VulkanResult<vk::Pipeline> {
        if let Some(&pipeline) = self.pipelines.get(key) {
            return Ok(pipeline);
        }
        let pipeline = self.build_graphics_pipeline(device, layouts, key)?;
        log::debug!("Built pipeline #{} for program '{}'", self.pipelines.len() + 1, self.label);
        self.pipelines.insert(key.clone(), pipeline);
        Ok(pipeline)
    }

    fn build_graphics_pipeline(
        &self,
        device: &Device,
        layouts: &SharedLayouts,
        key: &PipelineKey,
    ) -> VulkanResult<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .stages
            .iter()
            .filter(|s| s.stage != ShaderStage::Compute)
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage_flags(s.stage))
                    .module(s.module)
                    .name(&s.entry_point)
                    .build()
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(key.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(if key.wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            })
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(key.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder();

        let write_mask = vk::ColorComponentFlags::from_raw(u32::from(key.mask.bits()));
        let attachments: Vec<vk::PipelineColorBlendAttachmentState> = key
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(key.blend.enabled)
                    .src_color_blend_factor(convert::blend_factor(key.blend.src_factor_rgb))
                    .dst_color_blend_factor(convert::blend_factor(key.blend.dst_factor_rgb))
                    .color_blend_op(convert::blend_op(key.blend.operation_rgb))
                    .src_alpha_blend_factor(convert::blend_factor(key.blend.src_factor_a))
                    .dst_alpha_blend_factor(convert::blend_factor(key.blend.dst_factor_a))
                    .alpha_blend_op(convert::blend_op(key.blend.operation_a))
                    .color_write_mask(write_mask)
                    .build()
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::CULL_MODE,
            vk::DynamicState::FRONT_FACE,
            vk::DynamicState::DEPTH_TEST_ENABLE,
            vk::DynamicState::DEPTH_WRITE_ENABLE,
            vk::DynamicState::DEPTH_COMPARE_OP,
            vk::DynamicState::STENCIL_TEST_ENABLE,
            vk::DynamicState::STENCIL_OP,
            vk::DynamicState::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_WRITE_MASK,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let mut rendering = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&key.color_formats)
            .depth_attachment_format(key.depth_format)
            .stencil_attachment_format(key.stencil_format);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layouts.pipeline_layout)
            .push_next(&mut rendering)
            .build();

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| VulkanError::Api(e))?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or(VulkanError::Api(vk::Result::ERROR_INITIALIZATION_FAILED))
    }

    /// Destroy pipelines and modules
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                device.destroy_pipeline(pipeline, None);
            }
            if let Some(pipeline) = self.compute_pipeline.take() {
                device.destroy_pipeline(pipeline, None);
            }
            for stage in self.stages.drain(..) {
                device.destroy_shader_module(stage.module, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::shader::uniform::MatrixSize;

    fn uniform(base_type: UniformType, components: u32, count: usize) -> UniformInfo {
        let mut info = UniformInfo::new("u", base_type);
        info.components = components;
        info.count = count;
        info
    }

    #[test]
    fn test_std430_placement() {
        let scalar = uniform(UniformType::Float, 1, 1);
        let (slot, next) = PushSlot::place(&scalar, 0);
        assert_eq!((slot.offset, next), (0, 1));

        let vec3 = uniform(UniformType::Float, 3, 1);
        let (slot, next) = PushSlot::place(&vec3, next);
        assert_eq!((slot.offset, next), (4, 7));

        let vec2_array = uniform(UniformType::Float, 2, 3);
        let (slot, next) = PushSlot::place(&vec2_array, next);
        assert_eq!((slot.offset, slot.element_stride, next), (8, 2, 14));

        let mut mat3 = uniform(UniformType::Matrix, 1, 1);
        mat3.matrix = MatrixSize::new(3, 3);
        let (slot, next) = PushSlot::place(&mat3, next);
        assert_eq!((slot.offset, slot.column_stride, next), (16, 4, 28));
    }

    #[test]
    fn test_matrix_columns_are_padded() {
        let mut mat3 = uniform(UniformType::Matrix, 1, 1);
        mat3.matrix = MatrixSize::new(3, 3);
        let (slot, size) = PushSlot::place(&mat3, 0);
        let mut block = vec![0; size];
        let words: Vec<u32> = (1..=9).collect();
        slot.write(&mut block, &words, 1);
        assert_eq!(block, vec![1, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0]);
    }

    #[test]
    fn test_write_clamps_to_declared_count() {
        let array = uniform(UniformType::Int, 1, 2);
        let (slot, size) = PushSlot::place(&array, 0);
        let mut block = vec![0; size];
        slot.write(&mut block, &[7, 8, 9], 3);
        assert_eq!(block, vec![7, 8]);
    }
}
