//! Translation of core state enums to Vulkan values

use ash::vk;

use crate::render::backend::{LoadAction, SamplerDescriptor};
use crate::render::types::{
    BlendFactor, BlendOperation, CompareMode, CullMode, FilterMode, IndexFormat, MipmapFilter,
    PrimitiveType, StencilAction, Winding, WrapMode,
};

pub const fn compare_op(mode: CompareMode) -> vk::CompareOp {
    match mode {
        CompareMode::Less => vk::CompareOp::LESS,
        CompareMode::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareMode::Equal => vk::CompareOp::EQUAL,
        CompareMode::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareMode::Greater => vk::CompareOp::GREATER,
        CompareMode::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareMode::Always => vk::CompareOp::ALWAYS,
        CompareMode::Never => vk::CompareOp::NEVER,
    }
}

pub const fn stencil_op(action: StencilAction) -> vk::StencilOp {
    match action {
        StencilAction::Keep => vk::StencilOp::KEEP,
        StencilAction::Zero => vk::StencilOp::ZERO,
        StencilAction::Replace => vk::StencilOp::REPLACE,
        StencilAction::Increment => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilAction::Decrement => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilAction::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilAction::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
        StencilAction::Invert => vk::StencilOp::INVERT,
    }
}

pub const fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        BlendFactor::SrcAlphaSaturated => vk::BlendFactor::SRC_ALPHA_SATURATE,
    }
}

pub const fn blend_op(operation: BlendOperation) -> vk::BlendOp {
    match operation {
        BlendOperation::Add => vk::BlendOp::ADD,
        BlendOperation::Subtract => vk::BlendOp::SUBTRACT,
        BlendOperation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOperation::Min => vk::BlendOp::MIN,
        BlendOperation::Max => vk::BlendOp::MAX,
    }
}

pub const fn topology(primitive: PrimitiveType) -> vk::PrimitiveTopology {
    match primitive {
        PrimitiveType::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveType::Lines => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveType::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveType::Points => vk::PrimitiveTopology::POINT_LIST,
    }
}

pub const fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub const fn front_face(winding: Winding) -> vk::FrontFace {
    match winding {
        Winding::Clockwise => vk::FrontFace::CLOCKWISE,
        Winding::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
    }
}

pub const fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

pub const fn load_op(action: LoadAction) -> vk::AttachmentLoadOp {
    match action {
        LoadAction::Load => vk::AttachmentLoadOp::LOAD,
        LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

const fn filter(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

const fn address_mode(wrap: WrapMode) -> vk::SamplerAddressMode {
    match wrap {
        WrapMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        WrapMode::ClampZero | WrapMode::ClampOne => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
        WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

/// Sampler create info; `max_anisotropy` is the device limit
///
/// Only one border color exists per sampler, so opaque white wins when any
/// axis asks for it.
pub fn sampler_info(desc: &SamplerDescriptor, max_anisotropy: f32) -> vk::SamplerCreateInfo {
    let wraps = [desc.wrap_u, desc.wrap_v, desc.wrap_w];
    let border_color = if wraps.contains(&WrapMode::ClampOne) {
        vk::BorderColor::FLOAT_OPAQUE_WHITE
    } else {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    };

    let (mipmap_mode, max_lod) = match desc.mipmap_filter {
        MipmapFilter::None => (vk::SamplerMipmapMode::NEAREST, f32::from(desc.min_lod)),
        MipmapFilter::Nearest => (vk::SamplerMipmapMode::NEAREST, f32::from(desc.max_lod)),
        MipmapFilter::Linear => (vk::SamplerMipmapMode::LINEAR, f32::from(desc.max_lod)),
    };

    let anisotropy = f32::from(desc.max_anisotropy).min(max_anisotropy);

    vk::SamplerCreateInfo::builder()
        .min_filter(filter(desc.min_filter))
        .mag_filter(filter(desc.mag_filter))
        .mipmap_mode(mipmap_mode)
        .address_mode_u(address_mode(desc.wrap_u))
        .address_mode_v(address_mode(desc.wrap_v))
        .address_mode_w(address_mode(desc.wrap_w))
        .anisotropy_enable(anisotropy > 1.0)
        .max_anisotropy(anisotropy.max(1.0))
        .compare_enable(desc.compare.is_some())
        .compare_op(desc.compare.map_or(vk::CompareOp::ALWAYS, compare_op))
        .min_lod(f32::from(desc.min_lod))
        .max_lod(max_lod)
        .border_color(border_color)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_border_prefers_white() {
        let desc = SamplerDescriptor {
            wrap_u: WrapMode::ClampZero,
            wrap_v: WrapMode::ClampOne,
            ..SamplerDescriptor::default()
        };
        let info = sampler_info(&desc, 16.0);
        assert_eq!(info.border_color, vk::BorderColor::FLOAT_OPAQUE_WHITE);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_BORDER);
    }

    #[test]
    fn test_sampler_anisotropy_clamped_to_device() {
        let desc = SamplerDescriptor {
            max_anisotropy: 16,
            ..SamplerDescriptor::default()
        };
        let info = sampler_info(&desc, 4.0);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert!((info.max_anisotropy - 4.0).abs() < f32::EPSILON);

        let info = sampler_info(&desc, 1.0);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
    }

    #[test]
    fn test_mipmaps_disabled_pins_lod() {
        let desc = SamplerDescriptor {
            mipmap_filter: MipmapFilter::None,
            max_lod: 8,
            ..SamplerDescriptor::default()
        };
        let info = sampler_info(&desc, 1.0);
        assert!(info.max_lod.abs() < f32::EPSILON);
    }
}
