//! Shader uniform table and resource binding slots

use std::collections::HashMap;

use log::{debug, warn};

use super::reflection::{canonicalize_uniform_name, ShaderReflection};
use super::uniform::{UniformId, UniformInfo, UniformType};
use super::{BuiltinUniform, ShaderStage, MAIN_TEXTURE_UNIT};
use crate::render::backend::{
    BufferId, GpuBackend, LinkedProgram, ProgramDesc, ProgramId, SamplerId, ShaderStageSource,
    TextureId, UniformUpload, UnitBinding,
};
use crate::render::resources::DefaultResources;
use crate::render::types::{Access, BufferUsageFlags, PixelFormat, TextureType};
use crate::render::{RenderError, RenderResult};

/// Texture as seen by a shader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundTexture {
    /// Texture handle
    pub id: TextureId,
    /// Dimensionality
    pub texture_type: TextureType,
    /// Sampler state of the texture
    pub sampler: SamplerId,
    /// Pixel format
    pub format: PixelFormat,
    /// Whether the texture was created for storage access
    pub storage: bool,
}

/// Buffer as seen by a shader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundBuffer {
    /// Buffer handle
    pub id: BufferId,
    /// Usage the buffer was created with
    pub usage: BufferUsageFlags,
}

/// Values written into a uniform's local storage
#[derive(Debug, Clone, Copy)]
pub enum UniformValues<'a> {
    /// Float scalars, vectors or matrices (column-major)
    Float(&'a [f32]),
    /// Signed integers
    Int(&'a [i32]),
    /// Unsigned integers
    Uint(&'a [u32]),
    /// Booleans
    Bool(&'a [bool]),
}

/// One texture unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUnit {
    /// Expected texture type
    pub texture_type: TextureType,
    /// Whether any active uniform maps to the unit
    pub active: bool,
    /// Whether the unit holds a texel buffer rather than a texture
    pub is_texel_buffer: bool,
    /// Resource currently assigned
    pub binding: Option<UnitBinding>,
}

impl TextureUnit {
    const fn reserved() -> Self {
        Self {
            texture_type: TextureType::Tex2D,
            active: false,
            is_texel_buffer: false,
            binding: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StorageTextureSlot {
    texture: Option<TextureId>,
    access: Access,
    format: PixelFormat,
}

/// One storage buffer binding point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBufferSlot {
    /// Binding index
    pub binding: u32,
    /// Buffer currently assigned
    pub buffer: Option<BufferId>,
}

/// A linked program with its uniform table and binding slots
#[derive(Debug)]
pub struct Shader {
    name: String,
    program: ProgramId,
    compute: bool,
    uniforms: Vec<UniformInfo>,
    by_name: HashMap<String, UniformId>,
    builtins: HashMap<BuiltinUniform, UniformId>,
    texture_units: Vec<TextureUnit>,
    storage_textures: Vec<StorageTextureSlot>,
    storage_buffers: Vec<StorageBufferSlot>,
    active_textures: Vec<Option<TextureId>>,
    active_buffers: Vec<Option<BufferId>>,
    pending_updates: Vec<(UniformId, usize)>,
    unknown_bindings: Vec<String>,
    link_log: String,
}

impl Shader {
    /// Link `stages` and build the uniform table and binding slots
    ///
    /// Every slot starts out holding the matching default resource.
    /// Active uniforms the declaration does not know about are recorded in
    /// [`Shader::unknown_bindings`] and otherwise ignored.
    pub fn link<B: GpuBackend>(
        backend: &mut B,
        name: &str,
        stages: &[ShaderStageSource],
        reflection: &ShaderReflection,
        defaults: &DefaultResources,
    ) -> RenderResult<Self> {
        debug!("Linking shader '{}' ({} stages)", name, stages.len());

        let linked = backend.create_program(&ProgramDesc {
            label: name,
            stages,
            reflection,
        })?;

        if !linked.log.is_empty() {
            warn!("Shader '{}' link log: {}", name, linked.log);
        }

        let mut shader = Self {
            name: name.to_string(),
            program: linked.program,
            compute: stages.iter().any(|s| s.stage == ShaderStage::Compute),
            uniforms: Vec::new(),
            by_name: HashMap::new(),
            builtins: HashMap::new(),
            texture_units: vec![TextureUnit::reserved()],
            storage_textures: Vec::new(),
            storage_buffers: Vec::new(),
            active_textures: vec![None; reflection.texture_resource_count()],
            active_buffers: vec![None; reflection.buffer_resource_count()],
            pending_updates: Vec::new(),
            unknown_bindings: Vec::new(),
            link_log: linked.log.clone(),
        };

        for info in reflection.uniforms().chain(reflection.storage_blocks()) {
            let id = UniformId(shader.uniforms.len());
            shader.by_name.insert(info.name.clone(), id);
            shader.uniforms.push(info.clone());
        }

        shader.map_active_uniforms(backend, &linked, reflection, defaults);
        shader.map_storage_blocks(backend, &linked, defaults);

        debug!(
            "Shader '{}' linked: {} active uniforms, {} texture units, {} storage buffers",
            shader.name,
            shader.uniforms.iter().filter(|u| u.active).count(),
            shader.texture_units.len(),
            shader.storage_buffers.len()
        );

        Ok(shader)
    }

    fn map_active_uniforms<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        linked: &LinkedProgram,
        reflection: &ShaderReflection,
        defaults: &DefaultResources,
    ) {
        for active in &linked.uniforms {
            let name = canonicalize_uniform_name(&active.name);
            let Some(id) = self.by_name.get(name).copied() else {
                self.report_unknown(name);
                continue;
            };
            let builtin = BuiltinUniform::from_name(name);

            let info = &mut self.uniforms[id.0];
            if info.base_type == UniformType::StorageBuffer {
                continue;
            }
            info.active = true;
            info.location = active.location;
            info.allocate();
            if let Some(words) = reflection.initializer(name) {
                info.apply_initializer(words);
            }

            let count = info.count;
            match info.base_type {
                UniformType::Sampler | UniformType::TexelBuffer => {
                    let is_texel_buffer = info.base_type == UniformType::TexelBuffer;
                    let unit_template = TextureUnit {
                        texture_type: info.texture_type,
                        active: true,
                        is_texel_buffer,
                        binding: None,
                    };
                    let units: Vec<usize> = if builtin == Some(BuiltinUniform::MainTexture) {
                        // element 0 owns the reserved unit, any further elements get fresh units
                        let unit = &mut self.texture_units[MAIN_TEXTURE_UNIT as usize];
                        unit.active = true;
                        unit.texture_type = info.texture_type;
                        let start = self.texture_units.len();
                        self.texture_units.extend((1..count).map(|_| unit_template));
                        std::iter::once(MAIN_TEXTURE_UNIT as usize)
                            .chain(start..start + count.saturating_sub(1))
                            .collect()
                    } else {
                        let start = self.texture_units.len();
                        self.texture_units.extend((0..count).map(|_| unit_template));
                        (start..start + count).collect()
                    };
                    for (slot, unit) in info.ints_mut().iter_mut().zip(units) {
                        *slot = unit as i32;
                    }
                }
                UniformType::StorageTexture => {
                    let start = self.storage_textures.len();
                    let slot = StorageTextureSlot {
                        texture: None,
                        access: info.access,
                        format: info.storage_format.unwrap_or_default(),
                    };
                    self.storage_textures.extend((0..count).map(|_| slot));
                    for (i, binding) in info.ints_mut().iter_mut().enumerate() {
                        *binding = (start + i) as i32;
                    }
                }
                _ => {}
            }

            if let Some(builtin) = builtin {
                self.builtins.insert(builtin, id);
            }

            self.upload(backend, id, count);

            let base_type = self.uniforms[id.0].base_type;
            for element in 0..count {
                if base_type.is_texture_resource() {
                    self.bind_texture_element(backend, id, element, None, defaults, false);
                } else if base_type.is_buffer_resource() {
                    self.bind_buffer_element(backend, id, element, None, defaults, false);
                }
            }
        }
    }

    fn map_storage_blocks<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        linked: &LinkedProgram,
        defaults: &DefaultResources,
    ) {
        for block in &linked.storage_blocks {
            let name = canonicalize_uniform_name(block);
            let id = match self.by_name.get(name).copied() {
                Some(id) if self.uniforms[id.0].base_type == UniformType::StorageBuffer => id,
                _ => {
                    self.report_unknown(name);
                    continue;
                }
            };

            let info = &mut self.uniforms[id.0];
            info.active = true;
            info.allocate();
            info.ints_mut().fill(-1);

            let count = info.count;
            for element in 0..count {
                let binding = self.storage_buffers.len() as u32;
                self.storage_buffers.push(StorageBufferSlot {
                    binding,
                    buffer: None,
                });
                self.uniforms[id.0].ints_mut()[element] = binding as i32;
                self.bind_buffer_element(backend, id, element, None, defaults, false);
            }
        }
    }

    fn report_unknown(&mut self, name: &str) {
        let error = RenderError::UnknownBinding(name.to_string());
        warn!("Shader '{}': {}", self.name, error);
        self.unknown_bindings.push(name.to_string());
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend program
    pub const fn program(&self) -> ProgramId {
        self.program
    }

    /// Whether the program has a compute stage
    pub const fn is_compute(&self) -> bool {
        self.compute
    }

    /// Non-fatal linker output
    pub fn link_log(&self) -> &str {
        &self.link_log
    }

    /// Look up a uniform or storage block by name, array subscripts are ignored
    pub fn uniform_id(&self, name: &str) -> Option<UniformId> {
        self.by_name.get(canonicalize_uniform_name(name)).copied()
    }

    /// Uniform metadata and local data
    pub fn uniform(&self, id: UniformId) -> Option<&UniformInfo> {
        self.uniforms.get(id.0)
    }

    /// Uniform the core fills automatically, if declared and active
    pub fn builtin(&self, builtin: BuiltinUniform) -> Option<UniformId> {
        self.builtins.get(&builtin).copied()
    }

    /// Texture units, unit 0 is the main texture
    pub fn texture_units(&self) -> &[TextureUnit] {
        &self.texture_units
    }

    /// Storage buffer binding points
    pub fn storage_buffer_slots(&self) -> &[StorageBufferSlot] {
        &self.storage_buffers
    }

    /// Texture held by each texture-half slot
    pub fn active_textures(&self) -> &[Option<TextureId>] {
        &self.active_textures
    }

    /// Buffer held by each buffer-half slot
    pub fn active_buffers(&self) -> &[Option<BufferId>] {
        &self.active_buffers
    }

    /// Number of uniform updates waiting for the next [`Shader::attach`]
    pub fn pending_update_count(&self) -> usize {
        self.pending_updates.len()
    }

    /// Active names the linker reported that were never declared
    pub fn unknown_bindings(&self) -> &[String] {
        &self.unknown_bindings
    }

    /// Write values into a uniform's local storage, returns the elements touched
    pub fn write_uniform(&mut self, id: UniformId, values: UniformValues<'_>) -> RenderResult<usize> {
        let info = self.uniforms.get_mut(id.0).ok_or_else(|| {
            RenderError::InvalidResourceState(format!("Unknown uniform index {}", id.0))
        })?;

        let compatible = matches!(
            (info.base_type, values),
            (UniformType::Float | UniformType::Matrix, UniformValues::Float(_))
                | (UniformType::Int, UniformValues::Int(_))
                | (UniformType::Uint, UniformValues::Uint(_))
                | (UniformType::Bool, UniformValues::Bool(_))
        );
        if !compatible {
            return Err(RenderError::InvalidResourceState(format!(
                "Uniform '{}' of type {:?} cannot take {:?}",
                info.name, info.base_type, values
            )));
        }

        if !info.has_data() {
            info.allocate();
        }

        let words = info.words_mut();
        let written = match values {
            UniformValues::Float(v) => copy_words(words, bytemuck::cast_slice(v)),
            UniformValues::Int(v) => copy_words(words, bytemuck::cast_slice(v)),
            UniformValues::Uint(v) => copy_words(words, v),
            UniformValues::Bool(v) => {
                let len = v.len().min(words.len());
                for (dst, src) in words.iter_mut().zip(&v[..len]) {
                    *dst = u32::from(*src);
                }
                len
            }
        };

        Ok(info.elements_for_words(written))
    }

    /// Send `count` elements of a uniform to the backend, or queue the update
    /// until the next [`Shader::attach`] when this shader is not current
    pub fn update_uniform<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        id: UniformId,
        count: usize,
        is_current: bool,
    ) {
        if is_current {
            self.upload(backend, id, count);
        } else if let Some(entry) = self.pending_updates.iter_mut().find(|(u, _)| *u == id) {
            entry.1 = entry.1.max(count);
        } else {
            self.pending_updates.push((id, count));
        }
    }

    fn upload<B: GpuBackend>(&self, backend: &mut B, id: UniformId, count: usize) {
        let Some(info) = self.uniforms.get(id.0) else {
            return;
        };
        if !info.active || info.location < 0 || !info.has_data() {
            return;
        }

        let count = count.min(info.count);
        let words = &info.words()[..count * info.element_words()];
        backend.set_uniform(
            self.program,
            info.location,
            &UniformUpload {
                base_type: info.base_type,
                components: info.components,
                matrix: info.matrix,
                count,
                words,
            },
        );
    }

    /// Make this shader current: rebind every slot and flush queued uniform updates
    ///
    /// Returns the number of queued updates applied.
    pub fn attach<B: GpuBackend>(&mut self, backend: &mut B) -> usize {
        for (unit, texture_unit) in self.texture_units.iter().enumerate() {
            if let (true, Some(binding)) = (texture_unit.active, texture_unit.binding) {
                backend.bind_texture_unit(unit as u32, binding);
            }
        }

        for (binding, slot) in self.storage_textures.iter().enumerate() {
            backend.bind_storage_texture(binding as u32, slot.texture, slot.access, slot.format);
        }

        for slot in &self.storage_buffers {
            backend.bind_storage_buffer(slot.binding, slot.buffer);
        }

        let pending = std::mem::take(&mut self.pending_updates);
        for (id, count) in &pending {
            self.upload(backend, *id, *count);
        }
        pending.len()
    }

    /// Assign textures to a sampler or storage texture uniform
    ///
    /// `None` entries, and entries past the supplied slice, fall back to the
    /// default texture of the uniform's type. Extra entries beyond the
    /// uniform's array length are ignored. Returns the non-default textures
    /// displaced from their slots.
    pub fn send_textures<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        id: UniformId,
        textures: &[Option<BoundTexture>],
        defaults: &DefaultResources,
        is_current: bool,
    ) -> RenderResult<Vec<TextureId>> {
        let info = self.uniforms.get(id.0).ok_or_else(|| {
            RenderError::InvalidResourceState(format!("Unknown uniform index {}", id.0))
        })?;
        if !info.base_type.is_texture_resource() {
            return Err(RenderError::InvalidResourceState(format!(
                "Uniform '{}' is not a texture uniform",
                info.name
            )));
        }
        if !info.active {
            return Ok(Vec::new());
        }

        let count = textures.len().min(info.count);
        for texture in textures[..count].iter().flatten() {
            validate_texture(info, texture)?;
        }

        let mut displaced = Vec::new();
        for (element, texture) in textures[..count].iter().enumerate() {
            if let Some(previous) =
                self.bind_texture_element(backend, id, element, *texture, defaults, is_current)
            {
                if !defaults.is_default_texture(previous) {
                    displaced.push(previous);
                }
            }
        }
        Ok(displaced)
    }

    /// Assign buffers to a texel buffer or storage buffer uniform
    ///
    /// Follows the same fallback and clamping rules as [`Shader::send_textures`].
    pub fn send_buffers<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        id: UniformId,
        buffers: &[Option<BoundBuffer>],
        defaults: &DefaultResources,
        is_current: bool,
    ) -> RenderResult<Vec<BufferId>> {
        let info = self.uniforms.get(id.0).ok_or_else(|| {
            RenderError::InvalidResourceState(format!("Unknown uniform index {}", id.0))
        })?;
        if !info.base_type.is_buffer_resource() {
            return Err(RenderError::InvalidResourceState(format!(
                "Uniform '{}' is not a buffer uniform",
                info.name
            )));
        }
        if !info.active {
            return Ok(Vec::new());
        }

        let required = if info.base_type == UniformType::TexelBuffer {
            BufferUsageFlags::TEXEL
        } else {
            BufferUsageFlags::SHADER_STORAGE
        };
        let count = buffers.len().min(info.count);
        if let Some(bad) = buffers[..count].iter().flatten().find(|b| !b.usage.contains(required)) {
            return Err(RenderError::InvalidResourceState(format!(
                "Buffer {:?} lacks {:?} usage required by '{}'",
                bad.id, required, info.name
            )));
        }

        let mut displaced = Vec::new();
        for (element, buffer) in buffers[..count].iter().enumerate() {
            if let Some(previous) =
                self.bind_buffer_element(backend, id, element, *buffer, defaults, is_current)
            {
                if !defaults.is_default_buffer(previous) {
                    displaced.push(previous);
                }
            }
        }
        Ok(displaced)
    }

    /// Replace every slot holding `texture` with the default, returns slots touched
    pub fn scrub_texture<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        texture: TextureId,
        defaults: &DefaultResources,
        is_current: bool,
    ) -> usize {
        let targets = self.elements_holding(|info, slot| {
            info.base_type.is_texture_resource() && self.active_textures.get(slot) == Some(&Some(texture))
        });
        for (id, element) in &targets {
            self.bind_texture_element(backend, *id, *element, None, defaults, is_current);
        }
        targets.len()
    }

    /// Replace every slot holding `buffer` with the default, returns slots touched
    pub fn scrub_buffer<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        buffer: BufferId,
        defaults: &DefaultResources,
        is_current: bool,
    ) -> usize {
        let targets = self.elements_holding(|info, slot| {
            info.base_type.is_buffer_resource() && self.active_buffers.get(slot) == Some(&Some(buffer))
        });
        for (id, element) in &targets {
            self.bind_buffer_element(backend, *id, *element, None, defaults, is_current);
        }
        targets.len()
    }

    fn elements_holding(&self, holds: impl Fn(&UniformInfo, usize) -> bool) -> Vec<(UniformId, usize)> {
        self.uniforms
            .iter()
            .enumerate()
            .filter(|(_, info)| info.active)
            .flat_map(|(index, info)| {
                (0..info.count)
                    .filter(|element| holds(info, info.resource_index + element))
                    .map(move |element| (UniformId(index), element))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn bind_texture_element<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        id: UniformId,
        element: usize,
        texture: Option<BoundTexture>,
        defaults: &DefaultResources,
        is_current: bool,
    ) -> Option<TextureId> {
        let info = &self.uniforms[id.0];
        let resolved = texture.unwrap_or_else(|| defaults.texture(info.texture_type));
        let slot = info.ints().get(element).copied().unwrap_or(-1);
        if slot < 0 {
            return None;
        }
        let slot = slot as usize;

        let previous = self
            .active_textures
            .get_mut(info.resource_index + element)
            .and_then(|entry| entry.replace(resolved.id));

        if info.base_type == UniformType::StorageTexture {
            let bound = if texture.is_none() && info.access.contains(Access::WRITE) {
                None
            } else {
                Some(resolved.id)
            };
            if let Some(storage) = self.storage_textures.get_mut(slot) {
                storage.texture = bound;
                if is_current {
                    backend.bind_storage_texture(slot as u32, bound, storage.access, storage.format);
                }
            }
        } else {
            let binding = UnitBinding::Texture {
                texture: resolved.id,
                texture_type: info.texture_type,
                sampler: resolved.sampler,
            };
            if let Some(unit) = self.texture_units.get_mut(slot) {
                unit.binding = Some(binding);
                if is_current {
                    backend.bind_texture_unit(slot as u32, binding);
                }
            }
        }

        previous
    }

    fn bind_buffer_element<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        id: UniformId,
        element: usize,
        buffer: Option<BoundBuffer>,
        defaults: &DefaultResources,
        is_current: bool,
    ) -> Option<BufferId> {
        let info = &self.uniforms[id.0];
        let is_texel = info.base_type == UniformType::TexelBuffer;
        let resolved = buffer.unwrap_or_else(|| {
            if is_texel {
                defaults.texel_buffer()
            } else {
                defaults.storage_buffer()
            }
        });
        let slot = info.ints().get(element).copied().unwrap_or(-1);
        if slot < 0 {
            return None;
        }
        let slot = slot as usize;

        let previous = self
            .active_buffers
            .get_mut(info.resource_index + element)
            .and_then(|entry| entry.replace(resolved.id));

        if is_texel {
            let binding = UnitBinding::TexelBuffer(resolved.id);
            if let Some(unit) = self.texture_units.get_mut(slot) {
                unit.binding = Some(binding);
                if is_current {
                    backend.bind_texture_unit(slot as u32, binding);
                }
            }
        } else if let Some(storage) = self.storage_buffers.get_mut(slot) {
            storage.buffer = Some(resolved.id);
            if is_current {
                backend.bind_storage_buffer(storage.binding, storage.buffer);
            }
        }

        previous
    }

    /// Destroy the backend program
    pub fn destroy<B: GpuBackend>(self, backend: &mut B) {
        debug!("Destroying shader '{}'", self.name);
        backend.destroy_program(self.program);
    }
}

fn validate_texture(info: &UniformInfo, texture: &BoundTexture) -> RenderResult<()> {
    if texture.texture_type != info.texture_type {
        return Err(RenderError::InvalidResourceState(format!(
            "Uniform '{}' expects a {:?} texture, got {:?}",
            info.name, info.texture_type, texture.texture_type
        )));
    }
    if info.base_type == UniformType::StorageTexture {
        if !texture.storage {
            return Err(RenderError::InvalidResourceState(format!(
                "Texture bound to '{}' was not created for storage access",
                info.name
            )));
        }
        if let Some(format) = info.storage_format {
            if format != texture.format {
                return Err(RenderError::InvalidResourceState(format!(
                    "Uniform '{}' expects {:?}, texture is {:?}",
                    info.name, format, texture.format
                )));
            }
        }
    }
    Ok(())
}

fn copy_words(dst: &mut [u32], src: &[u32]) -> usize {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    len
}
