//! Runtime uniform values and their placement in the uniform block.

use super::{RESOLUTION_UNIFORM, TIME_UNIFORM};
use crate::render::backend::GpuBackend;

/// Largest runtime block a program may declare, in bytes.
pub const MAX_UNIFORM_BLOCK_SIZE: u32 = 256;

/// Uniforms the pipeline knows how to feed, with their component counts.
const KNOWN_UNIFORMS: &[(&str, usize)] = &[(TIME_UNIFORM, 1), (RESOLUTION_UNIFORM, 2)];

/// One float member of the runtime block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformSlot {
    pub name: String,
    /// Byte offset inside the block.
    pub offset: u32,
    /// 1 for `float`, 2 to 4 for `vecN`.
    pub components: u32,
}

/// Reflected layout of a program's runtime uniform block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformLayout {
    slots: Vec<UniformSlot>,
    size: u32,
}

impl UniformLayout {
    pub fn new(slots: Vec<UniformSlot>, size: u32) -> Self {
        Self { slots, size }
    }

    pub fn slot(&self, name: &str) -> Option<&UniformSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn slots(&self) -> &[UniformSlot] {
        &self.slots
    }

    /// Block size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Last values handed to the GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Uniforms {
    /// Source playback time in seconds.
    pub time: f32,
    /// Source `[width, height]` in pixels.
    pub resolution: [f32; 2],
}

impl Uniforms {
    fn value(&self, name: &str) -> Option<&[f32]> {
        match name {
            TIME_UNIFORM => Some(std::slice::from_ref(&self.time)),
            RESOLUTION_UNIFORM => Some(&self.resolution),
            _ => None,
        }
    }
}

/// Routes named values into the active program's uniform block.
#[derive(Debug, Default)]
pub struct UniformBinder {
    current: Uniforms,
}

impl UniformBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `values` and uploads the block for `layout`.
    ///
    /// Unknown names and values of the wrong arity are ignored. Members the
    /// program does not declare are simply not written.
    pub fn bind<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, layout: &UniformLayout, values: &[(&str, &[f32])]) {
        for (name, value) in values {
            let Some(&(known, arity)) = KNOWN_UNIFORMS.iter().find(|(known, _)| known == name) else {
                continue;
            };
            if value.len() != arity {
                continue;
            }
            match known {
                TIME_UNIFORM => self.current.time = value[0],
                RESOLUTION_UNIFORM => self.current.resolution = [value[0], value[1]],
                _ => {}
            }
        }

        let block = self.pack(layout);
        if !block.is_empty() {
            backend.write_uniforms(&block);
        }
    }

    /// Serializes the current values at the offsets of `layout`.
    pub fn pack(&self, layout: &UniformLayout) -> Vec<u8> {
        let mut block = vec![0u8; layout.size() as usize];
        for slot in layout.slots() {
            let Some(value) = self.current.value(&slot.name) else {
                continue;
            };
            if value.len() != slot.components as usize {
                continue;
            }
            let bytes: &[u8] = bytemuck::cast_slice(value);
            let start = slot.offset as usize;
            if let Some(dst) = block.get_mut(start..start + bytes.len()) {
                dst.copy_from_slice(bytes);
            }
        }
        block
    }

    pub fn current(&self) -> Uniforms {
        self.current
    }
}
