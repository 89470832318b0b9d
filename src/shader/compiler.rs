//! GLSL compilation and program linking.
//!
//! Stages are parsed and validated with naga, translated to WGSL for the
//! backend, and linked by checking the cross-stage interface against the
//! fixed pipeline layout before the backend builds the program.

use super::uniforms::{UniformLayout, UniformSlot, MAX_UNIFORM_BLOCK_SIZE};
use super::ShaderStage;
use crate::error::ShaderError;
use crate::logging::sanitize_diagnostic;
use crate::render::backend::{GpuBackend, ProgramId};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, Module, Scalar, TypeInner};
use tracing::debug;

/// Entry point name of both stages.
pub const ENTRY_POINT: &str = "main";

/// Binding slots of the fixed pipeline layout (group 0).
pub const FRAME_TEXTURE_BINDING: u32 = 0;
pub const FRAME_SAMPLER_BINDING: u32 = 1;
pub const RUNTIME_UNIFORM_BINDING: u32 = 2;

/// A single stage that parsed and validated.
#[derive(Debug)]
pub struct CompiledStage {
    pub stage: ShaderStage,
    pub module: Module,
    pub wgsl: String,
}

/// Names and uniform layout a program exposes to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramInterface {
    /// Vertex stage inputs.
    pub attributes: Vec<String>,
    /// Textures and samplers declared by the fragment stage.
    pub samplers: Vec<String>,
    /// Members of the runtime uniform block.
    pub uniforms: UniformLayout,
}

impl ProgramInterface {
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a == name)
    }

    pub fn has_sampler(&self, name: &str) -> bool {
        self.samplers.iter().any(|s| s == name)
    }
}

/// Both stages after a successful link, ready for the backend.
#[derive(Debug)]
pub struct LinkedProgram {
    pub vertex_wgsl: String,
    pub fragment_wgsl: String,
    pub interface: ProgramInterface,
}

/// A program owned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramHandle {
    id: ProgramId,
    interface: ProgramInterface,
    fragment_source: String,
}

impl ProgramHandle {
    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn interface(&self) -> &ProgramInterface {
        &self.interface
    }

    pub fn fragment_source(&self) -> &str {
        &self.fragment_source
    }
}

struct Varying {
    location: u32,
    name: Option<String>,
    inner: TypeInner,
}

/// Compiles and links shader programs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShaderCompiler;

impl ShaderCompiler {
    /// Parses and validates one stage.
    pub fn compile(stage: ShaderStage, source: &str) -> Result<CompiledStage, ShaderError> {
        let compile_error = |log: String| ShaderError::Compile {
            stage,
            log: sanitize_diagnostic(&log),
        };

        let mut frontend = Frontend::default();
        let options = Options::from(stage.to_naga());
        let module = frontend
            .parse(&options, source)
            .map_err(|e| compile_error(e.emit_to_string(source)))?;

        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        let info = validator
            .validate(&module)
            .map_err(|e| compile_error(e.emit_to_string(source)))?;

        let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|e| compile_error(e.to_string()))?;

        if entry_point(&module).is_none() {
            return Err(compile_error(format!("missing `{}` entry point", ENTRY_POINT)));
        }

        Ok(CompiledStage { stage, module, wgsl })
    }

    /// Checks that the stages fit each other and the pipeline layout.
    pub fn link(vertex: CompiledStage, fragment: CompiledStage) -> Result<LinkedProgram, ShaderError> {
        let link_error = |log: String| ShaderError::Link {
            log: sanitize_diagnostic(&log),
        };

        check_varyings(&vertex.module, &fragment.module).map_err(link_error)?;
        let uniforms_vs = check_bindings(&vertex.module).map_err(link_error)?;
        let uniforms_fs = check_bindings(&fragment.module).map_err(link_error)?;

        let interface = ProgramInterface {
            attributes: attribute_names(&vertex.module),
            samplers: sampler_names(&fragment.module),
            uniforms: uniforms_fs.or(uniforms_vs).unwrap_or_default(),
        };

        Ok(LinkedProgram {
            vertex_wgsl: vertex.wgsl,
            fragment_wgsl: fragment.wgsl,
            interface,
        })
    }

    /// Compiles the vertex stage, then the fragment stage, links them and
    /// activates the result on `backend`. Nothing is linked if either stage
    /// fails, and the backend's active program is untouched on error.
    pub fn compile_and_link<B: GpuBackend + ?Sized>(
        backend: &mut B,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, ShaderError> {
        let vertex = Self::compile(ShaderStage::Vertex, vertex_source)?;
        debug!("Compiled vertex shader.");

        let fragment = Self::compile(ShaderStage::Fragment, fragment_source)?;
        debug!("Compiled fragment shader.");

        let linked = Self::link(vertex, fragment)?;
        let id = backend.create_program(&linked)?;
        backend.use_program(id);
        debug!("Created program {:?}.", id);

        Ok(ProgramHandle {
            id,
            interface: linked.interface,
            fragment_source: fragment_source.to_string(),
        })
    }
}

fn entry_point(module: &Module) -> Option<&naga::EntryPoint> {
    module
        .entry_points
        .iter()
        .find(|ep| ep.name == ENTRY_POINT)
        .or_else(|| module.entry_points.first())
}

fn location_of(binding: &Option<Binding>) -> Option<u32> {
    match binding {
        Some(Binding::Location { location, .. }) => Some(*location),
        _ => None,
    }
}

fn input_varyings(module: &Module) -> Vec<Varying> {
    let Some(ep) = entry_point(module) else {
        return Vec::new();
    };

    let mut varyings = Vec::new();
    for arg in &ep.function.arguments {
        let inner = &module.types[arg.ty].inner;
        if let Some(location) = location_of(&arg.binding) {
            varyings.push(Varying {
                location,
                name: arg.name.clone(),
                inner: inner.clone(),
            });
        } else if let TypeInner::Struct { members, .. } = inner {
            for member in members {
                if let Some(location) = location_of(&member.binding) {
                    varyings.push(Varying {
                        location,
                        name: member.name.clone(),
                        inner: module.types[member.ty].inner.clone(),
                    });
                }
            }
        }
    }
    varyings
}

fn output_varyings(module: &Module) -> Vec<Varying> {
    let Some(result) = entry_point(module).and_then(|ep| ep.function.result.as_ref()) else {
        return Vec::new();
    };

    let inner = &module.types[result.ty].inner;
    if let Some(location) = location_of(&result.binding) {
        return vec![Varying {
            location,
            name: None,
            inner: inner.clone(),
        }];
    }

    match inner {
        TypeInner::Struct { members, .. } => members
            .iter()
            .filter_map(|member| {
                location_of(&member.binding).map(|location| Varying {
                    location,
                    name: member.name.clone(),
                    inner: module.types[member.ty].inner.clone(),
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn check_varyings(vertex: &Module, fragment: &Module) -> Result<(), String> {
    let produced = output_varyings(vertex);

    for input in input_varyings(fragment) {
        let name = input.name.as_deref().unwrap_or("<unnamed>");
        match produced.iter().find(|out| out.location == input.location) {
            None => {
                return Err(format!(
                    "fragment input `{}` at location {} is not written by the vertex stage",
                    name, input.location
                ));
            }
            Some(out) if out.inner != input.inner => {
                return Err(format!(
                    "fragment input `{}` at location {} does not match the vertex output type",
                    name, input.location
                ));
            }
            Some(_) => {}
        }
    }

    if !output_varyings(fragment).iter().any(|out| out.location == 0) {
        return Err("fragment stage does not write a color to location 0".to_string());
    }

    Ok(())
}

/// Validates resource bindings and returns the runtime uniform layout, if the
/// module declares one.
fn check_bindings(module: &Module) -> Result<Option<UniformLayout>, String> {
    let mut layout = None;

    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };
        let name = var.name.as_deref().unwrap_or("<unnamed>");

        if binding.group != 0 {
            return Err(format!(
                "resource `{}` uses group {}, only group 0 is available",
                name, binding.group
            ));
        }

        match (binding.binding, &module.types[var.ty].inner) {
            (FRAME_TEXTURE_BINDING, TypeInner::Image { .. }) => {}
            (FRAME_SAMPLER_BINDING, TypeInner::Sampler { comparison: false }) => {}
            (RUNTIME_UNIFORM_BINDING, TypeInner::Struct { members, span }) if var.space == AddressSpace::Uniform => {
                if *span > MAX_UNIFORM_BLOCK_SIZE {
                    return Err(format!(
                        "uniform block `{}` is {} bytes, the runtime block holds at most {}",
                        name, span, MAX_UNIFORM_BLOCK_SIZE
                    ));
                }
                let slots = members
                    .iter()
                    .filter_map(|member| {
                        let components = float_components(&module.types[member.ty].inner)?;
                        Some(UniformSlot {
                            name: member.name.clone()?,
                            offset: member.offset,
                            components,
                        })
                    })
                    .collect();
                layout = Some(UniformLayout::new(slots, *span));
            }
            (slot, _) => {
                return Err(format!(
                    "resource `{}` at binding {} does not match the pipeline layout \
                     (0: texture2D, 1: sampler, 2: uniform block)",
                    name, slot
                ));
            }
        }
    }

    Ok(layout)
}

fn float_components(inner: &TypeInner) -> Option<u32> {
    match inner {
        TypeInner::Scalar(scalar) if *scalar == Scalar::F32 => Some(1),
        TypeInner::Vector { size, scalar } if *scalar == Scalar::F32 => Some(*size as u32),
        _ => None,
    }
}

fn attribute_names(vertex: &Module) -> Vec<String> {
    let mut names: Vec<String> = input_varyings(vertex).into_iter().filter_map(|v| v.name).collect();

    // The GLSL front end also keeps stage inputs as named private globals.
    for (_, var) in vertex.global_variables.iter() {
        if var.space == AddressSpace::Private {
            if let Some(name) = &var.name {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
    }
    names
}

fn sampler_names(fragment: &Module) -> Vec<String> {
    fragment
        .global_variables
        .iter()
        .filter(|(_, var)| var.space == AddressSpace::Handle)
        .filter_map(|(_, var)| var.name.clone())
        .collect()
}
