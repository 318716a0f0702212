pub mod backends;
pub mod bitmap;
mod context;
pub mod device;
mod draw2d;
pub mod error;
pub mod state;

pub use context::{Gfx, GfxOptions};
pub use device::{ContextEvent, ContextListener, DeviceState, ListenerRef};

use crate::core::gfx::backends::{Backend, software, wgpu_core};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use std::{error::Error, num::NonZeroU64, str::FromStr, sync::Arc};
use winit::window::Window;

// --- Public Data Contract ---

/// Opaque handle to a texture, vertex buffer or index buffer.
///
/// `NULL` means no resource. Deleting through `Gfx` always writes `NULL`
/// back into the caller's variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GfxResourceId(Option<NonZeroU64>);

impl GfxResourceId {
    pub const NULL: Self = Self(None);

    pub const fn from_raw(raw: u64) -> Self {
        Self(NonZeroU64::new(raw))
    }

    pub const fn raw(self) -> u64 {
        match self.0 {
            Some(v) => v.get(),
            None => 0,
        }
    }

    pub const fn is_null(self) -> bool {
        self.0.is_none()
    }
}

/// Packed `0xAARRGGBB` colour as stored in vertices.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct PackedCol(pub u32);

impl PackedCol {
    pub const WHITE: Self = Self::new(255, 255, 255, 255);
    pub const BLACK: Self = Self::new(0, 0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self(((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32))
    }

    pub const fn r(self) -> u8 {
        (self.0 >> 16) as u8
    }
    pub const fn g(self) -> u8 {
        (self.0 >> 8) as u8
    }
    pub const fn b(self) -> u8 {
        self.0 as u8
    }
    pub const fn a(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Multiplies each colour channel by `t`, keeping alpha. Used for shading.
    pub fn scale(self, t: f32) -> Self {
        let s = |c: u8| (f32::from(c) * t).clamp(0.0, 255.0) as u8;
        Self::new(s(self.r()), s(self.g()), s(self.b()), self.a())
    }

    pub fn to_f32(self) -> [f32; 4] {
        [
            f32::from(self.r()) / 255.0,
            f32::from(self.g()) / 255.0,
            f32::from(self.b()) / 255.0,
            f32::from(self.a()) / 255.0,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Coloured,
    Textured,
}

impl VertexFormat {
    pub const fn stride(self) -> usize {
        match self {
            Self::Coloured => size_of::<VertexColoured>(),
            Self::Textured => size_of::<VertexTextured>(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct VertexColoured {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub col: PackedCol,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct VertexTextured {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub col: PackedCol,
    pub u: f32,
    pub v: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FogFunc {
    Linear,
    Exp,
    Exp2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixType {
    View,
    Projection,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureFlags: u8 {
        /// Ask the driver to keep a copy that survives device loss.
        const MANAGED = 1 << 0;
        /// Content is rewritten often through `update_texture`.
        const DYNAMIC = 1 << 1;
    }
}

/// How a batch of world geometry is blended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawType {
    Opaque,
    Transparent,
    TransparentThick,
    Translucent,
    Gas,
    Sprite,
}

/// A primitive draw against the bound buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    Lines {
        vertex_count: u32,
    },
    IndexedTris {
        vertex_count: u32,
        index_count: u32,
        start_vertex: u32,
    },
}

/// Texture coordinates of a 2D quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureRec {
    pub u1: f32,
    pub v1: f32,
    pub u2: f32,
    pub v2: f32,
}

impl TextureRec {
    pub const FULL: Self = Self {
        u1: 0.0,
        v1: 0.0,
        u2: 1.0,
        v2: 1.0,
    };
}

/// A textured rectangle placed in 2D screen space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Texture {
    pub id: GfxResourceId,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub uv: TextureRec,
}

pub const GFX_MAX_VERTICES: usize = 65536;
pub const GFX_MAX_INDICES: usize = GFX_MAX_VERTICES / 4 * 6;

/// Quad index pattern `{0,1,2, 2,3,0}` shifted by 4 for every quad.
pub fn make_indices(count: usize) -> Vec<u16> {
    let mut indices = Vec::with_capacity(count);
    let mut element: u16 = 0;
    while indices.len() + 6 <= count {
        indices.extend_from_slice(&[
            element,
            element + 1,
            element + 2,
            element + 2,
            element + 3,
            element,
        ]);
        element = element.wrapping_add(4);
    }
    indices
}

// --- Public API Facade ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Software,
    Wgpu,
    VulkanWgpu,
    OpenGLWgpu,
    #[cfg(target_os = "windows")]
    DirectX,
}

/// Creates the native backend for `backend_type`. The device itself is
/// created by `Gfx::create`.
pub fn create_backend(
    backend_type: BackendType,
    window: Arc<Window>,
    opts: &GfxOptions,
) -> Result<Box<dyn Backend>, Box<dyn Error>> {
    let backend: Box<dyn Backend> = match backend_type {
        BackendType::Software => Box::new(software::SoftwareBackend::with_window(
            window,
            opts.vram_budget,
        )?),
        BackendType::Wgpu => Box::new(wgpu_core::WgpuBackend::new(
            wgpu_core::Api::Auto,
            window,
            opts.gfx_debug,
        )?),
        BackendType::VulkanWgpu => Box::new(wgpu_core::WgpuBackend::new(
            wgpu_core::Api::Vulkan,
            window,
            opts.gfx_debug,
        )?),
        BackendType::OpenGLWgpu => Box::new(wgpu_core::WgpuBackend::new(
            wgpu_core::Api::OpenGL,
            window,
            opts.gfx_debug,
        )?),
        #[cfg(target_os = "windows")]
        BackendType::DirectX => Box::new(wgpu_core::WgpuBackend::new(
            wgpu_core::Api::DirectX,
            window,
            opts.gfx_debug,
        )?),
    };
    Ok(backend)
}

// -- Boilerplate impls --
impl core::fmt::Display for BackendType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Software => write!(f, "Software"),
            Self::Wgpu => write!(f, "wgpu"),
            Self::VulkanWgpu => write!(f, "Vulkan (wgpu)"),
            Self::OpenGLWgpu => write!(f, "OpenGL (wgpu)"),
            #[cfg(target_os = "windows")]
            Self::DirectX => write!(f, "DirectX (wgpu)"),
        }
    }
}

impl FromStr for BackendType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "software" | "cpu" => Ok(Self::Software),
            "wgpu" | "auto" => Ok(Self::Wgpu),
            "vulkan-wgpu" | "vulkan_wgpu" | "wgpu-vulkan" | "vulkan (wgpu)" => Ok(Self::VulkanWgpu),
            "opengl-wgpu" | "opengl_wgpu" | "wgpu-opengl" | "opengl (wgpu)" => Ok(Self::OpenGLWgpu),
            #[cfg(target_os = "windows")]
            "directx" | "dx12" | "wgpu-dx12" | "directx (wgpu)" => Ok(Self::DirectX),
            _ => Err(format!("'{s}' is not a valid video renderer")),
        }
    }
}
