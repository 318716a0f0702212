//! The native API surface the device layer drives.
//!
//! A backend only translates. It does not cache state, track device loss or
//! raise events; `Gfx` does all of that once for every backend.

#[cfg(test)]
pub mod recording;
pub mod software;
pub mod wgpu_core;

use crate::core::gfx::{
    DrawCall, GfxResourceId, MatrixType, PackedCol, VertexFormat,
    bitmap::TexelRect,
    error::NativeResult,
    state::StateChange,
};
use glam::Mat4;
use image::RgbaImage;

/// What a backend can and cannot do. Queried after device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCaps {
    /// Driver keeps a shadow copy of managed textures across a loss.
    pub managed_textures: bool,
    /// Non power-of-two textures are a usage error rather than a warning.
    pub strict_pow2: bool,
    /// Mip chains are capped (see `calc_mipmap_levels`).
    pub custom_mipmap_levels: bool,
    /// Pixel centres sit on integer coordinates; 2D quads shift by half a pixel.
    pub half_pixel_offset: bool,
    pub depth_bits: u32,
    pub max_texture_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// Total level count including level 0.
    pub levels: u32,
    pub managed: bool,
    pub dynamic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Written rarely, drawn often.
    Static,
    /// Rewritten most frames through discard locks.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Staged contents are uploaded in full on unlock.
    Normal,
    /// Previous contents are undefined and may live in another allocation.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentParams {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// The surface is hidden or minimized; the frame was dropped.
    Occluded,
}

pub trait Backend {
    fn name(&self) -> &'static str;
    fn caps(&self) -> BackendCaps;

    /// First device creation. Recoverable errors leave the device lost.
    fn create_device(&mut self, params: &PresentParams) -> NativeResult<()>;
    /// One recovery attempt. `Ok(false)` means try again later.
    fn restore_device(&mut self, params: &PresentParams) -> NativeResult<bool>;
    /// Applies new swapchain parameters (size, present interval).
    fn reset_swapchain(&mut self, params: &PresentParams) -> NativeResult<()>;
    /// Releases every native object, dependents first.
    fn release_device(&mut self);

    fn create_texture(&mut self, desc: &TextureDesc) -> NativeResult<GfxResourceId>;
    /// Writes one rectangle of one mip level. Unknown handles are ignored.
    fn write_texture(
        &mut self,
        tex: GfxResourceId,
        level: u32,
        rect: &TexelRect<'_>,
    ) -> NativeResult<()>;
    /// `GfxResourceId::NULL` unbinds.
    fn bind_texture(&mut self, tex: GfxResourceId);
    /// Returns the number of references still held elsewhere.
    fn delete_texture(&mut self, tex: GfxResourceId) -> u32;
    fn set_mipmap_filter(&mut self, enabled: bool);

    fn create_ib(&mut self, indices: &[u16]) -> NativeResult<GfxResourceId>;
    fn bind_ib(&mut self, ib: GfxResourceId);
    fn delete_ib(&mut self, ib: GfxResourceId) -> u32;

    fn create_vb(
        &mut self,
        fmt: VertexFormat,
        count: usize,
        usage: BufferUsage,
    ) -> NativeResult<GfxResourceId>;
    /// Maps `len` bytes for writing. The slice is 4-byte aligned. `Ok(None)`
    /// for handles the backend does not know.
    fn lock_vb(
        &mut self,
        vb: GfxResourceId,
        len: usize,
        mode: LockMode,
    ) -> NativeResult<Option<&mut [u8]>>;
    fn unlock_vb(&mut self, vb: GfxResourceId) -> NativeResult<()>;
    fn bind_vb(&mut self, vb: GfxResourceId);
    fn delete_vb(&mut self, vb: GfxResourceId) -> u32;
    fn set_vertex_format(&mut self, fmt: VertexFormat);

    fn apply_state(&mut self, change: StateChange);
    fn set_transform(&mut self, slot: MatrixType, matrix: &Mat4);
    fn set_texture_offset(&mut self, offset: Option<(f32, f32)>);

    fn begin_scene(&mut self) -> NativeResult<()>;
    fn clear(&mut self, col: PackedCol) -> NativeResult<()>;
    fn draw(&mut self, call: DrawCall);
    fn end_scene_and_present(&mut self) -> NativeResult<PresentStatus>;

    /// Asks for the next presented frame to be kept for `capture_frame`.
    fn request_capture(&mut self) {}
    fn capture_frame(&mut self) -> NativeResult<RgbaImage>;

    fn api_info(&self) -> Vec<String>;
    fn warning(&self) -> Option<String> {
        None
    }
}

/// Hands out non-zero ids, never reused for the lifetime of a backend.
#[derive(Debug)]
pub struct HandleAlloc {
    next: u64,
}

impl Default for HandleAlloc {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl HandleAlloc {
    pub fn next(&mut self) -> GfxResourceId {
        let id = GfxResourceId::from_raw(self.next);
        self.next += 1;
        id
    }
}

/// Helper for backends that render through a view/projection pair.
pub fn view_proj(view: &Mat4, projection: &Mat4) -> Mat4 {
    *projection * *view
}
