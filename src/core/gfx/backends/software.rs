//! Fixed-function CPU backend.
//!
//! Emulates a classic fixed-function device: per-slot view/projection
//! transforms, reversed-Z depth buffer, alpha test against 127, src-alpha
//! blending, per-pixel fog, clockwise culling and integer pixel centres.
//! Presents through softbuffer when attached to a window, otherwise renders
//! headless into its framebuffer.

use crate::core::gfx::{
    DrawCall, FogFunc, GfxResourceId, MatrixType, PackedCol, VertexColoured, VertexFormat,
    VertexTextured,
    backends::{
        Backend, BackendCaps, BufferUsage, HandleAlloc, LockMode, PresentParams, PresentStatus,
        TextureDesc, view_proj,
    },
    bitmap::{Bitmap, TexelRect, col_a, col_b, col_g, col_r, copy_texture_data, rgba_image},
    error::{NativeError, NativeResult},
    state::{ColorMask, StateChange},
};
use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use image::RgbaImage;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::{error::Error, num::NonZeroU32, sync::Arc};
use winit::window::Window;

const E_INVALIDARG: u32 = 0x8007_0057;
const MAX_TEXTURE_SIZE: u32 = 4096;
/// Alpha test reference; texels pass when alpha is strictly greater.
const ALPHA_REF: f32 = 127.0 / 255.0;
const W_EPSILON: f32 = 1e-5;

struct Presenter {
    window: Arc<Window>,
    _context: softbuffer::Context<Arc<Window>>,
    surface: softbuffer::Surface<Arc<Window>, Arc<Window>>,
}

struct Framebuffer {
    width: usize,
    height: usize,
    color: Vec<u32>,
    depth: Vec<f32>,
}

impl Framebuffer {
    fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as usize, height.max(1) as usize);
        Self {
            width: w,
            height: h,
            color: vec![0xFF00_0000; w * h],
            depth: vec![0.0; w * h],
        }
    }
}

struct SoftTexture {
    levels: Vec<Bitmap>,
    managed: bool,
    bytes: usize,
}

struct SoftVb {
    usage: BufferUsage,
    capacity: usize,
    /// CPU staging written by normal locks, uploaded on unlock.
    staging: Vec<u32>,
    /// Two allocations so a discard lock never hands back the memory the
    /// previous draw read from.
    slots: [Vec<u32>; 2],
    live: usize,
    pending_upload: bool,
}

impl SoftVb {
    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.slots[self.live])
    }
}

#[derive(Debug, Clone, Copy)]
struct FixedState {
    face_culling: bool,
    fog: bool,
    fog_col: Vec4,
    fog_density: f32,
    fog_end: f32,
    fog_mode: FogFunc,
    alpha_test: bool,
    alpha_blending: bool,
    alpha_arg_blend: bool,
    depth_test: bool,
    depth_write: bool,
    write_mask: ColorMask,
    mipmaps: bool,
}

impl Default for FixedState {
    fn default() -> Self {
        Self {
            face_culling: false,
            fog: false,
            fog_col: Vec4::new(0.0, 0.0, 0.0, 1.0),
            fog_density: 1.0,
            fog_end: 1.0,
            fog_mode: FogFunc::Linear,
            alpha_test: false,
            alpha_blending: false,
            alpha_arg_blend: false,
            depth_test: true,
            depth_write: true,
            write_mask: ColorMask::all(),
            mipmaps: false,
        }
    }
}

impl FixedState {
    fn fog_factor(&self, depth: f32) -> f32 {
        let f = match self.fog_mode {
            FogFunc::Linear => {
                if self.fog_end <= 0.0 {
                    0.0
                } else {
                    (self.fog_end - depth) / self.fog_end
                }
            }
            FogFunc::Exp => (-self.fog_density * depth).exp(),
            FogFunc::Exp2 => {
                let d = self.fog_density * depth;
                (-(d * d)).exp()
            }
        };
        f.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct ClipVertex {
    pos: Vec4,
    col: Vec4,
    uv: Vec2,
    eye_depth: f32,
}

impl ClipVertex {
    fn lerp(a: &Self, b: &Self, t: f32) -> Self {
        Self {
            pos: a.pos.lerp(b.pos, t),
            col: a.col.lerp(b.col, t),
            uv: a.uv.lerp(b.uv, t),
            eye_depth: a.eye_depth + (b.eye_depth - a.eye_depth) * t,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ScreenVertex {
    x: f32,
    y: f32,
    z: f32,
    inv_w: f32,
    /// Attributes pre-divided by w for perspective-correct interpolation.
    col: Vec4,
    uv: Vec2,
    eye_depth: f32,
}

pub struct SoftwareBackend {
    presenter: Option<Presenter>,
    fb: Option<Framebuffer>,
    vsync: bool,
    handles: HandleAlloc,
    vram_budget: Option<usize>,
    vram_used: usize,
    textures: FxHashMap<GfxResourceId, SoftTexture>,
    vbs: FxHashMap<GfxResourceId, SoftVb>,
    ibs: FxHashMap<GfxResourceId, Vec<u16>>,
    bound_tex: GfxResourceId,
    bound_vb: GfxResourceId,
    bound_ib: GfxResourceId,
    format: VertexFormat,
    fixed: FixedState,
    view: Mat4,
    projection: Mat4,
    tex_offset: Option<(f32, f32)>,
}

impl SoftwareBackend {
    /// Renders into memory only. Used by tests and offscreen tools.
    pub fn headless(vram_budget: Option<usize>) -> Self {
        Self {
            presenter: None,
            fb: None,
            vsync: false,
            handles: HandleAlloc::default(),
            vram_budget,
            vram_used: 0,
            textures: FxHashMap::default(),
            vbs: FxHashMap::default(),
            ibs: FxHashMap::default(),
            bound_tex: GfxResourceId::NULL,
            bound_vb: GfxResourceId::NULL,
            bound_ib: GfxResourceId::NULL,
            format: VertexFormat::Coloured,
            fixed: FixedState::default(),
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            tex_offset: None,
        }
    }

    pub fn with_window(
        window: Arc<Window>,
        vram_budget: Option<usize>,
    ) -> Result<Self, Box<dyn Error>> {
        info!("Initializing software renderer backend (softbuffer)...");
        let context = softbuffer::Context::new(window.clone())?;
        let surface = softbuffer::Surface::new(&context, window.clone())?;
        let mut backend = Self::headless(vram_budget);
        backend.presenter = Some(Presenter {
            window,
            _context: context,
            surface,
        });
        Ok(backend)
    }

    pub fn has_texture(&self, tex: GfxResourceId) -> bool {
        self.textures.contains_key(&tex)
    }

    pub const fn vram_used(&self) -> usize {
        self.vram_used
    }

    fn charge(&mut self, bytes: usize) -> NativeResult<()> {
        if let Some(budget) = self.vram_budget
            && self.vram_used + bytes > budget
        {
            debug!(
                "Software allocation of {bytes} bytes exceeds budget ({} of {budget} used)",
                self.vram_used
            );
            return Err(NativeError::OutOfVideoMemory);
        }
        self.vram_used += bytes;
        Ok(())
    }

    fn refund(&mut self, bytes: usize) {
        self.vram_used = self.vram_used.saturating_sub(bytes);
    }

    fn reset_device_state(&mut self, params: &PresentParams) {
        self.fb = Some(Framebuffer::new(params.width, params.height));
        self.vsync = params.vsync;
        self.bound_tex = GfxResourceId::NULL;
        self.bound_vb = GfxResourceId::NULL;
        self.bound_ib = GfxResourceId::NULL;
        self.fixed = FixedState::default();
        self.view = Mat4::IDENTITY;
        self.projection = Mat4::IDENTITY;
        self.tex_offset = None;
    }

    fn transform(&self, bytes: &[u8], start: usize, count: usize) -> Option<Vec<ClipVertex>> {
        let stride = self.format.stride();
        let range = bytes.get(start * stride..(start + count) * stride)?;
        let mvp = view_proj(&self.view, &self.projection);
        let offset = self.tex_offset.map_or(Vec2::ZERO, |(x, y)| Vec2::new(x, y));

        let build = |p: Vec3, col: PackedCol, uv: Vec2| {
            let eye = self.view * p.extend(1.0);
            ClipVertex {
                pos: mvp * p.extend(1.0),
                col: Vec4::from_array(col.to_f32()),
                uv,
                eye_depth: -eye.z,
            }
        };

        let out = match self.format {
            VertexFormat::Coloured => bytemuck::try_cast_slice::<u8, VertexColoured>(range)
                .ok()?
                .iter()
                .map(|v| build(Vec3::new(v.x, v.y, v.z), v.col, Vec2::ZERO))
                .collect(),
            VertexFormat::Textured => bytemuck::try_cast_slice::<u8, VertexTextured>(range)
                .ok()?
                .iter()
                .map(|v| build(Vec3::new(v.x, v.y, v.z), v.col, Vec2::new(v.u, v.v) + offset))
                .collect(),
        };
        Some(out)
    }
}

impl Backend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software"
    }

    fn caps(&self) -> BackendCaps {
        BackendCaps {
            managed_textures: true,
            strict_pow2: true,
            custom_mipmap_levels: true,
            half_pixel_offset: true,
            depth_bits: 32,
            max_texture_size: MAX_TEXTURE_SIZE,
        }
    }

    fn create_device(&mut self, params: &PresentParams) -> NativeResult<()> {
        self.reset_device_state(params);
        Ok(())
    }

    fn restore_device(&mut self, params: &PresentParams) -> NativeResult<bool> {
        let unmanaged = self.textures.values().filter(|t| !t.managed).count()
            + self.vbs.len()
            + self.ibs.len();
        if unmanaged > 0 {
            warn!("{unmanaged} unmanaged resources were still alive at reset; dropping them.");
        }
        self.textures.retain(|_, t| t.managed);
        self.vbs.clear();
        self.ibs.clear();
        self.vram_used = self.textures.values().map(|t| t.bytes).sum();

        self.reset_device_state(params);
        Ok(true)
    }

    fn reset_swapchain(&mut self, params: &PresentParams) -> NativeResult<()> {
        self.fb = Some(Framebuffer::new(params.width, params.height));
        self.vsync = params.vsync;
        Ok(())
    }

    fn release_device(&mut self) {
        self.textures.clear();
        self.vbs.clear();
        self.ibs.clear();
        self.vram_used = 0;
        self.fb = None;
        info!("Software renderer backend cleanup complete.");
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> NativeResult<GfxResourceId> {
        if desc.width > MAX_TEXTURE_SIZE || desc.height > MAX_TEXTURE_SIZE {
            return Err(NativeError::Fault(E_INVALIDARG));
        }
        let levels: Vec<Bitmap> = (0..desc.levels)
            .map(|lvl| Bitmap::new((desc.width >> lvl).max(1), (desc.height >> lvl).max(1)))
            .collect();
        let bytes = levels.iter().map(|b| b.pixels.len() * 4).sum();
        self.charge(bytes)?;

        let id = self.handles.next();
        self.textures.insert(
            id,
            SoftTexture {
                levels,
                managed: desc.managed,
                bytes,
            },
        );
        Ok(id)
    }

    fn write_texture(
        &mut self,
        tex: GfxResourceId,
        level: u32,
        rect: &TexelRect<'_>,
    ) -> NativeResult<()> {
        let Some(texture) = self.textures.get_mut(&tex) else {
            debug!("Ignoring upload to unknown texture {}", tex.raw());
            return Ok(());
        };
        let Some(dst) = texture.levels.get_mut(level as usize) else {
            return Err(NativeError::Fault(E_INVALIDARG));
        };
        if rect.x + rect.width > dst.width || rect.y + rect.height > dst.height {
            return Err(NativeError::Fault(E_INVALIDARG));
        }
        copy_texture_data(&mut dst.pixels, dst.width, rect);
        Ok(())
    }

    fn bind_texture(&mut self, tex: GfxResourceId) {
        self.bound_tex = tex;
    }

    fn delete_texture(&mut self, tex: GfxResourceId) -> u32 {
        if let Some(t) = self.textures.remove(&tex) {
            self.refund(t.bytes);
        }
        if self.bound_tex == tex {
            self.bound_tex = GfxResourceId::NULL;
        }
        0
    }

    fn set_mipmap_filter(&mut self, enabled: bool) {
        self.fixed.mipmaps = enabled;
    }

    fn create_ib(&mut self, indices: &[u16]) -> NativeResult<GfxResourceId> {
        self.charge(indices.len() * 2)?;
        let id = self.handles.next();
        self.ibs.insert(id, indices.to_vec());
        Ok(id)
    }

    fn bind_ib(&mut self, ib: GfxResourceId) {
        self.bound_ib = ib;
    }

    fn delete_ib(&mut self, ib: GfxResourceId) -> u32 {
        if let Some(indices) = self.ibs.remove(&ib) {
            self.refund(indices.len() * 2);
        }
        0
    }

    fn create_vb(
        &mut self,
        fmt: VertexFormat,
        count: usize,
        usage: BufferUsage,
    ) -> NativeResult<GfxResourceId> {
        let capacity = fmt.stride() * count;
        self.charge(capacity)?;
        let id = self.handles.next();
        self.vbs.insert(
            id,
            SoftVb {
                usage,
                capacity,
                staging: Vec::new(),
                slots: [Vec::new(), Vec::new()],
                live: 0,
                pending_upload: false,
            },
        );
        Ok(id)
    }

    fn lock_vb(
        &mut self,
        vb: GfxResourceId,
        len: usize,
        mode: LockMode,
    ) -> NativeResult<Option<&mut [u8]>> {
        let Some(buffer) = self.vbs.get_mut(&vb) else {
            return Ok(None);
        };
        if len > buffer.capacity {
            return Err(NativeError::Fault(E_INVALIDARG));
        }
        let words = len.div_ceil(4);
        let target = match mode {
            LockMode::Discard => {
                buffer.live = 1 - buffer.live;
                buffer.pending_upload = false;
                &mut buffer.slots[buffer.live]
            }
            LockMode::Normal => {
                buffer.pending_upload = true;
                &mut buffer.staging
            }
        };
        target.clear();
        target.resize(words, 0);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(target.as_mut_slice());
        Ok(Some(&mut bytes[..len]))
    }

    fn unlock_vb(&mut self, vb: GfxResourceId) -> NativeResult<()> {
        let Some(buffer) = self.vbs.get_mut(&vb) else {
            return Ok(());
        };
        if buffer.pending_upload {
            buffer.pending_upload = false;
            let live = buffer.live;
            buffer.slots[live].clone_from(&buffer.staging);
        }
        if buffer.usage == BufferUsage::Static {
            buffer.staging = Vec::new();
        }
        Ok(())
    }

    fn bind_vb(&mut self, vb: GfxResourceId) {
        self.bound_vb = vb;
    }

    fn delete_vb(&mut self, vb: GfxResourceId) -> u32 {
        if let Some(buffer) = self.vbs.remove(&vb) {
            self.refund(buffer.capacity);
        }
        if self.bound_vb == vb {
            self.bound_vb = GfxResourceId::NULL;
        }
        0
    }

    fn set_vertex_format(&mut self, fmt: VertexFormat) {
        self.format = fmt;
    }

    fn apply_state(&mut self, change: StateChange) {
        let f = &mut self.fixed;
        match change {
            StateChange::FaceCulling(v) => f.face_culling = v,
            StateChange::Fog(v) => f.fog = v,
            StateChange::FogCol(c) => f.fog_col = Vec4::from_array(c.to_f32()),
            StateChange::FogDensity(v) => f.fog_density = v,
            StateChange::FogEnd(v) => f.fog_end = v,
            StateChange::FogMode(m) => f.fog_mode = m,
            StateChange::AlphaTest(v) => f.alpha_test = v,
            StateChange::AlphaBlending(v) => f.alpha_blending = v,
            StateChange::AlphaArgBlend(v) => f.alpha_arg_blend = v,
            StateChange::DepthTest(v) => f.depth_test = v,
            StateChange::DepthWrite(v) => f.depth_write = v,
            StateChange::ColWriteMask(m) => f.write_mask = m,
        }
    }

    fn set_transform(&mut self, slot: MatrixType, matrix: &Mat4) {
        match slot {
            MatrixType::View => self.view = *matrix,
            MatrixType::Projection => self.projection = *matrix,
        }
    }

    fn set_texture_offset(&mut self, offset: Option<(f32, f32)>) {
        self.tex_offset = offset;
    }

    fn begin_scene(&mut self) -> NativeResult<()> {
        if self.fb.is_none() {
            return Err(NativeError::DeviceLost);
        }
        Ok(())
    }

    fn clear(&mut self, col: PackedCol) -> NativeResult<()> {
        let Some(fb) = self.fb.as_mut() else {
            return Err(NativeError::DeviceLost);
        };
        fb.color.fill(col.0);
        fb.depth.fill(0.0);
        Ok(())
    }

    fn draw(&mut self, call: DrawCall) {
        let Some(vb) = self.vbs.get(&self.bound_vb) else {
            return;
        };
        let (start, count) = match call {
            DrawCall::Lines { vertex_count } => (0, vertex_count as usize),
            DrawCall::IndexedTris {
                vertex_count,
                start_vertex,
                ..
            } => (start_vertex as usize, vertex_count as usize),
        };
        let Some(verts) = self.transform(vb.bytes(), start, count) else {
            debug!("Draw of {count} vertices overruns the bound vertex buffer");
            return;
        };

        let textured = self.format == VertexFormat::Textured;
        let tex = if textured {
            self.textures.get(&self.bound_tex)
        } else {
            None
        };
        let Some(fb) = self.fb.as_mut() else {
            return;
        };
        let mut raster = Raster {
            fb,
            st: &self.fixed,
            tex,
        };

        match call {
            DrawCall::Lines { .. } => {
                for pair in verts.chunks_exact(2) {
                    raster.line(&pair[0], &pair[1]);
                }
            }
            DrawCall::IndexedTris { index_count, .. } => {
                let Some(indices) = self.ibs.get(&self.bound_ib) else {
                    return;
                };
                let index_count = (index_count as usize).min(indices.len());
                for tri in indices[..index_count].chunks_exact(3) {
                    let fetch = |i: u16| verts.get(i as usize).copied();
                    let (Some(a), Some(b), Some(c)) = (fetch(tri[0]), fetch(tri[1]), fetch(tri[2]))
                    else {
                        continue;
                    };
                    raster.triangle([a, b, c]);
                }
            }
        }
    }

    fn end_scene_and_present(&mut self) -> NativeResult<PresentStatus> {
        let Some(fb) = self.fb.as_ref() else {
            return Err(NativeError::DeviceLost);
        };
        let Some(p) = self.presenter.as_mut() else {
            return Ok(PresentStatus::Presented);
        };
        if p.window.is_minimized() == Some(true) {
            return Ok(PresentStatus::Occluded);
        }
        let (Some(w), Some(h)) = (
            NonZeroU32::new(fb.width as u32),
            NonZeroU32::new(fb.height as u32),
        ) else {
            return Ok(PresentStatus::Occluded);
        };

        match blit(p, fb, w, h) {
            Ok(()) => Ok(PresentStatus::Presented),
            Err(e) => {
                warn!("softbuffer present failed: {e}");
                Err(NativeError::DeviceLost)
            }
        }
    }

    fn capture_frame(&mut self) -> NativeResult<RgbaImage> {
        let Some(fb) = self.fb.as_ref() else {
            return Err(NativeError::DeviceLost);
        };
        rgba_image(fb.width as u32, fb.height as u32, &fb.color)
            .ok_or(NativeError::Fault(E_INVALIDARG))
    }

    fn api_info(&self) -> Vec<String> {
        let mut lines = vec!["Adapter: CPU rasterizer".to_string()];
        if let Some(fb) = &self.fb {
            lines.push(format!("Framebuffer: {}x{}", fb.width, fb.height));
        }
        lines.push(format!("Presenting to window: {}", self.presenter.is_some()));
        lines.push(format!("VSync requested: {}", self.vsync));
        lines.push(match self.vram_budget {
            Some(budget) => format!(
                "Video memory: {:.2} of {:.2} MB",
                self.vram_used as f64 / (1024.0 * 1024.0),
                budget as f64 / (1024.0 * 1024.0)
            ),
            None => format!(
                "Video memory: {:.2} MB (unlimited)",
                self.vram_used as f64 / (1024.0 * 1024.0)
            ),
        });
        lines
    }

    fn warning(&self) -> Option<String> {
        Some("Software rendering is in use; expect low frame rates.".to_string())
    }
}

fn blit(
    p: &mut Presenter,
    fb: &Framebuffer,
    width: NonZeroU32,
    height: NonZeroU32,
) -> Result<(), softbuffer::SoftBufferError> {
    p.surface.resize(width, height)?;
    let mut buffer = p.surface.buffer_mut()?;
    // softbuffer wants 0RGB; the top byte must stay clear.
    for (dst, src) in buffer.iter_mut().zip(&fb.color) {
        *dst = src & 0x00FF_FFFF;
    }
    buffer.present()
}

struct Raster<'a> {
    fb: &'a mut Framebuffer,
    st: &'a FixedState,
    tex: Option<&'a SoftTexture>,
}

impl Raster<'_> {
    /// Sutherland-Hodgman against the near (`z <= w`) and far (`z >= 0`)
    /// planes, plus a guard against `w` reaching zero.
    fn clip(poly: Vec<ClipVertex>) -> Vec<ClipVertex> {
        let planes: [fn(&Vec4) -> f32; 3] = [
            |p| p.w - p.z,
            |p| p.z,
            |p| p.w - W_EPSILON,
        ];
        let mut poly = poly;
        for plane in planes {
            if poly.is_empty() {
                break;
            }
            let mut out = Vec::with_capacity(poly.len() + 2);
            for i in 0..poly.len() {
                let a = &poly[i];
                let b = &poly[(i + 1) % poly.len()];
                let (da, db) = (plane(&a.pos), plane(&b.pos));
                if da >= 0.0 {
                    out.push(*a);
                }
                if (da >= 0.0) != (db >= 0.0) {
                    out.push(ClipVertex::lerp(a, b, da / (da - db)));
                }
            }
            poly = out;
        }
        poly
    }

    fn to_screen(&self, v: &ClipVertex) -> ScreenVertex {
        let inv_w = 1.0 / v.pos.w;
        let ndc = v.pos.xyz() * inv_w;
        ScreenVertex {
            x: (ndc.x + 1.0) * 0.5 * self.fb.width as f32,
            y: (1.0 - ndc.y) * 0.5 * self.fb.height as f32,
            z: ndc.z,
            inv_w,
            col: v.col * inv_w,
            uv: v.uv * inv_w,
            eye_depth: v.eye_depth * inv_w,
        }
    }

    fn triangle(&mut self, tri: [ClipVertex; 3]) {
        let poly = Self::clip(tri.to_vec());
        if poly.len() < 3 {
            return;
        }
        let screen: Vec<ScreenVertex> = poly.iter().map(|v| self.to_screen(v)).collect();
        for i in 1..screen.len() - 1 {
            self.raster_triangle(&screen[0], &screen[i], &screen[i + 1]);
        }
    }

    fn mip_level(&self, v0: &ScreenVertex, v1: &ScreenVertex, v2: &ScreenVertex, area: f32) -> usize {
        let Some(tex) = self.tex else {
            return 0;
        };
        if !self.st.mipmaps || tex.levels.len() < 2 {
            return 0;
        }
        let uv = |v: &ScreenVertex| v.uv / v.inv_w;
        let (t0, t1, t2) = (uv(v0), uv(v1), uv(v2));
        let base = &tex.levels[0];
        let uv_area = ((t1 - t0).perp_dot(t2 - t0)).abs()
            * base.width as f32
            * base.height as f32;
        let screen_area = area.abs().max(f32::EPSILON);
        let lod = 0.5 * (uv_area / screen_area).max(1.0).log2();
        (lod.round() as usize).min(tex.levels.len() - 1)
    }

    fn raster_triangle(&mut self, v0: &ScreenVertex, v1: &ScreenVertex, v2: &ScreenVertex) {
        let area = edge_function(v0.x, v0.y, v1.x, v1.y, v2.x, v2.y);
        if area == 0.0 {
            return;
        }
        // Screen y points down, so clockwise in NDC shows up as negative area.
        if self.st.face_culling && area < 0.0 {
            return;
        }

        let (width, height) = (self.fb.width, self.fb.height);
        let min_x = v0.x.min(v1.x).min(v2.x).floor().max(0.0) as i32;
        let max_x = v0.x.max(v1.x).max(v2.x).ceil().min((width - 1) as f32) as i32;
        let min_y = v0.y.min(v1.y).min(v2.y).floor().max(0.0) as i32;
        let max_y = v0.y.max(v1.y).max(v2.y).ceil().min((height - 1) as f32) as i32;
        if min_x > max_x || min_y > max_y {
            return;
        }

        let lod = self.mip_level(v0, v1, v2, area);
        let inv_area = 1.0 / area;
        for y in min_y..=max_y {
            let py = y as f32;
            for x in min_x..=max_x {
                let px = x as f32;
                let w0 = edge_function(v1.x, v1.y, v2.x, v2.y, px, py) * inv_area;
                let w1 = edge_function(v2.x, v2.y, v0.x, v0.y, px, py) * inv_area;
                let w2 = 1.0 - w0 - w1;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }

                let z = v0.z.mul_add(w0, v1.z * w1) + v2.z * w2;
                let one_over_w = v0.inv_w.mul_add(w0, v1.inv_w * w1) + v2.inv_w * w2;
                let w = 1.0 / one_over_w;
                let col = (v0.col * w0 + v1.col * w1 + v2.col * w2) * w;
                let uv = (v0.uv * w0 + v1.uv * w1 + v2.uv * w2) * w;
                let eye_depth = v0.eye_depth.mul_add(w0, v1.eye_depth * w1) + v2.eye_depth * w2;
                self.shade(x as usize, y as usize, z, col, uv, eye_depth * w, lod);
            }
        }
    }

    fn line(&mut self, a: &ClipVertex, b: &ClipVertex) {
        let (mut a, mut b) = (*a, *b);
        let planes: [fn(&Vec4) -> f32; 3] = [
            |p| p.w - p.z,
            |p| p.z,
            |p| p.w - W_EPSILON,
        ];
        for plane in planes {
            let (da, db) = (plane(&a.pos), plane(&b.pos));
            if da < 0.0 && db < 0.0 {
                return;
            }
            if da < 0.0 {
                a = ClipVertex::lerp(&a, &b, da / (da - db));
            } else if db < 0.0 {
                b = ClipVertex::lerp(&b, &a, db / (db - da));
            }
        }

        let (sa, sb) = (self.to_screen(&a), self.to_screen(&b));
        let steps = (sb.x - sa.x).abs().max((sb.y - sa.y).abs()).ceil().max(1.0) as usize;
        for i in 0..=steps {
            let t = i as f32 / steps as f32;
            let x = (sa.x + (sb.x - sa.x) * t).round();
            let y = (sa.y + (sb.y - sa.y) * t).round();
            if x < 0.0 || y < 0.0 || x >= self.fb.width as f32 || y >= self.fb.height as f32 {
                continue;
            }
            let one_over_w = sa.inv_w + (sb.inv_w - sa.inv_w) * t;
            let w = 1.0 / one_over_w;
            let z = sa.z + (sb.z - sa.z) * t;
            let col = sa.col.lerp(sb.col, t) * w;
            let eye_depth = (sa.eye_depth + (sb.eye_depth - sa.eye_depth) * t) * w;
            self.shade(x as usize, y as usize, z, col, Vec2::ZERO, eye_depth, 0);
        }
    }

    fn sample(&self, uv: Vec2, lod: usize) -> Option<Vec4> {
        let tex = self.tex?;
        let level = tex.levels.get(lod)?;
        let w = level.width as i32;
        let h = level.height as i32;
        let tx = ((uv.x * w as f32).floor() as i32).rem_euclid(w);
        let ty = ((uv.y * h as f32).floor() as i32).rem_euclid(h);
        let c = level.get(tx as u32, ty as u32);
        Some(Vec4::new(
            f32::from(col_r(c)),
            f32::from(col_g(c)),
            f32::from(col_b(c)),
            f32::from(col_a(c)),
        ) / 255.0)
    }

    #[allow(clippy::too_many_arguments)]
    fn shade(&mut self, x: usize, y: usize, z: f32, col: Vec4, uv: Vec2, eye_depth: f32, lod: usize) {
        let st = self.st;
        let idx = y * self.fb.width + x;
        if st.depth_test && z < self.fb.depth[idx] {
            return;
        }

        let mut src = col;
        if let Some(t) = self.sample(uv, lod) {
            let alpha = if st.alpha_arg_blend { col.w * t.w } else { t.w };
            src = (col.xyz() * t.xyz()).extend(alpha);
        }
        if st.alpha_test && src.w <= ALPHA_REF {
            return;
        }
        if st.fog {
            let f = st.fog_factor(eye_depth);
            src = st.fog_col.xyz().lerp(src.xyz(), f).extend(src.w);
        }

        let dst = unpack(self.fb.color[idx]);
        let mut out = if st.alpha_blending {
            let a = src.w.clamp(0.0, 1.0);
            src * a + dst * (1.0 - a)
        } else {
            src
        };
        let mask = st.write_mask;
        if !mask.contains(ColorMask::R) {
            out.x = dst.x;
        }
        if !mask.contains(ColorMask::G) {
            out.y = dst.y;
        }
        if !mask.contains(ColorMask::B) {
            out.z = dst.z;
        }
        if !mask.contains(ColorMask::A) {
            out.w = dst.w;
        }

        self.fb.color[idx] = pack_rgba(out.to_array());
        if st.depth_test && st.depth_write {
            self.fb.depth[idx] = z;
        }
    }
}

#[inline(always)]
fn unpack(c: u32) -> Vec4 {
    Vec4::new(
        f32::from(col_r(c)),
        f32::from(col_g(c)),
        f32::from(col_b(c)),
        f32::from(col_a(c)),
    ) / 255.0
}

#[inline(always)]
fn pack_rgba(c: [f32; 4]) -> u32 {
    let q = |x: f32| x.clamp(0.0, 1.0).mul_add(255.0, 0.5) as u32;
    (q(c[3]) << 24) | (q(c[0]) << 16) | (q(c[1]) << 8) | q(c[2])
}

#[inline(always)]
fn edge_function(x0: f32, y0: f32, x1: f32, y1: f32, px: f32, py: f32) -> f32 {
    (px - x0).mul_add(y1 - y0, -((py - y0) * (x1 - x0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gfx::{
        Gfx, GfxOptions, Texture, TextureFlags, TextureRec,
        bitmap::bitmap_col,
    };

    const SIZE: u32 = 16;

    fn gfx() -> Gfx {
        let opts = GfxOptions {
            width: SIZE,
            height: SIZE,
            ..GfxOptions::default()
        };
        Gfx::create(Box::new(SoftwareBackend::headless(None)), opts)
    }

    fn snapshot(gfx: &mut Gfx) -> RgbaImage {
        let mut png = Vec::new();
        gfx.take_screenshot(&mut png).expect("software capture");
        image::load_from_memory(&png).expect("valid png").to_rgba8()
    }

    fn quad(z: f32, col: PackedCol, clockwise: bool) -> [VertexColoured; 4] {
        let v = |x: f32, y: f32| VertexColoured { x, y, z, col };
        if clockwise {
            [v(-1.0, -1.0), v(-1.0, 1.0), v(1.0, 1.0), v(1.0, -1.0)]
        } else {
            [v(-1.0, -1.0), v(1.0, -1.0), v(1.0, 1.0), v(-1.0, 1.0)]
        }
    }

    fn draw_world(gfx: &mut Gfx, verts: &[VertexColoured]) {
        let proj = gfx.calc_perspective_matrix(70.0_f32.to_radians(), 1.0, 64.0);
        gfx.load_matrix(MatrixType::Projection, &proj);
        gfx.load_identity_matrix(MatrixType::View);
        gfx.set_vertex_format(VertexFormat::Coloured);

        let mut vb = gfx.create_vb(VertexFormat::Coloured, verts.len());
        if let Some(dst) = gfx.lock_vb_as::<VertexColoured>(vb, verts.len(), LockMode::Normal) {
            dst.copy_from_slice(verts);
        }
        gfx.unlock_vb(vb);
        gfx.bind_vb(vb);
        gfx.draw_vb_indexed_tris(verts.len() as u32);
        gfx.delete_vb(&mut vb);
    }

    fn begin(gfx: &mut Gfx) {
        gfx.clear_col(PackedCol::BLACK);
        gfx.begin_frame();
        gfx.clear();
    }

    #[test]
    fn flat_rect_fills_its_area_only() {
        let mut gfx = gfx();
        begin(&mut gfx);
        gfx.begin_2d(SIZE, SIZE);
        gfx.draw_2d_flat(4, 4, 8, 8, PackedCol::new(255, 0, 0, 255));
        gfx.end_2d();
        gfx.end_frame();

        let img = snapshot(&mut gfx);
        assert_eq!(img.get_pixel(8, 8).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(1, 1).0, [0, 0, 0, 255]);
        assert_eq!(img.get_pixel(14, 14).0, [0, 0, 0, 255]);
    }

    #[test]
    fn reversed_depth_keeps_the_nearer_surface() {
        let mut gfx = gfx();
        begin(&mut gfx);
        let mut verts = Vec::new();
        verts.extend(quad(-2.0, PackedCol::new(0, 255, 0, 255), false));
        verts.extend(quad(-4.0, PackedCol::new(255, 0, 0, 255), false));
        draw_world(&mut gfx, &verts);
        gfx.end_frame();

        assert_eq!(snapshot(&mut gfx).get_pixel(8, 8).0, [0, 255, 0, 255]);
    }

    #[test]
    fn culling_drops_clockwise_faces() {
        let mut gfx = gfx();
        gfx.set_face_culling(true);
        begin(&mut gfx);
        draw_world(&mut gfx, &quad(-2.0, PackedCol::WHITE, true));
        assert_eq!(snapshot(&mut gfx).get_pixel(8, 8).0, [0, 0, 0, 255]);

        draw_world(&mut gfx, &quad(-2.0, PackedCol::WHITE, false));
        assert_eq!(snapshot(&mut gfx).get_pixel(8, 8).0, [255, 255, 255, 255]);
    }

    #[test]
    fn linear_fog_saturates_past_fog_end() {
        let mut gfx = gfx();
        gfx.set_fog(true);
        gfx.set_fog_mode(FogFunc::Linear);
        gfx.set_fog_end(1.0);
        gfx.set_fog_col(PackedCol::new(0, 0, 255, 255));
        begin(&mut gfx);
        draw_world(&mut gfx, &quad(-2.0, PackedCol::WHITE, false));
        assert_eq!(snapshot(&mut gfx).get_pixel(8, 8).0, [0, 0, 255, 255]);
    }

    #[test]
    fn alpha_test_discards_weak_texels() {
        let mut gfx = gfx();
        let mut faint = Bitmap::new(2, 2);
        faint.pixels.fill(bitmap_col(255, 255, 255, 100));
        let mut solid = Bitmap::new(2, 2);
        solid.pixels.fill(bitmap_col(255, 255, 255, 255));

        let faint_id = gfx.create_texture(&faint, TextureFlags::MANAGED, false);
        let solid_id = gfx.create_texture(&solid, TextureFlags::MANAGED, false);
        let rect = |id| Texture {
            id,
            x: 0,
            y: 0,
            width: SIZE as i32,
            height: SIZE as i32,
            uv: TextureRec::FULL,
        };

        begin(&mut gfx);
        gfx.begin_2d(SIZE, SIZE);
        gfx.set_alpha_test(true);
        gfx.texture_render(&rect(faint_id));
        assert_eq!(snapshot(&mut gfx).get_pixel(5, 5).0, [0, 0, 0, 255]);

        gfx.texture_render(&rect(solid_id));
        assert_eq!(snapshot(&mut gfx).get_pixel(5, 5).0, [255, 255, 255, 255]);
    }

    #[test]
    fn managed_textures_survive_a_reset() {
        let mut backend = SoftwareBackend::headless(None);
        let params = PresentParams {
            width: 8,
            height: 8,
            vsync: false,
        };
        backend.create_device(&params).expect("device");
        let desc = TextureDesc {
            width: 4,
            height: 4,
            levels: 1,
            managed: true,
            dynamic: false,
        };
        let managed = backend.create_texture(&desc).expect("managed");
        let plain = backend
            .create_texture(&TextureDesc {
                managed: false,
                ..desc
            })
            .expect("plain");

        assert_eq!(backend.restore_device(&params), Ok(true));
        assert!(backend.has_texture(managed));
        assert!(!backend.has_texture(plain));
        assert_eq!(backend.vram_used(), 4 * 4 * 4);
    }

    #[test]
    fn budget_exhaustion_loses_the_context() {
        let opts = GfxOptions {
            width: SIZE,
            height: SIZE,
            ..GfxOptions::default()
        };
        let backend = SoftwareBackend::headless(Some(256 * 1024));
        let mut gfx = Gfx::create(Box::new(backend), opts);
        assert!(!gfx.is_lost(), "default resources fit the budget");

        let big = Bitmap::new(256, 256);
        let tex = gfx.create_texture(&big, TextureFlags::empty(), false);
        assert!(tex.is_null());
        assert!(gfx.is_lost());
        assert!(gfx.try_restore_context());
    }

    #[test]
    fn discard_lock_rotates_allocations() {
        let mut backend = SoftwareBackend::headless(None);
        let params = PresentParams {
            width: 8,
            height: 8,
            vsync: false,
        };
        backend.create_device(&params).expect("device");
        let vb = backend
            .create_vb(VertexFormat::Coloured, 4, BufferUsage::Dynamic)
            .expect("vb");

        let first = backend
            .lock_vb(vb, 64, LockMode::Discard)
            .expect("lock")
            .map(|b| b.as_ptr() as usize);
        backend.unlock_vb(vb).expect("unlock");
        let second = backend
            .lock_vb(vb, 64, LockMode::Discard)
            .expect("lock")
            .map(|b| b.as_ptr() as usize);
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn oversized_lock_is_a_fault() {
        let mut backend = SoftwareBackend::headless(None);
        let vb = backend
            .create_vb(VertexFormat::Coloured, 1, BufferUsage::Static)
            .expect("vb");
        assert!(matches!(
            backend.lock_vb(vb, 32, LockMode::Normal),
            Err(NativeError::Fault(_))
        ));
    }
}
