use crate::core::gfx::{
    DrawCall, GFX_MAX_INDICES, GfxResourceId, MatrixType, PackedCol, TextureFlags,
    VertexFormat, make_indices,
    backends::{Backend, BackendCaps, BufferUsage, LockMode, PresentParams, PresentStatus, TextureDesc},
    bitmap::{Bitmap, TexelRect, calc_mipmap_levels, gen_mipmap, is_pow2},
    device::{self, ContextEvent, DeviceLifecycle, DeviceState, ListenerRef, Listeners},
    error::{NativeError, NativeResult, fatal, fatal_msg},
    state::{ColorMask, RenderState, StateChange},
};
use crate::core::{gfx::FogFunc, space};
use bytemuck::Pod;
use glam::Mat4;
use image::{ExtendedColorType, ImageEncoder, codecs::png::PngEncoder};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::{
    error::Error,
    io::Write,
    thread,
    time::{Duration, Instant},
};

/// Settings the device layer needs from the application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GfxOptions {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Minimum frame time; `0.0` disables the frame cap.
    pub min_frame_ms: f32,
    pub mipmaps: bool,
    pub managed_textures: bool,
    pub gfx_debug: bool,
    /// Software backend allocation budget in bytes.
    pub vram_budget: Option<usize>,
}

impl Default for GfxOptions {
    fn default() -> Self {
        Self {
            width: 854,
            height: 480,
            vsync: true,
            min_frame_ms: 0.0,
            mipmaps: false,
            managed_textures: true,
            gfx_debug: false,
            vram_budget: None,
        }
    }
}

/// The graphics context: owns the backend, the cached render state, the
/// device lifecycle and the shared default buffers.
///
/// Every entry point is safe to call in any lifecycle state. While the
/// device is not usable, state setters only update the cache, draws are
/// dropped and creation returns `GfxResourceId::NULL`.
pub struct Gfx {
    backend: Box<dyn Backend>,
    caps: BackendCaps,
    lifecycle: DeviceLifecycle,
    state: RenderState,
    vertex_format: Option<VertexFormat>,
    textures: FxHashMap<GfxResourceId, TextureDesc>,
    /// Byte capacity of every live vertex buffer.
    vb_bytes: FxHashMap<GfxResourceId, usize>,
    listeners: Listeners,
    opts: GfxOptions,
    frame_start: Instant,
    pub(super) default_ib: GfxResourceId,
    pub(super) quad_vb: GfxResourceId,
    pub(super) tex_vb: GfxResourceId,
    pub(super) had_fog: bool,
}

impl Gfx {
    /// Creates the native device and synchronises it with the default state.
    ///
    /// A recoverable failure (device busy, out of memory) leaves the context
    /// lost; `try_restore_context` will create the device later. Anything
    /// else aborts.
    pub fn create(backend: Box<dyn Backend>, opts: GfxOptions) -> Self {
        let caps = backend.caps();
        let mut gfx = Self {
            backend,
            caps,
            lifecycle: DeviceLifecycle::default(),
            state: RenderState::default(),
            vertex_format: None,
            textures: FxHashMap::default(),
            vb_bytes: FxHashMap::default(),
            listeners: Listeners::default(),
            opts,
            frame_start: Instant::now(),
            default_ib: GfxResourceId::NULL,
            quad_vb: GfxResourceId::NULL,
            tex_vb: GfxResourceId::NULL,
            had_fog: false,
        };

        let params = gfx.present_params();
        match gfx.backend.create_device(&params) {
            Ok(()) => {
                gfx.lifecycle.mark_created();
                gfx.caps = gfx.backend.caps();
                info!(
                    "{} graphics device created ({}x{}, vsync {}).",
                    gfx.backend.name(),
                    params.width,
                    params.height,
                    if params.vsync { "on" } else { "off" }
                );
                gfx.restore_state();
            }
            Err(e) if e.is_recoverable() => {
                warn!("Graphics device unavailable at startup: {e}");
                gfx.lifecycle.mark_lost();
            }
            Err(e) => fatal(e, "Creating graphics device"),
        }
        gfx
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub const fn device_state(&self) -> DeviceState {
        self.lifecycle.state()
    }

    pub fn is_lost(&self) -> bool {
        self.lifecycle.state() == DeviceState::Lost
    }

    #[inline(always)]
    fn usable(&self) -> bool {
        self.lifecycle.state().is_usable()
    }

    pub const fn render_state(&self) -> &RenderState {
        &self.state
    }

    pub const fn caps(&self) -> BackendCaps {
        self.caps
    }

    pub const fn max_texture_size(&self) -> u32 {
        self.caps.max_texture_size
    }

    pub const fn depth_bits(&self) -> u32 {
        self.caps.depth_bits
    }

    pub const fn default_ib(&self) -> GfxResourceId {
        self.default_ib
    }

    pub const fn options(&self) -> &GfxOptions {
        &self.opts
    }

    const fn present_params(&self) -> PresentParams {
        PresentParams {
            width: self.opts.width,
            height: self.opts.height,
            vsync: self.opts.vsync,
        }
    }

    // --- Events & lifecycle ---

    pub fn register_listener(&mut self, listener: &ListenerRef) {
        self.listeners.register(listener);
    }

    pub fn unregister_listener(&mut self, listener: &ListenerRef) {
        self.listeners.unregister(listener);
    }

    fn raise(&mut self, event: ContextEvent) {
        let listeners = self.listeners.snapshot();
        device::dispatch(self, listeners, event);
    }

    /// Drops into the lost state. Does nothing if already lost.
    pub fn lose_context(&mut self, reason: &str) {
        if !self.lifecycle.mark_lost() {
            return;
        }
        warn!("Lost graphics context{reason}");
        self.free_state();
        self.raise(ContextEvent::Lost);
    }

    /// One recovery attempt, meant to be called every frame while lost.
    /// Returns true once the device is usable.
    pub fn try_restore_context(&mut self) -> bool {
        match self.lifecycle.state() {
            DeviceState::Created | DeviceState::Restored => return true,
            DeviceState::Uninitialized | DeviceState::Freed => return false,
            DeviceState::Lost => {}
        }

        let params = self.present_params();
        match self.backend.restore_device(&params) {
            Ok(true) => self.recreate_context(),
            Ok(false) => false,
            Err(e) if e.is_recoverable() => {
                debug!("Graphics device still unavailable: {e}");
                false
            }
            Err(e) => fatal(e, "Restoring graphics device"),
        }
    }

    fn recreate_context(&mut self) -> bool {
        self.lifecycle.mark_restored();
        self.caps = self.backend.caps();
        // Only driver-managed textures outlive a reset.
        self.textures.retain(|_, desc| desc.managed);
        self.vb_bytes.clear();
        info!("Recreated graphics context.");
        self.restore_state();
        if !self.usable() {
            // Lost again while re-creating the default resources.
            return false;
        }
        self.raise(ContextEvent::Recreated);
        self.usable()
    }

    /// Shuts the device down. The context stays valid but inert.
    pub fn free(&mut self) {
        if self.lifecycle.state() == DeviceState::Freed {
            return;
        }
        self.free_state();
        self.backend.release_device();
        self.textures.clear();
        self.vb_bytes.clear();
        self.lifecycle.mark_freed();
        info!("{} graphics device freed.", self.backend.name());
    }

    /// Re-applies every cached value to a fresh device, bypassing the
    /// unchanged-value shortcut, then rebuilds the default resources.
    fn restore_state(&mut self) {
        for change in self.state.changes() {
            self.backend.apply_state(change);
        }
        self.backend.set_transform(MatrixType::View, &self.state.view);
        self.backend.set_transform(MatrixType::Projection, &self.state.projection);
        self.backend.set_texture_offset(self.state.tex_offset);
        if let Some(fmt) = self.vertex_format {
            self.backend.set_vertex_format(fmt);
        }
        self.init_default_resources();
    }

    fn free_state(&mut self) {
        let mut ib = self.default_ib;
        let mut quad = self.quad_vb;
        let mut tex = self.tex_vb;
        self.delete_ib(&mut ib);
        self.delete_vb(&mut quad);
        self.delete_vb(&mut tex);
        self.default_ib = ib;
        self.quad_vb = quad;
        self.tex_vb = tex;
    }

    fn init_default_resources(&mut self) {
        let indices = make_indices(GFX_MAX_INDICES);
        self.default_ib = self.create_ib(&indices);
        self.bind_ib(self.default_ib);
        self.quad_vb = self.create_dynamic_vb(VertexFormat::Coloured, 4);
        self.tex_vb = self.create_dynamic_vb(VertexFormat::Textured, 4);
    }

    /// Routes a native result: exhaustion and device loss become a context
    /// loss, anything else aborts.
    fn check<T>(&mut self, res: NativeResult<T>, what: &str) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(e) if e.is_exhaustion() => {
                warn!("{what} failed: {e}");
                self.raise(ContextEvent::LowVramDetected);
                self.lose_context(" (out of memory)");
                None
            }
            Err(e @ (NativeError::DeviceLost | NativeError::DeviceNotReset)) => {
                warn!("{what} failed: {e}");
                self.lose_context(" (device lost)");
                None
            }
            Err(e) => fatal(e, what),
        }
    }

    // --- Render state ---

    /// Cache first, device second: the cached value must stay authoritative
    /// even while the device cannot be touched.
    fn set_state(&mut self, change: StateChange) {
        if !self.state.update(change) || !self.usable() {
            return;
        }
        self.backend.apply_state(change);
    }

    pub fn set_face_culling(&mut self, enabled: bool) {
        self.set_state(StateChange::FaceCulling(enabled));
    }

    pub fn set_fog(&mut self, enabled: bool) {
        self.set_state(StateChange::Fog(enabled));
    }

    pub const fn get_fog(&self) -> bool {
        self.state.fog
    }

    pub fn set_fog_col(&mut self, col: PackedCol) {
        self.set_state(StateChange::FogCol(col));
    }

    pub fn set_fog_density(&mut self, density: f32) {
        self.set_state(StateChange::FogDensity(density));
    }

    pub fn set_fog_end(&mut self, end: f32) {
        self.set_state(StateChange::FogEnd(end));
    }

    pub fn set_fog_mode(&mut self, func: FogFunc) {
        self.set_state(StateChange::FogMode(func));
    }

    pub fn set_alpha_test(&mut self, enabled: bool) {
        self.set_state(StateChange::AlphaTest(enabled));
    }

    pub fn set_alpha_blending(&mut self, enabled: bool) {
        self.set_state(StateChange::AlphaBlending(enabled));
    }

    /// Whether vertex alpha multiplies texture alpha.
    pub fn set_alpha_arg_blend(&mut self, enabled: bool) {
        self.set_state(StateChange::AlphaArgBlend(enabled));
    }

    pub fn set_depth_test(&mut self, enabled: bool) {
        self.set_state(StateChange::DepthTest(enabled));
    }

    pub fn set_depth_write(&mut self, enabled: bool) {
        self.set_state(StateChange::DepthWrite(enabled));
    }

    pub fn set_col_write_mask(&mut self, r: bool, g: bool, b: bool, a: bool) {
        self.set_state(StateChange::ColWriteMask(ColorMask::from_channels(r, g, b, a)));
    }

    /// Stored for the next `clear`; never touches the device.
    pub fn clear_col(&mut self, col: PackedCol) {
        self.state.clear_col = col;
    }

    // --- Matrices ---

    pub fn load_matrix(&mut self, slot: MatrixType, matrix: &Mat4) {
        let cached = match slot {
            MatrixType::View => &mut self.state.view,
            MatrixType::Projection => &mut self.state.projection,
        };
        if *cached == *matrix {
            return;
        }
        *cached = *matrix;
        if !self.usable() {
            return;
        }
        self.backend.set_transform(slot, matrix);
    }

    pub fn load_identity_matrix(&mut self, slot: MatrixType) {
        self.load_matrix(slot, &Mat4::IDENTITY);
    }

    /// Shifts texture coordinates of subsequent draws by `(x, y)`.
    pub fn enable_texture_offset(&mut self, x: f32, y: f32) {
        self.set_texture_offset(Some((x, y)));
    }

    pub fn disable_texture_offset(&mut self) {
        self.set_texture_offset(None);
    }

    fn set_texture_offset(&mut self, offset: Option<(f32, f32)>) {
        if self.state.tex_offset == offset {
            return;
        }
        self.state.tex_offset = offset;
        if !self.usable() {
            return;
        }
        self.backend.set_texture_offset(offset);
    }

    pub fn calc_ortho_matrix(&self, width: f32, height: f32) -> Mat4 {
        space::calc_ortho_matrix(width, height)
    }

    pub fn calc_perspective_matrix(&self, fov: f32, aspect: f32, z_far: f32) -> Mat4 {
        space::calc_perspective_matrix(fov, aspect, z_far, self.caps.depth_bits)
    }

    // --- Textures ---

    pub fn create_texture(
        &mut self,
        bmp: &Bitmap,
        flags: TextureFlags,
        mipmaps: bool,
    ) -> GfxResourceId {
        if !is_pow2(bmp.width) || !is_pow2(bmp.height) {
            let msg = format!(
                "Textures must have power of two dimensions (got {}x{})",
                bmp.width, bmp.height
            );
            if self.caps.strict_pow2 {
                fatal_msg(&msg);
            }
            warn!("{msg}");
        }
        if !self.usable() {
            return GfxResourceId::NULL;
        }

        let levels = if mipmaps {
            1 + calc_mipmap_levels(bmp.width, bmp.height, self.caps.custom_mipmap_levels)
        } else {
            1
        };
        let desc = TextureDesc {
            width: bmp.width,
            height: bmp.height,
            levels,
            managed: flags.contains(TextureFlags::MANAGED)
                && self.opts.managed_textures
                && self.caps.managed_textures,
            dynamic: flags.contains(TextureFlags::DYNAMIC),
        };

        let res = self.backend.create_texture(&desc);
        let Some(id) = self.check(res, "Creating texture") else {
            return GfxResourceId::NULL;
        };
        self.textures.insert(id, desc);
        if !self.upload_levels(id, &bmp.rect_at(0, 0), levels) {
            // The context was lost mid-upload; listeners have already run.
            self.textures.remove(&id);
            self.backend.delete_texture(id);
            return GfxResourceId::NULL;
        }
        id
    }

    /// Deletes `id` (if any) and creates a fresh texture in its place.
    pub fn recreate_texture(
        &mut self,
        id: &mut GfxResourceId,
        bmp: &Bitmap,
        flags: TextureFlags,
        mipmaps: bool,
    ) {
        self.delete_texture(id);
        *id = self.create_texture(bmp, flags, mipmaps);
    }

    /// Overwrites a sub-rectangle. `rect.row_width` may exceed its width.
    /// A stale or null handle is ignored.
    pub fn update_texture(&mut self, id: GfxResourceId, rect: &TexelRect<'_>, mipmaps: bool) {
        if !self.usable() || id.is_null() {
            return;
        }
        let Some(desc) = self.textures.get(&id) else {
            debug!("Ignoring update of stale texture {}", id.raw());
            return;
        };
        let levels = if mipmaps { desc.levels } else { 1 };
        self.upload_levels(id, rect, levels);
    }

    pub fn update_texture_part(
        &mut self,
        id: GfxResourceId,
        x: u32,
        y: u32,
        part: &Bitmap,
        mipmaps: bool,
    ) {
        self.update_texture(id, &part.rect_at(x, y), mipmaps);
    }

    /// Writes level 0 and regenerates `levels - 1` mip levels under the
    /// rectangle. Returns false if the context was lost on the way.
    fn upload_levels(&mut self, id: GfxResourceId, rect: &TexelRect<'_>, levels: u32) -> bool {
        let res = self.backend.write_texture(id, 0, rect);
        if self.check(res, "Uploading texture").is_none() {
            return false;
        }

        let (mut x, mut y) = (rect.x, rect.y);
        let (mut w, mut h) = (rect.width, rect.height);
        let mut prev: Option<Vec<_>> = None;
        for level in 1..levels {
            x /= 2;
            y /= 2;
            let (lvl_w, lvl_h) = ((w / 2).max(1), (h / 2).max(1));
            let cur = match &prev {
                Some(p) => gen_mipmap(lvl_w, lvl_h, p, w, h, w),
                None => gen_mipmap(lvl_w, lvl_h, rect.pixels, w, h, rect.row_width),
            };
            let part = TexelRect {
                x,
                y,
                width: lvl_w,
                height: lvl_h,
                row_width: lvl_w,
                pixels: &cur,
            };
            let res = self.backend.write_texture(id, level, &part);
            if self.check(res, "Uploading mipmap").is_none() {
                return false;
            }
            prev = Some(cur);
            w = lvl_w;
            h = lvl_h;
        }
        true
    }

    pub fn bind_texture(&mut self, id: GfxResourceId) {
        if !self.usable() {
            return;
        }
        self.backend.bind_texture(id);
    }

    pub fn delete_texture(&mut self, id: &mut GfxResourceId) {
        if id.is_null() {
            return;
        }
        self.textures.remove(id);
        let refs = self.backend.delete_texture(*id);
        if refs > 0 {
            warn!("Texture {} still had {refs} outstanding references", id.raw());
        }
        *id = GfxResourceId::NULL;
    }

    /// Disabling texturing unbinds the current texture.
    pub fn set_texturing(&mut self, enabled: bool) {
        if enabled || !self.usable() {
            return;
        }
        self.backend.bind_texture(GfxResourceId::NULL);
    }

    pub fn enable_mipmaps(&mut self) {
        if self.opts.mipmaps && self.usable() {
            self.backend.set_mipmap_filter(true);
        }
    }

    pub fn disable_mipmaps(&mut self) {
        if self.opts.mipmaps && self.usable() {
            self.backend.set_mipmap_filter(false);
        }
    }

    // --- Index buffers ---

    pub fn create_ib(&mut self, indices: &[u16]) -> GfxResourceId {
        if !self.usable() {
            return GfxResourceId::NULL;
        }
        let res = self.backend.create_ib(indices);
        self.check(res, "Creating index buffer")
            .unwrap_or(GfxResourceId::NULL)
    }

    pub fn bind_ib(&mut self, ib: GfxResourceId) {
        if !self.usable() {
            return;
        }
        self.backend.bind_ib(ib);
    }

    pub fn delete_ib(&mut self, ib: &mut GfxResourceId) {
        if ib.is_null() {
            return;
        }
        let refs = self.backend.delete_ib(*ib);
        if refs > 0 {
            warn!("Index buffer {} still had {refs} outstanding references", ib.raw());
        }
        *ib = GfxResourceId::NULL;
    }

    // --- Vertex buffers ---

    pub fn create_vb(&mut self, fmt: VertexFormat, count: usize) -> GfxResourceId {
        self.create_vb_with(fmt, count, BufferUsage::Static)
    }

    pub fn create_dynamic_vb(&mut self, fmt: VertexFormat, max_vertices: usize) -> GfxResourceId {
        self.create_vb_with(fmt, max_vertices, BufferUsage::Dynamic)
    }

    fn create_vb_with(
        &mut self,
        fmt: VertexFormat,
        count: usize,
        usage: BufferUsage,
    ) -> GfxResourceId {
        if !self.usable() {
            return GfxResourceId::NULL;
        }
        let res = self.backend.create_vb(fmt, count, usage);
        let Some(id) = self.check(res, "Creating vertex buffer") else {
            return GfxResourceId::NULL;
        };
        self.vb_bytes.insert(id, fmt.stride() * count);
        id
    }

    /// Maps `count` vertices of `fmt` for writing. Fill every byte, then
    /// call `unlock_vb`.
    pub fn lock_vb(
        &mut self,
        vb: GfxResourceId,
        fmt: VertexFormat,
        count: usize,
    ) -> Option<&mut [u8]> {
        self.lock_with(vb, fmt.stride() * count, LockMode::Normal)
    }

    /// Discard lock: the returned memory may differ on every call and holds
    /// nothing readable.
    pub fn lock_dynamic_vb(
        &mut self,
        vb: GfxResourceId,
        fmt: VertexFormat,
        count: usize,
    ) -> Option<&mut [u8]> {
        self.lock_with(vb, fmt.stride() * count, LockMode::Discard)
    }

    /// Typed view over a lock, for callers writing whole vertices.
    pub fn lock_vb_as<V: Pod>(
        &mut self,
        vb: GfxResourceId,
        count: usize,
        mode: LockMode,
    ) -> Option<&mut [V]> {
        let bytes = self.lock_with(vb, size_of::<V>() * count, mode)?;
        bytemuck::try_cast_slice_mut(bytes).ok()
    }

    /// `len` must fit the buffer's capacity. Oversized locks are a caller bug.
    fn lock_with(&mut self, vb: GfxResourceId, len: usize, mode: LockMode) -> Option<&mut [u8]> {
        if !self.usable() || vb.is_null() {
            return None;
        }
        debug_assert!(
            self.vb_bytes.get(&vb).is_none_or(|&cap| len <= cap),
            "Lock of {len} bytes exceeds vertex buffer {} capacity",
            vb.raw()
        );
        match self.backend.lock_vb(vb, len, mode) {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => {
                debug!("Ignoring lock of unknown vertex buffer {}", vb.raw());
                None
            }
            Err(e) => fatal(e, "Locking vertex buffer"),
        }
    }

    /// Uploads the staged contents of a static buffer.
    pub fn unlock_vb(&mut self, vb: GfxResourceId) {
        if !self.usable() || vb.is_null() {
            return;
        }
        let res = self.backend.unlock_vb(vb);
        self.check(res, "Unlocking vertex buffer");
    }

    /// Unlocks and binds, ready to draw.
    pub fn unlock_dynamic_vb(&mut self, vb: GfxResourceId) {
        self.unlock_vb(vb);
        self.bind_vb(vb);
    }

    /// Lock, copy, unlock, bind. `vertices` must fit the buffer's
    /// `max_vertices`.
    pub fn set_dynamic_vb_data<V: Pod>(&mut self, vb: GfxResourceId, vertices: &[V]) {
        let src: &[u8] = bytemuck::cast_slice(vertices);
        let Some(dst) = self.lock_with(vb, src.len(), LockMode::Discard) else {
            return;
        };
        dst.copy_from_slice(src);
        self.unlock_dynamic_vb(vb);
    }

    pub fn update_dynamic_vb_indexed_tris<V: Pod>(&mut self, vb: GfxResourceId, vertices: &[V]) {
        self.set_dynamic_vb_data(vb, vertices);
        self.draw_vb_indexed_tris(vertices.len() as u32);
    }

    pub fn recreate_dynamic_vb(
        &mut self,
        vb: &mut GfxResourceId,
        fmt: VertexFormat,
        max_vertices: usize,
    ) {
        self.delete_vb(vb);
        *vb = self.create_dynamic_vb(fmt, max_vertices);
    }

    pub fn recreate_and_lock_vb(
        &mut self,
        vb: &mut GfxResourceId,
        fmt: VertexFormat,
        count: usize,
    ) -> Option<&mut [u8]> {
        self.delete_vb(vb);
        *vb = self.create_vb(fmt, count);
        self.lock_vb(*vb, fmt, count)
    }

    pub fn bind_vb(&mut self, vb: GfxResourceId) {
        if !self.usable() {
            return;
        }
        self.backend.bind_vb(vb);
    }

    pub fn delete_vb(&mut self, vb: &mut GfxResourceId) {
        if vb.is_null() {
            return;
        }
        self.vb_bytes.remove(vb);
        let refs = self.backend.delete_vb(*vb);
        if refs > 0 {
            warn!("Vertex buffer {} still had {refs} outstanding references", vb.raw());
        }
        *vb = GfxResourceId::NULL;
    }

    pub fn delete_dynamic_vb(&mut self, vb: &mut GfxResourceId) {
        self.delete_vb(vb);
    }

    pub fn set_vertex_format(&mut self, fmt: VertexFormat) {
        if self.vertex_format == Some(fmt) {
            return;
        }
        self.vertex_format = Some(fmt);
        if !self.usable() {
            return;
        }
        self.backend.set_vertex_format(fmt);
    }

    pub const fn vertex_format(&self) -> Option<VertexFormat> {
        self.vertex_format
    }

    // --- Draws ---

    pub fn draw_vb_lines(&mut self, vertex_count: u32) {
        if !self.usable() {
            return;
        }
        self.backend.draw(DrawCall::Lines { vertex_count });
    }

    pub fn draw_vb_indexed_tris(&mut self, vertex_count: u32) {
        self.draw_vb_indexed_tris_range(vertex_count, 0);
    }

    /// Draws `vertex_count / 4` quads starting at `start_vertex`.
    pub fn draw_vb_indexed_tris_range(&mut self, vertex_count: u32, start_vertex: u32) {
        if !self.usable() {
            return;
        }
        self.backend.draw(DrawCall::IndexedTris {
            vertex_count,
            index_count: vertex_count / 4 * 6,
            start_vertex,
        });
    }

    /// Fast path for world geometry, always in the textured format.
    pub fn draw_indexed_tris_t2f_c4b(&mut self, vertex_count: u32, start_vertex: u32) {
        debug_assert_eq!(self.vertex_format, Some(VertexFormat::Textured));
        self.draw_vb_indexed_tris_range(vertex_count, start_vertex);
    }

    // --- Frame ---

    /// Sets the frame cap and vsync. Toggling vsync resets the swapchain;
    /// a failed reset loses the context.
    pub fn set_fps_limit(&mut self, vsync: bool, min_frame_ms: f32) {
        self.opts.min_frame_ms = min_frame_ms;
        if self.opts.vsync == vsync {
            return;
        }
        self.opts.vsync = vsync;
        self.reset_swapchain(" (toggling VSync)");
    }

    /// Resizes the swapchain. Nothing happens if the size did not change.
    pub fn on_window_resize(&mut self, width: u32, height: u32) {
        if (self.opts.width, self.opts.height) == (width, height) {
            return;
        }
        self.opts.width = width;
        self.opts.height = height;
        self.reset_swapchain(" (resizing window)");
    }

    fn reset_swapchain(&mut self, reason: &str) {
        // A lost device picks the new parameters up when it is restored.
        if !self.usable() {
            return;
        }
        let params = self.present_params();
        if let Err(e) = self.backend.reset_swapchain(&params) {
            warn!("Swapchain reset failed: {e}");
            self.lose_context(reason);
        }
    }

    pub fn begin_frame(&mut self) {
        self.frame_start = Instant::now();
        if !self.usable() {
            return;
        }
        let res = self.backend.begin_scene();
        self.check(res, "Beginning scene");
    }

    pub fn clear(&mut self) {
        if !self.usable() {
            return;
        }
        let res = self.backend.clear(self.state.clear_col);
        self.check(res, "Clearing render target");
    }

    pub fn end_frame(&mut self) {
        if self.usable() {
            match self.backend.end_scene_and_present() {
                Ok(PresentStatus::Presented | PresentStatus::Occluded) => {}
                Err(e) if e.is_recoverable() => {
                    if e.is_exhaustion() {
                        self.raise(ContextEvent::LowVramDetected);
                    }
                    self.lose_context(" (presenting frame)");
                }
                Err(e) => fatal(e, "Presenting frame"),
            }
        }
        if self.opts.min_frame_ms > 0.0 {
            self.limit_fps();
        }
    }

    fn limit_fps(&self) {
        let elapsed_ms = self.frame_start.elapsed().as_secs_f32() * 1000.0;
        let left_over = self.opts.min_frame_ms - elapsed_ms;
        // Sub-millisecond sleeps overshoot badly on most schedulers.
        if left_over > 0.001 {
            thread::sleep(Duration::from_millis((left_over + 0.5) as u64));
        }
    }

    // --- Diagnostics ---

    /// Keeps the next presented frame for `take_screenshot`. Backends that
    /// can read their framebuffer at any time ignore this.
    pub fn request_screenshot(&mut self) {
        self.backend.request_capture();
    }

    /// PNG-encodes the last presented frame into `out`.
    pub fn take_screenshot<W: Write>(&mut self, out: W) -> Result<(), Box<dyn Error>> {
        if !self.usable() {
            return Err("graphics context is not available".into());
        }
        let img = self.backend.capture_frame()?;
        PngEncoder::new(out).write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::Rgba8,
        )?;
        Ok(())
    }

    pub fn api_info(&self) -> Vec<String> {
        let mut lines = vec![format!("-- Using {} --", self.backend.name())];
        lines.extend(self.backend.api_info());
        lines.push(format!(
            "Max texture size: ({}, {})",
            self.caps.max_texture_size, self.caps.max_texture_size
        ));
        lines.push(format!("Depth buffer bits: {}", self.caps.depth_bits));
        lines.push(format!("Device state: {:?}", self.lifecycle.state()));
        lines
    }

    /// Logs a warning about a degraded setup. Returns true if there was one.
    pub fn warn_if_necessary(&self) -> bool {
        match self.backend.warning() {
            Some(msg) => {
                warn!("{msg}");
                true
            }
            None => false,
        }
    }
}

impl Drop for Gfx {
    fn drop(&mut self) {
        self.free();
    }
}
