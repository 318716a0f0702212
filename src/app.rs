use cubegfx::config::{self, Config};
use cubegfx::core::gfx::{
    self as renderer, ContextListener, DrawType, FogFunc, Gfx, GfxResourceId, ListenerRef,
    MatrixType, PackedCol, Texture, TextureFlags, TextureRec, VertexFormat, VertexTextured,
    backends::LockMode,
    bitmap::{Bitmap, BitmapCol, bitmap_col},
};
use glam::{Mat4, Vec3};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

use log::{error, info, warn};
use std::{
    cell::RefCell,
    error::Error,
    fs::File,
    io::BufWriter,
    rc::Rc,
    sync::Arc,
    time::Instant,
};

/* -------------------- scene constants -------------------- */
const SKY_COL: PackedCol = PackedCol::new(153, 204, 255, 255);
const WORLD_SIZE: u32 = 16;
const TILE: u32 = 16;
const ATLAS_TILES_PER_ROW: u32 = 4;
const ATLAS_SIZE: u32 = TILE * ATLAS_TILES_PER_ROW;
const FOG_END: f32 = 40.0;
const VIEW_DISTANCE: f32 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tile {
    GrassTop = 0,
    GrassSide = 1,
    Dirt = 2,
    Stone = 3,
    Glass = 4,
}

impl Tile {
    fn rec(self) -> TextureRec {
        let i = self as u32;
        let step = 1.0 / ATLAS_TILES_PER_ROW as f32;
        let u1 = (i % ATLAS_TILES_PER_ROW) as f32 * step;
        let v1 = (i / ATLAS_TILES_PER_ROW) as f32 * step;
        TextureRec {
            u1,
            v1,
            u2: u1 + step,
            v2: v1 + step,
        }
    }
}

/* -------------------- procedural content -------------------- */

fn noise(x: u32, y: u32, seed: u32) -> u8 {
    let mut h = x.wrapping_mul(374_761_393)
        ^ y.wrapping_mul(668_265_263)
        ^ seed.wrapping_mul(2_246_822_519);
    h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
    (h ^ (h >> 16)) as u8
}

fn tile_texel(tile: Tile, px: u32, py: u32) -> BitmapCol {
    let n = noise(px, py, tile as u32);
    let grass = bitmap_col(60 + n % 20, 120 + n % 40, 40, 255);
    let dirt = bitmap_col(120 + n % 25, 85 + n % 20, 50, 255);
    match tile {
        Tile::GrassTop => grass,
        Tile::GrassSide if py < 3 + u32::from(n % 2) => grass,
        Tile::GrassSide | Tile::Dirt => dirt,
        Tile::Stone => {
            let v = 110 + n % 40;
            bitmap_col(v, v, v, 255)
        }
        Tile::Glass => {
            let edge = px == 0 || py == 0 || px == TILE - 1 || py == TILE - 1;
            if edge || (px + py) % 7 == 0 {
                bitmap_col(220, 235, 240, 255)
            } else {
                bitmap_col(0, 0, 0, 0)
            }
        }
    }
}

fn build_atlas() -> Bitmap {
    let mut bmp = Bitmap::new(ATLAS_SIZE, ATLAS_SIZE);
    for tile in [Tile::GrassTop, Tile::GrassSide, Tile::Dirt, Tile::Stone, Tile::Glass] {
        let ox = (tile as u32 % ATLAS_TILES_PER_ROW) * TILE;
        let oy = (tile as u32 / ATLAS_TILES_PER_ROW) * TILE;
        for py in 0..TILE {
            for px in 0..TILE {
                bmp.set(ox + px, oy + py, tile_texel(tile, px, py));
            }
        }
    }
    bmp
}

/// Quad `o, o+u, o+u+v, o+v`; counter-clockwise when seen from `u x v`.
fn push_face(out: &mut Vec<VertexTextured>, o: Vec3, u: Vec3, v: Vec3, tile: Tile, shade: f32) {
    let rec = tile.rec();
    let col = PackedCol::WHITE.scale(shade);
    let corners = [
        (o, rec.u1, rec.v2),
        (o + u, rec.u2, rec.v2),
        (o + u + v, rec.u2, rec.v1),
        (o + v, rec.u1, rec.v1),
    ];
    out.extend(corners.iter().map(|&(p, tu, tv)| VertexTextured {
        x: p.x,
        y: p.y,
        z: p.z,
        col,
        u: tu,
        v: tv,
    }));
}

fn push_block(out: &mut Vec<VertexTextured>, p: Vec3, top: Tile, side: Tile, bottom: Option<Tile>) {
    push_face(out, p + Vec3::new(0.0, 1.0, 1.0), Vec3::X, Vec3::NEG_Z, top, 1.0);
    push_face(out, p + Vec3::new(1.0, 0.0, 1.0), Vec3::NEG_Z, Vec3::Y, side, 0.6);
    push_face(out, p, Vec3::Z, Vec3::Y, side, 0.6);
    push_face(out, p + Vec3::Z, Vec3::X, Vec3::Y, side, 0.8);
    push_face(out, p + Vec3::X, Vec3::NEG_X, Vec3::Y, side, 0.8);
    if let Some(bottom) = bottom {
        push_face(out, p, Vec3::X, Vec3::Z, bottom, 0.5);
    }
}

/// Opaque blocks first, then the alpha-tested ones. Returns the split.
fn build_world() -> (Vec<VertexTextured>, u32) {
    let mut verts = Vec::new();
    for z in 0..WORLD_SIZE {
        for x in 0..WORLD_SIZE {
            let p = Vec3::new(x as f32, 0.0, z as f32);
            push_block(&mut verts, p, Tile::GrassTop, Tile::GrassSide, None);
        }
    }
    for (x, z, height) in [(3, 4, 3), (11, 2, 2), (7, 12, 4), (13, 13, 1)] {
        for y in 1..=height {
            let p = Vec3::new(x as f32, y as f32, z as f32);
            push_block(&mut verts, p, Tile::Stone, Tile::Stone, Some(Tile::Stone));
        }
    }
    let opaque = verts.len() as u32;
    for (x, y, z) in [(8, 1, 8), (9, 1, 8), (8, 2, 8)] {
        let p = Vec3::new(x as f32, y as f32, z as f32);
        push_block(&mut verts, p, Tile::Glass, Tile::Glass, Some(Tile::Glass));
    }
    (verts, opaque)
}

/* -------------------- GPU-owning scene -------------------- */

#[derive(Debug, Clone, Copy)]
struct SceneHandles {
    atlas: GfxResourceId,
    vb: GfxResourceId,
    opaque_count: u32,
    total_count: u32,
}

struct DemoScene {
    atlas_bmp: Bitmap,
    vertices: Vec<VertexTextured>,
    opaque_count: u32,
    atlas: GfxResourceId,
    atlas_managed: bool,
    vb: GfxResourceId,
}

impl DemoScene {
    fn new() -> Self {
        let (vertices, opaque_count) = build_world();
        Self {
            atlas_bmp: build_atlas(),
            vertices,
            opaque_count,
            atlas: GfxResourceId::NULL,
            atlas_managed: false,
            vb: GfxResourceId::NULL,
        }
    }

    fn handles(&self) -> SceneHandles {
        SceneHandles {
            atlas: self.atlas,
            vb: self.vb,
            opaque_count: self.opaque_count,
            total_count: self.vertices.len() as u32,
        }
    }

    fn create_resources(&mut self, gfx: &mut Gfx) {
        if self.atlas.is_null() || !self.atlas_managed {
            self.atlas_managed = gfx.caps().managed_textures && gfx.options().managed_textures;
            let mipmaps = gfx.options().mipmaps;
            gfx.recreate_texture(&mut self.atlas, &self.atlas_bmp, TextureFlags::MANAGED, mipmaps);
        }

        gfx.delete_vb(&mut self.vb);
        let count = self.vertices.len();
        self.vb = gfx.create_vb(VertexFormat::Textured, count);
        if let Some(dst) = gfx.lock_vb_as::<VertexTextured>(self.vb, count, LockMode::Normal) {
            dst.copy_from_slice(&self.vertices);
        }
        gfx.unlock_vb(self.vb);
    }
}

impl ContextListener for DemoScene {
    fn on_context_lost(&mut self, gfx: &mut Gfx) {
        gfx.delete_vb(&mut self.vb);
        if !self.atlas_managed {
            gfx.delete_texture(&mut self.atlas);
        }
    }

    fn on_context_recreated(&mut self, gfx: &mut Gfx) {
        self.create_resources(gfx);
    }

    fn on_low_vram_detected(&mut self, _gfx: &mut Gfx) {
        warn!("Video memory is running low; the scene will be rebuilt after recovery.");
    }
}

fn render_scene(gfx: &mut Gfx, h: SceneHandles, width: u32, height: u32, fov: f32, t: f32) {
    let centre = Vec3::new(WORLD_SIZE as f32 / 2.0, 1.0, WORLD_SIZE as f32 / 2.0);
    let angle = t * 0.2;
    let eye = centre + Vec3::new(angle.cos() * 20.0, 10.0, angle.sin() * 20.0);
    let view = Mat4::look_at_rh(eye, centre, Vec3::Y);
    let aspect = width as f32 / height.max(1) as f32;
    let proj = gfx.calc_perspective_matrix(fov.to_radians(), aspect, VIEW_DISTANCE);
    gfx.load_matrix(MatrixType::View, &view);
    gfx.load_matrix(MatrixType::Projection, &proj);

    gfx.set_fog(true);
    gfx.set_fog_mode(FogFunc::Linear);
    gfx.set_fog_col(SKY_COL);
    gfx.set_fog_end(FOG_END);
    gfx.set_face_culling(true);

    gfx.set_vertex_format(VertexFormat::Textured);
    gfx.bind_texture(h.atlas);
    gfx.enable_mipmaps();
    gfx.bind_vb(h.vb);
    gfx.draw_vb_indexed_tris(h.opaque_count);

    gfx.setup_alpha_state(DrawType::Transparent);
    gfx.draw_vb_indexed_tris_range(h.total_count - h.opaque_count, h.opaque_count);
    gfx.restore_alpha_state(DrawType::Transparent);

    gfx.disable_mipmaps();
    gfx.set_face_culling(false);
}

fn render_overlay(gfx: &mut Gfx, h: SceneHandles, width: u32, height: u32) {
    gfx.begin_2d(width, height);
    gfx.draw_2d_gradient(
        0,
        0,
        width as i32,
        28,
        PackedCol::new(0, 0, 0, 160),
        PackedCol::new(0, 0, 0, 0),
    );
    let (cx, cy) = (width as i32 / 2, height as i32 / 2);
    gfx.draw_2d_flat(cx - 8, cy - 1, 16, 2, PackedCol::WHITE);
    gfx.draw_2d_flat(cx - 1, cy - 8, 2, 16, PackedCol::WHITE);

    let preview = Texture {
        id: h.atlas,
        x: 8,
        y: 36,
        width: ATLAS_SIZE as i32,
        height: ATLAS_SIZE as i32,
        uv: TextureRec::FULL,
    };
    gfx.texture_render_shaded(&preview, PackedCol::new(255, 255, 255, 220));
    gfx.end_2d();
}

/* -------------------- application -------------------- */

pub struct App {
    config: Config,
    window: Option<Arc<Window>>,
    gfx: Option<Gfx>,
    scene: Rc<RefCell<DemoScene>>,
    vsync: bool,
    start_time: Instant,
    last_title_update: Instant,
    frame_count: u32,
    screenshot_pending: bool,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            gfx: None,
            scene: Rc::new(RefCell::new(DemoScene::new())),
            vsync: config.vsync,
            start_time: Instant::now(),
            last_title_update: Instant::now(),
            frame_count: 0,
            screenshot_pending: false,
        }
    }

    fn init_graphics(&mut self, event_loop: &ActiveEventLoop) -> Result<(), Box<dyn Error>> {
        let window_attributes = Window::default_attributes()
            .with_title(format!("cubegfx - {}", self.config.video_renderer))
            .with_resizable(true)
            .with_inner_size(PhysicalSize::new(
                self.config.display_width,
                self.config.display_height,
            ));
        let window = Arc::new(event_loop.create_window(window_attributes)?);

        let sz = window.inner_size();
        let mut opts = self.config.to_gfx_options();
        opts.width = sz.width.max(1);
        opts.height = sz.height.max(1);

        let backend = renderer::create_backend(self.config.video_renderer, window.clone(), &opts)?;
        let mut gfx = Gfx::create(backend, opts);
        for line in gfx.api_info() {
            info!("{line}");
        }
        gfx.warn_if_necessary();

        let listener: ListenerRef = self.scene.clone();
        gfx.register_listener(&listener);
        if !gfx.is_lost() {
            self.scene.borrow_mut().create_resources(&mut gfx);
        }

        self.window = Some(window);
        self.gfx = Some(gfx);
        info!("Starting event loop...");
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: &KeyEvent) {
        if key_event.state != ElementState::Pressed || key_event.repeat {
            return;
        }
        let PhysicalKey::Code(code) = key_event.physical_key else {
            return;
        };
        let Some(gfx) = self.gfx.as_mut() else {
            return;
        };
        match code {
            KeyCode::KeyV => {
                self.vsync = !self.vsync;
                gfx.set_fps_limit(self.vsync, self.config.min_frame_ms());
                config::update_vsync(self.vsync);
                info!("VSync {}", if self.vsync { "ON" } else { "OFF" });
            }
            KeyCode::KeyL => gfx.lose_context(" (requested by user)"),
            KeyCode::F12 => {
                gfx.request_screenshot();
                self.screenshot_pending = true;
            }
            _ => {}
        }
    }

    fn write_screenshot(gfx: &mut Gfx) -> Result<String, Box<dyn Error>> {
        let name = format!(
            "screenshot_{}.png",
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let file = File::create(&name)?;
        gfx.take_screenshot(BufWriter::new(file))?;
        Ok(name)
    }

    fn redraw(&mut self) {
        let (Some(window), Some(gfx)) = (self.window.as_ref(), self.gfx.as_mut()) else {
            return;
        };
        if gfx.is_lost() && !gfx.try_restore_context() {
            return;
        }

        let sz = window.inner_size();
        let (width, height) = (sz.width.max(1), sz.height.max(1));
        let t = self.start_time.elapsed().as_secs_f32();
        // Copied out so listeners stay borrowable if the device drops mid-frame.
        let handles = self.scene.borrow().handles();

        gfx.begin_frame();
        gfx.clear_col(SKY_COL);
        gfx.clear();
        render_scene(gfx, handles, width, height, self.config.fov, t);
        render_overlay(gfx, handles, width, height);
        gfx.end_frame();

        if self.screenshot_pending {
            self.screenshot_pending = false;
            match Self::write_screenshot(gfx) {
                Ok(name) => info!("Saved screenshot to '{name}'"),
                Err(e) => warn!("Failed to save screenshot: {e}"),
            }
        }

        self.frame_count += 1;
        let elapsed = self.last_title_update.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            window.set_title(&format!(
                "cubegfx - {} | {:?} | {fps:.2} FPS",
                gfx.backend_name(),
                gfx.device_state()
            ));
            self.frame_count = 0;
            self.last_title_update = Instant::now();
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none()
            && let Err(e) = self.init_graphics(event_loop)
        {
            error!("Failed to initialize graphics: {e}");
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        let Some(window) = self.window.as_ref().cloned() else {
            return;
        };
        if window_id != window.id() {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested. Shutting down.");
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                if new_size.width > 0
                    && new_size.height > 0
                    && let Some(gfx) = &mut self.gfx
                {
                    gfx.on_window_resize(new_size.width, new_size.height);
                }
            }
            WindowEvent::KeyboardInput {
                event: key_event, ..
            } => self.handle_key_event(&key_event),
            WindowEvent::RedrawRequested => self.redraw(),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut gfx) = self.gfx.take() {
            let opts = gfx.options();
            config::update_display_resolution(opts.width, opts.height);
            let mut scene = self.scene.borrow_mut();
            gfx.delete_vb(&mut scene.vb);
            gfx.delete_texture(&mut scene.atlas);
            drop(scene);
            gfx.free();
        }
    }
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let config = config::get();
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faces_wind_counter_clockwise_from_outside() {
        let mut verts = Vec::new();
        push_block(&mut verts, Vec3::ZERO, Tile::Stone, Tile::Stone, Some(Tile::Stone));
        assert_eq!(verts.len(), 24);
        let centre = Vec3::splat(0.5);
        for quad in verts.chunks_exact(4) {
            let p = |v: &VertexTextured| Vec3::new(v.x, v.y, v.z);
            let (a, b, c) = (p(&quad[0]), p(&quad[1]), p(&quad[2]));
            let normal = (b - a).cross(c - a);
            assert!(normal.dot(a - centre) > 0.0, "face {a:?} winds inward");
        }
    }

    #[test]
    fn world_puts_glass_after_opaque_blocks() {
        let (verts, opaque) = build_world();
        assert!(opaque > 0 && (opaque as usize) < verts.len());
        assert_eq!(opaque % 4, 0);
        assert!(verts.len() <= renderer::GFX_MAX_VERTICES);
    }

    #[test]
    fn atlas_is_power_of_two_with_transparent_glass() {
        let atlas = build_atlas();
        assert!(atlas.width.is_power_of_two() && atlas.height.is_power_of_two());
        let glass = Tile::Glass as u32;
        let (ox, oy) = ((glass % ATLAS_TILES_PER_ROW) * TILE, (glass / ATLAS_TILES_PER_ROW) * TILE);
        assert_eq!(atlas.get(ox, oy) >> 24, 255);
        assert_eq!(atlas.get(ox + 5, oy + 3) >> 24, 0);
    }

    #[test]
    fn tile_uvs_stay_inside_the_atlas() {
        let rec = Tile::Glass.rec();
        assert_eq!((rec.u1, rec.v1, rec.u2, rec.v2), (0.0, 0.25, 0.25, 0.5));
    }
}
