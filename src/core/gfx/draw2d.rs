//! Immediate 2D helpers drawn through the shared default buffers.

use crate::core::gfx::{
    DrawType, Gfx, MatrixType, PackedCol, Texture, VertexColoured, VertexFormat, VertexTextured,
};

impl Gfx {
    /// Switches to screen-space drawing: ortho projection, identity view,
    /// no depth test, blending on and fog suspended.
    pub fn begin_2d(&mut self, width: u32, height: u32) {
        let ortho = self.calc_ortho_matrix(width as f32, height as f32);
        self.load_matrix(MatrixType::Projection, &ortho);
        self.load_identity_matrix(MatrixType::View);

        self.set_depth_test(false);
        self.set_alpha_blending(true);
        self.had_fog = self.get_fog();
        if self.had_fog {
            self.set_fog(false);
        }
    }

    pub fn end_2d(&mut self) {
        self.set_depth_test(true);
        self.set_alpha_blending(false);
        if self.had_fog {
            self.set_fog(true);
        }
    }

    /// Solid rectangle.
    pub fn draw_2d_flat(&mut self, x: i32, y: i32, width: i32, height: i32, col: PackedCol) {
        self.draw_2d_coloured(x, y, width, height, col, col);
    }

    /// Vertical gradient from `top` to `bottom`.
    pub fn draw_2d_gradient(
        &mut self,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        top: PackedCol,
        bottom: PackedCol,
    ) {
        self.draw_2d_coloured(x, y, width, height, top, bottom);
    }

    fn draw_2d_coloured(
        &mut self,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        top: PackedCol,
        bottom: PackedCol,
    ) {
        let (x1, y1) = (x as f32, y as f32);
        let (x2, y2) = ((x + width) as f32, (y + height) as f32);
        let verts = [
            VertexColoured { x: x1, y: y1, z: 0.0, col: top },
            VertexColoured { x: x2, y: y1, z: 0.0, col: top },
            VertexColoured { x: x2, y: y2, z: 0.0, col: bottom },
            VertexColoured { x: x1, y: y2, z: 0.0, col: bottom },
        ];
        self.set_vertex_format(VertexFormat::Coloured);
        self.update_dynamic_vb_indexed_tris(self.quad_vb, &verts);
    }

    /// Draws `tex` with whatever texture is currently bound.
    pub fn draw_2d_texture(&mut self, tex: &Texture, col: PackedCol) {
        let verts = self.make_2d_quad(tex, col);
        self.set_vertex_format(VertexFormat::Textured);
        self.update_dynamic_vb_indexed_tris(self.tex_vb, &verts);
    }

    /// Quad vertices for `tex`, shifted by half a pixel on backends whose
    /// pixel centres sit on integer coordinates.
    pub fn make_2d_quad(&self, tex: &Texture, col: PackedCol) -> [VertexTextured; 4] {
        let offset = if self.caps().half_pixel_offset { 0.5 } else { 0.0 };
        let x1 = tex.x as f32 - offset;
        let y1 = tex.y as f32 - offset;
        let x2 = (tex.x + tex.width) as f32 - offset;
        let y2 = (tex.y + tex.height) as f32 - offset;
        let uv = tex.uv;
        [
            VertexTextured { x: x1, y: y1, z: 0.0, col, u: uv.u1, v: uv.v1 },
            VertexTextured { x: x2, y: y1, z: 0.0, col, u: uv.u2, v: uv.v1 },
            VertexTextured { x: x2, y: y2, z: 0.0, col, u: uv.u2, v: uv.v2 },
            VertexTextured { x: x1, y: y2, z: 0.0, col, u: uv.u1, v: uv.v2 },
        ]
    }

    pub fn texture_render(&mut self, tex: &Texture) {
        self.bind_texture(tex.id);
        self.draw_2d_texture(tex, PackedCol::WHITE);
    }

    pub fn texture_render_shaded(&mut self, tex: &Texture, shade: PackedCol) {
        self.bind_texture(tex.id);
        self.draw_2d_texture(tex, shade);
    }

    pub fn setup_alpha_state(&mut self, draw: DrawType) {
        match draw {
            DrawType::Translucent => self.set_alpha_blending(true),
            DrawType::Transparent | DrawType::TransparentThick | DrawType::Sprite => {
                self.set_alpha_test(true);
            }
            DrawType::Opaque | DrawType::Gas => {}
        }
    }

    pub fn restore_alpha_state(&mut self, draw: DrawType) {
        match draw {
            DrawType::Translucent => self.set_alpha_blending(false),
            DrawType::Transparent | DrawType::TransparentThick | DrawType::Sprite => {
                self.set_alpha_test(false);
            }
            DrawType::Opaque | DrawType::Gas => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::gfx::{
        DrawCall, DrawType, Gfx, GfxOptions, GfxResourceId, PackedCol, Texture, TextureRec,
        backends::recording::{Call, RecordingBackend},
        state::StateChange,
    };

    fn gfx() -> (Gfx, crate::core::gfx::backends::recording::CallLog) {
        let (backend, log) = RecordingBackend::new();
        let gfx = Gfx::create(Box::new(backend), GfxOptions::default());
        log.clear();
        (gfx, log)
    }

    #[test]
    fn begin_2d_suspends_fog_and_end_2d_restores_it() {
        let (mut gfx, _log) = gfx();
        gfx.set_fog(true);
        gfx.begin_2d(640, 480);
        let s = gfx.render_state();
        assert!(!s.fog && !s.depth_test && s.alpha_blending);

        gfx.end_2d();
        let s = gfx.render_state();
        assert!(s.fog && s.depth_test && !s.alpha_blending);
    }

    #[test]
    fn end_2d_leaves_fog_off_when_it_was_off() {
        let (mut gfx, _log) = gfx();
        gfx.begin_2d(640, 480);
        gfx.end_2d();
        assert!(!gfx.get_fog());
    }

    #[test]
    fn quad_is_offset_by_half_a_pixel() {
        let (gfx, _log) = gfx();
        let tex = Texture {
            id: GfxResourceId::NULL,
            x: 10,
            y: 20,
            width: 32,
            height: 16,
            uv: TextureRec::FULL,
        };
        let quad = gfx.make_2d_quad(&tex, PackedCol::WHITE);
        assert_eq!((quad[0].x, quad[0].y), (9.5, 19.5));
        assert_eq!((quad[2].x, quad[2].y), (41.5, 35.5));
        assert_eq!((quad[2].u, quad[2].v), (1.0, 1.0));
    }

    #[test]
    fn flat_rect_draws_one_quad_from_the_shared_buffer() {
        let (mut gfx, log) = gfx();
        gfx.draw_2d_flat(0, 0, 8, 8, PackedCol::WHITE);
        assert_eq!(
            log.count(|c| matches!(
                c,
                Call::Draw(DrawCall::IndexedTris { vertex_count: 4, index_count: 6, .. })
            )),
            1
        );
    }

    #[test]
    fn alpha_state_by_draw_type() {
        let (mut gfx, log) = gfx();
        gfx.setup_alpha_state(DrawType::Translucent);
        gfx.setup_alpha_state(DrawType::Sprite);
        assert!(gfx.render_state().alpha_blending && gfx.render_state().alpha_test);
        gfx.restore_alpha_state(DrawType::Translucent);
        gfx.restore_alpha_state(DrawType::Sprite);
        assert!(!gfx.render_state().alpha_blending && !gfx.render_state().alpha_test);

        log.clear();
        gfx.setup_alpha_state(DrawType::Opaque);
        assert!(!log.calls().iter().any(|c| matches!(c, Call::State(StateChange::AlphaTest(_)))));
    }
}
