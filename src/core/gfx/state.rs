use crate::core::gfx::{FogFunc, PackedCol};
use bitflags::bitflags;
use glam::Mat4;

bitflags! {
    /// Per-channel colour write mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl ColorMask {
    pub fn from_channels(r: bool, g: bool, b: bool, a: bool) -> Self {
        let mut mask = Self::empty();
        mask.set(Self::R, r);
        mask.set(Self::G, g);
        mask.set(Self::B, b);
        mask.set(Self::A, a);
        mask
    }
}

/// One native state change. Each variant maps to exactly one backend call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    FaceCulling(bool),
    Fog(bool),
    FogCol(PackedCol),
    FogDensity(f32),
    FogEnd(f32),
    FogMode(FogFunc),
    AlphaTest(bool),
    AlphaBlending(bool),
    AlphaArgBlend(bool),
    DepthTest(bool),
    DepthWrite(bool),
    ColWriteMask(ColorMask),
}

/// Shadow copy of everything the device has been told.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    pub face_culling: bool,
    pub fog: bool,
    pub fog_col: PackedCol,
    pub fog_density: f32,
    pub fog_end: f32,
    pub fog_mode: FogFunc,
    pub alpha_test: bool,
    pub alpha_blending: bool,
    pub alpha_arg_blend: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub col_write_mask: ColorMask,
    pub clear_col: PackedCol,
    pub view: Mat4,
    pub projection: Mat4,
    pub tex_offset: Option<(f32, f32)>,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            face_culling: false,
            fog: false,
            fog_col: PackedCol::BLACK,
            // Not a value anyone sets, so the first real request always applies.
            fog_density: -1.0,
            fog_end: -1.0,
            fog_mode: FogFunc::Linear,
            alpha_test: false,
            alpha_blending: false,
            alpha_arg_blend: false,
            depth_test: true,
            depth_write: true,
            col_write_mask: ColorMask::all(),
            clear_col: PackedCol::BLACK,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            tex_offset: None,
        }
    }
}

impl RenderState {
    /// Records `change` and reports whether it differs from the cached value.
    pub fn update(&mut self, change: StateChange) -> bool {
        fn swap<T: PartialEq>(slot: &mut T, value: T) -> bool {
            if *slot == value {
                return false;
            }
            *slot = value;
            true
        }

        match change {
            StateChange::FaceCulling(v) => swap(&mut self.face_culling, v),
            StateChange::Fog(v) => swap(&mut self.fog, v),
            StateChange::FogCol(v) => swap(&mut self.fog_col, v),
            StateChange::FogDensity(v) => swap(&mut self.fog_density, v),
            StateChange::FogEnd(v) => swap(&mut self.fog_end, v),
            StateChange::FogMode(v) => swap(&mut self.fog_mode, v),
            StateChange::AlphaTest(v) => swap(&mut self.alpha_test, v),
            StateChange::AlphaBlending(v) => swap(&mut self.alpha_blending, v),
            StateChange::AlphaArgBlend(v) => swap(&mut self.alpha_arg_blend, v),
            StateChange::DepthTest(v) => swap(&mut self.depth_test, v),
            StateChange::DepthWrite(v) => swap(&mut self.depth_write, v),
            StateChange::ColWriteMask(v) => swap(&mut self.col_write_mask, v),
        }
    }

    /// Every cached value as a change list, for resynchronising a fresh device.
    pub fn changes(&self) -> [StateChange; 12] {
        [
            StateChange::FaceCulling(self.face_culling),
            StateChange::Fog(self.fog),
            StateChange::FogCol(self.fog_col),
            StateChange::FogDensity(self.fog_density),
            StateChange::FogEnd(self.fog_end),
            StateChange::FogMode(self.fog_mode),
            StateChange::AlphaTest(self.alpha_test),
            StateChange::AlphaBlending(self.alpha_blending),
            StateChange::AlphaArgBlend(self.alpha_arg_blend),
            StateChange::DepthTest(self.depth_test),
            StateChange::DepthWrite(self.depth_write),
            StateChange::ColWriteMask(self.col_write_mask),
        ]
    }
}
