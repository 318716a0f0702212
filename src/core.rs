pub mod gfx;
pub mod space;
