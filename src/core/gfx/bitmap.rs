//! CPU-side texture data and the mipmap chain builder.

use image::RgbaImage;

/// Packed `0xAARRGGBB` pixel.
pub type BitmapCol = u32;

#[inline(always)]
pub const fn bitmap_col(r: u8, g: u8, b: u8, a: u8) -> BitmapCol {
    ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
}

#[inline(always)]
pub const fn col_r(c: BitmapCol) -> u8 {
    (c >> 16) as u8
}

#[inline(always)]
pub const fn col_g(c: BitmapCol) -> u8 {
    (c >> 8) as u8
}

#[inline(always)]
pub const fn col_b(c: BitmapCol) -> u8 {
    c as u8
}

#[inline(always)]
pub const fn col_a(c: BitmapCol) -> u8 {
    (c >> 24) as u8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<BitmapCol>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    #[inline(always)]
    pub fn get(&self, x: u32, y: u32) -> BitmapCol {
        self.pixels[(y * self.width + x) as usize]
    }

    #[inline(always)]
    pub fn set(&mut self, x: u32, y: u32, col: BitmapCol) {
        self.pixels[(y * self.width + x) as usize] = col;
    }

    /// The whole bitmap as an upload source placed at `(x, y)`.
    pub fn rect_at(&self, x: u32, y: u32) -> TexelRect<'_> {
        TexelRect {
            x,
            y,
            width: self.width,
            height: self.height,
            row_width: self.width,
            pixels: &self.pixels,
        }
    }
}

/// A sub-rectangle upload: `width x height` texels read from `pixels` with a
/// row stride of `row_width`, written at `(x, y)` in the destination.
#[derive(Debug, Clone, Copy)]
pub struct TexelRect<'a> {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub row_width: u32,
    pub pixels: &'a [BitmapCol],
}

impl TexelRect<'_> {
    #[inline(always)]
    pub fn row(&self, y: u32) -> &[BitmapCol] {
        let start = (y * self.row_width) as usize;
        &self.pixels[start..start + self.width as usize]
    }
}

/// Unpacks `0xAARRGGBB` pixels into an RGBA8 image.
pub fn rgba_image(width: u32, height: u32, pixels: &[BitmapCol]) -> Option<RgbaImage> {
    let mut raw = Vec::with_capacity(pixels.len() * 4);
    for &c in pixels {
        raw.extend_from_slice(&[col_r(c), col_g(c), col_b(c), col_a(c)]);
    }
    RgbaImage::from_raw(width, height, raw)
}

#[inline(always)]
pub const fn is_pow2(v: u32) -> bool {
    v != 0 && v & (v - 1) == 0
}

/// Number of mip levels below level 0.
///
/// Backends with custom level counts stop at the smaller dimension and at
/// most four levels; the rest build the chain down to 1x1.
pub fn calc_mipmap_levels(width: u32, height: u32, custom_levels: bool) -> u32 {
    let lvls_w = width.max(1).ilog2();
    let lvls_h = height.max(1).ilog2();
    if custom_levels {
        lvls_w.min(lvls_h).min(4)
    } else {
        lvls_w.max(lvls_h)
    }
}

/// Averages two pixels in premultiplied-alpha space, so fully transparent
/// texels contribute nothing to the resulting colour.
pub fn average_col(p1: BitmapCol, p2: BitmapCol) -> BitmapCol {
    let a1 = u32::from(col_a(p1));
    let a2 = u32::from(col_a(p2));
    let a_sum = (a1 + a2).max(1);

    let r = (u32::from(col_r(p1)) * a1 + u32::from(col_r(p2)) * a2) / a_sum;
    let g = (u32::from(col_g(p1)) * a1 + u32::from(col_g(p2)) * a2) / a_sum;
    let b = (u32::from(col_b(p1)) * a1 + u32::from(col_b(p2)) * a2) / a_sum;
    bitmap_col(r as u8, g as u8, b as u8, (a_sum >> 1) as u8)
}

/// Builds one mip level of `dst_w x dst_h` from the level above it with a
/// 2x2 box filter. Reads clamp at the source edge for non-square chains.
pub fn gen_mipmap(
    dst_w: u32,
    dst_h: u32,
    src: &[BitmapCol],
    src_w: u32,
    src_h: u32,
    src_row_width: u32,
) -> Vec<BitmapCol> {
    let mut dst = Vec::with_capacity(dst_w as usize * dst_h as usize);
    let at = |x: u32, y: u32| src[(y * src_row_width + x) as usize];

    for y in 0..dst_h {
        let y0 = (y * 2).min(src_h - 1);
        let y1 = (y * 2 + 1).min(src_h - 1);
        for x in 0..dst_w {
            let x0 = (x * 2).min(src_w - 1);
            let x1 = (x * 2 + 1).min(src_w - 1);

            let ave0 = average_col(at(x0, y0), at(x1, y0));
            let ave1 = average_col(at(x0, y1), at(x1, y1));
            dst.push(average_col(ave0, ave1));
        }
    }
    dst
}

/// Copies `src` into a `dst_row_width`-wide surface scanline by scanline,
/// honouring the source stride.
pub fn copy_texture_data(dst: &mut [BitmapCol], dst_row_width: u32, src: &TexelRect<'_>) {
    for y in 0..src.height {
        let start = ((src.y + y) * dst_row_width + src.x) as usize;
        dst[start..start + src.width as usize].copy_from_slice(src.row(y));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_block_averages_evenly() {
        let src = [
            bitmap_col(0, 10, 20, 255),
            bitmap_col(100, 30, 40, 255),
            bitmap_col(200, 50, 60, 255),
            bitmap_col(40, 70, 80, 255),
        ];
        let out = gen_mipmap(1, 1, &src, 2, 2, 2)[0];
        assert_eq!(col_r(out), 85);
        assert_eq!(col_g(out), 40);
        assert_eq!(col_b(out), 50);
        assert_eq!(col_a(out), 255);
    }

    #[test]
    fn transparent_texel_is_excluded_from_colour() {
        // TL, TR, BL, BR with BL fully transparent but loudly coloured.
        let src = [
            bitmap_col(100, 100, 100, 255),
            bitmap_col(100, 100, 100, 255),
            bitmap_col(255, 0, 255, 0),
            bitmap_col(100, 100, 100, 255),
        ];
        let out = gen_mipmap(1, 1, &src, 2, 2, 2)[0];
        assert_eq!(col_a(out), 191, "alpha should be the truncated average of 255,255,0,255");
        assert_eq!((col_r(out), col_g(out), col_b(out)), (100, 100, 100));
    }

    #[test]
    fn average_of_two_transparent_pixels_does_not_divide_by_zero() {
        let out = average_col(bitmap_col(1, 2, 3, 0), bitmap_col(4, 5, 6, 0));
        assert_eq!(out, 0);
    }

    #[test]
    fn mipmap_levels_respect_custom_cap() {
        assert_eq!(calc_mipmap_levels(256, 256, true), 4);
        assert_eq!(calc_mipmap_levels(256, 16, true), 4);
        assert_eq!(calc_mipmap_levels(256, 4, true), 2);
        assert_eq!(calc_mipmap_levels(256, 4, false), 8);
        assert_eq!(calc_mipmap_levels(2, 2, true), 1);
        assert_eq!(calc_mipmap_levels(1, 1, false), 0);
    }

    #[test]
    fn pow2_detection() {
        assert!(is_pow2(1) && is_pow2(64) && is_pow2(1 << 31));
        assert!(!is_pow2(0) && !is_pow2(48));
    }

    #[test]
    fn copy_honours_source_stride() {
        // 2x2 region out of a 4-wide source row, placed at (1, 1) of a 3x3 target.
        let src_pixels = [1, 2, 9, 9, 3, 4, 9, 9];
        let src = TexelRect {
            x: 1,
            y: 1,
            width: 2,
            height: 2,
            row_width: 4,
            pixels: &src_pixels,
        };
        let mut dst = vec![0; 9];
        copy_texture_data(&mut dst, 3, &src);
        assert_eq!(dst, vec![0, 0, 0, 0, 1, 2, 0, 3, 4]);
    }

    #[test]
    fn rgba_image_conversion_keeps_channels() {
        let mut bmp = Bitmap::new(2, 1);
        bmp.set(1, 0, bitmap_col(1, 2, 3, 4));
        let img = rgba_image(bmp.width, bmp.height, &bmp.pixels).expect("sizes match");
        assert_eq!(img.get_pixel(1, 0).0, [1, 2, 3, 4]);
        assert!(rgba_image(3, 1, &bmp.pixels).is_none());
    }
}
