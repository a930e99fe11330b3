//! The client-side canvas: a mutable RGB image reconstructed from
//! streamed, partial, out-of-order rectangle updates.

use image::{DynamicImage, RgbImage, RgbaImage};

use crate::Rect;

/// A server-supplied cursor shape: RGBA pixels (alpha from the 1-bit
/// mask) and a hotspot.
#[derive(Debug, Clone)]
pub struct CursorShape {
    pub hot_x: u16,
    pub hot_y: u16,
    pub pixels: RgbaImage,
}

fn paste(dst: &mut RgbImage, src: &RgbImage, left: u32, top: u32) {
    let w = src.width().min(dst.width().saturating_sub(left));
    let h = src.height().min(dst.height().saturating_sub(top));
    for y in 0..h {
        for x in 0..w {
            dst.put_pixel(left + x, top + y, *src.get_pixel(x, y));
        }
    }
}

fn extract(src: &RgbImage, left: u32, top: u32, width: u32, height: u32) -> RgbImage {
    let mut out = RgbImage::new(width, height);
    for y in 0..height.min(src.height().saturating_sub(top)) {
        for x in 0..width.min(src.width().saturating_sub(left)) {
            out.put_pixel(x, y, *src.get_pixel(left + x, top + y));
        }
    }
    out
}

/// A value copy of the given region, clipped to the image bounds.
pub fn crop_region(image: &RgbImage, rect: Rect) -> RgbImage {
    let x = u32::from(rect.left).min(image.width());
    let y = u32::from(rect.top).min(image.height());
    let w = u32::from(rect.width).min(image.width() - x);
    let h = u32::from(rect.height).min(image.height() - y);
    extract(image, x, y, w, h)
}

#[derive(Debug)]
pub struct Framebuffer {
    canvas: RgbImage,
    cursor: Option<CursorShape>,
    draw_cursor: bool,
    updated: bool,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16) -> Framebuffer {
        Framebuffer {
            canvas: RgbImage::new(u32::from(width), u32::from(height)),
            cursor: None,
            draw_cursor: false,
            updated: false,
        }
    }

    pub fn width(&self) -> u16 {
        self.canvas.width() as u16
    }

    pub fn height(&self) -> u16 {
        self.canvas.height() as u16
    }

    /// Whether any pixel data has arrived since the canvas was created.
    pub fn has_update(&self) -> bool {
        self.updated
    }

    pub fn set_draw_cursor(&mut self, enabled: bool) {
        self.draw_cursor = enabled;
    }

    pub fn set_cursor(&mut self, cursor: Option<CursorShape>) {
        self.cursor = cursor;
    }

    /// Grows the canvas so `rect` fits, preserving existing contents at
    /// the origin and black-filling new area. Updates never shrink it.
    fn ensure_bounds(&mut self, rect: &Rect) {
        let need_w = u32::from(rect.left) + u32::from(rect.width);
        let need_h = u32::from(rect.top) + u32::from(rect.height);
        if need_w > self.canvas.width() || need_h > self.canvas.height() {
            let mut grown = RgbImage::new(
                need_w.max(self.canvas.width()),
                need_h.max(self.canvas.height()),
            );
            paste(&mut grown, &self.canvas, 0, 0);
            self.canvas = grown;
        }
    }

    /// Writes `width * height` RGB pixels at the rectangle position.
    pub fn blit(&mut self, rect: Rect, rgb: &[u8]) {
        if rect.is_empty() {
            return;
        }
        self.ensure_bounds(&rect);
        self.updated = true;
        let mut offset = 0;
        for y in 0..u32::from(rect.height) {
            for x in 0..u32::from(rect.width) {
                let pixel = image::Rgb([rgb[offset], rgb[offset + 1], rgb[offset + 2]]);
                self.canvas
                    .put_pixel(u32::from(rect.left) + x, u32::from(rect.top) + y, pixel);
                offset += 3;
            }
        }
    }

    pub fn fill(&mut self, rect: Rect, rgb: [u8; 3]) {
        if rect.is_empty() {
            return;
        }
        self.ensure_bounds(&rect);
        self.updated = true;
        for y in 0..u32::from(rect.height) {
            for x in 0..u32::from(rect.width) {
                self.canvas.put_pixel(
                    u32::from(rect.left) + x,
                    u32::from(rect.top) + y,
                    image::Rgb(rgb),
                );
            }
        }
    }

    /// CopyRect blit. Source and destination may overlap; the source is
    /// snapshotted first so the copy order cannot corrupt it.
    pub fn copy_rect(&mut self, src_x: u16, src_y: u16, dst: Rect) {
        if dst.is_empty() {
            return;
        }
        let src = Rect::new(src_x, src_y, dst.width, dst.height);
        self.ensure_bounds(&src);
        self.ensure_bounds(&dst);
        self.updated = true;
        let source = extract(
            &self.canvas,
            u32::from(src_x),
            u32::from(src_y),
            u32::from(dst.width),
            u32::from(dst.height),
        );
        paste(&mut self.canvas, &source, u32::from(dst.left), u32::from(dst.top));
    }

    /// Explicit desktop resize: contents are pasted at the origin and
    /// cropped; new area is black.
    pub fn resize(&mut self, width: u16, height: u16) {
        let mut resized = RgbImage::new(u32::from(width), u32::from(height));
        paste(&mut resized, &self.canvas, 0, 0);
        self.canvas = resized;
    }

    /// The canvas as delivered by the server, with the cursor composited
    /// on top when enabled. Compositing never touches the canvas itself.
    pub fn snapshot(&self, pointer: Option<(u16, u16)>) -> RgbImage {
        let mut view = self.canvas.clone();
        if !self.draw_cursor {
            return view;
        }
        let (cursor, (px, py)) = match (&self.cursor, pointer) {
            (Some(cursor), Some(position)) => (cursor, position),
            _ => return view,
        };
        let origin_x = i64::from(px) - i64::from(cursor.hot_x);
        let origin_y = i64::from(py) - i64::from(cursor.hot_y);
        for (cx, cy, pixel) in cursor.pixels.enumerate_pixels() {
            if pixel[3] == 0 {
                continue;
            }
            let x = origin_x + i64::from(cx);
            let y = origin_y + i64::from(cy);
            if x < 0 || y < 0 || x >= i64::from(view.width()) || y >= i64::from(view.height())
            {
                continue;
            }
            view.put_pixel(x as u32, y as u32, image::Rgb([pixel[0], pixel[1], pixel[2]]));
        }
        view
    }
}

/// 256 bins per channel over packed samples, PIL-histogram style: bin
/// `c * 256 + v` counts value `v` in channel `c`.
pub fn histogram(samples: &[u8], channels: usize) -> Vec<u32> {
    let mut bins = vec![0u32; 256 * channels];
    for (index, &sample) in samples.iter().enumerate() {
        bins[(index % channels) * 256 + usize::from(sample)] += 1;
    }
    bins
}

pub fn image_histogram(image: &DynamicImage) -> Vec<u32> {
    let channels = usize::from(image.color().channel_count());
    histogram(image.as_bytes(), channels)
}

/// Root-mean-square difference between two histograms, or `None` when the
/// channel counts differ (such images are never deemed a match).
pub fn histogram_rms(a: &[u32], b: &[u32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let diff = f64::from(x) - f64::from(y);
            diff * diff
        })
        .sum();
    Some((sum / a.len() as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red() -> [u8; 3] {
        [255, 0, 0]
    }

    #[test]
    fn blit_places_pixels() {
        let mut fb = Framebuffer::new(4, 4);
        fb.blit(Rect::new(0, 0, 2, 1), &[255, 0, 0, 0, 255, 0]);
        let shot = fb.snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(shot.get_pixel(1, 0).0, [0, 255, 0]);
        assert!(fb.has_update());
    }

    #[test]
    fn out_of_bounds_update_grows_canvas() {
        let mut fb = Framebuffer::new(4, 4);
        fb.fill(Rect::new(3, 3, 4, 2), red());
        assert_eq!(fb.width(), 7);
        assert_eq!(fb.height(), 5);
        let shot = fb.snapshot(None);
        assert_eq!(shot.get_pixel(6, 4).0, [255, 0, 0]);
        // existing area is preserved, new area is black
        assert_eq!(shot.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn copy_rect_moves_pixels() {
        let mut fb = Framebuffer::new(8, 8);
        fb.fill(Rect::new(0, 0, 1, 1), red());
        fb.copy_rect(0, 0, Rect::new(5, 5, 1, 1));
        assert_eq!(fb.snapshot(None).get_pixel(5, 5).0, [255, 0, 0]);
    }

    #[test]
    fn copy_rect_overlapping_is_order_safe() {
        let mut fb = Framebuffer::new(8, 1);
        fb.blit(Rect::new(0, 0, 3, 1), &[1, 1, 1, 2, 2, 2, 3, 3, 3]);
        // shift right by one; a naive forward copy would smear pixel 0
        fb.copy_rect(0, 0, Rect::new(1, 0, 3, 1));
        let shot = fb.snapshot(None);
        assert_eq!(shot.get_pixel(1, 0).0, [1, 1, 1]);
        assert_eq!(shot.get_pixel(2, 0).0, [2, 2, 2]);
        assert_eq!(shot.get_pixel(3, 0).0, [3, 3, 3]);
    }

    #[test]
    fn resize_shrinks_at_origin() {
        let mut fb = Framebuffer::new(4, 4);
        fb.fill(Rect::new(0, 0, 4, 4), red());
        fb.resize(2, 2);
        assert_eq!(fb.width(), 2);
        assert_eq!(fb.snapshot(None).get_pixel(1, 1).0, [255, 0, 0]);
        fb.resize(3, 3);
        assert_eq!(fb.snapshot(None).get_pixel(2, 2).0, [0, 0, 0]);
    }

    #[test]
    fn cursor_composites_only_into_snapshot() {
        let mut fb = Framebuffer::new(4, 4);
        fb.set_draw_cursor(true);
        let mut pixels = RgbaImage::new(2, 1);
        pixels.put_pixel(0, 0, image::Rgba([9, 9, 9, 255]));
        pixels.put_pixel(1, 0, image::Rgba([7, 7, 7, 0])); // masked out
        fb.set_cursor(Some(CursorShape { hot_x: 0, hot_y: 0, pixels }));
        let shot = fb.snapshot(Some((2, 2)));
        assert_eq!(shot.get_pixel(2, 2).0, [9, 9, 9]);
        assert_eq!(shot.get_pixel(3, 2).0, [0, 0, 0]);
        // without a pointer position nothing is composited
        assert_eq!(fb.snapshot(None).get_pixel(2, 2).0, [0, 0, 0]);
    }

    #[test]
    fn crop_clips_to_bounds() {
        let mut fb = Framebuffer::new(4, 4);
        fb.fill(Rect::new(2, 2, 2, 2), red());
        let region = crop_region(&fb.snapshot(None), Rect::new(2, 2, 10, 10));
        assert_eq!(region.dimensions(), (2, 2));
        assert_eq!(region.get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn histogram_counts_per_channel() {
        let bins = histogram(&[255, 0, 0, 255, 0, 0], 3);
        assert_eq!(bins.len(), 768);
        assert_eq!(bins[255], 2); // red bin 255
        assert_eq!(bins[256], 2); // green bin 0
        assert_eq!(bins[512], 2); // blue bin 0
    }

    #[test]
    fn rms_of_identical_histograms_is_zero() {
        let bins = histogram(&[1, 2, 3, 4, 5, 6], 3);
        assert_eq!(histogram_rms(&bins, &bins), Some(0.0));
    }

    #[test]
    fn rms_rejects_mismatched_channel_counts() {
        let rgb = histogram(&[0, 0, 0], 3);
        let rgba = histogram(&[0, 0, 0, 0], 4);
        assert_eq!(histogram_rms(&rgb, &rgba), None);
    }
}
