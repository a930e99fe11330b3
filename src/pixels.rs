//! Server pixel layouts and conversion to the canonical RGB canvas.

use crate::protocol::PixelFormat;

/// Whether the announced format is one of the layouts decoded natively
/// (RGB24, RGBX32, BGR24, BGRX32, BGR16). Anything else makes the client
/// renegotiate with SetPixelFormat.
pub fn is_supported(format: &PixelFormat) -> bool {
    if !format.true_colour {
        return false;
    }
    let shifts = (format.red_shift, format.green_shift, format.blue_shift);
    let maxes = (format.red_max, format.green_max, format.blue_max);
    match (format.bits_per_pixel, format.depth) {
        (24, 24) | (32, 24) => {
            maxes == (255, 255, 255) && (shifts == (0, 8, 16) || shifts == (16, 8, 0))
        }
        (16, 16) => maxes == (31, 63, 31) && shifts == (0, 5, 11),
        _ => false,
    }
}

/// The format to request when the server's own layout is unsupported.
pub fn fallback(apple: bool) -> PixelFormat {
    if apple {
        PixelFormat::bgr16()
    } else {
        PixelFormat::rgbx32()
    }
}

fn raw_value(format: &PixelFormat, bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    if format.big_endian {
        for &b in bytes {
            value = value << 8 | u32::from(b);
        }
    } else {
        for &b in bytes.iter().rev() {
            value = value << 8 | u32::from(b);
        }
    }
    value
}

fn scale(channel: u32, max: u16) -> u8 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return channel as u8;
    }
    ((channel * 255 + u32::from(max) / 2) / u32::from(max)) as u8
}

/// Converts one wire pixel of `format.bytes_per_pixel()` bytes to RGB.
pub fn to_rgb(format: &PixelFormat, bytes: &[u8]) -> [u8; 3] {
    let value = raw_value(format, bytes);
    [
        scale(value >> format.red_shift & u32::from(format.red_max), format.red_max),
        scale(value >> format.green_shift & u32::from(format.green_max), format.green_max),
        scale(value >> format.blue_shift & u32::from(format.blue_max), format.blue_max),
    ]
}

/// Converts a run of wire pixels into packed RGB.
pub fn to_rgb_buffer(format: &PixelFormat, data: &[u8]) -> Vec<u8> {
    let bypp = format.bytes_per_pixel();
    let mut rgb = Vec::with_capacity(data.len() / bypp * 3);
    for pixel in data.chunks_exact(bypp) {
        rgb.extend_from_slice(&to_rgb(format, pixel));
    }
    rgb
}

/// ZRLE "compact pixel" width: 32bpp formats with an unused byte send
/// only the 3 significant bytes.
pub fn cpixel_len(format: &PixelFormat) -> usize {
    let fits = u32::from(format.red_max) << format.red_shift
        | u32::from(format.green_max) << format.green_shift
        | u32::from(format.blue_max) << format.blue_shift;
    if format.bits_per_pixel == 32 && format.depth <= 24 && fits <= 0x00ff_ffff {
        3
    } else {
        format.bytes_per_pixel()
    }
}

/// Converts a CPIXEL to RGB. A 3-byte CPIXEL is the pixel value with the
/// padding byte dropped; the significant bytes keep their wire order.
pub fn cpixel_to_rgb(format: &PixelFormat, bytes: &[u8]) -> [u8; 3] {
    if bytes.len() == format.bytes_per_pixel() {
        return to_rgb(format, bytes);
    }
    let value = raw_value(format, bytes);
    [
        scale(value >> format.red_shift & u32::from(format.red_max), format.red_max),
        scale(value >> format.green_shift & u32::from(format.green_max), format.green_max),
        scale(value >> format.blue_shift & u32::from(format.blue_max), format.blue_max),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgbx32_channels() {
        let format = PixelFormat::rgbx32();
        assert!(is_supported(&format));
        assert_eq!(to_rgb(&format, &[0xff, 0x00, 0x00, 0x00]), [255, 0, 0]);
        assert_eq!(to_rgb(&format, &[0x00, 0xff, 0x00, 0x00]), [0, 255, 0]);
        assert_eq!(to_rgb(&format, &[0x00, 0x00, 0xff, 0x00]), [0, 0, 255]);
    }

    #[test]
    fn bgrx32_channels() {
        let format = PixelFormat { red_shift: 16, blue_shift: 0, ..PixelFormat::rgbx32() };
        assert!(is_supported(&format));
        assert_eq!(to_rgb(&format, &[0x00, 0x00, 0xff, 0x00]), [255, 0, 0]);
    }

    #[test]
    fn bgr16_scales_to_full_range() {
        let format = PixelFormat::bgr16();
        assert!(is_supported(&format));
        // blue occupies the top five bits: 0xf800 little-endian
        assert_eq!(to_rgb(&format, &[0x00, 0xf8]), [0, 0, 255]);
        assert_eq!(to_rgb(&format, &[0x1f, 0x00]), [255, 0, 0]);
        assert_eq!(to_rgb(&format, &[0xe0, 0x07]), [0, 255, 0]);
    }

    #[test]
    fn colour_mapped_is_not_supported() {
        let format = PixelFormat { true_colour: false, ..PixelFormat::rgbx32() };
        assert!(!is_supported(&format));
    }

    #[test]
    fn big_endian_value_assembly() {
        let format = PixelFormat { big_endian: true, ..PixelFormat::rgbx32() };
        assert_eq!(to_rgb(&format, &[0x00, 0x00, 0x00, 0xff]), [255, 0, 0]);
    }

    #[test]
    fn cpixel_width() {
        assert_eq!(cpixel_len(&PixelFormat::rgbx32()), 3);
        assert_eq!(cpixel_len(&PixelFormat::bgr16()), 2);
        let deep = PixelFormat { depth: 32, red_shift: 24, ..PixelFormat::rgbx32() };
        assert_eq!(cpixel_len(&deep), 4);
    }

    #[test]
    fn cpixel_conversion_matches_pixel() {
        let format = PixelFormat::rgbx32();
        assert_eq!(cpixel_to_rgb(&format, &[0x10, 0x20, 0x30]), [0x10, 0x20, 0x30]);
    }
}
