//! ZRLE rectangle decoding (RFC 6143 §7.7.6).
//!
//! All ZRLE rectangles of a session share one zlib stream; the
//! decompressor lives as long as the connection and must never be reset
//! mid-session.

use flate2::{Decompress, FlushDecompress, Status};

use crate::framebuffer::Framebuffer;
use crate::pixels;
use crate::protocol::PixelFormat;
use crate::{Error, Rect, Result};

const TILE_SIZE: u16 = 64;

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(Error::Unexpected("end of ZRLE tile data"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.pos + count > self.data.len() {
            return Err(Error::Unexpected("end of ZRLE tile data"));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Run length: a chain of 0xff bytes adds up until a terminator
    /// below 0xff; the encoded length is the sum plus one.
    fn run_length(&mut self) -> Result<usize> {
        let mut length = 0usize;
        loop {
            let byte = self.u8()?;
            length += usize::from(byte);
            if byte != 0xff {
                return Ok(length + 1);
            }
        }
    }
}

pub struct Decoder {
    stream: Decompress,
}

impl Default for Decoder {
    fn default() -> Decoder {
        Decoder::new()
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder { stream: Decompress::new(true) }
    }

    fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(4096));
        let mut pos = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(32 * 1024);
            }
            let consumed_before = self.stream.total_in();
            let produced_before = out.len();
            let status = self
                .stream
                .decompress_vec(&data[pos..], &mut out, FlushDecompress::None)
                .map_err(|_| Error::Unexpected("zlib stream"))?;
            pos += (self.stream.total_in() - consumed_before) as usize;
            if matches!(status, Status::StreamEnd) {
                break;
            }
            // done once the input is consumed and the decompressor had
            // spare output room, meaning nothing is left buffered
            if pos >= data.len() && out.len() < out.capacity() {
                break;
            }
            let no_progress =
                out.len() == produced_before && out.len() < out.capacity();
            if matches!(status, Status::BufError) && no_progress {
                return Err(Error::Unexpected("zlib stream"));
            }
        }
        Ok(out)
    }

    /// Decompresses one rectangle's worth of compressed bytes and applies
    /// its tiles to the canvas.
    pub fn decode(
        &mut self,
        format: &PixelFormat,
        rect: Rect,
        data: &[u8],
        fb: &mut Framebuffer,
    ) -> Result<()> {
        let plain = self.inflate(data)?;
        let mut reader = ByteReader::new(&plain);
        let cpixel = pixels::cpixel_len(format);

        let mut ty = rect.top;
        while ty < rect.top + rect.height {
            let th = TILE_SIZE.min(rect.top + rect.height - ty);
            let mut tx = rect.left;
            while tx < rect.left + rect.width {
                let tw = TILE_SIZE.min(rect.left + rect.width - tx);
                decode_tile(format, cpixel, &mut reader, Rect::new(tx, ty, tw, th), fb)?;
                tx += TILE_SIZE;
            }
            ty += TILE_SIZE;
        }
        if reader.remaining() > 0 {
            debug!("{} stray bytes after the last ZRLE tile", reader.remaining());
        }
        Ok(())
    }
}

fn read_cpixel(
    format: &PixelFormat,
    cpixel: usize,
    reader: &mut ByteReader<'_>,
) -> Result<[u8; 3]> {
    Ok(pixels::cpixel_to_rgb(format, reader.take(cpixel)?))
}

fn decode_tile(
    format: &PixelFormat,
    cpixel: usize,
    reader: &mut ByteReader<'_>,
    tile: Rect,
    fb: &mut Framebuffer,
) -> Result<()> {
    let subencoding = reader.u8()?;
    let palette_size = usize::from(subencoding & 0x7f);
    let pixel_count = usize::from(tile.width) * usize::from(tile.height);
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    if subencoding & 0x80 == 0 {
        match palette_size {
            0 => {
                // raw CPIXELs
                for _ in 0..pixel_count {
                    rgb.extend_from_slice(&read_cpixel(format, cpixel, reader)?);
                }
            }
            1 => {
                let colour = read_cpixel(format, cpixel, reader)?;
                fb.fill(tile, colour);
                return Ok(());
            }
            2..=16 => {
                let mut palette = Vec::with_capacity(palette_size);
                for _ in 0..palette_size {
                    palette.push(read_cpixel(format, cpixel, reader)?);
                }
                let bits = match palette_size {
                    2 => 1,
                    3..=4 => 2,
                    _ => 4,
                };
                let mut acc = 0u8;
                let mut acc_bits = 0;
                for _ in 0..pixel_count {
                    if acc_bits == 0 {
                        acc = reader.u8()?;
                        acc_bits = 8;
                    }
                    acc_bits -= bits;
                    let index = usize::from(acc >> acc_bits & ((1 << bits) - 1));
                    let colour = palette
                        .get(index)
                        .ok_or(Error::Unexpected("ZRLE palette index"))?;
                    rgb.extend_from_slice(colour);
                }
            }
            _ => return Err(Error::Unexpected("ZRLE palette size")),
        }
    } else if palette_size == 0 {
        // plain RLE of CPIXELs
        let mut emitted = 0;
        while emitted < pixel_count {
            let colour = read_cpixel(format, cpixel, reader)?;
            let run = reader.run_length()?;
            emitted += run;
            if emitted > pixel_count {
                return Err(Error::Unexpected("ZRLE pixel count"));
            }
            for _ in 0..run {
                rgb.extend_from_slice(&colour);
            }
        }
    } else {
        // palette RLE
        let mut palette = Vec::with_capacity(palette_size);
        for _ in 0..palette_size {
            palette.push(read_cpixel(format, cpixel, reader)?);
        }
        let mut emitted = 0;
        while emitted < pixel_count {
            let index = reader.u8()?;
            let run = if index & 0x80 != 0 { reader.run_length()? } else { 1 };
            let colour = palette
                .get(usize::from(index & 0x7f))
                .ok_or(Error::Unexpected("ZRLE palette index"))?;
            emitted += run;
            if emitted > pixel_count {
                return Err(Error::Unexpected("ZRLE pixel count"));
            }
            for _ in 0..run {
                rgb.extend_from_slice(colour);
            }
        }
    }

    fb.blit(tile, &rgb);
    Ok(())
}
