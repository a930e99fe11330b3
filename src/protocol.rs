//! RFB wire messages, client and server side (RFC 6143).

use std::io::{ErrorKind as IoErrorKind, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::{Colour, Error, Result};

pub trait Message {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self>
    where
        Self: Sized;
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/* All strings in VNC are either ASCII or Latin-1, both of which
   are embedded in Unicode. */
impl Message for String {
    fn read_from<R: Read>(reader: &mut R) -> Result<String> {
        let length = reader.read_u32::<BigEndian>()?;
        let mut string = vec![0; length as usize];
        reader.read_exact(&mut string)?;
        Ok(string.iter().map(|c| *c as char).collect())
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let bytes: Vec<u8> = self.chars().map(|c| c as u8).collect();
        writer.write_u32::<BigEndian>(bytes.len() as u32)?;
        writer.write_all(&bytes)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Rfb33,
    Rfb37,
    Rfb38,
}

pub const APPLE_BANNER: &[u8; 12] = b"RFB 003.889\n";

/// Parses a version banner, clamping to the highest version we speak.
/// Servers announce anything from 3.3 to 5.0 in the wild; 3.889 is the
/// Apple Remote Desktop variant of 3.8, and in-between minors fall back
/// to the nearest lower supported version per RFC 6143 §7.1.1.
pub fn parse_version(buf: &[u8; 12]) -> Result<Version> {
    if &buf[0..4] != b"RFB " || buf[7] != b'.' || buf[11] != b'\n' {
        return Err(Error::Unexpected("protocol version"));
    }
    let digits = |s: &[u8]| -> Result<u32> {
        let mut value = 0;
        for &c in s {
            if !c.is_ascii_digit() {
                return Err(Error::Unexpected("protocol version"));
            }
            value = value * 10 + u32::from(c - b'0');
        }
        Ok(value)
    };
    let major = digits(&buf[4..7])?;
    let minor = digits(&buf[8..11])?;
    match (major, minor) {
        (3, 0..=6) => Ok(Version::Rfb33),
        (3, 7) => Ok(Version::Rfb37),
        (3, _) => Ok(Version::Rfb38),
        (4.., _) => Ok(Version::Rfb38),
        _ => Err(Error::Unexpected("protocol version")),
    }
}

impl Message for Version {
    fn read_from<R: Read>(reader: &mut R) -> Result<Version> {
        let mut buf = [0; 12];
        reader.read_exact(&mut buf)?;
        parse_version(&buf)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(match self {
            Version::Rfb33 => b"RFB 003.003\n",
            Version::Rfb37 => b"RFB 003.007\n",
            Version::Rfb38 => b"RFB 003.008\n",
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Unknown(u8),
    // core spec
    Invalid,
    None,
    VncAuthentication,
    // extensions
    AppleRemoteDesktop,
}

impl Message for SecurityType {
    fn read_from<R: Read>(reader: &mut R) -> Result<SecurityType> {
        let security_type = reader.read_u8()?;
        Ok(match security_type {
            0 => SecurityType::Invalid,
            1 => SecurityType::None,
            2 => SecurityType::VncAuthentication,
            30 => SecurityType::AppleRemoteDesktop,
            n => SecurityType::Unknown(n),
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(match self {
            SecurityType::Invalid => 0,
            SecurityType::None => 1,
            SecurityType::VncAuthentication => 2,
            SecurityType::AppleRemoteDesktop => 30,
            SecurityType::Unknown(n) => *n,
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityResult {
    Succeeded,
    Failed,
    TooManyAttempts,
}

impl Message for SecurityResult {
    fn read_from<R: Read>(reader: &mut R) -> Result<SecurityResult> {
        match reader.read_u32::<BigEndian>()? {
            0 => Ok(SecurityResult::Succeeded),
            1 => Ok(SecurityResult::Failed),
            2 => Ok(SecurityResult::TooManyAttempts),
            _ => Err(Error::Unexpected("security result")),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(match self {
            SecurityResult::Succeeded => 0,
            SecurityResult::Failed => 1,
            SecurityResult::TooManyAttempts => 2,
        })?;
        Ok(())
    }
}

/// The client half of the Apple Remote Desktop Diffie-Hellman exchange:
/// the AES-encrypted credential block followed by our public key.
pub struct AppleAuthResponse {
    pub ciphertext: [u8; 128],
    pub pub_key: Vec<u8>,
}

impl Message for AppleAuthResponse {
    fn read_from<R: Read>(_reader: &mut R) -> Result<Self> {
        Err(Error::Unexpected("apple auth response from server"))
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.ciphertext)?;
        writer.write_all(&self.pub_key)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ClientInit {
    pub shared: bool,
}

impl Message for ClientInit {
    fn read_from<R: Read>(reader: &mut R) -> Result<ClientInit> {
        Ok(ClientInit { shared: reader.read_u8()? != 0 })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(if self.shared { 1 } else { 0 })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize + 7) / 8
    }

    /// Little-endian RGBX with 4 bytes per pixel and 3 bytes of depth,
    /// the format requested when the server's own layout is unsupported.
    pub fn rgbx32() -> Self {
        PixelFormat {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// 16-bit 5-6-5 BGR, requested instead of RGBX on Apple Remote
    /// Desktop servers (protocol 3.889).
    pub fn bgr16() -> Self {
        PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 0,
            green_shift: 5,
            blue_shift: 11,
        }
    }
}

impl Message for PixelFormat {
    fn read_from<R: Read>(reader: &mut R) -> Result<PixelFormat> {
        let pixel_format = PixelFormat {
            bits_per_pixel: reader.read_u8()?,
            depth: reader.read_u8()?,
            big_endian: reader.read_u8()? != 0,
            true_colour: reader.read_u8()? != 0,
            red_max: reader.read_u16::<BigEndian>()?,
            green_max: reader.read_u16::<BigEndian>()?,
            blue_max: reader.read_u16::<BigEndian>()?,
            red_shift: reader.read_u8()?,
            green_shift: reader.read_u8()?,
            blue_shift: reader.read_u8()?,
        };
        reader.read_exact(&mut [0u8; 3])?;
        Ok(pixel_format)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.bits_per_pixel)?;
        writer.write_u8(self.depth)?;
        writer.write_u8(if self.big_endian { 1 } else { 0 })?;
        writer.write_u8(if self.true_colour { 1 } else { 0 })?;
        writer.write_u16::<BigEndian>(self.red_max)?;
        writer.write_u16::<BigEndian>(self.green_max)?;
        writer.write_u16::<BigEndian>(self.blue_max)?;
        writer.write_u8(self.red_shift)?;
        writer.write_u8(self.green_shift)?;
        writer.write_u8(self.blue_shift)?;
        writer.write_all(&[0u8; 3])?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ServerInit {
    pub framebuffer_width: u16,
    pub framebuffer_height: u16,
    pub pixel_format: PixelFormat,
    pub name_length: u32,
}

impl Message for ServerInit {
    /// The fixed 24-byte head only; the `name_length` bytes of UTF-8
    /// name follow as a separate expectation.
    fn read_from<R: Read>(reader: &mut R) -> Result<ServerInit> {
        Ok(ServerInit {
            framebuffer_width: reader.read_u16::<BigEndian>()?,
            framebuffer_height: reader.read_u16::<BigEndian>()?,
            pixel_format: PixelFormat::read_from(reader)?,
            name_length: reader.read_u32::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.framebuffer_width)?;
        writer.write_u16::<BigEndian>(self.framebuffer_height)?;
        PixelFormat::write_to(&self.pixel_format, writer)?;
        writer.write_u32::<BigEndian>(self.name_length)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct CopyRect {
    pub src_x_position: u16,
    pub src_y_position: u16,
}

impl Message for CopyRect {
    fn read_from<R: Read>(reader: &mut R) -> Result<CopyRect> {
        Ok(CopyRect {
            src_x_position: reader.read_u16::<BigEndian>()?,
            src_y_position: reader.read_u16::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.src_x_position)?;
        writer.write_u16::<BigEndian>(self.src_y_position)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Unknown(i32),
    // core spec
    Raw,
    CopyRect,
    Rre,
    CoRre,
    Hextile,
    Zrle,
    Cursor,
    DesktopSize,
    LastRect,
    // extensions
    ExtendedKeyEvent,
}

impl Message for Encoding {
    fn read_from<R: Read>(reader: &mut R) -> Result<Encoding> {
        let encoding = reader.read_i32::<BigEndian>()?;
        Ok(match encoding {
            0 => Encoding::Raw,
            1 => Encoding::CopyRect,
            2 => Encoding::Rre,
            4 => Encoding::CoRre,
            5 => Encoding::Hextile,
            16 => Encoding::Zrle,
            -239 => Encoding::Cursor,
            -223 => Encoding::DesktopSize,
            -224 => Encoding::LastRect,
            -258 => Encoding::ExtendedKeyEvent,
            n => Encoding::Unknown(n),
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(match self {
            Encoding::Raw => 0,
            Encoding::CopyRect => 1,
            Encoding::Rre => 2,
            Encoding::CoRre => 4,
            Encoding::Hextile => 5,
            Encoding::Zrle => 16,
            Encoding::Cursor => -239,
            Encoding::DesktopSize => -223,
            Encoding::LastRect => -224,
            Encoding::ExtendedKeyEvent => -258,
            Encoding::Unknown(n) => *n,
        })?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum C2S {
    // core spec
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<Encoding>),
    FramebufferUpdateRequest {
        incremental: bool,
        x_position: u16,
        y_position: u16,
        width: u16,
        height: u16,
    },
    KeyEvent {
        down: bool,
        key: u32,
    },
    PointerEvent {
        button_mask: u8,
        x_position: u16,
        y_position: u16,
    },
    CutText(String),
    // extensions
    ExtendedKeyEvent {
        down: bool,
        keysym: u32,
        keycode: u32,
    },
}

impl Message for C2S {
    fn read_from<R: Read>(reader: &mut R) -> Result<C2S> {
        let message_type = match reader.read_u8() {
            Err(ref e) if e.kind() == IoErrorKind::UnexpectedEof => {
                return Err(Error::Disconnected)
            }
            result => result?,
        };
        match message_type {
            0 => {
                reader.read_exact(&mut [0u8; 3])?;
                Ok(C2S::SetPixelFormat(PixelFormat::read_from(reader)?))
            }
            2 => {
                reader.read_exact(&mut [0u8; 1])?;
                let count = reader.read_u16::<BigEndian>()?;
                let mut encodings = Vec::new();
                for _ in 0..count {
                    encodings.push(Encoding::read_from(reader)?);
                }
                Ok(C2S::SetEncodings(encodings))
            }
            3 => Ok(C2S::FramebufferUpdateRequest {
                incremental: reader.read_u8()? != 0,
                x_position: reader.read_u16::<BigEndian>()?,
                y_position: reader.read_u16::<BigEndian>()?,
                width: reader.read_u16::<BigEndian>()?,
                height: reader.read_u16::<BigEndian>()?,
            }),
            4 => {
                let down = reader.read_u8()? != 0;
                reader.read_exact(&mut [0u8; 2])?;
                let key = reader.read_u32::<BigEndian>()?;
                Ok(C2S::KeyEvent { down, key })
            }
            5 => Ok(C2S::PointerEvent {
                button_mask: reader.read_u8()?,
                x_position: reader.read_u16::<BigEndian>()?,
                y_position: reader.read_u16::<BigEndian>()?,
            }),
            6 => {
                reader.read_exact(&mut [0u8; 3])?;
                Ok(C2S::CutText(String::read_from(reader)?))
            }
            255 => {
                let submessage_type = reader.read_u8()?;
                match submessage_type {
                    0 => {
                        let down = reader.read_u16::<BigEndian>()? != 0;
                        let keysym = reader.read_u32::<BigEndian>()?;
                        let keycode = reader.read_u32::<BigEndian>()?;
                        Ok(C2S::ExtendedKeyEvent { down, keysym, keycode })
                    }
                    _ => Err(Error::Unexpected("QEMU client submessage type")),
                }
            }
            _ => Err(Error::Unexpected("client to server message type")),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            C2S::SetPixelFormat(pixel_format) => {
                writer.write_u8(0)?;
                writer.write_all(&[0u8; 3])?;
                PixelFormat::write_to(pixel_format, writer)?;
            }
            C2S::SetEncodings(encodings) => {
                writer.write_u8(2)?;
                writer.write_all(&[0u8; 1])?;
                writer.write_u16::<BigEndian>(encodings.len() as u16)?;
                for encoding in encodings {
                    Encoding::write_to(encoding, writer)?;
                }
            }
            C2S::FramebufferUpdateRequest {
                incremental,
                x_position,
                y_position,
                width,
                height,
            } => {
                writer.write_u8(3)?;
                writer.write_u8(if *incremental { 1 } else { 0 })?;
                writer.write_u16::<BigEndian>(*x_position)?;
                writer.write_u16::<BigEndian>(*y_position)?;
                writer.write_u16::<BigEndian>(*width)?;
                writer.write_u16::<BigEndian>(*height)?;
            }
            C2S::KeyEvent { down, key } => {
                writer.write_u8(4)?;
                writer.write_u8(if *down { 1 } else { 0 })?;
                writer.write_all(&[0u8; 2])?;
                writer.write_u32::<BigEndian>(*key)?;
            }
            C2S::PointerEvent { button_mask, x_position, y_position } => {
                writer.write_u8(5)?;
                writer.write_u8(*button_mask)?;
                writer.write_u16::<BigEndian>(*x_position)?;
                writer.write_u16::<BigEndian>(*y_position)?;
            }
            C2S::CutText(text) => {
                writer.write_u8(6)?;
                writer.write_all(&[0u8; 3])?;
                String::write_to(text, writer)?;
            }
            C2S::ExtendedKeyEvent { down, keysym, keycode } => {
                writer.write_u8(255)?;
                writer.write_u8(0)?;
                writer.write_u16::<BigEndian>(if *down { 1 } else { 0 })?;
                writer.write_u32::<BigEndian>(*keysym)?;
                writer.write_u32::<BigEndian>(*keycode)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Rectangle {
    pub x_position: u16,
    pub y_position: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: Encoding,
}

impl Message for Rectangle {
    fn read_from<R: Read>(reader: &mut R) -> Result<Rectangle> {
        Ok(Rectangle {
            x_position: reader.read_u16::<BigEndian>()?,
            y_position: reader.read_u16::<BigEndian>()?,
            width: reader.read_u16::<BigEndian>()?,
            height: reader.read_u16::<BigEndian>()?,
            encoding: Encoding::read_from(reader)?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.x_position)?;
        writer.write_u16::<BigEndian>(self.y_position)?;
        writer.write_u16::<BigEndian>(self.width)?;
        writer.write_u16::<BigEndian>(self.height)?;
        Encoding::write_to(&self.encoding, writer)?;
        Ok(())
    }
}

impl Message for Colour {
    fn read_from<R: Read>(reader: &mut R) -> Result<Colour> {
        Ok(Colour {
            red: reader.read_u16::<BigEndian>()?,
            green: reader.read_u16::<BigEndian>()?,
            blue: reader.read_u16::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.red)?;
        writer.write_u16::<BigEndian>(self.green)?;
        writer.write_u16::<BigEndian>(self.blue)?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum S2C {
    // core spec
    FramebufferUpdate {
        count: u16,
        /* Vec<Rectangle> has to be read out manually */
    },
    SetColourMapEntries {
        first_colour: u16,
        colours: Vec<Colour>,
    },
    Bell,
    CutText(String),
}

impl Message for S2C {
    fn read_from<R: Read>(reader: &mut R) -> Result<S2C> {
        let message_type = match reader.read_u8() {
            Err(ref e) if e.kind() == IoErrorKind::UnexpectedEof => {
                return Err(Error::Disconnected)
            }
            result => result?,
        };
        match message_type {
            0 => {
                reader.read_exact(&mut [0u8; 1])?;
                Ok(S2C::FramebufferUpdate { count: reader.read_u16::<BigEndian>()? })
            }
            1 => {
                reader.read_exact(&mut [0u8; 1])?;
                let first_colour = reader.read_u16::<BigEndian>()?;
                let count = reader.read_u16::<BigEndian>()?;
                let mut colours = Vec::new();
                for _ in 0..count {
                    colours.push(Colour::read_from(reader)?);
                }
                Ok(S2C::SetColourMapEntries { first_colour, colours })
            }
            2 => Ok(S2C::Bell),
            3 => {
                reader.read_exact(&mut [0u8; 3])?;
                Ok(S2C::CutText(String::read_from(reader)?))
            }
            _ => Err(Error::Unexpected("server to client message type")),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            S2C::FramebufferUpdate { count } => {
                writer.write_u8(0)?;
                writer.write_all(&[0u8; 1])?;
                writer.write_u16::<BigEndian>(*count)?;
            }
            S2C::SetColourMapEntries { first_colour, colours } => {
                writer.write_u8(1)?;
                writer.write_all(&[0u8; 1])?;
                writer.write_u16::<BigEndian>(*first_colour)?;
                writer.write_u16::<BigEndian>(colours.len() as u16)?;
                for colour in colours {
                    Colour::write_to(colour, writer)?;
                }
            }
            S2C::Bell => {
                writer.write_u8(2)?;
            }
            S2C::CutText(text) => {
                writer.write_u8(3)?;
                writer.write_all(&[0u8; 3])?;
                String::write_to(text, writer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip<M: Message + std::fmt::Debug>(message: &M) -> Vec<u8> {
        let mut buffer = Vec::new();
        message.write_to(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn version_banners() {
        assert_eq!(parse_version(b"RFB 003.003\n").unwrap(), Version::Rfb33);
        assert_eq!(parse_version(b"RFB 003.005\n").unwrap(), Version::Rfb33);
        assert_eq!(parse_version(b"RFB 003.007\n").unwrap(), Version::Rfb37);
        assert_eq!(parse_version(b"RFB 003.008\n").unwrap(), Version::Rfb38);
        assert_eq!(parse_version(b"RFB 003.889\n").unwrap(), Version::Rfb38);
        assert_eq!(parse_version(b"RFB 004.000\n").unwrap(), Version::Rfb38);
        assert!(parse_version(b"XYZ 003.003\n").is_err());
    }

    #[test]
    fn pixel_format_roundtrip() {
        let format = PixelFormat::rgbx32();
        let bytes = roundtrip(&format);
        assert_eq!(bytes.len(), 16);
        let parsed = PixelFormat::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed, format);
    }

    #[test]
    fn key_event_wire_format() {
        let bytes = roundtrip(&C2S::KeyEvent { down: true, key: 0xffe3 });
        assert_eq!(bytes, [4, 1, 0, 0, 0, 0, 0xff, 0xe3]);
        match C2S::read_from(&mut Cursor::new(&bytes)).unwrap() {
            C2S::KeyEvent { down, key } => {
                assert!(down);
                assert_eq!(key, 0xffe3);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn pointer_event_wire_format() {
        let bytes = roundtrip(&C2S::PointerEvent {
            button_mask: 0x01,
            x_position: 10,
            y_position: 20,
        });
        assert_eq!(bytes, [5, 1, 0, 10, 0, 20]);
    }

    #[test]
    fn update_request_wire_format() {
        let bytes = roundtrip(&C2S::FramebufferUpdateRequest {
            incremental: true,
            x_position: 0,
            y_position: 0,
            width: 800,
            height: 600,
        });
        assert_eq!(bytes, [3, 1, 0, 0, 0, 0, 0x03, 0x20, 0x02, 0x58]);
    }

    #[test]
    fn cut_text_is_latin1() {
        let bytes = roundtrip(&C2S::CutText("caf\u{e9}".into()));
        assert_eq!(&bytes[..8], [6, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(&bytes[8..], [b'c', b'a', b'f', 0xe9]);
    }

    #[test]
    fn rectangle_header_parses_pseudo_encodings() {
        let mut bytes = Vec::new();
        Rectangle {
            x_position: 1,
            y_position: 2,
            width: 3,
            height: 4,
            encoding: Encoding::LastRect,
        }
        .write_to(&mut bytes)
        .unwrap();
        let header = Rectangle::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(header.encoding, Encoding::LastRect);
    }

    #[test]
    fn extended_key_event_roundtrip() {
        let bytes = roundtrip(&C2S::ExtendedKeyEvent {
            down: true,
            keysym: 0xff0d,
            keycode: 28,
        });
        assert_eq!(bytes.len(), 12);
        match C2S::read_from(&mut Cursor::new(&bytes)).unwrap() {
            C2S::ExtendedKeyEvent { down, keysym, keycode } => {
                assert!(down);
                assert_eq!(keysym, 0xff0d);
                assert_eq!(keycode, 28);
            }
            other => panic!("parsed {:?}", other),
        }
    }
}
