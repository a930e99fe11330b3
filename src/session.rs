//! The RFB client state machine.
//!
//! The session is push-based: the driver feeds whatever bytes arrived on
//! the wire, the framer slices them into the blocks each state expects,
//! and decoded rectangles mutate the owned framebuffer. Outbound
//! handshake bytes accumulate in an output buffer the driver flushes
//! after each feed. The same machine runs the live client and, in
//! passive mode, the recording proxy's shadow decoder.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt};
use image::RgbaImage;

use crate::framebuffer::{CursorShape, Framebuffer};
use crate::framer::Framer;
use crate::pixels;
use crate::protocol::{
    self, ClientInit, Encoding, Message, PixelFormat, SecurityResult, SecurityType, Version,
    C2S,
};
use crate::security;
use crate::zrle;
use crate::{Error, Rect, Result};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub shared: bool,
    /// Request PseudoCursor and overlay the shape onto captures.
    pub cursor: bool,
    /// Request PseudoDesktopSize.
    pub resize: bool,
    pub last_rect: bool,
    pub qemu_extended_key: bool,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            username: None,
            password: None,
            shared: true,
            cursor: false,
            resize: true,
            last_rect: true,
            qemu_extended_key: true,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake finished; the message loop is running.
    Connected,
    /// All rectangles of one FramebufferUpdate have been applied.
    Commit(Vec<Rect>),
    Bell,
    Clipboard(String),
    Resize(u16, u16),
}

/// Handshake facts observed on the client→server leg of the recording
/// proxy, consumed by the passive shadow session to frame the server's
/// replies. Written strictly before the bytes they govern are forwarded.
#[derive(Debug, Default)]
pub struct HandshakeLink {
    version: Mutex<Option<Version>>,
    security: Mutex<Option<SecurityType>>,
    format: Mutex<Option<PixelFormat>>,
}

impl HandshakeLink {
    pub fn set_version(&self, version: Version) {
        *self.version.lock().unwrap() = Some(version);
    }

    pub fn version(&self) -> Option<Version> {
        *self.version.lock().unwrap()
    }

    pub fn set_security(&self, security: SecurityType) {
        *self.security.lock().unwrap() = Some(security);
    }

    pub fn security(&self) -> Option<SecurityType> {
        *self.security.lock().unwrap()
    }

    /// The observed client reissued SetPixelFormat; the shadow decoder
    /// picks it up before its next feed.
    pub fn set_client_format(&self, format: PixelFormat) {
        *self.format.lock().unwrap() = Some(format);
    }

    pub fn take_client_format(&self) -> Option<PixelFormat> {
        self.format.lock().unwrap().take()
    }
}

enum Role {
    Active,
    Passive(Arc<HandshakeLink>),
}

#[derive(Debug)]
struct HextileState {
    rect: Rect,
    tx: u16,
    ty: u16,
    bg: Option<[u8; 3]>,
    fg: Option<[u8; 3]>,
    phase: HextilePhase,
}

#[derive(Debug, Clone, Copy)]
enum HextilePhase {
    Subencoding,
    Raw,
    Extras { subencoding: u8 },
    Subrects { count: u8, coloured: bool },
}

impl HextileState {
    fn tile(&self) -> Rect {
        let right = u32::from(self.rect.left) + u32::from(self.rect.width);
        let bottom = u32::from(self.rect.top) + u32::from(self.rect.height);
        let tw = 16u32.min(right - u32::from(self.tx)) as u16;
        let th = 16u32.min(bottom - u32::from(self.ty)) as u16;
        Rect::new(self.tx, self.ty, tw, th)
    }

    /// Moves to the next tile; `false` once the rectangle is done.
    fn advance(&mut self) -> bool {
        let next_x = u32::from(self.tx) + 16;
        if next_x < u32::from(self.rect.left) + u32::from(self.rect.width) {
            self.tx = next_x as u16;
        } else {
            self.tx = self.rect.left;
            let next_y = u32::from(self.ty) + 16;
            if next_y >= u32::from(self.rect.top) + u32::from(self.rect.height) {
                return false;
            }
            self.ty = next_y as u16;
        }
        self.phase = HextilePhase::Subencoding;
        true
    }
}

#[derive(Debug)]
enum State {
    Version,
    AwaitVersionChoice,
    SecurityTypeCount,
    SecurityList { count: u8 },
    AwaitSecurityChoice,
    SecurityType33,
    ReasonLength { auth: bool },
    Reason { auth: bool, length: usize },
    VncChallenge,
    DhParams,
    DhKeys { generator: u16, key_length: usize },
    SecurityResult,
    ServerInit,
    ServerName { length: usize },
    MessageId,
    UpdateHeader,
    RectHeader,
    RawData { rect: Rect },
    CopyRectData { rect: Rect },
    RreHeader { rect: Rect },
    RreSubrects { rect: Rect, count: u32 },
    CorreHeader { rect: Rect },
    CorreSubrects { rect: Rect, count: u32 },
    Hextile(HextileState),
    ZrleLength { rect: Rect },
    ZrleData { rect: Rect, length: usize },
    CursorData { rect: Rect },
    ColourMapHeader,
    ColourMapEntries { count: u16 },
    CutTextHeader,
    CutTextData { length: usize },
    Closed,
}

pub struct Session {
    framer: Framer,
    state: State,
    role: Role,
    config: SessionConfig,
    version: Version,
    apple: bool,
    format: PixelFormat,
    fb: Framebuffer,
    zrle: zrle::Decoder,
    name: String,
    rects_remaining: u16,
    committed: Vec<Rect>,
    extended_keys: bool,
    output: Vec<u8>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Session {
        Session::with_role(config, Role::Active)
    }

    /// A shadow session for the recording proxy: decodes the
    /// server→client byte stream but never speaks.
    pub fn observe(link: Arc<HandshakeLink>) -> Session {
        Session::with_role(SessionConfig::default(), Role::Passive(link))
    }

    fn with_role(config: SessionConfig, role: Role) -> Session {
        let mut fb = Framebuffer::new(0, 0);
        fb.set_draw_cursor(config.cursor);
        Session {
            framer: Framer::new(),
            state: State::Version,
            role,
            config,
            version: Version::Rfb38,
            apple: false,
            format: PixelFormat::rgbx32(),
            fb,
            zrle: zrle::Decoder::new(),
            name: String::new(),
            rects_remaining: 0,
            committed: Vec::new(),
            extended_keys: false,
            output: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// The recording proxy relays the observed client's SetPixelFormat
    /// here so the shadow decoder keeps framing server rectangles
    /// correctly.
    pub fn set_format(&mut self, format: PixelFormat) {
        self.format = format;
    }

    pub fn size(&self) -> (u16, u16) {
        (self.fb.width(), self.fb.height())
    }

    pub fn extended_keys(&self) -> bool {
        self.extended_keys
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.fb
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn active(&self) -> bool {
        matches!(self.role, Role::Active)
    }

    fn send(&mut self, message: &C2S) -> Result<()> {
        if self.active() {
            debug!("-> {:?}", message);
            message.write_to(&mut self.output)?;
        }
        Ok(())
    }

    /// Feeds inbound bytes and runs the state machine as far as they
    /// allow. An empty feed just re-drains, which the proxy uses after
    /// updating the handshake link.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.framer.extend(data);
        loop {
            let needed = match self.expectation()? {
                Some(needed) => needed,
                None => return Ok(()),
            };
            if needed == 0 {
                self.step(Vec::new())?;
                continue;
            }
            self.framer.expect(needed);
            match self.framer.next_block() {
                Some(block) => self.step(block)?,
                None => return Ok(()),
            }
        }
    }

    fn bypp(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// Resolves meta states that wait on facts from the handshake link,
    /// then reports how many bytes the current state needs. `None`
    /// means no progress is possible yet (or the session is closed).
    fn expectation(&mut self) -> Result<Option<usize>> {
        loop {
            match &self.state {
                State::AwaitVersionChoice => {
                    let link = match &self.role {
                        Role::Passive(link) => link.clone(),
                        Role::Active => return Err(Error::Unexpected("state")),
                    };
                    match link.version() {
                        Some(version) => {
                            self.version = version;
                            self.state = if version >= Version::Rfb37 {
                                State::SecurityTypeCount
                            } else {
                                State::SecurityType33
                            };
                        }
                        None => return Ok(None),
                    }
                }
                State::AwaitSecurityChoice => {
                    let link = match &self.role {
                        Role::Passive(link) => link.clone(),
                        Role::Active => return Err(Error::Unexpected("state")),
                    };
                    match link.security() {
                        Some(security) => self.state = self.after_selection(security)?,
                        None => return Ok(None),
                    }
                }
                _ => break,
            }
        }

        let bypp = self.bypp();
        let needed = match &self.state {
            State::Version => 12,
            State::SecurityTypeCount => 1,
            State::SecurityList { count } => usize::from(*count),
            State::SecurityType33 => 4,
            State::ReasonLength { .. } => 4,
            State::Reason { length, .. } => *length,
            State::VncChallenge => 16,
            State::DhParams => 4,
            State::DhKeys { key_length, .. } => key_length * 2,
            State::SecurityResult => 4,
            State::ServerInit => 24,
            State::ServerName { length } => *length,
            State::MessageId => 1,
            State::UpdateHeader => 3,
            State::RectHeader => 12,
            State::RawData { rect } => {
                usize::from(rect.width) * usize::from(rect.height) * bypp
            }
            State::CopyRectData { .. } => 4,
            State::RreHeader { .. } | State::CorreHeader { .. } => 4 + bypp,
            State::RreSubrects { count, .. } => *count as usize * (8 + bypp),
            State::CorreSubrects { count, .. } => *count as usize * (4 + bypp),
            State::Hextile(hextile) => {
                let tile = hextile.tile();
                let pixels = usize::from(tile.width) * usize::from(tile.height);
                match hextile.phase {
                    HextilePhase::Subencoding => 1,
                    HextilePhase::Raw => pixels * bypp,
                    HextilePhase::Extras { subencoding } => {
                        let mut bytes = 0;
                        if subencoding & 2 != 0 {
                            bytes += bypp;
                        }
                        if subencoding & 4 != 0 {
                            bytes += bypp;
                        }
                        if subencoding & 8 != 0 {
                            bytes += 1;
                        }
                        bytes
                    }
                    HextilePhase::Subrects { count, coloured } => {
                        usize::from(count) * if coloured { bypp + 2 } else { 2 }
                    }
                }
            }
            State::ZrleLength { .. } => 4,
            State::ZrleData { length, .. } => *length,
            State::CursorData { rect } => {
                usize::from(rect.width) * usize::from(rect.height) * bypp
                    + (usize::from(rect.width) + 7) / 8 * usize::from(rect.height)
            }
            State::ColourMapHeader => 5,
            State::ColourMapEntries { count } => usize::from(*count) * 6,
            State::CutTextHeader => 7,
            State::CutTextData { length } => *length,
            State::Closed => return Ok(None),
            State::AwaitVersionChoice | State::AwaitSecurityChoice => unreachable!(),
        };
        Ok(Some(needed))
    }

    fn step(&mut self, block: Vec<u8>) -> Result<()> {
        let state = std::mem::replace(&mut self.state, State::Closed);
        let result = self.dispatch(state, &block);
        if result.is_err() {
            self.state = State::Closed;
        }
        result
    }

    fn dispatch(&mut self, state: State, block: &[u8]) -> Result<()> {
        match state {
            State::Version => self.on_version(block),
            State::SecurityTypeCount => {
                if block[0] == 0 {
                    self.state = State::ReasonLength { auth: false };
                } else {
                    self.state = State::SecurityList { count: block[0] };
                }
                Ok(())
            }
            State::SecurityList { .. } => self.on_security_list(block),
            State::SecurityType33 => self.on_security_type33(block),
            State::ReasonLength { auth } => {
                let length = Cursor::new(block).read_u32::<BigEndian>()? as usize;
                self.state = State::Reason { auth, length };
                Ok(())
            }
            State::Reason { auth, .. } => {
                let reason: String = block.iter().map(|&c| c as char).collect();
                debug!("<- reason {:?}", reason);
                Err(if auth {
                    Error::AuthenticationFailure(reason)
                } else {
                    Error::Server(reason)
                })
            }
            State::VncChallenge => self.on_vnc_challenge(block),
            State::DhParams => {
                let mut cursor = Cursor::new(block);
                let generator = cursor.read_u16::<BigEndian>()?;
                let key_length = cursor.read_u16::<BigEndian>()? as usize;
                if key_length == 0 {
                    return Err(Error::Unexpected("Diffie-Hellman key length"));
                }
                self.state = State::DhKeys { generator, key_length };
                Ok(())
            }
            State::DhKeys { generator, key_length } => {
                self.on_dh_keys(generator, key_length, block)
            }
            State::SecurityResult => self.on_security_result(block),
            State::ServerInit => self.on_server_init(block),
            State::ServerName { .. } => {
                self.name = block.iter().map(|&c| c as char).collect();
                info!("connected to {:?}", self.name);
                self.events.push(SessionEvent::Connected);
                self.state = State::MessageId;
                Ok(())
            }
            State::MessageId => self.on_message_id(block[0]),
            State::UpdateHeader => {
                let count = Cursor::new(&block[1..]).read_u16::<BigEndian>()?;
                trace!("<- FramebufferUpdate x{}", count);
                self.rects_remaining = count;
                self.committed.clear();
                if count == 0 {
                    self.finish_update();
                } else {
                    self.state = State::RectHeader;
                }
                Ok(())
            }
            State::RectHeader => self.on_rect_header(block),
            State::RawData { rect } => {
                let rgb = pixels::to_rgb_buffer(&self.format, block);
                self.fb.blit(rect, &rgb);
                self.finish_rect(rect, true);
                Ok(())
            }
            State::CopyRectData { rect } => {
                let copy = protocol::CopyRect::read_from(&mut Cursor::new(block))?;
                self.fb.copy_rect(copy.src_x_position, copy.src_y_position, rect);
                self.finish_rect(rect, true);
                Ok(())
            }
            State::RreHeader { rect } => self.on_rre_header(rect, block, false),
            State::CorreHeader { rect } => self.on_rre_header(rect, block, true),
            State::RreSubrects { rect, .. } => self.on_rre_subrects(rect, block, false),
            State::CorreSubrects { rect, .. } => self.on_rre_subrects(rect, block, true),
            State::Hextile(hextile) => self.on_hextile(hextile, block),
            State::ZrleLength { rect } => {
                let length = Cursor::new(block).read_u32::<BigEndian>()? as usize;
                self.state = State::ZrleData { rect, length };
                Ok(())
            }
            State::ZrleData { rect, .. } => {
                if !rect.is_empty() {
                    let mut decoder = std::mem::take(&mut self.zrle);
                    let result = decoder.decode(&self.format, rect, block, &mut self.fb);
                    self.zrle = decoder;
                    result?;
                }
                self.finish_rect(rect, true);
                Ok(())
            }
            State::CursorData { rect } => self.on_cursor(rect, block),
            State::ColourMapHeader => {
                let count = Cursor::new(&block[3..]).read_u16::<BigEndian>()?;
                if count == 0 {
                    self.state = State::MessageId;
                } else {
                    self.state = State::ColourMapEntries { count };
                }
                Ok(())
            }
            State::ColourMapEntries { count } => {
                // colour maps are unused: the client renegotiates to
                // true colour at ServerInit
                debug!("<- SetColourMapEntries x{} (ignored)", count);
                self.state = State::MessageId;
                Ok(())
            }
            State::CutTextHeader => {
                let length = Cursor::new(&block[3..]).read_u32::<BigEndian>()? as usize;
                self.state = State::CutTextData { length };
                Ok(())
            }
            State::CutTextData { .. } => {
                let text: String = block.iter().map(|&c| c as char).collect();
                self.events.push(SessionEvent::Clipboard(text));
                self.state = State::MessageId;
                Ok(())
            }
            State::Closed => Err(Error::Disconnected),
            State::AwaitVersionChoice | State::AwaitSecurityChoice => {
                Err(Error::Unexpected("state"))
            }
        }
    }

    fn on_version(&mut self, block: &[u8]) -> Result<()> {
        let mut banner = [0u8; 12];
        banner.copy_from_slice(block);
        let version = protocol::parse_version(&banner)?;
        self.apple = &banner == protocol::APPLE_BANNER;
        debug!("<- Version::{:?} (apple: {})", version, self.apple);
        if self.active() {
            self.version = version;
            debug!("-> Version::{:?}", version);
            version.write_to(&mut self.output)?;
            self.state = if version >= Version::Rfb37 {
                State::SecurityTypeCount
            } else {
                State::SecurityType33
            };
        } else {
            self.state = State::AwaitVersionChoice;
        }
        Ok(())
    }

    fn on_security_list(&mut self, block: &[u8]) -> Result<()> {
        let offered: Vec<SecurityType> = block
            .iter()
            .map(|&t| match t {
                0 => SecurityType::Invalid,
                1 => SecurityType::None,
                2 => SecurityType::VncAuthentication,
                30 => SecurityType::AppleRemoteDesktop,
                n => SecurityType::Unknown(n),
            })
            .collect();
        debug!("<- SecurityTypes {:?}", offered);

        if !self.active() {
            self.state = State::AwaitSecurityChoice;
            return Ok(());
        }

        // strongest mutually supported type, the way every client since
        // the reference implementation has ranked them
        let chosen = [
            SecurityType::AppleRemoteDesktop,
            SecurityType::VncAuthentication,
            SecurityType::None,
        ]
        .into_iter()
        .find(|t| offered.contains(t))
        .ok_or(Error::AuthenticationUnavailable)?;

        debug!("-> SecurityType::{:?}", chosen);
        chosen.write_to(&mut self.output)?;
        self.state = self.after_selection(chosen)?;
        Ok(())
    }

    /// The state that follows the client's security selection.
    fn after_selection(&mut self, chosen: SecurityType) -> Result<State> {
        Ok(match chosen {
            SecurityType::None => {
                if self.version == Version::Rfb38 {
                    State::SecurityResult
                } else {
                    self.client_init()?
                }
            }
            SecurityType::VncAuthentication => State::VncChallenge,
            SecurityType::AppleRemoteDesktop => State::DhParams,
            _ => return Err(Error::Unexpected("security type")),
        })
    }

    fn on_security_type33(&mut self, block: &[u8]) -> Result<()> {
        let dictated = Cursor::new(block).read_u32::<BigEndian>()?;
        debug!("<- SecurityType(3.3) {}", dictated);
        self.state = match dictated {
            0 => State::ReasonLength { auth: false },
            1 => self.client_init()?,
            2 => State::VncChallenge,
            _ => return Err(Error::Unexpected("security type")),
        };
        Ok(())
    }

    fn on_vnc_challenge(&mut self, block: &[u8]) -> Result<()> {
        if self.active() {
            let password = self.config.password.clone().ok_or_else(|| {
                Error::AuthenticationFailure("password required but not provided".into())
            })?;
            let mut challenge = [0u8; 16];
            challenge.copy_from_slice(block);
            let response = security::vnc_auth_response(&password, &challenge)?;
            debug!("-> VncAuthResponse");
            self.output.extend_from_slice(&response);
        }
        self.state = State::SecurityResult;
        Ok(())
    }

    fn on_dh_keys(&mut self, generator: u16, key_length: usize, block: &[u8]) -> Result<()> {
        if self.active() {
            let username = self.config.username.clone().unwrap_or_default();
            let password = self.config.password.clone().ok_or_else(|| {
                Error::AuthenticationFailure("password required but not provided".into())
            })?;
            let (modulus, server_key) = block.split_at(key_length);
            let (ciphertext, pub_key) =
                security::ard_auth_response(&username, &password, generator, modulus, server_key)?;
            debug!("-> AppleAuthResponse");
            protocol::AppleAuthResponse { ciphertext, pub_key }.write_to(&mut self.output)?;
        }
        self.state = State::SecurityResult;
        Ok(())
    }

    fn on_security_result(&mut self, block: &[u8]) -> Result<()> {
        let result = SecurityResult::read_from(&mut Cursor::new(block))?;
        debug!("<- SecurityResult::{:?}", result);
        match result {
            SecurityResult::Succeeded => {
                self.state = self.client_init()?;
                Ok(())
            }
            SecurityResult::Failed | SecurityResult::TooManyAttempts => {
                if self.version == Version::Rfb38 {
                    self.state = State::ReasonLength { auth: true };
                    Ok(())
                } else if result == SecurityResult::TooManyAttempts {
                    Err(Error::AuthenticationFailure("too many attempts".into()))
                } else {
                    Err(Error::AuthenticationFailure("authentication failed".into()))
                }
            }
        }
    }

    fn client_init(&mut self) -> Result<State> {
        if self.active() {
            let client_init = ClientInit { shared: self.config.shared };
            debug!("-> {:?}", client_init);
            client_init.write_to(&mut self.output)?;
        }
        Ok(State::ServerInit)
    }

    fn on_server_init(&mut self, block: &[u8]) -> Result<()> {
        let server_init = protocol::ServerInit::read_from(&mut Cursor::new(block))?;
        debug!("<- {:?}", server_init);
        self.fb.resize(server_init.framebuffer_width, server_init.framebuffer_height);
        self.format = server_init.pixel_format;

        if self.active() {
            if !pixels::is_supported(&self.format) {
                self.format = pixels::fallback(self.apple);
                self.send(&C2S::SetPixelFormat(self.format))?;
            }
            let mut encodings = vec![
                Encoding::Zrle,
                Encoding::Hextile,
                Encoding::CoRre,
                Encoding::Rre,
                Encoding::CopyRect,
                Encoding::Raw,
            ];
            if self.config.cursor {
                encodings.push(Encoding::Cursor);
            }
            if self.config.resize {
                encodings.push(Encoding::DesktopSize);
            }
            if self.config.last_rect {
                encodings.push(Encoding::LastRect);
            }
            if self.config.qemu_extended_key {
                encodings.push(Encoding::ExtendedKeyEvent);
            }
            self.send(&C2S::SetEncodings(encodings))?;
        }

        self.state = State::ServerName { length: server_init.name_length as usize };
        Ok(())
    }

    fn on_message_id(&mut self, id: u8) -> Result<()> {
        self.state = match id {
            0 => State::UpdateHeader,
            1 => State::ColourMapHeader,
            2 => {
                debug!("<- Bell");
                self.events.push(SessionEvent::Bell);
                State::MessageId
            }
            3 => State::CutTextHeader,
            _ => return Err(Error::Unexpected("server to client message type")),
        };
        Ok(())
    }

    fn on_rect_header(&mut self, block: &[u8]) -> Result<()> {
        let header = protocol::Rectangle::read_from(&mut Cursor::new(block))?;
        trace!("<- {:?}", header);
        self.rects_remaining = self.rects_remaining.saturating_sub(1);
        let rect =
            Rect::new(header.x_position, header.y_position, header.width, header.height);
        match header.encoding {
            Encoding::Raw => {
                if rect.is_empty() {
                    self.finish_rect(rect, true);
                } else {
                    self.state = State::RawData { rect };
                }
            }
            Encoding::CopyRect => self.state = State::CopyRectData { rect },
            Encoding::Rre => self.state = State::RreHeader { rect },
            Encoding::CoRre => self.state = State::CorreHeader { rect },
            Encoding::Hextile => {
                if rect.is_empty() {
                    self.finish_rect(rect, true);
                } else {
                    self.state = State::Hextile(HextileState {
                        rect,
                        tx: rect.left,
                        ty: rect.top,
                        bg: None,
                        fg: None,
                        phase: HextilePhase::Subencoding,
                    });
                }
            }
            Encoding::Zrle => self.state = State::ZrleLength { rect },
            Encoding::Cursor => {
                if rect.is_empty() {
                    self.fb.set_cursor(None);
                    self.finish_rect(rect, true);
                } else {
                    self.state = State::CursorData { rect };
                }
            }
            Encoding::DesktopSize => {
                debug!("<- DesktopSize {}x{}", rect.width, rect.height);
                self.fb.resize(rect.width, rect.height);
                self.events.push(SessionEvent::Resize(rect.width, rect.height));
                self.finish_rect(rect, true);
            }
            Encoding::LastRect => {
                self.rects_remaining = 0;
                self.finish_update();
            }
            Encoding::ExtendedKeyEvent => {
                debug!("<- QEMU extended key events enabled");
                self.extended_keys = true;
                self.finish_rect(rect, false);
            }
            Encoding::Unknown(n) => {
                error!("unknown encoding {}", n);
                return Err(Error::Unexpected("encoding"));
            }
        }
        Ok(())
    }

    fn on_rre_header(&mut self, rect: Rect, block: &[u8], compact: bool) -> Result<()> {
        let count = Cursor::new(&block[..4]).read_u32::<BigEndian>()?;
        let bg = pixels::to_rgb(&self.format, &block[4..]);
        self.fb.fill(rect, bg);
        if count == 0 {
            self.finish_rect(rect, true);
        } else if compact {
            self.state = State::CorreSubrects { rect, count };
        } else {
            self.state = State::RreSubrects { rect, count };
        }
        Ok(())
    }

    fn on_rre_subrects(&mut self, rect: Rect, block: &[u8], compact: bool) -> Result<()> {
        let bypp = self.bypp();
        let stride = bypp + if compact { 4 } else { 8 };
        for chunk in block.chunks_exact(stride) {
            let colour = pixels::to_rgb(&self.format, &chunk[..bypp]);
            let mut cursor = Cursor::new(&chunk[bypp..]);
            let (sx, sy, sw, sh) = if compact {
                (
                    u16::from(cursor.read_u8()?),
                    u16::from(cursor.read_u8()?),
                    u16::from(cursor.read_u8()?),
                    u16::from(cursor.read_u8()?),
                )
            } else {
                (
                    cursor.read_u16::<BigEndian>()?,
                    cursor.read_u16::<BigEndian>()?,
                    cursor.read_u16::<BigEndian>()?,
                    cursor.read_u16::<BigEndian>()?,
                )
            };
            self.fb.fill(
                Rect::new(rect.left.saturating_add(sx), rect.top.saturating_add(sy), sw, sh),
                colour,
            );
        }
        self.finish_rect(rect, true);
        Ok(())
    }

    fn on_hextile(&mut self, mut hextile: HextileState, block: &[u8]) -> Result<()> {
        let tile = hextile.tile();
        let mut advance = true;
        match hextile.phase {
            HextilePhase::Subencoding => {
                let subencoding = block[0];
                if subencoding & 1 != 0 {
                    hextile.phase = HextilePhase::Raw;
                    advance = false;
                } else if subencoding & 0b1110 != 0 {
                    hextile.phase = HextilePhase::Extras { subencoding };
                    advance = false;
                } else {
                    let bg =
                        hextile.bg.ok_or(Error::Unexpected("hextile background"))?;
                    self.fb.fill(tile, bg);
                }
            }
            HextilePhase::Raw => {
                let rgb = pixels::to_rgb_buffer(&self.format, block);
                self.fb.blit(tile, &rgb);
            }
            HextilePhase::Extras { subencoding } => {
                let bypp = self.bypp();
                let mut pos = 0;
                if subencoding & 2 != 0 {
                    hextile.bg = Some(pixels::to_rgb(&self.format, &block[..bypp]));
                    pos += bypp;
                }
                let bg = hextile.bg.ok_or(Error::Unexpected("hextile background"))?;
                self.fb.fill(tile, bg);
                if subencoding & 4 != 0 {
                    hextile.fg =
                        Some(pixels::to_rgb(&self.format, &block[pos..pos + bypp]));
                    pos += bypp;
                }
                if subencoding & 8 != 0 {
                    let count = block[pos];
                    if count > 0 {
                        hextile.phase = HextilePhase::Subrects {
                            count,
                            coloured: subencoding & 16 != 0,
                        };
                        advance = false;
                    }
                }
            }
            HextilePhase::Subrects { coloured, .. } => {
                let bypp = self.bypp();
                let stride = if coloured { bypp + 2 } else { 2 };
                for chunk in block.chunks_exact(stride) {
                    let colour = if coloured {
                        let colour = pixels::to_rgb(&self.format, &chunk[..bypp]);
                        hextile.fg = Some(colour);
                        colour
                    } else {
                        hextile.fg.ok_or(Error::Unexpected("hextile foreground"))?
                    };
                    let xy = chunk[stride - 2];
                    let wh = chunk[stride - 1];
                    self.fb.fill(
                        Rect::new(
                            tile.left.saturating_add(u16::from(xy >> 4)),
                            tile.top.saturating_add(u16::from(xy & 0xf)),
                            u16::from(wh >> 4) + 1,
                            u16::from(wh & 0xf) + 1,
                        ),
                        colour,
                    );
                }
            }
        }

        if advance {
            if hextile.advance() {
                self.state = State::Hextile(hextile);
            } else {
                self.finish_rect(hextile.rect, true);
            }
        } else {
            self.state = State::Hextile(hextile);
        }
        Ok(())
    }

    fn on_cursor(&mut self, rect: Rect, block: &[u8]) -> Result<()> {
        let bypp = self.bypp();
        let split = usize::from(rect.width) * usize::from(rect.height) * bypp;
        let (image, mask) = block.split_at(split);
        let stride = (usize::from(rect.width) + 7) / 8;
        let mut pixels_out = RgbaImage::new(u32::from(rect.width), u32::from(rect.height));
        for y in 0..usize::from(rect.height) {
            for x in 0..usize::from(rect.width) {
                let rgb = pixels::to_rgb(
                    &self.format,
                    &image[(y * usize::from(rect.width) + x) * bypp..][..bypp],
                );
                let visible = mask[y * stride + x / 8] >> (7 - x % 8) & 1 != 0;
                pixels_out.put_pixel(
                    x as u32,
                    y as u32,
                    image::Rgba([rgb[0], rgb[1], rgb[2], if visible { 255 } else { 0 }]),
                );
            }
        }
        self.fb.set_cursor(Some(CursorShape {
            hot_x: rect.left,
            hot_y: rect.top,
            pixels: pixels_out,
        }));
        self.finish_rect(rect, true);
        Ok(())
    }

    fn finish_rect(&mut self, rect: Rect, record: bool) {
        if record {
            self.committed.push(rect);
        }
        if self.rects_remaining > 0 {
            self.state = State::RectHeader;
        } else {
            self.finish_update();
        }
    }

    fn finish_update(&mut self) {
        let rects = std::mem::take(&mut self.committed);
        self.events.push(SessionEvent::Commit(rects));
        self.state = State::MessageId;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn server_init_bytes(width: u16, height: u16, format: PixelFormat, name: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        protocol::ServerInit {
            framebuffer_width: width,
            framebuffer_height: height,
            pixel_format: format,
            name_length: name.len() as u32,
        }
        .write_to(&mut bytes)
        .unwrap();
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    fn connected(config: SessionConfig) -> Session {
        let mut session = Session::new(config);
        session.feed(b"RFB 003.008\n").unwrap();
        assert_eq!(session.take_output(), b"RFB 003.008\n");
        session.feed(&[1, 1]).unwrap(); // one type offered: None
        assert_eq!(session.take_output(), [1]);
        session.feed(&[0, 0, 0, 0]).unwrap(); // SecurityResult ok
        assert_eq!(session.take_output(), [1]); // ClientInit, shared
        session
            .feed(&server_init_bytes(8, 8, PixelFormat::rgbx32(), "test"))
            .unwrap();
        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::Connected));
        session.take_output(); // SetEncodings
        session
    }

    fn update(rects: &[(Rect, Encoding, Vec<u8>)]) -> Vec<u8> {
        let mut bytes = vec![0, 0];
        bytes.write_u16::<BigEndian>(rects.len() as u16).unwrap();
        for (rect, encoding, payload) in rects {
            protocol::Rectangle {
                x_position: rect.left,
                y_position: rect.top,
                width: rect.width,
                height: rect.height,
                encoding: *encoding,
            }
            .write_to(&mut bytes)
            .unwrap();
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn version_37_handshake_skips_security_result() {
        let mut session = Session::new(SessionConfig::default());
        session.feed(b"RFB 003.007\n").unwrap();
        assert_eq!(session.take_output(), b"RFB 003.007\n");
        session.feed(&[1, 1]).unwrap();
        // selection and ClientInit back to back: 3.7 + None has no result
        assert_eq!(session.take_output(), [1, 1]);
    }

    #[test]
    fn version_33_server_dictates_auth() {
        let mut session = Session::new(SessionConfig::default());
        session.feed(b"RFB 003.003\n").unwrap();
        assert_eq!(session.take_output(), b"RFB 003.003\n");
        session.feed(&[0, 0, 0, 1]).unwrap(); // dictated: None
        assert_eq!(session.take_output(), [1]); // ClientInit only
    }

    #[test]
    fn refusal_reason_is_reported() {
        let mut session = Session::new(SessionConfig::default());
        session.feed(b"RFB 003.008\n").unwrap();
        let mut bytes = vec![0]; // zero security types
        bytes.extend_from_slice(&[0, 0, 0, 4]);
        bytes.extend_from_slice(b"nope");
        match session.feed(&bytes) {
            Err(Error::Server(reason)) => assert_eq!(reason, "nope"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn vnc_auth_sends_des_response() {
        let config = SessionConfig {
            password: Some("password".into()),
            ..SessionConfig::default()
        };
        let mut session = Session::new(config);
        session.feed(b"RFB 003.008\n").unwrap();
        session.take_output();
        session.feed(&[1, 2]).unwrap(); // VNC authentication offered
        assert_eq!(session.take_output(), [2]);
        let challenge = [0u8; 16];
        session.feed(&challenge).unwrap();
        let expected = security::vnc_auth_response("password", &challenge).unwrap();
        assert_eq!(session.take_output(), expected);
        session.feed(&[0, 0, 0, 0]).unwrap();
        assert_eq!(session.take_output(), [1]); // ClientInit
    }

    #[test]
    fn vnc_auth_failure_reason() {
        let config = SessionConfig {
            password: Some("pw".into()),
            ..SessionConfig::default()
        };
        let mut session = Session::new(config);
        session.feed(b"RFB 003.008\n").unwrap();
        session.feed(&[1, 2]).unwrap();
        session.feed(&[7u8; 16]).unwrap();
        let mut bytes = vec![0, 0, 0, 1]; // failed
        bytes.extend_from_slice(&[0, 0, 0, 3]);
        bytes.extend_from_slice(b"bad");
        match session.feed(&bytes) {
            Err(Error::AuthenticationFailure(reason)) => assert_eq!(reason, "bad"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn missing_password_fails_cleanly() {
        let mut session = Session::new(SessionConfig::default());
        session.feed(b"RFB 003.008\n").unwrap();
        session.feed(&[1, 2]).unwrap();
        assert!(matches!(
            session.feed(&[0u8; 16]),
            Err(Error::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn unsupported_server_format_is_renegotiated() {
        let mut session = Session::new(SessionConfig::default());
        session.feed(b"RFB 003.008\n").unwrap();
        session.feed(&[1, 1]).unwrap();
        session.feed(&[0, 0, 0, 0]).unwrap();
        session.take_output();
        let colour_mapped =
            PixelFormat { true_colour: false, ..PixelFormat::rgbx32() };
        session.feed(&server_init_bytes(4, 4, colour_mapped, "x")).unwrap();
        assert_eq!(session.format(), PixelFormat::rgbx32());
        // first outbound message is SetPixelFormat
        assert_eq!(session.take_output()[0], 0);
    }

    #[test]
    fn raw_rectangle_pixels() {
        let mut session = connected(SessionConfig::default());
        let payload = vec![0xff, 0, 0, 0, 0, 0xff, 0, 0];
        session
            .feed(&update(&[(Rect::new(0, 0, 2, 1), Encoding::Raw, payload)]))
            .unwrap();
        let events = session.drain_events();
        assert!(matches!(&events[0], SessionEvent::Commit(rects) if rects.len() == 1));
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(shot.get_pixel(1, 0).0, [0, 255, 0]);
    }

    #[test]
    fn copy_rect_rectangle() {
        let mut session = connected(SessionConfig::default());
        let red = vec![0xff, 0, 0, 0];
        session
            .feed(&update(&[(Rect::new(0, 0, 1, 1), Encoding::Raw, red)]))
            .unwrap();
        session
            .feed(&update(&[(
                Rect::new(5, 5, 1, 1),
                Encoding::CopyRect,
                vec![0, 0, 0, 0],
            )]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(5, 5).0, [255, 0, 0]);
    }

    #[test]
    fn rre_rectangle() {
        let mut session = connected(SessionConfig::default());
        let mut payload = vec![0, 0, 0, 1]; // one subrect
        payload.extend_from_slice(&[0, 0, 0xff, 0]); // bg blue
        payload.extend_from_slice(&[0xff, 0, 0, 0]); // subrect red
        payload.extend_from_slice(&[0, 1, 0, 0, 0, 1, 0, 1]); // at (1,0) 1x1
        session
            .feed(&update(&[(Rect::new(0, 0, 2, 1), Encoding::Rre, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(shot.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn corre_rectangle_uses_byte_coordinates() {
        let mut session = connected(SessionConfig::default());
        let mut payload = vec![0, 0, 0, 1];
        payload.extend_from_slice(&[0, 0, 0xff, 0]); // bg blue
        payload.extend_from_slice(&[0xff, 0, 0, 0]); // subrect red
        payload.extend_from_slice(&[1, 0, 1, 1]); // (1,0) 1x1, single bytes
        session
            .feed(&update(&[(Rect::new(0, 0, 2, 1), Encoding::CoRre, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(shot.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn hextile_background_carries_between_tiles() {
        let mut session = connected(SessionConfig::default());
        let mut payload = vec![2]; // tile 1: background specified
        payload.extend_from_slice(&[0xff, 0, 0, 0]); // red
        payload.push(0); // tile 2: nothing specified, carried bg
        session
            .feed(&update(&[(Rect::new(0, 0, 32, 8), Encoding::Hextile, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(shot.get_pixel(31, 7).0, [255, 0, 0]);
    }

    #[test]
    fn hextile_subrects() {
        let mut session = connected(SessionConfig::default());
        // bg + fg + 1 uncoloured subrect at (1,0) 2x1
        let mut payload = vec![2 | 4 | 8];
        payload.extend_from_slice(&[0, 0, 0xff, 0]); // bg blue
        payload.extend_from_slice(&[0, 0xff, 0, 0]); // fg green
        payload.push(1);
        payload.push(0x10); // x=1 y=0
        payload.push(0x10); // w=2 h=1
        session
            .feed(&update(&[(Rect::new(0, 0, 4, 2), Encoding::Hextile, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(shot.get_pixel(1, 0).0, [0, 255, 0]);
        assert_eq!(shot.get_pixel(2, 0).0, [0, 255, 0]);
        assert_eq!(shot.get_pixel(3, 0).0, [0, 0, 255]);
    }

    #[test]
    fn hextile_raw_tile() {
        let mut session = connected(SessionConfig::default());
        let mut payload = vec![1]; // raw
        payload.extend_from_slice(&[0xff, 0, 0, 0, 0, 0xff, 0, 0]);
        session
            .feed(&update(&[(Rect::new(0, 0, 2, 1), Encoding::Hextile, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(shot.get_pixel(1, 0).0, [0, 255, 0]);
    }

    #[test]
    fn last_rect_ends_update_early() {
        let mut session = connected(SessionConfig::default());
        // header promises five rectangles, LastRect arrives first
        let mut bytes = vec![0, 0, 0, 5];
        protocol::Rectangle {
            x_position: 0,
            y_position: 0,
            width: 0,
            height: 0,
            encoding: Encoding::LastRect,
        }
        .write_to(&mut bytes)
        .unwrap();
        bytes.push(2); // Bell parses fine right after
        session.feed(&bytes).unwrap();
        let events = session.drain_events();
        assert!(matches!(&events[0], SessionEvent::Commit(rects) if rects.is_empty()));
        assert!(matches!(events[1], SessionEvent::Bell));
    }

    #[test]
    fn desktop_size_resizes_canvas() {
        let mut session = connected(SessionConfig::default());
        session
            .feed(&update(&[(Rect::new(0, 0, 16, 12), Encoding::DesktopSize, vec![])]))
            .unwrap();
        assert_eq!(session.size(), (16, 12));
        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::Resize(16, 12)));
    }

    #[test]
    fn rectangle_beyond_bounds_grows_canvas() {
        let mut session = connected(SessionConfig::default());
        let payload = vec![0xff, 0, 0, 0];
        session
            .feed(&update(&[(Rect::new(9, 9, 1, 1), Encoding::Raw, payload)]))
            .unwrap();
        assert_eq!(session.size(), (10, 10));
    }

    #[test]
    fn cursor_shape_is_stored() {
        let config = SessionConfig { cursor: true, ..SessionConfig::default() };
        let mut session = connected(config);
        let mut payload = vec![9, 9, 9, 0, 7, 7, 7, 0]; // two pixels
        payload.push(0b1000_0000); // only the first is visible
        session
            .feed(&update(&[(Rect::new(0, 0, 2, 1), Encoding::Cursor, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(Some((3, 3)));
        assert_eq!(shot.get_pixel(3, 3).0, [9, 9, 9]);
        assert_eq!(shot.get_pixel(4, 3).0, [0, 0, 0]);
    }

    #[test]
    fn qemu_extended_key_rect_is_not_committed() {
        let mut session = connected(SessionConfig::default());
        session
            .feed(&update(&[(Rect::new(0, 0, 0, 0), Encoding::ExtendedKeyEvent, vec![])]))
            .unwrap();
        assert!(session.extended_keys());
        let events = session.drain_events();
        assert!(matches!(&events[0], SessionEvent::Commit(rects) if rects.is_empty()));
    }

    #[test]
    fn unknown_encoding_is_fatal() {
        let mut session = connected(SessionConfig::default());
        let result = session.feed(&update(&[(
            Rect::new(0, 0, 1, 1),
            Encoding::Unknown(7),
            vec![],
        )]));
        assert!(matches!(result, Err(Error::Unexpected("encoding"))));
    }

    #[test]
    fn unknown_message_id_is_fatal() {
        let mut session = connected(SessionConfig::default());
        assert!(session.feed(&[42]).is_err());
    }

    #[test]
    fn bell_and_cut_text() {
        let mut session = connected(SessionConfig::default());
        let mut bytes = Vec::new();
        protocol::S2C::Bell.write_to(&mut bytes).unwrap();
        protocol::S2C::CutText("hi".into()).write_to(&mut bytes).unwrap();
        session.feed(&bytes).unwrap();
        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::Bell));
        assert!(matches!(&events[1], SessionEvent::Clipboard(text) if text == "hi"));
    }

    #[test]
    fn colour_map_entries_are_skipped() {
        let mut session = connected(SessionConfig::default());
        let mut bytes = Vec::new();
        protocol::S2C::SetColourMapEntries {
            first_colour: 0,
            colours: vec![
                crate::Colour { red: 1, green: 2, blue: 3 },
                crate::Colour { red: 4, green: 5, blue: 6 },
            ],
        }
        .write_to(&mut bytes)
        .unwrap();
        protocol::S2C::Bell.write_to(&mut bytes).unwrap();
        session.feed(&bytes).unwrap();
        // framing held: the bell right after the entries still parses
        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::Bell));
    }

    #[test]
    fn zero_rectangle_update_still_commits() {
        let mut session = connected(SessionConfig::default());
        session.feed(&[0, 0, 0, 0]).unwrap();
        let events = session.drain_events();
        assert!(matches!(&events[0], SessionEvent::Commit(rects) if rects.is_empty()));
    }

    #[test]
    fn zrle_rectangle_through_session() {
        use flate2::{Compress, Compression, FlushCompress};
        let mut session = connected(SessionConfig::default());
        let mut tile = vec![0x01u8];
        tile.extend_from_slice(&[0xff, 0x00, 0x00]); // solid red cpixel
        let mut compressed = Vec::with_capacity(tile.len() + 1024);
        Compress::new(Compression::default(), true)
            .compress_vec(&tile, &mut compressed, FlushCompress::Sync)
            .unwrap();
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(compressed.len() as u32).unwrap();
        payload.extend_from_slice(&compressed);
        session
            .feed(&update(&[(Rect::new(0, 0, 4, 4), Encoding::Zrle, payload)]))
            .unwrap();
        let shot = session.framebuffer().snapshot(None);
        assert_eq!(shot.get_pixel(3, 3).0, [255, 0, 0]);
    }

    #[test]
    fn passive_session_waits_for_link() {
        let link = Arc::new(HandshakeLink::default());
        let mut session = Session::observe(link.clone());
        session.feed(b"RFB 003.008\n").unwrap();
        // the server offers one type but the client's choice is unknown
        session.feed(&[1, 1]).unwrap();
        session.feed(&[0, 0, 0, 0]).unwrap(); // SecurityResult, buffered
        assert!(session.drain_events().is_empty());

        link.set_version(Version::Rfb38);
        link.set_security(SecurityType::None);
        session.feed(&server_init_bytes(4, 4, PixelFormat::rgbx32(), "shadow")).unwrap();
        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::Connected));
        assert!(session.take_output().is_empty());
        assert_eq!(session.size(), (4, 4));
    }

    #[test]
    fn apple_banner_negotiates_bgr16() {
        let mut session = Session::new(SessionConfig::default());
        session.feed(b"RFB 003.889\n").unwrap();
        assert_eq!(session.take_output(), b"RFB 003.008\n");
        session.feed(&[1, 1]).unwrap();
        session.feed(&[0, 0, 0, 0]).unwrap();
        session.take_output();
        let odd = PixelFormat { true_colour: false, ..PixelFormat::rgbx32() };
        session.feed(&server_init_bytes(4, 4, odd, "mac")).unwrap();
        assert_eq!(session.format(), PixelFormat::bgr16());
    }
}
