//! The recording man-in-the-middle proxy.
//!
//! Bytes are spliced between the two sockets unmodified. Two observers
//! watch the stream: a miniature RFB server parses client messages into
//! script lines, and a passive [`Session`] decodes server frames into a
//! private canvas for capture events. Losing an observer (a message we
//! cannot frame) never interrupts forwarding.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use byteorder::{BigEndian, ReadBytesExt};

use crate::client::Stream;
use crate::command::ServerAddr;
use crate::framer::Framer;
use crate::keysym;
use crate::protocol::{self, Message, PixelFormat, SecurityType, Version};
use crate::session::{HandshakeLink, Session, SessionEvent};
use crate::{Error, Result};

/// Where recorded scripts go: standard output, one file, or one
/// timestamped `.vdo` file per client connection.
#[derive(Debug, Clone)]
pub enum RecorderOutput {
    Stdout,
    File(PathBuf),
    Directory(PathBuf),
}

impl RecorderOutput {
    pub fn parse(spec: &str) -> RecorderOutput {
        if spec == "-" {
            RecorderOutput::Stdout
        } else if Path::new(spec).is_dir() {
            RecorderOutput::Directory(PathBuf::from(spec))
        } else {
            RecorderOutput::File(PathBuf::from(spec))
        }
    }
}

/// The script sink. One line per input event, prefixed with the seconds
/// elapsed since the previous event; timing fidelity comes from the
/// wall clock, not the protocol.
pub struct Recorder {
    out: Box<dyn Write + Send>,
    last_event: Instant,
    mouse: Option<(u16, u16)>,
}

impl Recorder {
    pub fn create(output: &RecorderOutput) -> Result<Recorder> {
        let out: Box<dyn Write + Send> = match output {
            RecorderOutput::Stdout => Box::new(io::stdout()),
            RecorderOutput::File(path) => Box::new(
                fs::OpenOptions::new().create(true).append(true).open(path)?,
            ),
            RecorderOutput::Directory(dir) => {
                let path = dir.join(format!(
                    "{}.vdo",
                    chrono::Local::now().format("%y%m%d-%H%M%S")
                ));
                info!("recording to {}", path.display());
                Box::new(fs::File::create(path)?)
            }
        };
        Ok(Recorder::to_writer(out))
    }

    pub fn to_writer(out: Box<dyn Write + Send>) -> Recorder {
        Recorder { out, last_event: Instant::now(), mouse: None }
    }

    fn elapsed(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_event).as_secs_f64();
        self.last_event = now;
        elapsed
    }

    fn emit(&mut self, line: String) {
        if let Err(error) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("recorder write failed: {}", error);
        }
    }

    pub fn key_event(&mut self, key: u32, down: bool) {
        let name = keysym::reverse(key).unwrap_or_else(|| format!("0x{:x}", key));
        let line = format!(
            "pause {:.4} {} {}",
            self.elapsed(),
            if down { "keydown" } else { "keyup" },
            name
        );
        self.emit(line);
    }

    pub fn pointer_event(&mut self, x: u16, y: u16, buttons: u8) {
        let mut line = format!("pause {:.4}", self.elapsed());
        if self.mouse != Some((x, y)) {
            line.push_str(&format!(" move {} {}", x, y));
            self.mouse = Some((x, y));
        }
        for button in 1..=8 {
            if buttons & (1 << (button - 1)) != 0 {
                line.push_str(&format!(" click {}", button));
            }
        }
        self.emit(line);
    }

    pub fn capture(&mut self, path: &Path) {
        self.emit(format!("expect {}", path.display()));
    }
}

/// An input event recovered from the client byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Key { key: u32, down: bool },
    Pointer { x: u16, y: u16, buttons: u8 },
}

#[derive(Debug, Clone, Copy)]
enum ParseState {
    Version,
    Security,
    AuthResponse,
    Init,
    MessageHead,
    MessageBody { id: u8 },
    EncodingsTail { count: u16 },
    CutTextTail { length: usize },
    QemuSubtype,
    QemuKeyTail,
}

/// A miniature RFB server: replays just enough of the handshake to
/// know each client message's framing, and decodes the input events.
pub struct ClientParser {
    framer: Framer,
    state: ParseState,
    link: Arc<HandshakeLink>,
    password_required: bool,
}

impl ClientParser {
    pub fn new(link: Arc<HandshakeLink>, password_required: bool) -> ClientParser {
        ClientParser {
            framer: Framer::new(),
            state: ParseState::Version,
            link,
            password_required,
        }
    }

    fn expected(&self) -> Result<usize> {
        Ok(match &self.state {
            ParseState::Version => 12,
            ParseState::Security => 1,
            ParseState::AuthResponse => 16,
            ParseState::Init => 1,
            ParseState::MessageHead => 1,
            ParseState::MessageBody { id } => match id {
                0 => 19, // SetPixelFormat
                2 => 3,  // SetEncodings head
                3 => 9,  // FramebufferUpdateRequest
                4 => 7,  // KeyEvent
                5 => 5,  // PointerEvent
                6 => 7,  // ClientCutText head
                _ => return Err(Error::Unexpected("client to server message type")),
            },
            ParseState::EncodingsTail { count } => usize::from(*count) * 4,
            ParseState::CutTextTail { length } => *length,
            ParseState::QemuSubtype => 1,
            ParseState::QemuKeyTail => 10,
        })
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ClientEvent>> {
        self.framer.extend(data);
        let mut events = Vec::new();
        loop {
            let needed = self.expected()?;
            if needed == 0 {
                self.step(&[], &mut events)?;
                continue;
            }
            self.framer.expect(needed);
            match self.framer.next_block() {
                Some(block) => self.step(&block, &mut events)?,
                None => return Ok(events),
            }
        }
    }

    fn step(&mut self, block: &[u8], events: &mut Vec<ClientEvent>) -> Result<()> {
        match self.state {
            ParseState::Version => {
                let mut banner = [0u8; 12];
                banner.copy_from_slice(block);
                let version = protocol::parse_version(&banner)?;
                debug!("client speaks {:?}", version);
                self.link.set_version(version);
                self.state = if version >= Version::Rfb37 {
                    ParseState::Security
                } else if self.password_required {
                    ParseState::AuthResponse
                } else {
                    ParseState::Init
                };
            }
            ParseState::Security => {
                let selection = match block[0] {
                    1 => SecurityType::None,
                    2 => SecurityType::VncAuthentication,
                    30 => SecurityType::AppleRemoteDesktop,
                    n => SecurityType::Unknown(n),
                };
                debug!("client selected {:?}", selection);
                self.link.set_security(selection);
                self.state = match selection {
                    SecurityType::None => ParseState::Init,
                    SecurityType::VncAuthentication => ParseState::AuthResponse,
                    // the response framing of anything else is unknown
                    _ => return Err(Error::Unexpected("security type")),
                };
            }
            ParseState::AuthResponse => self.state = ParseState::Init,
            ParseState::Init => {
                debug!("client shares: {}", block[0]);
                self.state = ParseState::MessageHead;
            }
            ParseState::MessageHead => {
                self.state = match block[0] {
                    255 => ParseState::QemuSubtype,
                    id => ParseState::MessageBody { id },
                };
                // fail early on ids we cannot frame
                self.expected()?;
            }
            ParseState::MessageBody { id } => {
                self.state = ParseState::MessageHead;
                match id {
                    0 => {
                        let format =
                            PixelFormat::read_from(&mut io::Cursor::new(&block[3..]))?;
                        debug!("client set {:?}", format);
                        self.link.set_client_format(format);
                    }
                    2 => {
                        let count =
                            io::Cursor::new(&block[1..]).read_u16::<BigEndian>()?;
                        if count > 0 {
                            self.state = ParseState::EncodingsTail { count };
                        }
                    }
                    3 => (),
                    4 => {
                        let down = block[0] != 0;
                        let key = io::Cursor::new(&block[3..]).read_u32::<BigEndian>()?;
                        events.push(ClientEvent::Key { key, down });
                    }
                    5 => {
                        let buttons = block[0];
                        let mut cursor = io::Cursor::new(&block[1..]);
                        let x = cursor.read_u16::<BigEndian>()?;
                        let y = cursor.read_u16::<BigEndian>()?;
                        events.push(ClientEvent::Pointer { x, y, buttons });
                    }
                    6 => {
                        let length =
                            io::Cursor::new(&block[3..]).read_u32::<BigEndian>()? as usize;
                        if length > 0 {
                            self.state = ParseState::CutTextTail { length };
                        }
                    }
                    _ => return Err(Error::Unexpected("client to server message type")),
                }
            }
            ParseState::EncodingsTail { .. } | ParseState::CutTextTail { .. } => {
                self.state = ParseState::MessageHead;
            }
            ParseState::QemuSubtype => match block[0] {
                0 => self.state = ParseState::QemuKeyTail,
                _ => return Err(Error::Unexpected("QEMU client submessage type")),
            },
            ParseState::QemuKeyTail => {
                let mut cursor = io::Cursor::new(block);
                let down = cursor.read_u16::<BigEndian>()? != 0;
                let keysym = cursor.read_u32::<BigEndian>()?;
                let _keycode = cursor.read_u32::<BigEndian>()?;
                events.push(ClientEvent::Key { key: keysym, down });
                self.state = ParseState::MessageHead;
            }
        }
        Ok(())
    }
}

/// Requests that the next framebuffer commit be saved and logged as an
/// `expect` step.
#[derive(Clone)]
pub struct CaptureHandle(Arc<Mutex<Option<PathBuf>>>);

impl CaptureHandle {
    pub fn request(&self, path: impl Into<PathBuf>) {
        *self.0.lock().unwrap() = Some(path.into());
    }
}

pub struct Proxy {
    capture: CaptureHandle,
    upstream: JoinHandle<()>,
    downstream: JoinHandle<()>,
}

impl Proxy {
    /// Splices `client` and `server` and starts both observers.
    pub fn start(
        client: TcpStream,
        server: Stream,
        recorder: Recorder,
        password_required: bool,
    ) -> Result<Proxy> {
        let link = Arc::new(HandshakeLink::default());
        let recorder = Arc::new(Mutex::new(recorder));
        let capture = CaptureHandle(Arc::new(Mutex::new(None)));

        let mut client_read = client.try_clone()?;
        let mut server_write = server.try_clone()?;
        let up_link = link.clone();
        let up_recorder = recorder.clone();
        let upstream = thread::Builder::new().name("rvncproxy-up".into()).spawn(
            move || {
                let mut parser = ClientParser::new(up_link, password_required);
                let mut observing = true;
                let mut buffer = [0u8; 65536];
                loop {
                    let n = match client_read.read(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    // observe before forwarding, so the shadow decoder
                    // can never see a server reply it cannot frame
                    if observing {
                        match parser.feed(&buffer[..n]) {
                            Ok(events) => {
                                let mut recorder = up_recorder.lock().unwrap();
                                for event in events {
                                    match event {
                                        ClientEvent::Key { key, down } => {
                                            recorder.key_event(key, down)
                                        }
                                        ClientEvent::Pointer { x, y, buttons } => {
                                            recorder.pointer_event(x, y, buttons)
                                        }
                                    }
                                }
                            }
                            Err(error) => {
                                warn!("stopped observing client stream: {}", error);
                                observing = false;
                            }
                        }
                    }
                    if server_write.write_all(&buffer[..n]).is_err() {
                        break;
                    }
                }
                let _ = client_read.shutdown(Shutdown::Both);
                server_write.shutdown();
            },
        )?;

        let mut server_read = server;
        let mut client_write = client;
        let down_capture = capture.clone();
        let down_recorder = recorder;
        let downstream = thread::Builder::new().name("rvncproxy-down".into()).spawn(
            move || {
                let mut shadow = Session::observe(link.clone());
                let mut observing = true;
                let mut buffer = [0u8; 65536];
                loop {
                    let n = match server_read.read(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if observing {
                        if let Some(format) = link.take_client_format() {
                            shadow.set_format(format);
                        }
                        match shadow.feed(&buffer[..n]) {
                            Ok(()) => {
                                for event in shadow.drain_events() {
                                    if let SessionEvent::Commit(_) = event {
                                        let request = down_capture.0.lock().unwrap().take();
                                        if let Some(path) = request {
                                            save_shadow(&shadow, &down_recorder, &path);
                                        }
                                    }
                                }
                                shadow.take_output();
                            }
                            Err(error) => {
                                warn!("stopped observing server stream: {}", error);
                                observing = false;
                            }
                        }
                    }
                    if client_write.write_all(&buffer[..n]).is_err() {
                        break;
                    }
                }
                server_read.shutdown();
                let _ = client_write.shutdown(Shutdown::Both);
            },
        )?;

        Ok(Proxy { capture, upstream, downstream })
    }

    pub fn capture_handle(&self) -> CaptureHandle {
        self.capture.clone()
    }

    /// Blocks until both directions have shut down.
    pub fn join(self) {
        let _ = self.upstream.join();
        let _ = self.downstream.join();
    }
}

fn save_shadow(shadow: &Session, recorder: &Mutex<Recorder>, path: &Path) {
    match shadow.framebuffer().snapshot(None).save(path) {
        Ok(()) => recorder.lock().unwrap().capture(path),
        Err(error) => warn!("capture {} failed: {}", path.display(), error),
    }
}

/// Accepts clients forever, dialing the real server once per client and
/// recording each session.
pub fn listen(
    listener: TcpListener,
    server: &ServerAddr,
    output: &RecorderOutput,
    password_required: bool,
) -> Result<()> {
    for incoming in listener.incoming() {
        let client = match incoming {
            Ok(stream) => stream,
            Err(error) => {
                error!("incoming connection failed: {}", error);
                continue;
            }
        };
        if let Ok(peer) = client.peer_addr() {
            info!("new connection from {}", peer);
        }
        let upstream = match Stream::connect(server) {
            Ok(stream) => stream,
            Err(error) => {
                error!("cannot reach {}: {}", server, error);
                let _ = client.shutdown(Shutdown::Both);
                continue;
            }
        };
        let recorder = match Recorder::create(output) {
            Ok(recorder) => recorder,
            Err(error) => {
                error!("cannot open recording output: {}", error);
                let _ = client.shutdown(Shutdown::Both);
                continue;
            }
        };
        match Proxy::start(client, upstream, recorder, password_required) {
            Ok(proxy) => {
                thread::spawn(move || {
                    proxy.join();
                    info!("session ended");
                });
            }
            Err(error) => error!("proxy setup failed: {}", error),
        }
    }
    Ok(())
}
