//! The command engine: a single dispatcher owns the socket, the session
//! state machine and an ordered queue of high-level steps. Everything
//! else (the reader thread, pause timers, the blocking façade) only
//! posts [`Wake`] messages to it.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::GenericImageView;

use crate::command::ServerAddr;
use crate::framebuffer::{crop_region, histogram, histogram_rms, image_histogram};
use crate::keysym;
use crate::protocol::{Message, C2S};
use crate::session::{Session, SessionConfig, SessionEvent};
use crate::{Error, Rect, Result};

/// One high-level action on the connection. Input steps complete once
/// written; `Pause` on a timer; capture and expect on a framebuffer
/// commit.
#[derive(Debug, Clone)]
pub enum Step {
    KeyPress(String),
    KeyDown(String),
    KeyUp(String),
    MouseMove(u16, u16),
    MousePress(u8),
    MouseDown(u8),
    MouseUp(u8),
    MouseDrag { x: u16, y: u16, step: u16 },
    Pause(f64),
    CaptureScreen(PathBuf),
    CaptureRegion(PathBuf, u16, u16, u16, u16),
    ExpectScreen { path: PathBuf, maxrms: f64 },
    ExpectRegion { path: PathBuf, x: u16, y: u16, maxrms: f64 },
    Paste(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub force_caps: bool,
    /// Delay between the interpolated pointer events of a drag.
    pub drag_delay: f64,
    /// Overall deadline; expiry tears the dispatcher down.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            session: SessionConfig::default(),
            force_caps: false,
            drag_delay: 0.01,
            timeout: None,
        }
    }
}

/// A TCP or Unix-domain connection to the server.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    pub fn connect(addr: &ServerAddr) -> Result<Stream> {
        match addr {
            ServerAddr::Tcp { host, port } => {
                info!("connecting to {}:{}", host, port);
                Ok(Stream::Tcp(TcpStream::connect((host.as_str(), *port))?))
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => {
                info!("connecting to {}", path.display());
                Ok(Stream::Unix(UnixStream::connect(path)?))
            }
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => {
                Err(Error::Command("unix sockets are not supported here".into()))
            }
        }
    }

    pub fn try_clone(&self) -> Result<Stream> {
        Ok(match self {
            Stream::Tcp(stream) => Stream::Tcp(stream.try_clone()?),
            #[cfg(unix)]
            Stream::Unix(stream) => Stream::Unix(stream.try_clone()?),
        })
    }

    pub fn shutdown(&self) {
        match self {
            Stream::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            Stream::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

fn mask_bit(button: u8) -> Result<u8> {
    if (1..=8).contains(&button) {
        Ok(1 << (button - 1))
    } else {
        Err(Error::Command(format!("button {} out of range", button)))
    }
}

/// Outbound input state: pointer position, button mask, and the key
/// chord rules. Writes protocol messages straight to the writer.
struct InputWire<W: Write> {
    writer: W,
    x: u16,
    y: u16,
    buttons: u8,
    force_caps: bool,
}

impl<W: Write> InputWire<W> {
    fn new(writer: W, force_caps: bool) -> InputWire<W> {
        InputWire { writer, x: 0, y: 0, buttons: 0, force_caps }
    }

    fn position(&self) -> (u16, u16) {
        (self.x, self.y)
    }

    fn send(&mut self, message: &C2S) -> Result<()> {
        debug!("-> {:?}", message);
        message.write_to(&mut self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if !bytes.is_empty() {
            self.writer.write_all(bytes)?;
            self.writer.flush()?;
        }
        Ok(())
    }

    fn decode_key(&self, key: &str) -> Result<Vec<u32>> {
        let key = if self.force_caps {
            keysym::force_caps(key)
        } else {
            key.to_owned()
        };
        keysym::decode(&key)
    }

    /// Presses the chord left to right, then releases right to left so
    /// modifiers outlive their victim.
    fn key_press(&mut self, key: &str) -> Result<()> {
        let syms = self.decode_key(key)?;
        for &sym in &syms {
            self.send(&C2S::KeyEvent { down: true, key: sym })?;
        }
        for &sym in syms.iter().rev() {
            self.send(&C2S::KeyEvent { down: false, key: sym })?;
        }
        Ok(())
    }

    fn key_down(&mut self, key: &str) -> Result<()> {
        for sym in self.decode_key(key)? {
            self.send(&C2S::KeyEvent { down: true, key: sym })?;
        }
        Ok(())
    }

    fn key_up(&mut self, key: &str) -> Result<()> {
        for sym in self.decode_key(key)? {
            self.send(&C2S::KeyEvent { down: false, key: sym })?;
        }
        Ok(())
    }

    fn pointer(&mut self) -> Result<()> {
        self.send(&C2S::PointerEvent {
            button_mask: self.buttons,
            x_position: self.x,
            y_position: self.y,
        })
    }

    fn mouse_move(&mut self, x: u16, y: u16) -> Result<()> {
        self.x = x;
        self.y = y;
        self.pointer()
    }

    fn mouse_down(&mut self, button: u8) -> Result<()> {
        self.buttons |= mask_bit(button)?;
        self.pointer()
    }

    fn mouse_up(&mut self, button: u8) -> Result<()> {
        self.buttons &= !mask_bit(button)?;
        self.pointer()
    }

    fn mouse_press(&mut self, button: u8) -> Result<()> {
        self.mouse_down(button)?;
        self.mouse_up(button)
    }

    fn paste(&mut self, text: &str) -> Result<()> {
        self.send(&C2S::CutText(text.to_owned()))
    }
}

/// Axis-aligned interpolation from `from` to `to`: x first, then y,
/// ending exactly on the target.
fn drag_path(from: (u16, u16), to: (u16, u16), step: u16) -> Vec<(u16, u16)> {
    let step = i32::from(step.max(1));
    let mut path = Vec::new();
    let (mut x, mut y) = (i32::from(from.0), i32::from(from.1));
    let (tx, ty) = (i32::from(to.0), i32::from(to.1));
    while x != tx {
        x += (tx - x).clamp(-step, step);
        path.push((x as u16, y as u16));
    }
    while y != ty {
        y += (ty - y).clamp(-step, step);
        path.push((x as u16, y as u16));
    }
    path
}

pub struct QueuedStep {
    pub step: Step,
    pub done: Option<SyncSender<Result<()>>>,
}

pub enum Wake {
    Net(Vec<u8>),
    NetClosed,
    NetError(std::io::Error),
    Call(QueuedStep),
    Timer(u64),
    Deadline,
    Shutdown,
}

enum Pending {
    Timer(u64),
    Capture { path: PathBuf, region: Option<Rect> },
    Expect { reference: Vec<u32>, maxrms: f64, region: Option<Rect> },
}

pub struct Dispatcher {
    wire: InputWire<Stream>,
    session: Session,
    rx: Receiver<Wake>,
    tx: Sender<Wake>,
    queue: VecDeque<QueuedStep>,
    pending: Option<Pending>,
    current_done: Option<SyncSender<Result<()>>>,
    connected: bool,
    exit_when_idle: bool,
    on_connected: Option<SyncSender<Result<()>>>,
    failure: Arc<Mutex<Option<Error>>>,
    timer_seq: u64,
    drag_delay: f64,
}

impl Dispatcher {
    pub fn connect(addr: &ServerAddr, config: ClientConfig) -> Result<Dispatcher> {
        let stream = Stream::connect(addr)?;
        let (tx, rx) = channel();

        let mut reader = stream.try_clone()?;
        let net_tx = tx.clone();
        thread::Builder::new()
            .name("rvncdo-reader".into())
            .spawn(move || {
                let mut buffer = [0u8; 65536];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            let _ = net_tx.send(Wake::NetClosed);
                            break;
                        }
                        Ok(n) => {
                            if net_tx.send(Wake::Net(buffer[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            let _ = net_tx.send(Wake::NetError(error));
                            break;
                        }
                    }
                }
            })?;

        if let Some(timeout) = config.timeout {
            let deadline_tx = tx.clone();
            thread::Builder::new()
                .name("rvncdo-deadline".into())
                .spawn(move || {
                    thread::sleep(timeout);
                    let _ = deadline_tx.send(Wake::Deadline);
                })?;
        }

        Ok(Dispatcher {
            wire: InputWire::new(stream, config.force_caps),
            session: Session::new(config.session),
            rx,
            tx,
            queue: VecDeque::new(),
            pending: None,
            current_done: None,
            connected: false,
            exit_when_idle: false,
            on_connected: None,
            failure: Arc::new(Mutex::new(None)),
            timer_seq: 0,
            drag_delay: config.drag_delay,
        })
    }

    pub fn sender(&self) -> Sender<Wake> {
        self.tx.clone()
    }

    /// Where the façade reads the reason after the dispatcher dies.
    pub fn failure_handle(&self) -> Arc<Mutex<Option<Error>>> {
        self.failure.clone()
    }

    /// Signalled with the handshake outcome.
    pub fn notify_connected(&mut self, done: SyncSender<Result<()>>) {
        self.on_connected = Some(done);
    }

    /// Queue a step before the loop starts; used by the command-line
    /// tool, which then runs until the queue drains.
    pub fn enqueue(&mut self, step: Step) {
        self.queue.push_back(QueuedStep { step, done: None });
    }

    /// Makes `run` return once connected, idle and out of steps.
    pub fn exit_when_idle(&mut self) {
        self.exit_when_idle = true;
    }

    pub fn run(mut self) -> Result<()> {
        let result = self.run_inner();
        self.wire.writer.shutdown();
        if let Err(error) = &result {
            error!("session failed: {}", error);
            *self.failure.lock().unwrap() = Some(error.duplicate());
            if let Some(done) = self.on_connected.take() {
                let _ = done.try_send(Err(error.duplicate()));
            }
            if let Some(done) = self.current_done.take() {
                let _ = done.try_send(Err(error.duplicate()));
            }
            for queued in self.queue.drain(..) {
                if let Some(done) = queued.done {
                    let _ = done.try_send(Err(error.duplicate()));
                }
            }
        } else {
            if let Some(done) = self.current_done.take() {
                let _ = done.try_send(Err(Error::Disconnected));
            }
            for queued in self.queue.drain(..) {
                if let Some(done) = queued.done {
                    let _ = done.try_send(Err(Error::Disconnected));
                }
            }
        }
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        loop {
            self.advance()?;
            if self.exit_when_idle
                && self.connected
                && self.queue.is_empty()
                && self.pending.is_none()
            {
                return Ok(());
            }
            let wake = self.rx.recv().map_err(|_| Error::Disconnected)?;
            match wake {
                Wake::Net(bytes) => {
                    self.session.feed(&bytes)?;
                    let output = self.session.take_output();
                    self.wire.write_raw(&output)?;
                    for event in self.session.drain_events() {
                        self.on_event(event)?;
                    }
                }
                Wake::NetClosed => return Err(Error::Disconnected),
                Wake::NetError(error) => return Err(error.into()),
                Wake::Call(queued) => self.queue.push_back(queued),
                Wake::Timer(id) => {
                    if matches!(self.pending, Some(Pending::Timer(t)) if t == id) {
                        self.pending = None;
                        self.complete_current();
                    }
                }
                Wake::Deadline => return Err(Error::Timeout),
                Wake::Shutdown => return Ok(()),
            }
        }
    }

    fn on_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Connected => {
                self.connected = true;
                if let Some(done) = self.on_connected.take() {
                    let _ = done.try_send(Ok(()));
                }
            }
            SessionEvent::Commit(_) => self.on_commit()?,
            SessionEvent::Bell => info!("bell"),
            SessionEvent::Clipboard(text) => info!("server clipboard: {:?}", text),
            SessionEvent::Resize(width, height) => {
                debug!("desktop resized to {}x{}", width, height)
            }
        }
        Ok(())
    }

    fn on_commit(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(Pending::Capture { path, region }) => {
                let shot = self.session.framebuffer().snapshot(Some(self.wire.position()));
                let image = match region {
                    Some(rect) => crop_region(&shot, rect),
                    None => shot,
                };
                image.save(&path)?;
                info!("captured {}", path.display());
                self.complete_current();
            }
            Some(Pending::Expect { reference, maxrms, region }) => {
                if !self.session.framebuffer().has_update() {
                    self.request_update(false)?;
                    self.pending = Some(Pending::Expect { reference, maxrms, region });
                    return Ok(());
                }
                let shot = self.session.framebuffer().snapshot(Some(self.wire.position()));
                let image = match region {
                    Some(rect) => crop_region(&shot, rect),
                    None => shot,
                };
                let bins = histogram(image.as_raw(), 3);
                match histogram_rms(&bins, &reference) {
                    Some(rms) if rms <= maxrms => {
                        debug!("screen matched, rms {:.2}", rms);
                        self.complete_current();
                    }
                    outcome => {
                        if let Some(rms) = outcome {
                            debug!("rms {:.2} > {:.2}", rms, maxrms);
                        }
                        self.request_update(true)?;
                        self.pending = Some(Pending::Expect { reference, maxrms, region });
                    }
                }
            }
            other => self.pending = other,
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        while self.pending.is_none() {
            let queued = match self.queue.pop_front() {
                Some(queued) => queued,
                None => return Ok(()),
            };
            self.execute(queued)?;
        }
        Ok(())
    }

    fn request_update(&mut self, incremental: bool) -> Result<()> {
        let (width, height) = self.session.size();
        self.wire.send(&C2S::FramebufferUpdateRequest {
            incremental,
            x_position: 0,
            y_position: 0,
            width,
            height,
        })
    }

    fn arm_timer(&mut self, seconds: f64) -> u64 {
        self.timer_seq += 1;
        let id = self.timer_seq;
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            let _ = tx.send(Wake::Timer(id));
        });
        id
    }

    fn complete_current(&mut self) {
        if let Some(done) = self.current_done.take() {
            let _ = done.try_send(Ok(()));
        }
    }

    fn execute(&mut self, queued: QueuedStep) -> Result<()> {
        let QueuedStep { step, done } = queued;
        trace!("step {:?}", step);
        match step {
            Step::KeyPress(key) => {
                self.wire.key_press(&key)?;
                finish(done);
            }
            Step::KeyDown(key) => {
                self.wire.key_down(&key)?;
                finish(done);
            }
            Step::KeyUp(key) => {
                self.wire.key_up(&key)?;
                finish(done);
            }
            Step::MouseMove(x, y) => {
                self.wire.mouse_move(x, y)?;
                finish(done);
            }
            Step::MousePress(button) => {
                self.wire.mouse_press(button)?;
                finish(done);
            }
            Step::MouseDown(button) => {
                self.wire.mouse_down(button)?;
                finish(done);
            }
            Step::MouseUp(button) => {
                self.wire.mouse_up(button)?;
                finish(done);
            }
            Step::MouseDrag { x, y, step } => {
                let path = drag_path(self.wire.position(), (x, y), step);
                let mut expanded = Vec::new();
                for (index, &(px, py)) in path.iter().enumerate() {
                    if index > 0 && self.drag_delay > 0.0 {
                        expanded.push(QueuedStep {
                            step: Step::Pause(self.drag_delay),
                            done: None,
                        });
                    }
                    expanded.push(QueuedStep { step: Step::MouseMove(px, py), done: None });
                }
                match expanded.last_mut() {
                    Some(last) => last.done = done,
                    None => finish(done), // already at the target
                }
                for queued in expanded.into_iter().rev() {
                    self.queue.push_front(queued);
                }
            }
            Step::Pause(seconds) => {
                let id = self.arm_timer(seconds);
                self.pending = Some(Pending::Timer(id));
                self.current_done = done;
            }
            Step::CaptureScreen(path) => {
                self.request_update(false)?;
                self.pending = Some(Pending::Capture { path, region: None });
                self.current_done = done;
            }
            Step::CaptureRegion(path, x, y, w, h) => {
                self.request_update(false)?;
                self.pending =
                    Some(Pending::Capture { path, region: Some(Rect::new(x, y, w, h)) });
                self.current_done = done;
            }
            Step::ExpectScreen { path, maxrms } => {
                let reference = image::open(&path)?;
                self.request_update(false)?;
                self.pending = Some(Pending::Expect {
                    reference: image_histogram(&reference),
                    maxrms,
                    region: None,
                });
                self.current_done = done;
            }
            Step::ExpectRegion { path, x, y, maxrms } => {
                let reference = image::open(&path)?;
                let region =
                    Rect::new(x, y, reference.width() as u16, reference.height() as u16);
                self.request_update(false)?;
                self.pending = Some(Pending::Expect {
                    reference: image_histogram(&reference),
                    maxrms,
                    region: Some(region),
                });
                self.current_done = done;
            }
            Step::Paste(text) => {
                self.wire.paste(&text)?;
                finish(done);
            }
        }
        Ok(())
    }
}

fn finish(done: Option<SyncSender<Result<()>>>) {
    if let Some(done) = done {
        let _ = done.try_send(Ok(()));
    }
}
