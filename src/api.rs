//! A blocking façade for callers that do not run the dispatcher
//! themselves: one dispatcher thread per connection, one job and one
//! reply slot per call.

use std::path::Path;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::client::{ClientConfig, Dispatcher, QueuedStep, Step, Wake};
use crate::command::ServerAddr;
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A connection driven from ordinary blocking code. Every method posts
/// one step to the dispatcher and waits for its completion, so calls
/// execute strictly in order; methods return `&Self` for chaining.
pub struct ThreadedClient {
    tx: std::sync::mpsc::Sender<Wake>,
    handle: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<Error>>>,
    timeout: Duration,
}

impl ThreadedClient {
    /// Connects and completes the handshake before returning.
    pub fn connect(addr: &ServerAddr, config: ClientConfig) -> Result<ThreadedClient> {
        let mut dispatcher = Dispatcher::connect(addr, config)?;
        let (ready_tx, ready_rx) = sync_channel(1);
        dispatcher.notify_connected(ready_tx);
        let tx = dispatcher.sender();
        let failure = dispatcher.failure_handle();
        let handle = thread::Builder::new()
            .name("rvncdo-dispatcher".into())
            .spawn(move || {
                let _ = dispatcher.run();
            })?;
        let client =
            ThreadedClient { tx, handle: Some(handle), failure, timeout: DEFAULT_TIMEOUT };
        match ready_rx.recv_timeout(client.timeout) {
            Ok(Ok(())) => Ok(client),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// How long each call may wait for its reply slot.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn dead(&self) -> Error {
        self.failure
            .lock()
            .unwrap()
            .as_ref()
            .map(Error::duplicate)
            .unwrap_or(Error::Disconnected)
    }

    fn call(&self, step: Step) -> Result<&Self> {
        let (done_tx, done_rx): (SyncSender<Result<()>>, _) = sync_channel(1);
        self.tx
            .send(Wake::Call(QueuedStep { step, done: Some(done_tx) }))
            .map_err(|_| self.dead())?;
        match done_rx.recv_timeout(self.timeout) {
            Ok(result) => result.map(|_| self),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(self.dead()),
        }
    }

    pub fn key_press(&self, key: &str) -> Result<&Self> {
        self.call(Step::KeyPress(key.to_owned()))
    }

    pub fn key_down(&self, key: &str) -> Result<&Self> {
        self.call(Step::KeyDown(key.to_owned()))
    }

    pub fn key_up(&self, key: &str) -> Result<&Self> {
        self.call(Step::KeyUp(key.to_owned()))
    }

    pub fn mouse_move(&self, x: u16, y: u16) -> Result<&Self> {
        self.call(Step::MouseMove(x, y))
    }

    pub fn mouse_press(&self, button: u8) -> Result<&Self> {
        self.call(Step::MousePress(button))
    }

    pub fn mouse_down(&self, button: u8) -> Result<&Self> {
        self.call(Step::MouseDown(button))
    }

    pub fn mouse_up(&self, button: u8) -> Result<&Self> {
        self.call(Step::MouseUp(button))
    }

    pub fn mouse_drag(&self, x: u16, y: u16, step: u16) -> Result<&Self> {
        self.call(Step::MouseDrag { x, y, step })
    }

    pub fn pause(&self, seconds: f64) -> Result<&Self> {
        self.call(Step::Pause(seconds))
    }

    pub fn capture_screen(&self, path: impl AsRef<Path>) -> Result<&Self> {
        self.call(Step::CaptureScreen(path.as_ref().to_owned()))
    }

    pub fn capture_region(
        &self,
        path: impl AsRef<Path>,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
    ) -> Result<&Self> {
        self.call(Step::CaptureRegion(path.as_ref().to_owned(), x, y, w, h))
    }

    pub fn expect_screen(&self, path: impl AsRef<Path>, maxrms: f64) -> Result<&Self> {
        self.call(Step::ExpectScreen { path: path.as_ref().to_owned(), maxrms })
    }

    pub fn expect_region(
        &self,
        path: impl AsRef<Path>,
        x: u16,
        y: u16,
        maxrms: f64,
    ) -> Result<&Self> {
        self.call(Step::ExpectRegion { path: path.as_ref().to_owned(), x, y, maxrms })
    }

    pub fn paste(&self, text: &str) -> Result<&Self> {
        self.call(Step::Paste(text.to_owned()))
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(Wake::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadedClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scoped acquisition: the connection is torn down when `body` returns,
/// whatever happened inside.
pub fn with_client<T>(
    addr: &ServerAddr,
    config: ClientConfig,
    body: impl FnOnce(&ThreadedClient) -> Result<T>,
) -> Result<T> {
    let client = ThreadedClient::connect(addr, config)?;
    let result = body(&client);
    let _ = client.disconnect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::protocol::{self, Message, PixelFormat, C2S};

    struct FakeServer {
        stream: TcpStream,
        update_requests: Arc<AtomicUsize>,
    }

    impl FakeServer {
        /// Runs the server side of the handshake the way the protocol
        /// types define it, then answers every update request with one
        /// solid red 4x4 raw rectangle.
        fn serve(listener: TcpListener, update_requests: Arc<AtomicUsize>) -> Vec<(bool, u32)> {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"RFB 003.008\n").unwrap();
            let mut version = [0u8; 12];
            stream.read_exact(&mut version).unwrap();
            assert_eq!(&version, b"RFB 003.008\n");
            stream.write_all(&[1, 1]).unwrap();
            let mut selection = [0u8; 1];
            stream.read_exact(&mut selection).unwrap();
            assert_eq!(selection, [1]);
            stream.write_all(&[0, 0, 0, 0]).unwrap();
            let mut shared = [0u8; 1];
            stream.read_exact(&mut shared).unwrap();
            protocol::ServerInit {
                framebuffer_width: 4,
                framebuffer_height: 4,
                pixel_format: PixelFormat::rgbx32(),
                name_length: 4,
            }
            .write_to(&mut stream)
            .unwrap();
            stream.write_all(b"test").unwrap();

            let mut server = FakeServer { stream, update_requests };
            server.pump()
        }

        fn pump(&mut self) -> Vec<(bool, u32)> {
            let mut keys = Vec::new();
            loop {
                match C2S::read_from(&mut self.stream) {
                    Ok(C2S::FramebufferUpdateRequest { .. }) => {
                        self.update_requests.fetch_add(1, Ordering::SeqCst);
                        self.send_red_update();
                    }
                    Ok(C2S::KeyEvent { down, key }) => keys.push((down, key)),
                    Ok(_) => (),
                    Err(_) => break,
                }
            }
            keys
        }

        fn send_red_update(&mut self) {
            let mut bytes = vec![0u8, 0, 0, 1];
            protocol::Rectangle {
                x_position: 0,
                y_position: 0,
                width: 4,
                height: 4,
                encoding: protocol::Encoding::Raw,
            }
            .write_to(&mut bytes)
            .unwrap();
            for _ in 0..16 {
                bytes.extend_from_slice(&[0xff, 0, 0, 0]);
            }
            self.stream.write_all(&bytes).unwrap();
        }
    }

    fn start_server() -> (ServerAddr, Arc<AtomicUsize>, thread::JoinHandle<Vec<(bool, u32)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let update_requests = Arc::new(AtomicUsize::new(0));
        let counter = update_requests.clone();
        let handle = thread::spawn(move || FakeServer::serve(listener, counter));
        (ServerAddr::Tcp { host: "127.0.0.1".into(), port }, update_requests, handle)
    }

    #[test]
    fn capture_and_input_round_trip() {
        let (addr, _updates, server) = start_server();
        let mut client = ThreadedClient::connect(&addr, ClientConfig::default()).unwrap();
        client.set_timeout(Duration::from_secs(10));

        let path = std::env::temp_dir().join("rvncdo-api-capture.png");
        client
            .key_press("a")
            .unwrap()
            .capture_screen(&path)
            .unwrap()
            .mouse_move(1, 2)
            .unwrap();
        client.disconnect().unwrap();

        let keys = server.join().unwrap();
        assert!(keys.contains(&(true, 97)));
        assert!(keys.contains(&(false, 97)));

        let image = image::open(&path).unwrap().to_rgb8();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn expect_completes_on_matching_screen() {
        let (addr, updates, server) = start_server();
        let mut client = ThreadedClient::connect(&addr, ClientConfig::default()).unwrap();
        client.set_timeout(Duration::from_secs(10));

        let path = std::env::temp_dir().join("rvncdo-api-expect.png");
        client.capture_screen(&path).unwrap();
        client.expect_screen(&path, 0.0).unwrap();
        client.disconnect().unwrap();
        server.join().unwrap();
        std::fs::remove_file(&path).unwrap();

        // one update for the capture, one for the expect; a match on
        // the first commit never re-requests
        assert_eq!(updates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pause_and_chained_calls() {
        let (addr, _updates, server) = start_server();
        let client = ThreadedClient::connect(&addr, ClientConfig::default()).unwrap();
        let started = std::time::Instant::now();
        client.pause(0.05).unwrap().key_press("b").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        client.disconnect().unwrap();
        let keys = server.join().unwrap();
        assert!(keys.contains(&(true, 98)));
    }
}
