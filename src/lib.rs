//! A programmable RFB (VNC) client and a session-recording proxy.
//!
//! The [`api::ThreadedClient`] façade drives a remote desktop from ordinary
//! blocking code; [`client::Dispatcher`] is the underlying single-threaded
//! engine; [`proxy`] records live sessions as replayable command scripts.

#[macro_use]
extern crate log;

pub mod api;
pub mod client;
pub mod command;
pub mod framebuffer;
pub mod framer;
pub mod keysym;
pub mod pixels;
pub mod protocol;
pub mod proxy;
pub mod security;
pub mod session;
pub mod zrle;

pub use api::ThreadedClient;
pub use client::{ClientConfig, Step};
pub use command::ServerAddr;
pub use protocol::{PixelFormat, Version};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("unexpected {0}")]
    Unexpected(&'static str),
    #[error("server refused connection: {0}")]
    Server(String),
    #[error("no mutually supported authentication method")]
    AuthenticationUnavailable,
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("timed out waiting for client response")]
    Timeout,
    #[error("bad command: {0}")]
    Command(String),
}

impl Error {
    /// Exit status for the command-line tools: protocol and timeout
    /// failures exit 10, anything recoverable at parse time exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Command(_) => 1,
            _ => 10,
        }
    }

    /// A fresh copy of this error. One failure resolves every pending
    /// waiter on the command chain, and `io::Error` does not clone.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Image(e) => Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            )),
            Error::Unexpected(what) => Error::Unexpected(what),
            Error::Server(reason) => Error::Server(reason.clone()),
            Error::AuthenticationUnavailable => Error::AuthenticationUnavailable,
            Error::AuthenticationFailure(reason) => {
                Error::AuthenticationFailure(reason.clone())
            }
            Error::Disconnected => Error::Disconnected,
            Error::Timeout => Error::Timeout,
            Error::Command(reason) => Error::Command(reason.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Rect {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(left: u16, top: u16, width: u16, height: u16) -> Rect {
        Rect { left, top, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colour {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}
