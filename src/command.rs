//! The command-script grammar and the server address syntax.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::client::Step;
use crate::{Error, Result};

pub const SUPPORTED_FORMATS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];

/// Where the server lives: `HOST`, `HOST:DISPLAY`, `HOST::PORT`,
/// `:DISPLAY`, `::PORT`, bracketed IPv6 forms of the same, or a Unix
/// socket path (anything containing a slash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ServerAddr {
    pub fn parse(spec: &str) -> Result<ServerAddr> {
        if spec.contains('/') {
            return Ok(ServerAddr::Unix(PathBuf::from(spec)));
        }
        let (host, rest) = if let Some(bracketed) = spec.strip_prefix('[') {
            let end = bracketed
                .find(']')
                .ok_or_else(|| Error::Command(format!("bad address {:?}", spec)))?;
            (&bracketed[..end], &bracketed[end + 1..])
        } else {
            match spec.find(':') {
                Some(index) => (&spec[..index], &spec[index..]),
                None => (spec, ""),
            }
        };
        let host = if host.is_empty() { "127.0.0.1" } else { host };

        let port = if rest.is_empty() {
            5900
        } else if let Some(port) = rest.strip_prefix("::") {
            port.parse::<u16>()
                .map_err(|_| Error::Command(format!("bad port {:?}", port)))?
        } else if let Some(display) = rest.strip_prefix(':') {
            let display = display
                .parse::<u32>()
                .map_err(|_| Error::Command(format!("bad display {:?}", display)))?;
            u16::try_from(5900 + display)
                .map_err(|_| Error::Command(format!("display {} out of range", display)))?
        } else {
            return Err(Error::Command(format!("bad address {:?}", spec)));
        };

        Ok(ServerAddr::Tcp { host: host.to_owned(), port })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ServerAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Default delay between script commands, from `VNCDOTOOL_DELAY`
/// (milliseconds, default 10).
pub fn default_delay() -> f64 {
    std::env::var("VNCDOTOOL_DELAY")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(10.0)
        / 1000.0
}

/// Interleaves a pause between consecutive commands.
pub fn with_delay(steps: Vec<Step>, delay: f64) -> Vec<Step> {
    if delay <= 0.0 {
        return steps;
    }
    let mut spaced = Vec::with_capacity(steps.len() * 2);
    for step in steps {
        if !spaced.is_empty() {
            spaced.push(Step::Pause(delay));
        }
        spaced.push(step);
    }
    spaced
}

fn pop(tokens: &mut VecDeque<String>, command: &str) -> Result<String> {
    tokens
        .pop_front()
        .ok_or_else(|| Error::Command(format!("{}: missing argument", command)))
}

fn number<T: FromStr>(tokens: &mut VecDeque<String>, command: &str) -> Result<T> {
    let token = pop(tokens, command)?;
    token
        .parse::<T>()
        .map_err(|_| Error::Command(format!("{}: bad argument {:?}", command, token)))
}

fn image_path(token: String, command: &str) -> Result<PathBuf> {
    let path = PathBuf::from(&token);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if SUPPORTED_FORMATS.contains(&ext.to_ascii_lowercase().as_str()) => Ok(path),
        _ => Err(Error::Command(format!(
            "{}: unsupported image format {:?}, choose one of {}",
            command,
            token,
            SUPPORTED_FORMATS.join(", ")
        ))),
    }
}

fn splice_front(tokens: &mut VecDeque<String>, text: &str) {
    for token in text.split_whitespace().rev() {
        tokens.push_front(token.to_owned());
    }
}

/// Parses a whitespace-separated command script into steps. At command
/// position, `-` splices in stdin and an existing file path is expanded
/// recursively.
pub fn parse_script(args: &[String]) -> Result<Vec<Step>> {
    let mut tokens: VecDeque<String> = args.iter().cloned().collect();
    let mut steps = Vec::new();

    while let Some(token) = tokens.pop_front() {
        if token == "-" {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            splice_front(&mut tokens, &text);
            continue;
        }
        if Path::new(&token).is_file() {
            let text = fs::read_to_string(&token)?;
            splice_front(&mut tokens, &text);
            continue;
        }

        match token.as_str() {
            "key" => steps.push(Step::KeyPress(pop(&mut tokens, "key")?)),
            "keydown" => steps.push(Step::KeyDown(pop(&mut tokens, "keydown")?)),
            "keyup" => steps.push(Step::KeyUp(pop(&mut tokens, "keyup")?)),
            "type" => {
                for c in pop(&mut tokens, "type")?.chars() {
                    steps.push(Step::KeyPress(c.to_string()));
                }
            }
            "typefile" => {
                let path = pop(&mut tokens, "typefile")?;
                for c in fs::read_to_string(&path)?.chars() {
                    steps.push(Step::KeyPress(c.to_string()));
                }
            }
            "paste" => steps.push(Step::Paste(pop(&mut tokens, "paste")?)),
            "pastefile" => {
                let path = pop(&mut tokens, "pastefile")?;
                steps.push(Step::Paste(fs::read_to_string(&path)?));
            }
            "move" | "mousemove" => {
                let x = number(&mut tokens, &token)?;
                let y = number(&mut tokens, &token)?;
                steps.push(Step::MouseMove(x, y));
            }
            "click" => steps.push(Step::MousePress(number(&mut tokens, "click")?)),
            "mousedown" | "mdown" => {
                steps.push(Step::MouseDown(number(&mut tokens, &token)?))
            }
            "mouseup" | "mup" => steps.push(Step::MouseUp(number(&mut tokens, &token)?)),
            "drag" => {
                let x = number(&mut tokens, "drag")?;
                let y = number(&mut tokens, "drag")?;
                steps.push(Step::MouseDrag { x, y, step: 1 });
            }
            "capture" => {
                let path = image_path(pop(&mut tokens, "capture")?, "capture")?;
                steps.push(Step::CaptureScreen(path));
            }
            "rcapture" => {
                let path = image_path(pop(&mut tokens, "rcapture")?, "rcapture")?;
                let x = number(&mut tokens, "rcapture")?;
                let y = number(&mut tokens, "rcapture")?;
                let w = number(&mut tokens, "rcapture")?;
                let h = number(&mut tokens, "rcapture")?;
                steps.push(Step::CaptureRegion(path, x, y, w, h));
            }
            "expect" => {
                let path = PathBuf::from(pop(&mut tokens, "expect")?);
                let maxrms = number(&mut tokens, "expect")?;
                steps.push(Step::ExpectScreen { path, maxrms });
            }
            "rexpect" => {
                let path = PathBuf::from(pop(&mut tokens, "rexpect")?);
                let x = number(&mut tokens, "rexpect")?;
                let y = number(&mut tokens, "rexpect")?;
                let maxrms = number(&mut tokens, "rexpect")?;
                steps.push(Step::ExpectRegion { path, x, y, maxrms });
            }
            "pause" | "sleep" => steps.push(Step::Pause(number(&mut tokens, &token)?)),
            unknown => {
                return Err(Error::Command(format!("unknown command {:?}", unknown)))
            }
        }
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(script: &str) -> Vec<String> {
        script.split_whitespace().map(str::to_owned).collect()
    }

    #[test]
    fn address_forms() {
        let tcp = |host: &str, port| ServerAddr::Tcp { host: host.into(), port };
        assert_eq!(ServerAddr::parse("somehost").unwrap(), tcp("somehost", 5900));
        assert_eq!(ServerAddr::parse("somehost:3").unwrap(), tcp("somehost", 5903));
        assert_eq!(ServerAddr::parse("somehost::444").unwrap(), tcp("somehost", 444));
        assert_eq!(ServerAddr::parse(":2").unwrap(), tcp("127.0.0.1", 5902));
        assert_eq!(ServerAddr::parse("::5901").unwrap(), tcp("127.0.0.1", 5901));
        assert_eq!(ServerAddr::parse("[::1]:1").unwrap(), tcp("::1", 5901));
        assert_eq!(ServerAddr::parse("[fe80::2]::6000").unwrap(), tcp("fe80::2", 6000));
        assert_eq!(ServerAddr::parse("[::1]").unwrap(), tcp("::1", 5900));
        assert_eq!(
            ServerAddr::parse("/tmp/vnc.sock").unwrap(),
            ServerAddr::Unix(PathBuf::from("/tmp/vnc.sock"))
        );
        assert!(ServerAddr::parse("host:x").is_err());
        assert!(ServerAddr::parse("[::1").is_err());
        assert!(ServerAddr::parse("host:70000").is_err());
    }

    #[test]
    fn basic_script() {
        let steps = parse_script(&args("key ctrl-c move 10 20 click 1 pause 0.5")).unwrap();
        assert!(matches!(&steps[0], Step::KeyPress(k) if k == "ctrl-c"));
        assert!(matches!(steps[1], Step::MouseMove(10, 20)));
        assert!(matches!(steps[2], Step::MousePress(1)));
        assert!(matches!(steps[3], Step::Pause(p) if p == 0.5));
    }

    #[test]
    fn type_expands_to_key_presses() {
        let steps = parse_script(&args("type abc")).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(matches!(&steps[0], Step::KeyPress(k) if k == "a"));
        assert!(matches!(&steps[2], Step::KeyPress(k) if k == "c"));
    }

    #[test]
    fn capture_requires_image_extension() {
        assert!(parse_script(&args("capture out.png")).is_ok());
        assert!(parse_script(&args("capture out.PNG")).is_ok());
        assert!(parse_script(&args("capture out.txt")).is_err());
        assert!(parse_script(&args("capture out")).is_err());
    }

    #[test]
    fn region_commands() {
        let steps = parse_script(&args("rcapture r.png 1 2 3 4 rexpect e.png 5 6 7.5")).unwrap();
        assert!(matches!(steps[0], Step::CaptureRegion(_, 1, 2, 3, 4)));
        assert!(
            matches!(&steps[1], Step::ExpectRegion { x: 5, y: 6, maxrms, .. } if *maxrms == 7.5)
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            parse_script(&args("frobnicate 1")),
            Err(Error::Command(_))
        ));
        assert!(matches!(parse_script(&args("key")), Err(Error::Command(_))));
    }

    #[test]
    fn file_tokens_are_expanded() {
        let dir = std::env::temp_dir();
        let path = dir.join("rvncdo-test-script.vdo");
        fs::write(&path, "move 1 2\nclick 1\n").unwrap();
        let script = vec!["key".to_owned(), "a".to_owned(), path.display().to_string()];
        let steps = parse_script(&script).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(matches!(steps[1], Step::MouseMove(1, 2)));
        assert!(matches!(steps[2], Step::MousePress(1)));
    }

    #[test]
    fn delay_interleaves_pauses() {
        let steps = with_delay(
            vec![Step::MouseMove(1, 1), Step::MousePress(1)],
            0.01,
        );
        assert_eq!(steps.len(), 3);
        assert!(matches!(steps[1], Step::Pause(p) if p == 0.01));
        assert_eq!(with_delay(vec![Step::MousePress(1)], 0.01).len(), 1);
    }
}
