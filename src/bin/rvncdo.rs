use std::time::Duration;

use clap::{Arg, ArgAction, Command};

use rvncdo::client::{ClientConfig, Dispatcher};
use rvncdo::command::{self, ServerAddr};

const COMMANDS_HELP: &str = "\
Commands (CMD):
  key KEY:\tsend KEY to server, e.g. ctrl-c, del, a
  keydown KEY / keyup KEY: hold or release KEY
  type TEXT:\tsend TEXT one key press per character
  typefile PATH / pastefile PATH: type or paste a file's contents
  move X Y:\tmove the mouse cursor to position X,Y
  click BUTTON:\tsend a mouse BUTTON click
  mousedown BUTTON / mouseup BUTTON: hold or release BUTTON
  drag X Y:\tmove the mouse to X,Y in small steps
  capture FILE:\tsave the current screen as FILE
  rcapture FILE X Y W H: save a region of the screen
  expect FILE FUZZ: wait until the screen matches FILE
  rexpect FILE X Y FUZZ: wait until a region matches FILE
  pause SECONDS:\twait before sending the next command
  paste TEXT:\tset the server clipboard

A CMD token naming an existing file is read as a script; - reads stdin.";

fn main() {
    env_logger::init();
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = Command::new("rvncdo")
        .about("Command line interaction with a VNC server")
        .after_help(COMMANDS_HELP)
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .default_value("127.0.0.1")
                .help("server address: HOST, HOST:DISPLAY, HOST::PORT or a socket path"),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .help("password for VNC authentication"),
        )
        .arg(
            Arg::new("username")
                .short('u')
                .long("username")
                .help("username for Apple Remote Desktop authentication"),
        )
        .arg(
            Arg::new("force-caps")
                .long("force-caps")
                .action(ArgAction::SetTrue)
                .help("send shift chords for uppercase and shifted characters"),
        )
        .arg(
            Arg::new("cursor")
                .long("cursor")
                .action(ArgAction::SetTrue)
                .help("request the server cursor shape and draw it into captures"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_parser(clap::value_parser!(f64))
                .help("give up and exit after SECONDS"),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .value_parser(clap::value_parser!(f64))
                .help("milliseconds between commands (default: VNCDOTOOL_DELAY or 10)"),
        )
        .arg(
            Arg::new("CMD")
                .num_args(1..)
                .trailing_var_arg(true)
                .required(true)
                .help("commands to run, see below"),
        )
        .get_matches();

    let addr = match ServerAddr::parse(matches.get_one::<String>("server").unwrap()) {
        Ok(addr) => addr,
        Err(error) => {
            eprintln!("rvncdo: {}", error);
            return error.exit_code();
        }
    };

    let script: Vec<String> =
        matches.get_many::<String>("CMD").unwrap().cloned().collect();
    let steps = match command::parse_script(&script) {
        Ok(steps) => steps,
        Err(error) => {
            eprintln!("rvncdo: {}", error);
            return error.exit_code();
        }
    };

    let delay = matches
        .get_one::<f64>("delay")
        .map(|ms| ms / 1000.0)
        .unwrap_or_else(command::default_delay);
    let steps = command::with_delay(steps, delay);

    let mut config = ClientConfig {
        force_caps: matches.get_flag("force-caps"),
        drag_delay: delay,
        timeout: matches.get_one::<f64>("timeout").map(|&s| Duration::from_secs_f64(s)),
        ..ClientConfig::default()
    };
    config.session.password = matches.get_one::<String>("password").cloned();
    config.session.username = matches.get_one::<String>("username").cloned();
    config.session.cursor = matches.get_flag("cursor");

    let mut dispatcher = match Dispatcher::connect(&addr, config) {
        Ok(dispatcher) => dispatcher,
        Err(error) => {
            eprintln!("rvncdo: cannot connect to {}: {}", addr, error);
            return error.exit_code();
        }
    };
    for step in steps {
        dispatcher.enqueue(step);
    }
    dispatcher.exit_when_idle();

    match dispatcher.run() {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("rvncdo: {}", error);
            error.exit_code()
        }
    }
}
