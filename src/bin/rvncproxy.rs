use std::net::TcpListener;

use clap::{Arg, ArgAction, Command};
use log::{error, info};

use rvncdo::command::ServerAddr;
use rvncdo::proxy::{self, RecorderOutput};

fn main() {
    env_logger::init();

    let matches = Command::new("rvncproxy")
        .about("Record VNC sessions as replayable command scripts")
        .arg(
            Arg::new("SERVER")
                .required(true)
                .help("real server address: HOST, HOST:DISPLAY, HOST::PORT or a socket path"),
        )
        .arg(
            Arg::new("listen-host")
                .long("listen-host")
                .default_value("localhost")
                .help("address to accept clients on"),
        )
        .arg(
            Arg::new("listen-port")
                .long("listen-port")
                .value_parser(clap::value_parser!(u16))
                .help("port to accept clients on (default: server port plus one)"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .default_value("-")
                .help("script output: - for stdout, a file, or a directory of .vdo files"),
        )
        .arg(
            Arg::new("password-required")
                .long("password-required")
                .action(ArgAction::SetTrue)
                .help("expect protocol 3.3 clients to send a VNC-Auth response"),
        )
        .get_matches();

    let server = match ServerAddr::parse(matches.get_one::<String>("SERVER").unwrap()) {
        Ok(server) => server,
        Err(error) => {
            eprintln!("rvncproxy: {}", error);
            std::process::exit(1)
        }
    };

    let listen_host = matches.get_one::<String>("listen-host").unwrap();
    let listen_port = matches.get_one::<u16>("listen-port").copied().unwrap_or(match &server {
        ServerAddr::Tcp { port, .. } => port.wrapping_add(1),
        ServerAddr::Unix(_) => 5901,
    });
    let output = RecorderOutput::parse(matches.get_one::<String>("output").unwrap());

    let listener = match TcpListener::bind((listen_host.as_str(), listen_port)) {
        Ok(listener) => listener,
        Err(error) => {
            error!("cannot listen at {}:{}: {}", listen_host, listen_port, error);
            std::process::exit(1)
        }
    };
    info!("listening at {}:{}, forwarding to {}", listen_host, listen_port, server);

    if let Err(error) = proxy::listen(
        listener,
        &server,
        &output,
        matches.get_flag("password-required"),
    ) {
        error!("proxy failed: {}", error);
        std::process::exit(10)
    }
}
