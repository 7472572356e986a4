//! `fakio-server`: authenticates Fakio clients and relays their
//! tunnelled SOCKS5 `CONNECT` traffic to the real destination in the
//! clear. Takes exactly one positional argument, the path to an INI
//! configuration file.
use std::process::ExitCode;

use fakio::config::ServerConfig;
use fakio::server::Server;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "fakio-server".to_string());
    let Some(config_path) = args.next() else {
        eprintln!("usage: {program} <config.ini>");
        return ExitCode::FAILURE;
    };

    let cfg = match ServerConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::bind(cfg) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("fakio-server listening");
    if let Err(e) = server.run() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
