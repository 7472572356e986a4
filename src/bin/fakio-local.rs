//! `fakio-local`: fronts an unmodified SOCKS5 client, authenticates to
//! a Fakio server, and ferries application bytes through the ciphered
//! tunnel. Takes exactly one positional argument, the path to an INI
//! configuration file.
use std::process::ExitCode;

use fakio::config::LocalConfig;
use fakio::local::Local;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "fakio-local".to_string());
    let Some(config_path) = args.next() else {
        eprintln!("usage: {program} <config.ini>");
        return ExitCode::FAILURE;
    };

    let cfg = match LocalConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut local = match Local::bind(cfg) {
        Ok(local) => local,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("fakio-local listening");
    if let Err(e) = local.run() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
