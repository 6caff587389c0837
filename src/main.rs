//! wyrmshell: a reverse/bind shell broker with an embedded SOCKS/local-forward
//! proxy multiplexer.

mod broker;
mod config;
mod connection;
mod constants;
mod endpoint;
mod error;
mod message;
mod proxy;
mod pty;
mod signals;
mod socks;
mod term;
mod transport;

use config::{Config, Role};

fn main() {
    let config = match Config::from_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("wyrmshell: {e}");
            std::process::exit(1);
        }
    };

    let level = match config.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = match config.role {
        Role::Controller => endpoint::run_controller(&config),
        Role::Target => endpoint::run_target(&config),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            std::process::exit(1);
        }
    }
}
