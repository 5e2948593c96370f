mod activity;
mod api;
mod cli;
mod config;
mod db;
mod error;
mod images;
mod logging;
mod markers;
mod proxy;
mod server;
mod upload;

use cli::Cli;
use log::error;

fn main() {
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
