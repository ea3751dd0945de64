use std::process;

use clap::Parser;
use directories::ProjectDirs;
use log::{error, info};

use coursepulse::cli::Cli;
use coursepulse::config::{Config, CONFIG};
use coursepulse::logging::init_logging;

fn main() {
    // Parse first so --help and usage errors never touch the data directory
    let cli = Cli::parse();

    let Some(project_dirs) = ProjectDirs::from("", "", "coursepulse") else {
        eprintln!("Could not determine the coursepulse data directory");
        process::exit(1);
    };
    let data_dir = project_dirs.data_local_dir().to_path_buf();

    let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));

    // Keep the handle alive until exit so buffered log lines are flushed
    let logger = match init_logging(&config.logging, &data_dir) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    info!("coursepulse {} starting", env!("CARGO_PKG_VERSION"));

    let exit_code = match cli.handle_command_line(config, &data_dir) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!("Exiting with error: {}", e);
            eprintln!("Error: {}", e);
            1
        }
    };

    drop(logger);
    process::exit(exit_code);
}
