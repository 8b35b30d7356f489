use anyhow::{anyhow, Result};
use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use env_logger::{Builder, Target};

use crate::cli;

/// Environment variable naming a file that receives a copy of the log.
pub const LOG_FILE_ENV: &str = "HOMIE_MODBUS_LOG_FILE";

/// Multi-writer for logging to both file and stdout
struct DualWriter {
    file: std::fs::File,
    stdout: io::Stdout,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stdout.flush()?;
        Ok(())
    }
}

/// Sets up env_logger. `RUST_LOG` still overrides the default level.
///
/// With `HOMIE_MODBUS_LOG_FILE` set, output goes to that file as well as
/// to stdout.
pub fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let log_file = std::env::var(LOG_FILE_ENV).ok();

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(level)
        .parse_default_env();

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(DualWriter {
                    file,
                    stdout: io::stdout(),
                })));
            }
            Err(err) => eprintln!("Failed to open log file '{path}': {err}"),
        }
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}

/// Parses the command line, sets up logging and runs until a shutdown
/// signal arrives.
pub fn start() -> Result<()> {
    let matches = cli::parse_args();
    let config = cli::load_config(&matches);
    init_logger(matches.get_flag("debug") || config.as_ref().is_ok_and(|config| config.debug));
    let config = config?;
    log::info!(
        "Starting {} {} as '{}'",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.device_id()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| anyhow!("Failed to start async runtime: {err}"))?;
    runtime.block_on(cli::run(&matches, config))
}
