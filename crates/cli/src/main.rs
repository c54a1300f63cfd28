use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Two-party WebSocket signaling relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Serve static files and relay WebSocket messages between paired peers on one port.
    Serve {
        /// Config file path (default: DUET_CONFIG_PATH or ~/.duet/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Port to listen on (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,

        /// Directory to serve (default from config or "public")
        #[arg(long, short, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Do not log to the terminal (a log file still receives every line)
        #[arg(long, short)]
        silent: bool,

        /// Also append logs to this file (e.g. logs/app.log)
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("duet {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve {
            config,
            port,
            dir,
            silent,
            log_file,
        }) => {
            let (mut config, _path) = match duet::config::load_config(config) {
                Ok(loaded) => loaded,
                Err(e) => {
                    eprintln!("loading config failed: {:#}", e);
                    std::process::exit(1);
                }
            };
            if let Some(p) = port {
                config.server.port = p;
            }
            if let Some(d) = dir {
                config.server.dir = d;
            }
            config.logging.silent |= silent;
            if log_file.is_some() {
                config.logging.file = log_file;
            }

            if let Err(e) = init_logging(config.logging.silent, config.logging.file.as_deref()) {
                eprintln!("opening log file failed: {:#}", e);
                std::process::exit(1);
            }
            log::info!("starting relay on {}:{}", config.server.bind, config.server.port);
            if let Err(e) = duet::relay::run_relay(config).await {
                log::error!("[FATAL] relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Terminal logging unless `silent` (RUST_LOG honoured, relay debug lines on); a log file, when
/// given, receives every line as well.
fn init_logging(silent: bool, file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,duet=debug"),
    );
    match (file, silent) {
        (Some(path), silent) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            let terminal: Option<Box<dyn Write + Send>> =
                (!silent).then(|| Box::new(std::io::stderr()) as Box<dyn Write + Send>);
            builder.target(env_logger::Target::Pipe(Box::new(Tee { file, terminal })));
        }
        (None, true) => {
            builder.filter_level(log::LevelFilter::Off);
        }
        (None, false) => {}
    }
    builder.init();
    Ok(())
}

/// Log sink that appends to a file and optionally mirrors to the terminal.
struct Tee<F> {
    file: F,
    terminal: Option<Box<dyn Write + Send>>,
}

impl<F: Write> Write for Tee<F> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write_all(buf)?;
        if let Some(terminal) = self.terminal.as_mut() {
            // Terminal errors are ignored.
            let _ = terminal.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        if let Some(terminal) = self.terminal.as_mut() {
            let _ = terminal.flush();
        }
        Ok(())
    }
}
