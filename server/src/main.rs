//! Modbus TCP slave whose register banks live in shared memory objects.
//!
//! Thin lifecycle glue around the `modbus_shm` crate: argument parsing,
//! optional config file, validation, signal wiring, the connect/serve
//! loop and exit codes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use serde::{Deserialize, Serialize};

use modbus_shm::{
    RegisterStore, RequestOutcome, Shutdown, Slave, SlaveConfig, StoreConfig, DEFAULT_GRACE_PERIOD,
    MAX_BANK_CELLS,
};

// sysexits(3) codes
const EX_USAGE: u8 = 64;
const EX_SOFTWARE: u8 = 70;
const EX_OSERR: u8 = 71;

#[derive(Parser)]
#[command(
    name = "modbus-shm-server",
    version,
    about = "Modbus TCP slave that uses shared memory objects to store its register values",
    after_help = "The modbus registers are mapped to shared memory objects:\n\
                  \x20   type | name                      | master-access | shm name\n\
                  \x20   -----|---------------------------|---------------|----------------\n\
                  \x20   DO   | Discrete Output Coils     | read-write    | <name-prefix>DO\n\
                  \x20   DI   | Discrete Input Coils      | read-only     | <name-prefix>DI\n\
                  \x20   AO   | Analog Output Registers   | read-write    | <name-prefix>AO\n\
                  \x20   AI   | Analog Input Registers    | read-only     | <name-prefix>AI"
)]
struct Opts {
    /// Config file (TOML); command line options take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IP to listen on for incoming connections
    #[arg(short, long)]
    ip: Option<String>,

    /// Port to listen on for incoming connections
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared memory name prefix
    #[arg(short, long)]
    name_prefix: Option<String>,

    /// Number of discrete output coils (DO)
    #[arg(long)]
    do_registers: Option<usize>,

    /// Number of discrete input coils (DI)
    #[arg(long)]
    di_registers: Option<usize>,

    /// Number of analog output registers (AO)
    #[arg(long)]
    ao_registers: Option<usize>,

    /// Number of analog input registers (AI)
    #[arg(long)]
    ai_registers: Option<usize>,

    /// Output all incoming and outgoing packets to stdout
    #[arg(short, long)]
    monitor: bool,

    /// Do not terminate when the master disconnects
    #[arg(short, long)]
    reconnect: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    store: StoreConfig,
    slave: SlaveConfig,
    reconnect: bool,
}

impl ServerConfig {
    fn apply(&mut self, opts: &Opts) {
        if let Some(ip) = &opts.ip {
            self.slave.bind_ip = ip.clone();
        }
        if let Some(port) = opts.port {
            self.slave.port = port;
        }
        if let Some(prefix) = &opts.name_prefix {
            self.store.name_prefix = prefix.clone();
        }
        if let Some(n) = opts.do_registers {
            self.store.do_size = n;
        }
        if let Some(n) = opts.di_registers {
            self.store.di_size = n;
        }
        if let Some(n) = opts.ao_registers {
            self.store.ao_size = n;
        }
        if let Some(n) = opts.ai_registers {
            self.store.ai_size = n;
        }
        if opts.monitor {
            self.slave.monitor = true;
        }
        if opts.reconnect {
            self.reconnect = true;
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let opts = Opts::parse();

    let mut cfg = match &opts.config {
        Some(path) => match confy::load_path::<ServerConfig>(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("failed to load config '{}': {}", path.display(), e);
                return ExitCode::from(EX_USAGE);
            }
        },
        None => ServerConfig::default(),
    };
    cfg.apply(&opts);

    for (label, count) in [
        ("do", cfg.store.do_size),
        ("di", cfg.store.di_size),
        ("ao", cfg.store.ao_size),
        ("ai", cfg.store.ai_size),
    ] {
        if count > MAX_BANK_CELLS {
            eprintln!(
                "too many {}-registers: {} (maximum: {})",
                label, count, MAX_BANK_CELLS
            );
            return ExitCode::from(EX_USAGE);
        }
    }

    if unsafe { libc::geteuid() } == 0 {
        eprintln!("!!!! WARNING: You should not execute this program with root privileges !!!!");
    }

    let shutdown = Shutdown::new();
    if let Err(e) = shutdown.install_signal_handlers(DEFAULT_GRACE_PERIOD) {
        error!("{}", e);
        return ExitCode::from(EX_OSERR);
    }

    let store = match RegisterStore::create(&cfg.store) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EX_SOFTWARE);
        }
    };

    let slave = match Slave::bind(&cfg.slave, store, shutdown.clone()) {
        Ok(slave) => slave,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EX_SOFTWARE);
        }
    };

    // connection loop: serve one master at a time, forever with --reconnect
    loop {
        info!("waiting for master to establish a connection");
        let mut connection = match slave.connect_client() {
            Ok(Some(connection)) => connection,
            Ok(None) => break,
            Err(e) => {
                error!("{}", e);
                return ExitCode::from(EX_SOFTWARE);
            }
        };

        let mut closed = false;
        while !shutdown.requested() && !closed {
            match connection.handle_request() {
                Ok(RequestOutcome::Served) => {}
                Ok(RequestOutcome::Closed) => closed = true,
                Err(e) => {
                    // a deliberate shutdown is not worth an error report
                    if !shutdown.requested() {
                        error!("{}", e);
                    }
                    break;
                }
            }
        }
        if closed {
            info!("master closed connection");
        }

        if !cfg.reconnect || shutdown.requested() {
            break;
        }
    }

    info!("terminating");
    ExitCode::SUCCESS
}
