mod server;

use clap::Parser;
use mnode_core::config::{
    parse_tag_list, AgentConfig, CoreSettings, DispatchSettings, SupervisorSettings, TlsMaterial,
    DEFAULT_LOG_CAPACITY,
};
use mnode_core::launcher::CoreLauncher;
use mnode_core::AgentService;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::server::ServerConfig;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    handshake_timeout: Duration,
    log_dir: String,
    write_timeout: Duration,
    queue_capacity: usize,
    agent: AgentConfig,
}

#[derive(Parser, Debug)]
#[command(name = "mnode-agent")]
struct Args {
    #[arg(long, env = "SERVICE_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "SERVICE_PORT", default_value_t = 62050)]
    port: u16,
    #[arg(long, env = "XRAY_EXECUTABLE_PATH", default_value = "/usr/local/bin/xray")]
    xray_executable_path: PathBuf,
    #[arg(long, env = "XRAY_ASSETS_PATH", default_value = "/usr/local/share/xray")]
    xray_assets_path: PathBuf,
    /// Comma separated inbound tags to keep; empty keeps all.
    #[arg(long, env = "XRAY_INBOUNDS", default_value = "")]
    xray_inbounds: String,
    #[arg(long, default_value_t = false)]
    singbox_enabled: bool,
    #[arg(long, env = "SINGBOX_EXECUTABLE_PATH", default_value = "/usr/local/bin/sing-box")]
    singbox_executable_path: PathBuf,
    #[arg(long, env = "SINGBOX_WORKING_DIR", default_value = "/var/lib/marzban-node")]
    singbox_working_dir: PathBuf,
    #[arg(long, env = "SINGBOX_INBOUNDS", default_value = "")]
    singbox_inbounds: String,
    #[arg(long, env = "SSL_CERT_FILE", default_value = "/var/lib/marzban-node/ssl_cert.pem")]
    ssl_cert_file: PathBuf,
    #[arg(long, env = "SSL_KEY_FILE", default_value = "/var/lib/marzban-node/ssl_key.pem")]
    ssl_key_file: PathBuf,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, env = "MNODE_LOG_DIR", default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 5)]
    terminate_timeout: u64,
    #[arg(long, default_value_t = 3)]
    probe_timeout: u64,
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "agent_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(
        event = "agent_start",
        addr = %config.addr,
        xray = %config.agent.xray.launcher.program().display(),
        sing_box_enabled = config.agent.sing_box.enabled,
        xray_inbounds = ?config.agent.xray.inbounds,
        sing_box_inbounds = ?config.agent.sing_box.inbounds
    );

    let server_config = ServerConfig {
        handshake_timeout: config.handshake_timeout,
        write_timeout: config.write_timeout,
        queue_capacity: config.queue_capacity,
        debug: config.debug,
    };
    let service = Arc::new(AgentService::new(Arc::new(config.agent)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "agent_interrupt");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = server::run(listener, service, server_config, shutdown_rx).await {
        error!(event = "agent_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("DEBUG");
    let singbox_enabled = args.singbox_enabled || env_true("SINGBOX_ENABLED");

    let agent = AgentConfig {
        xray: CoreSettings {
            enabled: true,
            launcher: CoreLauncher::xray(args.xray_executable_path, &args.xray_assets_path),
            inbounds: parse_tag_list(&args.xray_inbounds),
        },
        sing_box: CoreSettings {
            enabled: singbox_enabled,
            launcher: CoreLauncher::sing_box(args.singbox_executable_path, args.singbox_working_dir),
            inbounds: parse_tag_list(&args.singbox_inbounds),
        },
        tls: TlsMaterial {
            cert_path: args.ssl_cert_file,
            key_path: args.ssl_key_file,
        },
        supervisor: SupervisorSettings {
            terminate_timeout: Duration::from_secs(args.terminate_timeout),
            log_capacity: args.log_capacity,
            echo_logs: debug,
        },
        dispatch: DispatchSettings::default(),
        probe_timeout: Duration::from_secs(args.probe_timeout),
    };

    Config {
        addr: format!("{}:{}", args.host, args.port),
        debug,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        log_dir: args.log_dir,
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: 256,
        agent,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(config.debug, std::env::var("MNODE_LOG_LEVEL").ok())));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

/// `MNODE_LOG_LEVEL` beats the debug switch; `RUST_LOG` beats both.
fn default_level(debug: bool, configured: Option<String>) -> String {
    match configured {
        Some(level) if !level.trim().is_empty() => level,
        _ if debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees formatted records to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("mnode-agent.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
