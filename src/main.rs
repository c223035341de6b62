use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;
use mcproxy_core::bedrock::motd::MotdCache;
use mcproxy_core::bedrock::snapshot::ControllerSnapshot;
use mcproxy_core::config::{ConfigPaths, ConfigProvider};
use mcproxy_core::controller::{ControllerDeps, ProxyServer};
use mcproxy_core::dialer::ProxyDialer;
use mcproxy_core::outbound::manager::OutboundManager;
use mcproxy_core::persistence::{InMemoryAclRepository, LoggingSessionRepository};
use mcproxy_core::registry::SessionRegistry;
use mcproxy_core::snapshot::{read_snapshot_file, write_snapshot_file, RecoverableProxyServer};
use simple_logger::SimpleLogger;
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Directory holding `servers.json`, `proxy_outbounds.json` and
    /// `global.json`.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    config_dir: PathBuf,
    /// Verbose level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Disable reading from standard input for commands.
    #[arg(long)]
    ignore_stdin: bool,
    /// Disable colors from output.
    #[arg(long)]
    no_color: bool,
    /// Raise the maximum number of open files allowed to avoid issues.
    ///
    /// Not enabled by default as it may not work in all environments.
    #[arg(long)]
    raise_ulimit: bool,
    /// File to read & write the recovery snapshot to.
    #[arg(long, value_name = "FILE", default_value = ".mcproxy_recover")]
    recovery_snapshot_file: PathBuf,
    /// Admin HTTP API bind address. Leave unset to disable it.
    #[cfg(feature = "http_api")]
    #[arg(long, value_name = "ADDR")]
    http_bind: Option<String>,
}

fn main() {
    let args = Args::parse();
    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_colors(!args.no_color)
        .init()
        .unwrap();

    if args.raise_ulimit {
        let ulimit = fdlimit::raise_fd_limit().unwrap_or(0);
        log::info!("Raised ulimit to {}", ulimit);
    }

    run(args);
}

#[tokio::main]
async fn run(args: Args) {
    let paths = ConfigPaths {
        servers: args.config_dir.join("servers.json"),
        outbounds: args.config_dir.join("proxy_outbounds.json"),
        global: args.config_dir.join("global.json"),
    };

    let config = match ConfigProvider::load(paths).await {
        Ok(config) => config,
        Err(err) => {
            log::error!("could not load configuration: {err}");
            return;
        }
    };

    let snapshot: Option<ControllerSnapshot> = match read_snapshot_file(&args.recovery_snapshot_file) {
        Ok(Some(snapshot)) if snapshot.has_expired() => {
            log::warn!("recovery snapshot file exists but is stale, ignoring");
            None
        }
        Ok(snapshot) => {
            if snapshot.is_some() {
                log::info!("recovering sessions from recovery snapshot");
            }
            snapshot
        }
        Err(err) => {
            log::error!(
                "could not read recovery snapshot ({}): {err}",
                args.recovery_snapshot_file.to_string_lossy()
            );
            None
        }
    };

    let acl_repo = Arc::new(InMemoryAclRepository::default());
    let session_repo = Arc::new(LoggingSessionRepository);
    let registry = SessionRegistry::new();
    let outbound_manager = OutboundManager::new();
    outbound_manager.reload(config.snapshot().await.outbounds.clone()).await;
    let dialer = Arc::new(ProxyDialer::new(outbound_manager.clone()));
    let motd_cache = Arc::new(MotdCache::new());

    let proxy = ProxyServer::new(ControllerDeps {
        config: config.clone(),
        acl_repo,
        session_repo,
        registry,
        outbound_manager,
        dialer,
        motd_cache,
    });

    if let Err(err) = proxy.start().await {
        log::error!("failed to start proxy: {err}");
        return;
    }

    if let Err(err) = config.watch() {
        log::warn!("could not start config file watcher: {err}");
    }

    if let Some(snapshot) = snapshot {
        proxy.recover_from_snapshot(snapshot).await;
    }

    #[cfg(feature = "http_api")]
    if let Some(bind) = args.http_bind.clone() {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            if let Err(err) = mcproxy_http_api::start(&bind, proxy).await {
                log::error!("admin HTTP API exited: {err}");
            }
        });
    }

    if !args.ignore_stdin {
        tokio::spawn({
            let proxy = proxy.clone();
            let config = config.clone();
            let recovery_snapshot_file = args.recovery_snapshot_file.clone();
            async move {
                log::info!("console commands enabled");
                run_stdin_handler(proxy, config, recovery_snapshot_file).await;
            }
        });
    }

    let recovery_snapshot_file = args.recovery_snapshot_file.clone();
    let proxy_for_signals = proxy.clone();
    let config_for_signals = config.clone();
    let shutdown = tokio::spawn(async move {
        let mut shutdown_requests = 0;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    shutdown_requests += 1;
                    if shutdown_requests >= 3 {
                        exit(1);
                    }
                    log::info!("shutdown requested, taking recovery snapshot...");
                    if take_and_write_snapshot(&proxy_for_signals, &recovery_snapshot_file).await {
                        break;
                    }
                }
                _ = config_for_signals.wait_reload() => {
                    log::info!("configuration reloaded");
                }
            }
        }
    });

    let _ = shutdown.await;
    proxy.stop().await;
}

async fn take_and_write_snapshot(proxy: &Arc<ProxyServer>, path: &std::path::Path) -> bool {
    match proxy.take_snapshot().await {
        Ok(snapshot) => match write_snapshot_file(path, &snapshot) {
            Ok(_) => true,
            Err(err) => {
                log::error!("failed to write recovery snapshot: {err}");
                false
            }
        },
        Err(err) => {
            log::error!("failed to take recovery snapshot: {err}");
            false
        }
    }
}

async fn run_stdin_handler(proxy: Arc<ProxyServer>, config: Arc<ConfigProvider>, recovery_snapshot_file: PathBuf) {
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        let mut buf = String::new();
        if let Err(err) = reader.read_line(&mut buf).await {
            log::error!("error reading console input: {err}");
            continue;
        }
        let line = buf.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        match parts.next().map(str::to_lowercase).as_deref() {
            Some("reload") => {
                if let Err(err) = config.reload().await {
                    log::error!("reload rejected: {err}");
                } else {
                    log::info!("configuration reloaded");
                }
            }
            Some("list") => {
                use mcproxy_api::provider::AdminApiRead;
                for server in proxy.list_servers().await {
                    log::info!(
                        "{}: target={} enabled={} listening={} sessions={}",
                        server.id, server.target, server.enabled && !server.disabled, server.listening, server.session_count
                    );
                }
            }
            Some("sessions") => {
                use mcproxy_api::provider::AdminApiRead;
                for session in proxy.list_sessions().await {
                    log::info!(
                        "{} on {}: player={:?} up={}B down={}B",
                        session.client_addr, session.server_id, session.display_name, session.bytes_up, session.bytes_down
                    );
                }
            }
            Some("kick") => match parts.next() {
                Some(name) => {
                    use mcproxy_api::provider::AdminApiWrite;
                    match proxy.kick_player(name).await {
                        Ok(count) => log::info!("kicked {count} session(s) for '{name}'"),
                        Err(err) => log::error!("kick failed: {err}"),
                    }
                }
                None => log::warn!("usage: kick <player-name>"),
            },
            Some("recover-able-shutdown") | Some("ras") => {
                take_and_write_snapshot(&proxy, &recovery_snapshot_file).await;
            }
            _ => log::warn!("unknown command '{line}'"),
        }
    }
}
