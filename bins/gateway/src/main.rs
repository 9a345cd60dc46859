mod app;
mod module;
mod scheduler;
#[cfg(feature = "web-api")]
mod web;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use gateway_core::cfg::{self, AppId, Config};
use gateway_core::logx;

use crate::app::{load_registry, Gateway};
use crate::module::{Module, ModuleCtx};
use crate::scheduler::Scheduler;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Building-control gateway: macros and schedules")]
struct Cli {
    /// Config file (default: per-user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: schedule runner plus web API.
    Run {
        /// Offline device back end and in-memory store.
        #[arg(long)]
        mock: bool,
    },
    /// Validate the macro catalog and exit.
    Check,
    /// Print the resolved step tree of a macro.
    Expand { key: String },
    /// Print the macro catalog and button layout.
    Macros {
        #[arg(long)]
        page: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match real_main(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn real_main(cli: Cli) -> Result<ExitCode> {
    let (cfg, base) = match &cli.config {
        Some(path) => {
            let cfg = cfg::load_or_init_at(path)?;
            let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (cfg, base)
        }
        None => cfg::load_or_init(&APP)?,
    };
    let level = match cli.verbose { 0 => cfg.log_level.as_str(), 1 => "debug", _ => "trace" };
    logx::init(level);

    match cli.cmd {
        Command::Run { mock } => {
            run(cfg, base, mock)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let reg = load_registry(&cfg, &base)?;
            let issues = reg.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if issues.is_empty() {
                println!("catalog ok: {} macros", reg.len());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{} problem(s) in {} macros", issues.len(), reg.len());
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Expand { key } => {
            let reg = load_registry(&cfg, &base)?;
            let tree = reg.expand(&key)?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Macros { page } => {
            let reg = load_registry(&cfg, &base)?;
            let out = match page {
                Some(p) => serde_json::json!({ "macros": reg.catalog(), "buttons": reg.buttons(&p) }),
                None => serde_json::json!({ "macros": reg.catalog(), "buttons": reg.all_buttons() }),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    #[cfg(feature = "rt-single")]
    let mut b = tokio::runtime::Builder::new_current_thread();
    #[cfg(not(feature = "rt-single"))]
    let mut b = {
        let mut b = tokio::runtime::Builder::new_multi_thread();
        b.worker_threads(num_cpus::get().max(2));
        b
    };
    b.enable_all().build().context("build tokio runtime")
}

fn run(cfg: Config, base: PathBuf, mock: bool) -> Result<()> {
    let rt = runtime()?;
    rt.block_on(async move {
        let gw = Arc::new(Gateway::open(&cfg, &base, mock)?);
        info!("{} boot backend={} macros={}", APP.application, gw.backend, gw.registry().len());
        for issue in gw.registry().validate() {
            warn!("catalog: {issue}");
        }

        let (tx, rx) = tokio::sync::watch::channel(false);
        let ctx = ModuleCtx { gw, shutdown: rx };

        let mut modules: Vec<Box<dyn Module>> = vec![Box::new(Scheduler::new(Duration::from_secs(cfg.scheduler.tick_secs)))];
        #[cfg(feature = "web-api")]
        modules.push(Box::new(web::WebServer::new(
            parse_addr(cfg.web.http_addr.as_deref())?,
            parse_addr(cfg.web.https_addr.as_deref())?,
            cfg.web.tls_cert_pem.clone(),
            cfg.web.tls_key_pem.clone(),
        )));

        let mut handles = Vec::new();
        for m in modules {
            info!("starting module {}", m.name());
            let name = m.name();
            handles.push((name, m.spawn(ctx.clone())));
        }

        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        info!("shutdown requested");
        let _ = tx.send(true);

        for (name, h) in handles {
            match h.await {
                Ok(Ok(())) => info!("module {name} stopped"),
                Ok(Err(e)) => warn!("module {name} failed: {e:#}"),
                Err(e) => warn!("module {name} panicked: {e}"),
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(feature = "web-api")]
fn parse_addr(s: Option<&str>) -> Result<Option<std::net::SocketAddr>> {
    s.filter(|s| !s.is_empty())
        .map(|s| s.parse::<std::net::SocketAddr>().with_context(|| format!("bad listen address `{s}`")))
        .transpose()
}
