use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use portal_scout::browser_manager::BrowserPool;
use portal_scout::core::config::load_scout_config;
use portal_scout::core::sink::JsonLinesSink;
use portal_scout::replay::ReplaySite;
use portal_scout::scraping::page::PageSource;
use portal_scout::{FilterSet, PersonKind, ResultScope, ScoutState, SearchQuery};

const USAGE: &str = "usage: portal-scout <cpf|cnpj|name> [--mode cpf|cnpj] [--limit N] \
[--filter key=value]... [--search-only | --category LABEL...] [--replay DIR] [--out FILE]";

#[derive(Debug, Default)]
struct CliArgs {
    term: Option<String>,
    mode: Option<PersonKind>,
    limit: Option<usize>,
    filters: Vec<String>,
    search_only: bool,
    categories: BTreeSet<String>,
    replay: Option<PathBuf>,
    out: Option<PathBuf>,
}

fn flag_value(name: &str, args: &mut impl Iterator<Item = String>) -> anyhow::Result<String> {
    args.next().ok_or_else(|| anyhow!("{} needs a value\n{}", name, USAGE))
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut args = raw.into_iter();
    while let Some(a) = args.next() {
        let (name, inline) = match a.split_once('=') {
            Some((n, v)) if n.starts_with("--") => (n.to_string(), Some(v.to_string())),
            _ => (a.clone(), None),
        };
        let mut value = |name: &str| match inline.clone() {
            Some(v) => Ok(v),
            None => flag_value(name, &mut args),
        };
        match name.as_str() {
            "--mode" => {
                let v = value("--mode")?;
                cli.mode = Some(PersonKind::parse(&v).ok_or_else(|| anyhow!("unknown mode `{}`", v))?);
            }
            "--limit" => {
                cli.limit = Some(value("--limit")?.parse().context("--limit expects a number")?);
            }
            "--filter" => cli.filters.push(value("--filter")?),
            "--category" => {
                cli.categories.insert(value("--category")?);
            }
            "--replay" => cli.replay = Some(PathBuf::from(value("--replay")?)),
            "--out" => cli.out = Some(PathBuf::from(value("--out")?)),
            "--search-only" => cli.search_only = true,
            "-h" | "--help" => bail!("{}", USAGE),
            other if other.starts_with("--") => bail!("unknown option `{}`\n{}", other, USAGE),
            _ if cli.term.is_none() => cli.term = Some(a),
            _ => bail!("unexpected argument `{}`\n{}", a, USAGE),
        }
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON envelope.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(std::env::args().skip(1))?;
    let term = cli.term.clone().ok_or_else(|| anyhow!("{}", USAGE))?;

    let config = load_scout_config();

    let filters = FilterSet::from_pairs(cli.filters.iter().map(String::as_str))?;
    let limit = cli.limit.unwrap_or(portal_scout::PORTAL_RESULT_CAP);
    let query = match cli.mode {
        Some(mode) => SearchQuery::with_mode(&term, mode, filters, limit)?,
        None => SearchQuery::new(&term, filters, limit)?,
    };
    let scope = if cli.search_only {
        ResultScope::SearchOnly
    } else if cli.categories.is_empty() {
        ResultScope::Full
    } else {
        ResultScope::Categories(cli.categories.clone())
    };

    let mut pool: Option<Arc<BrowserPool>> = None;
    let pages: Arc<dyn PageSource> = match &cli.replay {
        Some(dir) => {
            info!("replaying recorded pages from {}", dir.display());
            Arc::new(ReplaySite::from_dir(dir).await?)
        }
        None => {
            let p = BrowserPool::discover(config.chrome_executable.as_deref(), config.headless)
                .ok_or_else(|| {
                    anyhow!("No browser found. Install Brave, Chrome, or Chromium, or set CHROME_EXECUTABLE.")
                })?;
            pool = Some(p.clone());
            p
        }
    };

    let sink = match cli.out {
        Some(path) => JsonLinesSink::File(path),
        None => JsonLinesSink::Stdout,
    };
    let state = ScoutState::new(config, pages)?.with_sink(Arc::new(sink));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = state.execute(&query, &scope, &cancel).await;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }

    let envelope = result?;
    if envelope.is_degraded() {
        warn!(
            partial_failures = envelope.partial_failures.len(),
            "run finished with partial failures"
        );
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    warn!("interrupted, cancelling run");
    cancel.cancel();
}
