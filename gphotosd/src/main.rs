use std::path::PathBuf;

use gphotosd::daemon::{DaemonConfig, DaemonRuntime, format_unix_time};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "gphotosd=info,gphotos_core=info";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Sync,
    Upload(Vec<PathBuf>),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mode = match first.as_str() {
        "run" => CliMode::Run,
        "sync" => CliMode::Sync,
        "upload" => {
            let paths: Vec<PathBuf> = args.by_ref().map(PathBuf::from).collect();
            if paths.is_empty() {
                anyhow::bail!("upload needs at least one file");
            }
            CliMode::Upload(paths)
        }
        "--help" | "-h" | "help" => CliMode::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_usage() {
    println!("Usage: gphotosd [run | sync | upload <file>...]");
    println!("  run            Keep the local mirror in sync until interrupted (default)");
    println!("  sync           Run one sync cycle and print its counters");
    println!("  upload <file>  Upload files, then refresh the mirror");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.cancel_on_ctrl_c();

    match mode {
        CliMode::Run => {
            #[cfg(unix)]
            daemon.trigger_on_hangup()?;
            daemon.run().await
        }
        CliMode::Sync => {
            let report = daemon.sync_once().await?;
            let cursor = daemon.engine().store().get_cursor().await?;
            println!(
                "updated={} deleted={} pages={} initialized={}",
                report.updated, report.deleted, report.pages, report.initialized
            );
            if let Some(at) = cursor.last_sync_at.and_then(format_unix_time) {
                println!("last sync: {at}");
            }
            Ok(())
        }
        CliMode::Upload(paths) => {
            let report = daemon.upload(paths).await;
            for (path, media_key) in &report.succeeded {
                println!("{}\t{media_key}", path.display());
            }
            println!(
                "succeeded={} duplicates={} failed={} skipped={} bytes={}",
                report.succeeded.len(),
                report.duplicates,
                report.failed,
                report.skipped,
                report.bytes_uploaded
            );
            if report.failed > 0 {
                anyhow::bail!("{} file(s) failed to upload", report.failed);
            }
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}
