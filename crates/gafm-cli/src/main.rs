use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use gafm_core::{format_days_ago, format_timestamp, short_name, AccountRecord, ComposedResult};
use gafm_sync::{
    DashboardPipeline, DashboardView, MonitorConfig, RefreshController, Refresher, Visibility,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gafm-cli")]
#[command(about = "Google Ads account freshness monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the report once and print the panels
    Fetch {
        /// Print the composed result as JSON instead
        #[arg(long)]
        json: bool,
    },
    /// Keep refreshing until Ctrl-C; stdin accepts r (refresh), h (hide), v (visible), q (quit)
    Watch,
    /// Serve the JSON API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Fetch { json: false }) {
        Commands::Fetch { json } => {
            let pipeline = DashboardPipeline::from_config(&config)?;
            let result = pipeline.fetch_and_compose().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
        }
        Commands::Watch => watch(&config).await?,
        Commands::Serve => {
            let refresher = build_refresher(&config)?;
            gafm_web::serve(&config, refresher).await?;
        }
    }

    Ok(())
}

fn build_refresher(config: &MonitorConfig) -> Result<Refresher> {
    let pipeline = DashboardPipeline::from_config(config)?;
    Ok(Refresher::new(Arc::new(pipeline), Arc::new(DashboardView::new())))
}

async fn watch(config: &MonitorConfig) -> Result<()> {
    let refresher = build_refresher(config)?;
    let controller = RefreshController::new(refresher, config.refresh_interval()).await?;
    controller.init().await?;
    print_view(&controller).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // stdin closed; keep running on the timer alone
                    tokio::signal::ctrl_c().await?;
                    break;
                };
                match line.trim() {
                    "r" => {
                        let _ = controller.refresh_now().await;
                        print_view(&controller).await;
                    }
                    "h" => controller.set_visibility(Visibility::Hidden).await?,
                    "v" => {
                        controller.set_visibility(Visibility::Visible).await?;
                        print_view(&controller).await;
                    }
                    "q" => break,
                    "" => {}
                    other => eprintln!("unknown command {other:?}; use r, h, v or q"),
                }
            }
        }
    }

    info!("stopping monitor");
    controller.shutdown().await
}

async fn print_view(controller: &RefreshController) {
    let snapshot = controller.refresher().view().snapshot().await;
    if let Some(error) = &snapshot.error {
        eprintln!("erro de conexão: {error}");
    }
    if let Some(result) = &snapshot.result {
        print_summary(result);
    }
}

fn print_summary(result: &ComposedResult) {
    let panels = result.panels();
    let (ok, warning, critical) = panels.counts();

    println!(
        "atualização: {}",
        format_timestamp(result.updated_at.as_deref(), &Local)
    );
    println!("ok: {ok}  warning: {warning}  critical: {critical}");

    println!("\ngestores");
    if result.managers.is_empty() {
        println!("  sem dados de gestores");
    }
    for (rank, manager) in result.managers.iter().enumerate() {
        println!(
            "  #{:<3}{:<16}{:>6}d  {:<8}{:>5.1}%  ({} contas)",
            rank + 1,
            short_name(Some(manager.name.as_str())),
            manager.avg,
            manager.band(),
            manager.bar_width_percent(),
            manager.total
        );
    }

    for (title, accounts) in [
        ("ok", &panels.ok),
        ("warning", &panels.warning),
        ("critical", &panels.critical),
    ] {
        println!("\n{title} ({})", accounts.len());
        for account in accounts.iter() {
            print_account(account);
        }
    }
}

fn print_account(account: &AccountRecord) {
    println!(
        "  [{:<8}] {:<40} {:<12} {}",
        account.status,
        account.display_name(),
        short_name(account.manager().as_deref()),
        format_days_ago(account.days_since_update())
    );
}
