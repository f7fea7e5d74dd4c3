// # Query-Execution Core — Coordinator Process
//
// Entry point for one node of the cluster. Initializes structured logging,
// loads the cluster configuration, and starts the process awaiting queries.

use pargres_exchange::config::ClusterConfig;
use pargres_exchange::{Result, VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = ClusterConfig::default();
    config.validate()?;

    print_config(&config);

    info!("starting node {} of {}", config.node, config.nnodes);

    let (eport_start, eport_end) = config.eport_range();
    info!(
        "exchange port pool: [{}, {})",
        eport_start, eport_end
    );

    println!();
    println!("╭─────────────────────────────────────────────────────────╮");
    println!("│  node {} ready                                            │", config.node);
    println!(
        "│  SQL listener:      {}:{:<10}                       │",
        config.host(config.node).unwrap_or("?"),
        config.sql_port(config.node).unwrap_or(0)
    );
    println!("╰─────────────────────────────────────────────────────────╯");
    println!();

    info!("node {} idle, awaiting queries", config.node);

    Ok(())
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║   distributed query-execution core v{:<24}║", VERSION);
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_config(config: &ClusterConfig) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ CLUSTER CONFIGURATION                                       │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│   node:    {:<50} │", config.node);
    println!("│   nnodes:  {:<50} │", config.nnodes);
    println!("│   eports:  {:<50} │", config.eports);
    for (i, (host, port)) in config.hosts.iter().zip(config.ports.iter()).enumerate() {
        println!("│   peer {}:  {:<50} │", i, format!("{}:{}", host, port));
    }
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
}
