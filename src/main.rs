use anyhow::Result;
use clap::{Parser, Subcommand};
use raftkv::tls::CaCertificate;
use raftkv::{NodeConfig, Server};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "raftkv")]
#[command(about = "Replicated key-value store node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(short, long, default_value = "raftkv.toml")]
        config: PathBuf,
    },
    Init {
        #[arg(short, long, default_value = "raftkv.toml")]
        config: PathBuf,
    },
    /// Generate a cluster CA and one certificate per node.
    Certs {
        #[arg(short, long, default_value = "certs")]
        out: PathBuf,

        #[arg(long, default_value = "raftkv")]
        cluster: String,

        #[arg(short, long = "node", required = true)]
        nodes: Vec<String>,

        /// Extra host names and IPs to include in every node certificate.
        #[arg(long = "san")]
        sans: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raftkv=info,openraft=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config: config_path } => {
            run_node(config_path).await?;
        }
        Commands::Init { config: config_path } => {
            init_config(config_path)?;
        }
        Commands::Certs {
            out,
            cluster,
            nodes,
            sans,
        } => {
            generate_certs(out, &cluster, &nodes, &sans)?;
        }
    }

    Ok(())
}

async fn run_node(config_path: PathBuf) -> Result<()> {
    let mut config = if config_path.exists() {
        info!("Loading config from {:?}", config_path);
        NodeConfig::load(&config_path)?
    } else {
        info!("Config file not found, using defaults");
        NodeConfig::default()
    };
    config.apply_env()?;

    let server = Server::start(config).await?;
    info!(
        "Node {} serving on {} (gossip {})",
        server.node_name(),
        server.rpc_addr(),
        server.gossip_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = server.close().await {
        error!("Shutdown failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn init_config(config_path: PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config file already exists: {:?}", config_path);
    }

    let config = NodeConfig::default();
    config.save(&config_path)?;
    println!("Created config file: {:?}", config_path);
    println!("\nEdit the config file to:");
    println!("  - Set a unique node_name");
    println!("  - Set bootstrap = true on exactly one node of a new cluster");
    println!("  - List gossip seeds in start_join_addrs on the others");

    Ok(())
}

fn generate_certs(out: PathBuf, cluster: &str, nodes: &[String], sans: &[String]) -> Result<()> {
    std::fs::create_dir_all(&out)?;

    let ca = CaCertificate::generate(cluster)?;
    ca.save(out.join("ca.crt"), out.join("ca.key"))?;
    println!("Wrote CA to {:?}", out.join("ca.crt"));

    let (ips, hostnames): (Vec<String>, Vec<String>) = sans
        .iter()
        .cloned()
        .chain(["localhost".to_string(), "127.0.0.1".to_string()])
        .partition(|s| s.parse::<std::net::IpAddr>().is_ok());

    for node in nodes {
        let cert = ca.sign_node(node, &hostnames, &ips)?;
        let cert_path = out.join(format!("{}.crt", node));
        let key_path = out.join(format!("{}.key", node));
        cert.save(&cert_path, &key_path)?;
        println!("Wrote certificate for {} to {:?}", node, cert_path);
    }

    Ok(())
}
