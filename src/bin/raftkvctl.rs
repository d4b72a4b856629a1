use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "raftkvctl")]
#[command(about = "CLI for a raftkv cluster")]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8400")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
    Servers,
    Status,
    Members,
}

async fn print_json(client: &reqwest::Client, url: String) -> Result<()> {
    let resp: Value = client.get(url).send().await?.json().await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base_url = cli.addr.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Get { key } => {
            let resp = client.get(format!("{}/keys/{}", base_url, key)).send().await?;
            match resp.status() {
                StatusCode::OK => println!("{}", String::from_utf8_lossy(&resp.bytes().await?)),
                StatusCode::NOT_FOUND => bail!("key not found: {}", key),
                _ => bail!("get failed: {}", error_message(resp).await),
            }
        }
        Commands::Set { key, value } => {
            let resp = client
                .put(format!("{}/keys/{}", base_url, key))
                .body(value.clone())
                .send()
                .await?;

            // A follower answers with the leader's address; retry there once.
            let resp = if resp.status() == StatusCode::CONFLICT {
                let body: Value = resp.json().await?;
                let Some(leader) = body.get("leader").and_then(Value::as_str) else {
                    bail!("no leader known, try again later");
                };
                let scheme = if base_url.starts_with("https://") { "https" } else { "http" };
                client
                    .put(format!("{}://{}/keys/{}", scheme, leader, key))
                    .body(value)
                    .send()
                    .await?
            } else {
                resp
            };

            if !resp.status().is_success() {
                bail!("set failed: {}", error_message(resp).await);
            }
            println!("OK");
        }
        Commands::Servers => print_json(&client, format!("{}/servers", base_url)).await?,
        Commands::Status => print_json(&client, format!("{}/status", base_url)).await?,
        Commands::Members => print_json(&client, format!("{}/members", base_url)).await?,
    }

    Ok(())
}
