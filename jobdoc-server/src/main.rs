//! # jobdoc-server
//!
//! Runs the collaborative editing server for job description documents.
//!
//! ```text
//! jobdoc-server --bind 0.0.0.0:9090 --documents ./jobs
//!   ws://host:9090/sessions/{session_id}?user_id=..&document_ref=..
//!   document_ref "senior-rust" → ./jobs/senior-rust.txt
//! ```
//!
//! Logging goes through `env_logger`; set `RUST_LOG=info` (or `debug`) to see it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use jobdoc_collab::documents::{AnyDocument, DirectoryDocuments, DocumentSource};
use jobdoc_collab::server::{ServerConfig, SyncServer};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "jobdoc-server")]
#[command(about = "Real-time collaborative editing server for job descriptions")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long = "bind", env = "JOBDOC_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind_addr: String,

    /// Directory of `<document_ref>.txt` seed files; every reference is accepted when omitted
    #[arg(long = "documents", value_name = "DIR", env = "JOBDOC_DOCUMENTS_DIR")]
    documents_dir: Option<PathBuf>,

    /// Frames buffered per connection before it is dropped as lagging
    #[arg(long, env = "JOBDOC_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Accepted operations kept per session for rebasing late edits
    #[arg(long, env = "JOBDOC_HISTORY_LIMIT", default_value_t = 1000)]
    history_limit: usize,
}

impl Cli {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            outbound_capacity: self.outbound_capacity,
            history_limit: self.history_limit,
        }
    }

    fn documents(&self) -> Result<Arc<dyn DocumentSource>, String> {
        match &self.documents_dir {
            Some(dir) if !dir.is_dir() => Err(format!("{} is not a directory", dir.display())),
            Some(dir) => {
                info!("Serving documents from {}", dir.display());
                Ok(Arc::new(DirectoryDocuments::new(dir)))
            }
            None => {
                info!("No document directory given, accepting every document reference");
                Ok(Arc::new(AnyDocument))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting jobdoc-server...");

    let server = SyncServer::new(cli.to_config(), cli.documents()?);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.stats().await;
    info!(
        "Stopped after {} connections and {} messages",
        stats.total_connections, stats.total_messages
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["jobdoc-server"]).unwrap();
        let config = cli.to_config();
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.history_limit, 1000);
        assert!(cli.documents().is_ok());
    }

    #[test]
    fn test_flags() {
        let dir = std::env::temp_dir();
        let cli = Cli::try_parse_from([
            "jobdoc-server",
            "--bind",
            "0.0.0.0:8080",
            "--documents",
            dir.to_str().unwrap(),
            "--history-limit",
            "10",
        ])
        .unwrap();
        assert_eq!(cli.to_config().bind_addr, "0.0.0.0:8080");
        assert_eq!(cli.to_config().history_limit, 10);
        assert!(cli.documents().is_ok());
    }

    #[test]
    fn test_missing_document_dir() {
        let cli = Cli::try_parse_from([
            "jobdoc-server",
            "--documents",
            "/definitely/not/a/real/dir",
        ])
        .unwrap();
        assert!(cli.documents().is_err());
    }
}
