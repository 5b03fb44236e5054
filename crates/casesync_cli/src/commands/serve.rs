//! Serve command implementation.
//!
//! Each stdin line is one request whose `originId` names the client tab.
//! Each stdout line is `{"clientId": ..., "message": ...}`.

use casesync_engine::{ConnectionConfig, Engine, EngineConfig, TableCatalog, TableRule, WsRemote};
use casesync_protocol::Request;
use casesync_store::{LocalStore, StoreConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Request type that unregisters a client tab.
pub const CLIENT_CLOSED: &str = "client_closed";

/// Serve command options.
#[derive(Debug)]
pub struct ServeOptions {
    /// Local store directory. In-memory when absent.
    pub data_dir: Option<PathBuf>,
    /// Endpoint to connect to on start.
    pub endpoint: Option<String>,
    /// Namespace to select.
    pub namespace: String,
    /// Database to select.
    pub database: String,
    /// Table caching rules.
    pub catalog: TableCatalog,
}

/// Builds the table catalog from the command-line lists.
pub fn catalog(
    auto_sync: &[String],
    private: &[String],
    case_scoped: &[String],
) -> Result<TableCatalog, String> {
    let mut catalog = TableCatalog::new()
        .with_auto_sync(auto_sync.iter().map(String::as_str))
        .with_private(private.iter().map(String::as_str));
    for spec in case_scoped {
        let (table, field) = spec
            .split_once('=')
            .filter(|(table, field)| !table.is_empty() && !field.is_empty())
            .ok_or_else(|| format!("invalid --case-scoped entry {spec:?}, expected TABLE=FIELD"))?;
        let mut rule = catalog.rule(table);
        rule.case_field = Some(field.to_string());
        catalog = catalog.with_table(table, rule);
    }
    Ok(catalog)
}

/// Runs the serve command until stdin closes.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(options))
}

async fn serve(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let store = match &options.data_dir {
        Some(dir) => LocalStore::open_dir(dir, StoreConfig::default())?,
        None => {
            warn!("no store directory given, state will not survive a restart");
            LocalStore::open_in_memory()?
        }
    };
    let config = EngineConfig::new().with_catalog(options.catalog);
    let engine = Arc::new(
        Engine::builder(config, Arc::new(store), Arc::new(WsRemote::new())).build(),
    );
    engine.start().await?;

    if let Some(endpoint) = options.endpoint {
        let config = ConnectionConfig::new(endpoint, options.namespace, options.database);
        let status = engine.connection().ensure_connection(Some(config)).await;
        info!(state = status.state.as_str(), "initial connection");
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let written = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                warn!(error = %e, "stdout closed");
                break;
            }
        }
    });

    let mut clients: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut inflight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let request = match Request::decode(line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "malformed request line");
                        continue;
                    }
                };
                let Some(origin) = request.origin_id.clone() else {
                    warn!(kind = %request.kind, "request without originId");
                    continue;
                };

                if request.kind == CLIENT_CLOSED {
                    if let Some(forwarder) = clients.remove(&origin) {
                        engine.unregister_client(&origin).await;
                        forwarder.abort();
                    }
                    continue;
                }

                clients
                    .entry(origin.clone())
                    .or_insert_with(|| forward(&engine, origin, out_tx.clone()));
                let engine = engine.clone();
                inflight.spawn(async move {
                    engine.handle_and_reply(&request).await;
                });
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }

    info!("stdin closed, shutting down");
    while inflight.join_next().await.is_some() {}
    engine.shutdown().await;
    for (_, forwarder) in clients {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Registers a client and copies its messages to the output channel.
fn forward(engine: &Engine, client: String, out: mpsc::UnboundedSender<String>) -> JoinHandle<()> {
    let mut rx = engine.register_client(client.clone());
    debug!(client = %client, "client registered");
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = serde_json::json!({
                "clientId": client,
                "message": message.to_json(),
            });
            if out.send(line.to_string()).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn catalog_combines_rules() {
        let catalog = catalog(
            &strings(&["case", "creditor"]),
            &strings(&["note"]),
            &strings(&["creditor=case"]),
        )
        .unwrap();
        assert!(catalog.is_auto_sync("case"));
        assert!(catalog.is_private("note"));
        let creditor = catalog.rule("creditor");
        assert!(creditor.auto_sync);
        assert_eq!(creditor.case_field.as_deref(), Some("case"));
    }

    #[test]
    fn malformed_case_scope_is_rejected() {
        let err = catalog(&[], &[], &strings(&["creditor"])).unwrap_err();
        assert!(err.contains("TABLE=FIELD"));
        assert!(catalog(&[], &[], &strings(&["=case"])).is_err());
    }

    #[test]
    fn case_scope_alone_adds_a_rule() {
        let catalog = catalog(&[], &[], &strings(&["claim=case"])).unwrap();
        assert!(!catalog.is_auto_sync("claim"));
        assert_eq!(catalog.rule("claim"), TableRule::default().case_scoped("case"));
    }
}
