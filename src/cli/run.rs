use super::config::{default_db_path, resolve_config_path, SwitchboardConfig};
use super::open_store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard::session::{CreateOptions, InstanceStatus, SessionError, SessionManager};
use switchboard::transport::{InstanceId, MockNetwork};
use switchboard::webhook::{EventDispatcher, HttpEventSink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run the session manager
///
/// Restores every persisted instance, optionally creates new ones, and keeps
/// running until Ctrl-C. Sessions use the in-process mock network; webhooks
/// are delivered over HTTP to each instance's callback URL.
///
/// ## Configuration Loading
///
/// 1. `--config` flag if provided
/// 2. Default config at `~/.local/share/switchboard/config.toml`
///
/// If the config file doesn't exist, a default one is generated.
pub async fn execute(
    config: Option<String>,
    create: Vec<String>,
    callback_url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = resolve_config_path(config);
    let config = if config_path.exists() {
        SwitchboardConfig::load(&config_path)?
    } else {
        println!("No config file found. Creating default configuration...");
        SwitchboardConfig::create_default(&config_path, &default_db_path())?;
        println!("   Created: {}", config_path.display());
        SwitchboardConfig::load(&config_path)?
    };
    init_logging(&config.logging.level);

    let docs = Arc::new(open_store(&config).await?);
    let sink = HttpEventSink::new(config.webhook_timeout()?)?;
    let manager = SessionManager::new(
        Arc::new(MockNetwork::new()),
        docs.clone(),
        EventDispatcher::new(Arc::new(sink)),
        config.session_config()?,
    );

    let restored = manager.restore_instances().await?;
    for id in &create {
        let options = CreateOptions {
            callback_url: callback_url.clone(),
            ..CreateOptions::default()
        };
        match manager.create(id, options).await {
            Ok(()) => info!(instance = %id, "created instance"),
            Err(SessionError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    println!("Database: {}", config.storage.db_path.display());
    println!("Restored {} instance(s). Press Ctrl-C to stop.", restored);

    let mut shown = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = ticker.tick() => show_pairing_codes(&manager, &mut shown).await,
        }
    }

    println!("Shutting down...");
    manager.shutdown().await;
    docs.close().await;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Print each pairing code once, as text and as a terminal QR code
async fn show_pairing_codes(manager: &SessionManager, shown: &mut HashMap<InstanceId, String>) {
    let instances = match manager.list_instances().await {
        Ok(instances) => instances,
        Err(e) => {
            warn!(error = %e, "failed to list instances");
            return;
        }
    };

    for summary in instances {
        if summary.status != InstanceStatus::Pairing {
            shown.remove(&summary.id);
            continue;
        }
        let Ok(Some(code)) = manager.pairing_code(summary.id.as_str()).await else {
            continue;
        };
        if shown.get(&summary.id) == Some(&code) {
            continue;
        }

        println!();
        println!("Pairing code for {}: {}", summary.id, code);
        if let Err(e) = qr2term::print_qr(&code) {
            warn!(instance = %summary.id, error = %e, "failed to render pairing QR");
        }
        shown.insert(summary.id, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard::store::MemoryDocumentStore;
    use switchboard::webhook::ChannelEventSink;

    #[tokio::test]
    async fn test_pairing_codes_are_shown_once() {
        let (sink, _rx) = ChannelEventSink::channel();
        let manager = SessionManager::new(
            Arc::new(MockNetwork::new()),
            Arc::new(MemoryDocumentStore::new()),
            EventDispatcher::new(Arc::new(sink)),
            Default::default(),
        );
        manager.create("acct1", CreateOptions::default()).await.unwrap();

        let id = InstanceId::new("acct1");
        let mut shown = HashMap::new();
        for _ in 0..50 {
            show_pairing_codes(&manager, &mut shown).await;
            if shown.contains_key(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(shown[&id].starts_with("mock-qr-acct1"));
        manager.shutdown().await;
    }
}
