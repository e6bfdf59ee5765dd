use super::config::{resolve_config_path, SwitchboardConfig};
use super::open_store;
use switchboard::store::InstanceRecord;

/// List persisted instance records
pub async fn execute(config: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = SwitchboardConfig::load_or_default(&resolve_config_path(config))?;
    let docs = open_store(&config).await?;
    let records = InstanceRecord::list(&docs).await?;
    docs.close().await;

    if records.is_empty() {
        println!("No instances");
        return Ok(());
    }

    println!("{}", format_header());
    for record in &records {
        println!("{}", format_row(record));
    }
    Ok(())
}

fn format_header() -> String {
    format!("{:<24} {:<6} {:<6} CALLBACK", "ID", "KEY", "POLLS")
}

fn format_row(record: &InstanceRecord) -> String {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    format!(
        "{:<24} {:<6} {:<6} {}",
        record.id,
        yes_no(record.access_key.is_some()),
        yes_no(record.poll_events),
        record.callback_url.as_deref().unwrap_or("-")
    )
}
