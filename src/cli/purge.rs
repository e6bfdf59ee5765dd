use super::config::{resolve_config_path, SwitchboardConfig};
use super::open_store;
use std::io::{self, Write};
use switchboard::store::{Collection, DocumentStore};

/// Delete the instance record, credentials and message history of `id`.
///
/// Only for instances that are not running; a running manager would keep
/// writing its in-memory state back.
pub async fn execute(
    id: String,
    config: Option<String>,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SwitchboardConfig::load_or_default(&resolve_config_path(config))?;

    if !yes && !confirm_action(&format!("Type '{}' to confirm purge: ", id), &id)? {
        println!("Aborted.");
        return Ok(());
    }

    let docs = open_store(&config).await?;
    let removed = purge(&docs, &id).await?;
    docs.close().await;

    if removed == 0 {
        println!("Nothing stored for '{}'", id);
    } else {
        println!("Purged '{}' ({} documents)", id, removed);
    }
    Ok(())
}

async fn purge(docs: &dyn DocumentStore, id: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let mut removed = 0;
    for collection in Collection::ALL {
        if docs.delete(collection, id).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Whether `input` confirms the action (surrounding whitespace ignored)
pub fn parse_confirmation(input: &str, expected: &str) -> bool {
    input.trim() == expected
}

fn confirm_action(prompt: &str, expected: &str) -> Result<bool, Box<dyn std::error::Error>> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(parse_confirmation(&input, expected))
}
