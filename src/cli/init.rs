use super::config::{default_data_dir, resolve_config_path, SwitchboardConfig};

/// Write a commented default configuration
pub fn execute(config: Option<String>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = resolve_config_path(config);
    if config_path.exists() && !force {
        return Err(format!(
            "Config file '{}' already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    let db_path = config_path
        .parent()
        .map(|dir| dir.join("switchboard.db"))
        .unwrap_or_else(|| default_data_dir().join("switchboard.db"));
    SwitchboardConfig::create_default(&config_path, &db_path)?;

    println!("Created: {}", config_path.display());
    println!("Database: {}", db_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        execute(Some(config_path.to_string_lossy().to_string()), false).unwrap();

        let config = SwitchboardConfig::load(&config_path).unwrap();
        assert_eq!(config.storage.db_path, temp_dir.path().join("switchboard.db"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "# keep me\n").unwrap();
        let path = Some(config_path.to_string_lossy().to_string());

        assert!(execute(path.clone(), false).is_err());
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "# keep me\n");

        execute(path, true).unwrap();
        assert!(SwitchboardConfig::load(&config_path).is_ok());
    }
}
