//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use servicemaps_core::{Config, SessionConfig};

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, api_url, realtime_url, sync_enabled, freshness_window_secs, \
                    watchdog_interval_secs, upload_concurrency, request_timeout_secs, \
                    user_email, user_name, access_token, congregation, congregation_pass, \
                    phone_token";

fn load(config_path: Option<&PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

fn secret(value: &Option<String>) -> &'static str {
    match value.as_deref() {
        Some(v) if !v.is_empty() => "(set)",
        _ => "(not set)",
    }
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config = load(config_path)?;
    let session = config.session.clone().unwrap_or_default();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "api_url": config.api_url,
                    "realtime_url": config.realtime_url,
                    "sync_enabled": config.sync_enabled,
                    "freshness_window_secs": config.freshness_window_secs,
                    "watchdog_interval_secs": config.watchdog_interval_secs,
                    "upload_concurrency": config.upload_concurrency,
                    "request_timeout_secs": config.request_timeout_secs,
                    "session": {
                        "user_email": session.user_email,
                        "user_name": session.user_name,
                        "congregation": session.congregation,
                        "signed_in": session.access_token.is_some(),
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            let or_unset = |v: &Option<String>| v.clone().unwrap_or_else(|| "(not set)".into());
            println!("Configuration:");
            println!("  data_dir:               {}", config.data_dir.display());
            println!("  api_url:                {}", config.api_url);
            println!("  realtime_url:           {}", or_unset(&config.realtime_url));
            println!("  sync_enabled:           {}", config.sync_enabled);
            println!("  freshness_window_secs:  {}", config.freshness_window_secs);
            println!("  watchdog_interval_secs: {}", config.watchdog_interval_secs);
            println!("  upload_concurrency:     {}", config.upload_concurrency);
            println!("  request_timeout_secs:   {}", config.request_timeout_secs);
            println!();
            println!("Session:");
            println!("  user_email:        {}", or_unset(&session.user_email));
            println!("  user_name:         {}", or_unset(&session.user_name));
            println!("  congregation:      {}", or_unset(&session.congregation));
            println!("  access_token:      {}", secret(&session.access_token));
            println!("  congregation_pass: {}", secret(&session.congregation_pass));
            println!("  phone_token:       {}", secret(&session.phone_token));
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config = load(config_path)?;
    apply(&mut config, &key, &value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if is_secret(&key) { "(hidden)" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn is_secret(key: &str) -> bool {
    matches!(key, "access_token" | "congregation_pass" | "phone_token")
}

/// Empty or "none" clears an optional value
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}. Expected a number.", key))
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "api_url" => {
            if value.is_empty() {
                bail!("api_url cannot be empty");
            }
            config.api_url = value.to_string();
        }
        "realtime_url" => config.realtime_url = optional(value),
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "freshness_window_secs" => config.freshness_window_secs = number(key, value)?,
        "watchdog_interval_secs" => config.watchdog_interval_secs = number(key, value)?,
        "upload_concurrency" => config.upload_concurrency = number::<usize>(key, value)?.max(1),
        "request_timeout_secs" => config.request_timeout_secs = number(key, value)?,
        "user_email" | "user_name" | "access_token" | "congregation" | "congregation_pass"
        | "phone_token" => {
            let session = config.session.get_or_insert_with(SessionConfig::default);
            let slot = match key {
                "user_email" => &mut session.user_email,
                "user_name" => &mut session.user_name,
                "access_token" => &mut session.access_token,
                "congregation" => &mut session.congregation,
                "congregation_pass" => &mut session.congregation_pass,
                _ => &mut session.phone_token,
            };
            *slot = optional(value);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}
