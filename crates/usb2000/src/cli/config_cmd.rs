//! `config` subcommand: show current configuration and file path.

use std::path::Path;

use super::{Config, ConfigOutput, Result, kv, kv_indent, kv_width, print_json};

pub(super) fn cmd_config(json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => vec![],
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        });
    }

    // Human-readable output
    let w = kv_width(
        &["Config file:"],
        &[
            "integration_time_ms:",
            "trigger_mode:",
            "device_serial:",
            "byte_order:",
            "linearity_correction:",
            "packet_retries:",
        ],
    );

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent("integration_time_ms:", config.integration_time_ms, w);
    let trigger = match config.trigger() {
        Ok(mode) => format!("{} ({mode})", config.trigger_mode),
        Err(_) => format!("{} (invalid)", config.trigger_mode),
    };
    kv_indent("trigger_mode:", trigger, w);
    let serial = if config.device_serial.is_empty() {
        "(first found)"
    } else {
        config.device_serial.as_str()
    };
    kv_indent("device_serial:", serial, w);
    kv_indent("byte_order:", config.byte_order, w);
    kv_indent("linearity_correction:", config.linearity_correction, w);
    kv_indent("packet_retries:", config.packet_retries, w);

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for problem in &problems {
            println!("  {problem}");
        }
    }

    Ok(())
}
