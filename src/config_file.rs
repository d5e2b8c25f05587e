use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{PipelineConfig, PipelineSettings};

const PROJECT_FILE_NAME: &str = ".logpiperc";

/// Configuration file handler for logpipe
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub pipeline: PipelineSettings,
}

impl ConfigFile {
    /// Find project-level .logpiperc by walking up directory tree
    pub fn find_project_config() -> Option<PathBuf> {
        let mut current = env::current_dir().ok()?;
        loop {
            let config_path = current.join(PROJECT_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
            if !current.pop() {
                break;
            }
        }
        None
    }

    /// Get list of user config file locations in order of preference
    pub fn get_user_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if cfg!(windows) {
            if let Ok(appdata) = env::var("APPDATA") {
                paths.push(PathBuf::from(appdata).join("logpipe").join("config.ini"));
            }
            if let Ok(userprofile) = env::var("USERPROFILE") {
                paths.push(PathBuf::from(userprofile).join(PROJECT_FILE_NAME));
            }
        } else {
            let xdg_config = env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    env::var("HOME")
                        .map(|h| PathBuf::from(h).join(".config"))
                        .unwrap_or_else(|_| PathBuf::from(".config"))
                });

            paths.push(xdg_config.join("logpipe").join("config.ini"));

            if let Ok(home) = env::var("HOME") {
                paths.push(PathBuf::from(home).join(PROJECT_FILE_NAME));
            }
        }

        paths
    }

    /// Load configuration with proper precedence: project > user > defaults
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        // First existing user file, lowest precedence
        if let Some(path) = Self::get_user_config_paths().into_iter().find(|p| p.exists()) {
            config = Self::merge_configs(config, Self::load_from_path(&path)?);
        }

        if let Some(project_path) = Self::find_project_config() {
            config = Self::merge_configs(config, Self::load_from_path(&project_path)?);
        }

        Ok(config)
    }

    /// Load configuration with optional custom config file path
    pub fn load_with_custom_path(custom_path: Option<&Path>) -> Result<Self> {
        match custom_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse_ini_content(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse INI content from string
    fn parse_ini_content(content: &str) -> Result<Self> {
        let mut pipeline = PipelineSettings::default();
        let mut current_section = String::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                current_section = line[1..line.len() - 1].trim().to_string();
                continue;
            }

            let Some(eq_pos) = line.find('=') else {
                return Err(anyhow!("line {}: expected key = value", line_no + 1));
            };
            let key = line[..eq_pos].trim();
            let value = line[eq_pos + 1..].trim();

            // Unknown sections are ignored
            if current_section != "pipeline" {
                continue;
            }

            let at = || format!("line {}: invalid value for '{}'", line_no + 1, key);
            match key {
                "batch_size" => pipeline.batch_max_size = Some(parse_count(value).with_context(at)?),
                "batch_timeout" => {
                    pipeline.batch_max_wait = Some(parse_duration(value).with_context(at)?)
                }
                "threads" => pipeline.concurrency = Some(parse_count(value).with_context(at)?),
                "queue_capacity" => {
                    pipeline.queue_capacity = Some(parse_count(value).with_context(at)?)
                }
                "shutdown_timeout" => {
                    pipeline.shutdown_timeout = Some(parse_duration(value).with_context(at)?)
                }
                other => {
                    return Err(anyhow!(
                        "line {}: unknown key '{}' in [pipeline]",
                        line_no + 1,
                        other
                    ))
                }
            }
        }

        Ok(Self { pipeline })
    }

    /// Merge two configuration objects, with the second taking precedence
    fn merge_configs(base: Self, overlay: Self) -> Self {
        Self {
            pipeline: PipelineSettings::merge(base.pipeline, overlay.pipeline),
        }
    }

    /// Show configuration information with precedence details
    ///
    /// `overrides` are the settings given on the command line.
    pub fn show_config(custom_path: Option<&Path>, overrides: &PipelineSettings) {
        println!("Configuration precedence: CLI > project .logpiperc > user config > defaults\n");

        let project_config_path = Self::find_project_config();
        let user_config_paths = Self::get_user_config_paths();
        let user_config_path = user_config_paths.iter().find(|p| p.exists());

        match Self::load_with_custom_path(custom_path) {
            Ok(merged_config) => {
                let mut loaded_from = Vec::new();
                if let Some(path) = custom_path {
                    loaded_from.push(format!("Custom: {}", path.display()));
                } else {
                    if let Some(project_path) = &project_config_path {
                        loaded_from.push(format!("Project: {}", project_path.display()));
                    }
                    if let Some(user_path) = user_config_path {
                        loaded_from.push(format!("User: {}", user_path.display()));
                    }
                }

                if loaded_from.is_empty() {
                    println!("No configuration files found. Using defaults.");
                } else {
                    println!("Configuration loaded from:");
                    for source in loaded_from {
                        println!("  {}", source);
                    }
                }

                let settings = PipelineSettings::merge(merged_config.pipeline, overrides.clone());
                let effective = PipelineConfig::default().with_settings(&settings);
                println!("\nEffective pipeline settings:");
                print!("{}", render_settings(&effective));
            }
            Err(e) => {
                eprintln!("Error loading configuration: {:#}", e);
            }
        }

        println!("\nConfiguration search locations (in precedence order):");
        match &project_config_path {
            Some(project_path) => println!("  1. Project: {} (found)", project_path.display()),
            None => println!("  1. Project: .logpiperc (searched up directory tree, not found)"),
        }
        for (i, path) in user_config_paths.iter().enumerate() {
            let status = if path.exists() {
                "(found)"
            } else {
                "(not found)"
            };
            println!("  {}. User: {} {}", i + 2, path.display(), status);
        }

        if project_config_path.is_none() && user_config_path.is_none() && custom_path.is_none() {
            println!("\nExample configuration file (.logpiperc):");
            println!();
            println!("[pipeline]");
            println!("batch_size = 500");
            println!("batch_timeout = 250ms");
            println!("threads = 4");
            println!("queue_capacity = 8");
            println!("shutdown_timeout = 5s");
        }
    }
}

/// Render a configuration as `[pipeline]` INI lines
pub fn render_settings(config: &PipelineConfig) -> String {
    format!(
        "[pipeline]\nbatch_size = {}\nbatch_timeout = {}\nthreads = {}\nqueue_capacity = {}\nshutdown_timeout = {}\n",
        config.batch_max_size,
        humantime::format_duration(config.batch_max_wait),
        config.concurrency,
        config.queue_capacity,
        humantime::format_duration(config.shutdown_timeout),
    )
}

fn parse_count(value: &str) -> Result<usize> {
    let n: usize = value
        .parse()
        .with_context(|| format!("'{}' is not a whole number", value))?;
    if n == 0 {
        return Err(anyhow!("must be greater than 0"));
    }
    Ok(n)
}

/// Parse a humantime duration such as `250ms` or `5s`
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("'{}' is not a duration", value))
}
