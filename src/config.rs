//! Configuration loading and validation.
//!
//! Settings come from three layers merged in order of increasing precedence:
//! built-in defaults, the user's YAML config file and command line flags.
//! Rules inherit any unset flash parameter from the merged global defaults.

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cli::FlashArgs;

pub const CONFIG_DIR_NAME: &str = "flashwin";
pub const CONFIG_FILE_NAME: &str = "flashwin.yml";

/// When windows that are alone on their workspace should be flashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlashLoneWindows {
    Never,
    #[default]
    Always,
    // Aliases keep the CLI values identical to the config file values
    #[value(alias = "on_switch")]
    OnSwitch,
    #[value(alias = "on_open_close")]
    OnOpenClose,
}

/// Fully resolved flash parameters, either global or per-rule.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashConfig {
    /// Opacity of the window at the start of a flash, in [0, 1].
    pub flash_opacity: f64,
    /// Opacity windows are restored to after a flash, in [0, 1].
    pub default_opacity: f64,
    /// Total flash duration in milliseconds.
    pub time: f64,
    /// Number of opacity steps in the animation. Ignored when `simple` is set.
    pub ntimepoints: usize,
    /// Skip the animation and hold `flash_opacity` for the whole duration.
    pub simple: bool,
    pub flash_on_focus: bool,
    pub flash_lone_windows: FlashLoneWindows,
    pub flash_fullscreen: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            flash_opacity: 0.8,
            default_opacity: 1.0,
            time: 150.0,
            ntimepoints: 10,
            simple: false,
            flash_on_focus: true,
            flash_lone_windows: FlashLoneWindows::Always,
            flash_fullscreen: true,
        }
    }
}

/// Regex criteria a window must satisfy to be routed to a rule.
///
/// `window_id` and `window_class` map to the X11 WM_CLASS instance/class pair.
/// `window_name` and `app_id` only exist on wayland backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriteriaConfig {
    pub window_id: Option<String>,
    pub window_class: Option<String>,
    pub window_name: Option<String>,
    pub app_id: Option<String>,
}

impl CriteriaConfig {
    /// (property name, pattern) pairs for the criteria that are set.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("window_id", &self.window_id),
            ("window_class", &self.window_class),
            ("window_name", &self.window_name),
            ("app_id", &self.app_id),
        ]
        .into_iter()
        .filter_map(|(name, pattern)| pattern.as_deref().map(|p| (name, p)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// One user-configured rule with its inherited flash parameters resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleConfig {
    pub criteria: CriteriaConfig,
    pub flash: FlashConfig,
}

/// The merged configuration handed to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub defaults: FlashConfig,
    pub rules: Vec<RuleConfig>,
}

// Raw config file schema. Everything is optional so that unset values fall
// through to the layer below.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    flash_opacity: Option<f64>,
    default_opacity: Option<f64>,
    time: Option<f64>,
    ntimepoints: Option<usize>,
    simple: Option<bool>,
    flash_on_focus: Option<bool>,
    flash_lone_windows: Option<FlashLoneWindows>,
    flash_fullscreen: Option<bool>,
    rules: Option<Vec<RuleFile>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RuleFile {
    window_id: Option<String>,
    window_class: Option<String>,
    window_name: Option<String>,
    app_id: Option<String>,
    flash_opacity: Option<f64>,
    default_opacity: Option<f64>,
    time: Option<f64>,
    ntimepoints: Option<usize>,
    simple: Option<bool>,
    flash_on_focus: Option<bool>,
    flash_lone_windows: Option<FlashLoneWindows>,
    flash_fullscreen: Option<bool>,
}

/// Default config file location: `$XDG_CONFIG_HOME/flashwin/flashwin.yml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

impl Config {
    /// Load and merge the config file (if any) with CLI overrides.
    pub fn load(path: Option<&Path>, args: &FlashArgs) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                parse_config_file(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("failed to read config file {}", path.display()))?;
                    parse_config_file(&raw)
                        .with_context(|| format!("invalid config file {}", path.display()))?
                }
                _ => {
                    debug!("no config file found, using defaults");
                    ConfigFile::default()
                }
            },
        };
        Self::merge(file, args)
    }

    fn merge(file: ConfigFile, args: &FlashArgs) -> Result<Self> {
        let base = FlashConfig::default();
        let defaults = FlashConfig {
            flash_opacity: args
                .flash_opacity
                .or(file.flash_opacity)
                .unwrap_or(base.flash_opacity),
            default_opacity: args
                .default_opacity
                .or(file.default_opacity)
                .unwrap_or(base.default_opacity),
            time: args.time.or(file.time).unwrap_or(base.time),
            ntimepoints: args
                .ntimepoints
                .or(file.ntimepoints)
                .unwrap_or(base.ntimepoints),
            simple: if args.simple {
                true
            } else {
                file.simple.unwrap_or(base.simple)
            },
            flash_on_focus: args
                .flash_on_focus
                .or(file.flash_on_focus)
                .unwrap_or(base.flash_on_focus),
            flash_lone_windows: args
                .flash_lone_windows
                .or(file.flash_lone_windows)
                .unwrap_or(base.flash_lone_windows),
            flash_fullscreen: args
                .flash_fullscreen
                .or(file.flash_fullscreen)
                .unwrap_or(base.flash_fullscreen),
        };

        let rules = file
            .rules
            .unwrap_or_default()
            .into_iter()
            .map(|rule| resolve_rule(rule, &defaults))
            .collect::<Vec<_>>();

        let config = Self { defaults, rules };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_flash_config(&self.defaults).context("invalid global options")?;
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.criteria.is_empty() {
                bail!("rule {} has no matching criteria", i + 1);
            }
            for (name, pattern) in rule.criteria.entries() {
                Regex::new(pattern)
                    .with_context(|| format!("rule {}: invalid {name} regex {pattern:?}", i + 1))?;
            }
            validate_flash_config(&rule.flash)
                .with_context(|| format!("invalid options in rule {}", i + 1))?;
        }
        Ok(())
    }
}

fn parse_config_file(raw: &str) -> Result<ConfigFile> {
    Ok(serde_yaml::from_str(raw)?)
}

fn resolve_rule(rule: RuleFile, defaults: &FlashConfig) -> RuleConfig {
    RuleConfig {
        criteria: CriteriaConfig {
            window_id: rule.window_id,
            window_class: rule.window_class,
            window_name: rule.window_name,
            app_id: rule.app_id,
        },
        flash: FlashConfig {
            flash_opacity: rule.flash_opacity.unwrap_or(defaults.flash_opacity),
            default_opacity: rule.default_opacity.unwrap_or(defaults.default_opacity),
            time: rule.time.unwrap_or(defaults.time),
            ntimepoints: rule.ntimepoints.unwrap_or(defaults.ntimepoints),
            simple: rule.simple.unwrap_or(defaults.simple),
            flash_on_focus: rule.flash_on_focus.unwrap_or(defaults.flash_on_focus),
            flash_lone_windows: rule.flash_lone_windows.unwrap_or(defaults.flash_lone_windows),
            flash_fullscreen: rule.flash_fullscreen.unwrap_or(defaults.flash_fullscreen),
        },
    }
}

fn validate_flash_config(flash: &FlashConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&flash.flash_opacity) {
        bail!("flash-opacity must be between 0 and 1");
    }
    if !(0.0..=1.0).contains(&flash.default_opacity) {
        bail!("default-opacity must be between 0 and 1");
    }
    if flash.time <= 0.0 {
        bail!("time must be a positive number of milliseconds");
    }
    if flash.ntimepoints == 0 {
        bail!("ntimepoints must be positive");
    }
    Ok(())
}
