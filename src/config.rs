use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-7-sonnet-20250219";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MAX_TOKENS: u32 = 20_000;
pub const DEFAULT_THINKING_BUDGET: u32 = 16_000;
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 25;
pub const DEFAULT_OUTPUT_CHAR_LIMIT: usize = 4_000;

const MIN_THINKING_BUDGET: u32 = 1_024;
const CONFIG_DIR_NAME: &str = "pyclaude";
const CONFIG_FILE_NAME: &str = "config.toml";
const IMPLICIT_STARTUP_FILE: &str = "startup.py";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub anthropic_base_url: String,
    pub max_tokens: u32,
    /// Reasoning token budget; 0 turns reasoning off.
    pub thinking_budget: u32,
    pub max_tool_rounds: usize,
    pub output_char_limit: usize,
    pub startup_file: Option<PathBuf>,
    pub theme: ThemeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeConfig {
    pub preset: ThemePreset,
    pub styles: HashMap<ThemeToken, StyleOverride>,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            preset: ThemePreset::Default,
            styles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThemePreset {
    Default,
    Light,
    HighContrast,
}

impl FromStr for ThemePreset {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Default),
            "light" => Ok(Self::Light),
            "high-contrast" => Ok(Self::HighContrast),
            _ => Err(format!("unknown preset '{value}'")),
        }
    }
}

/// Output channels that can be styled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThemeToken {
    AssistantText,
    Reasoning,
    CodeEcho,
    ToolStdout,
    ToolStderr,
    ToolTraceback,
    SystemInfo,
    SystemError,
}

impl ThemeToken {
    pub fn all() -> [Self; 8] {
        [
            Self::AssistantText,
            Self::Reasoning,
            Self::CodeEcho,
            Self::ToolStdout,
            Self::ToolStderr,
            Self::ToolTraceback,
            Self::SystemInfo,
            Self::SystemError,
        ]
    }
}

impl FromStr for ThemeToken {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "assistant_text" => Ok(Self::AssistantText),
            "reasoning" => Ok(Self::Reasoning),
            "code_echo" => Ok(Self::CodeEcho),
            "tool_stdout" => Ok(Self::ToolStdout),
            "tool_stderr" => Ok(Self::ToolStderr),
            "tool_traceback" => Ok(Self::ToolTraceback),
            "system_info" => Ok(Self::SystemInfo),
            "system_error" => Ok(Self::SystemError),
            _ => Err(format!("unknown token '{value}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleOverride {
    pub fg: Option<HexColor>,
    pub bg: Option<HexColor>,
    pub modifiers: Option<Vec<ThemeModifier>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl FromStr for HexColor {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = value.as_bytes();
        if bytes.len() != 7 || bytes[0] != b'#' {
            return Err("invalid hex color, expected #RRGGBB".to_string());
        }

        let r = u8::from_str_radix(&value[1..3], 16)
            .map_err(|_| "invalid hex color, expected #RRGGBB".to_string())?;
        let g = u8::from_str_radix(&value[3..5], 16)
            .map_err(|_| "invalid hex color, expected #RRGGBB".to_string())?;
        let b = u8::from_str_radix(&value[5..7], 16)
            .map_err(|_| "invalid hex color, expected #RRGGBB".to_string())?;

        Ok(Self { r, g, b })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeModifier {
    Bold,
    Dim,
    Italic,
    Underlined,
    SlowBlink,
    RapidBlink,
    Reversed,
    Hidden,
    CrossedOut,
}

impl FromStr for ThemeModifier {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "bold" => Ok(Self::Bold),
            "dim" => Ok(Self::Dim),
            "italic" => Ok(Self::Italic),
            "underlined" => Ok(Self::Underlined),
            "slow_blink" => Ok(Self::SlowBlink),
            "rapid_blink" => Ok(Self::RapidBlink),
            "reversed" => Ok(Self::Reversed),
            "hidden" => Ok(Self::Hidden),
            "crossed_out" => Ok(Self::CrossedOut),
            _ => Err(format!("unknown modifier '{value}'")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    anthropic_api_key: Option<String>,
    anthropic_model: Option<String>,
    anthropic_base_url: Option<String>,
    max_tokens: Option<u32>,
    thinking_budget: Option<u32>,
    max_tool_rounds: Option<usize>,
    output_char_limit: Option<usize>,
    startup_file: Option<String>,
    theme: Option<RawThemeConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawThemeConfig {
    name: Option<String>,
    styles: Option<HashMap<String, RawStyleOverride>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStyleOverride {
    fg: Option<String>,
    bg: Option<String>,
    modifiers: Option<Vec<String>>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Loads the file at `explicit_path` (which must exist) or the discovered default,
    /// then applies `.env` and environment overrides.
    pub fn load_with_path(explicit_path: Option<&Path>) -> Result<Self> {
        let config_path = match explicit_path {
            Some(path) => {
                if !path.is_file() {
                    bail!("Failed to load config {}: file not found", path.display());
                }
                path.to_path_buf()
            }
            None => discover_config_path()?,
        };
        let file_config = load_file_config(&config_path)?;

        dotenvy::dotenv().ok();

        let file_api_key = file_string(file_config.as_ref(), |cfg| cfg.anthropic_api_key.as_ref());
        let file_model = file_string(file_config.as_ref(), |cfg| cfg.anthropic_model.as_ref());
        let file_base_url =
            file_string(file_config.as_ref(), |cfg| cfg.anthropic_base_url.as_ref());
        let file_startup = file_string(file_config.as_ref(), |cfg| cfg.startup_file.as_ref());

        let max_tokens = file_config
            .as_ref()
            .and_then(|cfg| cfg.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let thinking_budget = file_config
            .as_ref()
            .and_then(|cfg| cfg.thinking_budget)
            .unwrap_or(DEFAULT_THINKING_BUDGET);
        validate_token_limits(max_tokens, thinking_budget, &config_path)?;

        let theme = validate_theme(
            file_config.as_ref().and_then(|cfg| cfg.theme.as_ref()),
            &config_path,
        )?;

        Ok(Self {
            startup_file: resolve_startup_file(file_startup.as_deref(), &config_path),
            anthropic_api_key: env_non_empty("ANTHROPIC_API_KEY").or(file_api_key),
            anthropic_model: env_non_empty("ANTHROPIC_MODEL")
                .or(file_model)
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            anthropic_base_url: env_non_empty("ANTHROPIC_BASE_URL")
                .or(file_base_url)
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
            max_tokens,
            thinking_budget,
            max_tool_rounds: file_config
                .as_ref()
                .and_then(|cfg| cfg.max_tool_rounds)
                .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS),
            output_char_limit: file_config
                .as_ref()
                .and_then(|cfg| cfg.output_char_limit)
                .unwrap_or(DEFAULT_OUTPUT_CHAR_LIMIT),
            theme,
            config_path,
        })
    }

    pub fn thinking_budget_tokens(&self) -> Option<u32> {
        (self.thinking_budget > 0).then_some(self.thinking_budget)
    }
}

fn file_string(
    file_config: Option<&RawFileConfig>,
    pick: impl Fn(&RawFileConfig) -> Option<&String>,
) -> Option<String> {
    file_config
        .and_then(pick)
        .and_then(|value| non_empty(value).map(ToOwned::to_owned))
}

fn discover_config_path() -> Result<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve config path: XDG_CONFIG_HOME is set but empty");
        }

        return Ok(PathBuf::from(trimmed)
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        anyhow!("Failed to resolve config path: HOME directory is unavailable")
    })?;

    Ok(home
        .join(".config")
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

fn load_file_config(config_path: &Path) -> Result<Option<RawFileConfig>> {
    if !config_path.is_file() {
        return Ok(None);
    }

    let config_text = fs::read_to_string(config_path).map_err(|err| {
        anyhow!(
            "Failed to load config {}: unable to read file: {err}",
            config_path.display()
        )
    })?;

    toml::from_str(&config_text).map(Some).map_err(|err| {
        anyhow!(
            "Failed to load config {}: {err}",
            config_path.display()
        )
    })
}

/// Relative startup paths are taken from the config file's directory. Without an explicit
/// entry, a `startup.py` sitting next to the config file is picked up.
fn resolve_startup_file(configured: Option<&str>, config_path: &Path) -> Option<PathBuf> {
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    match configured {
        Some(value) => {
            let path = PathBuf::from(value);
            Some(if path.is_absolute() {
                path
            } else {
                config_dir.join(path)
            })
        }
        None => {
            let implicit = config_dir.join(IMPLICIT_STARTUP_FILE);
            implicit.is_file().then_some(implicit)
        }
    }
}

fn validate_token_limits(max_tokens: u32, thinking_budget: u32, config_path: &Path) -> Result<()> {
    if max_tokens == 0 {
        return Err(config_error(config_path, "max_tokens", "must be greater than 0"));
    }
    if thinking_budget == 0 {
        return Ok(());
    }
    if thinking_budget < MIN_THINKING_BUDGET {
        return Err(config_error(
            config_path,
            "thinking_budget",
            &format!("must be 0 or at least {MIN_THINKING_BUDGET}"),
        ));
    }
    if thinking_budget >= max_tokens {
        return Err(config_error(
            config_path,
            "thinking_budget",
            &format!("must be lower than max_tokens ({max_tokens})"),
        ));
    }
    Ok(())
}

fn validate_theme(raw_theme: Option<&RawThemeConfig>, config_path: &Path) -> Result<ThemeConfig> {
    let Some(theme) = raw_theme else {
        return Ok(ThemeConfig::default());
    };

    let mut config = ThemeConfig::default();

    if let Some(name) = &theme.name {
        config.preset = ThemePreset::from_str(name).map_err(|reason| {
            config_error(config_path, "theme.name", &reason)
        })?;
    }

    if let Some(styles) = &theme.styles {
        for (token_name, raw_style) in styles {
            let token = ThemeToken::from_str(token_name).map_err(|reason| {
                config_error(
                    config_path,
                    &format!("theme.styles.{token_name}"),
                    &reason,
                )
            })?;

            let fg = parse_color(raw_style.fg.as_deref(), config_path, token_name, "fg")?;
            let bg = parse_color(raw_style.bg.as_deref(), config_path, token_name, "bg")?;
            let modifiers =
                parse_modifiers(raw_style.modifiers.as_deref(), config_path, token_name)?;

            config.styles.insert(token, StyleOverride { fg, bg, modifiers });
        }
    }

    Ok(config)
}

fn parse_color(
    value: Option<&str>,
    config_path: &Path,
    token_name: &str,
    field_name: &str,
) -> Result<Option<HexColor>> {
    let Some(value) = value else {
        return Ok(None);
    };

    HexColor::from_str(value)
        .map(Some)
        .map_err(|reason| {
            config_error(
                config_path,
                &format!("theme.styles.{token_name}.{field_name}"),
                &reason,
            )
        })
}

fn parse_modifiers(
    values: Option<&[String]>,
    config_path: &Path,
    token_name: &str,
) -> Result<Option<Vec<ThemeModifier>>> {
    let Some(values) = values else {
        return Ok(None);
    };

    let mut parsed = Vec::with_capacity(values.len());
    for value in values {
        let modifier = ThemeModifier::from_str(value).map_err(|reason| {
            config_error(
                config_path,
                &format!("theme.styles.{token_name}.modifiers"),
                &reason,
            )
        })?;
        parsed.push(modifier);
    }

    Ok(Some(parsed))
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn config_error(config_path: &Path, key_path: &str, reason: &str) -> anyhow::Error {
    anyhow!(
        "Failed to load config {}: {key_path}: {reason}",
        config_path.display()
    )
}
