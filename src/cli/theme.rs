use crate::config::{
    HexColor, StyleOverride, ThemeConfig as UserThemeConfig, ThemeModifier, ThemePreset, ThemeToken,
};
use crossterm::style::{Attribute, Attributes, Color, ContentStyle};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Theme {
    enabled: bool,
    styles: HashMap<ThemeToken, ContentStyle>,
}

impl Theme {
    #[cfg(test)]
    pub fn new(enabled: bool) -> Self {
        Self::from_config(enabled, &UserThemeConfig::default())
    }

    pub fn from_config(enabled: bool, config: &UserThemeConfig) -> Self {
        let mut styles = preset_styles(config.preset);
        for (token, override_style) in &config.styles {
            let base = styles.get(token).copied().unwrap_or_default();
            styles.insert(*token, merge_style(base, override_style));
        }

        Self { enabled, styles }
    }

    pub fn style(&self, token: ThemeToken) -> ContentStyle {
        if !self.enabled {
            return ContentStyle::new();
        }

        self.styles.get(&token).copied().unwrap_or_default()
    }

    /// Wraps `text` in the escape sequences for `token`. Plain text when styling is off.
    pub fn paint(&self, token: ThemeToken, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }

        self.style(token).apply(text).to_string()
    }
}

fn rgb(r: u8, g: u8, b: u8) -> ContentStyle {
    ContentStyle {
        foreground_color: Some(Color::Rgb { r, g, b }),
        ..ContentStyle::new()
    }
}

fn with(mut style: ContentStyle, attribute: Attribute) -> ContentStyle {
    style.attributes.set(attribute);
    style
}

fn preset_styles(preset: ThemePreset) -> HashMap<ThemeToken, ContentStyle> {
    ThemeToken::all()
        .iter()
        .copied()
        .map(|token| (token, preset_style(preset, token)))
        .collect()
}

fn preset_style(preset: ThemePreset, token: ThemeToken) -> ContentStyle {
    match preset {
        ThemePreset::Default => default_preset_style(token),
        ThemePreset::Light => light_preset_style(token),
        ThemePreset::HighContrast => high_contrast_preset_style(token),
    }
}

fn default_preset_style(token: ThemeToken) -> ContentStyle {
    match token {
        ThemeToken::AssistantText => rgb(219, 75, 75),
        ThemeToken::Reasoning => with(rgb(125, 207, 255), Attribute::Italic),
        ThemeToken::CodeEcho => rgb(122, 162, 247),
        ThemeToken::ToolStdout => rgb(192, 202, 245),
        ThemeToken::ToolStderr => rgb(255, 158, 100),
        ThemeToken::ToolTraceback => with(rgb(247, 118, 142), Attribute::Bold),
        ThemeToken::SystemInfo => rgb(86, 95, 137),
        ThemeToken::SystemError => with(rgb(247, 118, 142), Attribute::Bold),
    }
}

fn light_preset_style(token: ThemeToken) -> ContentStyle {
    match token {
        ThemeToken::AssistantText => rgb(130, 70, 0),
        ThemeToken::Reasoning => with(rgb(0, 110, 130), Attribute::Italic),
        ThemeToken::CodeEcho => rgb(31, 111, 235),
        ThemeToken::ToolStdout => rgb(9, 105, 218),
        ThemeToken::ToolStderr => rgb(188, 76, 0),
        ThemeToken::ToolTraceback => with(rgb(176, 0, 32), Attribute::Bold),
        ThemeToken::SystemInfo => rgb(36, 70, 120),
        ThemeToken::SystemError => with(rgb(176, 0, 32), Attribute::Bold),
    }
}

fn high_contrast_preset_style(token: ThemeToken) -> ContentStyle {
    match token {
        ThemeToken::AssistantText => rgb(255, 215, 0),
        ThemeToken::Reasoning => with(rgb(0, 255, 255), Attribute::Italic),
        ThemeToken::CodeEcho => rgb(0, 255, 127),
        ThemeToken::ToolStdout => rgb(135, 206, 250),
        ThemeToken::ToolStderr => rgb(255, 140, 0),
        ThemeToken::ToolTraceback => with(rgb(255, 64, 64), Attribute::Bold),
        ThemeToken::SystemInfo => rgb(173, 216, 230),
        ThemeToken::SystemError => with(rgb(255, 64, 64), Attribute::Bold),
    }
}

fn merge_style(base: ContentStyle, override_style: &StyleOverride) -> ContentStyle {
    let mut merged = base;

    if let Some(fg) = override_style.fg {
        merged.foreground_color = Some(color_from_hex(fg));
    }

    if let Some(bg) = override_style.bg {
        merged.background_color = Some(color_from_hex(bg));
    }

    if let Some(modifiers) = &override_style.modifiers {
        merged.attributes = modifiers_to_attributes(modifiers);
    }

    merged
}

fn color_from_hex(color: HexColor) -> Color {
    Color::Rgb {
        r: color.r,
        g: color.g,
        b: color.b,
    }
}

fn modifiers_to_attributes(modifiers: &[ThemeModifier]) -> Attributes {
    modifiers
        .iter()
        .copied()
        .fold(Attributes::default(), |mut acc, modifier| {
            acc.set(modifier_to_attribute(modifier));
            acc
        })
}

fn modifier_to_attribute(modifier: ThemeModifier) -> Attribute {
    match modifier {
        ThemeModifier::Bold => Attribute::Bold,
        ThemeModifier::Dim => Attribute::Dim,
        ThemeModifier::Italic => Attribute::Italic,
        ThemeModifier::Underlined => Attribute::Underlined,
        ThemeModifier::SlowBlink => Attribute::SlowBlink,
        ThemeModifier::RapidBlink => Attribute::RapidBlink,
        ThemeModifier::Reversed => Attribute::Reverse,
        ThemeModifier::Hidden => Attribute::Hidden,
        ThemeModifier::CrossedOut => Attribute::CrossedOut,
    }
}
