//! EARS (Easy Approach to Requirements Syntax) pattern detection and checks.

use std::fmt::{Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum EarsPattern {
    #[serde(rename = "ubiquitous")]
    Ubiquitous,
    #[serde(rename = "event-driven")]
    EventDriven,
    #[serde(rename = "state-driven")]
    StateDriven,
    #[serde(rename = "unwanted")]
    Unwanted,
    #[serde(rename = "optional")]
    Optional,
    #[serde(rename = "complex")]
    Complex,
}

/// Detection order: most specific prefix first, ubiquitous last.
const DETECTION_ORDER: [EarsPattern; 5] = [
    EarsPattern::EventDriven,
    EarsPattern::StateDriven,
    EarsPattern::Unwanted,
    EarsPattern::Optional,
    EarsPattern::Ubiquitous,
];

impl EarsPattern {
    pub const ALL: [Self; 6] = [
        Self::Ubiquitous,
        Self::EventDriven,
        Self::StateDriven,
        Self::Unwanted,
        Self::Optional,
        Self::Complex,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ubiquitous => "ubiquitous",
            Self::EventDriven => "event-driven",
            Self::StateDriven => "state-driven",
            Self::Unwanted => "unwanted",
            Self::Optional => "optional",
            Self::Complex => "complex",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|pattern| pattern.as_str().eq_ignore_ascii_case(value.trim()))
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Ubiquitous => "Requirements that always apply to the system",
            Self::EventDriven => "Requirements triggered by a specific event",
            Self::StateDriven => "Requirements that apply while the system is in a specific state",
            Self::Unwanted => "Requirements that handle unwanted conditions",
            Self::Optional => "Requirements for optional features or configurations",
            Self::Complex => "Requirements that combine several patterns",
        }
    }

    fn keyword(self) -> Option<&'static str> {
        match self {
            Self::EventDriven => Some("WHEN"),
            Self::StateDriven => Some("WHILE"),
            Self::Unwanted => Some("IF"),
            Self::Optional => Some("WHERE"),
            Self::Ubiquitous | Self::Complex => None,
        }
    }
}

impl Display for EarsPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Each keyword pattern tries the comma form first so the clause boundary is
// the comma, then falls back to a literal "the" before the system name.
const EVENT_DRIVEN_SOURCES: &[&str] = &[
    r"(?is)^WHEN\s+([^,]+?),\s*(?:the\s+)?(.+?)\s+shall\s+(.+)$",
    r"(?is)^WHEN\s+(.+?)\s+the\s+(.+?)\s+shall\s+(.+)$",
];
const STATE_DRIVEN_SOURCES: &[&str] = &[
    r"(?is)^WHILE\s+([^,]+?),\s*(?:the\s+)?(.+?)\s+shall\s+(.+)$",
    r"(?is)^WHILE\s+(.+?)\s+the\s+(.+?)\s+shall\s+(.+)$",
];
const UNWANTED_SOURCES: &[&str] =
    &[r"(?is)^IF\s+(.+?),?\s+THEN\s+(?:the\s+)?(.+?)\s+shall\s+(.+)$"];
const OPTIONAL_SOURCES: &[&str] = &[
    r"(?is)^WHERE\s+([^,]+?),\s*(?:the\s+)?(.+?)\s+shall\s+(.+)$",
    r"(?is)^WHERE\s+(.+?)\s+the\s+(.+?)\s+shall\s+(.+)$",
];
const UBIQUITOUS_SOURCES: &[&str] = &[r"(?is)^(?:the\s+)?(.+?)\s+shall\s+(.+)$"];

/// Invalid sources are dropped, so a table can compile shorter than its source list.
fn compile(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .filter_map(|source| Regex::new(source).ok())
        .collect()
}

static EVENT_DRIVEN: Lazy<Vec<Regex>> = Lazy::new(|| compile(EVENT_DRIVEN_SOURCES));
static STATE_DRIVEN: Lazy<Vec<Regex>> = Lazy::new(|| compile(STATE_DRIVEN_SOURCES));
static UNWANTED: Lazy<Vec<Regex>> = Lazy::new(|| compile(UNWANTED_SOURCES));
static OPTIONAL: Lazy<Vec<Regex>> = Lazy::new(|| compile(OPTIONAL_SOURCES));
static UBIQUITOUS: Lazy<Vec<Regex>> = Lazy::new(|| compile(UBIQUITOUS_SOURCES));

fn rules(pattern: EarsPattern) -> &'static [Regex] {
    match pattern {
        EarsPattern::EventDriven => &EVENT_DRIVEN,
        EarsPattern::StateDriven => &STATE_DRIVEN,
        EarsPattern::Unwanted => &UNWANTED,
        EarsPattern::Optional => &OPTIONAL,
        EarsPattern::Ubiquitous => &UBIQUITOUS,
        EarsPattern::Complex => &[],
    }
}

fn captures(text: &str, pattern: EarsPattern) -> Option<Vec<String>> {
    rules(pattern).iter().find_map(|regex| {
        regex.captures(text).map(|caps| {
            caps.iter()
                .skip(1)
                .map(|group| group.map_or_else(String::new, |m| m.as_str().trim().to_string()))
                .collect()
        })
    })
}

fn has_shall(text: &str) -> bool {
    text.to_lowercase().contains("shall")
}

fn matches(text: &str, pattern: EarsPattern) -> bool {
    match pattern {
        EarsPattern::Complex => !text.is_empty() && has_shall(text),
        other => captures(text, other).is_some(),
    }
}

/// Returns the most specific pattern the text conforms to. Complex is never
/// detected; it is only ever declared.
#[must_use]
pub fn detect_pattern(text: &str) -> Option<EarsPattern> {
    let text = text.trim();
    DETECTION_ORDER
        .into_iter()
        .find(|pattern| matches(text, *pattern))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EarsValidation {
    pub valid: bool,
    pub message: String,
    pub suggestions: Vec<String>,
}

#[must_use]
pub fn validate_pattern(text: &str, pattern: EarsPattern) -> EarsValidation {
    let text = text.trim();
    if text.is_empty() {
        return EarsValidation {
            valid: false,
            message: "Requirement text cannot be empty".to_string(),
            suggestions: vec![format!("Use template: {}", template(pattern, "system"))],
        };
    }

    if matches(text, pattern) {
        return EarsValidation {
            valid: true,
            message: format!("Valid {pattern} requirement"),
            suggestions: Vec::new(),
        };
    }

    let mut suggestions = Vec::new();
    if let Some(detected) = detect_pattern(text) {
        if detected != pattern {
            suggestions.push(format!(
                "This looks like a {detected} requirement, not {pattern}"
            ));
        }
    }
    suggestions.push(format!("Expected format: {}", template(pattern, "system")));
    if !has_shall(text) {
        suggestions.push("Missing \"shall\" keyword".to_string());
    }
    if let Some(keyword) = pattern.keyword() {
        if !text.to_uppercase().starts_with(keyword) {
            suggestions.push(format!(
                "{} requirements should start with \"{keyword}\"",
                capitalize(pattern.as_str())
            ));
        }
    }

    EarsValidation {
        valid: false,
        message: format!("Does not match {pattern} pattern"),
        suggestions,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EarsComponents {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub system: String,
    pub action: String,
}

/// Splits text into its pattern's parts. `None` when the text does not
/// conform, or for `complex`, which has no fixed shape.
#[must_use]
pub fn extract_components(text: &str, pattern: EarsPattern) -> Option<EarsComponents> {
    let groups = captures(text.trim(), pattern)?;
    let mut components = EarsComponents::default();
    match (pattern, groups.as_slice()) {
        (EarsPattern::Ubiquitous, [system, action]) => {
            components.system.clone_from(system);
            components.action.clone_from(action);
        }
        (_, [lead, system, action]) => {
            let lead = Some(lead.clone());
            match pattern {
                EarsPattern::EventDriven => components.trigger = lead,
                EarsPattern::StateDriven => components.state = lead,
                EarsPattern::Unwanted => components.condition = lead,
                EarsPattern::Optional => components.feature = lead,
                EarsPattern::Ubiquitous | EarsPattern::Complex => return None,
            }
            components.system.clone_from(system);
            components.action.clone_from(action);
        }
        _ => return None,
    }
    Some(components)
}

#[must_use]
pub fn template(pattern: EarsPattern, system: &str) -> String {
    let system = if system.trim().is_empty() { "system" } else { system.trim() };
    match pattern {
        EarsPattern::Ubiquitous | EarsPattern::Complex => format!("The {system} shall <action>"),
        EarsPattern::EventDriven => format!("WHEN <trigger event>, the {system} shall <action>"),
        EarsPattern::StateDriven => format!("WHILE <in state>, the {system} shall <action>"),
        EarsPattern::Unwanted => {
            format!("IF <unwanted condition>, THEN the {system} shall <action>")
        }
        EarsPattern::Optional => {
            format!("WHERE <feature is included>, the {system} shall <action>")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EarsReport {
    pub detected_pattern: Option<EarsPattern>,
    pub pattern: Option<EarsPattern>,
    pub validation: EarsValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<EarsComponents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Checks `text` against `declared`, or against the detected pattern when
/// nothing is declared.
#[must_use]
pub fn analyze(text: &str, declared: Option<EarsPattern>, system: Option<&str>) -> EarsReport {
    let system = system.unwrap_or("system");
    let detected_pattern = detect_pattern(text);
    let Some(pattern) = declared.or(detected_pattern) else {
        return EarsReport {
            detected_pattern: None,
            pattern: None,
            validation: EarsValidation {
                valid: false,
                message: "No EARS pattern detected".to_string(),
                suggestions: DETECTION_ORDER
                    .into_iter()
                    .map(|candidate| format!("Try: {}", template(candidate, system)))
                    .collect(),
            },
            components: None,
            template: None,
        };
    };

    let validation = validate_pattern(text, pattern);
    let components = if validation.valid {
        extract_components(text, pattern)
    } else {
        None
    };

    EarsReport {
        detected_pattern,
        pattern: Some(pattern),
        validation,
        components,
        template: Some(template(pattern, system)),
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
