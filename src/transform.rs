//! Named value transforms applied to raw extracted strings.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use thiserror::Error;

use crate::constants::SCHEDULE_SEPARATOR;

static SCHEDULE_SEGMENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<day>.+?)\s+das\s+(?P<start>\d{1,2}:\d{2})\s+(?:às|as)\s+(?P<end>\d{1,2}:\d{2})$")
        .expect("Failed to compile schedule segment regex")
});

static TRAILING_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^(?P<description>.*?)\s*\(\s*(?P<id>\d+)\s*\)\s*$")
        .expect("Failed to compile trailing id regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("Expected \"year/term\", got {0:?}")]
    InvalidYearTerm(String),
    #[error("Transform {transform} has no part {part:?}")]
    UnknownPart {
        transform: &'static str,
        part: String,
    },
}

/// Transforms that can be named in a field map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    CodeName,
    Schedule,
    Descriptor,
    YearTerm,
}

impl std::str::FromStr for TransformKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_lowercase().as_str() {
            "code_name" => Ok(TransformKind::CodeName),
            "schedule" => Ok(TransformKind::Schedule),
            "descriptor" => Ok(TransformKind::Descriptor),
            "year_term" => Ok(TransformKind::YearTerm),
            _ => Err(format!("Unknown transform: {input}")),
        }
    }
}

impl TransformKind {
    /// Runs the transform on a raw value.
    ///
    /// # Errors
    ///
    /// Returns an error when the raw value cannot be read by this transform.
    pub fn apply(self, raw: &str) -> Result<Transformed, TransformError> {
        Ok(match self {
            TransformKind::CodeName => Transformed::CodeName(split_code_name(raw)),
            TransformKind::Schedule => Transformed::Schedule(format_schedule(raw)),
            TransformKind::Descriptor => Transformed::Descriptor(parse_descriptor(raw)),
            TransformKind::YearTerm => Transformed::YearTerm(parse_year_term(raw)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeName {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub description: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearTerm {
    pub year: String,
    pub term: String,
}

impl std::fmt::Display for YearTerm {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}/{}", self.year, self.term)
    }
}

/// Structured result of a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    CodeName(CodeName),
    Schedule(String),
    Descriptor(Descriptor),
    YearTerm(YearTerm),
}

impl Transformed {
    /// Picks one component. Without a part name the first component is used.
    ///
    /// # Errors
    ///
    /// Returns `TransformError::UnknownPart` if the part does not exist.
    pub fn part(self, part: Option<&str>) -> Result<String, TransformError> {
        let unknown = |transform: &'static str, part: &str| TransformError::UnknownPart {
            transform,
            part: part.to_string(),
        };

        match (self, part) {
            (Transformed::CodeName(value), None | Some("code")) => Ok(value.code),
            (Transformed::CodeName(value), Some("name")) => Ok(value.name),
            (Transformed::CodeName(_), Some(other)) => Err(unknown("code_name", other)),
            (Transformed::Schedule(value), None) => Ok(value),
            (Transformed::Schedule(_), Some(other)) => Err(unknown("schedule", other)),
            (Transformed::Descriptor(value), None | Some("description")) => Ok(value.description),
            (Transformed::Descriptor(value), Some("id")) => Ok(value.id),
            (Transformed::Descriptor(_), Some(other)) => Err(unknown("descriptor", other)),
            (Transformed::YearTerm(value), None | Some("year")) => Ok(value.year),
            (Transformed::YearTerm(value), Some("term")) => Ok(value.term),
            (Transformed::YearTerm(_), Some(other)) => Err(unknown("year_term", other)),
        }
    }
}

/// Splits a `"CODE - NAME"` label. Without the separator the whole label is the name.
pub fn split_code_name(raw: &str) -> CodeName {
    match raw.split_once(" - ") {
        Some((code, name)) => CodeName {
            code: code.trim().to_string(),
            name: name.trim().to_string(),
        },
        None => CodeName {
            code: String::new(),
            name: raw.trim().to_string(),
        },
    }
}

/// Rewrites `"Segunda das 19:10 às 20:25.Terça das ..."` as
/// `"Segunda 19:10-20:25 | Terça ..."`. Unreadable segments are dropped.
pub fn format_schedule(raw: &str) -> String {
    raw.split('.')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| match SCHEDULE_SEGMENT_REGEX.captures(segment) {
            Some(caps) => Some(format!(
                "{} {}-{}",
                caps["day"].trim(),
                &caps["start"],
                &caps["end"]
            )),
            None => {
                debug!("Dropping unreadable schedule segment {segment:?}");
                None
            }
        })
        .collect::<Vec<_>>()
        .join(SCHEDULE_SEPARATOR)
}

/// Pulls the numeric id out of the trailing parentheses of a descriptor that
/// may carry inline markup, e.g. `"X_2.1910<b>(12345)</b>"`.
pub fn parse_descriptor(raw: &str) -> Descriptor {
    let cleaned = strip_markup(raw);
    match TRAILING_ID_REGEX.captures(&cleaned) {
        Some(caps) => Descriptor {
            description: caps["description"].trim().to_string(),
            id: caps["id"].to_string(),
        },
        None => Descriptor {
            description: cleaned.trim().to_string(),
            id: String::new(),
        },
    }
}

/// Splits an `"ano/semestre"` token such as `"2025/2"`.
///
/// # Errors
///
/// Returns `TransformError::InvalidYearTerm` unless the token has exactly two
/// non-empty parts.
pub fn parse_year_term(raw: &str) -> Result<YearTerm, TransformError> {
    let parts: Vec<&str> = raw.split('/').map(str::trim).collect();
    match parts.as_slice() {
        [year, term] if !year.is_empty() && !term.is_empty() => Ok(YearTerm {
            year: (*year).to_string(),
            term: (*term).to_string(),
        }),
        _ => Err(TransformError::InvalidYearTerm(raw.to_string())),
    }
}

/// Text content of an HTML snippet, entities decoded.
pub fn strip_markup(raw: &str) -> String {
    if !raw.contains('<') && !raw.contains('&') {
        return raw.to_string();
    }
    Html::parse_fragment(raw)
        .root_element()
        .text()
        .collect::<String>()
}
