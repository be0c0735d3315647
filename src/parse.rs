//! The parse module reads flat records out of row elements using declarative
//! selectors and named transforms.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::FieldSpec;
use crate::table::Record;
use crate::transform::TransformKind;
use crate::xml::XmlElement;

/// Where a field's raw value is read from, relative to a row element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// An attribute of the row itself
    Attribute(String),
    /// Text content of the row itself
    OwnText,
    /// Text content of a child
    ChildText(ChildSelector),
    /// An attribute of a child, e.g. a tooltip holding the verbose schedule
    ChildAttribute { child: ChildSelector, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildSelector {
    /// The n-th `cell` child, zero based
    Cell(usize),
    /// The first child with this tag
    Tag(String),
}

impl ChildSelector {
    fn resolve<'a>(&self, element: &'a XmlElement) -> Option<&'a XmlElement> {
        match self {
            ChildSelector::Cell(index) => element.cell(*index),
            ChildSelector::Tag(tag) => element.child(tag),
        }
    }
}

impl Selector {
    /// Reads the raw value. Anything missing yields an empty string.
    pub fn select(&self, element: &XmlElement) -> String {
        let value = match self {
            Selector::Attribute(name) => element.attribute(name),
            Selector::OwnText => Some(element.text.as_str()),
            Selector::ChildText(child) => child.resolve(element).map(|c| c.text.as_str()),
            Selector::ChildAttribute { child, name } => {
                child.resolve(element).and_then(|c| c.attribute(name))
            }
        };
        value.unwrap_or_default().trim().to_string()
    }
}

/// A field that could not be transformed; the field is left blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub column: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {}", self.column, self.message)
    }
}

/// A flat record read from one row, plus the fields that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub record: Record,
    pub errors: Vec<FieldError>,
}

/// Reads every field of `fields` from `row`.
///
/// Extraction never fails as a whole. Missing cells give empty values and are
/// not transformed. A failing transform blanks its field and is reported in
/// `errors`. An unknown transform name is logged and leaves the raw value.
///
/// # Arguments
///
/// * `row` - The row element to read from
/// * `fields` - Output column -> selector (+ optional transform) mapping
pub fn extract(row: &XmlElement, fields: &[FieldSpec]) -> Extraction {
    let mut extraction = Extraction::default();

    for field in fields {
        let raw = field.select.select(row);
        let value = match field.transform.as_deref() {
            None => raw,
            Some(_) if raw.is_empty() => raw,
            Some(name) => match name.parse::<TransformKind>() {
                Ok(kind) => match kind
                    .apply(&raw)
                    .and_then(|transformed| transformed.part(field.part.as_deref()))
                {
                    Ok(value) => value,
                    Err(err) => {
                        extraction.errors.push(FieldError {
                            column: field.column.clone(),
                            message: err.to_string(),
                        });
                        String::new()
                    }
                },
                Err(err) => {
                    warn!("{err} on column {}; keeping raw value", field.column);
                    raw
                }
            },
        };
        extraction.record.insert(field.column.clone(), value);
    }

    extraction
}
