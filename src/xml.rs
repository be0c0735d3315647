//! The xml module decodes portal responses and parses them into an owned
//! row/cell tree that outlives the response buffer.

use encoding_rs::Encoding;
use roxmltree::{Document, Node, ParsingOptions};

use crate::fetch::FetchError;

/// Tag of the elements treated as records in a fragment.
pub const ROW_TAG: &str = "row";
/// Tag of the positional values inside a row.
pub const CELL_TAG: &str = "cell";

/// Element names that signal the portal answered with something other than data.
const ERROR_ROOTS: [&str; 2] = ["parsererror", "html"];

/// An element detached from the parsed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    /// Concatenated text of all descendant text nodes, trimmed
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The `index`-th `cell` child, counting only cells.
    pub fn cell(&self, index: usize) -> Option<&XmlElement> {
        self.children
            .iter()
            .filter(|child| child.tag == CELL_TAG)
            .nth(index)
    }

    /// The first child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.tag == tag)
    }

    fn collect_rows<'a>(&'a self, rows: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.tag == ROW_TAG {
                rows.push(child);
            }
            child.collect_rows(rows);
        }
    }
}

/// One parsed response document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlFragment {
    pub root: XmlElement,
}

impl XmlFragment {
    /// All `row` elements in document order, nested rows included.
    pub fn rows(&self) -> Vec<&XmlElement> {
        let mut rows = Vec::new();
        if self.root.tag == ROW_TAG {
            rows.push(&self.root);
        }
        self.root.collect_rows(&mut rows);
        rows
    }
}

/// Decodes a response body with an explicit encoding label.
///
/// Decoding Latin-1 bytes as UTF-8 silently mangles accented characters, so the
/// label is never guessed from the body.
///
/// # Errors
///
/// Returns `FetchError::Decode` if the label is not a known encoding.
pub fn decode(bytes: &[u8], label: &str) -> Result<String, FetchError> {
    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| FetchError::Decode(format!("unknown encoding label {label}")))?;
    let (text, _, _) = encoding.decode(bytes);
    Ok(text.into_owned())
}

/// Parses decoded text into an owned fragment.
///
/// # Errors
///
/// Returns `FetchError::Parse` when the text is not well-formed XML, or when the
/// document is an error marker or an HTML page instead of data.
pub fn parse_fragment(text: &str) -> Result<XmlFragment, FetchError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let document =
        Document::parse_with_options(text, options).map_err(|e| FetchError::Parse(e.to_string()))?;

    let root = document.root_element();
    let root_name = root.tag_name().name();
    if ERROR_ROOTS
        .iter()
        .any(|name| root_name.eq_ignore_ascii_case(name))
    {
        return Err(FetchError::Parse(format!(
            "unexpected root element <{root_name}>"
        )));
    }
    if let Some(marker) = root.descendants().find(|n| n.has_tag_name("parsererror")) {
        return Err(FetchError::Parse(format!(
            "parser error marker in document: {}",
            marker.text().unwrap_or_default().trim()
        )));
    }

    Ok(XmlFragment {
        root: detach(root),
    })
}

fn detach(node: Node<'_, '_>) -> XmlElement {
    XmlElement {
        tag: node.tag_name().name().to_string(),
        attributes: node
            .attributes()
            .map(|attr| (attr.name().to_string(), attr.value().to_string()))
            .collect(),
        text: node
            .descendants()
            .filter(|n| n.is_text())
            .filter_map(|n| n.text())
            .collect::<String>()
            .trim()
            .to_string(),
        children: node
            .children()
            .filter(|n| n.is_element())
            .map(detach)
            .collect(),
    }
}
