use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One element of the dump, owned. Only built for the span of a single record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Local name, namespace prefix stripped
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First descendant with the given name, depth-first.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given name, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a XmlElement> {
        let mut out = Vec::new();
        self.collect_named(name, &mut out);
        out
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.collect_named(name, out);
        }
    }

    /// Text content with surrounding whitespace removed, `None` when blank.
    pub fn trimmed_text(&self) -> Option<&str> {
        let t = self.text.trim();
        (!t.is_empty()).then_some(t)
    }
}

/// One `<entity>` element as read from the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based ordinal within the stream
    pub position: u64,
    pub root: XmlElement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Item,
    Property,
    Lexeme,
}

impl EntityKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "item" => Some(EntityKind::Item),
            "property" => Some(EntityKind::Property),
            "lexeme" => Some(EntityKind::Lexeme),
            _ => None,
        }
    }

    /// Falls back on the id prefix (`P31` is a property, `L7` a lexeme).
    pub fn infer_from_id(id: &str) -> Self {
        match id.as_bytes().first() {
            Some(b'P') => EntityKind::Property,
            Some(b'L') => EntityKind::Lexeme,
            _ => EntityKind::Item,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Property => "property",
            EntityKind::Lexeme => "lexeme",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    EntityReference,
    Literal,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub property_id: String,
    pub value_kind: ValueKind,
    /// Referenced entity id or literal payload; empty when unresolvable
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub labels: BTreeMap<String, String>,
    pub descriptions: BTreeMap<String, String>,
    pub claims: Vec<Claim>,
}

impl Entity {
    /// English label if present, otherwise the first by language code.
    pub fn display_label(&self) -> Option<&str> {
        self.labels
            .get("en")
            .or_else(|| self.labels.values().next())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    pub property_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(name: &str, children: Vec<XmlElement>) -> XmlElement {
        XmlElement {
            name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    #[test]
    fn find_all_descends_in_document_order() {
        let tree = element(
            "entity",
            vec![
                element("labels", vec![element("label", vec![]), element("label", vec![])]),
                element("claims", vec![element("claim", vec![element("label", vec![])])]),
            ],
        );
        assert_eq!(tree.find_all("label").len(), 3);
        assert!(tree.find("claim").is_some());
        assert!(tree.find("missing").is_none());
    }

    #[test]
    fn attr_lookup() {
        let mut el = XmlElement::new("entity");
        el.attributes.push(("id".into(), "Q1".into()));
        assert_eq!(el.attr("id"), Some("Q1"));
        assert_eq!(el.attr("type"), None);
    }

    #[test]
    fn kind_parse_and_infer() {
        assert_eq!(EntityKind::parse("Property"), Some(EntityKind::Property));
        assert_eq!(EntityKind::parse("form"), None);
        assert_eq!(EntityKind::infer_from_id("P31"), EntityKind::Property);
        assert_eq!(EntityKind::infer_from_id("L7"), EntityKind::Lexeme);
        assert_eq!(EntityKind::infer_from_id("Q42"), EntityKind::Item);
    }

    #[test]
    fn display_label_prefers_english() {
        let mut entity = Entity {
            id: "Q1".into(),
            kind: EntityKind::Item,
            labels: BTreeMap::new(),
            descriptions: BTreeMap::new(),
            claims: Vec::new(),
        };
        assert_eq!(entity.display_label(), None);
        entity.labels.insert("de".into(), "Universum".into());
        assert_eq!(entity.display_label(), Some("Universum"));
        entity.labels.insert("en".into(), "universe".into());
        assert_eq!(entity.display_label(), Some("universe"));
    }
}
