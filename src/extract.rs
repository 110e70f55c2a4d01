use crate::error::IngestError;
use crate::models::{Claim, Entity, EntityKind, RawRecord, Relationship, ValueKind, XmlElement};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Datavalue type marking an entity-valued claim
pub const ENTITY_VALUE_TYPE: &str = "wikibase-entityid";

static ENTITY_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][0-9]+(?:-[A-Z][0-9]+)?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub entity: Entity,
    pub relationships: Vec<Relationship>,
}

/// `Q42`, `P31`, `L7-F2`
pub fn is_valid_entity_id(id: &str) -> bool {
    ENTITY_ID_REGEX.is_match(id)
}

pub fn extract_entity(record: &RawRecord) -> Result<Extracted, IngestError> {
    let root = &record.root;

    let id = root.attr("id").map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return Err(IngestError::MalformedRecord {
            position: record.position,
            reason: "entity has no id".into(),
        });
    }

    let kind = root
        .attr("type")
        .and_then(EntityKind::parse)
        .unwrap_or_else(|| EntityKind::infer_from_id(id));

    let entity = Entity {
        id: id.to_string(),
        kind,
        labels: language_map(root, "labels", "label"),
        descriptions: language_map(root, "descriptions", "description"),
        claims: root
            .find("claims")
            .map(|claims| claims.find_all("claim").into_iter().filter_map(parse_claim).collect())
            .unwrap_or_default(),
    };

    let relationships = derive_relationships(&entity);
    Ok(Extracted {
        entity,
        relationships,
    })
}

/// One relationship per entity-valued claim whose target is a valid id.
pub fn derive_relationships(entity: &Entity) -> Vec<Relationship> {
    if !is_valid_entity_id(&entity.id) {
        return Vec::new();
    }
    entity
        .claims
        .iter()
        .filter(|c| c.value_kind == ValueKind::EntityReference && is_valid_entity_id(&c.value))
        .map(|c| Relationship {
            source_id: entity.id.clone(),
            target_id: c.value.clone(),
            property_id: c.property_id.clone(),
        })
        .collect()
}

/// Blank languages and blank values are dropped.
fn language_map(root: &XmlElement, container: &str, entry: &str) -> BTreeMap<String, String> {
    let Some(container) = root.find(container) else {
        return BTreeMap::new();
    };
    container
        .find_all(entry)
        .into_iter()
        .filter_map(|el| {
            let language = el.attr("language")?.trim();
            let value = el
                .attr("value")
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .or_else(|| el.trimmed_text())?;
            (!language.is_empty()).then(|| (language.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_claim(claim: &XmlElement) -> Option<Claim> {
    let property_id = claim.attr("property")?.trim();
    if property_id.is_empty() {
        return None;
    }

    let datavalue = claim.find("mainsnak").and_then(|snak| snak.find("datavalue"));
    let value_kind = match datavalue.and_then(|dv| dv.attr("type")) {
        Some(ENTITY_VALUE_TYPE) => ValueKind::EntityReference,
        Some(t) if !t.trim().is_empty() => ValueKind::Literal,
        _ => ValueKind::Unknown,
    };

    let value = datavalue
        .and_then(|dv| dv.find("value"))
        .and_then(|v| resolve_value(v, value_kind))
        .unwrap_or_default();

    Some(Claim {
        property_id: property_id.to_string(),
        value_kind,
        value,
    })
}

/// References prefer the `id` attribute; literals prefer text.
fn resolve_value(value: &XmlElement, kind: ValueKind) -> Option<String> {
    let id = value.attr("id").map(str::trim).filter(|s| !s.is_empty());
    let text = value.trimmed_text();
    let resolved = match kind {
        ValueKind::EntityReference => id.or(text),
        ValueKind::Literal | ValueKind::Unknown => text.or(id),
    };
    resolved.map(str::to_string)
}
