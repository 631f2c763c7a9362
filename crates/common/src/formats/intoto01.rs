//! Provenance v0.1 statements

use super::{Payload, RunView, Statement, PREDICATE_PROVENANCE_V01, STATEMENT_TYPE};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct ProvenanceV01 {
    pub builder: Builder,
    pub recipe: Recipe,
    pub materials: Vec<MaterialEntry>,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct Builder {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct Recipe {
    #[serde(rename = "type")]
    pub recipe_type: String,
    #[serde(rename = "entryPoint", skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(rename = "definedInMaterial", skip_serializing_if = "Option::is_none")]
    pub defined_in_material: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Materials carry only uri and digest in this predicate version.
#[derive(Debug, Serialize)]
pub struct MaterialEntry {
    pub uri: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub digest: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    #[serde(rename = "buildStartedOn", skip_serializing_if = "Option::is_none")]
    pub build_started_on: Option<String>,
    #[serde(rename = "buildFinishedOn", skip_serializing_if = "Option::is_none")]
    pub build_finished_on: Option<String>,
}

pub fn generate(view: &RunView<'_>) -> Result<Vec<Payload>> {
    let materials: Vec<MaterialEntry> = view
        .dependencies
        .iter()
        .map(|m| MaterialEntry {
            uri: m.uri.clone(),
            digest: m.digest.clone(),
        })
        .collect();

    let ref_source = view
        .run
        .provenance()
        .and_then(|p| p.ref_source.as_ref());
    let defined_in_material = ref_source
        .and_then(|r| materials.iter().position(|m| m.uri == r.uri));
    let entry_point = ref_source.and_then(|r| r.entry_point.clone());

    let arguments = {
        let params = view.external_parameters();
        (!params.is_empty()).then_some(params)
    };

    let statement = Statement {
        statement_type: STATEMENT_TYPE,
        predicate_type: PREDICATE_PROVENANCE_V01,
        subject: view.subjects.clone(),
        predicate: ProvenanceV01 {
            builder: Builder {
                id: view.config.builder_id.clone(),
            },
            recipe: Recipe {
                recipe_type: view.config.build_type.clone(),
                entry_point,
                defined_in_material,
                arguments,
            },
            materials,
            metadata: Metadata {
                build_started_on: view.started_on(),
                build_finished_on: view.finished_on(),
            },
        },
    };

    Ok(vec![Payload {
        full_key: None,
        body: serde_json::to_value(statement)?,
    }])
}
