//! Stable identity for executed operations.
//!
//! Two executions of semantically equivalent documents must aggregate
//! under the same key, so the hash is computed over the canonical body,
//! the operation name and the touched schema coordinates, nothing else.

use std::collections::BTreeSet;

use md5::{Digest, Md5};
use serde::Serialize;

use graphql_parser::query::OperationDefinition;

use super::normalize::{
    NormalizeOptions, find_operation, first_operation, normalize_operation, operation_name_of,
};

/// Kind of an executed operation. Serializes lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// The identity under which one executed operation is reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedOperation {
    pub kind: OperationKind,
    /// Hex MD5 over body, name and joined coordinates.
    pub hash: String,
    /// Canonical operation body.
    pub body: String,
    /// Schema coordinates touched by the execution, deduplicated and
    /// sorted. `Type.field` entries also contribute their owning `Type`.
    pub coordinates: Vec<String>,
    pub name: Option<String>,
}

/// Compute the reporting identity for an executed operation.
///
/// Returns `None` when the document does not parse or contains no
/// operation definition. Both mean "drop this usage sample", never a
/// pipeline error.
pub fn compute_usage_hash(
    document: &str,
    fields: impl IntoIterator<Item = impl AsRef<str>>,
    operation_name: Option<&str>,
) -> Option<NormalizedOperation> {
    let parsed = graphql_parser::parse_query::<String>(document)
        .ok()?
        .into_static();

    let body = normalize_operation(&parsed, operation_name, &NormalizeOptions::default());

    let mut coordinates: BTreeSet<String> = BTreeSet::new();
    for field in fields {
        let field = field.as_ref();
        if let Some((owner, _)) = field.split_once('.') {
            coordinates.insert(owner.to_string());
        }
        coordinates.insert(field.to_string());
    }
    let coordinates: Vec<String> = coordinates.into_iter().collect();

    let operation = operation_name
        .and_then(|name| find_operation(&parsed, name))
        .or_else(|| first_operation(&parsed))?;
    let name = operation_name
        .map(str::to_string)
        .or_else(|| operation_name_of(operation).map(str::to_string));

    let kind = match operation {
        OperationDefinition::Query(_) | OperationDefinition::SelectionSet(_) => {
            OperationKind::Query
        }
        OperationDefinition::Mutation(_) => OperationKind::Mutation,
        OperationDefinition::Subscription(_) => OperationKind::Subscription,
    };

    let mut hasher = Md5::new();
    hasher.update(body.as_bytes());
    hasher.update(name.as_deref().unwrap_or("").as_bytes());
    hasher.update(coordinates.join(";").as_bytes());
    let hash = hex_encode(&hasher.finalize());

    Some(NormalizedOperation {
        kind,
        hash,
        body,
        coordinates,
        name,
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
