//! GraphQL request/response envelope

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Query or mutation with its variables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlRequest {
    pub query: String,
    pub variables: Value,
}

impl GraphQlRequest {
    /// Build a request, collapsing the whitespace of the query text
    pub fn new(query: &str, variables: Value) -> Self {
        Self {
            query: compact_query(query),
            variables,
        }
    }

    /// Request without variables
    pub fn without_variables(query: &str) -> Self {
        Self::new(query, Value::Object(Map::new()))
    }
}

/// Collapse runs of whitespace so multi-line query literals travel as one line
pub fn compact_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphQlErrorEntry {
    pub message: String,
}

/// Response envelope: `data` plus an optional `errors` list
#[derive(Debug, Clone, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlErrorEntry>>,
}

impl<T> GraphQlResponse<T> {
    /// Messages of every reported error, empty when the call succeeded
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .as_ref()
            .map(|errors| errors.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }
}
