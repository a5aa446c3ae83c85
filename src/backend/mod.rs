//! Backend request/response API
//!
//! [`BackendApi`] is the seam every piece of application code depends on;
//! [`HttpBackend`] implements it over GraphQL-over-HTTP and `testing::MockBackend`
//! stands in for it in tests.

pub mod client;
pub mod graphql;
pub mod jwt;

pub use client::{HttpBackend, HttpBackendConfig};
pub use graphql::{GraphQlRequest, GraphQlResponse};

use crate::state::Credential;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Backend call errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend answered with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend API error: {message}")]
    Api { message: String },

    #[error("Failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Backend response is missing {0}")]
    MissingData(&'static str),

    #[error("Mutation {operation} did not echo its client mutation id")]
    MutationMismatch { operation: &'static str },

    #[error("Not bound to the backend")]
    Unbound,
}

impl BackendError {
    /// API error whose message concatenates every reported message
    pub fn api(messages: Vec<String>) -> Self {
        Self::Api {
            message: messages.join("; "),
        }
    }

    /// Whether the call failed below the application layer
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Http(_) | BackendError::Status { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Completion report for one control execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub control_id: i64,
    pub error: bool,
    pub done: bool,
    pub report: String,
}

/// Backend object as listed by schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub id: String,
    pub name: String,
}

/// Object to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObject {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schema_id: String,
    pub enabled: bool,
}

/// Request/response calls against the backend object graph
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Full login: refresh token, then a session token carrying the profile
    async fn bind(&self) -> BackendResult<Credential>;

    /// New session token from the refresh token of `current`
    async fn refresh_access_token(&self, current: &Credential) -> BackendResult<Credential>;

    async fn ack_control(&self, control_id: i64) -> BackendResult<()>;

    async fn report_control(&self, report: &CompletionReport) -> BackendResult<()>;

    /// Create a control execution on the object whose `property` equals `value`
    async fn create_stealth_control_by_property(
        &self,
        name: &str,
        params: &Value,
        group: &str,
        property: &str,
        value: &str,
    ) -> BackendResult<()>;

    async fn get_property_value(&self, object_id: &str, property: &str) -> BackendResult<String>;

    async fn update_property(&self, object_id: &str, property: &str, value: &str)
        -> BackendResult<()>;

    async fn user_id(&self) -> BackendResult<String>;

    /// Id of the application profile object the session is bound to
    async fn profile_object_id(&self) -> BackendResult<String>;

    /// Import an application schema, returning its id
    async fn import_schema(&self, schema: &Value) -> BackendResult<String>;

    async fn list_objects_by_schema(&self, schema_id: &str) -> BackendResult<Vec<ObjectSummary>>;

    /// Create an object, returning its id
    async fn create_object(&self, object: &NewObject) -> BackendResult<String>;
}
