//! GraphQL-over-HTTP implementation of [`BackendApi`]

use super::graphql::{GraphQlRequest, GraphQlResponse};
use super::jwt;
use super::{
    BackendApi, BackendError, BackendResult, CompletionReport, NewObject, ObjectSummary,
};
use crate::config::{BridgeConfig, ConfigError};
use crate::state::{Credential, TokenStore};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const AUTH_REFRESH_TOKEN: &str = r#"
mutation AuthRefreshToken($login: String, $password: String) {
    authRefreshToken(input: { userLogin: $login, userPassword: $password }) {
        refreshToken { token id }
    }
}"#;

const AUTH_ACCESS_TOKEN: &str = r#"
mutation AuthAccessToken($token: String, $exp: Int, $profileTags: [String!]) {
    authAccessToken(input: { userRefreshToken: $token, accessTokenExpiration: $exp, profileTags: $profileTags }) {
        jwtToken
    }
}"#;

const UPDATE_CONTROL_ACK: &str = r#"
mutation UpdateControlExecutionAck($controlsExecutionId: BigInt!, $clientMutationId: String!) {
    updateControlExecutionAck(input: { controlsExecutionId: $controlsExecutionId, clientMutationId: $clientMutationId }) {
        clientMutationId
    }
}"#;

const CREATE_CONTROL_REPORT: &str = r#"
mutation CreateControlExecutionReport($error: Boolean!, $done: Boolean!, $clientMutationId: String,
                                      $linkedControlId: Int!, $report: String!, $reportDetails: JSON!) {
    createControlExecutionReport(input: {
        linkedControlId: $linkedControlId, report: $report, reportDetails: $reportDetails,
        done: $done, error: $error, clientMutationId: $clientMutationId
    }) {
        clientMutationId
    }
}"#;

const CREATE_STEALTH_BY_PROPERTY: &str = r#"
mutation CreateControlExecutionStealthByPropertyValue($controlName: String!, $params: JSON!,
                                                      $groupName: String!, $property: String!, $value: String!) {
    createControlExecutionStealthByPropertyValue(input: {
        name: $controlName, params: $params, groupName: $groupName,
        property: $property, value: $value, enrichWith: []
    }) {
        boolean
    }
}"#;

const GET_OBJECT_PROPERTY: &str = r#"
query GetObjectPropertyValue($objectId: UUID, $property: String) {
    objectProperties(condition: { objectId: $objectId, property: $property }) {
        id objectId value groupName
    }
}"#;

const UPDATE_OBJECT_PROPERTY: &str = r#"
mutation UpdateObjectProperty($id: UUID!, $value: String, $clientMutationId: String) {
    updateObjectProperty(input: { id: $id, clientMutationId: $clientMutationId, patch: { value: $value } }) {
        clientMutationId
    }
}"#;

const GET_USER_ID: &str = "query GetUserIdByLogin { getUserId }";

const GET_USER_PROFILE_ID: &str = "query GetUserProfileId { getUserProfileId }";

const IMPORT_SCHEMA: &str = r#"
mutation ImportSchema($jsonSchema: JSON) {
    importSchema(input: { jsonSchema: $jsonSchema }) { uuid }
}"#;

const LIST_OBJECTS_BY_SCHEMA: &str = r#"
query ListObjectsBySchemaId($schemaId: UUID) {
    objects(condition: { schemaId: $schemaId }) { id name schemaId }
}"#;

const CREATE_OBJECT: &str = r#"
mutation CreateObject($id: UUID, $name: String!, $description: String!, $schemaId: UUID!, $enabled: Boolean) {
    createObject(input: { object: {
        id: $id, name: $name, enabled: $enabled, description: $description, schemaId: $schemaId
    } }) {
        object { id }
    }
}"#;

/// Connection settings of the HTTP backend
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: Url,
    pub username: String,
    pub password: String,
    /// Lifetime requested for access tokens, in minutes
    pub token_ttl_mins: u32,
    pub profile_tags: Vec<String>,
    pub timeout: Duration,
}

impl HttpBackendConfig {
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: config.core_url()?,
            username: config.core.username.clone(),
            password: config.core.password.clone(),
            token_ttl_mins: config.core.token_ttl_mins,
            profile_tags: config.core.profile_tags.clone(),
            timeout: config.request_timeout(),
        })
    }
}

/// Backend client over GraphQL-over-HTTP
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: Client,
    tokens: Arc<TokenStore>,
}

impl HttpBackend {
    /// Create a client; calls authenticate with the token currently in `tokens`
    pub fn new(config: HttpBackendConfig, tokens: Arc<TokenStore>) -> BackendResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    /// Send one request and unwrap the GraphQL envelope
    async fn execute<T: DeserializeOwned>(
        &self,
        request: &GraphQlRequest,
        authorized: bool,
    ) -> BackendResult<T> {
        let mut builder = self.client.post(self.config.endpoint.clone()).json(request);
        if authorized {
            let bearer = self.tokens.bearer().ok_or(BackendError::Unbound)?;
            builder = builder.bearer_auth(bearer);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Self::unwrap_envelope(serde_json::from_slice(&body)?)
    }

    /// Surface `errors` as one API error, otherwise require `data` (pure function)
    fn unwrap_envelope<T>(response: GraphQlResponse<T>) -> BackendResult<T> {
        let messages = response.error_messages();
        if !messages.is_empty() {
            return Err(BackendError::api(messages));
        }
        response.data.ok_or(BackendError::MissingData("data"))
    }

    /// Exchange a refresh token for a session token
    async fn access_token(&self, refresh_token: &str, token_id: &str) -> BackendResult<Credential> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            auth_access_token: Option<AccessToken>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AccessToken {
            jwt_token: Option<String>,
        }

        let request = GraphQlRequest::new(
            AUTH_ACCESS_TOKEN,
            json!({
                "token": refresh_token,
                "exp": self.config.token_ttl_mins,
                "profileTags": self.config.profile_tags,
            }),
        );
        let data: Data = self.execute(&request, false).await?;
        let session_token = data
            .auth_access_token
            .and_then(|t| t.jwt_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BackendError::Token("got zero length access token".to_string()))?;
        let expires_at = jwt::parse_expiry(&session_token).map_err(BackendError::Token)?;

        Ok(Credential {
            session_token,
            expires_at,
            refresh_token: refresh_token.to_string(),
            token_id: token_id.to_string(),
        })
    }

    /// Property row for (object, name)
    async fn find_property(&self, object_id: &str, property: &str) -> BackendResult<PropertyRow> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            object_properties: Vec<PropertyRow>,
        }

        let request = GraphQlRequest::new(
            GET_OBJECT_PROPERTY,
            json!({ "objectId": object_id, "property": property }),
        );
        let data: Data = self.execute(&request, true).await?;
        data.object_properties
            .into_iter()
            .next()
            .ok_or(BackendError::MissingData("object property"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyRow {
    id: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationEcho {
    client_mutation_id: Option<String>,
}

/// Check that a mutation answered for the id it was sent with
fn check_echo(
    echo: Option<MutationEcho>,
    sent: &str,
    operation: &'static str,
) -> BackendResult<()> {
    match echo.and_then(|e| e.client_mutation_id) {
        Some(received) if received == sent => Ok(()),
        _ => Err(BackendError::MutationMismatch { operation }),
    }
}

/// Textual form of a property value; JSON strings are unquoted
fn property_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn bind(&self) -> BackendResult<Credential> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            auth_refresh_token: Option<RefreshPayload>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RefreshPayload {
            refresh_token: Option<RefreshToken>,
        }
        #[derive(Deserialize)]
        struct RefreshToken {
            token: String,
            id: String,
        }

        let request = GraphQlRequest::new(
            AUTH_REFRESH_TOKEN,
            json!({ "login": self.config.username, "password": self.config.password }),
        );
        let data: Data = self.execute(&request, false).await?;
        let refresh = data
            .auth_refresh_token
            .and_then(|p| p.refresh_token)
            .filter(|t| !t.token.is_empty())
            .ok_or_else(|| BackendError::Token("got zero length refresh token".to_string()))?;

        let credential = self.access_token(&refresh.token, &refresh.id).await?;
        info!(token_id = %credential.token_id, "Bound to backend");
        Ok(credential)
    }

    async fn refresh_access_token(&self, current: &Credential) -> BackendResult<Credential> {
        let credential = self
            .access_token(&current.refresh_token, &current.token_id)
            .await?;
        debug!(expires_at = credential.expires_at, "Access token refreshed");
        Ok(credential)
    }

    async fn ack_control(&self, control_id: i64) -> BackendResult<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            update_control_execution_ack: Option<MutationEcho>,
        }

        let mutation_id = Uuid::new_v4().to_string();
        let request = GraphQlRequest::new(
            UPDATE_CONTROL_ACK,
            json!({ "controlsExecutionId": control_id, "clientMutationId": mutation_id }),
        );
        let data: Data = self.execute(&request, true).await?;
        check_echo(
            data.update_control_execution_ack,
            &mutation_id,
            "updateControlExecutionAck",
        )
    }

    async fn report_control(&self, report: &CompletionReport) -> BackendResult<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            create_control_execution_report: Option<MutationEcho>,
        }

        if report.control_id < 0 {
            debug!(control_id = report.control_id, "No backend row for synthetic control, report skipped");
            return Ok(());
        }

        let mutation_id = Uuid::new_v4().to_string();
        let request = GraphQlRequest::new(
            CREATE_CONTROL_REPORT,
            json!({
                "error": report.error,
                "done": report.done,
                "clientMutationId": mutation_id,
                "linkedControlId": report.control_id,
                "report": report.report,
                "reportDetails": {},
            }),
        );
        let data: Data = self.execute(&request, true).await?;
        check_echo(
            data.create_control_execution_report,
            &mutation_id,
            "createControlExecutionReport",
        )
    }

    async fn create_stealth_control_by_property(
        &self,
        name: &str,
        params: &Value,
        group: &str,
        property: &str,
        value: &str,
    ) -> BackendResult<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            create_control_execution_stealth_by_property_value: Option<StealthResult>,
        }
        #[derive(Deserialize)]
        struct StealthResult {
            boolean: Option<bool>,
        }

        let request = GraphQlRequest::new(
            CREATE_STEALTH_BY_PROPERTY,
            json!({
                "controlName": name,
                "params": params.to_string(),
                "groupName": group,
                "property": property,
                "value": value,
            }),
        );
        let data: Data = self.execute(&request, true).await?;
        let created = data
            .create_control_execution_stealth_by_property_value
            .and_then(|r| r.boolean)
            .unwrap_or(false);
        if !created {
            warn!(%name, %property, %value, "No object matched the stealth control");
        }
        Ok(())
    }

    async fn get_property_value(&self, object_id: &str, property: &str) -> BackendResult<String> {
        let row = self.find_property(object_id, property).await?;
        Ok(property_text(row.value))
    }

    async fn update_property(
        &self,
        object_id: &str,
        property: &str,
        value: &str,
    ) -> BackendResult<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            update_object_property: Option<MutationEcho>,
        }

        let row = self.find_property(object_id, property).await?;
        let mutation_id = Uuid::new_v4().to_string();
        let request = GraphQlRequest::new(
            UPDATE_OBJECT_PROPERTY,
            json!({ "id": row.id, "value": value, "clientMutationId": mutation_id }),
        );
        let data: Data = self.execute(&request, true).await?;
        check_echo(data.update_object_property, &mutation_id, "updateObjectProperty")
    }

    async fn user_id(&self) -> BackendResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            get_user_id: Option<String>,
        }

        let data: Data = self
            .execute(&GraphQlRequest::without_variables(GET_USER_ID), true)
            .await?;
        data.get_user_id
            .filter(|id| !id.is_empty())
            .ok_or(BackendError::MissingData("user id"))
    }

    async fn profile_object_id(&self) -> BackendResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            get_user_profile_id: Option<String>,
        }

        let data: Data = self
            .execute(&GraphQlRequest::without_variables(GET_USER_PROFILE_ID), true)
            .await?;
        data.get_user_profile_id
            .filter(|id| !id.is_empty())
            .ok_or(BackendError::MissingData("user profile id"))
    }

    async fn import_schema(&self, schema: &Value) -> BackendResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            import_schema: Option<Imported>,
        }
        #[derive(Deserialize)]
        struct Imported {
            uuid: Option<String>,
        }

        let request = GraphQlRequest::new(IMPORT_SCHEMA, json!({ "jsonSchema": schema }));
        let data: Data = self.execute(&request, true).await?;
        data.import_schema
            .and_then(|i| i.uuid)
            .ok_or(BackendError::MissingData("imported schema id"))
    }

    async fn list_objects_by_schema(&self, schema_id: &str) -> BackendResult<Vec<ObjectSummary>> {
        #[derive(Deserialize)]
        struct Data {
            objects: Vec<ObjectRow>,
        }
        #[derive(Deserialize)]
        struct ObjectRow {
            id: String,
            #[serde(default)]
            name: String,
        }

        let request = GraphQlRequest::new(LIST_OBJECTS_BY_SCHEMA, json!({ "schemaId": schema_id }));
        let data: Data = self.execute(&request, true).await?;
        Ok(data
            .objects
            .into_iter()
            .map(|row| ObjectSummary {
                id: row.id,
                name: row.name,
            })
            .collect())
    }

    async fn create_object(&self, object: &NewObject) -> BackendResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            create_object: Option<Created>,
        }
        #[derive(Deserialize)]
        struct Created {
            object: Option<CreatedObject>,
        }
        #[derive(Deserialize)]
        struct CreatedObject {
            id: String,
        }

        let request = GraphQlRequest::new(
            CREATE_OBJECT,
            json!({
                "id": object.id,
                "name": object.name,
                "description": object.description,
                "schemaId": object.schema_id,
                "enabled": object.enabled,
            }),
        );
        let data: Data = self.execute(&request, true).await?;
        data.create_object
            .and_then(|c| c.object)
            .map(|o| o.id)
            .ok_or(BackendError::MissingData("created object id"))
    }
}
