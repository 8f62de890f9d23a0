use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::AuthContext;
use crate::error::{HosterError, HosterResult};
use crate::orchestrator::LogOptions;
use crate::pool::HostPool;
use crate::store::entities::{self, ContainerRecord, DEPLOYMENTS, NODES};
use crate::store::schema::EntitySchema;
use crate::store::{Engine, EntityRow, ListQuery};

/// JSON:API media type served and accepted by every route.
pub const MEDIA_TYPE: &str = "application/vnd.api+json";

pub struct ApiState {
    pub engine: Arc<Engine>,
    pub pool: Arc<HostPool>,
}

/// Entity API: uniform CRUD plus custom actions over every schema.
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/{entity}",
            get(list).post(create),
        )
        .route(
            "/api/{entity}/{id}",
            get(get_one).patch(update).delete(delete_one),
        )
        .route("/api/{entity}/{id}/{action}", axum::routing::post(action))
        .with_state(state)
}

/// Bind and serve the API until cancelled.
pub async fn run(state: Arc<ApiState>, port: u16, cancel: CancellationToken) -> HosterResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz() -> Response {
    json_response(StatusCode::OK, json!({"status": "ok"}))
}

async fn list(
    State(state): State<Arc<ApiState>>,
    Path(entity): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = AuthContext::from_headers(&headers)?;
    let query = list_query(&params);

    let rows = state.engine.list(&auth, &entity, &query).await?;
    let schema = state.engine.schema(&entity)?;

    let data: Vec<Value> = rows.iter().map(|row| resource(schema, row)).collect();
    Ok(json_response(StatusCode::OK, json!({ "data": data })))
}

async fn get_one(
    State(state): State<Arc<ApiState>>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = AuthContext::from_headers(&headers)?;
    let row = state.engine.get(&auth, &entity, &id).await?;
    let schema = state.engine.schema(&entity)?;
    Ok(json_response(StatusCode::OK, json!({ "data": resource(schema, &row) })))
}

async fn create(
    State(state): State<Arc<ApiState>>,
    Path(entity): Path<String>,
    headers: HeaderMap,
    body: axum::extract::Json<Value>,
) -> Result<Response, ApiError> {
    let auth = AuthContext::from_headers(&headers)?;
    let attributes = document_attributes(&body.0)?;

    let row = state.engine.create(&auth, &entity, attributes).await?;
    let schema = state.engine.schema(&entity)?;
    Ok(json_response(
        StatusCode::CREATED,
        json!({ "data": resource(schema, &row) }),
    ))
}

async fn update(
    State(state): State<Arc<ApiState>>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::extract::Json<Value>,
) -> Result<Response, ApiError> {
    let auth = AuthContext::from_headers(&headers)?;
    let attributes = document_attributes(&body.0)?;

    let row = state.engine.update(&auth, &entity, &id, attributes).await?;
    let schema = state.engine.schema(&entity)?;
    Ok(json_response(StatusCode::OK, json!({ "data": resource(schema, &row) })))
}

async fn delete_one(
    State(state): State<Arc<ApiState>>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = AuthContext::from_headers(&headers)?;

    match state.engine.delete(&auth, &entity, &id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        // A delete whose teardown command failed keeps the row and
        // answers 409 carrying the underlying kind, so callers can
        // retry once the cause clears.
        Err(err) => match err {
            HosterError::NotFound(_)
            | HosterError::Unauthorized
            | HosterError::BadRequest(_)
            | HosterError::InvalidTransition { .. } => Err(ApiError(err)),
            other => Ok(json_response(
                StatusCode::CONFLICT,
                json!({
                    "errors": [{
                        "status": "409",
                        "code": other.kind(),
                        "detail": other.to_string(),
                    }]
                }),
            )),
        },
    }
}

async fn action(
    State(state): State<Arc<ApiState>>,
    Path((entity, id, action)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = AuthContext::from_headers(&headers)?;

    if entity == DEPLOYMENTS && action == "logs" {
        return logs_snapshot(&state, &auth, &id).await.map_err(ApiError);
    }

    let row = state.engine.action(&auth, &entity, &id, &action).await?;
    let schema = state.engine.schema(&entity)?;
    Ok(json_response(StatusCode::OK, json!({ "data": resource(schema, &row) })))
}

/// Polled per-container log snapshot for one deployment.
async fn logs_snapshot(state: &ApiState, auth: &AuthContext, id: &str) -> HosterResult<Response> {
    let deployment = state.engine.get(auth, DEPLOYMENTS, id).await?;
    let node_id = deployment
        .attr_str("node_id")
        .ok_or_else(|| HosterError::BadRequest("deployment has no node yet".into()))?;
    let node = state
        .engine
        .system_get(NODES, node_id)
        .await?
        .ok_or_else(|| HosterError::NotFound(format!("nodes/{node_id}")))?;
    let orchestrator = state.pool.orchestrator(&node).await?;

    let records: Vec<ContainerRecord> = entities::attr_as(&deployment, "containers")?;
    let mut logs = Map::new();
    for record in records {
        let snapshot = orchestrator
            .container_logs(
                &record.id,
                &LogOptions {
                    tail: Some(200),
                    timestamps: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_or_else(|err| format!("log fetch failed: {err}"));
        logs.insert(record.service, json!(snapshot));
    }

    Ok(json_response(
        StatusCode::OK,
        json!({
            "data": {
                "type": "deployment-logs",
                "id": id,
                "attributes": { "containers": logs },
            }
        }),
    ))
}

/// Render one row as a JSON:API resource object.
fn resource(schema: &EntitySchema, row: &EntityRow) -> Value {
    let mut attributes = row.attributes.clone();
    attributes.insert("status".into(), json!(row.status));
    attributes.insert(
        schema.owner.column().to_string(),
        json!(row.owner_id),
    );
    attributes.insert("created_at".into(), json!(row.created_at.to_rfc3339()));
    attributes.insert("updated_at".into(), json!(row.updated_at.to_rfc3339()));

    json!({
        "type": schema.name,
        "id": row.id,
        "attributes": attributes,
    })
}

/// Accept a JSON:API document or a bare attribute object.
fn document_attributes(body: &Value) -> Result<Map<String, Value>, ApiError> {
    let attributes = body
        .get("data")
        .and_then(|d| d.get("attributes"))
        .or(Some(body))
        .and_then(Value::as_object)
        .cloned();

    attributes.ok_or_else(|| {
        ApiError(HosterError::BadRequest(
            "request body must be a JSON:API document".into(),
        ))
    })
}

fn list_query(params: &HashMap<String, String>) -> ListQuery {
    let mut query = ListQuery {
        scope: params.get("scope").cloned(),
        status: params.get("status").cloned(),
        cursor: params.get("cursor").cloned(),
        limit: params.get("limit").and_then(|l| l.parse().ok()),
        ..Default::default()
    };
    for (key, value) in params {
        if !matches!(key.as_str(), "scope" | "status" | "cursor" | "limit") {
            query.refs.push((key.clone(), value.clone()));
        }
    }
    query
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, MEDIA_TYPE)],
        body.to_string(),
    )
        .into_response()
}

/// Taxonomy-aware error responses in the JSON:API error shape.
#[derive(Debug)]
pub struct ApiError(pub HosterError);

impl From<HosterError> for ApiError {
    fn from(err: HosterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        json_response(
            status,
            json!({
                "errors": [{
                    "status": status.as_u16().to_string(),
                    "code": self.0.kind(),
                    "detail": self.0.to_string(),
                }]
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_attributes_accepts_both_shapes() {
        let enveloped = json!({"data": {"type": "templates", "attributes": {"name": "x"}}});
        let bare = json!({"name": "x"});

        assert_eq!(
            document_attributes(&enveloped).unwrap().get("name"),
            Some(&json!("x"))
        );
        assert_eq!(
            document_attributes(&bare).unwrap().get("name"),
            Some(&json!("x"))
        );
        assert!(document_attributes(&json!("nope")).is_err());
    }

    #[test]
    fn list_query_collects_reference_filters() {
        let mut params = HashMap::new();
        params.insert("scope".to_string(), "public".to_string());
        params.insert("template_id".to_string(), "t-1".to_string());
        params.insert("limit".to_string(), "10".to_string());

        let query = list_query(&params);
        assert_eq!(query.scope.as_deref(), Some("public"));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.refs, vec![("template_id".to_string(), "t-1".to_string())]);
    }

    #[test]
    fn errors_render_as_json_api() {
        let response = ApiError(HosterError::LimitExceeded("plan allows 1".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            MEDIA_TYPE
        );
    }
}
