use super::ApiState;
use crate::appliance::{Appliance, ApplianceKey, ApplianceSpec, KeyError};
use crate::store::StoreError;
use crate::topic::TopicError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Query parameters for appliance listing
#[derive(Deserialize)]
pub struct ListParams {
    /// Restrict to one namespace
    pub namespace: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create appliance API router
pub fn create_appliance_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/appliances", get(list_appliances))
        .route(
            "/api/appliances/:namespace/:name",
            get(get_appliance).put(put_appliance).delete(delete_appliance),
        )
        .with_state(state)
}

/// GET /api/appliances[?namespace=]
async fn list_appliances(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Appliance>>, ApiError> {
    let appliances = state.store.list(params.namespace.as_deref()).await?;
    Ok(Json(appliances))
}

/// GET /api/appliances/:namespace/:name
async fn get_appliance(
    State(state): State<Arc<ApiState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Appliance>, ApiError> {
    let key = ApplianceKey::parse(&namespace, &name)?;
    Ok(Json(state.store.get(&key).await?))
}

/// PUT /api/appliances/:namespace/:name - declare desired state
///
/// Body: `{"power": true}`. Responds 201 when the appliance is new, 200 otherwise,
/// 400 when the topic layout cannot address it.
async fn put_appliance(
    State(state): State<Arc<ApiState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<ApplianceSpec>,
) -> Result<(StatusCode, Json<Appliance>), ApiError> {
    let key = ApplianceKey::parse(&namespace, &name)?;
    state.topics.addresses(&key)?;

    let existed = match state.store.get(&key).await {
        Ok(_) => true,
        Err(StoreError::NotFound(_)) => false,
        Err(e) => return Err(e.into()),
    };

    let appliance = state.store.apply(&key, spec).await?;
    info!(key = %key, power = spec.power, generation = appliance.generation, "Desired state declared");

    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(appliance)))
}

/// DELETE /api/appliances/:namespace/:name
async fn delete_appliance(
    State(state): State<Arc<ApiState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let key = ApplianceKey::parse(&namespace, &name)?;
    state.store.delete(&key).await?;
    info!(key = %key, "Appliance deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    InvalidKey(KeyError),
    Unaddressable(TopicError),
    Store(StoreError),
}

impl From<TopicError> for ApiError {
    fn from(error: TopicError) -> Self {
        ApiError::Unaddressable(error)
    }
}

impl From<KeyError> for ApiError {
    fn from(error: KeyError) -> Self {
        ApiError::InvalidKey(error)
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Store(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidKey(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Unaddressable(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Store(e @ StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Store(e @ StoreError::Conflict { .. }) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Store(e @ StoreError::Internal(_)) => {
                error!(error = %e, "Store failure while serving API request");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
