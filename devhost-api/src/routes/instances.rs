use crate::{
    auth::{ensure_owner, owned_instance, AuthenticatedUser},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use devhost_orchestrator::{
    CreateInstanceRequest, CreatePayload, DeleteOutcome, InstanceFilters, InstanceManager,
    InstanceRecord, InstanceState, ResourceSizing,
};
use serde::{Deserialize, Serialize};

pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/instances",
            get(list_instances).post(create_instance),
        )
        .route(
            "/api/v1/instances/workspace",
            post(create_workspace_instance).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route(
            "/api/v1/instances/{id}",
            get(get_instance).delete(delete_instance),
        )
        .route("/api/v1/instances/{id}/build-logs", get(get_build_logs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    Simple,
    Devcontainer,
}

/// JSON create request. Sizing fields sit at the top level and default
/// individually.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceBody {
    pub mode: RequestMode,

    #[serde(default)]
    pub base_image: Option<String>,

    /// Contents of a devcontainer.json, for `devcontainer` mode.
    #[serde(default)]
    pub devcontainer: Option<serde_json::Value>,

    #[serde(default)]
    pub idempotency_key: Option<String>,

    #[serde(flatten)]
    pub resources: ResourceSizing,
}

impl CreateInstanceBody {
    fn into_request(
        self,
        user_id: String,
        default_base_image: &str,
    ) -> ApiResult<CreateInstanceRequest> {
        let payload = match self.mode {
            RequestMode::Simple => CreatePayload::Simple {
                base_image: self
                    .base_image
                    .unwrap_or_else(|| default_base_image.to_string()),
            },
            RequestMode::Devcontainer => CreatePayload::DevContainerSpec {
                spec: self.devcontainer.ok_or_else(|| {
                    ApiError::BadRequest(
                        "devcontainer mode requires a 'devcontainer' object".to_string(),
                    )
                })?,
            },
        };

        Ok(CreateInstanceRequest {
            user_id,
            payload,
            resources: self.resources,
            idempotency_key: self.idempotency_key,
        })
    }
}

/// An instance as returned to clients.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub url: Option<String>,
    pub build_logs_url: Option<String>,
}

impl InstanceView {
    fn new(manager: &InstanceManager, record: InstanceRecord) -> Self {
        let config = manager.config();
        let url = record.url(&config.base_domain);
        let build_logs_url = record
            .build_log_handle
            .as_ref()
            .map(|_| config.build_logs_url(&record.instance_id));
        Self {
            record,
            url,
            build_logs_url,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceList {
    pub instances: Vec<InstanceView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub state: Option<InstanceState>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct BuildLogView {
    pub instance_id: String,
    pub state: InstanceState,
    pub lines: Vec<String>,
    pub next_offset: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteView {
    pub instance_id: String,
    pub status: DeleteOutcome,
}

async fn create_instance(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(body): Json<CreateInstanceBody>,
) -> ApiResult<(StatusCode, Json<InstanceView>)> {
    let request = body.into_request(
        user.username,
        &state.manager.config().default_base_image,
    )?;
    let record = state.manager.create_instance(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(InstanceView::new(&state.manager, record)),
    ))
}

/// Multipart create: a `workspace` tar.gz file plus optional text fields
/// for sizing and `idempotency_key`.
async fn create_workspace_instance(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<InstanceView>)> {
    let mut archive = None;
    let mut resources = ResourceSizing::default();
    let mut idempotency_key = None;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == "workspace" {
            archive = Some(field.bytes().await?.to_vec());
            continue;
        }

        let value = field.text().await?;
        match name.as_str() {
            "storage_size" => resources.storage_size = value,
            "shared_storage_size" => resources.shared_storage_size = value,
            "memory_request" => resources.memory_request = value,
            "memory_limit" => resources.memory_limit = value,
            "cpu_request" => resources.cpu_request = value,
            "cpu_limit" => resources.cpu_limit = value,
            "vscode_version" => resources.vscode_version = value,
            "idempotency_key" => idempotency_key = Some(value),
            _ => {}
        }
    }

    let archive = archive
        .ok_or_else(|| ApiError::BadRequest("missing 'workspace' file field".to_string()))?;

    let request = CreateInstanceRequest {
        user_id: user.username,
        payload: CreatePayload::Workspace { archive },
        resources,
        idempotency_key,
    };
    let record = state.manager.create_instance(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(InstanceView::new(&state.manager, record)),
    ))
}

async fn list_instances(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<InstanceList>> {
    let filters = InstanceFilters {
        user_id: Some(user.username),
        state: query.state,
    };

    let records = state.manager.list_instances(&filters).await?;
    let instances = records
        .into_iter()
        .map(|record| InstanceView::new(&state.manager, record))
        .collect();

    Ok(Json(InstanceList { instances }))
}

async fn get_instance(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let record = owned_instance(&state.manager, &id, &user).await?;

    Ok(Json(InstanceView::new(&state.manager, record)))
}

async fn delete_instance(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteView>> {
    // Unknown ids fall through: deleting them is a no-op
    if let Some(record) = state.manager.registry().find(&id).await? {
        ensure_owner(&record, &user)?;
    }

    let status = state.manager.delete_instance(&id).await?;

    Ok(Json(DeleteView {
        instance_id: id,
        status,
    }))
}

async fn get_build_logs(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<BuildLogView>> {
    let record = owned_instance(&state.manager, &id, &user).await?;
    let chunk = state.manager.get_build_log(&id, query.offset).await?;

    Ok(Json(BuildLogView {
        instance_id: id,
        state: record.state,
        lines: chunk.lines,
        next_offset: chunk.next_offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_sizing_defaults_per_field() {
        let body: CreateInstanceBody = serde_json::from_value(json!({
            "mode": "simple",
            "base_image": "python:3.12",
            "memory_limit": "4Gi",
        }))
        .expect("Failed to parse body");

        assert_eq!(body.resources.memory_limit, "4Gi");
        assert_eq!(body.resources.storage_size, "2Gi");

        let request = body
            .into_request("alice".to_string(), "ubuntu:22.04")
            .unwrap();
        assert!(matches!(
            request.payload,
            CreatePayload::Simple { ref base_image } if base_image == "python:3.12"
        ));
    }

    #[test]
    fn test_simple_mode_uses_default_image() {
        let body: CreateInstanceBody =
            serde_json::from_value(json!({"mode": "simple"})).unwrap();
        let request = body
            .into_request("alice".to_string(), "ubuntu:22.04")
            .unwrap();
        assert!(matches!(
            request.payload,
            CreatePayload::Simple { ref base_image } if base_image == "ubuntu:22.04"
        ));
    }

    #[test]
    fn test_devcontainer_mode_requires_config() {
        let body: CreateInstanceBody =
            serde_json::from_value(json!({"mode": "devcontainer"})).unwrap();
        assert!(matches!(
            body.into_request("alice".to_string(), "ubuntu:22.04"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
