use crate::build::workspace::inspect_archive;
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

static IMAGE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9_./:]*$").expect("valid image regex"));

/// User ids end up in cluster object names, so they must be DNS-label safe.
static USER_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid user id regex"));

static QUANTITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|Ki|Mi|Gi|Ti)?$").expect("valid quantity regex")
});

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").expect("valid version regex"));

const MAX_USER_ID_LEN: usize = 40;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Building,
    Deploying,
    Running,
    Failed,
    Terminating,
    Deleted,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Building => "building",
            InstanceState::Deploying => "deploying",
            InstanceState::Running => "running",
            InstanceState::Failed => "failed",
            InstanceState::Terminating => "terminating",
            InstanceState::Deleted => "deleted",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Deploying)
                | (Pending, Failed)
                | (Building, Deploying)
                | (Building, Failed)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Pending | Building | Deploying | Running | Failed, Terminating)
                | (Terminating, Deleted)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(InstanceState::Pending),
            "building" => Ok(InstanceState::Building),
            "deploying" => Ok(InstanceState::Deploying),
            "running" => Ok(InstanceState::Running),
            "failed" => Ok(InstanceState::Failed),
            "terminating" => Ok(InstanceState::Terminating),
            "deleted" => Ok(InstanceState::Deleted),
            other => Err(OrchestratorError::Validation(format!(
                "unknown instance state '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    Simple,
    DevContainerSpec,
    Workspace,
}

/// What the caller asked us to run.
#[derive(Clone)]
pub enum CreatePayload {
    Simple { base_image: String },
    DevContainerSpec { spec: serde_json::Value },
    Workspace { archive: Vec<u8> },
}

impl CreatePayload {
    pub fn mode(&self) -> CreationMode {
        match self {
            CreatePayload::Simple { .. } => CreationMode::Simple,
            CreatePayload::DevContainerSpec { .. } => CreationMode::DevContainerSpec,
            CreatePayload::Workspace { .. } => CreationMode::Workspace,
        }
    }

    /// Check the payload and work out the image the instance starts from.
    fn validate(&self, default_base_image: &str) -> Result<String> {
        match self {
            CreatePayload::Simple { base_image } => {
                validate_image(base_image)?;
                Ok(base_image.clone())
            }
            CreatePayload::DevContainerSpec { spec } => devcontainer_base_image(spec)
                .map(|image| image.unwrap_or_else(|| default_base_image.to_string())),
            CreatePayload::Workspace { archive } => {
                if archive.is_empty() {
                    return Err(OrchestratorError::Validation(
                        "workspace archive is empty".to_string(),
                    ));
                }
                let config = inspect_archive(archive).map_err(OrchestratorError::Validation)?;
                // devcontainer.json may be JSONC; only a parseable one can name its image
                let image = match config {
                    Some(spec) => devcontainer_base_image(&spec)?,
                    None => None,
                };
                Ok(image.unwrap_or_else(|| default_base_image.to_string()))
            }
        }
    }
}

impl fmt::Debug for CreatePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatePayload::Simple { base_image } => f
                .debug_struct("Simple")
                .field("base_image", base_image)
                .finish(),
            CreatePayload::DevContainerSpec { spec } => f
                .debug_struct("DevContainerSpec")
                .field("spec", spec)
                .finish(),
            CreatePayload::Workspace { archive } => f
                .debug_struct("Workspace")
                .field("archive_bytes", &archive.len())
                .finish(),
        }
    }
}

fn validate_image(image: &str) -> Result<()> {
    if image.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "base image must not be empty".to_string(),
        ));
    }
    if !IMAGE_PATTERN.is_match(image) {
        return Err(OrchestratorError::Validation(format!(
            "invalid base image format: '{image}'"
        )));
    }
    Ok(())
}

/// Returns the `image` named by a devcontainer config, if any.
fn devcontainer_base_image(spec: &serde_json::Value) -> Result<Option<String>> {
    let object = spec.as_object().ok_or_else(|| {
        OrchestratorError::Validation("devcontainer.json must be a JSON object".to_string())
    })?;

    let declares_source = ["image", "build", "dockerFile", "dockerComposeFile"]
        .iter()
        .any(|key| object.contains_key(*key));
    if !declares_source {
        return Err(OrchestratorError::Validation(
            "devcontainer.json must declare an image, build, dockerFile or dockerComposeFile"
                .to_string(),
        ));
    }

    match object.get("image") {
        None => Ok(None),
        Some(serde_json::Value::String(image)) => {
            validate_image(image)?;
            Ok(Some(image.clone()))
        }
        Some(_) => Err(OrchestratorError::Validation(
            "devcontainer.json 'image' must be a string".to_string(),
        )),
    }
}

/// Compute sizing and editor version for the instance workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSizing {
    pub storage_size: String,
    pub shared_storage_size: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub vscode_version: String,
}

impl Default for ResourceSizing {
    fn default() -> Self {
        Self {
            storage_size: "2Gi".to_string(),
            shared_storage_size: "5Gi".to_string(),
            memory_request: "512Mi".to_string(),
            memory_limit: "2Gi".to_string(),
            cpu_request: "200m".to_string(),
            cpu_limit: "1000m".to_string(),
            vscode_version: "1.97.2".to_string(),
        }
    }
}

impl ResourceSizing {
    fn validate(&self) -> Result<()> {
        let quantities = [
            ("storage_size", &self.storage_size),
            ("shared_storage_size", &self.shared_storage_size),
            ("memory_request", &self.memory_request),
            ("memory_limit", &self.memory_limit),
            ("cpu_request", &self.cpu_request),
            ("cpu_limit", &self.cpu_limit),
        ];
        for (field, value) in quantities {
            if !QUANTITY_PATTERN.is_match(value) {
                return Err(OrchestratorError::Validation(format!(
                    "{field} is not a valid resource quantity: '{value}'"
                )));
            }
        }
        if !VERSION_PATTERN.is_match(&self.vscode_version) {
            return Err(OrchestratorError::Validation(format!(
                "vscode_version must look like 1.2.3, got '{}'",
                self.vscode_version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub user_id: String,
    pub payload: CreatePayload,
    pub resources: ResourceSizing,
    pub idempotency_key: Option<String>,
}

impl CreateInstanceRequest {
    pub fn new(user_id: impl Into<String>, payload: CreatePayload) -> Self {
        Self {
            user_id: user_id.into(),
            payload,
            resources: ResourceSizing::default(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Validate everything that can be checked synchronously and return the
    /// base image the instance will record.
    pub fn validate(&self, default_base_image: &str) -> Result<String> {
        if self.user_id.len() > MAX_USER_ID_LEN || !USER_ID_PATTERN.is_match(&self.user_id) {
            return Err(OrchestratorError::Validation(format!(
                "user id must be 1-{MAX_USER_ID_LEN} lowercase alphanumerics or '-': '{}'",
                self.user_id
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(OrchestratorError::Validation(format!(
                    "idempotency key must be 1-{MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }
        self.resources.validate()?;
        self.payload.validate(default_base_image)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    SharedVolume,
    WorkspaceVolume,
    Workload,
    Route,
}

impl ResourceKind {
    /// Position in the creation order; teardown walks it backwards.
    pub fn creation_rank(self) -> u8 {
        match self {
            ResourceKind::SharedVolume => 0,
            ResourceKind::WorkspaceVolume => 1,
            ResourceKind::Workload => 2,
            ResourceKind::Route => 3,
        }
    }

    /// User-scoped objects outlive any single instance.
    pub fn is_user_scoped(self) -> bool {
        matches!(self, ResourceKind::SharedVolume)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::SharedVolume => "shared_volume",
            ResourceKind::WorkspaceVolume => "workspace_volume",
            ResourceKind::Workload => "workload",
            ResourceKind::Route => "route",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub user_id: String,
    pub state: InstanceState,
    pub creation_mode: CreationMode,
    pub base_image: String,
    pub built_image_reference: Option<String>,
    pub build_log_handle: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    pub resource_refs: Vec<ResourceRef>,
    pub error: Option<String>,
    pub resources: ResourceSizing,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub version: i64,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// A fresh Pending record for a validated request.
    pub fn pending(request: &CreateInstanceRequest, base_image: String) -> Self {
        let now = Utc::now();
        Self {
            instance_id: generate_instance_id(&request.user_id),
            user_id: request.user_id.clone(),
            state: InstanceState::Pending,
            creation_mode: request.payload.mode(),
            base_image,
            built_image_reference: None,
            build_log_handle: None,
            access_token: None,
            resource_refs: Vec::new(),
            error: None,
            resources: request.resources.clone(),
            idempotency_key: request.idempotency_key.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn instance_path(&self) -> String {
        instance_path(&self.instance_id)
    }

    /// Browser URL, available only while Running.
    pub fn url(&self, base_domain: &str) -> Option<String> {
        match (&self.state, &self.access_token) {
            (InstanceState::Running, Some(token)) => Some(format!(
                "https://{base_domain}{}?tkn={token}",
                self.instance_path()
            )),
            _ => None,
        }
    }

    /// Image the workload runs: the built image when there is one.
    pub fn runtime_image(&self) -> &str {
        self.built_image_reference
            .as_deref()
            .unwrap_or(&self.base_image)
    }
}

/// Path prefix an instance is served under.
pub fn instance_path(instance_id: &str) -> String {
    format!("/instances/{instance_id}")
}

pub fn generate_instance_id(user_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{user_id}-{}", &suffix[..8])
}

pub fn generate_access_token() -> String {
    Uuid::new_v4().to_string()
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
