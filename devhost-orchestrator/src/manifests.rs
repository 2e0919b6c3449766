//! Kubernetes manifests for the per-instance object bundle.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::cluster::ObjectSpec;
use crate::config::OrchestratorConfig;
use crate::instance::{instance_path, ResourceKind, ResourceRef, ResourceSizing};

pub const APP_LABEL: &str = "vscode-server";
pub const SERVER_PORT: u16 = 8000;
const VSCODE_HOME: &str = "/home/vscode/.vscode";

/// Inputs for rendering one instance's objects.
#[derive(Debug, Clone)]
pub struct BundleRequest<'a> {
    pub instance_id: &'a str,
    pub user_id: &'a str,
    pub image: &'a str,
    pub access_token: &'a str,
    pub resources: &'a ResourceSizing,
}

/// Cluster-wide settings the manifests depend on.
#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub namespace: String,
    pub base_domain: String,
    pub tls_secret_name: String,
}

impl ManifestSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            base_domain: config.base_domain.clone(),
            tls_secret_name: config.tls_secret_name.clone(),
        }
    }
}

pub fn shared_volume_name(user_id: &str) -> String {
    format!("{user_id}-shared")
}

pub fn workspace_volume_name(instance_id: &str) -> String {
    format!("{instance_id}-workspace")
}

pub fn route_name(instance_id: &str) -> String {
    format!("{instance_id}-route")
}

/// The deterministic object set for an instance, in creation order.
pub fn bundle_refs(instance_id: &str, user_id: &str) -> Vec<ResourceRef> {
    vec![
        ResourceRef::new(ResourceKind::SharedVolume, shared_volume_name(user_id)),
        ResourceRef::new(ResourceKind::WorkspaceVolume, workspace_volume_name(instance_id)),
        ResourceRef::new(ResourceKind::Workload, instance_id),
        ResourceRef::new(ResourceKind::Route, route_name(instance_id)),
    ]
}

/// Render every object of the bundle, in creation order.
pub fn render_bundle(settings: &ManifestSettings, request: &BundleRequest<'_>) -> Vec<ObjectSpec> {
    vec![
        shared_volume(settings, request),
        workspace_volume(settings, request),
        workload(settings, request),
        route(settings, request),
    ]
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([("app".to_string(), APP_LABEL.to_string())]);
    labels.extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    labels
}

fn volume_claim(
    settings: &ManifestSettings,
    name: &str,
    labels: &BTreeMap<String, String>,
    size: &str,
) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": settings.namespace,
            "labels": labels,
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": size } }
        }
    })
}

fn shared_volume(settings: &ManifestSettings, request: &BundleRequest<'_>) -> ObjectSpec {
    // No instance label: the volume belongs to the user
    let labels = labels(&[("user", request.user_id), ("type", "shared")]);
    let name = shared_volume_name(request.user_id);
    ObjectSpec {
        kind: ResourceKind::SharedVolume,
        manifest: volume_claim(
            settings,
            &name,
            &labels,
            &request.resources.shared_storage_size,
        ),
        name,
        labels,
    }
}

fn workspace_volume(settings: &ManifestSettings, request: &BundleRequest<'_>) -> ObjectSpec {
    let labels = labels(&[
        ("instance", request.instance_id),
        ("user", request.user_id),
        ("type", "workspace"),
    ]);
    let name = workspace_volume_name(request.instance_id);
    ObjectSpec {
        kind: ResourceKind::WorkspaceVolume,
        manifest: volume_claim(settings, &name, &labels, &request.resources.storage_size),
        name,
        labels,
    }
}

/// Installs the VS Code CLI when the image lacks it, then serves the editor
/// under the instance path as the `vscode` user.
fn startup_script(vscode_version: &str, instance_path: &str) -> String {
    format!(
        r#"
if ! id vscode >/dev/null 2>&1; then
    useradd -m -s /bin/bash -u 1000 vscode
fi

if ! command -v code >/dev/null 2>&1; then
    if command -v apt-get >/dev/null 2>&1; then
        apt-get update && apt-get install -y curl wget ca-certificates git sudo
    fi
    case "$(uname -m)" in
        x86_64) TARGET='cli-linux-x64' ;;
        aarch64|arm64) TARGET='cli-linux-arm64' ;;
        *) echo "Unsupported architecture: $(uname -m)"; exit 1 ;;
    esac
    wget -qO- "https://update.code.visualstudio.com/{vscode_version}/${{TARGET}}/stable" | tar xvz -C /usr/bin/
    chmod +x /usr/bin/code
fi

mkdir -p {VSCODE_HOME}
chown -R vscode:vscode /home/vscode /workspace /shared

exec su vscode -c 'code serve-web --accept-server-license-terms --host 0.0.0.0 --port {SERVER_PORT} \
    --connection-token "$TOKEN" --server-base-path {instance_path} \
    --cli-data-dir "$CLI_DATA_DIR" --user-data-dir "$USER_DATA_DIR" \
    --server-data-dir "$SERVER_DATA_DIR" --extensions-dir "$EXTENSIONS_DIR"'
"#
    )
}

fn workload(settings: &ManifestSettings, request: &BundleRequest<'_>) -> ObjectSpec {
    let labels = labels(&[("instance", request.instance_id), ("user", request.user_id)]);
    let selector = labels_subset(&labels, &["app", "instance"]);
    let base_path = instance_path(request.instance_id);
    let sizing = request.resources;

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": request.instance_id,
            "namespace": settings.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": selector },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": APP_LABEL,
                        "image": request.image,
                        "imagePullPolicy": "Always",
                        "ports": [{ "containerPort": SERVER_PORT }],
                        "env": [
                            { "name": "TOKEN", "value": request.access_token },
                            { "name": "CLI_DATA_DIR", "value": format!("{VSCODE_HOME}/cli-data") },
                            { "name": "USER_DATA_DIR", "value": format!("{VSCODE_HOME}/user-data") },
                            { "name": "SERVER_DATA_DIR", "value": format!("{VSCODE_HOME}/server-data") },
                            { "name": "EXTENSIONS_DIR", "value": format!("{VSCODE_HOME}/extensions") },
                            { "name": "VSCODE_VERSION", "value": sizing.vscode_version },
                        ],
                        "volumeMounts": [
                            { "name": "workspace", "mountPath": "/workspace" },
                            { "name": "shared", "mountPath": "/shared" },
                            { "name": "vscode-config", "mountPath": VSCODE_HOME },
                        ],
                        "resources": {
                            "requests": { "memory": sizing.memory_request, "cpu": sizing.cpu_request },
                            "limits": { "memory": sizing.memory_limit, "cpu": sizing.cpu_limit },
                        },
                        "readinessProbe": {
                            "tcpSocket": { "port": SERVER_PORT },
                            "periodSeconds": 5,
                        },
                        "command": ["/bin/bash", "-c"],
                        "args": [startup_script(&sizing.vscode_version, &base_path)],
                        // Root for the install step; the server itself runs as vscode
                        "securityContext": { "runAsUser": 0 },
                    }],
                    "volumes": [
                        {
                            "name": "workspace",
                            "persistentVolumeClaim": { "claimName": workspace_volume_name(request.instance_id) },
                        },
                        {
                            "name": "shared",
                            "persistentVolumeClaim": { "claimName": shared_volume_name(request.user_id) },
                        },
                        { "name": "vscode-config", "emptyDir": {} },
                    ],
                }
            }
        }
    });

    ObjectSpec {
        kind: ResourceKind::Workload,
        name: request.instance_id.to_string(),
        labels,
        manifest,
    }
}

fn route(settings: &ManifestSettings, request: &BundleRequest<'_>) -> ObjectSpec {
    let labels = labels(&[("instance", request.instance_id), ("user", request.user_id)]);
    let selector = labels_subset(&labels, &["app", "instance"]);
    let name = route_name(request.instance_id);

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": settings.namespace,
            "labels": labels,
        },
        "spec": {
            "type": "ClusterIP",
            "selector": selector,
            "ports": [{ "port": SERVER_PORT, "targetPort": SERVER_PORT }],
        }
    });

    let ingress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": name,
            "namespace": settings.namespace,
            "labels": labels,
            "annotations": {
                "nginx.ingress.kubernetes.io/backend-protocol": "HTTP",
                "nginx.ingress.kubernetes.io/proxy-read-timeout": "3600",
                "nginx.ingress.kubernetes.io/proxy-send-timeout": "3600",
                "nginx.ingress.kubernetes.io/proxy-body-size": "0",
                "nginx.ingress.kubernetes.io/proxy-buffer-size": "128k",
                "nginx.ingress.kubernetes.io/proxy-http-version": "1.1",
                "nginx.ingress.kubernetes.io/websocket-services": name,
                "nginx.ingress.kubernetes.io/use-regex": "true",
            },
        },
        "spec": {
            "tls": [{
                "hosts": [settings.base_domain],
                "secretName": settings.tls_secret_name,
            }],
            "rules": [{
                "host": settings.base_domain,
                "http": {
                    "paths": [{
                        "path": format!("{}(/.*)?", instance_path(request.instance_id)),
                        "pathType": "ImplementationSpecific",
                        "backend": {
                            "service": {
                                "name": name,
                                "port": { "number": SERVER_PORT },
                            }
                        }
                    }]
                }
            }]
        }
    });

    ObjectSpec {
        kind: ResourceKind::Route,
        manifest: json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [service, ingress],
        }),
        name,
        labels,
    }
}

fn labels_subset(labels: &BTreeMap<String, String>, keys: &[&str]) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
