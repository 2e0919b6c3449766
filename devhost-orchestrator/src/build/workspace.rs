//! Scoped build contexts under `build_root`.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::{Builder, TempDir};
use tracing::debug;
use walkdir::WalkDir;

use super::BuildError;
use crate::instance::CreatePayload;

const CONFIG_FILE: &str = "devcontainer.json";
const ROOT_CONFIG_FILE: &str = ".devcontainer.json";
const CONFIG_DIR: &str = ".devcontainer";
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Input to a build.
#[derive(Clone)]
pub enum BuildSource {
    DevContainerSpec(serde_json::Value),
    /// gzip-compressed tar archive of a project tree
    Workspace(Vec<u8>),
}

impl BuildSource {
    /// `None` for payloads that need no build.
    pub fn from_payload(payload: CreatePayload) -> Option<Self> {
        match payload {
            CreatePayload::Simple { .. } => None,
            CreatePayload::DevContainerSpec { spec } => Some(BuildSource::DevContainerSpec(spec)),
            CreatePayload::Workspace { archive } => Some(BuildSource::Workspace(archive)),
        }
    }
}

/// A temporary directory holding one build's context. Removed on drop.
#[derive(Debug)]
pub struct BuildWorkspace {
    _dir: TempDir,
    folder: PathBuf,
    config: PathBuf,
}

impl BuildWorkspace {
    pub fn prepare(
        build_root: &Path,
        instance_id: &str,
        source: &BuildSource,
    ) -> Result<Self, BuildError> {
        fs::create_dir_all(build_root)?;
        let dir = Builder::new()
            .prefix(&format!("{instance_id}-"))
            .tempdir_in(build_root)?;

        let (folder, config) = match source {
            BuildSource::DevContainerSpec(spec) => {
                let config_dir = dir.path().join(CONFIG_DIR);
                fs::create_dir_all(&config_dir)?;
                let config = config_dir.join(CONFIG_FILE);
                fs::write(&config, serde_json::to_vec_pretty(spec).map_err(|e| {
                    BuildError::Context(format!("cannot serialize devcontainer.json: {e}"))
                })?)?;
                (dir.path().to_path_buf(), config)
            }
            BuildSource::Workspace(archive) => {
                let extract_dir = dir.path().join("workspace");
                fs::create_dir_all(&extract_dir)?;
                tar::Archive::new(GzDecoder::new(archive.as_slice()))
                    .unpack(&extract_dir)
                    .map_err(|e| BuildError::Context(format!("failed to extract workspace: {e}")))?;
                locate_config(&extract_dir)?
            }
        };

        debug!(
            instance_id,
            folder = %folder.display(),
            config = %config.display(),
            "build context prepared"
        );

        Ok(Self {
            _dir: dir,
            folder,
            config,
        })
    }

    /// Directory passed as `--workspace-folder`.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// The devcontainer.json the build uses.
    pub fn config(&self) -> &Path {
        &self.config
    }
}

/// Rank of a candidate config file; lower wins.
fn config_rank(path: &Path) -> Option<u8> {
    let name = path.file_name()?.to_str()?;
    let in_config_dir = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|dir| dir == CONFIG_DIR);
    match name {
        CONFIG_FILE if in_config_dir => Some(0),
        ROOT_CONFIG_FILE => Some(1),
        CONFIG_FILE => Some(2),
        _ => None,
    }
}

/// Find the devcontainer.json to build from and the workspace folder it belongs to.
fn locate_config(root: &Path) -> Result<(PathBuf, PathBuf), BuildError> {
    let best = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rank = config_rank(entry.path())?;
            Some((rank, entry.depth(), entry.into_path()))
        })
        .min();

    let Some((rank, _, config)) = best else {
        return Err(BuildError::Context(
            "no devcontainer.json found in workspace".to_string(),
        ));
    };

    let parent = config.parent().unwrap_or(root);
    let folder = if rank == 0 {
        parent.parent().unwrap_or(root)
    } else {
        parent
    };
    Ok((folder.to_path_buf(), config))
}

/// Check that `archive` is a readable gzip tar holding a devcontainer.json.
///
/// Returns the parsed config when it is plain JSON, `None` when it only
/// parses as JSONC (comments, trailing commas) and has to be left to the
/// build tool.
pub fn inspect_archive(archive: &[u8]) -> Result<Option<serde_json::Value>, String> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let entries = tar
        .entries()
        .map_err(|e| format!("workspace is not a valid tar.gz archive: {e}"))?;

    let mut best: Option<(u8, String)> = None;
    for entry in entries {
        let mut entry = entry.map_err(|e| format!("corrupt workspace archive: {e}"))?;
        let path = entry
            .path()
            .map_err(|e| format!("corrupt workspace archive: {e}"))?
            .into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(format!(
                "workspace archive entry escapes the archive root: {}",
                path.display()
            ));
        }
        let Some(rank) = config_rank(&path) else {
            continue;
        };
        if best.as_ref().is_some_and(|(r, _)| *r <= rank) {
            continue;
        }
        if entry.header().size().unwrap_or(0) > MAX_CONFIG_BYTES {
            return Err(format!("{} is too large", path.display()));
        }

        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        best = Some((rank, contents));
    }

    match best {
        None => Err("no devcontainer.json found in workspace".to_string()),
        Some((_, contents)) => Ok(serde_json::from_str(&contents).ok()),
    }
}
