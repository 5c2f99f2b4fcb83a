//! Pretrained model and checkpoint resolution
//!
//! References are resolved against the local filesystem first and the
//! Hugging Face Hub second:
//! - pretrained models: a diffusers model directory (optionally a subfolder
//!   such as `unet`) or a hub repository id
//! - spectral shifts: a directory holding `spectral_shifts.safetensors`, a
//!   file, or a hub repository id
//!
//! Downloads are blocking and are not retried.

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, SvdiffError};

/// Model configuration file name
pub const CONFIG_NAME: &str = "config.json";
/// Single-file safetensors weights
pub const WEIGHTS_NAME: &str = "diffusion_pytorch_model.safetensors";
/// Index of sharded safetensors weights
pub const WEIGHTS_INDEX_NAME: &str = "diffusion_pytorch_model.safetensors.index.json";
/// PyTorch pickle weights
pub const PICKLE_WEIGHTS_NAME: &str = "diffusion_pytorch_model.bin";
/// Conventional spectral-shift checkpoint file name
pub const SPECTRAL_SHIFTS_NAME: &str = "spectral_shifts.safetensors";

/// Hub request options
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    /// Branch, tag or commit; the default branch when `None`
    pub revision: Option<String>,
    /// Access token; `HF_TOKEN` / the cached token when `None`
    pub token: Option<String>,
    /// Cache directory; the hf-hub default when `None`
    pub cache_dir: Option<PathBuf>,
}

/// Fetches single files from a model repository
pub trait HubFetch {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf>;
}

/// Hugging Face Hub client
pub struct HubClient {
    api: Api,
    revision: Option<String>,
}

impl HubClient {
    /// Create a client; nothing is requested until the first fetch
    pub fn new(options: &HubOptions) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(cache_dir) = &options.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        if options.token.is_some() {
            builder = builder.with_token(options.token.clone());
        }
        Ok(Self {
            api: builder.build()?,
            revision: options.revision.clone(),
        })
    }
}

impl HubFetch for HubClient {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        let repo = match &self.revision {
            Some(revision) => Repo::with_revision(repo_id.to_string(), RepoType::Model, revision.clone()),
            None => Repo::model(repo_id.to_string()),
        };
        info!(repo = %repo_id, file = %filename, "Downloading from HuggingFace Hub");
        let path = self.api.repo(repo).get(filename)?;
        debug!(path = %path.display(), "Download cached");
        Ok(path)
    }
}

/// Files that make up a pretrained model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PretrainedFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl PretrainedFiles {
    /// Whether the weights are a PyTorch pickle rather than safetensors
    pub fn is_pickle(&self) -> bool {
        self.weights.len() == 1
            && self.weights[0]
                .file_name()
                .is_some_and(|name| name == PICKLE_WEIGHTS_NAME)
    }
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: BTreeMap<String, String>,
}

fn join_subfolder(subfolder: Option<&str>, filename: &str) -> String {
    match subfolder {
        Some(sub) if !sub.is_empty() => format!("{}/{}", sub.trim_end_matches('/'), filename),
        _ => filename.to_string(),
    }
}

/// Shard file names listed in a safetensors index, in a stable order
fn index_shards(index_path: &Path) -> Result<Vec<String>> {
    let index: WeightIndex = serde_json::from_slice(&std::fs::read(index_path)?)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

/// Resolve a pretrained model reference to its config and weight files
pub fn resolve_pretrained(
    pretrained: &str,
    subfolder: Option<&str>,
    hub: &dyn HubFetch,
) -> Result<PretrainedFiles> {
    let local = Path::new(pretrained);
    if local.is_dir() {
        let dir = match subfolder {
            Some(sub) if !sub.is_empty() => local.join(sub),
            _ => local.to_path_buf(),
        };
        return resolve_local(&dir);
    }

    let config = hub.fetch(pretrained, &join_subfolder(subfolder, CONFIG_NAME))?;
    let weights = match hub.fetch(pretrained, &join_subfolder(subfolder, WEIGHTS_NAME)) {
        Ok(path) => vec![path],
        Err(single_err) => {
            debug!(error = %single_err, "No single-file weights, trying sharded index");
            let index = hub
                .fetch(pretrained, &join_subfolder(subfolder, WEIGHTS_INDEX_NAME))
                .map_err(|_| single_err)?;
            index_shards(&index)?
                .iter()
                .map(|shard| hub.fetch(pretrained, &join_subfolder(subfolder, shard)))
                .collect::<Result<Vec<_>>>()?
        }
    };

    Ok(PretrainedFiles { config, weights })
}

fn resolve_local(dir: &Path) -> Result<PretrainedFiles> {
    let config = dir.join(CONFIG_NAME);
    if !config.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found", config.display()),
        )
        .into());
    }

    let single = dir.join(WEIGHTS_NAME);
    let index = dir.join(WEIGHTS_INDEX_NAME);
    let pickle = dir.join(PICKLE_WEIGHTS_NAME);

    let weights = if single.is_file() {
        vec![single]
    } else if index.is_file() {
        index_shards(&index)?
            .into_iter()
            .map(|shard| dir.join(shard))
            .collect()
    } else if pickle.is_file() {
        vec![pickle]
    } else {
        return Err(SvdiffError::WeightsNotFound(dir.to_path_buf()));
    };

    Ok(PretrainedFiles { config, weights })
}

/// Resolve a spectral-shift checkpoint reference to an existing file
///
/// A directory implies [`SPECTRAL_SHIFTS_NAME`] inside it; a reference that
/// is not an existing path is downloaded from the hub repository of that
/// name; anything else is used as-is.
pub fn resolve_spectral_shifts(reference: &str, hub: &dyn HubFetch) -> Result<PathBuf> {
    let local = Path::new(reference);
    let resolved = if local.is_dir() {
        local.join(SPECTRAL_SHIFTS_NAME)
    } else if !local.exists() {
        hub.fetch(reference, SPECTRAL_SHIFTS_NAME)?
    } else {
        local.to_path_buf()
    };

    if !resolved.exists() {
        return Err(SvdiffError::CheckpointNotFound(resolved));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Serves files from a local directory laid out like a repository
    struct DirHub {
        root: PathBuf,
        requests: RefCell<Vec<String>>,
    }

    impl HubFetch for DirHub {
        fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
            self.requests.borrow_mut().push(format!("{repo_id}:{filename}"));
            let path = self.root.join(repo_id).join(filename);
            if path.exists() {
                Ok(path)
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, filename.to_string()).into())
            }
        }
    }

    fn dir_hub(root: &Path) -> DirHub {
        DirHub {
            root: root.to_path_buf(),
            requests: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn test_checkpoint_directory_implies_filename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SPECTRAL_SHIFTS_NAME), b"x").unwrap();
        let hub = dir_hub(dir.path());

        let resolved = resolve_spectral_shifts(dir.path().to_str().unwrap(), &hub).unwrap();
        assert_eq!(resolved, dir.path().join(SPECTRAL_SHIFTS_NAME));
        assert!(hub.requests.borrow().is_empty());
    }

    #[test]
    fn test_checkpoint_file_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("step_1000.safetensors");
        std::fs::write(&file, b"x").unwrap();
        let hub = dir_hub(dir.path());

        let resolved = resolve_spectral_shifts(file.to_str().unwrap(), &hub).unwrap();
        assert_eq!(resolved, file);
    }

    #[test]
    fn test_checkpoint_bare_name_goes_to_hub() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("user").join("svdiff-dog");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join(SPECTRAL_SHIFTS_NAME), b"x").unwrap();
        let hub = dir_hub(dir.path());

        let resolved = resolve_spectral_shifts("user/svdiff-dog", &hub).unwrap();
        assert_eq!(resolved, repo.join(SPECTRAL_SHIFTS_NAME));
        assert_eq!(
            hub.requests.borrow().as_slice(),
            &["user/svdiff-dog:spectral_shifts.safetensors".to_string()]
        );
    }

    #[test]
    fn test_checkpoint_directory_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let hub = dir_hub(dir.path());

        let err = resolve_spectral_shifts(dir.path().to_str().unwrap(), &hub).unwrap_err();
        assert!(matches!(err, SvdiffError::CheckpointNotFound(_)));
    }

    #[test]
    fn test_local_pretrained_with_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let unet = dir.path().join("unet");
        std::fs::create_dir_all(&unet).unwrap();
        std::fs::write(unet.join(CONFIG_NAME), b"{}").unwrap();
        std::fs::write(unet.join(WEIGHTS_NAME), b"x").unwrap();
        let hub = dir_hub(dir.path());

        let files = resolve_pretrained(dir.path().to_str().unwrap(), Some("unet"), &hub).unwrap();
        assert_eq!(files.config, unet.join(CONFIG_NAME));
        assert_eq!(files.weights, vec![unet.join(WEIGHTS_NAME)]);
        assert!(!files.is_pickle());
    }

    #[test]
    fn test_local_sharded_and_pickle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_NAME), b"{}").unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_NAME),
            br#"{"metadata": {}, "weight_map": {
                "a.weight": "model-00002.safetensors",
                "b.weight": "model-00001.safetensors",
                "c.weight": "model-00001.safetensors"
            }}"#,
        )
        .unwrap();
        let hub = dir_hub(dir.path());
        let files = resolve_pretrained(dir.path().to_str().unwrap(), None, &hub).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );

        let other = tempfile::tempdir().unwrap();
        std::fs::write(other.path().join(CONFIG_NAME), b"{}").unwrap();
        std::fs::write(other.path().join(PICKLE_WEIGHTS_NAME), b"x").unwrap();
        let files = resolve_pretrained(other.path().to_str().unwrap(), None, &hub).unwrap();
        assert!(files.is_pickle());
    }

    #[test]
    fn test_local_without_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_NAME), b"{}").unwrap();
        let hub = dir_hub(dir.path());
        let err = resolve_pretrained(dir.path().to_str().unwrap(), None, &hub).unwrap_err();
        assert!(matches!(err, SvdiffError::WeightsNotFound(_)));
    }

    #[test]
    fn test_hub_pretrained_with_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let unet = dir.path().join("org").join("model").join("unet");
        std::fs::create_dir_all(&unet).unwrap();
        std::fs::write(unet.join(CONFIG_NAME), b"{}").unwrap();
        std::fs::write(unet.join(WEIGHTS_NAME), b"x").unwrap();
        let hub = dir_hub(dir.path());

        let files = resolve_pretrained("org/model", Some("unet"), &hub).unwrap();
        assert_eq!(files.config, unet.join(CONFIG_NAME));
        assert_eq!(
            hub.requests.borrow().as_slice(),
            &[
                "org/model:unet/config.json".to_string(),
                "org/model:unet/diffusion_pytorch_model.safetensors".to_string(),
            ]
        );
    }
}
