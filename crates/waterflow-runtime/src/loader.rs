use crate::runtime::FlowRuntime;
use std::path::{Path, PathBuf};
use thiserror::Error;
use waterflow_core::{parser, DefinitionError, FlowDefinition};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid definition in {path}: {source}")]
    Definition {
        path: PathBuf,
        source: DefinitionError,
    },
}

/// Loads every `*.json` definition found in a directory
pub struct DefinitionLoader {
    dir: PathBuf,
}

impl DefinitionLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Parse one definition file
    pub fn load_file(path: &Path) -> Result<FlowDefinition, LoadError> {
        let json = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parser::parse(&json).map_err(|source| LoadError::Definition {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse every definition in the directory, in file name order
    pub fn load_all(&self) -> Result<Vec<FlowDefinition>, LoadError> {
        let io_err = |source| LoadError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension() == Some("json".as_ref()) {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|path| Self::load_file(path)).collect()
    }

    /// Register every definition of the directory; returns the stream ids
    pub async fn load_into(&self, runtime: &FlowRuntime) -> Result<Vec<String>, LoadError> {
        let mut stream_ids = Vec::new();
        for definition in self.load_all()? {
            stream_ids.push(runtime.register(definition).await);
        }
        tracing::info!(
            "Loaded {} definitions from {}",
            stream_ids.len(),
            self.dir.display()
        );
        Ok(stream_ids)
    }
}
