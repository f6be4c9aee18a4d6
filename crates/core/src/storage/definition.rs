use crate::types::WorkflowDefinition;
use anyhow::{anyhow, Context, Result};
use std::path::{Component, Path, PathBuf};

/// Supplies workflow definitions by id
#[async_trait::async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<WorkflowDefinition>;

    /// Ids of every definition the source can supply
    async fn list(&self) -> Result<Vec<String>>;
}

/// Definitions stored as `<id>.json` or `<id>.toml` files in one directory
#[derive(Debug, Clone)]
pub struct FilesystemDefinitionSource {
    base_path: PathBuf,
}

impl FilesystemDefinitionSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Files that may hold `workflow_id`. Ids must be a single plain path segment.
    fn candidates(&self, workflow_id: &str) -> Result<[PathBuf; 2]> {
        let mut components = Path::new(workflow_id).components();
        let single_segment = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_segment || workflow_id.contains(&['/', '\\'][..]) {
            return Err(anyhow!("Invalid workflow id '{}'", workflow_id));
        }

        Ok([
            self.base_path.join(format!("{}.json", workflow_id)),
            self.base_path.join(format!("{}.toml", workflow_id)),
        ])
    }
}

#[async_trait::async_trait]
impl DefinitionSource for FilesystemDefinitionSource {
    async fn load(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        for path in self.candidates(workflow_id)? {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return load_file(&path).await;
            }
        }
        Err(anyhow!(
            "Workflow '{}' not found in {}",
            workflow_id,
            self.base_path.display()
        ))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read workflow directory"),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read workflow directory entry")?
        {
            let path = entry.path();
            let is_definition = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("toml")
            );
            if let (true, Some(stem)) = (is_definition, path.file_stem().and_then(|s| s.to_str())) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Read a definition from a `.json` or `.toml` file
pub async fn load_file(path: &Path) -> Result<WorkflowDefinition> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)
            .with_context(|| format!("Failed to parse TOML workflow {}", path.display())),
        _ => serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse JSON workflow {}", path.display())),
    }
}
