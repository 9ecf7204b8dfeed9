use crate::config::Config;
use crate::error::AppError;
use crate::utils::path_utils::{resolve_within, sanitize_relative_path, validate_single_component};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Definition files looked up in each skill directory, first match wins.
const DEFINITION_FILES: [&str; 3] = ["skill.md", "skills.md", "README.md"];

// --- Schemas for parameters ---
#[derive(Debug, Deserialize)]
pub struct ReadSkillFileParams {
    pub path: Option<String>,
}

// --- Schemas for results ---
#[derive(Debug, Serialize)]
pub struct Skill {
    pub id: String,
    pub content: String,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ListSkillsResult {
    pub skills: Vec<Skill>,
}

#[derive(Debug, Serialize)]
pub struct SkillFileContent {
    pub content: String,
}

/// Serves the skill library: one subdirectory per skill, each with a markdown
/// definition file and any supporting files.
pub struct SkillManager {
    skills_dir: PathBuf,
}

impl SkillManager {
    pub fn new(config: &Config) -> Self {
        Self {
            skills_dir: config.skills_dir.clone(),
        }
    }

    #[instrument(skip(self), fields(skills_dir = %self.skills_dir.display()))]
    pub async fn list_skills(&self) -> Result<ListSkillsResult, AppError> {
        if !fs::try_exists(&self.skills_dir).await.unwrap_or(false) {
            if let Err(e) = fs::create_dir_all(&self.skills_dir).await {
                warn!(error = %e, "Failed to create skills directory");
            }
            return Ok(ListSkillsResult { skills: Vec::new() });
        }

        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.skills_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry);
            }
        }
        dirs.sort_by_key(|entry| entry.file_name());

        let mut skills = Vec::new();
        for entry in dirs {
            let skill_dir = entry.path();
            let Some(definition) = find_definition(&skill_dir).await else {
                debug!(dir = %skill_dir.display(), "Skipping directory without a skill definition");
                continue;
            };
            let content = fs::read_to_string(&definition).await?;
            let files = collect_files(&skill_dir).await?;
            skills.push(Skill {
                id: entry.file_name().to_string_lossy().into_owned(),
                content,
                files,
            });
        }

        debug!(count = skills.len(), "Listed skills");
        Ok(ListSkillsResult { skills })
    }

    #[instrument(skip(self))]
    pub async fn read_skill_file(&self, skill_id: &str, path: &str) -> Result<SkillFileContent, AppError> {
        validate_single_component(skill_id)?;
        let relative = sanitize_relative_path(path);
        if relative.as_os_str().is_empty() {
            return Err(AppError::InvalidPath(format!("'{}' does not name a file", path)));
        }

        let skill_dir = self.skills_dir.join(skill_id);
        let resolved = match resolve_within(&skill_dir, &relative) {
            Err(AppError::NotFound(_)) => return Err(AppError::NotFound("File not found".to_string())),
            other => other?,
        };
        if !fs::metadata(&resolved).await?.is_file() {
            return Err(AppError::NotFound("File not found".to_string()));
        }

        let bytes = fs::read(&resolved).await?;
        Ok(SkillFileContent {
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

async fn find_definition(skill_dir: &Path) -> Option<PathBuf> {
    for name in DEFINITION_FILES {
        let candidate = skill_dir.join(name);
        if fs::metadata(&candidate).await.map(|m| m.is_file()).unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

/// Every regular file below `root`, relative to it with `/` separators, sorted.
async fn collect_files(root: &Path) -> Result<Vec<String>, AppError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    let parts: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    files.push(parts.join("/"));
                }
            }
        }
    }
    files.sort();
    Ok(files)
}
