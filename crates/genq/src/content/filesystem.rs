//! Markdown files with a JSON front-matter block, one per artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::{ArtifactSettings, ContentStore, ContentStoreError, NewArtifact};

const MAX_SLUG_CHARS: usize = 80;
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Serialize)]
struct FrontMatter<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(flatten)]
    settings: &'a ArtifactSettings,
}

pub struct FileContentStore {
    output_directory: PathBuf,
}

impl FileContentStore {
    pub fn new<P: AsRef<Path>>(output_directory: P) -> Self {
        Self {
            output_directory: output_directory.as_ref().to_path_buf(),
        }
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    /// Creates `<slug>.md`, or `<slug>_N.md` when that name is taken.
    /// Creation is exclusive (`O_CREAT | O_EXCL`) so concurrent writers never
    /// overwrite each other.
    async fn write_exclusive(&self, slug: &str, content: &[u8]) -> Result<PathBuf, ContentStoreError> {
        for counter in 1..=MAX_NAME_ATTEMPTS {
            let filename = if counter == 1 {
                format!("{}.md", slug)
            } else {
                format!("{}_{}.md", slug, counter)
            };
            let path = self.output_directory.join(&filename);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(content)
                        .await
                        .map_err(|e| ContentStoreError::WriteFile {
                            path: path.clone(),
                            source: e,
                        })?;
                    file.flush().await.map_err(|e| ContentStoreError::WriteFile {
                        path: path.clone(),
                        source: e,
                    })?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ContentStoreError::WriteFile { path, source: e }),
            }
        }

        Err(ContentStoreError::FileExists(
            self.output_directory.join(format!("{}.md", slug)),
        ))
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn create_artifact(&self, artifact: &NewArtifact) -> Result<String, ContentStoreError> {
        tokio::fs::create_dir_all(&self.output_directory)
            .await
            .map_err(|e| ContentStoreError::CreateDirectory {
                path: self.output_directory.clone(),
                source: e,
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let front_matter = serde_json::to_string_pretty(&FrontMatter {
            id: &id,
            title: &artifact.title,
            settings: &artifact.settings,
        })?;
        let document = format!("---\n{}\n---\n\n{}\n", front_matter, artifact.body.trim_end());

        let path = self.write_exclusive(&slugify(&artifact.title), document.as_bytes()).await?;
        log::debug!("Artifact {} written to {}", id, path.display());

        Ok(id)
    }
}

fn slugify(value: &str) -> String {
    let slug = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = slug.chars().take(MAX_SLUG_CHARS).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "artifact".to_string()
    } else {
        slug.to_string()
    }
}
