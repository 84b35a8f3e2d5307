//! Template import.
//!
//! Each subdirectory of the templates directory describes one kind of
//! preconfigured server. Its `template.json` manifest is an object
//! `{name?, env?, mounts?, folders?}`; an optional `Dockerfile` next to it
//! means the server image is built from that directory instead of pulled.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::Template;

pub const MANIFEST_FILE: &str = "template.json";
pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    name: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    mounts: Vec<serde_json::Value>,
    #[serde(default)]
    folders: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TemplateImporter {
    dir: PathBuf,
}

impl TemplateImporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enumerates template directories in name order. Manifests are parsed
    /// as the iterator advances; a broken one yields an `Err` item and the
    /// rest still follow.
    pub fn list(&self) -> Result<Templates> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                entries.push(entry.path());
            }
        }
        entries.sort();
        Ok(Templates {
            entries: entries.into_iter(),
        })
    }

    /// All templates that parse; the others are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<Template>> {
        let mut templates = Vec::new();
        for item in self.list()? {
            match item {
                Ok(template) => templates.push(template),
                Err(e) => error!("Skipping template: {}", e),
            }
        }
        info!(
            "Imported {} templates from {}",
            templates.len(),
            self.dir.display()
        );
        Ok(templates)
    }

    /// Loads the template whose directory is named `folder`.
    pub fn load(&self, folder: &str) -> Result<Template> {
        let dir = self.dir.join(folder);
        if !dir.is_dir() {
            return Err(Error::not_found("template", folder));
        }
        read_template(&dir)
    }
}

pub struct Templates {
    entries: std::vec::IntoIter<PathBuf>,
}

impl Iterator for Templates {
    type Item = Result<Template>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|dir| read_template(&dir))
    }
}

fn read_template(dir: &Path) -> Result<Template> {
    let folder = dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::Parse(format!("unusable directory name {}", dir.display())))?;

    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = match fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found("manifest", manifest_path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest = serde_json::from_str(&raw)
        .map_err(|e| Error::Parse(format!("{}: {}", manifest_path.display(), e)))?;

    let dockerfile = Some(dir.join(DOCKERFILE)).filter(|p| p.is_file());
    debug!(
        "Read template {} (dockerfile: {})",
        folder,
        dockerfile.is_some()
    );

    Ok(Template {
        name: manifest.name.unwrap_or_else(|| folder.clone()),
        folder,
        dir: dir.to_path_buf(),
        env: manifest.env,
        mounts: manifest.mounts,
        folders: manifest.folders,
        dockerfile,
    })
}

/// Copies the template's `folders` into a server data directory. Targets
/// that already exist are left alone so a server's own changes survive.
pub fn seed_folders(template: &Template, data_dir: &Path) -> Result<()> {
    for (source, target) in &template.folders {
        let from = template.dir.join(source);
        let to = data_dir.join(target.trim_start_matches('/'));
        if to.exists() {
            debug!("Keeping existing {}", to.display());
            continue;
        }
        if !from.exists() {
            return Err(Error::not_found("template folder", from.display().to_string()));
        }
        copy_recursive(&from, &to)?;
        debug!("Seeded {} -> {}", from.display(), to.display());
    }
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    if from.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        return Ok(());
    }
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}
