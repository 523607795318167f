/// Template renderer using Tera for Jinja2-style template rendering
/// Used for manifests and Helm values files alike
use crate::error::{DeployError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

/// Simple recursive directory walker
fn walkdir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut results = Vec::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                results.extend(walkdir(&path)?);
            } else {
                results.push(path);
            }
        }
    }
    Ok(results)
}

const TEMPLATE_EXTENSIONS: [&str; 4] = [".j2", ".yaml", ".yml", ".json"];

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Renderer with no named templates; files and inline strings still render.
    pub fn empty() -> Self {
        Self {
            tera: Tera::default(),
        }
    }

    /// Load every template file under `templates_dir`, named by relative path.
    pub fn new(templates_dir: PathBuf) -> Result<Self> {
        tracing::debug!(
            "[TemplateRenderer] Initializing Tera with templates_dir: {}",
            templates_dir.display()
        );

        let mut tera = Tera::default();
        let mut template_count = 0;

        for path in walkdir(&templates_dir)? {
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !TEMPLATE_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext)) {
                continue;
            }
            let Ok(rel_path) = path.strip_prefix(&templates_dir) else {
                continue;
            };
            let template_name = rel_path.to_string_lossy().replace('\\', "/");
            let content = std::fs::read_to_string(&path)?;
            tera.add_raw_template(&template_name, &content).map_err(|e| {
                DeployError::Template(format!("Failed to add template {}: {}", template_name, e))
            })?;
            template_count += 1;
            tracing::debug!("[TemplateRenderer] Loaded template: {}", template_name);
        }

        tracing::info!(
            "[TemplateRenderer] Loaded {} templates from {}",
            template_count,
            templates_dir.display()
        );

        Ok(Self { tera })
    }

    fn context(data: &Value) -> Result<Context> {
        Context::from_serialize(data)
            .map_err(|e| DeployError::Template(format!("Invalid template data: {}", e)))
    }

    /// Render a template registered under `template_name`
    pub fn render(&self, template_name: &str, data: &Value) -> Result<String> {
        let context = Self::context(data)?;
        let rendered = self.tera.render(template_name, &context).map_err(|e| {
            DeployError::Template(format!("Failed to render template {}: {}", template_name, e))
        })?;

        tracing::debug!(
            "[TemplateRenderer] Rendered template {} ({} bytes)",
            template_name,
            rendered.len()
        );

        Ok(rendered)
    }

    /// Render inline template text
    pub fn render_str(&self, content: &str, data: &Value) -> Result<String> {
        let context = Self::context(data)?;
        Tera::one_off(content, &context, false)
            .map_err(|e| DeployError::Template(format!("Failed to render inline template: {}", e)))
    }

    /// Render a file: a loaded template when the path names one, the file on
    /// disk otherwise.
    pub fn render_file(&self, path: &Path, data: &Value) -> Result<String> {
        let name = path.to_string_lossy().replace('\\', "/");
        if self.has_template(&name) {
            return self.render(&name, data);
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Template(format!("Failed to read template {}: {}", path.display(), e))
        })?;
        self.render_str(&content, data)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.tera.get_template_names().any(|t| t == name)
    }
}
