//! `.fractal/` scaffolding and canonical paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{FractalConfig, write_config};

/// All canonical paths within `.fractal/` for a project root.
#[derive(Debug, Clone)]
pub struct FractalPaths {
    pub root: PathBuf,
    pub fractal_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
    /// Decision command artifacts (prompts, schemas, outputs) per task.
    pub decisions_dir: PathBuf,
}

impl FractalPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let fractal_dir = root.join(".fractal");
        Self {
            root: root.clone(),
            fractal_dir: fractal_dir.clone(),
            gitignore_path: fractal_dir.join(".gitignore"),
            config_path: fractal_dir.join("config.toml"),
            run_state_path: fractal_dir.join("run.json"),
            decisions_dir: fractal_dir.join("decisions"),
        }
    }

    /// Resolve a config path relative to the project root.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing `.fractal/config.toml`.
    pub force: bool,
}

/// Create `.fractal/` with a default config.
///
/// Fails if the config already exists unless `options.force` is set. Existing
/// task state is never touched.
pub fn init_fractal(root: &Path, options: &InitOptions) -> Result<FractalPaths> {
    let paths = FractalPaths::new(root);
    if paths.fractal_dir.exists() && !paths.fractal_dir.is_dir() {
        return Err(anyhow!("fractal init: .fractal exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "fractal init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.fractal_dir)
        .with_context(|| format!("create directory {}", paths.fractal_dir.display()))?;
    write_config(&paths.config_path, &FractalConfig::default())?;
    fs::write(&paths.gitignore_path, FRACTAL_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    Ok(paths)
}

const FRACTAL_GITIGNORE: &str = "logs/\ndecisions/\n";
