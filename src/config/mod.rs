//! Project configuration management for `pagesync.toml`.
//!
//! # Sections
//!
//! | Section        | Purpose                                          |
//! |----------------|--------------------------------------------------|
//! | `[build]`      | Debounce timings, timeouts, tool commands        |
//! | `[canvas]`     | Fixed-page canvas geometry, region tolerances    |
//! | `[serve]`      | Query server (port, interface, watch)            |
//! | `[[document]]` | Registered documents and their dependents        |
//!
//! # Example
//!
//! ```toml
//! [build]
//! debounce_ms = 200
//!
//! [canvas]
//! target_width = 1200.0
//!
//! [[document]]
//! name = "paper"
//! root = "paper"
//! main = "main.tex"
//! output = "out/paper"
//! ```

mod build;
mod canvas;
pub mod defaults;
mod document;
mod error;
mod serve;

pub use build::BuildConfig;
pub use canvas::{CanvasConfig, Origin};
pub use document::{DocumentConfig, LayoutMode};
pub use error::ConfigError;
pub use serve::ServeConfig;

use crate::cli::{Cli, Commands};
use crate::log;
use anyhow::{Result, bail};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure representing pagesync.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Absolute path to the config file (set after loading)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Project root every relative path is resolved against
    #[serde(skip)]
    pub root: PathBuf,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub canvas: CanvasConfig,

    #[serde(default)]
    pub serve: ServeConfig,

    #[serde(default, rename = "document")]
    pub documents: Vec<DocumentConfig>,
}

impl AppConfig {
    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from file path
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        Self::from_str(&content)
    }

    /// Load, resolve and validate the configuration named by the CLI.
    pub fn load(cli: &Cli) -> Result<Self> {
        let root = cli.root.as_deref().unwrap_or(Path::new("./"));
        let config_path = root.join(&cli.config);
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }

        let mut config = Self::from_path(&config_path)?;
        config.config_path = normalize_path(&config_path);
        config.update_with_cli(cli, root);
        config.validate()?;
        config.check_tools();
        Ok(config)
    }

    /// Update configuration with CLI arguments
    pub fn update_with_cli(&mut self, cli: &Cli, root: &Path) {
        self.update_path_with_root(root);

        if let Commands::Watch {
            interface,
            port,
            watch,
        } = &cli.command
        {
            Self::update_option(&mut self.serve.interface, interface.as_ref());
            Self::update_option(&mut self.serve.port, port.as_ref());
            Self::update_option(&mut self.serve.watch, watch.as_ref());
        }
    }

    /// Update config option if CLI value is provided
    fn update_option<T: Clone>(config_option: &mut T, cli_option: Option<&T>) {
        if let Some(option) = cli_option {
            *config_option = option.clone();
        }
    }

    /// Resolve every document path against the project root.
    ///
    /// `main` stays relative to the document's own `root`.
    pub fn update_path_with_root(&mut self, root: &Path) {
        let root = normalize_path(root);
        for doc in &mut self.documents {
            if let Some(src) = doc.root.take() {
                doc.root = Some(resolve(&root, &src));
            }
            doc.output = resolve(&root, &doc.output);
        }
        self.root = root;
    }

    /// Validate the document registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = FxHashSet::default();
        for doc in &self.documents {
            if !names.insert(doc.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate document `{}`",
                    doc.name
                )));
            }
        }

        for doc in &self.documents {
            match &doc.depends_on {
                Some(parent) => {
                    let Some(primary) = self.document(parent) else {
                        return Err(ConfigError::Validation(format!(
                            "document `{}` depends on unknown document `{parent}`",
                            doc.name
                        )));
                    };
                    if primary.is_dependent() {
                        return Err(ConfigError::Validation(format!(
                            "document `{}` depends on `{parent}`, which is itself derived",
                            doc.name
                        )));
                    }
                }
                None if doc.root.is_none() || doc.main.is_none() => {
                    return Err(ConfigError::Validation(format!(
                        "document `{}` needs both `root` and `main`",
                        doc.name
                    )));
                }
                None => {}
            }
        }

        if self.canvas.page_width <= 0.0 || self.canvas.page_height <= 0.0 {
            return Err(ConfigError::Validation(
                "[canvas] page size must be positive".into(),
            ));
        }
        let positive = |v: f64| v > 0.0;
        if !positive(self.canvas.target_width) || !self.canvas.target_height.is_none_or(positive) {
            return Err(ConfigError::Validation(
                "[canvas] target size must be positive".into(),
            ));
        }
        if let Err(e) = self.serve.interface_addr() {
            return Err(ConfigError::Validation(format!(
                "[serve] invalid interface `{}`: {e}",
                self.serve.interface
            )));
        }
        if self.build.commands.compile.is_empty() || self.build.commands.render.is_empty() {
            return Err(ConfigError::Validation(
                "[build.commands] compile and render must have at least one element".into(),
            ));
        }

        Ok(())
    }

    /// Warn about tools that are not on `PATH`.
    ///
    /// Not fatal: `extract` and `lookup` never spawn them.
    fn check_tools(&self) {
        for program in self.build.commands.programs() {
            if which::which(program).is_err() {
                log!("config"; "`{program}` not found in PATH");
            }
        }
    }

    pub fn document(&self, name: &str) -> Option<&DocumentConfig> {
        self.documents.iter().find(|d| d.name == name)
    }

    /// Documents compiled from source.
    pub fn primaries(&self) -> impl Iterator<Item = &DocumentConfig> {
        self.documents.iter().filter(|d| !d.is_dependent())
    }

    /// Diff documents derived from `name`.
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DocumentConfig> {
        self.documents
            .iter()
            .filter(move |d| d.depends_on.as_deref() == Some(name))
    }
}

/// Join `path` onto `root` unless absolute, expanding `~` first.
fn resolve(root: &Path, path: &Path) -> PathBuf {
    let path = match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).into_owned()),
        None => path.to_path_buf(),
    };
    if path.is_absolute() {
        normalize_path(&path)
    } else {
        normalize_path(&root.join(path))
    }
}

/// Normalize a path to absolute, using canonicalize if the path exists
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        // For non-existent paths, manually make them absolute
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
