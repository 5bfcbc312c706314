//! `[build]` section configuration.
//!
//! Contains scheduler timings, change classification and the external
//! tool command templates.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Main BuildConfig
// ============================================================================

/// `[build]` section in pagesync.toml - build pipeline configuration.
///
/// # Example
/// ```toml
/// [build]
/// debounce_ms = 200
/// extract_debounce_ms = 30000
/// passes = 2
///
/// [build.commands]
/// compile = ["pdflatex", "-synctex=1", "-output-directory={builddir}", "{main}"]
/// render = ["dvisvgm", "--pdf", "--page={pages}", "--output={output}", "{pdf}"]
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Quiet period before a burst of change notifications starts a build.
    #[serde(default = "defaults::build::debounce_ms")]
    #[educe(Default = defaults::build::debounce_ms())]
    pub debounce_ms: u64,

    /// Idle period after a full render before the lookup table is extracted.
    #[serde(default = "defaults::build::extract_debounce_ms")]
    #[educe(Default = defaults::build::extract_debounce_ms())]
    pub extract_debounce_ms: u64,

    /// How long a superseding build waits for the old job to tear down.
    #[serde(default = "defaults::build::cancel_grace_ms")]
    #[educe(Default = defaults::build::cancel_grace_ms())]
    pub cancel_grace_ms: u64,

    #[serde(default = "defaults::build::compile_timeout_secs")]
    #[educe(Default = defaults::build::compile_timeout_secs())]
    pub compile_timeout_secs: u64,

    #[serde(default = "defaults::build::render_timeout_secs")]
    #[educe(Default = defaults::build::render_timeout_secs())]
    pub render_timeout_secs: u64,

    #[serde(default = "defaults::build::extract_timeout_secs")]
    #[educe(Default = defaults::build::extract_timeout_secs())]
    pub extract_timeout_secs: u64,

    /// Compiler runs on the slow path (cross-references need two).
    #[serde(default = "defaults::build::passes")]
    #[educe(Default = defaults::build::passes())]
    pub passes: u32,

    /// Extensions whose change forces the slow path (bibliography, style, class).
    #[serde(default = "defaults::build::structural_extensions")]
    #[educe(Default = defaults::build::structural_extensions())]
    pub structural_extensions: Vec<String>,

    /// Source extensions indexed by the cross-reference parser.
    #[serde(default = "defaults::build::tracked_extensions")]
    #[educe(Default = defaults::build::tracked_extensions())]
    pub tracked_extensions: Vec<String>,

    /// Compiler output fragments meaning "references are unresolved".
    #[serde(default = "defaults::build::unresolved_markers")]
    #[educe(Default = defaults::build::unresolved_markers())]
    pub unresolved_markers: Vec<String>,

    /// Page artifact file name, `%p` is the page number.
    #[serde(default = "defaults::build::page_pattern")]
    #[educe(Default = defaults::build::page_pattern())]
    pub page_pattern: String,

    /// Page dimension metadata written by the renderer (paginated-flow layout).
    #[serde(default = "defaults::build::metadata_file")]
    #[educe(Default = defaults::build::metadata_file())]
    pub metadata_file: String,

    /// External tool command templates.
    #[serde(default)]
    pub commands: CommandsConfig,
}

impl BuildConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn extract_debounce(&self) -> Duration {
        Duration::from_millis(self.extract_debounce_ms)
    }

    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub const fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub const fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub const fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// `[build.commands]` - argv templates for the external tools.
///
/// Placeholders: `{main}`, `{jobname}`, `{builddir}`, `{outdir}`, `{format}`,
/// `{formatname}`, `{pdf}`, `{pages}`, `{output}`.
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    /// One-time preamble format compilation.
    #[serde(default = "defaults::build::commands::format")]
    #[educe(Default = defaults::build::commands::format())]
    pub format: Vec<String>,

    /// Slow-path compiler invocation (run `passes` times).
    #[serde(default = "defaults::build::commands::compile")]
    #[educe(Default = defaults::build::commands::compile())]
    pub compile: Vec<String>,

    /// Fast-path compiler invocation using the cached format.
    #[serde(default = "defaults::build::commands::compile_fast")]
    #[educe(Default = defaults::build::commands::compile_fast())]
    pub compile_fast: Vec<String>,

    /// Bibliography processor, run between slow-path passes when set.
    #[serde(default)]
    pub bibliography: Option<Vec<String>>,

    /// Page converter; `{pages}` is a comma separated page list or `1-` for all.
    #[serde(default = "defaults::build::commands::render")]
    #[educe(Default = defaults::build::commands::render())]
    pub render: Vec<String>,
}

impl CommandsConfig {
    /// Every configured program name, for availability checks.
    pub fn programs(&self) -> impl Iterator<Item = &str> {
        [
            self.format.first(),
            self.compile.first(),
            self.compile_fast.first(),
            self.render.first(),
            self.bibliography.as_ref().and_then(|b| b.first()),
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
    }
}
