//! Pipeline stages driving the external tools.
//!
//! - [`format`]: preamble format cache
//! - [`compile`]: source → paginated intermediate + cross-reference log
//! - [`render`]: intermediate → numbered page artifacts
//!
//! Every stage receives a [`StageContext`] and checks the job token before
//! each side effect.

pub mod compile;
pub mod format;
pub mod render;

pub use compile::{CompileOutcome, compile};
pub use format::{FormatCache, FormatState};
pub use render::{PageSelection, page_count, render};

use crate::build::job::{JobLog, JobToken, StageError};
use crate::config::AppConfig;
use crate::document::Document;
use crate::utils::exec::{CommandOutput, CommandRunner, CommandSpec, Vars};
use std::time::Duration;

/// Everything a stage needs for one job.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub doc: &'a Document,
    pub config: &'a AppConfig,
    pub runner: &'a dyn CommandRunner,
    pub token: &'a JobToken,
    pub log: &'a JobLog,
}

impl StageContext<'_> {
    /// Placeholder values shared by every command of the document.
    pub fn vars(&self) -> Vars {
        let doc = self.doc;
        let format = doc.build_dir().join(doc.format_jobname());
        Vars::new()
            .with(
                "main",
                doc.main
                    .as_deref()
                    .map(|m| m.display().to_string())
                    .unwrap_or_default(),
            )
            .with("jobname", doc.jobname())
            .with("builddir", doc.build_dir().display().to_string())
            .with("outdir", doc.output.display().to_string())
            .with("format", format.display().to_string())
            .with("formatname", doc.format_jobname())
            .with("pdf", doc.pdf_path().display().to_string())
    }

    /// Run one command for the current job.
    ///
    /// Captured output of a failed command goes into the job log; a
    /// cancelled command means the job was superseded.
    pub async fn run(
        &self,
        label: &'static str,
        template: &[String],
        vars: &Vars,
        timeout: Duration,
        wrap: fn(String) -> StageError,
    ) -> Result<CommandOutput, StageError> {
        self.token.ensure_current()?;
        let spec = CommandSpec::from_template(label, template, vars, self.doc.root(), timeout)
            .map_err(|e| wrap(e.to_string()))?;

        match self.runner.run(&spec, self.token.cancellation()).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if let Some(output) = e.output() {
                    self.log.output(output);
                }
                Err(StageError::from_exec(e, wrap))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner standing in for the TeX toolchain.
    //!
    //! Command templates used with it:
    //!
    //! | label   | argv                               | effect                          |
    //! |---------|------------------------------------|---------------------------------|
    //! | format  | `fake {format}`                    | writes `{format}.fmt`           |
    //! | compile | `fake {pdf}`                       | writes the pdf, `rev N` content |
    //! | render  | `fake {pages} {output} {pdf}`      | one file per page, pdf content  |

    use crate::utils::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{fs, path::Path, time::Duration};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Default)]
    pub struct FakeRunner {
        /// Pages produced by an "all pages" render.
        pub total_pages: u32,
        pub compile_delay: Duration,
        pub render_delay: Duration,
        /// Compiler output on success.
        pub compile_output: String,
        pub fail_compile: bool,
        /// Compile exits cleanly without writing the pdf.
        pub skip_output: bool,
        pub fail_format: bool,
        pub calls: Mutex<Vec<String>>,
        pub compiles: Mutex<u32>,
    }

    impl FakeRunner {
        pub fn new(total_pages: u32) -> Self {
            Self {
                total_pages,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn count(&self, label: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(label)).count()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            cancel: &CancellationToken,
        ) -> Result<CommandOutput, ExecError> {
            let args: Vec<String> = (0..spec.argv.len() - 1).filter_map(|i| spec.arg(i)).collect();
            self.calls.lock().push(format!("{} {}", spec.label, args.join(" ")));

            let delay = match spec.label {
                "compile" => self.compile_delay,
                "render" => self.render_delay,
                _ => Duration::ZERO,
            };
            tokio::select! {
                () = cancel.cancelled() => return Err(ExecError::Cancelled { name: spec.name() }),
                () = tokio::time::sleep(delay) => {}
            }

            let fail = |message: &str| ExecError::Failed {
                message: message.to_owned(),
                output: format!("! {message}\nl.1 oops"),
            };

            match spec.label {
                "format" => {
                    if self.fail_format {
                        return Err(fail("format failed"));
                    }
                    let path = format!("{}.fmt", args[0]);
                    fs::write(path, "fmt").map_err(|_| fail("write"))?;
                }
                "compile" => {
                    if self.fail_compile {
                        return Err(fail("Undefined control sequence"));
                    }
                    let revision = {
                        let mut compiles = self.compiles.lock();
                        *compiles += 1;
                        *compiles
                    };
                    if self.skip_output {
                        return Ok(CommandOutput::default());
                    }
                    let pdf = Path::new(&args[0]);
                    fs::create_dir_all(pdf.parent().unwrap()).unwrap();
                    fs::write(pdf, format!("rev {revision}")).map_err(|_| fail("write"))?;
                    return Ok(CommandOutput {
                        combined: self.compile_output.clone(),
                    });
                }
                "render" => {
                    let content = fs::read_to_string(&args[2]).map_err(|_| fail("no pdf"))?;
                    let pages: Vec<u32> = if args[0] == "1-" {
                        (1..=self.total_pages).collect()
                    } else {
                        args[0].split(',').filter_map(|p| p.parse().ok()).collect()
                    };
                    for page in pages.into_iter().filter(|p| *p <= self.total_pages) {
                        let path = args[1].replace("%p", &page.to_string());
                        fs::write(path, &content).map_err(|_| fail("write"))?;
                    }
                }
                _ => {}
            }
            Ok(CommandOutput::default())
        }
    }

    /// Configuration wired to [`FakeRunner`].
    pub fn config(root: &Path, passes: u32) -> crate::config::AppConfig {
        let config = format!(
            r#"
            [build]
            passes = {passes}
            debounce_ms = 200
            cancel_grace_ms = 100

            [build.commands]
            format = ["fake", "{{format}}"]
            compile = ["fake", "{{pdf}}"]
            compile_fast = ["fake", "{{pdf}}"]
            render = ["fake", "{{pages}}", "{{output}}", "{{pdf}}"]

            [[document]]
            name = "paper"
            root = "{root}/src"
            main = "main.tex"
            output = "{root}/out"
            "#,
            root = root.display()
        );
        toml::from_str(&config).unwrap()
    }

    pub const MAIN: &str = "\\documentclass{article}\n\\usepackage{amsmath}\n\\begin{document}\nHello.\n\\end{document}\n";

    /// Source tree with a main file, for [`config`].
    pub fn project(root: &Path) {
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/main.tex"), MAIN).unwrap();
    }
}
