//! Compile stage: source → paginated intermediate and cross-reference log.
//!
//! | Path | Condition                                        | Runs                          |
//! |------|--------------------------------------------------|-------------------------------|
//! | Fast | body-only change and the cached format is reused | `compile_fast` once           |
//! | Slow | anything else                                    | `compile` × passes, bib after 1 |
//!
//! The fast path cannot settle cross-references, so its output is scanned
//! for unresolved-reference markers; the scheduler then makes the next build
//! structural.

use super::{FormatCache, FormatState, StageContext};
use crate::build::job::StageError;
use crate::utils::exec::FilterRule;
use std::fs;

/// Compiler warnings worth surfacing in the job log.
const WARNING_FILTER: FilterRule =
    FilterRule::new(&["LaTeX Warning", "Package", "Overfull", "Underfull"]);

/// Warning lines kept per compile.
const MAX_WARNINGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOutcome {
    pub fast: bool,
    /// Output mentions unresolved references or citations.
    pub unresolved: bool,
}

/// Whether compiler output reports references that need another pass.
pub fn has_unresolved(output: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| output.contains(m.as_str()))
}

pub async fn compile(
    ctx: &StageContext<'_>,
    formats: &FormatCache,
    structural: bool,
) -> Result<CompileOutcome, StageError> {
    let doc = ctx.doc;
    let build = &ctx.config.build;

    fs::create_dir_all(doc.build_dir())
        .map_err(|e| StageError::Compile(format!("cannot create build directory: {e}")))?;

    let format = formats.ensure(ctx, structural).await?;

    // A compiler that exits cleanly without output must not pass on the last build's pdf
    match fs::remove_file(doc.pdf_path()) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(StageError::Compile(format!("cannot remove stale output: {e}")));
        }
        _ => {}
    }
    let fast = !structural && format == FormatState::Reused;
    let vars = ctx.vars();

    let output = if fast {
        ctx.log.line("compile", "fast path");
        ctx.run(
            "compile",
            &build.commands.compile_fast,
            &vars,
            build.compile_timeout(),
            StageError::Compile,
        )
        .await?
        .combined
    } else {
        let passes = build.passes.max(1);
        ctx.log.line("compile", format!("slow path, {passes} passes"));
        let mut last = String::new();
        for pass in 1..=passes {
            last = ctx
                .run(
                    "compile",
                    &build.commands.compile,
                    &vars,
                    build.compile_timeout(),
                    StageError::Compile,
                )
                .await?
                .combined;

            if pass == 1
                && let Some(bibliography) = &build.commands.bibliography
            {
                // bibliography failures surface as unresolved citations
                if let Err(e) = ctx
                    .run(
                        "bibliography",
                        bibliography,
                        &vars,
                        build.compile_timeout(),
                        StageError::Compile,
                    )
                    .await
                {
                    if e.is_superseded() {
                        return Err(e);
                    }
                    ctx.log.line("compile", e.to_string());
                }
            }
        }
        last
    };

    for warning in WARNING_FILTER.select(&output).into_iter().take(MAX_WARNINGS) {
        ctx.log.line("compile", warning);
    }

    if !doc.pdf_path().is_file() {
        return Err(StageError::Compile(format!(
            "no output produced at {}",
            doc.pdf_path().display()
        )));
    }

    let unresolved = fast && has_unresolved(&output, &build.unresolved_markers);
    if unresolved {
        ctx.log.line("compile", "unresolved references, next build runs the slow path");
    }

    Ok(CompileOutcome { fast, unresolved })
}
