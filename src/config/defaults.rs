//! Default values for configuration fields.
//!
//! These functions are used by serde for default deserialization.

// ============================================================================
// Common Defaults
// ============================================================================

pub fn r#true() -> bool {
    true
}

// ============================================================================
// [build] Section Defaults
// ============================================================================

pub mod build {
    pub fn debounce_ms() -> u64 {
        200
    }

    pub fn extract_debounce_ms() -> u64 {
        30_000
    }

    pub fn cancel_grace_ms() -> u64 {
        2_000
    }

    pub fn compile_timeout_secs() -> u64 {
        120
    }

    pub fn render_timeout_secs() -> u64 {
        600
    }

    pub fn extract_timeout_secs() -> u64 {
        300
    }

    pub fn passes() -> u32 {
        2
    }

    pub fn structural_extensions() -> Vec<String> {
        ["bib", "bst", "cls", "sty", "bbx", "cbx"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn tracked_extensions() -> Vec<String> {
        vec!["tex".into()]
    }

    pub fn unresolved_markers() -> Vec<String> {
        [
            "There were undefined references",
            "Rerun to get cross-references right",
            "Label(s) may have changed",
            "Citation `",
            "Reference `",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    pub fn page_pattern() -> String {
        "page-%p.svg".into()
    }

    pub fn metadata_file() -> String {
        "pages.json".into()
    }

    pub mod commands {
        fn argv(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| (*s).to_owned()).collect()
        }

        pub fn format() -> Vec<String> {
            argv(&[
                "pdftex",
                "-ini",
                "-interaction=nonstopmode",
                "-output-directory={builddir}",
                "-jobname={formatname}",
                "&pdflatex",
                "mylatexformat.ltx",
                "{main}",
            ])
        }

        pub fn compile() -> Vec<String> {
            argv(&[
                "pdflatex",
                "-interaction=nonstopmode",
                "-synctex=1",
                "-output-directory={builddir}",
                "{main}",
            ])
        }

        pub fn compile_fast() -> Vec<String> {
            argv(&[
                "pdflatex",
                "-interaction=nonstopmode",
                "-synctex=1",
                "-fmt={format}",
                "-output-directory={builddir}",
                "{main}",
            ])
        }

        pub fn render() -> Vec<String> {
            argv(&[
                "dvisvgm",
                "--pdf",
                "--page={pages}",
                "--output={output}",
                "{pdf}",
            ])
        }
    }
}

// ============================================================================
// [canvas] Section Defaults
// ============================================================================

pub mod canvas {
    pub fn target_width() -> f64 {
        1200.0
    }

    pub fn gap() -> f64 {
        24.0
    }

    /// US letter, in points.
    pub fn page_width() -> f64 {
        612.0
    }

    pub fn page_height() -> f64 {
        792.0
    }

    pub fn nearby_margin() -> f64 {
        20.0
    }

    pub fn horizontal_margin() -> f64 {
        40.0
    }

    pub fn horizontal_ratio() -> f64 {
        2.0
    }
}

// ============================================================================
// [serve] Section Defaults
// ============================================================================

pub mod serve {
    pub fn interface() -> String {
        "127.0.0.1".into()
    }

    pub fn port() -> u16 {
        5278
    }

    pub fn allow_origin() -> String {
        "*".into()
    }
}
