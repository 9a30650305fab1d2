//! External-program renderer and assembler.
//!
//! Builds and runs the configured programs, substituting placeholders in
//! their argument templates:
//! - `{width_mm}`, `{height_mm}`, `{dpi}`: label size for the renderer
//! - `{pages}`: one argument per page image file (assembler)
//! - `{output}`: the PDF path (assembler)

use super::{ConvertError, LabelRenderer, PdfAssembler};
use crate::dimensions::Dimensions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// Renders a label by piping it to a program and reading one page image
/// back from its stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build the renderer command for one label size.
    pub fn build_command(&self, dimensions: &Dimensions) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            cmd.arg(substitute_dimensions(arg, dimensions));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl LabelRenderer for CommandRenderer {
    fn render(&self, content: &str, dimensions: &Dimensions) -> Result<Vec<Vec<u8>>, ConvertError> {
        let mut child = self.build_command(dimensions).spawn()?;
        let stdin = child.stdin.take();

        // Feed stdin from its own thread while stdout and stderr drain here,
        // otherwise a renderer that streams output stalls on a full pipe.
        let (output, written) = std::thread::scope(|scope| {
            let writer = stdin.map(|mut stdin| {
                scope.spawn(move || stdin.write_all(content.as_bytes()))
            });
            let output = child.wait_with_output();
            let written = match writer {
                Some(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked"))),
                None => Ok(()),
            };
            (output, written)
        });
        let output = output?;
        check_status(&self.program, &output)?;
        written?;

        if output.stdout.is_empty() {
            return Err(ConvertError::Render {
                index: 0,
                message: format!("{} produced no image", self.program),
            });
        }
        Ok(vec![output.stdout])
    }
}

/// Assembles page images into a PDF by running a program over page files
/// written to a scratch directory.
#[derive(Debug, Clone)]
pub struct CommandAssembler {
    program: String,
    args: Vec<String>,
}

impl CommandAssembler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build the assembler command for a set of page files.
    pub fn build_command(&self, page_files: &[PathBuf], output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            if arg == "{pages}" {
                cmd.args(page_files);
            } else {
                cmd.arg(arg.replace("{output}", &output.to_string_lossy()));
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run_into(&self, pages: &[Vec<u8>], output: &Path) -> Result<(), ConvertError> {
        if pages.is_empty() {
            return Err(ConvertError::Assemble("no pages to assemble".to_string()));
        }

        let scratch = tempfile::tempdir()?;
        let mut page_files = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let file = scratch.path().join(format!("page-{:04}.png", i + 1));
            std::fs::write(&file, page)?;
            page_files.push(file);
        }

        let output_result = self.build_command(&page_files, output).output()?;
        check_status(&self.program, &output_result)?;

        if !output.exists() {
            return Err(ConvertError::Assemble(format!(
                "{} did not create {}",
                self.program,
                output.display()
            )));
        }
        Ok(())
    }
}

impl PdfAssembler for CommandAssembler {
    fn assemble(&self, pages: &[Vec<u8>]) -> Result<Vec<u8>, ConvertError> {
        let scratch = tempfile::tempdir()?;
        let output = scratch.path().join("document.pdf");
        self.run_into(pages, &output)?;
        Ok(std::fs::read(&output)?)
    }

    fn save(&self, pages: &[Vec<u8>], path: &Path) -> Result<(), ConvertError> {
        // Assemble beside the target, then rename, so the watcher's folder
        // never holds a half-written PDF.
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".assembling-")
            .suffix(".pdf")
            .tempfile_in(&dir)?
            .into_temp_path();
        self.run_into(pages, &staging)?;
        staging.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn substitute_dimensions(arg: &str, dimensions: &Dimensions) -> String {
    arg.replace("{width_mm}", &format!("{:.2}", dimensions.width_mm()))
        .replace("{height_mm}", &format!("{:.2}", dimensions.height_mm()))
        .replace("{dpi}", &dimensions.density_dpi().to_string())
}

fn check_status(program: &str, output: &Output) -> Result<(), ConvertError> {
    if output.status.success() {
        return Ok(());
    }
    match output.status.code() {
        Some(code) => Err(ConvertError::ProgramFailed {
            program: program.to_string(),
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        None => Err(ConvertError::ProgramTerminated(program.to_string())),
    }
}
