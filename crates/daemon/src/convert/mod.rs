//! Conversion seam: label rendering and PDF assembly.
//!
//! The daemon does not rasterize labels or lay out PDFs itself. It drives a
//! [`LabelRenderer`] and a [`PdfAssembler`]; the shipped implementations
//! shell out to external programs (see [`command`]).

pub mod command;

pub use command::{CommandAssembler, CommandRenderer};

use crate::config::ConverterConfig;
use crate::dimensions::{DimensionMode, DimensionResolver, Dimensions, LabelSpec};
use crate::work_item::WorkItem;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Error type for conversion operations
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Nothing to convert
    #[error("no labels found in content")]
    NoLabels,

    /// Renderer rejected a label
    #[error("render failed for label {index}: {message}")]
    Render { index: usize, message: String },

    /// Assembler failed
    #[error("PDF assembly failed: {0}")]
    Assemble(String),

    /// External program exited with non-zero status
    #[error("{program} failed with exit code {code}: {stderr}")]
    ProgramFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    /// External program was terminated by signal
    #[error("{0} was terminated by signal")]
    ProgramTerminated(String),

    /// IO error during conversion
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns one label description into page images.
pub trait LabelRenderer: Send + Sync {
    fn render(&self, content: &str, dimensions: &Dimensions) -> Result<Vec<Vec<u8>>, ConvertError>;
}

/// Joins page images into a PDF document.
pub trait PdfAssembler: Send + Sync {
    fn assemble(&self, pages: &[Vec<u8>]) -> Result<Vec<u8>, ConvertError>;

    /// Assemble and write to `path`, replacing it atomically.
    fn save(&self, pages: &[Vec<u8>], path: &Path) -> Result<(), ConvertError> {
        let bytes = self.assemble(pages)?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}

/// Renderer plus assembler, the full file-to-PDF pipeline.
#[derive(Clone)]
pub struct Converter {
    renderer: Arc<dyn LabelRenderer>,
    assembler: Arc<dyn PdfAssembler>,
    output_folder: Option<PathBuf>,
}

impl Converter {
    pub fn new(renderer: Arc<dyn LabelRenderer>, assembler: Arc<dyn PdfAssembler>) -> Self {
        Self {
            renderer,
            assembler,
            output_folder: None,
        }
    }

    /// Converter backed by the external programs named in the config.
    pub fn from_config(config: &ConverterConfig) -> Self {
        let renderer = CommandRenderer::new(&config.renderer_program, config.renderer_args.clone());
        let assembler =
            CommandAssembler::new(&config.assembler_program, config.assembler_args.clone());
        Self::new(Arc::new(renderer), Arc::new(assembler))
            .with_output_folder(config.output_folder.clone())
    }

    pub fn with_output_folder(mut self, folder: Option<PathBuf>) -> Self {
        self.output_folder = folder;
        self
    }

    /// Render every label in order and save all pages as one PDF.
    ///
    /// Returns the number of pages written.
    pub fn convert(&self, labels: &[LabelSpec], output: &Path) -> Result<usize, ConvertError> {
        if labels.is_empty() {
            return Err(ConvertError::NoLabels);
        }

        let mut pages = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            let rendered = self
                .renderer
                .render(&label.content, &label.dimensions)
                .map_err(|e| match e {
                    ConvertError::Render { .. } => e,
                    other => ConvertError::Render {
                        index,
                        message: other.to_string(),
                    },
                })?;
            pages.extend(rendered);
        }

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.assembler.save(&pages, output)?;
        Ok(pages.len())
    }

    /// Where the PDF for `item` goes: the output folder if configured,
    /// otherwise next to the source file (or the working directory).
    pub fn output_path_for(&self, item: &WorkItem) -> PathBuf {
        output_path_for(item, self.output_folder.as_deref())
    }
}

/// `<file name>.pdf` inside `output_folder`, or beside the source file.
pub fn output_path_for(item: &WorkItem, output_folder: Option<&Path>) -> PathBuf {
    let dir = match (output_folder, item.source()) {
        (Some(folder), _) => folder.to_path_buf(),
        (None, Some(source)) => source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
        (None, None) => PathBuf::new(),
    };
    dir.join(item.output_file_name())
}

/// Outcome of a one-shot conversion.
#[derive(Debug, Clone)]
pub struct ConvertReport {
    pub output: PathBuf,
    pub pages: usize,
    pub labels: Vec<LabelSpec>,
}

/// Convert one file directly, without the queue. The input is left in place.
///
/// `output` defaults to [`Converter::output_path_for`].
pub fn convert_file(
    converter: &Converter,
    resolver: &DimensionResolver,
    mode: DimensionMode,
    input: &Path,
    output: Option<&Path>,
) -> Result<ConvertReport, ConvertError> {
    let bytes = std::fs::read(input)?;
    let content = String::from_utf8_lossy(&bytes).into_owned();
    let labels = resolver.resolve_content(&content, mode);
    if labels.is_empty() {
        return Err(ConvertError::NoLabels);
    }

    let item = WorkItem::from_file(input.to_path_buf(), content, labels);
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| converter.output_path_for(&item));
    let pages = converter.convert(item.labels(), &output)?;

    Ok(ConvertReport {
        output,
        pages,
        labels: item.labels().to_vec(),
    })
}

/// Write `bytes` to a temp file in the target directory, then rename over
/// `path` so readers never see a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
