//! Dimension resolution for label files.
//!
//! Every label ends up with a physical size and density picked from three
//! tiers, first satisfied wins:
//! 1. explicit caller-supplied width/height (converted from their unit),
//! 2. `^PW`/`^LL` markers extracted from the label itself,
//! 3. a built-in default.

use crate::config::{LabelConfig, Unit};
use serde::{Deserialize, Serialize};

/// Built-in label width used when nothing else applies.
pub const DEFAULT_WIDTH_MM: f64 = 100.0;
/// Built-in label height used when nothing else applies.
pub const DEFAULT_HEIGHT_MM: f64 = 150.0;
/// Built-in print density (8 dots/mm).
pub const DEFAULT_DPI: u32 = 203;

const MM_PER_INCH: f64 = 25.4;

/// Which priority tier produced a [`Dimensions`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionSource {
    Explicit,
    Extracted,
    Default,
}

impl std::fmt::Display for DimensionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimensionSource::Explicit => write!(f, "explicit"),
            DimensionSource::Extracted => write!(f, "extracted"),
            DimensionSource::Default => write!(f, "default"),
        }
    }
}

/// Resolved physical size and density for one label.
///
/// Only constructed through [`Dimensions::new`], which refuses non-positive
/// values, so a worker never sees an unusable size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    width_mm: f64,
    height_mm: f64,
    density_dpi: u32,
    source: DimensionSource,
}

impl Dimensions {
    pub fn new(
        width_mm: f64,
        height_mm: f64,
        density_dpi: u32,
        source: DimensionSource,
    ) -> Option<Self> {
        if is_positive(width_mm) && is_positive(height_mm) && density_dpi > 0 {
            Some(Self {
                width_mm,
                height_mm,
                density_dpi,
                source,
            })
        } else {
            None
        }
    }

    pub fn width_mm(&self) -> f64 {
        self.width_mm
    }

    pub fn height_mm(&self) -> f64 {
        self.height_mm
    }

    pub fn density_dpi(&self) -> u32 {
        self.density_dpi
    }

    pub fn source(&self) -> DimensionSource {
        self.source
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}x{:.1}mm @ {}dpi ({})",
            self.width_mm, self.height_mm, self.density_dpi, self.source
        )
    }
}

fn is_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

/// One label cut out of a file together with its resolved size.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSpec {
    pub content: String,
    pub dimensions: Dimensions,
}

/// How a file's labels get their dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DimensionMode {
    /// Caller forces one size on every label in the file.
    Fixed { width: f64, height: f64, unit: Unit },
    /// Each label is resolved on its own.
    PerLabel,
}

impl DimensionMode {
    pub fn from_config(label: &LabelConfig) -> Self {
        match (label.width, label.height) {
            (Some(width), Some(height)) => DimensionMode::Fixed {
                width,
                height,
                unit: label.unit,
            },
            _ => DimensionMode::PerLabel,
        }
    }
}

/// Picks final dimensions from explicit, extracted and default candidates.
#[derive(Debug, Clone)]
pub struct DimensionResolver {
    density_dpi: u32,
    default: Dimensions,
}

impl Default for DimensionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DPI)
    }
}

impl DimensionResolver {
    /// Resolver whose explicit and extracted tiers use `density_dpi`.
    /// A zero density falls back to [`DEFAULT_DPI`].
    pub fn new(density_dpi: u32) -> Self {
        let density_dpi = if density_dpi > 0 { density_dpi } else { DEFAULT_DPI };
        let default = Dimensions {
            width_mm: DEFAULT_WIDTH_MM,
            height_mm: DEFAULT_HEIGHT_MM,
            density_dpi,
            source: DimensionSource::Default,
        };
        Self {
            density_dpi,
            default,
        }
    }

    pub fn density_dpi(&self) -> u32 {
        self.density_dpi
    }

    pub fn default_dimensions(&self) -> Dimensions {
        self.default
    }

    /// Apply the priority rule to one label.
    ///
    /// Never fails: an incomplete or non-positive explicit pair falls through
    /// to the extracted candidate, and an invalid candidate to the default.
    pub fn resolve(
        &self,
        explicit_width: Option<f64>,
        explicit_height: Option<f64>,
        unit: Unit,
        extracted: Option<Dimensions>,
    ) -> Dimensions {
        if let (Some(w), Some(h)) = (explicit_width, explicit_height) {
            if let Some(dims) = Dimensions::new(
                unit.to_mm(w),
                unit.to_mm(h),
                self.density_dpi,
                DimensionSource::Explicit,
            ) {
                return dims;
            }
        }

        if let Some(candidate) = extracted {
            if is_positive(candidate.width_mm) && is_positive(candidate.height_mm) {
                return Dimensions {
                    source: DimensionSource::Extracted,
                    ..candidate
                };
            }
        }

        self.default
    }

    /// Split `content` into labels and resolve each one.
    ///
    /// In [`DimensionMode::Fixed`] the explicit tier applies uniformly to
    /// every label; otherwise each label's own markers are used.
    pub fn resolve_content(&self, content: &str, mode: DimensionMode) -> Vec<LabelSpec> {
        split_labels(content)
            .into_iter()
            .map(|label| {
                let dimensions = match mode {
                    DimensionMode::Fixed {
                        width,
                        height,
                        unit,
                    } => self.resolve(
                        Some(width),
                        Some(height),
                        unit,
                        extract_candidate(label, self.density_dpi),
                    ),
                    DimensionMode::PerLabel => self.resolve(
                        None,
                        None,
                        Unit::Mm,
                        extract_candidate(label, self.density_dpi),
                    ),
                };
                LabelSpec {
                    content: label.to_string(),
                    dimensions,
                }
            })
            .collect()
    }
}

/// Cut a payload into its `^XA ... ^XZ` label blocks.
///
/// Content without any `^XA` is treated as a single label. Blank blocks are
/// dropped; an unterminated final block runs to the end of the content.
pub fn split_labels(content: &str) -> Vec<&str> {
    if !content.contains("^XA") {
        return if content.trim().is_empty() {
            Vec::new()
        } else {
            vec![content.trim()]
        };
    }

    let mut labels = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("^XA") {
        let block = &rest[start..];
        let end = block.find("^XZ").map(|i| i + 3).unwrap_or(block.len());
        let label = block[..end].trim();
        let body = label
            .trim_start_matches("^XA")
            .trim_end_matches("^XZ")
            .trim();
        if !body.is_empty() {
            labels.push(label);
        }
        rest = &block[end..];
    }
    labels
}

/// Read the `^PW` (print width) and `^LL` (label length) markers of one
/// label, in dots, and convert them to millimeters at `dpi`.
///
/// Returns `None` unless both are present and positive.
pub fn extract_candidate(label: &str, dpi: u32) -> Option<Dimensions> {
    if dpi == 0 {
        return None;
    }
    let width_dots = find_numeric_command(label, "^PW")?;
    let height_dots = find_numeric_command(label, "^LL")?;

    let dots_to_mm = |dots: u32| f64::from(dots) / f64::from(dpi) * MM_PER_INCH;
    Dimensions::new(
        dots_to_mm(width_dots),
        dots_to_mm(height_dots),
        dpi,
        DimensionSource::Extracted,
    )
}

/// Last occurrence of `command` followed directly by digits.
fn find_numeric_command(label: &str, command: &str) -> Option<u32> {
    label
        .match_indices(command)
        .filter_map(|(idx, _)| {
            let digits: String = label[idx + command.len()..]
                .chars()
                .skip_while(|c| *c == ' ')
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse::<u32>().ok()
        })
        .last()
}
