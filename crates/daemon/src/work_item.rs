//! Work items flowing from the folder monitor into the processing queue.

use crate::dimensions::{Dimensions, LabelSpec};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// Size and mtime of a source file at the moment it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStamp {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl SourceStamp {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// One unit of conversion work: a label file and its resolved labels.
///
/// Owned by the queue once enqueued; dropped after its terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Unique id used in logs and events.
    pub id: String,
    /// File that triggered processing; empty when content arrived another way.
    pub source_path: PathBuf,
    /// Display name, also the stem of the output file.
    pub file_name: String,
    /// Full payload as read from the file.
    pub content: String,
    /// Labels cut from `content`, each with its own resolved dimensions.
    labels: Vec<LabelSpec>,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// Lock conflicts seen so far.
    pub retry_count: u32,
    /// Message from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Source file state when `content` was read.
    source_stamp: Option<SourceStamp>,
}

impl WorkItem {
    /// Item for a file on disk.
    pub fn from_file(source_path: PathBuf, content: String, labels: Vec<LabelSpec>) -> Self {
        let file_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "label".to_string());
        Self::build(source_path, file_name, content, labels)
    }

    /// Item whose content did not come from a watched file.
    pub fn from_content(file_name: impl Into<String>, content: String, labels: Vec<LabelSpec>) -> Self {
        Self::build(PathBuf::new(), file_name.into(), content, labels)
    }

    fn build(source_path: PathBuf, file_name: String, content: String, labels: Vec<LabelSpec>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_path,
            file_name,
            content,
            labels,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            source_stamp: None,
        }
    }

    /// Remember the source file state the content was read from.
    pub fn with_source_stamp(mut self, stamp: SourceStamp) -> Self {
        self.source_stamp = Some(stamp);
        self
    }

    /// Take content, labels and stamp from a newer read of the same file.
    /// Id and retry count stay.
    pub fn refresh_from(&mut self, newer: WorkItem) {
        self.content = newer.content;
        self.labels = newer.labels;
        self.source_stamp = newer.source_stamp;
    }

    /// True when the source file no longer matches the stamp taken at read
    /// time. Items without a stamp never count as changed.
    pub fn source_changed(&self) -> bool {
        let (Some(source), Some(stamp)) = (self.source(), self.source_stamp) else {
            return false;
        };
        match SourceStamp::of(source) {
            Ok(current) => current != stamp,
            Err(_) => false,
        }
    }

    /// Resolved labels; fixed once the item is built.
    pub fn labels(&self) -> &[LabelSpec] {
        &self.labels
    }

    /// Dimensions of every label, in file order.
    pub fn dimensions(&self) -> impl Iterator<Item = &Dimensions> {
        self.labels.iter().map(|l| &l.dimensions)
    }

    /// The watched file behind this item, if any.
    pub fn source(&self) -> Option<&Path> {
        if self.source_path.as_os_str().is_empty() {
            None
        } else {
            Some(&self.source_path)
        }
    }

    /// Output file name: the display name with `.pdf` appended.
    ///
    /// The source extension is kept so `a.txt` and `a.prn` in one folder
    /// never write the same PDF.
    pub fn output_file_name(&self) -> String {
        let name = Path::new(&self.file_name)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.clone());
        format!("{}.pdf", name)
    }

    /// Record a lock conflict and return the new count.
    pub fn record_lock_conflict(&mut self) -> u32 {
        self.retry_count += 1;
        self.last_error = Some(format!("file locked (attempt {})", self.retry_count));
        self.retry_count
    }

    pub fn fail(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::{DimensionMode, DimensionResolver};

    fn labels(content: &str) -> Vec<LabelSpec> {
        DimensionResolver::default().resolve_content(content, DimensionMode::PerLabel)
    }

    #[test]
    fn test_from_file_sets_display_name() {
        let content = "^XA^FDx^FS^XZ".to_string();
        let item = WorkItem::from_file(
            PathBuf::from("/spool/in/order-17.prn"),
            content.clone(),
            labels(&content),
        );

        assert_eq!(item.file_name, "order-17.prn");
        assert_eq!(item.source(), Some(Path::new("/spool/in/order-17.prn")));
        assert_eq!(item.output_file_name(), "order-17.prn.pdf");
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.is_none());
        assert_eq!(item.labels().len(), 1);
    }

    #[test]
    fn test_from_content_has_no_source() {
        let item = WorkItem::from_content("pasted", "^XA^XZ".to_string(), Vec::new());
        assert!(item.source().is_none());
        assert_eq!(item.output_file_name(), "pasted.pdf");
    }

    #[test]
    fn test_output_names_differ_by_source_extension() {
        let txt = WorkItem::from_file(PathBuf::from("/in/a.txt"), String::new(), Vec::new());
        let prn = WorkItem::from_file(PathBuf::from("/in/a.prn"), String::new(), Vec::new());
        assert_eq!(txt.output_file_name(), "a.txt.pdf");
        assert_eq!(prn.output_file_name(), "a.prn.pdf");
    }

    #[test]
    fn test_source_changed_after_append() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("slow.txt");
        std::fs::write(&path, "^XA^FDpart").unwrap();
        let stamp = SourceStamp::of(&path).unwrap();
        let item = WorkItem::from_file(path.clone(), "^XA^FDpart".into(), Vec::new())
            .with_source_stamp(stamp);
        assert!(!item.source_changed());

        std::fs::write(&path, "^XA^FDpart^FS^XZ").unwrap();
        assert!(item.source_changed());
    }

    #[test]
    fn test_unstamped_item_never_changed() {
        let item = WorkItem::from_file(PathBuf::from("/nowhere/x.txt"), String::new(), Vec::new());
        assert!(!item.source_changed());
    }

    #[test]
    fn test_refresh_from_keeps_identity() {
        let mut item = WorkItem::from_file(PathBuf::from("/in/a.txt"), "old".into(), labels("^XA^FDold^FS^XZ"));
        item.record_lock_conflict();
        let id = item.id.clone();
        let newer = WorkItem::from_file(
            PathBuf::from("/in/a.txt"),
            "^XA^FDa^FS^XZ^XA^FDb^FS^XZ".into(),
            labels("^XA^FDa^FS^XZ^XA^FDb^FS^XZ"),
        );

        item.refresh_from(newer);
        assert_eq!(item.id, id);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.content, "^XA^FDa^FS^XZ^XA^FDb^FS^XZ");
        assert_eq!(item.labels().len(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = WorkItem::from_content("a.txt", String::new(), Vec::new());
        let b = WorkItem::from_content("a.txt", String::new(), Vec::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_record_lock_conflict_counts() {
        let mut item = WorkItem::from_content("a.txt", String::new(), Vec::new());
        assert_eq!(item.record_lock_conflict(), 1);
        assert_eq!(item.record_lock_conflict(), 2);
        assert_eq!(item.retry_count, 2);
        assert!(item.last_error.as_deref().unwrap().contains("attempt 2"));
    }
}
