//! CSV-backed dataset tables: label tables, demographics lookup, image layout.
//!
//! The label CSVs come from the upstream reformatting step: a blank-named
//! leading identifier column, then one 0/1 column per class. The demographics
//! CSV carries the full `updated_path` for each example plus its
//! `binary_race` value; pool identifiers are path tails, so the lookup is a
//! suffix match.

use crate::error::{HarnessError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Protected-attribute value attached to each demo example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subgroup {
    Black,
    White,
}

impl Subgroup {
    /// Parse the `binary_race` column value. Rows with any other value are
    /// outside the binary cohort and are skipped by the loader.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Black" => Some(Subgroup::Black),
            "White" => Some(Subgroup::White),
            _ => None,
        }
    }
}

impl fmt::Display for Subgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subgroup::Black => write!(f, "Black"),
            Subgroup::White => write!(f, "White"),
        }
    }
}

/// One labeled example: identifier plus a one-hot label vector over the
/// table's class list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledRow {
    pub id: String,
    pub labels: Vec<u8>,
}

impl LabeledRow {
    pub fn has_label(&self, class_idx: usize) -> bool {
        self.labels.get(class_idx).copied() == Some(1)
    }
}

/// A label table (demo pool or test set) loaded from CSV.
#[derive(Debug, Clone)]
pub struct LabelTable {
    pub classes: Vec<String>,
    pub rows: Vec<LabeledRow>,
}

impl LabelTable {
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().from_path(path)?;
        let headers = rdr.headers()?.clone();
        let classes: Vec<String> = headers
            .iter()
            .skip(1)
            .map(|h| h.trim().to_string())
            .collect();
        if classes.is_empty() {
            return Err(HarnessError::Dataset(format!(
                "{}: no class columns found",
                path.display()
            )));
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let id = record.get(0).unwrap_or("").trim().to_string();
            if id.is_empty() {
                return Err(HarnessError::Dataset(format!(
                    "{}: row {} has an empty identifier",
                    path.display(),
                    rows.len() + 1
                )));
            }
            let mut labels = Vec::with_capacity(classes.len());
            for field in record.iter().skip(1) {
                // Upstream reformatting writes 0/1, but tolerate float renders.
                let positive = field.trim().parse::<f64>().map(|v| v == 1.0).unwrap_or(false);
                labels.push(u8::from(positive));
            }
            if labels.len() != classes.len() {
                return Err(HarnessError::Dataset(format!(
                    "{}: row '{}' has {} label fields, expected {}",
                    path.display(),
                    id,
                    labels.len(),
                    classes.len()
                )));
            }
            rows.push(LabeledRow { id, labels });
        }

        Ok(Self { classes, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ordered identifiers of every row, in table order.
    pub fn ids(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.id.clone()).collect()
    }

    /// Rows positively labeled for the class at `class_idx`, in table order.
    pub fn rows_for_class(&self, class_idx: usize) -> Vec<&LabeledRow> {
        self.rows
            .iter()
            .filter(|r| r.has_label(class_idx))
            .collect()
    }
}

/// Demographics lookup table mapping image paths to subgroup values.
#[derive(Debug, Clone)]
pub struct Demographics {
    entries: Vec<(String, Subgroup)>,
}

impl Demographics {
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().from_path(path)?;
        let headers = rdr.headers()?.clone();
        let path_col = headers
            .iter()
            .position(|h| h.trim() == "updated_path")
            .ok_or_else(|| {
                HarnessError::Dataset(format!("{}: missing 'updated_path' column", path.display()))
            })?;
        let race_col = headers
            .iter()
            .position(|h| h.trim() == "binary_race")
            .ok_or_else(|| {
                HarnessError::Dataset(format!("{}: missing 'binary_race' column", path.display()))
            })?;

        let mut entries = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let image_path = record.get(path_col).unwrap_or("").trim().to_string();
            if image_path.is_empty() {
                continue;
            }
            if let Some(subgroup) = record.get(race_col).and_then(Subgroup::parse) {
                entries.push((image_path, subgroup));
            }
        }

        Ok(Self { entries })
    }

    /// Build a lookup from in-memory entries. Used by tests and callers that
    /// already hold the mapping.
    pub fn from_entries(entries: Vec<(String, Subgroup)>) -> Self {
        Self { entries }
    }

    /// Pool identifiers are tails of the stored `updated_path` values, so the
    /// lookup is a suffix match against the first matching entry.
    pub fn subgroup_of(&self, id: &str) -> Option<Subgroup> {
        self.entries
            .iter()
            .find(|(p, _)| p.ends_with(id))
            .map(|(_, s)| *s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves example identifiers to image files. Demo and test images live in
/// distinct subfolders under one base directory.
#[derive(Debug, Clone)]
pub struct ImageStore {
    pub base_dir: PathBuf,
    pub demo_subdir: String,
    pub test_subdir: String,
    pub file_suffix: String,
}

impl ImageStore {
    pub fn demo_image(&self, id: &str) -> PathBuf {
        self.base_dir
            .join(&self.demo_subdir)
            .join(format!("{}{}", id, self.file_suffix))
    }

    pub fn test_image(&self, id: &str) -> PathBuf {
        self.base_dir
            .join(&self.test_subdir)
            .join(format!("{}{}", id, self.file_suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_label_table_parses_blank_id_header() {
        let f = write_csv(",Pneumonia,No_Finding\nimg1.png,1,0\nimg2.png,0,1\n");
        let table = LabelTable::from_csv(f.path()).unwrap();
        assert_eq!(table.classes, vec!["Pneumonia", "No_Finding"]);
        assert_eq!(table.len(), 2);
        assert!(table.rows[0].has_label(0));
        assert!(!table.rows[0].has_label(1));
    }

    #[test]
    fn test_label_table_tolerates_float_labels() {
        let f = write_csv(",A,B\nimg1.png,1.0,0.0\n");
        let table = LabelTable::from_csv(f.path()).unwrap();
        assert_eq!(table.rows[0].labels, vec![1, 0]);
    }

    #[test]
    fn test_label_table_rejects_empty_id() {
        let f = write_csv(",A\n,1\n");
        assert!(LabelTable::from_csv(f.path()).is_err());
    }

    #[test]
    fn test_rows_for_class_preserves_order() {
        let f = write_csv(",A,B\nx.png,1,0\ny.png,0,1\nz.png,1,0\n");
        let table = LabelTable::from_csv(f.path()).unwrap();
        let rows = table.rows_for_class(0);
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["x.png", "z.png"]);
    }

    #[test]
    fn test_demographics_suffix_match() {
        let f = write_csv(
            "updated_path,binary_race\n/data/chexpert/patient1/img1.png,Black\n/data/chexpert/patient2/img2.png,White\n",
        );
        let demo = Demographics::from_csv(f.path()).unwrap();
        assert_eq!(demo.subgroup_of("img1.png"), Some(Subgroup::Black));
        assert_eq!(demo.subgroup_of("patient2/img2.png"), Some(Subgroup::White));
        assert_eq!(demo.subgroup_of("img3.png"), None);
    }

    #[test]
    fn test_demographics_skips_other_races() {
        let f = write_csv(
            "updated_path,binary_race\n/a/img1.png,Black\n/a/img2.png,Asian\n/a/img3.png,White\n",
        );
        let demo = Demographics::from_csv(f.path()).unwrap();
        assert_eq!(demo.len(), 2);
        assert_eq!(demo.subgroup_of("img2.png"), None);
    }

    #[test]
    fn test_image_store_paths() {
        let store = ImageStore {
            base_dir: PathBuf::from("/data/images"),
            demo_subdir: "demo_df".to_string(),
            test_subdir: "test_df".to_string(),
            file_suffix: ".png".to_string(),
        };
        assert_eq!(
            store.demo_image("img1"),
            PathBuf::from("/data/images/demo_df/img1.png")
        );
        assert_eq!(
            store.test_image("img2"),
            PathBuf::from("/data/images/test_df/img2.png")
        );
    }
}
