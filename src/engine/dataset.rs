/// Input datasets and data shapes.
///
/// A dataset is a JSON object mapping column names to arrays of numbers,
/// a shape maps the same names to row counts, e.g. `{"x": 7, "y": 7}`.
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::capabilities::ArgsCapability;

/// Range of the uniform values in dummy datasets.
const DUMMY_RANGE: std::ops::Range<f64> = 0.0..100.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    columns: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataShape {
    columns: BTreeMap<String, usize>,
}

impl Dataset {
    pub fn from_json(text: &str) -> Result<Self> {
        let dataset: Dataset = serde_json::from_str(text).context("invalid dataset JSON")?;
        if dataset.columns.is_empty() {
            bail!("dataset has no columns");
        }
        Ok(dataset)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read dataset {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn shape(&self) -> DataShape {
        DataShape {
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), values.len()))
                .collect(),
        }
    }

    /// The `args` capability over these columns.
    pub fn to_capability(&self) -> ArgsCapability {
        ArgsCapability::new(self.columns.clone())
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<f64>)> for Dataset {
    fn from_iter<I: IntoIterator<Item = (S, Vec<f64>)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(name, values)| (name.into(), values))
                .collect(),
        }
    }
}

impl DataShape {
    pub fn from_json(text: &str) -> Result<Self> {
        let shape: DataShape = serde_json::from_str(text).context("invalid data shape JSON")?;
        if shape.columns.is_empty() {
            bail!("data shape has no columns");
        }
        Ok(shape)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read data shape {}", path.display()))?;
        Self::from_json(&text)
    }
}

/// `name=rows` pairs in column order.
impl fmt::Display for DataShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, rows) in &self.columns {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{name}={rows}")?;
            first = false;
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for DataShape {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(name, rows)| (name.into(), rows)).collect(),
        }
    }
}

/// Random dataset with the given shape, used where only the structure of a
/// computation matters.
pub fn create_dummy(shape: &DataShape, rng: &mut impl Rng) -> Dataset {
    shape
        .columns
        .iter()
        .map(|(name, rows)| {
            let values = (0..*rows).map(|_| rng.gen_range(DUMMY_RANGE)).collect();
            (name.clone(), values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dataset_json() {
        let dataset = Dataset::from_json(r#"{"y": [1, 2.5], "x": [3]}"#).unwrap();
        let expected: Dataset = [("x", vec![3.0]), ("y", vec![1.0, 2.5])].into_iter().collect();
        assert_eq!(dataset, expected);
        assert_eq!(dataset.shape(), DataShape::from_json(r#"{"x": 1, "y": 2}"#).unwrap());
        assert!(Dataset::from_json("{}").is_err());
        assert!(Dataset::from_json(r#"{"x": ["a"]}"#).is_err());
    }

    #[test]
    fn test_dummy_matches_shape() {
        let shape: DataShape = [("x", 7), ("y", 3)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(7);
        let dataset = create_dummy(&shape, &mut rng);

        assert_eq!(dataset.shape(), shape);
        assert!(dataset
            .columns
            .values()
            .flatten()
            .all(|value| DUMMY_RANGE.contains(value)));
    }

    #[test]
    fn test_dummy_is_seeded() {
        let shape: DataShape = [("x", 4)].into_iter().collect();
        let first = create_dummy(&shape, &mut StdRng::seed_from_u64(1));
        let second = create_dummy(&shape, &mut StdRng::seed_from_u64(1));
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shape.json");
        std::fs::write(&path, r#"{"x": 7, "y": 7}"#).unwrap();
        let shape = DataShape::load(&path).unwrap();
        assert_eq!(shape.to_string(), "x=7, y=7");
        assert!(DataShape::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_capability_view() {
        let dataset: Dataset = [("x", vec![1.0, 2.0])].into_iter().collect();
        let args = dataset.to_capability();
        assert!(args.selected_columns().is_empty());
    }
}
