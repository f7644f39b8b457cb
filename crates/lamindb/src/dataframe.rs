//! In-memory tabular and annotated-matrix data objects.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::schema::FeatureType;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Int64(Vec<i64>),
    Int32(Vec<i32>),
    Float64(Vec<f64>),
    Float32(Vec<f32>),
    Bool(Vec<bool>),
    Object(Vec<String>),
    Categorical(Vec<String>),
}

impl ColumnData {
    pub fn dtype(&self) -> &'static str {
        match self {
            ColumnData::Int64(_) => "int64",
            ColumnData::Int32(_) => "int32",
            ColumnData::Float64(_) => "float64",
            ColumnData::Float32(_) => "float32",
            ColumnData::Bool(_) => "bool",
            ColumnData::Object(_) => "object",
            ColumnData::Categorical(_) => "category",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Object(v) | ColumnData::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn strings(&self) -> Option<&[String]> {
        match self {
            ColumnData::Object(v) | ColumnData::Categorical(v) => Some(v),
            _ => None,
        }
    }

    /// Append `other`, which must have the same dtype.
    fn extend(&mut self, other: &ColumnData) -> Result<()> {
        match (self, other) {
            (ColumnData::Int64(a), ColumnData::Int64(b)) => a.extend_from_slice(b),
            (ColumnData::Int32(a), ColumnData::Int32(b)) => a.extend_from_slice(b),
            (ColumnData::Float64(a), ColumnData::Float64(b)) => a.extend_from_slice(b),
            (ColumnData::Float32(a), ColumnData::Float32(b)) => a.extend_from_slice(b),
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.extend_from_slice(b),
            (ColumnData::Object(a), ColumnData::Object(b)) => a.extend_from_slice(b),
            (ColumnData::Categorical(a), ColumnData::Categorical(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(Error::Value(format!(
                    "cannot concatenate {} column with {} column",
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    columns: Vec<(String, ColumnData)>,
}

impl DataFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: &str, data: ColumnData) -> Self {
        self.columns.push((name.to_string(), data));
        self
    }

    pub fn columns(&self) -> &[(String, ColumnData)] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Frame with only the named columns, in the order given.
    pub fn select<T: AsRef<str>>(&self, names: &[T]) -> Result<DataFrame> {
        let mut out = DataFrame::new();
        for name in names {
            let name = name.as_ref();
            let col = self
                .column(name)
                .ok_or_else(|| Error::NotFound(format!("column {name}")))?;
            out.columns.push((name.to_string(), col.clone()));
        }
        Ok(out)
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(|(_, c)| c.len()).unwrap_or(0)
    }

    pub fn dtypes(&self) -> Vec<&'static str> {
        self.columns.iter().map(|(_, c)| c.dtype()).collect()
    }

    /// Row-wise concatenation; all frames need identical column names and dtypes.
    pub fn concat(frames: &[DataFrame]) -> Result<DataFrame> {
        let Some((first, rest)) = frames.split_first() else {
            return Err(Error::Value("nothing to concatenate".into()));
        };
        let mut out = first.clone();
        for frame in rest {
            if frame.column_names() != out.column_names() {
                return Err(Error::Value("cannot concatenate frames with different columns".into()));
            }
            for ((_, acc), (_, col)) in out.columns.iter_mut().zip(&frame.columns) {
                acc.extend(col)?;
            }
        }
        Ok(out)
    }
}

/// Annotated matrix: observations by variables, with per-observation metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnDataLike {
    pub var_names: Vec<String>,
    pub obs: DataFrame,
    pub x: Vec<Vec<f32>>,
}

impl AnnDataLike {
    /// Stack observations; all objects need the same variables.
    pub fn concat(objects: &[AnnDataLike]) -> Result<AnnDataLike> {
        let Some((first, rest)) = objects.split_first() else {
            return Err(Error::Value("nothing to concatenate".into()));
        };
        let mut out = first.clone();
        let mut obs = vec![first.obs.clone()];
        for adata in rest {
            if adata.var_names != out.var_names {
                return Err(Error::Value("cannot concatenate objects with different variables".into()));
            }
            out.x.extend(adata.x.iter().cloned());
            obs.push(adata.obs.clone());
        }
        out.obs = DataFrame::concat(&obs)?;
        Ok(out)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DataObject {
    DataFrame(DataFrame),
    AnnData(AnnDataLike),
}

impl DataObject {
    pub fn suffix(&self) -> &'static str {
        match self {
            DataObject::DataFrame(_) => ".parquet",
            DataObject::AnnData(_) => ".h5ad",
        }
    }
}

impl From<DataFrame> for DataObject {
    fn from(df: DataFrame) -> Self {
        DataObject::DataFrame(df)
    }
}

impl From<AnnDataLike> for DataObject {
    fn from(adata: AnnDataLike) -> Self {
        DataObject::AnnData(adata)
    }
}

/// Map a dtype name to a feature type: width digits are stripped,
/// `int`/`float` become number, `object`/`str`/`category` become category.
pub fn convert_dtype_to_feature_type(dtype: &str) -> Result<FeatureType> {
    let stripped: String = dtype.chars().filter(|c| !c.is_ascii_digit()).collect();
    stripped.parse()
}

/// Columns that are categorical: explicit categoricals, plus string columns
/// with fewer distinct values than rows.
pub fn categoricals_from_df(df: &DataFrame) -> Vec<String> {
    df.columns
        .iter()
        .filter(|(_, col)| match col {
            ColumnData::Categorical(_) => true,
            other => other
                .strings()
                .map(|values| values.iter().collect::<BTreeSet<_>>().len() < values.len())
                .unwrap_or(false),
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Feature type of every column, in column order.
pub fn infer_feature_types(df: &DataFrame) -> Result<Vec<(String, FeatureType)>> {
    let categoricals = categoricals_from_df(df);
    df.columns
        .iter()
        .map(|(name, col)| {
            let kind = if categoricals.contains(name) {
                FeatureType::Category
            } else {
                convert_dtype_to_feature_type(col.dtype())?
            };
            Ok((name.clone(), kind))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_convert_dtype() {
        assert_eq!(convert_dtype_to_feature_type("int64").unwrap(), FeatureType::Number);
        assert_eq!(convert_dtype_to_feature_type("float32").unwrap(), FeatureType::Number);
        assert_eq!(convert_dtype_to_feature_type("object").unwrap(), FeatureType::Category);
        assert_eq!(convert_dtype_to_feature_type("category").unwrap(), FeatureType::Category);
        assert_eq!(convert_dtype_to_feature_type("bool").unwrap(), FeatureType::Bool);
        assert!(convert_dtype_to_feature_type("datetime64").is_err());
    }

    #[test]
    fn test_repeated_strings_are_categorical() {
        let df = DataFrame::new()
            .with_column("cat", ColumnData::Object(strs(&["a", "b", "a", "b"])))
            .with_column("ids", ColumnData::Object(strs(&["a", "b", "c", "d"])))
            .with_column("num", ColumnData::Float64(vec![0.1, 0.2, 0.3, 0.4]));
        assert_eq!(categoricals_from_df(&df), vec!["cat".to_string()]);

        let types = infer_feature_types(&df).unwrap();
        assert_eq!(types[0].1, FeatureType::Category);
        assert_eq!(types[1].1, FeatureType::Category);
        assert_eq!(types[2].1, FeatureType::Number);
    }

    #[test]
    fn test_concat() {
        let a = DataFrame::new().with_column("x", ColumnData::Int64(vec![1, 2]));
        let b = DataFrame::new().with_column("x", ColumnData::Int64(vec![3]));
        let both = DataFrame::concat(&[a.clone(), b]).unwrap();
        assert_eq!(both.n_rows(), 3);

        let other = DataFrame::new().with_column("y", ColumnData::Int64(vec![3]));
        assert!(DataFrame::concat(&[a.clone(), other]).is_err());
        let wrong_type = DataFrame::new().with_column("x", ColumnData::Bool(vec![true]));
        assert!(DataFrame::concat(&[a, wrong_type]).is_err());
    }
}
