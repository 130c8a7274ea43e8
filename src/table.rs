// src/table.rs

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Result, SurveyStatsError};

/// Values of a single column. `None` marks a missing cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            ColumnData::Numeric(_) => "numeric",
            ColumnData::Categorical(_) => "categorical",
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    /// Numeric column without missing values.
    pub fn numeric<I>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values.into_iter().map(Some).collect()),
        }
    }

    /// Numeric column where `None` is a missing value.
    pub fn numeric_with_missing<I>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values.into_iter().collect()),
        }
    }

    pub fn categorical<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            data: ColumnData::Categorical(values.into_iter().map(|s| Some(s.into())).collect()),
        }
    }
}

/// Complete-case view of the numeric columns of a table.
#[derive(Debug, Clone)]
pub struct CompleteCases {
    /// Shape: (n_complete_rows, n_columns)
    pub matrix: Array2<f64>,
    /// Row indices of the source table that were kept.
    pub rows: Vec<usize>,
    pub names: Vec<String>,
}

/// An ordered collection of equally long, uniquely named columns.
///
/// Tables are never modified in place; `with_column` hands back a new table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    columns: Vec<Column>,
    n_rows: usize,
}

impl DataTable {
    /// Builds a table, rejecting ragged column lengths and duplicate names.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let n_rows = columns.first().map_or(0, |c| c.data.len());
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if column.data.len() != n_rows {
                return Err(SurveyStatsError::input(
                    column.name.clone(),
                    format!(
                        "a column of length {} (found {})",
                        n_rows,
                        column.data.len()
                    ),
                ));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SurveyStatsError::input(
                    column.name.clone(),
                    "a unique column name",
                ));
            }
        }
        Ok(Self { columns, n_rows })
    }

    /// Wraps a dense matrix (rows = observations) as a numeric table.
    pub fn from_matrix(names: &[&str], matrix: &Array2<f64>) -> Result<Self> {
        if names.len() != matrix.ncols() {
            return Err(SurveyStatsError::input(
                "names",
                format!("{} column names (found {})", matrix.ncols(), names.len()),
            ));
        }
        let columns = names
            .iter()
            .zip(matrix.columns())
            .map(|(name, col)| Column::numeric(*name, col.iter().copied()))
            .collect();
        Self::new(columns)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                SurveyStatsError::input(name, "the name of a column present in the table")
            })
    }

    pub fn numeric_column(&self, name: &str) -> Result<&[Option<f64>]> {
        match &self.column(name)?.data {
            ColumnData::Numeric(values) => Ok(values),
            other => Err(SurveyStatsError::type_mismatch(
                name,
                "a numeric column",
                format!("a {} column", other.kind_name()),
            )),
        }
    }

    /// Returns a copy of the table with `name` set to `data`. An existing
    /// column of the same name is replaced in place, otherwise it is appended.
    pub fn with_column(&self, name: &str, data: ColumnData) -> Result<Self> {
        if data.len() != self.n_rows && !self.columns.is_empty() {
            return Err(SurveyStatsError::input(
                name,
                format!("a column of length {} (found {})", self.n_rows, data.len()),
            ));
        }
        let mut columns = self.columns.clone();
        let column = Column {
            name: name.to_string(),
            data,
        };
        match columns.iter_mut().find(|c| c.name == name) {
            Some(slot) => *slot = column,
            None => columns.push(column),
        }
        Self::new(columns)
    }

    /// Collects every column into a dense matrix, dropping rows that have a
    /// missing value in any column.
    pub fn complete_numeric_matrix(&self) -> Result<CompleteCases> {
        let mut numeric = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            match &column.data {
                ColumnData::Numeric(values) => numeric.push(values),
                other => {
                    return Err(SurveyStatsError::type_mismatch(
                        "x",
                        "a table of numeric columns",
                        format!("{} column `{}`", other.kind_name(), column.name),
                    ))
                }
            }
        }

        let rows: Vec<usize> = (0..self.n_rows)
            .filter(|&i| numeric.iter().all(|col| col[i].map_or(false, f64::is_finite)))
            .collect();

        let mut matrix = Array2::<f64>::zeros((rows.len(), numeric.len()));
        for (r, &i) in rows.iter().enumerate() {
            for (c, col) in numeric.iter().enumerate() {
                // rows only holds indices where every cell is present
                matrix[[r, c]] = col[i].unwrap_or(f64::NAN);
            }
        }

        Ok(CompleteCases {
            matrix,
            rows,
            names: self.column_names(),
        })
    }
}
