//! Host-side arrays and dict-shaped batches.

use crate::device::Device;
use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dense row-major array. The first dimension is the sample dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Array {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TrainError::data(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Build a `[rows, cols]` array from equally sized rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(TrainError::data("rows have different lengths"));
        }
        Ok(Self {
            shape: vec![rows.len(), cols],
            data: rows.concat(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of samples (size of the first dimension).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of values per sample.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        let width = self.row_len();
        &self.data[index * width..(index + 1) * width]
    }

    /// View the array as `[rows, rest]`.
    pub fn flatten_rows(&self) -> Self {
        Self {
            shape: vec![self.rows(), self.row_len()],
            data: self.data.clone(),
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self> {
        Self::new(shape, self.data.clone())
    }

    /// Copy of rows `[start, end)`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let width = self.row_len();
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = end - start;
        }
        Self {
            shape,
            data: self.data[start * width..end * width].to_vec(),
        }
    }

    /// Concatenate along the sample dimension.
    pub fn concat_rows(parts: &[&Array]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(TrainError::data("cannot concatenate zero arrays"));
        };
        let tail = &first.shape[1.min(first.shape.len())..];
        let mut rows = 0;
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            if &part.shape[1.min(part.shape.len())..] != tail {
                return Err(TrainError::ShapeMismatch {
                    expected: first.shape.clone(),
                    actual: part.shape.clone(),
                });
            }
            rows += part.rows();
            data.extend_from_slice(&part.data);
        }
        let mut shape = vec![rows];
        shape.extend_from_slice(tail);
        Ok(Self { shape, data })
    }
}

/// A dict-shaped batch. Every entry shares the sample dimension.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Batch {
    entries: BTreeMap<String, Array>,
    #[serde(default)]
    device: Device,
}

pub const DATA_KEY: &str = "data";
pub const LABEL_KEY: &str = "label";

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch with the two conventional entries.
    pub fn from_parts(data: Array, label: Array) -> Self {
        Self::new().with(DATA_KEY, data).with(LABEL_KEY, label)
    }

    pub fn with(mut self, key: impl Into<String>, value: Array) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Array) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Array> {
        self.entries.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&Array> {
        self.entries
            .get(key)
            .ok_or_else(|| TrainError::data(format!("batch has no '{key}' entry")))
    }

    pub fn data(&self) -> Result<&Array> {
        self.require(DATA_KEY)
    }

    pub fn label(&self) -> Result<&Array> {
        self.require(LABEL_KEY)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Number of samples, taken from the `data` entry (or any entry if absent).
    pub fn num_samples(&self) -> usize {
        self.entries
            .get(DATA_KEY)
            .or_else(|| self.entries.values().next())
            .map_or(0, Array::rows)
    }

    /// Stack batches along the sample dimension. All batches must carry the same keys.
    pub fn stack(batches: &[Batch]) -> Result<Self> {
        let Some(first) = batches.first() else {
            return Err(TrainError::data("cannot stack zero batches"));
        };
        let mut entries = BTreeMap::new();
        for key in first.entries.keys() {
            let parts = batches
                .iter()
                .map(|b| b.require(key))
                .collect::<Result<Vec<_>>>()?;
            entries.insert(key.clone(), Array::concat_rows(&parts)?);
        }
        Ok(Self {
            entries,
            device: first.device,
        })
    }

    /// Split into at most `parts` contiguous chunks of near-equal size.
    pub fn split(&self, parts: usize) -> Vec<Batch> {
        let total = self.num_samples();
        let parts = parts.clamp(1, total.max(1));
        let base = total / parts;
        let extra = total % parts;
        let mut start = 0;
        let mut chunks = Vec::with_capacity(parts);
        for i in 0..parts {
            let len = base + usize::from(i < extra);
            if len == 0 {
                continue;
            }
            let entries = self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.slice_rows(start, start + len)))
                .collect();
            chunks.push(Batch {
                entries,
                device: self.device,
            });
            start += len;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64) -> Batch {
        Batch::from_parts(
            Array::new(vec![1, 2], vec![value, value + 1.0]).unwrap(),
            Array::new(vec![1, 1], vec![value * 10.0]).unwrap(),
        )
    }

    #[test]
    fn test_array_shape_checked() {
        assert!(Array::new(vec![2, 3], vec![0.0; 5]).is_err());
        let a = Array::new(vec![2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(a.rows(), 2);
        assert_eq!(a.row_len(), 3);
    }

    #[test]
    fn test_stack_samples_into_batch() {
        let stacked = Batch::stack(&[sample(1.0), sample(2.0), sample(3.0)]).unwrap();
        assert_eq!(stacked.num_samples(), 3);
        assert_eq!(stacked.data().unwrap().shape(), &[3, 2]);
        assert_eq!(stacked.label().unwrap().data(), &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_stack_rejects_mismatched_shapes() {
        let odd = Batch::from_parts(
            Array::new(vec![1, 3], vec![0.0; 3]).unwrap(),
            Array::new(vec![1, 1], vec![0.0]).unwrap(),
        );
        assert!(Batch::stack(&[sample(1.0), odd]).is_err());
    }

    #[test]
    fn test_split_uneven() {
        let batch = Batch::stack(&[sample(1.0), sample(2.0), sample(3.0), sample(4.0), sample(5.0)])
            .unwrap();
        let parts = batch.split(2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].num_samples(), 3);
        assert_eq!(parts[1].num_samples(), 2);
        assert_eq!(parts[1].label().unwrap().data(), &[40.0, 50.0]);
    }

    #[test]
    fn test_split_more_parts_than_samples() {
        let batch = Batch::stack(&[sample(1.0), sample(2.0)]).unwrap();
        assert_eq!(batch.split(4).len(), 2);
    }

    #[test]
    fn test_missing_label_is_data_error() {
        let batch = Batch::new().with(DATA_KEY, Array::zeros(vec![1, 1]));
        assert!(matches!(batch.label(), Err(TrainError::Data(_))));
    }
}
