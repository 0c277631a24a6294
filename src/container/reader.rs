//! Typed access to an opened container file
//!
//! Every getter resolves a `/`-separated path against the parsed node tree
//! and fails with [`IngestError::MissingField`] when the path is absent, so
//! callers can treat optional modalities as legitimately missing.

use ndarray::{Array2, ArrayD, Axis, Ix2};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::format::{
    read_payload, read_structure, AttrValue, DType, DatasetInfo, DatasetValue, GroupNode, Node,
    Version,
};
use crate::error::IngestError;
use crate::types::TimeSeries;

/// Attribute on a data dataset naming which axis is time (0 or 1)
pub const TIME_AXIS_ATTR: &str = "time_axis";

/// One open container file. The handle is released when the reader drops.
#[derive(Debug)]
pub struct ContainerReader {
    file: BufReader<File>,
    version: Version,
    root: GroupNode,
}

impl ContainerReader {
    /// Open a file and parse its structure. No payload is read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let (version, root) = read_structure(&mut file, file_len)?;

        Ok(Self {
            file,
            version,
            root,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn has(&self, path: &str) -> bool {
        lookup(&self.root, path).is_ok()
    }

    pub fn group(&self, path: &str) -> Result<&GroupNode, IngestError> {
        match lookup(&self.root, path)? {
            Node::Group(group) => Ok(group),
            Node::Dataset(_) => Err(shape_error(path, "expected a group, found a dataset")),
        }
    }

    /// Names of a group's children in stored order
    pub fn child_names(&self, path: &str) -> Result<Vec<String>, IngestError> {
        Ok(self
            .group(path)?
            .children
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    pub fn attribute(&self, path: &str, name: &str) -> Result<&AttrValue, IngestError> {
        lookup(&self.root, path)?
            .attributes()
            .get(name)
            .ok_or_else(|| IngestError::MissingField(format!("{}@{}", path, name)))
    }

    /// Materialize a dataset with its stored dtype
    pub fn read(&mut self, path: &str) -> Result<DatasetValue, IngestError> {
        let info = dataset_at(&self.root, path)?;
        read_payload(&mut self.file, info)
    }

    /// Numeric dataset widened to f64
    pub fn read_f64_array(&mut self, path: &str) -> Result<ArrayD<f64>, IngestError> {
        self.read(path)?
            .to_f64()
            .ok_or_else(|| shape_error(path, "expected numeric data, found strings"))
    }

    /// Numeric vector; accepts 1-D data or a 2-D array with a singleton axis
    pub fn read_f64_vec(&mut self, path: &str) -> Result<Vec<f64>, IngestError> {
        let array = self.read_f64_array(path)?;
        let shape = array.shape().to_vec();
        let is_vector = match shape.as_slice() {
            [] | [_] => true,
            [rows, cols] => *rows == 1 || *cols == 1,
            _ => false,
        };
        if !is_vector {
            return Err(shape_error(path, &format!("expected a vector, found shape {:?}", shape)));
        }
        Ok(array.iter().copied().collect())
    }

    /// Single numeric value (scalar or one-element array)
    pub fn read_f64_scalar(&mut self, path: &str) -> Result<f64, IngestError> {
        let array = self.read_f64_array(path)?;
        match array.len() {
            1 => Ok(array.iter().copied().next().unwrap_or_default()),
            n => Err(shape_error(path, &format!("expected one value, found {}", n))),
        }
    }

    /// Two-dimensional numeric matrix; a vector becomes a single row
    pub fn read_matrix(&mut self, path: &str) -> Result<Array2<f64>, IngestError> {
        let array = self.read_f64_array(path)?;
        match array.ndim() {
            1 => {
                let len = array.len();
                array
                    .into_shape_with_order((1, len))
                    .map_err(|e| shape_error(path, &e.to_string()))
            }
            2 => array
                .into_dimensionality::<Ix2>()
                .map_err(|e| shape_error(path, &e.to_string())),
            n => Err(shape_error(path, &format!("expected a matrix, found rank {}", n))),
        }
    }

    /// Single text value, decoded from utf-8 strings or a byte vector
    pub fn read_string(&mut self, path: &str) -> Result<String, IngestError> {
        let mut strings = self.read_strings(path)?;
        match strings.len() {
            1 => Ok(strings.remove(0)),
            n => Err(shape_error(path, &format!("expected one string, found {}", n))),
        }
    }

    /// Text values in row-major order.
    ///
    /// Byte datasets are decoded as one string per row (a 1-D byte vector is
    /// one string); trailing NUL padding is stripped.
    pub fn read_strings(&mut self, path: &str) -> Result<Vec<String>, IngestError> {
        match self.read(path)? {
            DatasetValue::Utf8(array) => Ok(array.iter().cloned().collect()),
            DatasetValue::U8(bytes) => match bytes.ndim() {
                0 | 1 => Ok(vec![decode_bytes(path, bytes.iter().copied())?]),
                2 => bytes
                    .axis_iter(Axis(0))
                    .map(|row| decode_bytes(path, row.iter().copied()))
                    .collect(),
                n => Err(shape_error(path, &format!("byte strings of rank {}", n))),
            },
            other => Err(shape_error(
                path,
                &format!("expected text, found {}", other.dtype().as_str()),
            )),
        }
    }

    /// Read a timeseries group holding parallel `data` and `timestamps` datasets.
    ///
    /// Values are normalised to channel × time. A 2-D `data` whose first axis
    /// matches the timestamp count is transposed, as is any dataset carrying
    /// `time_axis = 0`. Decreasing timestamps are rejected.
    pub fn read_timeseries(&mut self, group_path: &str) -> Result<TimeSeries, IngestError> {
        let data_path = format!("{}/data", group_path);
        let stamps_path = format!("{}/timestamps", group_path);

        let timestamps = self.read_f64_vec(&stamps_path)?;
        check_monotonic(&stamps_path, &timestamps)?;

        let time_axis = match self.attribute(&data_path, TIME_AXIS_ATTR) {
            Ok(AttrValue::Int(axis)) => Some(*axis),
            _ => None,
        };
        let values = self.read_matrix(&data_path)?;
        let n = timestamps.len();

        let values = match (values.nrows(), values.ncols(), time_axis) {
            (rows, _, Some(0)) if rows == n => values.reversed_axes(),
            (_, cols, None | Some(1)) if cols == n => values,
            (rows, _, None) if rows == n => values.reversed_axes(),
            (rows, cols, _) => {
                return Err(shape_error(
                    &data_path,
                    &format!(
                        "data of shape [{}, {}] does not align with {} timestamps",
                        rows, cols, n
                    ),
                ))
            }
        };

        Ok(TimeSeries {
            timestamps,
            values: values.as_standard_layout().to_owned(),
        })
    }

    /// Flat listing of every dataset as `(path, dtype, shape)`
    pub fn datasets(&self) -> Vec<(String, DType, Vec<usize>)> {
        let mut out = Vec::new();
        collect_datasets(&self.root, "", &mut out);
        out
    }
}

fn collect_datasets(group: &GroupNode, prefix: &str, out: &mut Vec<(String, DType, Vec<usize>)>) {
    for (name, node) in &group.children {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        match node {
            Node::Group(child) => collect_datasets(child, &path, out),
            Node::Dataset(info) => out.push((path, info.dtype, info.shape.clone())),
        }
    }
}

fn lookup<'a>(root: &'a GroupNode, path: &str) -> Result<&'a Node, IngestError> {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let first = parts
        .next()
        .ok_or_else(|| IngestError::MissingField(path.to_string()))?;
    let mut node = root
        .child(first)
        .ok_or_else(|| IngestError::MissingField(path.to_string()))?;

    for part in parts {
        node = match node {
            Node::Group(group) => group
                .child(part)
                .ok_or_else(|| IngestError::MissingField(path.to_string()))?,
            Node::Dataset(_) => return Err(IngestError::MissingField(path.to_string())),
        };
    }
    Ok(node)
}

fn dataset_at<'a>(root: &'a GroupNode, path: &str) -> Result<&'a DatasetInfo, IngestError> {
    match lookup(root, path)? {
        Node::Dataset(info) => Ok(info),
        Node::Group(_) => Err(shape_error(path, "expected a dataset, found a group")),
    }
}

fn decode_bytes(path: &str, bytes: impl Iterator<Item = u8>) -> Result<String, IngestError> {
    let mut bytes: Vec<u8> = bytes.collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes)
        .map_err(|e| IngestError::Container(format!("{}: invalid utf-8 text: {}", path, e)))
}

fn check_monotonic(path: &str, timestamps: &[f64]) -> Result<(), IngestError> {
    match timestamps.windows(2).position(|w| !(w[1] >= w[0])) {
        Some(idx) => Err(IngestError::NonMonotonicTimestamps {
            path: path.to_string(),
            index: idx + 1,
        }),
        None => Ok(()),
    }
}

fn shape_error(path: &str, detail: &str) -> IngestError {
    IngestError::ShapeMismatch {
        path: path.to_string(),
        detail: detail.to_string(),
    }
}
