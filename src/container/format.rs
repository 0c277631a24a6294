//! Binary container codec
//!
//! The container is a little-endian node tree:
//!
//! ```text
//! magic u32 | major u16 | minor u16 | root group body
//! node      = tag u8 (1 group, 2 dataset) | name | body
//! group     = attributes | child count u32 | nodes...
//! dataset   = dtype u8 | rank u8 | dims u64 * rank | attributes | payload len u64 | payload
//! attribute = name | tag u8 (1 f64, 2 i64, 3 text) | value
//! name/text = u16 length | utf-8 bytes
//! ```
//!
//! Numeric payloads are stored row-major; string payloads as u32-length-prefixed
//! utf-8 elements. Parsing the structure records payload offsets and skips the
//! payload bytes, so headers can be read without touching sample data.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array1, ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::IngestError;

pub const CONTAINER_MAGIC: u32 = 0x4348_5045;
pub const FORMAT_MAJOR: u16 = 1;
pub const FORMAT_MINOR: u16 = 0;

const TAG_GROUP: u8 = 1;
const TAG_DATASET: u8 = 2;
const ATTR_FLOAT: u8 = 1;
const ATTR_INT: u8 = 2;
const ATTR_TEXT: u8 = 3;
const MAX_DEPTH: usize = 64;
const MAX_RANK: u8 = 8;

/// Container format version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

/// Element type of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F64,
    F32,
    I64,
    I32,
    U8,
    Utf8,
}

impl DType {
    fn code(&self) -> u8 {
        match self {
            DType::F64 => 1,
            DType::F32 => 2,
            DType::I64 => 3,
            DType::I32 => 4,
            DType::U8 => 5,
            DType::Utf8 => 6,
        }
    }

    fn from_code(code: u8) -> Result<Self, IngestError> {
        match code {
            1 => Ok(DType::F64),
            2 => Ok(DType::F32),
            3 => Ok(DType::I64),
            4 => Ok(DType::I32),
            5 => Ok(DType::U8),
            6 => Ok(DType::Utf8),
            other => Err(IngestError::Container(format!("unknown dtype code {}", other))),
        }
    }

    /// Bytes per element, `None` for variable-length strings
    fn element_size(&self) -> Option<u64> {
        match self {
            DType::F64 | DType::I64 => Some(8),
            DType::F32 | DType::I32 => Some(4),
            DType::U8 => Some(1),
            DType::Utf8 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
            DType::Utf8 => "utf8",
        }
    }
}

/// Scalar attribute attached to a group or dataset
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Float(f64),
    Int(i64),
    Text(String),
}

/// Materialized dataset with its native element type
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetValue {
    F64(ArrayD<f64>),
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
    I32(ArrayD<i32>),
    U8(ArrayD<u8>),
    Utf8(ArrayD<String>),
}

impl DatasetValue {
    pub fn dtype(&self) -> DType {
        match self {
            DatasetValue::F64(_) => DType::F64,
            DatasetValue::F32(_) => DType::F32,
            DatasetValue::I64(_) => DType::I64,
            DatasetValue::I32(_) => DType::I32,
            DatasetValue::U8(_) => DType::U8,
            DatasetValue::Utf8(_) => DType::Utf8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            DatasetValue::F64(a) => a.shape(),
            DatasetValue::F32(a) => a.shape(),
            DatasetValue::I64(a) => a.shape(),
            DatasetValue::I32(a) => a.shape(),
            DatasetValue::U8(a) => a.shape(),
            DatasetValue::Utf8(a) => a.shape(),
        }
    }

    /// Widen any numeric dataset to f64; never narrows
    pub fn to_f64(&self) -> Option<ArrayD<f64>> {
        match self {
            DatasetValue::F64(a) => Some(a.clone()),
            DatasetValue::F32(a) => Some(a.mapv(f64::from)),
            DatasetValue::I64(a) => Some(a.mapv(|v| v as f64)),
            DatasetValue::I32(a) => Some(a.mapv(f64::from)),
            DatasetValue::U8(a) => Some(a.mapv(f64::from)),
            DatasetValue::Utf8(_) => None,
        }
    }

    /// Convenience constructor for a 1-D f64 dataset
    pub fn f64_vec(values: Vec<f64>) -> Self {
        DatasetValue::F64(Array1::from_vec(values).into_dyn())
    }

    /// Convenience constructor for a 1-D string dataset
    pub fn text_vec<S: Into<String>>(values: Vec<S>) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        DatasetValue::Utf8(Array1::from_vec(values).into_dyn())
    }

    /// Convenience constructor for a scalar string dataset
    pub fn text(value: impl Into<String>) -> Self {
        DatasetValue::Utf8(ArrayD::from_elem(IxDyn(&[]), value.into()))
    }

    /// Convenience constructor for a scalar f64 dataset
    pub fn scalar(value: f64) -> Self {
        DatasetValue::F64(ArrayD::from_elem(IxDyn(&[]), value))
    }
}

/// Dataset header: type, shape, attributes, and payload location
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub attributes: BTreeMap<String, AttrValue>,
    offset: u64,
    byte_len: u64,
}

impl DatasetInfo {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Group header with ordered children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupNode {
    pub attributes: BTreeMap<String, AttrValue>,
    pub children: Vec<(String, Node)>,
}

impl GroupNode {
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, node)| node)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Group(GroupNode),
    Dataset(DatasetInfo),
}

impl Node {
    pub fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        match self {
            Node::Group(group) => &group.attributes,
            Node::Dataset(info) => &info.attributes,
        }
    }
}

/// Parse the container header and node tree, skipping payload bytes.
///
/// `file_len` bounds every payload so a truncated file is rejected here
/// rather than on first read.
pub fn read_structure<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
) -> Result<(Version, GroupNode), IngestError> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != CONTAINER_MAGIC {
        return Err(IngestError::Container(format!(
            "unrecognized magic number {:#010x}",
            magic
        )));
    }

    let version = Version {
        major: reader.read_u16::<LittleEndian>()?,
        minor: reader.read_u16::<LittleEndian>()?,
    };
    if version.major != FORMAT_MAJOR {
        return Err(IngestError::Container(format!(
            "unsupported format version {}.{}",
            version.major, version.minor
        )));
    }

    let root = read_group_body(reader, file_len, 0)?;
    Ok((version, root))
}

fn read_node<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
    depth: usize,
) -> Result<(String, Node), IngestError> {
    let tag = reader.read_u8()?;
    let name = read_name(reader)?;
    let node = match tag {
        TAG_GROUP => Node::Group(read_group_body(reader, file_len, depth + 1)?),
        TAG_DATASET => Node::Dataset(read_dataset_header(reader, file_len)?),
        other => {
            return Err(IngestError::Container(format!(
                "unknown node tag {} for '{}'",
                other, name
            )))
        }
    };
    Ok((name, node))
}

fn read_group_body<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
    depth: usize,
) -> Result<GroupNode, IngestError> {
    if depth > MAX_DEPTH {
        return Err(IngestError::Container("group nesting too deep".to_string()));
    }

    let attributes = read_attributes(reader)?;
    let child_count = reader.read_u32::<LittleEndian>()?;
    let mut children = Vec::new();
    for _ in 0..child_count {
        children.push(read_node(reader, file_len, depth)?);
    }

    Ok(GroupNode {
        attributes,
        children,
    })
}

fn read_dataset_header<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
) -> Result<DatasetInfo, IngestError> {
    let dtype = DType::from_code(reader.read_u8()?)?;
    let rank = reader.read_u8()?;
    if rank > MAX_RANK {
        return Err(IngestError::Container(format!("dataset rank {} too large", rank)));
    }

    let mut shape = Vec::with_capacity(rank as usize);
    for _ in 0..rank {
        let dim = reader.read_u64::<LittleEndian>()?;
        shape.push(usize::try_from(dim).map_err(|_| {
            IngestError::Container(format!("dimension {} exceeds address space", dim))
        })?);
    }

    let attributes = read_attributes(reader)?;
    let byte_len = reader.read_u64::<LittleEndian>()?;
    let offset = reader.stream_position()?;

    let end = offset
        .checked_add(byte_len)
        .ok_or_else(|| IngestError::Container("payload length overflow".to_string()))?;
    if end > file_len {
        return Err(IngestError::Container(format!(
            "payload at {} of {} bytes runs past end of file ({} bytes)",
            offset, byte_len, file_len
        )));
    }

    let count = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| IngestError::Container("element count overflow".to_string()))?;
    // Strings need at least their u32 length prefix per element
    let (size, exact) = match dtype.element_size() {
        Some(size) => (size, true),
        None => (4, false),
    };
    let needed = (count as u64).checked_mul(size);
    let fits = match needed {
        Some(needed) if exact => needed == byte_len,
        Some(needed) => needed <= byte_len,
        None => false,
    };
    if !fits {
        return Err(IngestError::Container(format!(
            "payload of {} bytes does not match {} {} elements",
            byte_len,
            count,
            dtype.as_str()
        )));
    }

    reader.seek(SeekFrom::Start(end))?;

    Ok(DatasetInfo {
        dtype,
        shape,
        attributes,
        offset,
        byte_len,
    })
}

fn read_attributes<R: Read>(reader: &mut R) -> Result<BTreeMap<String, AttrValue>, IngestError> {
    let count = reader.read_u16::<LittleEndian>()?;
    let mut attributes = BTreeMap::new();
    for _ in 0..count {
        let name = read_name(reader)?;
        let value = match reader.read_u8()? {
            ATTR_FLOAT => AttrValue::Float(reader.read_f64::<LittleEndian>()?),
            ATTR_INT => AttrValue::Int(reader.read_i64::<LittleEndian>()?),
            ATTR_TEXT => AttrValue::Text(read_name(reader)?),
            other => {
                return Err(IngestError::Container(format!(
                    "unknown attribute tag {} for '{}'",
                    other, name
                )))
            }
        };
        attributes.insert(name, value);
    }
    Ok(attributes)
}

fn read_name<R: Read>(reader: &mut R) -> Result<String, IngestError> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| IngestError::Container(format!("invalid utf-8 name: {}", e)))
}

/// Materialize a dataset's payload with its native element type
pub fn read_payload<R: Read + Seek>(
    reader: &mut R,
    info: &DatasetInfo,
) -> Result<DatasetValue, IngestError> {
    reader.seek(SeekFrom::Start(info.offset))?;
    let count = info.len();
    let shape = IxDyn(&info.shape);

    let value = match info.dtype {
        DType::F64 => {
            let mut data = vec![0f64; count];
            reader.read_f64_into::<LittleEndian>(&mut data)?;
            DatasetValue::F64(into_array(shape, data)?)
        }
        DType::F32 => {
            let mut data = vec![0f32; count];
            reader.read_f32_into::<LittleEndian>(&mut data)?;
            DatasetValue::F32(into_array(shape, data)?)
        }
        DType::I64 => {
            let mut data = vec![0i64; count];
            reader.read_i64_into::<LittleEndian>(&mut data)?;
            DatasetValue::I64(into_array(shape, data)?)
        }
        DType::I32 => {
            let mut data = vec![0i32; count];
            reader.read_i32_into::<LittleEndian>(&mut data)?;
            DatasetValue::I32(into_array(shape, data)?)
        }
        DType::U8 => {
            let mut data = vec![0u8; count];
            reader.read_exact(&mut data)?;
            DatasetValue::U8(into_array(shape, data)?)
        }
        DType::Utf8 => {
            let mut data = Vec::with_capacity(count.min((info.byte_len / 4) as usize));
            let mut consumed = 0u64;
            for _ in 0..count {
                let len = reader.read_u32::<LittleEndian>()? as u64;
                consumed += 4 + len;
                if consumed > info.byte_len {
                    return Err(IngestError::Container(
                        "string element runs past its payload".to_string(),
                    ));
                }
                let mut bytes = vec![0u8; len as usize];
                reader.read_exact(&mut bytes)?;
                data.push(String::from_utf8(bytes).map_err(|e| {
                    IngestError::Container(format!("invalid utf-8 string: {}", e))
                })?);
            }
            DatasetValue::Utf8(into_array(shape, data)?)
        }
    };

    Ok(value)
}

fn into_array<T>(shape: IxDyn, data: Vec<T>) -> Result<ArrayD<T>, IngestError> {
    ArrayD::from_shape_vec(shape, data)
        .map_err(|e| IngestError::Container(format!("payload shape: {}", e)))
}

/// In-memory node used while building a container
#[derive(Debug, Clone)]
enum BuildNode {
    Group {
        attributes: Vec<(String, AttrValue)>,
        children: Vec<(String, BuildNode)>,
    },
    Dataset {
        value: DatasetValue,
        attributes: Vec<(String, AttrValue)>,
    },
}

impl BuildNode {
    fn empty_group() -> Self {
        BuildNode::Group {
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Writer for container files.
///
/// Paths are `/`-separated; intermediate groups are created on demand and
/// children keep insertion order.
///
/// # Example
/// ```
/// use ephys_ingest::container::{ContainerBuilder, DatasetValue};
///
/// let mut builder = ContainerBuilder::new();
/// builder
///     .dataset("general/subject/subject_id", DatasetValue::text("ANM244028"))
///     .dataset("session_start_time", DatasetValue::text("2017-05-12 10:30:00"));
/// let mut bytes = Vec::new();
/// builder.write_to(&mut bytes).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    root: BuildNode,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            root: BuildNode::empty_group(),
        }
    }

    /// Ensure a group exists at `path`
    pub fn group(&mut self, path: &str) -> &mut Self {
        let _ = self.group_mut(path);
        self
    }

    /// Place a dataset at `path`, replacing any node already there
    pub fn dataset(&mut self, path: &str, value: DatasetValue) -> &mut Self {
        let (parent, name) = split_parent(path);
        if let Some(BuildNode::Group { children, .. }) = self.group_mut(parent) {
            let node = BuildNode::Dataset {
                value,
                attributes: Vec::new(),
            };
            match children.iter_mut().find(|(child, _)| child == name) {
                Some(slot) => slot.1 = node,
                None => children.push((name.to_string(), node)),
            }
        }
        self
    }

    /// Attach an attribute to the group or dataset at `path` (empty for the root)
    pub fn attribute(&mut self, path: &str, name: &str, value: AttrValue) -> &mut Self {
        let target = if path.is_empty() {
            Some(&mut self.root)
        } else {
            find_node_mut(&mut self.root, path)
        };
        if let Some(
            BuildNode::Group { attributes, .. } | BuildNode::Dataset { attributes, .. },
        ) = target
        {
            attributes.retain(|(existing, _)| existing != name);
            attributes.push((name.to_string(), value));
        }
        self
    }

    fn group_mut(&mut self, path: &str) -> Option<&mut BuildNode> {
        let mut current = &mut self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let BuildNode::Group { children, .. } = current else {
                return None;
            };
            let idx = match children.iter().position(|(child, _)| child == part) {
                Some(idx) => idx,
                None => {
                    children.push((part.to_string(), BuildNode::empty_group()));
                    children.len() - 1
                }
            };
            current = &mut children[idx].1;
        }
        match current {
            BuildNode::Group { .. } => Some(current),
            BuildNode::Dataset { .. } => None,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), IngestError> {
        writer.write_u32::<LittleEndian>(CONTAINER_MAGIC)?;
        writer.write_u16::<LittleEndian>(FORMAT_MAJOR)?;
        writer.write_u16::<LittleEndian>(FORMAT_MINOR)?;
        write_body(writer, &self.root)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), IngestError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

fn find_node_mut<'a>(root: &'a mut BuildNode, path: &str) -> Option<&'a mut BuildNode> {
    let mut current = root;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        let BuildNode::Group { children, .. } = current else {
            return None;
        };
        current = children
            .iter_mut()
            .find(|(child, _)| child == part)
            .map(|(_, node)| node)?;
    }
    Some(current)
}

fn write_body<W: Write>(writer: &mut W, node: &BuildNode) -> Result<(), IngestError> {
    match node {
        BuildNode::Group {
            attributes,
            children,
        } => {
            write_attributes(writer, attributes)?;
            writer.write_u32::<LittleEndian>(children.len() as u32)?;
            for (name, child) in children {
                let tag = match child {
                    BuildNode::Group { .. } => TAG_GROUP,
                    BuildNode::Dataset { .. } => TAG_DATASET,
                };
                writer.write_u8(tag)?;
                write_name(writer, name)?;
                write_body(writer, child)?;
            }
        }
        BuildNode::Dataset { value, attributes } => {
            writer.write_u8(value.dtype().code())?;
            writer.write_u8(value.shape().len() as u8)?;
            for &dim in value.shape() {
                writer.write_u64::<LittleEndian>(dim as u64)?;
            }
            write_attributes(writer, attributes)?;
            let payload = encode_payload(value)?;
            writer.write_u64::<LittleEndian>(payload.len() as u64)?;
            writer.write_all(&payload)?;
        }
    }
    Ok(())
}

fn encode_payload(value: &DatasetValue) -> Result<Vec<u8>, IngestError> {
    let mut buf = Vec::new();
    match value {
        DatasetValue::F64(a) => {
            for &v in a.iter() {
                buf.write_f64::<LittleEndian>(v)?;
            }
        }
        DatasetValue::F32(a) => {
            for &v in a.iter() {
                buf.write_f32::<LittleEndian>(v)?;
            }
        }
        DatasetValue::I64(a) => {
            for &v in a.iter() {
                buf.write_i64::<LittleEndian>(v)?;
            }
        }
        DatasetValue::I32(a) => {
            for &v in a.iter() {
                buf.write_i32::<LittleEndian>(v)?;
            }
        }
        DatasetValue::U8(a) => buf.extend(a.iter().copied()),
        DatasetValue::Utf8(a) => {
            for s in a.iter() {
                buf.write_u32::<LittleEndian>(s.len() as u32)?;
                buf.write_all(s.as_bytes())?;
            }
        }
    }
    Ok(buf)
}

fn write_attributes<W: Write>(
    writer: &mut W,
    attributes: &[(String, AttrValue)],
) -> Result<(), IngestError> {
    writer.write_u16::<LittleEndian>(attributes.len() as u16)?;
    for (name, value) in attributes {
        write_name(writer, name)?;
        match value {
            AttrValue::Float(v) => {
                writer.write_u8(ATTR_FLOAT)?;
                writer.write_f64::<LittleEndian>(*v)?;
            }
            AttrValue::Int(v) => {
                writer.write_u8(ATTR_INT)?;
                writer.write_i64::<LittleEndian>(*v)?;
            }
            AttrValue::Text(v) => {
                writer.write_u8(ATTR_TEXT)?;
                write_name(writer, v)?;
            }
        }
    }
    Ok(())
}

fn write_name<W: Write>(writer: &mut W, name: &str) -> Result<(), IngestError> {
    let len = u16::try_from(name.len())
        .map_err(|_| IngestError::Container(format!("name too long: {} bytes", name.len())))?;
    writer.write_u16::<LittleEndian>(len)?;
    writer.write_all(name.as_bytes())?;
    Ok(())
}
