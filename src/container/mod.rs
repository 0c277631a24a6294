//! Hierarchical binary container files
//!
//! `format` holds the on-disk codec and the [`ContainerBuilder`] writer;
//! `reader` layers typed, path-addressed getters on top of it.

pub mod format;
pub mod reader;

pub use format::{
    AttrValue, ContainerBuilder, DType, DatasetInfo, DatasetValue, GroupNode, Node, Version,
};
pub use reader::ContainerReader;
