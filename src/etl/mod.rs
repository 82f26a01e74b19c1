//! # ETL Domain
//!
//! Configuration records, their runtime wrappers, the sources they are read
//! from and the processor contracts the pipeline executes against.

pub mod builtin;
pub mod configuration;
pub mod processors;
pub mod source;
pub mod wrapper;

pub use builtin::{LogLoad, ScaleTransform, StaticExtract};
pub use configuration::{Configuration, ExtractSpec, LoadSpec, StageSpec, TransformSpec};
pub use processors::{
    group_by_kind, with_reauth, ExtractProcessor, LoadProcessor, ProcessorRegistry, RemoteClient,
    Row, Transform, Transmutation,
};
pub use source::{ConfigurationSource, DirectorySource, StaticSource};
pub use wrapper::ConfigurationWrapper;
