#![doc = include_str!("../README.md")]

pub use crate::builder::MetaBuilder;
pub use crate::context::{ByteSource, Context, SliceSource, SourceMap};
pub use crate::error::{Error, SourceError};
pub use crate::meta::Meta;
pub use crate::types::{ByteOrder, DisplayBase, DynScope, Encoding, TypeId};
pub use crate::vars::Var;

pub mod ast;
pub mod builder;
pub mod context;
pub mod error;
pub mod meta;
mod scope;
mod tag;
mod types;
mod vars;
