#![doc = include_str!("../README.md")]

pub mod error;
pub mod event;
pub mod handler;
pub mod processor;
pub mod segment;
pub mod source;
pub mod status;
pub mod store;
pub mod token;
pub mod transaction;

pub use error::*;
pub use event::*;
pub use handler::*;
pub use processor::*;
pub use segment::*;
pub use source::*;
pub use status::*;
pub use store::*;
pub use token::*;
pub use transaction::*;
