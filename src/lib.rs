//! Typed, lossless view of libvirt domain XML.
//!
//! Domain XML is decoded into a [`definition::VmDefinition`]; every field the
//! model does not understand is kept as raw passthrough content, so encoding
//! an edited definition never destroys configuration the model has no
//! opinion on.

pub mod address;
pub mod definition;
pub mod device;
pub mod disk;
pub mod errors;
pub mod graphics;
pub mod input;
pub mod interface;
pub mod tree;
pub mod virsh;

pub use address::Address;
pub use definition::VmDefinition;
pub use device::Device;
pub use errors::{DomainError, Result};
pub use tree::{XmlNode, XmlValue};
