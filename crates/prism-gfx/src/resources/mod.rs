pub mod handles;
pub mod manager;
pub mod resource_factory;
pub mod typed_buffer;

pub use crate::basic::align::align_up;
