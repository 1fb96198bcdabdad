pub mod root_signature;
pub mod shader;
pub mod state_object;
