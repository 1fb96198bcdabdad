pub mod barrier;
pub mod command_cycler;
pub mod command_list;
pub mod fence_sync;
pub mod upload_context;
