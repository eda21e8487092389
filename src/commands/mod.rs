//! 命令行子命令

pub mod state;
pub mod upload;

pub use state::show_state;
pub use upload::{run_upload, UploadArgs};
