pub mod filesystem;
pub mod naming;

pub use filesystem::{save_upload, TextOutput};
pub use naming::safe_filename;
