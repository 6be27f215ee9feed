pub mod console;
pub mod error;
pub mod fsutil;
pub mod interrupt;

pub use error::OrthoError;
pub use fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, copy_dir, ensure_dir, load_json_file,
};
