mod dir;
mod file;
mod metadata;
mod path;

pub use self::file::*;
pub use dir::*;
pub use metadata::*;
pub use path::*;
