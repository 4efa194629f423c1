//! Asynchronous filesystem handles and helpers.
//!
//! All filesystem work runs on the loop's worker pool; completion
//! callbacks run on the loop thread.

pub(crate) mod dir;
pub(crate) mod file;

pub use self::dir::{
    make_all_dirs, make_dir, make_temp_dir, remove_dir, remove_dir_with_progress, Continuation,
    Dir, DirectoryEntryType,
};
pub use self::file::{File, StatData};
