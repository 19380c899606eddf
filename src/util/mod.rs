mod mountinfo;
mod process_group;

pub use mountinfo::*;
pub use process_group::*;
