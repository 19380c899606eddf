#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::module_inception,
    clippy::needless_range_loop,
    clippy::result_map_unit_fn,
    clippy::useless_format
)]
#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::print_stdout,
    clippy::unwrap_used,
    clippy::use_debug,
    clippy::used_underscore_binding,
    clippy::used_underscore_items
)]

pub mod container;
pub mod engine;
pub mod jobs;
pub mod logger;
pub mod util;
pub mod vm;
