mod termina;

pub use termina::*;
