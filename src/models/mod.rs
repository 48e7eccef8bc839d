pub mod scan;
pub mod target;
