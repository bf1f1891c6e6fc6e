pub mod arbitration;
pub mod file_selector;

pub use file_selector::{FileSelector, NextFileStatus, SelectorSettings};
