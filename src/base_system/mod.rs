pub mod book_id;
pub mod book_paths;
pub mod config;
pub mod context;
pub mod file_cleaner;
pub mod logging;
