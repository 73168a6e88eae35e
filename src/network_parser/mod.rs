pub mod download_status;
pub mod fetcher;
pub mod html;
pub mod session;
