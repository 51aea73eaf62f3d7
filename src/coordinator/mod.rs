pub mod download;
pub mod upload;

pub use download::DownloadCoordinator;
pub use upload::UploadCoordinator;
