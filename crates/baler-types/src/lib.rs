pub mod error;
pub mod package_id;

pub use package_id::PackageId;
