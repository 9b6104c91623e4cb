//! Backend source implementations.

pub mod local;
pub mod minio;
pub mod s3;
