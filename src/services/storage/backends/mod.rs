//! Backend implementations.
//!
//! - **S3** and S3-compatible services, **GCS** and **FTP/FTPS** through
//!   Apache OpenDAL operators
//! - **SFTP** through russh and russh-sftp
//! - **SMB** shares mounted by the operating system
//! - **Local filesystem**

pub mod ftp;
pub mod gcs;
pub mod local_fs;
#[cfg(test)]
pub mod memory;
mod operator;
mod posix;
pub mod s3;
pub mod sftp;
pub mod smb;

pub use ftp::FtpConfig;
pub use gcs::GcsConfig;
pub use local_fs::{LocalBackend, LocalConfig};
pub use operator::OperatorBackend;
pub use s3::S3Config;
pub use sftp::{SftpBackend, SftpConfig};
pub use smb::{SmbBackend, SmbConfig};
