//! Storage-access layer: one capability-queryable contract over object
//! stores, remote filesystems and local disk, with a transfer engine for
//! multipart uploads, batched deletes and recursive directory work.

pub mod logging;
pub mod services;
pub mod settings;
