pub mod profiles;
pub mod storage;
pub mod transfer;
