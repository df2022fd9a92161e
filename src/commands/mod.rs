pub mod check;
pub mod init;
pub mod ports;
pub mod reclaim;
pub mod validate;
