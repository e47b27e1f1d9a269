pub mod account_lock;
pub mod feature_flags;
pub mod fs_atomic;
pub mod paths;
pub mod redact;
