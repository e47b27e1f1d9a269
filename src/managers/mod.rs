pub mod ssh;
pub mod switch;
