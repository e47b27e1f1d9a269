pub mod accounts;
pub mod command;
pub mod github;
pub mod logger;
pub mod process;
pub mod security;
pub mod token;
pub mod validation;
