pub mod bridge;
pub mod config;
pub mod logging;
pub mod rewrite;
pub mod server;
pub mod tools;

#[cfg(test)]
mod tests;
