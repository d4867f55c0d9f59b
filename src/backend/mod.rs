pub mod cache;
pub mod config;
pub mod download;
pub mod ehentai;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod gallery;
pub mod pages;
pub mod resolver;
pub mod session;
pub mod transport;

#[cfg(test)]
pub mod testing;
