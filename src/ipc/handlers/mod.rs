pub mod bot;
pub mod repo;
