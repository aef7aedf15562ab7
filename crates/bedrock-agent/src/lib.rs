pub mod agent;
pub mod configuration;
pub mod errors;
pub mod models;
pub mod providers;
pub mod retry;
pub mod systems;
