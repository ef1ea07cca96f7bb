/// Database configuration and connection management
pub mod database;

/// Engine settings (exchange rates, payment gateway, retry policy) from config.toml
pub mod settings;
