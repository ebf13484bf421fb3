pub mod browse;
pub mod history;
pub mod providers;
