pub mod control;
pub mod frame;
pub mod models;
pub mod settings;
