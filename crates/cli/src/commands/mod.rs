pub mod config_cmd;
pub mod render;
pub mod write;
