pub mod boot_monitor;
pub mod config;
pub mod console_log;
pub mod desktop;
pub mod error;
pub mod history;
pub mod port_alloc;
pub mod process_launcher;
mod state_file;
pub mod supervisor;
pub mod window;
