pub mod controller;
pub mod cpu;
pub mod manager;
pub mod util;

pub use controller::Controller;
pub use manager::CpuController;
