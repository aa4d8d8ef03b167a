pub mod atomic;
pub mod exit;
pub mod stop_flag;
pub mod timer;
