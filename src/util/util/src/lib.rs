pub mod debug;
pub mod sync;
