pub mod compiling;
pub mod phase;
pub mod running;
