/// Docker module contains the implementation of the container engine
/// capability on top of the Docker Engine API.
pub mod engine;
