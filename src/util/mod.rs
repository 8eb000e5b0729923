pub mod circular_buffer;
pub mod vec3;
