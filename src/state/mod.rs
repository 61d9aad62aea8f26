/// Frame state handed from scene extraction to the first pass

pub mod double_buffer;
pub mod render_state;


pub use double_buffer::DoubleBuffer;
pub use render_state::{Camera, GeometryPool, PoolKind, RenderBatch, RenderState};
