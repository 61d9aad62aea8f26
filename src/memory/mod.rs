/// GPU memory helpers
///
/// Persistently mapped, grow-only buffers owned by the pipeline stages.

pub mod persistent_buffer;

pub use persistent_buffer::PersistentBuffer;
