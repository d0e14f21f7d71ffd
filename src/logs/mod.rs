// Logs module - Log targets fed by the child's output pipes

mod target;

pub use target::{LogStream, LogTarget, CHUNK_SIZE};
