/// In-memory log store and election state.
pub mod memory;
