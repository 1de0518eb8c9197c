//! Canvas services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `hub` is the only owner of mutable canvas state. The other modules are
//! plain data structures it drives (`canvas`, `chunk_index`, `session`,
//! `batcher`), the per-event handlers (`router`), and snapshot storage
//! (`persistence`), which runs on its own task.

pub mod batcher;
pub mod canvas;
pub mod chunk_index;
pub mod hub;
pub mod persistence;
pub mod router;
pub mod session;
