//! Relational persistence for the orchestration core: conversations and
//! messages, the Memory Store, the Knowledge Store, cron scheduling,
//! the review queue, and model routes/usage — one SQLite database
//! (via `r2d2`-pooled `rusqlite` connections), grounded on
//! `skynet-memory`'s db/manager split from the retrieval pack, since
//! the teacher repo itself has no relational store of its own.

pub mod conversations;
pub mod cron;
mod cronexpr;
pub mod db;
pub mod error;
pub mod knowledge;
pub mod memory;
pub mod messages;
pub mod model;
pub mod review;
pub mod routes;
mod util;
pub mod usage;

pub use db::Db;
pub use error::Result;
