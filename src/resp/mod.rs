//! RESP2/3 framer, pipelined client, and connection pool, per spec §4.8.

mod client;
mod parser;
mod pool;
mod value;

pub use client::RespClient;
pub use parser::Parser;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use value::{encode, Value};
