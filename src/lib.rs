//! TCP acceptor with a bounded worker pool.
//!
//! `server::Server` owns the listening socket and submits each accepted
//! connection to a `pool::WorkerPool`. Workers run `connection::handle_connection`,
//! which frames one request, runs a `service::Service` under a deadline,
//! writes the response and closes.

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod response;
pub mod server;
pub mod service;
