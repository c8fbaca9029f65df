//! The per-connection HTTP/1.x request engine.
//!
//! Turns a raw byte stream (`AsyncRead + AsyncWrite`) into a sequence of
//! fully-parsed requests, dispatches each into route/filter/upstream
//! selection, and drives the response write loop with backpressure before
//! reclaiming the connection for pipelining, keep-alive, or a lingering
//! close. See each submodule for the component it implements.

pub mod buffer;
pub mod connection;
pub mod dispatcher;
pub mod handle;
pub mod host;
pub mod keepalive;
pub mod lingering;
pub mod parser;
pub mod request;
pub mod subrequest;
pub mod vhost;
pub mod writer;

pub use connection::Connection;
pub use request::Request;
