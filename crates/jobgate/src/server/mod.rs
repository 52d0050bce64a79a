pub mod bootstrap;
pub mod dispatcher;
pub mod http;
pub mod job;
pub mod pbs;
pub mod unixbatch;
