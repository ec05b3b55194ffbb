mod common;

mod host;
mod server;
