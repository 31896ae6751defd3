//! # Integration Flows
//!
//! Every test builds its buses on `127.0.0.1` port 0 and reads the bound port
//! back from the server, so suites can run in parallel.

#[cfg(test)]
mod support;

mod discovery;
mod end_to_end;
mod routing;
mod tls;
