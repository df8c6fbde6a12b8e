//! Command-line errors
//!
//! Failures from the auth pipeline itself propagate as
//! `auth_pipeline::Error` through `anyhow`; this enum only covers problems
//! with what the user typed.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{0}\n\n{usage}", usage = USAGE)]
    Usage(String),

    #[error("invalid JSON argument: {0}")]
    InvalidJson(String),

    #[error("no password given: set API_PASSWORD or pass it on stdin")]
    MissingPassword,
}

pub const USAGE: &str = "\
usage: api-client [--config <path>] <command>

commands:
  login <username>            sign in (password from API_PASSWORD or stdin)
  register <json>             create an account and sign in
  logout                      revoke and forget the stored session
  status                      show the current authentication state
  get <endpoint>              authenticated GET
  post <endpoint> <json>      authenticated POST
  delete <endpoint>           authenticated DELETE
  watch                       print auth events until interrupted";

/// Result alias for command-line parsing
pub type Result<T> = std::result::Result<T, Error>;
