#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod backoff;
pub mod config;
pub mod error;
pub mod session;
pub mod validator;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
