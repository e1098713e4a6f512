//! Acquisition, fault handling, buffering, compression, and logging for
//! the EcoWatt device agent.

#![deny(unsafe_code)]

pub mod acquisition;
pub mod buffer;
pub mod catalog;
pub mod compression;
pub mod fault;
pub mod logger;
pub mod proto;
