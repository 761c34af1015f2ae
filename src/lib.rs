//! reqflow: an asynchronous document-to-requirements pipeline
//!
//! Uploaded documents are sent to an external extraction service and turned
//! into requirements; projects get a knowledge base built from their
//! documents and requirements, followed by conflict detection whose results
//! are polled and persisted. All long-running work runs as persisted jobs.

pub mod commands;
pub mod config;
pub mod error;
pub mod extraction;
pub mod jobs;
pub mod lock;
pub mod meta;
pub mod pipeline;
pub mod progress;
pub mod text;

#[cfg(test)]
mod testing;
