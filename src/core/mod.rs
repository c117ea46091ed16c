//! Core engine: types, resolution, pipes, dependency graph, execution, actions, batching.

pub mod action;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod pipe;
pub mod planner;
pub mod resolver;
pub mod types;
