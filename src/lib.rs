//! A reactive, normalized object cache for ontology live queries.
//!
//! Start with [`cache::Store`]: build one per client, then observe objects,
//! lists, aggregations, links and function results through it.

pub mod cache;
pub mod config;
pub mod infra;
