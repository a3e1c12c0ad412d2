//! Retroplan Lineage - content-addressed provenance graph
//!
//! Answers the two questions a failed retrospect raises:
//! - what depends on this artifact ([`LineageGraph::downstream_of`])
//! - where can a replay safely restart
//!   ([`LineageGraph::find_earliest_valid_ancestor`])

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod graph;

pub use error::LineageError;
pub use graph::LineageGraph;
