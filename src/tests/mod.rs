//! Integration testing module
//!
//! Runs the whole pipeline against media synthesized by [`fixtures`]:
//! - Probing files and memory inputs
//! - Session lifecycle through the handle table
//! - Transcoding into each output package
//! - Muxing multi-part tracks

pub mod e2e;
pub mod fixtures;
pub mod probe_input;
