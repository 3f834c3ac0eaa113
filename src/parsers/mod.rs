// ==============================================================================
// parsers/mod.rs - Text parser modules
// ==============================================================================
// Description: Line decoding and GFF3 record parsing
// Author: Matt Barham
// Created: 2026-09-30
// Modified: 2026-09-30
// Version: 2.0.0
// ==============================================================================

pub mod lines;
pub mod gff;

pub use lines::LineDecoder;
pub use gff::RecordParser;
