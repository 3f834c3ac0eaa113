// ==============================================================================
// parsers/gff.rs - GFF3 Feature Line Parser
// ==============================================================================
// Description: Parses GFF3 feature lines with selective attribute extraction
// Author: Matt Barham
// Created: 2026-09-30
// Modified: 2026-10-08
// Version: 1.1.0
// ==============================================================================
// References:
// - GFF3 Spec: https://github.com/The-Sequence-Ontology/Specifications/blob/master/gff3.md
// ==============================================================================
// Format: 9 tab-delimited columns
//   seqid source type start end score strand phase attributes
// Example:
//   ctg1  prokka  CDS  337  2799  .  +  0  ID=cds1;product=thrA;interpro=IPR000001,IPR001048
// ==============================================================================

use percent_encoding::percent_decode_str;
use std::borrow::Cow;

use crate::models::{normalize_value, AnnotationCategory, FeatureRecord, SelectedAttributes, Strand};

/// Minimum columns for a usable feature line (attributes may be absent)
const MIN_COLUMNS: usize = 8;

/// Parser for GFF3 feature lines
///
/// Only the attribute categories passed to `new` are extracted from column 9;
/// `ID`, `Parent`, `Name` and `product` are always kept (first value only).
#[derive(Debug, Clone)]
pub struct RecordParser {
    wanted: Vec<AnnotationCategory>,
    /// Count of lines skipped for having too few columns
    pub malformed_count: usize,
}

impl RecordParser {
    pub fn new(wanted: &[AnnotationCategory]) -> Self {
        let mut wanted = wanted.to_vec();
        wanted.sort();
        wanted.dedup();
        Self {
            wanted,
            malformed_count: 0,
        }
    }

    pub fn wanted(&self) -> &[AnnotationCategory] {
        &self.wanted
    }

    /// Parse one line
    ///
    /// Returns None for lines with fewer than 8 columns; these are counted
    /// and otherwise ignored.
    pub fn parse_line(&mut self, line: &str) -> Option<FeatureRecord> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut columns = [""; 9];
        let mut count = 0;
        for (slot, column) in columns.iter_mut().zip(line.splitn(9, '\t')) {
            *slot = column;
            count += 1;
        }

        if count < MIN_COLUMNS {
            self.malformed_count += 1;
            return None;
        }

        let attributes = if count == 9 {
            self.scan_attributes(columns[8])
        } else {
            SelectedAttributes::default()
        };

        Some(FeatureRecord {
            seqid: columns[0].to_string(),
            source: columns[1].to_string(),
            feature_type: columns[2].to_string(),
            start: columns[3].trim().parse().unwrap_or(0),
            end: columns[4].trim().parse().unwrap_or(0),
            score: parse_score(columns[5]),
            strand: Strand::from_column(columns[6]),
            phase: parse_phase(columns[7]),
            attributes,
        })
    }

    /// Single left-to-right pass over `key=value;key=value;...`
    ///
    /// Unwanted entries are stepped over without allocating.
    fn scan_attributes(&self, column: &str) -> SelectedAttributes {
        let mut attrs = SelectedAttributes::default();
        let mut pos = 0;

        while pos < column.len() {
            let entry_end = column[pos..].find(';').map_or(column.len(), |i| pos + i);
            let entry = &column[pos..entry_end];
            pos = entry_end + 1;

            let Some(eq) = entry.find('=') else {
                continue;
            };
            let key = entry[..eq].trim();
            let value = &entry[eq + 1..];

            match key {
                "ID" => set_once(&mut attrs.id, value),
                "Parent" => set_once(&mut attrs.parent, value),
                "Name" => set_once(&mut attrs.name, value),
                "product" => set_once(&mut attrs.product, value),
                _ => {
                    let Some(category) = AnnotationCategory::from_attribute_key(key) else {
                        continue;
                    };
                    if !self.wanted.contains(&category) {
                        continue;
                    }
                    for item in value.split(',') {
                        let normalized = normalize_value(&decode_if_escaped(item.trim()));
                        if !normalized.is_empty() {
                            attrs.index.insert(category, normalized);
                        }
                    }
                }
            }
        }

        attrs
    }
}

/// Percent-decode only when the value actually contains an escape
fn decode_if_escaped(value: &str) -> Cow<'_, str> {
    if value.contains('%') {
        percent_decode_str(value).decode_utf8_lossy()
    } else {
        Cow::Borrowed(value)
    }
}

/// Keep the first comma-delimited value of a singleton attribute
fn set_once(slot: &mut Option<String>, value: &str) {
    if slot.is_some() {
        return;
    }
    let first = value.split(',').next().unwrap_or("").trim();
    if !first.is_empty() {
        *slot = Some(decode_if_escaped(first).into_owned());
    }
}

fn parse_score(column: &str) -> Option<f64> {
    match column.trim() {
        "" | "." => None,
        s => s.parse().ok(),
    }
}

fn parse_phase(column: &str) -> i8 {
    match column.trim() {
        "0" => 0,
        "1" => 1,
        "2" => 2,
        _ => -1,
    }
}
