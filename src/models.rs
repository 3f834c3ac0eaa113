// ==============================================================================
// models.rs - Annotation Index Data Models
// ==============================================================================
// Description: Feature records, contig aggregates and index metadata
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-14
// Version: 1.1.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Attribute families indexed per contig
///
/// The set is fixed at compile time. Each category has a GFF3 attribute key
/// (`interpro=`), a plural name used in queries (`interpros`) and a presence
/// flag (`hasInterpros`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnnotationCategory {
    #[serde(rename = "interpros")]
    Interpro,
    #[serde(rename = "pfams")]
    Pfam,
    #[serde(rename = "gos")]
    Go,
    #[serde(rename = "keggs")]
    Kegg,
    #[serde(rename = "cogs")]
    Cog,
    #[serde(rename = "ec_numbers")]
    EcNumber,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unknown annotation category: {0}")]
pub struct UnknownCategory(pub String);

impl AnnotationCategory {
    pub const ALL: [AnnotationCategory; 6] = [
        AnnotationCategory::Interpro,
        AnnotationCategory::Pfam,
        AnnotationCategory::Go,
        AnnotationCategory::Kegg,
        AnnotationCategory::Cog,
        AnnotationCategory::EcNumber,
    ];

    /// GFF3 attribute key carrying this category
    pub fn attribute_key(&self) -> &'static str {
        match self {
            AnnotationCategory::Interpro => "interpro",
            AnnotationCategory::Pfam => "pfam",
            AnnotationCategory::Go => "go",
            AnnotationCategory::Kegg => "kegg",
            AnnotationCategory::Cog => "cog",
            AnnotationCategory::EcNumber => "ec_number",
        }
    }

    /// Plural category name used by queries and serialized contigs
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationCategory::Interpro => "interpros",
            AnnotationCategory::Pfam => "pfams",
            AnnotationCategory::Go => "gos",
            AnnotationCategory::Kegg => "keggs",
            AnnotationCategory::Cog => "cogs",
            AnnotationCategory::EcNumber => "ec_numbers",
        }
    }

    /// SQLite column holding the presence flag
    pub fn presence_column(&self) -> &'static str {
        match self {
            AnnotationCategory::Interpro => "has_interpros",
            AnnotationCategory::Pfam => "has_pfams",
            AnnotationCategory::Go => "has_gos",
            AnnotationCategory::Kegg => "has_keggs",
            AnnotationCategory::Cog => "has_cogs",
            AnnotationCategory::EcNumber => "has_ec_numbers",
        }
    }

    /// Case-insensitive lookup by GFF3 attribute key
    pub fn from_attribute_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.attribute_key().eq_ignore_ascii_case(key))
    }
}

impl fmt::Display for AnnotationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnotationCategory {
    type Err = UnknownCategory;

    /// Accepts either the attribute key (`interpro`) or the plural name (`interpros`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.attribute_key().eq_ignore_ascii_case(s) || c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Normalize an annotation value for storage and lookup
pub fn normalize_value(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Feature strand (GFF3 column 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strand {
    Forward,
    Reverse,
    Unknown,
    Unstranded,
}

impl Strand {
    pub fn from_column(column: &str) -> Self {
        match column {
            "+" => Strand::Forward,
            "-" => Strand::Reverse,
            "?" => Strand::Unknown,
            _ => Strand::Unstranded,
        }
    }
}

/// Per-category value lists, one field per supported category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub interpros: Vec<String>,
    pub pfams: Vec<String>,
    pub gos: Vec<String>,
    pub keggs: Vec<String>,
    pub cogs: Vec<String>,
    pub ec_numbers: Vec<String>,
}

impl Annotations {
    pub fn get(&self, category: AnnotationCategory) -> &[String] {
        match category {
            AnnotationCategory::Interpro => &self.interpros,
            AnnotationCategory::Pfam => &self.pfams,
            AnnotationCategory::Go => &self.gos,
            AnnotationCategory::Kegg => &self.keggs,
            AnnotationCategory::Cog => &self.cogs,
            AnnotationCategory::EcNumber => &self.ec_numbers,
        }
    }

    pub fn get_mut(&mut self, category: AnnotationCategory) -> &mut Vec<String> {
        match category {
            AnnotationCategory::Interpro => &mut self.interpros,
            AnnotationCategory::Pfam => &mut self.pfams,
            AnnotationCategory::Go => &mut self.gos,
            AnnotationCategory::Kegg => &mut self.keggs,
            AnnotationCategory::Cog => &mut self.cogs,
            AnnotationCategory::EcNumber => &mut self.ec_numbers,
        }
    }

    /// Add a value unless already present (values are expected to be normalized)
    pub fn insert(&mut self, category: AnnotationCategory, value: String) -> bool {
        let values = self.get_mut(category);
        if values.contains(&value) {
            return false;
        }
        values.push(value);
        true
    }

    pub fn is_empty(&self) -> bool {
        AnnotationCategory::ALL.iter().all(|c| self.get(*c).is_empty())
    }

    /// Iterate `(category, value)` pairs in category order
    pub fn iter(&self) -> impl Iterator<Item = (AnnotationCategory, &str)> + '_ {
        AnnotationCategory::ALL
            .into_iter()
            .flat_map(move |c| self.get(c).iter().map(move |v| (c, v.as_str())))
    }
}

/// Presence flags derived from `Annotations`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub has_interpros: bool,
    pub has_pfams: bool,
    pub has_gos: bool,
    pub has_keggs: bool,
    pub has_cogs: bool,
    pub has_ec_numbers: bool,
}

impl Presence {
    pub fn from_annotations(annotations: &Annotations) -> Self {
        Self {
            has_interpros: !annotations.interpros.is_empty(),
            has_pfams: !annotations.pfams.is_empty(),
            has_gos: !annotations.gos.is_empty(),
            has_keggs: !annotations.keggs.is_empty(),
            has_cogs: !annotations.cogs.is_empty(),
            has_ec_numbers: !annotations.ec_numbers.is_empty(),
        }
    }

    pub fn get(&self, category: AnnotationCategory) -> bool {
        match category {
            AnnotationCategory::Interpro => self.has_interpros,
            AnnotationCategory::Pfam => self.has_pfams,
            AnnotationCategory::Go => self.has_gos,
            AnnotationCategory::Kegg => self.has_keggs,
            AnnotationCategory::Cog => self.has_cogs,
            AnnotationCategory::EcNumber => self.has_ec_numbers,
        }
    }
}

/// Attributes pulled out of column 9 for one feature
///
/// Singleton fields keep the first comma-delimited value. Index categories
/// hold every normalized value, and stay empty unless requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectedAttributes {
    pub id: Option<String>,
    pub parent: Option<String>,
    pub name: Option<String>,
    pub product: Option<String>,
    pub index: Annotations,
}

/// One parsed GFF3 feature line (never persisted individually)
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub seqid: String,
    pub source: String,
    pub feature_type: String,
    pub start: u64,
    pub end: u64,
    /// None when the column holds the `.` empty marker
    pub score: Option<f64>,
    pub strand: Strand,
    /// 0, 1 or 2; -1 when absent
    pub phase: i8,
    pub attributes: SelectedAttributes,
}

/// Per-contig aggregate stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contig {
    pub contig_name: String,
    pub length: u64,
    pub annotations: Annotations,
    #[serde(rename = "annotationsPresence")]
    pub presence: Presence,
}

impl Contig {
    pub fn new(contig_name: impl Into<String>) -> Self {
        Self {
            contig_name: contig_name.into(),
            length: 0,
            annotations: Annotations::default(),
            presence: Presence::default(),
        }
    }

    /// Fold one feature into the aggregate, keeping presence flags in sync
    pub fn absorb(&mut self, record: &FeatureRecord) {
        self.length = self.length.max(record.end);
        for (category, value) in record.attributes.index.iter() {
            self.annotations.insert(category, value.to_string());
        }
        self.presence = Presence::from_annotations(&self.annotations);
    }
}

/// Identifies which remote source the store currently reflects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub source_url: String,
    pub index_url: String,
    pub attrs_to_index: Vec<AnnotationCategory>,
    pub completed_at: DateTime<Utc>,
}

impl IndexMetadata {
    pub fn new(source_url: impl Into<String>, index_url: impl Into<String>, attrs_to_index: Vec<AnnotationCategory>) -> Self {
        Self {
            source_url: source_url.into(),
            index_url: index_url.into(),
            attrs_to_index,
            completed_at: Utc::now(),
        }
    }
}
