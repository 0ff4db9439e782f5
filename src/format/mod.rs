//! Registry of known store format versions and the transitions between them.
//!
//! Versions are identified on disk by a short ASCII marker. Generations are
//! only ever compared inside one family or along an explicitly allowed
//! family transition.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::log::LogCommandCodec;
use crate::types::{Result, StoreError};

pub mod check;

pub use check::{MigrationCheckResult, MigrationOutcome, StoreVersionCheck};

/// Record-format family.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatFamily {
    /// Default compact records.
    Standard,
    /// Page-aligned records.
    Aligned,
    /// Wide identifiers for very large graphs.
    HighLimit,
}

impl FormatFamily {
    /// Lower-case family name.
    pub fn name(self) -> &'static str {
        match self {
            FormatFamily::Standard => "standard",
            FormatFamily::Aligned => "aligned",
            FormatFamily::HighLimit => "high_limit",
        }
    }
}

impl fmt::Display for FormatFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout of the metadata file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum MetadataLayout {
    /// No checkpoint log version field.
    V1,
    /// Adds the checkpoint log version.
    V2,
}

/// A known store format version.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[repr(u8)]
pub enum StoreVersion {
    /// Standard 4.3.
    StandardV4_3 = 0,
    /// Standard 5.12.
    StandardV5_12 = 1,
    /// Standard 5.20.
    StandardV5_20 = 2,
    /// Standard 5.20.1, still under development.
    StandardV5_20_1 = 3,
    /// Aligned 5.20.
    AlignedV5_20 = 4,
    /// High-limit 4.3.
    HighLimitV4_3 = 5,
    /// High-limit 5.12.
    HighLimitV5_12 = 6,
}

/// Static facts about one [`StoreVersion`].
#[derive(Debug)]
pub struct FormatDescriptor {
    /// Version described.
    pub version: StoreVersion,
    /// On-disk marker.
    pub marker: &'static str,
    /// Family the version belongs to.
    pub family: FormatFamily,
    /// `(major, minor, patch)` generation.
    pub generation: (u8, u8, u8),
    /// Record file layout id.
    pub record_layout: u16,
    /// Metadata file layout.
    pub metadata_layout: MetadataLayout,
    /// Codec used by this version's transaction logs.
    pub codec: LogCommandCodec,
    /// Whether the version keeps a relationship-group degrees store.
    pub has_degrees_store: bool,
    /// Only selectable when development versions are enabled.
    pub under_development: bool,
}

static FORMATS: [FormatDescriptor; 7] = [
    FormatDescriptor {
        version: StoreVersion::StandardV4_3,
        marker: "SF4.3.0",
        family: FormatFamily::Standard,
        generation: (4, 3, 0),
        record_layout: 1,
        metadata_layout: MetadataLayout::V1,
        codec: LogCommandCodec::V4_3,
        has_degrees_store: true,
        under_development: false,
    },
    FormatDescriptor {
        version: StoreVersion::StandardV5_12,
        marker: "SF5.12.0",
        family: FormatFamily::Standard,
        generation: (5, 12, 0),
        record_layout: 2,
        metadata_layout: MetadataLayout::V2,
        codec: LogCommandCodec::V5_12,
        has_degrees_store: true,
        under_development: false,
    },
    FormatDescriptor {
        version: StoreVersion::StandardV5_20,
        marker: "SF5.20.0",
        family: FormatFamily::Standard,
        generation: (5, 20, 0),
        record_layout: 2,
        metadata_layout: MetadataLayout::V2,
        codec: LogCommandCodec::V5_20,
        has_degrees_store: true,
        under_development: false,
    },
    FormatDescriptor {
        version: StoreVersion::StandardV5_20_1,
        marker: "SF5.20.1",
        family: FormatFamily::Standard,
        generation: (5, 20, 1),
        record_layout: 2,
        metadata_layout: MetadataLayout::V2,
        codec: LogCommandCodec::V5_20,
        has_degrees_store: true,
        under_development: true,
    },
    FormatDescriptor {
        version: StoreVersion::AlignedV5_20,
        marker: "AF5.20.0",
        family: FormatFamily::Aligned,
        generation: (5, 20, 0),
        record_layout: 3,
        metadata_layout: MetadataLayout::V2,
        codec: LogCommandCodec::V5_20,
        has_degrees_store: true,
        under_development: false,
    },
    FormatDescriptor {
        version: StoreVersion::HighLimitV4_3,
        marker: "HL4.3.0",
        family: FormatFamily::HighLimit,
        generation: (4, 3, 0),
        record_layout: 4,
        metadata_layout: MetadataLayout::V1,
        codec: LogCommandCodec::V4_3,
        has_degrees_store: false,
        under_development: false,
    },
    FormatDescriptor {
        version: StoreVersion::HighLimitV5_12,
        marker: "HL5.12.0",
        family: FormatFamily::HighLimit,
        generation: (5, 12, 0),
        record_layout: 5,
        metadata_layout: MetadataLayout::V2,
        codec: LogCommandCodec::V5_12,
        has_degrees_store: true,
        under_development: false,
    },
];

/// Cross-family transitions. Same-family upgrades are always allowed.
const FAMILY_TRANSITIONS: [(FormatFamily, FormatFamily); 3] = [
    (FormatFamily::Standard, FormatFamily::Aligned),
    (FormatFamily::Aligned, FormatFamily::Standard),
    (FormatFamily::HighLimit, FormatFamily::Aligned),
];

impl StoreVersion {
    /// Every known version, in registry order.
    pub fn all() -> impl Iterator<Item = StoreVersion> {
        FORMATS.iter().map(|d| d.version)
    }

    /// Static descriptor for this version.
    pub fn descriptor(self) -> &'static FormatDescriptor {
        &FORMATS[self as usize]
    }

    /// On-disk marker string.
    pub fn marker(self) -> &'static str {
        self.descriptor().marker
    }

    /// Format family.
    pub fn family(self) -> FormatFamily {
        self.descriptor().family
    }

    /// `(major, minor, patch)` generation.
    pub fn generation(self) -> (u8, u8, u8) {
        self.descriptor().generation
    }

    /// Record file layout id.
    pub fn record_layout(self) -> u16 {
        self.descriptor().record_layout
    }

    /// Metadata file layout.
    pub fn metadata_layout(self) -> MetadataLayout {
        self.descriptor().metadata_layout
    }

    /// Log codec for this version.
    pub fn codec(self) -> LogCommandCodec {
        self.descriptor().codec
    }

    /// Whether a degrees store is part of the format.
    pub fn has_degrees_store(self) -> bool {
        self.descriptor().has_degrees_store
    }

    /// Whether the version is still under development.
    pub fn is_under_development(self) -> bool {
        self.descriptor().under_development
    }

    /// Resolves an on-disk marker.
    pub fn from_marker(marker: &str) -> Result<StoreVersion> {
        FORMATS
            .iter()
            .find(|d| d.marker == marker)
            .map(|d| d.version)
            .ok_or_else(|| StoreError::UnsupportedFormat(format!("unknown marker {marker:?}")))
    }

    /// Newest version of `family`, skipping development versions unless asked.
    pub fn latest(family: FormatFamily, include_under_development: bool) -> Option<StoreVersion> {
        FORMATS
            .iter()
            .filter(|d| d.family == family)
            .filter(|d| include_under_development || !d.under_development)
            .max_by_key(|d| d.generation)
            .map(|d| d.version)
    }

    /// Whether moving to `to` changes the record layout and so needs a rewrite.
    pub fn requires_record_rewrite(self, to: StoreVersion) -> bool {
        self.record_layout() != to.record_layout()
    }

    /// Whether a migration from `self` to `to` is allowed.
    pub fn can_migrate_to(self, to: StoreVersion) -> bool {
        if self == to {
            return false;
        }
        if self.family() == to.family() {
            return to.generation() > self.generation();
        }
        FAMILY_TRANSITIONS.contains(&(self.family(), to.family()))
            && to.generation() >= self.generation()
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}
