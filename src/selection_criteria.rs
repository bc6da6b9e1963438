//! Read preferences and the criteria used to pick servers for operations.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, Bson, Document},
    error::{Error, Result},
    sdam::public::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that dictates which server types are suitable and how they should be
    /// filtered by tags and staleness.
    ReadPreference(ReadPreference),

    /// A predicate applied to each server in the latest topology snapshot. Only servers for
    /// which it returns true are candidates.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// Creates a criteria from an arbitrary server predicate.
    pub fn predicate<F>(filter: F) -> Self
    where
        F: Fn(&ServerInfo) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(filter))
    }
}

/// A predicate used to filter servers considered for selection.
pub type Predicate = Arc<dyn Fn(&ServerInfo) -> bool + Send + Sync>;

/// Specifies how the driver routes read operations among the members of a deployment.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Route this operation to the primary if it's available, and to a secondary otherwise.
    PrimaryPreferred {
        /// Options for filtering eligible secondaries.
        options: Option<ReadPreferenceOptions>,
    },

    /// Only route this operation to a secondary.
    Secondary {
        /// Options for filtering eligible secondaries.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, and to the primary otherwise.
    SecondaryPreferred {
        /// Options for filtering eligible secondaries.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency, regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        /// Options for filtering eligible members.
        options: Option<ReadPreferenceOptions>,
    },
}

/// Filtering options applied to the non-`Primary` read preference modes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tag sets, tried in order; the first set matched by at least one eligible server is
    /// used, and only servers carrying every tag in that set remain candidates. An empty tag
    /// set matches every server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// The maximum replication lag a secondary may have and still be eligible. Must be at
    /// least 90 seconds when positive.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        with = "crate::serde_util::duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

/// A set of tags used to filter replica set members during selection.
pub type TagSet = HashMap<String, String>;

impl ReadPreference {
    pub(crate) fn from_mode(mode: &str, options: ReadPreferenceOptions) -> Result<Self> {
        let options = Some(options);
        let pref = match mode.to_lowercase().as_str() {
            "primary" => {
                let options = options.unwrap_or_default();
                if options.tag_sets.is_some() {
                    return Err(Error::invalid_argument(
                        "tag sets cannot be used with the primary read preference",
                    ));
                }
                if options.max_staleness.is_some() {
                    return Err(Error::invalid_argument(
                        "maxStalenessSeconds cannot be used with the primary read preference",
                    ));
                }
                ReadPreference::Primary
            }
            "primarypreferred" => ReadPreference::PrimaryPreferred { options },
            "secondary" => ReadPreference::Secondary { options },
            "secondarypreferred" => ReadPreference::SecondaryPreferred { options },
            "nearest" => ReadPreference::Nearest { options },
            other => {
                return Err(Error::invalid_argument(format!(
                    "invalid read preference mode: \"{}\"",
                    other
                )))
            }
        };
        Ok(pref)
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::PrimaryPreferred { options }
            | ReadPreference::Secondary { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Builds the `$readPreference` document attached to commands routed through a mongos.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! { "mode": self.mode() };

        if let Some(tag_sets) = self.tag_sets() {
            let tags: Vec<Bson> = tag_sets
                .iter()
                .map(|tag_set| {
                    Bson::Document(tag_set.iter().map(|(k, v)| (k.clone(), v.into())).collect())
                })
                .collect();
            doc.insert("tags", tags);
        }

        if let Some(max_staleness) = self.max_staleness() {
            doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }

        doc
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Mode: {}", self.mode())?;
        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
        }
        write!(f, " }}")
    }
}
