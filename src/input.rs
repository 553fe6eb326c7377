//! Input sources for operation nodes.
//!
//! A node's inputs are declared while the command line is parsed and
//! resolved at finalize time: an input naming another operation is held as a
//! template reference until the whole tree exists, then becomes an operation
//! reference that the per-shard merge pulls from.

use std::path::{Path, PathBuf};

use crate::database::{is_database_dir, Database};
use crate::error::EngineError;
use crate::sequence::{is_store_dir, SequenceStore};

/// One declared input of an operation template.
#[derive(Debug, Clone)]
pub enum InputSpec {
    /// Another operation, by ident, before trees are finalized.
    Template(usize),
    /// Another operation, by ident, after trees are finalized; the merge
    /// pulls this operation's post-filter output stream.
    Operation(usize),
    /// A sorted k-mer database on disk.
    Database(Database),
    /// A raw sequence file; only valid under a counting node.
    Sequence { path: PathBuf, compress: bool },
    /// A directory of sequence files with optional segmentation; only valid
    /// under a counting node.
    Store { store: SequenceStore, compress: bool },
}

impl InputSpec {
    /// Classifies a command-line path into a database, store, or sequence
    /// input by inspecting the file system.
    pub fn from_path(
        path: &Path,
        compress: bool,
        segment: usize,
        segment_max: usize,
    ) -> Result<Self, EngineError> {
        if is_database_dir(path) {
            return Ok(Self::Database(Database::open(path)?));
        }
        if is_store_dir(path) {
            return Ok(Self::Store {
                store: SequenceStore::new(path.to_path_buf(), segment, segment_max),
                compress,
            });
        }
        if path.is_file() {
            return Ok(Self::Sequence {
                path: path.to_path_buf(),
                compress,
            });
        }
        Err(EngineError::SequenceRead {
            details: "no such file or directory".into(),
            path: path.to_path_buf(),
        })
    }

    /// Short kind name for error messages and tree dumps.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Template(_) => "operation-template",
            Self::Operation(_) => "operation",
            Self::Database(_) => "database",
            Self::Sequence { .. } => "sequence-file",
            Self::Store { .. } => "sequence-store",
        }
    }

    /// True for inputs that produce sorted k-mer streams the merge can
    /// consume directly.
    #[must_use]
    pub fn is_sorted_source(&self) -> bool {
        matches!(
            self,
            Self::Template(_) | Self::Operation(_) | Self::Database(_)
        )
    }

    /// True for raw sequence inputs, which only a counting node accepts.
    #[must_use]
    pub fn is_sequence_source(&self) -> bool {
        matches!(self, Self::Sequence { .. } | Self::Store { .. })
    }
}
