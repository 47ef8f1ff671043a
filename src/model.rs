//! The target model: sessions, cells, targets, traits and factories.
//!
//! A [`Session`] owns every [`Cell`], and cells group [`Target`]s by name.
//! Behaviour is attached to targets through [`TargetTrait`] objects which
//! are driven by the lowering pipeline; [`Factory`] implementations
//! construct targets from loosely-typed build-script arguments.

mod cache;
mod factory;
mod session;
mod target;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use cache::Cache;
pub use factory::{Factory, FactoryRegistry, TargetArgs, declare};
pub use session::{Cell, ConfigValue, Session};
pub use target::{Target, TargetId, TargetTrait, TraitCtx, TraitId};

use crate::action::ActionError;
use crate::outname::MacroError;
use crate::props::PropError;

/// Errors raised by the target model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A target reference string did not match `//cell:name` or `:name`.
    #[error("invalid target reference '{0}'")]
    InvalidRef(String),
    /// A reference named a cell that does not exist.
    #[error("unknown cell '{0}'")]
    UnknownCell(String),
    /// A reference named a target that does not exist.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    /// A relative reference was used without a current cell.
    #[error("relative reference '{0}' used outside of a cell")]
    RelativeRefWithoutCell(String),
    /// The target name is already taken in its cell.
    #[error("target '{name}' already exists in cell '{cell}'")]
    DuplicateTarget {
        /// Cell name.
        cell: String,
        /// Target name.
        name: String,
    },
    /// A main trait was assigned twice.
    #[error("target '{0}' already has a main trait")]
    TraitAlreadySet(String),
    /// A mutation was attempted after the target completed.
    #[error("target '{0}' has completed and can no longer be modified")]
    TargetCompleted(String),
    /// No factory is registered for the requested target kind.
    #[error("unknown target kind '{0}'")]
    UnknownKind(String),
    /// A configuration or trait argument carried an invalid value.
    #[error("{0}")]
    Config(String),
    /// Property layer failure.
    #[error(transparent)]
    Prop(#[from] PropError),
    /// Action construction failure.
    #[error(transparent)]
    Action(#[from] ActionError),
    /// Output-name template failure.
    #[error(transparent)]
    Macro(#[from] MacroError),
}

/// A parsed target reference.
///
/// References are written `//<cell>:<name>` or, relative to the current
/// cell, `:<name>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetRef {
    /// Fully qualified reference.
    Absolute {
        /// Cell name.
        cell: String,
        /// Target name.
        name: String,
    },
    /// Reference into the current cell.
    Relative(String),
}

impl FromStr for TargetRef {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidRef(s.to_owned());
        if let Some(name) = s.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Relative(name.to_owned()));
        }
        let rest = s.strip_prefix("//").ok_or_else(invalid)?;
        let (cell, name) = rest.split_once(':').ok_or_else(invalid)?;
        if cell.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Absolute {
            cell: cell.to_owned(),
            name: name.to_owned(),
        })
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute { cell, name } => write!(f, "//{cell}:{name}"),
            Self::Relative(name) => write!(f, ":{name}"),
        }
    }
}

/// Join a cell and target name into a long name.
#[must_use]
pub fn join_ref(cell: &str, name: &str) -> String {
    format!("//{cell}:{name}")
}
