//! Built-in target kinds.
//!
//! `generic.build` wraps arbitrary command lists; the `cxx` family compiles
//! and links native code through a [`crate::adapters::CompilerAdapter`].
//! Both register their factories and property schemas here.

pub mod cxx;
pub mod generic;

use crate::model::{FactoryRegistry, ModelError, Session};
use crate::props::{PropDef, PropKind};

/// Property key for the debug flag.
pub const DEBUG_PROP: &str = "build.debug";
/// Property key for the optimisation profile.
pub const OPTIMIZE_PROP: &str = "build.optimize";

/// Register the built-in factories and their property schemas.
///
/// # Errors
///
/// Fails on conflicting property definitions.
pub fn register(session: &mut Session, registry: &mut FactoryRegistry) -> Result<(), ModelError> {
    session
        .schema
        .register(PropDef::new(DEBUG_PROP, PropKind::Bool))?;
    session
        .schema
        .register(PropDef::new(OPTIMIZE_PROP, PropKind::String))?;
    registry.register(&mut session.schema, Box::new(generic::GenericFactory))?;
    cxx::register(session, registry)?;
    Ok(())
}
