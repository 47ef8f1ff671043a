//! The two-phase lowering pipeline.
//!
//! Lowering drives every selected target through `complete` and then
//! `translate`, dependencies first. Cycles in the target DAG are detected
//! with an in-progress set and reported as the offending path. The helpers
//! at the bottom implement the cross-target option resolution policies
//! (preferred linkage, debug, optimize) that traits consult while
//! completing.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{ModelError, Session, TargetId, TraitCtx};

/// Errors raised during lowering.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The target graph contains a cycle.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle {
        /// The cycle, starting and ending at the same target.
        path: Vec<String>,
    },
    /// A trait hook failed.
    #[error("{target}: {source}")]
    Trait {
        /// The target whose trait failed.
        target: String,
        /// The underlying failure.
        source: ModelError,
    },
}

/// Tracks the visitation state of a target during traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum VisitState {
    Visiting,
    Visited,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Complete,
    Translate,
}

/// Run `complete` over all selected targets, then `translate`.
///
/// Both phases are idempotent: re-invoking on an already lowered target is
/// a no-op.
///
/// # Errors
///
/// Returns [`PipelineError::Cycle`] for cyclic graphs and
/// [`PipelineError::Trait`] when a trait hook fails.
pub fn lower(session: &mut Session, selected: &[TargetId]) -> Result<(), PipelineError> {
    let mut walker = Walker::new(Phase::Complete);
    for &target in selected {
        walker.visit(session, target)?;
    }
    let mut walker = Walker::new(Phase::Translate);
    for &target in selected {
        walker.visit(session, target)?;
    }
    Ok(())
}

struct Walker {
    phase: Phase,
    states: HashMap<TargetId, VisitState>,
    stack: Vec<TargetId>,
}

impl Walker {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            states: HashMap::new(),
            stack: Vec::new(),
        }
    }

    fn visit(&mut self, session: &mut Session, target: TargetId) -> Result<(), PipelineError> {
        match self.states.get(&target) {
            Some(VisitState::Visited) => return Ok(()),
            Some(VisitState::Visiting) => {
                return Err(self.cycle_error(session, target));
            }
            None => {
                self.states.insert(target, VisitState::Visiting);
            }
        }
        self.stack.push(target);

        for dep in session.target(target).direct_deps() {
            self.visit(session, dep)?;
        }
        self.run_traits(session, target)?;

        self.stack.pop();
        self.states.insert(target, VisitState::Visited);
        Ok(())
    }

    fn run_traits(&self, session: &mut Session, target: TargetId) -> Result<(), PipelineError> {
        let already_done = match self.phase {
            Phase::Complete => session.target(target).is_completed(),
            Phase::Translate => session.target(target).is_translated(),
        };
        if already_done {
            return Ok(());
        }
        // Post-order over the trait tree: sub-traits first, the main trait
        // last. The list is re-read each step because a main trait may
        // install sub-traits while it completes.
        let mut index = 0;
        loop {
            let order = session.target(target).traits_post_order();
            let Some(&trait_id) = order.get(index) else {
                break;
            };
            if let Some(mut hook) = session.take_trait(trait_id) {
                let mut ctx = TraitCtx {
                    session: &mut *session,
                    target,
                };
                let result = match self.phase {
                    Phase::Complete => hook.complete(&mut ctx),
                    Phase::Translate => hook.translate(&mut ctx),
                };
                session.put_trait(trait_id, hook);
                result.map_err(|source| PipelineError::Trait {
                    target: session.target(target).long_name(),
                    source,
                })?;
            }
            index += 1;
        }
        match self.phase {
            Phase::Complete => session.seal_completed(target),
            Phase::Translate => session.seal_translated(target),
        }
        Ok(())
    }

    fn cycle_error(&self, session: &Session, target: TargetId) -> PipelineError {
        let start = self
            .stack
            .iter()
            .position(|&t| t == target)
            .unwrap_or(0);
        let mut path: Vec<String> = self
            .stack
            .iter()
            .skip(start)
            .map(|&t| session.target(t).long_name())
            .collect();
        path.push(session.target(target).long_name());
        PipelineError::Cycle { path }
    }
}

/// Preferred linkage of a library target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Linkage {
    /// Link into dependents as a static archive.
    Static,
    /// Build a shared object.
    Shared,
}

impl Linkage {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "static" => Some(Self::Static),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Resolve the preferred linkage of a library from its own setting or the
/// declared preferences of its dependents.
///
/// Conflicting dependents fall back to static and produce a warning.
///
/// # Errors
///
/// Fails when an explicit value is not `static` or `shared`.
pub fn resolve_preferred_linkage(
    session: &Session,
    target: TargetId,
    key: &str,
) -> Result<Linkage, ModelError> {
    let own = session.target(target).props().get(key).cloned();
    if let Some(value) = own {
        let text = value.as_str().unwrap_or_default().to_owned();
        if text.is_empty() {
            // Unset; fall through to the dependents.
        } else {
            return Linkage::parse(&text).ok_or_else(|| {
                ModelError::Config(format!(
                    "invalid value '{text}' for {key}, expected 'static' or 'shared'"
                ))
            });
        }
    }
    let mut seen: Option<Linkage> = None;
    for dependent in session.dependents(target) {
        let Some(value) = session.target(dependent).props().get(key) else {
            continue;
        };
        let Some(wanted) = value.as_str().and_then(Linkage::parse) else {
            continue;
        };
        match seen {
            None => seen = Some(wanted),
            Some(previous) if previous != wanted => {
                tracing::warn!(
                    target = %session.target(target).long_name(),
                    "dependents disagree on preferred linkage; defaulting to static"
                );
                return Ok(Linkage::Static);
            }
            Some(_) => {}
        }
    }
    Ok(seen.unwrap_or(Linkage::Static))
}

/// Resolve the debug flag: an explicit value wins, otherwise true when any
/// dependent builds for debug.
#[must_use]
pub fn resolve_debug(session: &Session, target: TargetId, key: &str) -> bool {
    if let Some(value) = session.target(target).props().get(key) {
        return value.as_bool().unwrap_or(false);
    }
    session
        .dependents(target)
        .iter()
        .any(|&dependent| {
            session
                .target(dependent)
                .props()
                .get(key)
                .and_then(crate::props::PropValue::as_bool)
                .unwrap_or(false)
        })
}

/// Optimisation profile accepted by the build options.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Optimize {
    /// Optimise for execution speed.
    Speed,
    /// Optimise for binary size.
    Size,
    /// No optimisation.
    None,
}

impl Optimize {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "speed" => Some(Self::Speed),
            "size" => Some(Self::Size),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Resolve the optimisation profile: explicit value, then the first
/// dependent with a setting, then session configuration, then `speed`.
///
/// # Errors
///
/// Invalid values are fatal.
pub fn resolve_optimize(
    session: &Session,
    target: TargetId,
    key: &str,
) -> Result<Optimize, ModelError> {
    let parse = |text: &str| {
        Optimize::parse(text).ok_or_else(|| {
            ModelError::Config(format!(
                "invalid value '{text}' for {key}, expected 'speed', 'size' or 'none'"
            ))
        })
    };
    if let Some(value) = session.target(target).props().get(key)
        && let Some(text) = value.as_str()
        && !text.is_empty()
    {
        return parse(text);
    }
    for dependent in session.dependents(target) {
        if let Some(value) = session.target(dependent).props().get(key)
            && let Some(text) = value.as_str()
            && !text.is_empty()
        {
            return parse(text);
        }
    }
    if let Some(value) = session.config(key)
        && let Some(text) = value.as_str()
    {
        return parse(text);
    }
    Ok(Optimize::Speed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionBuilder;
    use crate::model::{ModelError, TargetTrait, TraitCtx};
    use semver::Version;

    #[derive(Debug)]
    struct CountingTrait;

    impl TargetTrait for CountingTrait {
        fn kind(&self) -> &'static str {
            "counting"
        }

        fn translate(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
            ctx.add_action(ActionBuilder::new().name("work").deps(Vec::new()))?;
            Ok(())
        }
    }

    fn session_with(names: &[&str]) -> (Session, Vec<TargetId>) {
        let mut session = Session::new("build");
        session.get_or_create_cell("test", Version::new(1, 0, 0), "test".into());
        let ids = names
            .iter()
            .map(|name| {
                let id = session
                    .create_target("test", name, false, false)
                    .expect("create");
                session
                    .set_main_trait(id, Box::new(CountingTrait))
                    .expect("trait");
                id
            })
            .collect();
        (session, ids)
    }

    #[test]
    fn lowering_is_idempotent() {
        let (mut session, ids) = session_with(&["a"]);
        lower(&mut session, &ids).expect("first run");
        lower(&mut session, &ids).expect("second run");
        let target = session.target(*ids.first().expect("id"));
        assert_eq!(target.actions().len(), 1);
        assert!(target.is_completed());
        assert!(target.is_translated());
    }

    #[test]
    fn cycles_are_reported_with_their_path() {
        let (mut session, ids) = session_with(&["a", "b"]);
        let (a, b) = (ids[0], ids[1]);
        session.set_deps(a, Vec::new(), vec![b]).expect("deps");
        session.set_deps(b, Vec::new(), vec![a]).expect("deps");
        let err = lower(&mut session, &[a]).expect_err("cycle");
        match err {
            PipelineError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"//test:a".to_owned()));
                assert!(path.contains(&"//test:b".to_owned()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn properties_are_sealed_after_complete() {
        use crate::props::{PropDef, PropKind, PropValue};
        let (mut session, ids) = session_with(&["a"]);
        session
            .schema
            .register(PropDef::new("x.flag", PropKind::String))
            .expect("register");
        lower(&mut session, &ids).expect("lower");
        let err = session
            .set_prop(ids[0], "x.flag", PropValue::String("v".into()))
            .expect_err("sealed");
        assert!(matches!(
            err,
            ModelError::Prop(crate::props::PropError::Sealed(_))
        ));
    }

    #[test]
    fn conflicting_linkage_defaults_to_static() {
        use crate::props::{PropDef, PropKind, PropValue};
        let (mut session, ids) = session_with(&["lib", "app1", "app2"]);
        let key = "cxx.preferred_linkage";
        session
            .schema
            .register(PropDef::new(key, PropKind::String))
            .expect("register");
        session
            .set_deps(ids[1], Vec::new(), vec![ids[0]])
            .expect("deps");
        session
            .set_deps(ids[2], Vec::new(), vec![ids[0]])
            .expect("deps");
        session
            .set_prop(ids[1], key, PropValue::String("static".into()))
            .expect("set");
        session
            .set_prop(ids[2], key, PropValue::String("shared".into()))
            .expect("set");
        let linkage = resolve_preferred_linkage(&session, ids[0], key).expect("resolve");
        assert_eq!(linkage, Linkage::Static);
    }

    #[test]
    fn optimize_falls_back_through_dependents_and_config() {
        use crate::props::{PropDef, PropKind, PropValue};
        let (mut session, ids) = session_with(&["lib", "app"]);
        let key = "build.optimize";
        session
            .schema
            .register(PropDef::new(key, PropKind::String))
            .expect("register");
        session
            .set_deps(ids[1], Vec::new(), vec![ids[0]])
            .expect("deps");

        assert_eq!(
            resolve_optimize(&session, ids[0], key).expect("default"),
            Optimize::Speed
        );

        session.set_config(key, crate::model::ConfigValue::String("size".into()));
        assert_eq!(
            resolve_optimize(&session, ids[0], key).expect("config"),
            Optimize::Size
        );

        session
            .set_prop(ids[1], key, PropValue::String("none".into()))
            .expect("set");
        assert_eq!(
            resolve_optimize(&session, ids[0], key).expect("dependent"),
            Optimize::None
        );

        session
            .set_prop(ids[0], key, PropValue::String("bogus".into()))
            .expect("set");
        assert!(resolve_optimize(&session, ids[0], key).is_err());
    }
}
