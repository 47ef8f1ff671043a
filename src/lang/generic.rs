//! Generic command targets.
//!
//! A `generic.build` target runs explicit command lists with declared
//! inputs and outputs. It is the smallest trait that exercises the whole
//! lowering machinery (foreach, environment overlays, working directories)
//! and the workhorse of portable end-to-end tests.

use camino::Utf8PathBuf;
use indexmap::IndexMap;

use crate::action::{ActionBuilder, TaggedPath};
use crate::model::{Factory, ModelError, Session, TargetArgs, TargetId, TargetTrait, TraitCtx};
use crate::shell;

/// Factory for `generic.build` targets.
pub struct GenericFactory;

impl Factory for GenericFactory {
    fn kind(&self) -> &'static str {
        "generic.build"
    }

    fn instantiate(
        &self,
        _session: &mut Session,
        _target: TargetId,
        args: &TargetArgs,
    ) -> Result<Box<dyn TargetTrait>, ModelError> {
        let mut trait_obj = GenericTrait::default();
        for (key, value) in &args.props {
            match key.as_str() {
                "commands" => trait_obj.commands = parse_commands(value)?,
                "inputs" => trait_obj.inputs = parse_paths(key, value)?,
                "outputs" => trait_obj.outputs = parse_paths(key, value)?,
                "optional_outputs" => trait_obj.optional_outputs = parse_paths(key, value)?,
                "environ" => trait_obj.environ = parse_environ(value)?,
                "cwd" => {
                    trait_obj.cwd = value.as_str().map(Utf8PathBuf::from);
                }
                "foreach" => trait_obj.foreach = value.as_bool().unwrap_or(false),
                other => {
                    tracing::warn!(key = other, "unused option for generic.build target");
                }
            }
        }
        if trait_obj.commands.is_empty() {
            return Err(ModelError::Config(
                "generic.build requires at least one command".into(),
            ));
        }
        Ok(Box::new(trait_obj))
    }
}

/// Trait implementation for `generic.build`.
#[derive(Debug, Default)]
pub struct GenericTrait {
    commands: Vec<Vec<String>>,
    inputs: Vec<Utf8PathBuf>,
    outputs: Vec<Utf8PathBuf>,
    optional_outputs: Vec<Utf8PathBuf>,
    environ: IndexMap<String, String>,
    cwd: Option<Utf8PathBuf>,
    foreach: bool,
}

impl TargetTrait for GenericTrait {
    fn kind(&self) -> &'static str {
        "generic.build"
    }

    fn complete(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
        self.inputs = self.inputs.iter().map(|p| ctx.source_path(p)).collect();
        self.outputs = self.outputs.iter().map(|p| ctx.build_path(p)).collect();
        self.optional_outputs = self
            .optional_outputs
            .iter()
            .map(|p| ctx.build_path(p))
            .collect();
        if let Some(cwd) = &self.cwd {
            self.cwd = Some(ctx.source_path(cwd));
        }
        Ok(())
    }

    fn translate(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
        let mut builder = ActionBuilder::new()
            .inputs(self.inputs.iter().cloned())
            .outputs(self.outputs.iter().cloned())
            .foreach(self.foreach);
        for output in &self.optional_outputs {
            builder = builder.output(TaggedPath::tagged(output.clone(), "optional"));
        }
        for command in &self.commands {
            builder = builder.command(command.clone());
        }
        for (key, value) in &self.environ {
            builder = builder.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            builder = builder.cwd(cwd.clone());
        }
        ctx.add_action(builder)?;
        Ok(())
    }
}

fn parse_commands(value: &serde_json::Value) -> Result<Vec<Vec<String>>, ModelError> {
    let items = value
        .as_array()
        .ok_or_else(|| ModelError::Config("'commands' must be a list".into()))?;
    let mut commands = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::String(line) => {
                let argv = shell::split(line).ok_or_else(|| {
                    ModelError::Config(format!("unparsable command line: {line}"))
                })?;
                commands.push(argv);
            }
            serde_json::Value::Array(args) => {
                let argv = args
                    .iter()
                    .map(|a| a.as_str().map(str::to_owned))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        ModelError::Config("command argv entries must be strings".into())
                    })?;
                commands.push(argv);
            }
            _ => {
                return Err(ModelError::Config(
                    "'commands' entries must be strings or argv lists".into(),
                ));
            }
        }
    }
    Ok(commands)
}

fn parse_paths(key: &str, value: &serde_json::Value) -> Result<Vec<Utf8PathBuf>, ModelError> {
    match value {
        serde_json::Value::String(s) => Ok(vec![Utf8PathBuf::from(s)]),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str().map(Utf8PathBuf::from).ok_or_else(|| {
                    ModelError::Config(format!("'{key}' entries must be strings"))
                })
            })
            .collect(),
        _ => Err(ModelError::Config(format!(
            "'{key}' must be a string or list of strings"
        ))),
    }
}

fn parse_environ(value: &serde_json::Value) -> Result<IndexMap<String, String>, ModelError> {
    let map = value
        .as_object()
        .ok_or_else(|| ModelError::Config("'environ' must be a mapping".into()))?;
    map.iter()
        .map(|(key, v)| {
            v.as_str()
                .map(|s| (key.clone(), s.to_owned()))
                .ok_or_else(|| ModelError::Config("'environ' values must be strings".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::declare;
    use crate::pipeline;
    use semver::Version;

    fn declare_generic(props: serde_json::Value) -> (Session, TargetId) {
        let mut session = Session::new("/build");
        session.get_or_create_cell("app", Version::new(1, 0, 0), "/src/app".into());
        let props = props
            .as_object()
            .expect("object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let id = declare(
            &mut session,
            &GenericFactory,
            "app",
            TargetArgs {
                name: "gen".into(),
                props,
                ..TargetArgs::default()
            },
        )
        .expect("declare");
        (session, id)
    }

    #[test]
    fn translates_into_one_action_with_resolved_paths() {
        let (mut session, id) = declare_generic(serde_json::json!({
            "commands": [["touch", "${@out}"]],
            "inputs": ["main.c"],
            "outputs": ["main.out"],
        }));
        pipeline::lower(&mut session, &[id]).expect("lower");
        let target = session.target(id);
        let action = target.actions().get("0").expect("action");
        assert_eq!(action.inputs.first().map(|f| f.path.as_str()), Some("/src/app/main.c"));
        assert_eq!(
            action.outputs.first().map(|f| f.path.as_str()),
            Some("/build/cells/app/main.out")
        );
    }

    #[test]
    fn string_commands_are_shell_split() {
        let commands = parse_commands(&serde_json::json!(["echo 'hello world'"])).expect("parse");
        assert_eq!(commands, vec![vec!["echo".to_owned(), "hello world".to_owned()]]);
    }

    #[test]
    fn missing_commands_are_rejected() {
        let mut session = Session::new("/build");
        session.get_or_create_cell("app", Version::new(1, 0, 0), "/src/app".into());
        let result = declare(
            &mut session,
            &GenericFactory,
            "app",
            TargetArgs {
                name: "gen".into(),
                ..TargetArgs::default()
            },
        );
        assert!(matches!(result, Err(ModelError::Config(_))));
    }
}
