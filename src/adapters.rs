//! The contract between the core and compiler adapters.
//!
//! Language support is provided by collaborators implementing
//! [`CompilerAdapter`]. The core never hard-codes compiler flags: traits
//! assemble a [`CompileData`] or [`LinkData`] from resolved properties and
//! ask the adapter for argv lists. Returned commands may contain the
//! substitution tokens `${<in}` and `${@out}` (resolved by the build slave
//! per build set) and `%ARG%` (resolved by the adapter's own [`expand`]).

use camino::{Utf8Path, Utf8PathBuf};

use crate::action::TaggedPath;
use crate::model::ModelError;
use crate::outname::MacroContext;
use crate::pathutil;
use crate::pipeline::Optimize;
use crate::props::Schema;

/// Source language of a translation unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lang {
    /// Plain C.
    C,
    /// C++.
    Cpp,
}

impl Lang {
    /// Guess the language from a source file extension.
    #[must_use]
    pub fn from_source(path: &Utf8Path) -> Self {
        match path.extension() {
            Some("cc" | "cpp" | "cxx" | "c++" | "C") => Self::Cpp,
            _ => Self::C,
        }
    }

    /// Lowercase identifier used in action names (`compile_c`).
    #[must_use]
    pub fn ident(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }
}

/// What a link step produces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProductKind {
    /// An executable.
    Executable,
    /// A shared object / DLL.
    SharedLibrary,
    /// A static archive.
    StaticLibrary,
}

/// Resolved inputs for one compile command.
#[derive(Clone, Debug)]
pub struct CompileData {
    /// Source language.
    pub lang: Lang,
    /// Emit debug information.
    pub debug: bool,
    /// Optimisation profile.
    pub optimize: Optimize,
    /// Compile position-independent code.
    pub pic: bool,
    /// Include search paths.
    pub includes: Vec<Utf8PathBuf>,
    /// Preprocessor definitions.
    pub defines: Vec<String>,
    /// Extra compiler flags, passed through verbatim.
    pub flags: Vec<String>,
}

/// Resolved inputs for one link command.
#[derive(Clone, Debug)]
pub struct LinkData {
    /// Language of the link driver.
    pub lang: Lang,
    /// Product kind.
    pub kind: ProductKind,
    /// The product file.
    pub product: Utf8PathBuf,
    /// Object files to link.
    pub objects: Vec<Utf8PathBuf>,
    /// Libraries and archives produced by dependencies, in link order.
    pub link_products: Vec<Utf8PathBuf>,
    /// System libraries (`-l` style names).
    pub syslibs: Vec<String>,
    /// Extra linker flags, passed through verbatim.
    pub flags: Vec<String>,
}

/// A language adapter.
///
/// Implementations are stateless and shared; per-target state lives in the
/// properties the adapter registers via [`CompilerAdapter::init`].
pub trait CompilerAdapter: std::fmt::Debug + Send + Sync {
    /// Adapter identifier, e.g. `gcc`.
    fn id(&self) -> &'static str;

    /// Register the per-target properties this adapter consumes.
    ///
    /// # Errors
    ///
    /// Fails on conflicting property definitions.
    fn init(&self, schema: &mut Schema) -> Result<(), ModelError> {
        let _ = schema;
        Ok(())
    }

    /// Define the output-name macros (`lib`, `ext`, `obj`) for a product of
    /// `kind`.
    fn init_macro_context(&self, ctx: &mut MacroContext, kind: ProductKind);

    /// The argv for one compile; inputs and outputs appear as `${<in}` and
    /// `${@out}`.
    fn get_compile_command(&self, data: &CompileData) -> Vec<String>;

    /// The argv for the link step; objects and product are spelled out.
    fn get_link_command(&self, data: &LinkData) -> Vec<String>;

    /// The argv for a one-step compile-and-link (used by foreach builds
    /// that produce one executable per source).
    fn get_build_command(&self, compile: &CompileData, link: &LinkData) -> Vec<String>;

    /// The object file path for `source` under `objdir`.
    fn add_objects_for_source(&self, objdir: &Utf8Path, source: &Utf8Path) -> Utf8PathBuf {
        pathutil::setsuffix(&objdir.join(source.file_name().unwrap_or("src")), ".o")
    }

    /// Extra outputs of the link step (import libraries, debug files).
    /// Files tagged `optional` may be absent after a successful link.
    fn add_link_outputs(&self, data: &LinkData, outputs: &mut Vec<TaggedPath>) {
        let _ = (data, outputs);
    }
}

/// Expand `%ARG%` in a flag template. With no value, templates that require
/// an argument are dropped entirely.
#[must_use]
pub fn expand(args: &[&str], value: Option<&str>) -> Vec<String> {
    match value {
        Some(value) => args.iter().map(|a| a.replace("%ARG%", value)).collect(),
        None => args
            .iter()
            .filter(|a| !a.contains("%ARG%"))
            .map(|a| (*a).to_owned())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("main.c", Lang::C)]
    #[case("main.cpp", Lang::Cpp)]
    #[case("main.cc", Lang::Cpp)]
    #[case("weird.h", Lang::C)]
    fn language_detection_by_extension(#[case] path: &str, #[case] expected: Lang) {
        assert_eq!(Lang::from_source(Utf8Path::new(path)), expected);
    }

    #[test]
    fn expand_substitutes_and_drops() {
        assert_eq!(expand(&["-I%ARG%"], Some("include")), vec!["-Iinclude"]);
        assert_eq!(expand(&["-I%ARG%", "-c"], None), vec!["-c"]);
    }
}
