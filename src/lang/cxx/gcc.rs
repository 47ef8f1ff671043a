//! GCC-style compiler adapter.

use crate::adapters::{CompileData, CompilerAdapter, Lang, LinkData, ProductKind, expand};
use crate::outname::MacroContext;
use crate::pipeline::Optimize;

/// Adapter for GCC and compatible drivers.
#[derive(Debug)]
pub struct GccAdapter {
    cc: String,
    cxx: String,
    ar: String,
}

impl GccAdapter {
    /// Pick the driver binaries from `CC`, `CXX` and `AR`, falling back to
    /// the usual names.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |key: &str, fallback: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| fallback.to_owned())
        };
        Self {
            cc: var("CC", "gcc"),
            cxx: var("CXX", "g++"),
            ar: var("AR", "ar"),
        }
    }

    fn driver(&self, lang: Lang) -> &str {
        match lang {
            Lang::C => &self.cc,
            Lang::Cpp => &self.cxx,
        }
    }

    fn compile_flags(data: &CompileData) -> Vec<String> {
        let mut argv = Vec::new();
        if data.debug {
            argv.push("-g".to_owned());
        }
        match data.optimize {
            Optimize::Speed => argv.push("-O3".to_owned()),
            Optimize::Size => argv.push("-Os".to_owned()),
            Optimize::None => {}
        }
        if data.pic {
            argv.push("-fPIC".to_owned());
        }
        for include in &data.includes {
            argv.extend(expand(&["-I%ARG%"], Some(include.as_str())));
        }
        for define in &data.defines {
            argv.extend(expand(&["-D%ARG%"], Some(define)));
        }
        argv.extend(data.flags.iter().cloned());
        argv
    }

    fn link_flags(data: &LinkData) -> Vec<String> {
        let mut argv = Vec::new();
        if data.kind == ProductKind::SharedLibrary {
            argv.push("-fPIC".to_owned());
            argv.push("-shared".to_owned());
        }
        argv.extend(data.link_products.iter().map(|p| p.as_str().to_owned()));
        for lib in &data.syslibs {
            argv.extend(expand(&["-l%ARG%"], Some(lib)));
        }
        argv.extend(data.flags.iter().cloned());
        argv
    }
}

impl CompilerAdapter for GccAdapter {
    fn id(&self) -> &'static str {
        "gcc"
    }

    fn init_macro_context(&self, ctx: &mut MacroContext, kind: ProductKind) {
        if kind == ProductKind::StaticLibrary || kind == ProductKind::SharedLibrary {
            let _ = ctx.define("lib", "lib$(0)");
        }
        let (plain, versioned): (&'static str, &'static str) = match kind {
            ProductKind::StaticLibrary => (".a", ".a."),
            ProductKind::SharedLibrary => (".so", ".so."),
            ProductKind::Executable => ("", "."),
        };
        ctx.define_fn("ext", move |args| match args.first() {
            Some(version) if !version.is_empty() => format!("{versioned}{version}"),
            _ => plain.to_owned(),
        });
        let _ = ctx.define("obj", ".o");
    }

    fn get_compile_command(&self, data: &CompileData) -> Vec<String> {
        let mut argv = vec![
            self.driver(data.lang).to_owned(),
            "-c".to_owned(),
            "${<in}".to_owned(),
            "-o".to_owned(),
            "${@out}".to_owned(),
        ];
        argv.extend(Self::compile_flags(data));
        argv
    }

    fn get_link_command(&self, data: &LinkData) -> Vec<String> {
        if data.kind == ProductKind::StaticLibrary {
            let mut argv = vec![
                self.ar.clone(),
                "rcs".to_owned(),
                data.product.as_str().to_owned(),
            ];
            argv.extend(data.objects.iter().map(|o| o.as_str().to_owned()));
            return argv;
        }
        let mut argv = vec![self.driver(data.lang).to_owned()];
        argv.extend(data.objects.iter().map(|o| o.as_str().to_owned()));
        argv.push("-o".to_owned());
        argv.push(data.product.as_str().to_owned());
        argv.extend(Self::link_flags(data));
        argv
    }

    fn get_build_command(&self, compile: &CompileData, link: &LinkData) -> Vec<String> {
        let mut argv = vec![
            self.driver(compile.lang).to_owned(),
            "${<in}".to_owned(),
            "-o".to_owned(),
            "${@out}".to_owned(),
        ];
        argv.extend(Self::compile_flags(compile));
        argv.extend(Self::link_flags(link));
        argv
    }

}
