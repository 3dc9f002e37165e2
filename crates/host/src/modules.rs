//! Constrained module resolution and loading.
//!
//! Two specifier shapes exist: `sage:` builtins, which pass through
//! untouched, and relative imports, which are joined against the importer's
//! directory, realpath'd, and refused unless the result stays inside the
//! plugin's module root.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Exception, Module, Result as JsResult};

use crate::registry::MODULE_SCHEME;
use crate::state::SharedRef;
use sandbox::paths;

/// Longest accepted joined module path, in bytes.
pub(crate) const MAX_SPECIFIER_BYTES: usize = 8192;

/// Where a normalized specifier points.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolved {
    Builtin(String),
    File(PathBuf),
}

/// Pure normalization: scheme passthrough, relative-only specifiers, realpath
/// containment inside `root`.
pub(crate) fn normalize(root: &Path, base: &str, name: &str) -> Result<Resolved> {
    if name.starts_with(MODULE_SCHEME) {
        return Ok(Resolved::Builtin(name.to_string()));
    }
    if !name.starts_with('.') {
        bail!("module specifier must be relative or a `{MODULE_SCHEME}` builtin: {name}");
    }
    if base.starts_with(MODULE_SCHEME) {
        bail!("builtin modules cannot use relative imports");
    }

    let base_dir = Path::new(base).parent().unwrap_or_else(|| Path::new("."));
    let joined = base_dir.join(name);
    if joined.as_os_str().len() > MAX_SPECIFIER_BYTES {
        bail!("module path too long");
    }
    let resolved = match paths::canonicalize(&joined) {
        Ok(p) => p,
        Err(_) => bail!("module not found: {name}"),
    };
    if !paths::contains(root, &resolved) {
        bail!("import {name} escapes plugin root");
    }
    Ok(Resolved::File(resolved))
}

/// Resolver bound to one plugin's module root.
pub(crate) struct SageResolver {
    pub root: PathBuf,
}

impl Resolver for SageResolver {
    fn resolve<'js>(&mut self, ctx: &Ctx<'js>, base: &str, name: &str) -> JsResult<String> {
        match normalize(&self.root, base, name) {
            Ok(Resolved::Builtin(name)) => Ok(name),
            Ok(Resolved::File(path)) => Ok(path.to_string_lossy().into_owned()),
            Err(err) => Err(Exception::throw_message(ctx, &err.to_string())),
        }
    }
}

/// Loader for resolved names: registered source for builtins, file contents
/// otherwise. Compilation is declaration-only; evaluation happens under the
/// plugin's load budget.
pub(crate) struct SageLoader {
    pub shared: SharedRef,
}

impl Loader for SageLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> JsResult<Module<'js, Declared>> {
        if name.starts_with(MODULE_SCHEME) {
            let source = {
                let shared = self.shared.borrow();
                shared.builtins.get(name).map(str::to_string)
            };
            let Some(source) = source else {
                return Err(Exception::throw_message(
                    ctx,
                    &format!("unknown builtin module: {name}"),
                ));
            };
            return Module::declare(ctx.clone(), name, source);
        }
        let source = std::fs::read(name).map_err(|err| {
            Exception::throw_message(ctx, &format!("failed to read module {name}: {err}"))
        })?;
        Module::declare(ctx.clone(), name, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();
        fs::write(root.join("plugin.js"), "export {};").unwrap();
        fs::create_dir(root.join("lib")).unwrap();
        fs::write(root.join("lib/util.js"), "export {};").unwrap();
        (tmp, root)
    }

    #[test]
    fn builtins_pass_through() {
        let (_tmp, root) = setup();
        let base = root.join("plugin.js").display().to_string();
        assert_eq!(
            normalize(&root, &base, "sage:util").unwrap(),
            Resolved::Builtin("sage:util".to_string())
        );
    }

    #[test]
    fn relative_imports_resolve_inside_the_root() {
        let (_tmp, root) = setup();
        let base = root.join("plugin.js").display().to_string();
        let resolved = normalize(&root, &base, "./lib/util.js").unwrap();
        assert_eq!(resolved, Resolved::File(root.join("lib/util.js")));
    }

    #[test]
    fn bare_specifiers_are_refused() {
        let (_tmp, root) = setup();
        let base = root.join("plugin.js").display().to_string();
        let err = normalize(&root, &base, "lodash").unwrap_err();
        assert!(err.to_string().contains("must be relative"));
    }

    #[test]
    fn escapes_are_refused() {
        let (_tmp, root) = setup();
        // A sibling of the root that really exists, reached via `..`.
        let outside = root.parent().unwrap().join("outside.js");
        fs::write(&outside, "export {};").unwrap();
        let base = root.join("plugin.js").display().to_string();
        let err = normalize(&root, &base, "../outside.js").unwrap_err();
        assert!(err.to_string().contains("escapes plugin root"));
    }

    #[test]
    fn symlinks_out_of_the_root_are_refused() {
        let (_tmp, root) = setup();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("evil.js"), "export {};").unwrap();
        std::os::unix::fs::symlink(outside.path().join("evil.js"), root.join("evil.js")).unwrap();
        let base = root.join("plugin.js").display().to_string();
        let err = normalize(&root, &base, "./evil.js").unwrap_err();
        assert!(err.to_string().contains("escapes plugin root"));
    }

    #[test]
    fn builtin_importers_cannot_go_relative() {
        let (_tmp, root) = setup();
        let err = normalize(&root, "sage:util", "./x.js").unwrap_err();
        assert!(err.to_string().contains("builtin modules"));
    }

    #[test]
    fn missing_modules_are_reported() {
        let (_tmp, root) = setup();
        let base = root.join("plugin.js").display().to_string();
        let err = normalize(&root, &base, "./nope.js").unwrap_err();
        assert!(err.to_string().contains("module not found"));
    }
}
