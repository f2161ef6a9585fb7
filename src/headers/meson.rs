//! Header-install extraction from `meson.build` files without running Meson.
//!
//! Meson has to configure a project before it can say what it installs,
//! and configuring needs headers that other projects install: a cycle on a
//! fresh checkout. Instead each `install_headers()` directive is evaluated
//! on its own. When it references a variable, the last top-level assignment
//! to that variable before the directive is evaluated in isolation and the
//! directive retried. Only one level of indirection is followed.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::eval::{EvalError, Evaluator, HeaderInstall, Value};
use super::parser::{parse, Args, AssignOp, Expr, Stmt};
use crate::error::BuildError;

/// Identifies a description format and the revision of our reading of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptionFormat {
    pub name: &'static str,
    pub version: u32,
}

/// A header copied from a unit's sources into the staged root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInstallMapping {
    pub source: PathBuf,
    /// Relative to the staged root.
    pub destination: PathBuf,
}

/// A foreign build system's description of one build unit.
pub trait BuildDescription {
    fn format(&self) -> DescriptionFormat;

    /// Every header the unit installs. A unit that installs none yields an
    /// empty list.
    fn list_header_installations(&self) -> Result<Vec<HeaderInstallMapping>>;
}

/// A parsed `meson.build`.
#[derive(Debug, Clone)]
pub struct MesonDescription {
    path: PathBuf,
    source_dir: PathBuf,
    statements: Vec<Stmt>,
}

impl MesonDescription {
    pub const FORMAT: DescriptionFormat = DescriptionFormat {
        name: "meson",
        version: 1,
    };

    pub fn load(path: &Path) -> Result<Self> {
        let source =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(path, &source)
    }

    /// Parse `source` as the contents of `path`.
    pub fn parse(path: &Path, source: &str) -> Result<Self> {
        let statements = parse(source).map_err(|e| BuildError::ForeignDescriptionParseFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let source_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            source_dir,
            statements,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names passed to `subproject('<name>')` anywhere in the description.
    pub fn subproject_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for stmt in &self.statements {
            visit_stmt(stmt, &mut |expr| {
                if let Expr::Call { name, args } = expr {
                    if name == "subproject" {
                        if let Some(Expr::Str(project)) = args.positional.first() {
                            if !names.contains(project) {
                                names.push(project.clone());
                            }
                        }
                    }
                }
            });
        }
        names
    }

    fn failure(&self, reason: impl Into<String>) -> anyhow::Error {
        BuildError::ForeignDescriptionParseFailure {
            path: self.path.clone(),
            reason: reason.into(),
        }
        .into()
    }

    /// Evaluate the directive at `index`, resolving unknown identifiers from
    /// earlier top-level assignments.
    fn evaluate_directive(&self, index: usize, call: &Expr) -> Result<HeaderInstall> {
        let mut evaluator = Evaluator::new(&self.source_dir);
        let mut attempted = HashSet::new();
        loop {
            match evaluator.eval(call) {
                Ok(Value::Headers(install)) => return Ok(install),
                Ok(other) => {
                    return Err(self.failure(format!("install_headers() produced {other}")))
                }
                Err(EvalError::UnknownVariable(name)) => {
                    if !attempted.insert(name.clone()) {
                        return Err(self.failure(format!("unresolved identifier '{name}'")));
                    }
                    let value = self.resolve(&name, index)?;
                    debug!("{}: resolved '{name}'", self.path.display());
                    evaluator.bind(name, value);
                }
                Err(e) => return Err(self.failure(e.to_string())),
            }
        }
    }

    /// Evaluate the last `name = ...` before statement `before`, plus any
    /// `name += ...` between it and `before`, with no other bindings.
    fn resolve(&self, name: &str, before: usize) -> Result<Value> {
        let preceding = &self.statements[..before];
        let start = preceding
            .iter()
            .rposition(|stmt| {
                matches!(stmt, Stmt::Assign { target, op: AssignOp::Set, .. } if target == name)
            })
            .ok_or_else(|| self.failure(format!("unresolved identifier '{name}'")))?;

        let mut isolated = Evaluator::new(&self.source_dir);
        for stmt in &preceding[start..] {
            let Stmt::Assign { target, op, value } = stmt else {
                continue;
            };
            if target != name {
                continue;
            }
            isolated.assign(target, *op, value).map_err(|e| match e {
                EvalError::UnknownVariable(inner) => self.failure(format!(
                    "unresolved identifier '{inner}' (needed to resolve '{name}')"
                )),
                other => self.failure(other.to_string()),
            })?;
        }
        isolated
            .get(name)
            .cloned()
            .ok_or_else(|| self.failure(format!("unresolved identifier '{name}'")))
    }
}

impl BuildDescription for MesonDescription {
    fn format(&self) -> DescriptionFormat {
        Self::FORMAT
    }

    fn list_header_installations(&self) -> Result<Vec<HeaderInstallMapping>> {
        let mut mappings = Vec::new();
        for (index, stmt) in self.statements.iter().enumerate() {
            let Some(call) = install_headers_call(stmt) else {
                continue;
            };
            let install = self.evaluate_directive(index, call)?;
            mappings.extend(mappings_for(&install));
        }
        Ok(mappings)
    }
}

/// A top-level `install_headers(...)`, bare or assigned.
fn install_headers_call(stmt: &Stmt) -> Option<&Expr> {
    let expr = match stmt {
        Stmt::Expr(expr) => expr,
        Stmt::Assign { value, .. } => value,
        _ => return None,
    };
    match expr {
        Expr::Call { name, .. } if name == "install_headers" => Some(expr),
        _ => None,
    }
}

fn mappings_for(install: &HeaderInstall) -> Vec<HeaderInstallMapping> {
    let dir = match (&install.install_dir, &install.subdir) {
        (Some(dir), _) => staged_relative(Path::new(dir)),
        (None, Some(subdir)) => Path::new("usr/include").join(subdir),
        (None, None) => PathBuf::from("usr/include"),
    };
    install
        .headers
        .iter()
        .map(|header| {
            let name = if install.preserve_path {
                header.relative.clone()
            } else {
                header
                    .relative
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| header.relative.clone())
            };
            HeaderInstallMapping {
                source: header.path.clone(),
                destination: dir.join(name),
            }
        })
        .collect()
}

/// Absolute install paths are taken relative to the staged root.
fn staged_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

fn visit_stmt(stmt: &Stmt, f: &mut dyn FnMut(&Expr)) {
    match stmt {
        Stmt::Expr(expr) => visit_expr(expr, f),
        Stmt::Assign { value, .. } => visit_expr(value, f),
        Stmt::If {
            branches,
            otherwise,
        } => {
            for (condition, body) in branches {
                visit_expr(condition, f);
                body.iter().for_each(|s| visit_stmt(s, f));
            }
            if let Some(body) = otherwise {
                body.iter().for_each(|s| visit_stmt(s, f));
            }
        }
        Stmt::Foreach { iterable, body, .. } => {
            visit_expr(iterable, f);
            body.iter().for_each(|s| visit_stmt(s, f));
        }
        Stmt::Break | Stmt::Continue => {}
    }
}

fn visit_expr(expr: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::Array(items) => items.iter().for_each(|e| visit_expr(e, f)),
        Expr::Dict(entries) => entries.iter().for_each(|(k, v)| {
            visit_expr(k, f);
            visit_expr(v, f);
        }),
        Expr::Call { args, .. } => visit_args(args, f),
        Expr::Method { receiver, args, .. } => {
            visit_expr(receiver, f);
            visit_args(args, f);
        }
        Expr::Index { target, index } => {
            visit_expr(target, f);
            visit_expr(index, f);
        }
        Expr::Unary { operand, .. } => visit_expr(operand, f),
        Expr::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            visit_expr(condition, f);
            visit_expr(then, f);
            visit_expr(otherwise, f);
        }
        Expr::Str(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Ident(_) => {}
    }
}

fn visit_args(args: &Args, f: &mut dyn FnMut(&Expr)) {
    for arg in args
        .positional
        .iter()
        .chain(args.keyword.iter().map(|(_, v)| v))
    {
        visit_expr(arg, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(source: &str) -> MesonDescription {
        MesonDescription::parse(Path::new("/src/programs/libgui/meson.build"), source).unwrap()
    }

    fn destinations(mappings: &[HeaderInstallMapping]) -> Vec<String> {
        mappings
            .iter()
            .map(|m| m.destination.display().to_string())
            .collect()
    }

    fn failure_reason(err: &anyhow::Error) -> String {
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ForeignDescriptionParseFailure { reason, .. }) => reason.clone(),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn format_is_versioned() {
        assert_eq!(describe("").format(), MesonDescription::FORMAT);
    }

    #[test]
    fn direct_install_headers_with_subdir() {
        let desc = describe("project('libgui', 'c')\ninstall_headers('libgui.h', 'gui_view.h', subdir: 'libgui')\n");
        let mappings = desc.list_header_installations().unwrap();
        assert_eq!(destinations(&mappings), ["usr/include/libgui/libgui.h", "usr/include/libgui/gui_view.h"]);
        assert_eq!(mappings[0].source, PathBuf::from("/src/programs/libgui/libgui.h"));
    }

    #[test]
    fn resolves_one_level_reference() {
        let desc = describe(
            "\
project('libagx', 'c')
lib_headers = files('lib/point.h', 'lib/color.h')
lib = static_library('agx', sources)
install_headers(lib_headers, install_dir: '/usr/include/agx/lib')
",
        );
        let mappings = desc.list_header_installations().unwrap();
        assert_eq!(
            destinations(&mappings),
            ["usr/include/agx/lib/point.h", "usr/include/agx/lib/color.h"]
        );
    }

    #[test]
    fn resolves_appended_assignments() {
        let desc = describe(
            "\
hdrs = ['a.h']
hdrs += ['b.h']
install_headers(hdrs)
",
        );
        let mappings = desc.list_header_installations().unwrap();
        assert_eq!(destinations(&mappings), ["usr/include/a.h", "usr/include/b.h"]);
    }

    #[test]
    fn two_level_indirection_fails() {
        let desc = describe(
            "\
base = 'lib'
hdrs = files(base / 'point.h')
install_headers(hdrs)
",
        );
        let err = desc.list_header_installations().unwrap_err();
        let reason = failure_reason(&err);
        assert!(reason.contains("'base'"), "{reason}");
        assert!(reason.contains("'hdrs'"), "{reason}");
    }

    #[test]
    fn later_assignment_does_not_count() {
        let desc = describe("install_headers(hdrs)\nhdrs = files('a.h')\n");
        let err = desc.list_header_installations().unwrap_err();
        assert!(failure_reason(&err).contains("unresolved identifier 'hdrs'"));
    }

    #[test]
    fn preserve_path_keeps_relative_layout() {
        let desc = describe("install_headers('sys/types.h', 'stdio.h', preserve_path: true)\n");
        let mappings = desc.list_header_installations().unwrap();
        assert_eq!(destinations(&mappings), ["usr/include/sys/types.h", "usr/include/stdio.h"]);
    }

    #[test]
    fn assigned_directive_is_found() {
        let desc = describe("installed = install_headers('awm_messages.h', subdir: 'awm')\n");
        let mappings = desc.list_header_installations().unwrap();
        assert_eq!(destinations(&mappings), ["usr/include/awm/awm_messages.h"]);
    }

    #[test]
    fn no_directive_is_empty() {
        let desc = describe("project('cat', 'c')\nexecutable('cat', 'main.c', install: true)\n");
        assert!(desc.list_header_installations().unwrap().is_empty());
    }

    #[test]
    fn syntax_error_is_parse_failure() {
        let err = MesonDescription::parse(Path::new("/x/meson.build"), "install_headers(\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ForeignDescriptionParseFailure { .. })
        ));
    }

    #[test]
    fn subproject_names_are_collected() {
        let desc = describe(
            "\
project('axle programs', 'c')
libc = subproject('libc')
if get_option('with_gui')
  subproject('libgui')
endif
foreach p : ['awm']
  subproject(p)
endforeach
subproject('libc')
",
        );
        assert_eq!(desc.subproject_names(), ["libc", "libgui"]);
    }
}
