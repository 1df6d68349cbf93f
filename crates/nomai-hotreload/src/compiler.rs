//! Source compiler: WAT text to validated, linked-checked modules.
//!
//! [`Compiler::compile`] never panics on bad input. A failed compilation is
//! an ordinary outcome reported as a [`CompileFailure`] carrying every
//! error-severity [`Diagnostic`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use wasmtime::{Engine, ExternType, Module, Mutability};

use crate::config::HotReloadConfig;
use crate::host_api::{HOST_FUNCTIONS, HOST_MODULE};
use crate::source::SourceUnit;
use crate::HotReloadError;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Text could not be parsed.
pub const E_SYNTAX: &str = "E0001";
/// Parsed, but not a valid module.
pub const E_VALIDATION: &str = "E0002";
/// An import has no matching host function or auxiliary export.
pub const E_UNRESOLVED_IMPORT: &str = "E0003";
/// An auxiliary module failed to compile.
pub const E_AUX: &str = "E0004";
/// A component global is immutable and cannot be saved across swaps.
pub const W_IMMUTABLE_FIELD: &str = "W0001";
/// The component has no `update` hook.
pub const W_NO_UPDATE: &str = "W0002";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// Where a diagnostic points. Line and column are 1-based and only known
/// for syntax errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        Ok(())
    }
}

/// One compiler message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub location: SourceLocation,
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn error(location: SourceLocation, code: &str, message: impl Into<String>) -> Self {
        Self {
            location,
            code: code.to_owned(),
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(location: SourceLocation, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(location, code, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{}: {level}[{}]: {}",
            self.location, self.code, self.message
        )
    }
}

/// A compilation that produced errors.
#[derive(Debug, Clone, thiserror::Error)]
#[error("component '{name}' failed to compile with {} error(s); first: {}", .diagnostics.len(), first_message(.diagnostics))]
pub struct CompileFailure {
    /// Logical component name.
    pub name: String,
    /// Error-severity diagnostics (warnings escalated when configured).
    pub diagnostics: Vec<Diagnostic>,
}

fn first_message(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<no diagnostics>".to_owned())
}

// ---------------------------------------------------------------------------
// CompiledModule
// ---------------------------------------------------------------------------

/// A compiled auxiliary module, importable under its logical name.
#[derive(Clone)]
pub struct AuxModule {
    pub name: String,
    pub module: Module,
}

impl fmt::Debug for AuxModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuxModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The immutable output of a successful compilation.
///
/// Replacing a component's code always produces a new `CompiledModule`.
pub struct CompiledModule {
    name: String,
    module: Module,
    aux: Vec<AuxModule>,
    digest: blake3::Hash,
    warnings: Vec<Diagnostic>,
}

impl CompiledModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn aux(&self) -> &[AuxModule] {
        &self.aux
    }

    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub(crate) fn into_parts(self) -> (String, Module, Vec<AuxModule>, blake3::Hash) {
        (self.name, self.module, self.aux, self.digest)
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.name)
            .field("aux", &self.aux)
            .field("digest", &self.digest.to_hex().as_str())
            .field("warnings", &self.warnings.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Compiles [`SourceUnit`]s against the host namespace and their auxiliaries.
#[derive(Clone)]
pub struct Compiler {
    engine: Engine,
    warnings_as_errors: bool,
}

impl Compiler {
    /// Build a compiler with a fuel-metered engine.
    pub fn new(config: &HotReloadConfig) -> Result<Self, HotReloadError> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);

        let engine = Engine::new(&engine_config)
            .map_err(|e| HotReloadError::Runtime(format!("failed to create Wasmtime engine: {e}")))?;

        Ok(Self {
            engine,
            warnings_as_errors: config.warnings_as_errors,
        })
    }

    /// The engine modules are compiled for. Stores instantiating them must
    /// use the same engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile a component and its auxiliary modules.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileFailure`] listing every error-severity diagnostic.
    pub fn compile(&self, unit: SourceUnit) -> Result<CompiledModule, CompileFailure> {
        let digest = unit.digest();
        let SourceUnit {
            name,
            path,
            text,
            aux: aux_sources,
        } = unit;

        let mut diagnostics = Vec::new();

        let mut aux = Vec::with_capacity(aux_sources.len());
        for source in aux_sources {
            let location = file_location(source.path.clone());
            match Module::new(&self.engine, &source.text) {
                Ok(module) => {
                    for import in module.imports() {
                        if import.module() != HOST_MODULE {
                            diagnostics.push(Diagnostic::error(
                                location.clone(),
                                E_UNRESOLVED_IMPORT,
                                format!(
                                    "auxiliary module '{}' imports '{}.{}'; auxiliaries may only import from '{HOST_MODULE}'",
                                    source.name,
                                    import.module(),
                                    import.name()
                                ),
                            ));
                        }
                    }
                    aux.push(AuxModule {
                        name: source.name,
                        module,
                    });
                }
                Err(e) => {
                    let (code, location) = classify_module_error(&e, source.path.clone());
                    diagnostics.push(Diagnostic::error(
                        location,
                        E_AUX,
                        format!(
                            "auxiliary module '{}' failed to compile ({code}): {}",
                            source.name,
                            headline(&e)
                        ),
                    ));
                }
            }
        }

        let module = match Module::new(&self.engine, &text) {
            Ok(module) => Some(module),
            Err(e) => {
                let (code, location) = classify_module_error(&e, path.clone());
                diagnostics.push(Diagnostic::error(location, code, headline(&e)));
                None
            }
        };
        drop(text);

        let mut warnings = Vec::new();
        if let Some(module) = &module {
            check_imports(module, &aux, &path, &mut diagnostics);
            check_component_exports(module, &name, &path, &mut warnings);
        }

        if self.warnings_as_errors {
            diagnostics.extend(warnings.drain(..).map(|w| Diagnostic {
                severity: Severity::Error,
                ..w
            }));
        }

        match module {
            Some(module) if diagnostics.is_empty() => {
                tracing::debug!(
                    component = %name,
                    aux = aux.len(),
                    warnings = warnings.len(),
                    digest = %digest.to_hex(),
                    "component compiled"
                );
                Ok(CompiledModule {
                    name,
                    module,
                    aux,
                    digest,
                    warnings,
                })
            }
            _ => Err(CompileFailure { name, diagnostics }),
        }
    }
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("warnings_as_errors", &self.warnings_as_errors)
            .finish_non_exhaustive()
    }
}

// -- Checks -----------------------------------------------------------------

/// Every import must be a known host function or an export of an auxiliary
/// module with the same kind.
fn check_imports(
    module: &Module,
    aux: &[AuxModule],
    path: &std::path::Path,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for import in module.imports() {
        let (ns, item) = (import.module(), import.name());
        let problem = if ns == HOST_MODULE {
            if !HOST_FUNCTIONS.contains(&item) {
                Some(format!("'{HOST_MODULE}' has no function named '{item}'"))
            } else if !matches!(import.ty(), ExternType::Func(_)) {
                Some(format!("'{HOST_MODULE}.{item}' is a function but is imported as another kind"))
            } else {
                None
            }
        } else if let Some(dep) = aux.iter().find(|a| a.name == ns) {
            match dep.module.get_export(item) {
                None => Some(format!("auxiliary module '{ns}' does not export '{item}'")),
                Some(export) if !same_kind(&export, &import.ty()) => Some(format!(
                    "'{ns}.{item}' is exported with a different kind than it is imported"
                )),
                Some(_) => None,
            }
        } else {
            Some(format!(
                "unknown import namespace '{ns}' (expected '{HOST_MODULE}' or an auxiliary module)"
            ))
        };

        if let Some(message) = problem {
            diagnostics.push(Diagnostic::error(
                file_location(path.to_path_buf()),
                E_UNRESOLVED_IMPORT,
                format!("unresolved import '{ns}.{item}': {message}"),
            ));
        }
    }
}

fn same_kind(a: &ExternType, b: &ExternType) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn check_component_exports(
    module: &Module,
    name: &str,
    path: &std::path::Path,
    warnings: &mut Vec<Diagnostic>,
) {
    let prefix = format!("{name}.");
    let mut has_members = false;
    let mut has_update = false;

    for export in module.exports() {
        let Some(member) = export.name().strip_prefix(&prefix) else {
            continue;
        };
        has_members = true;
        match export.ty() {
            ExternType::Func(_) if member == "update" => has_update = true,
            ExternType::Global(g) if g.mutability() == Mutability::Const => {
                warnings.push(Diagnostic::warning(
                    file_location(path.to_path_buf()),
                    W_IMMUTABLE_FIELD,
                    format!(
                        "global '{}' is immutable; it is not a field and will not survive swaps",
                        export.name()
                    ),
                ));
            }
            _ => {}
        }
    }

    if has_members && !has_update {
        warnings.push(Diagnostic::warning(
            file_location(path.to_path_buf()),
            W_NO_UPDATE,
            format!("component '{name}' has no '{name}.update' hook and will never run per frame"),
        ));
    }
}

// -- Error classification ---------------------------------------------------

fn file_location(file: PathBuf) -> SourceLocation {
    SourceLocation {
        file,
        line: None,
        column: None,
    }
}

/// Text parse errors render a ` --> file:line:col` marker; anything else
/// that failed `Module::new` is a validation error.
fn classify_module_error(error: &anyhow::Error, file: PathBuf) -> (&'static str, SourceLocation) {
    let rendered = format!("{error:#}");
    match parse_line_col(&rendered) {
        Some((line, column)) => (
            E_SYNTAX,
            SourceLocation {
                file,
                line: Some(line),
                column: Some(column),
            },
        ),
        None => (E_VALIDATION, file_location(file)),
    }
}

fn parse_line_col(rendered: &str) -> Option<(usize, usize)> {
    let marker = rendered.lines().find_map(|l| l.trim_start().strip_prefix("--> "))?;
    let mut parts = marker.trim().rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    Some((line, column))
}

/// The error text without the source excerpt that follows the location.
fn headline(error: &anyhow::Error) -> String {
    let rendered = format!("{error:#}");
    let head: Vec<&str> = rendered
        .lines()
        .take_while(|l| !l.trim_start().starts_with("-->"))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if head.is_empty() {
        rendered
    } else {
        head.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ROTATOR: &str = r#"(module
  (import "host" "rotate" (func $rotate (param f32 f32 f32)))
  (global $speed (export "Rotator.RotationSpeed.y") (mut f32) (f32.const 20))
  (func (export "Rotator.update") (param $dt f32)
    (call $rotate (f32.const 0) (f32.mul (global.get $speed) (local.get $dt)) (f32.const 0))))"#;

    fn compiler() -> Compiler {
        Compiler::new(&HotReloadConfig::default()).unwrap()
    }

    #[test]
    fn valid_component_compiles_without_diagnostics() {
        let compiled = compiler()
            .compile(SourceUnit::from_text("Rotator", ROTATOR))
            .unwrap();
        assert_eq!(compiled.name(), "Rotator");
        assert!(compiled.warnings().is_empty());
        assert!(compiled.aux().is_empty());
    }

    #[test]
    fn syntax_error_reports_line_and_column() {
        let broken = "(module\n  (func (export \"Rotator.update\") (param f32)\n    (nope)))";
        let failure = compiler()
            .compile(SourceUnit::from_text("Rotator", broken))
            .unwrap_err();

        assert_eq!(failure.name, "Rotator");
        assert_eq!(failure.diagnostics.len(), 1);
        let diag = &failure.diagnostics[0];
        assert_eq!(diag.code, E_SYNTAX);
        assert!(diag.is_error());
        assert_eq!(diag.location.line, Some(3));
        assert!(diag.location.column.is_some());
    }

    #[test]
    fn type_mismatch_is_a_validation_error() {
        let invalid = r#"(module (func (export "Rotator.update") (param f32) (i32.const 1)))"#;
        let failure = compiler()
            .compile(SourceUnit::from_text("Rotator", invalid))
            .unwrap_err();
        assert_eq!(failure.diagnostics[0].code, E_VALIDATION);
        assert_eq!(failure.diagnostics[0].location.line, None);
    }

    #[test]
    fn unknown_host_function_is_unresolved() {
        let wat = r#"(module
          (import "host" "teleport" (func (param f32)))
          (func (export "Rotator.update") (param f32)))"#;
        let failure = compiler()
            .compile(SourceUnit::from_text("Rotator", wat))
            .unwrap_err();
        assert_eq!(failure.diagnostics[0].code, E_UNRESOLVED_IMPORT);
        assert!(failure.diagnostics[0].message.contains("teleport"));
    }

    #[test]
    fn imports_resolve_against_aux_modules() {
        let wave = r#"(module (func (export "triangle") (param f32) (result f32) (local.get 0)))"#;
        let wat = r#"(module
          (import "Wave" "triangle" (func $tri (param f32) (result f32)))
          (func (export "Bob.update") (param $dt f32) (drop (call $tri (local.get $dt)))))"#;

        let compiled = compiler()
            .compile(SourceUnit::from_text("Bob", wat).with_aux("Wave", wave))
            .unwrap();
        assert_eq!(compiled.aux().len(), 1);
        assert_eq!(compiled.aux()[0].name, "Wave");

        let failure = compiler()
            .compile(SourceUnit::from_text("Bob", wat))
            .unwrap_err();
        assert_eq!(failure.diagnostics[0].code, E_UNRESOLVED_IMPORT);
    }

    #[test]
    fn broken_aux_fails_the_component() {
        let failure = compiler()
            .compile(SourceUnit::from_text("Rotator", ROTATOR).with_aux("Wave", "(module (func"))
            .unwrap_err();
        assert_eq!(failure.diagnostics[0].code, E_AUX);
        assert!(failure.diagnostics[0].message.contains("Wave"));
    }

    #[test]
    fn warnings_are_kept_or_escalated() {
        let wat = r#"(module (global (export "Idle.Speed") f32 (f32.const 1)))"#;

        let compiled = compiler()
            .compile(SourceUnit::from_text("Idle", wat))
            .unwrap();
        let codes: Vec<&str> = compiled.warnings().iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec![W_IMMUTABLE_FIELD, W_NO_UPDATE]);

        let strict = Compiler::new(&HotReloadConfig {
            warnings_as_errors: true,
            ..HotReloadConfig::default()
        })
        .unwrap();
        let failure = strict
            .compile(SourceUnit::from_text("Idle", wat))
            .unwrap_err();
        assert_eq!(failure.diagnostics.len(), 2);
        assert!(failure.diagnostics.iter().all(Diagnostic::is_error));
    }

    #[test]
    fn parse_line_col_reads_marker() {
        let rendered = "expected `(`\n     --> <anon>:4:12\n      |\n    4 | x";
        assert_eq!(parse_line_col(rendered), Some((4, 12)));
        assert_eq!(parse_line_col("type mismatch"), None);
    }

    #[test]
    fn diagnostic_display_is_compiler_style() {
        let diag = Diagnostic::error(
            SourceLocation {
                file: PathBuf::from("components/Rotator.wat"),
                line: Some(3),
                column: Some(5),
            },
            E_SYNTAX,
            "unexpected token",
        );
        assert_eq!(
            diag.to_string(),
            "components/Rotator.wat:3:5: error[E0001]: unexpected token"
        );
    }
}
