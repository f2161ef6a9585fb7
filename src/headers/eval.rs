//! Partial evaluator for parsed Meson descriptions.
//!
//! Only the parts of the language that influence header installation are
//! modelled faithfully: strings, arrays, path joining, `files()` and
//! `install_headers()`. Anything else Meson would compute (compilers,
//! dependencies, targets) evaluates to an opaque placeholder so unrelated
//! statements do not derail extraction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::parser::{Args, AssignOp, BinaryOp, Expr, Stmt, UnaryOp};

/// Objects Meson provides without an assignment.
const BUILTIN_OBJECTS: &[&str] = &["meson", "host_machine", "build_machine", "target_machine"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute (as absolute as the description's directory).
    pub path: PathBuf,
    /// As written, relative to the description's directory.
    pub relative: PathBuf,
}

/// The descriptor produced by an `install_headers()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInstall {
    pub headers: Vec<SourceFile>,
    pub install_dir: Option<String>,
    pub subdir: Option<String>,
    pub preserve_path: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    File(SourceFile),
    Headers(HeaderInstall),
    /// Result of something we do not model, named for diagnostics.
    Opaque(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::File(_) => "file",
            Value::Headers(_) => "headers",
            Value::Opaque(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::File(file) => write!(f, "{}", file.relative.display()),
            Value::Opaque(name) => write!(f, "<{name}>"),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

fn type_error(message: impl Into<String>) -> EvalError {
    EvalError::Type(message.into())
}

fn checked_int(result: Option<i64>) -> Result<Value, EvalError> {
    result.map(Value::Int).ok_or_else(|| type_error("integer overflow"))
}

/// Control flow out of a statement list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Break,
    Continue,
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    source_dir: PathBuf,
    bindings: HashMap<String, Value>,
}

impl Evaluator {
    /// An evaluator with no bindings, resolving files against `source_dir`.
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            bindings: HashMap::new(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn exec(&mut self, stmts: &[Stmt]) -> Result<Flow, EvalError> {
        for stmt in stmts {
            let flow = self.exec_one(stmt)?;
            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_one(&mut self, stmt: &Stmt) -> Result<Flow, EvalError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Assign { target, op, value } => self.assign(target, *op, value)?,
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.truthy(condition)? {
                        return self.exec(body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec(body);
                }
            }
            Stmt::Foreach {
                vars,
                iterable,
                body,
            } => {
                let items: Vec<Vec<Value>> = match (self.eval(iterable)?, vars.len()) {
                    (Value::Array(items), 1) => items.into_iter().map(|v| vec![v]).collect(),
                    (Value::Dict(map), 2) => map
                        .into_iter()
                        .map(|(k, v)| vec![Value::Str(k), v])
                        .collect(),
                    (other, n) => {
                        return Err(type_error(format!(
                            "cannot iterate {} with {n} variable(s)",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    for (var, value) in vars.iter().zip(item) {
                        self.bind(var.clone(), value);
                    }
                    if self.exec(body)? == Flow::Break {
                        break;
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    /// Apply one assignment statement.
    pub fn assign(&mut self, target: &str, op: AssignOp, value: &Expr) -> Result<(), EvalError> {
        let value = self.eval(value)?;
        let value = match op {
            AssignOp::Set => value,
            AssignOp::Append => {
                let current = self
                    .get(target)
                    .cloned()
                    .ok_or_else(|| EvalError::UnknownVariable(target.to_string()))?;
                add(current, value)?
            }
        };
        self.bind(target, value);
        Ok(())
    }

    fn truthy(&mut self, expr: &Expr) -> Result<bool, EvalError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(type_error(format!(
                "condition is {}, not bool",
                other.type_name()
            ))),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Ident(name) => match self.bindings.get(name) {
                Some(value) => Ok(value.clone()),
                None if BUILTIN_OBJECTS.contains(&name.as_str()) => {
                    Ok(Value::Opaque(name.clone()))
                }
                None => Err(EvalError::UnknownVariable(name.clone())),
            },
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let Value::Str(key) = self.eval(key)? else {
                        return Err(type_error("dictionary keys must be strings"));
                    };
                    map.insert(key, self.eval(value)?);
                }
                Ok(Value::Dict(map))
            }
            Expr::Call { name, args } => self.call(name, args),
            Expr::Method {
                receiver,
                name,
                args,
            } => {
                let receiver = self.eval(receiver)?;
                self.method(receiver, name, args)
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                subscript(target, index)
            }
            Expr::Unary { op, operand } => match (op, self.eval(operand)?) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(n)) => checked_int(n.checked_neg()),
                (_, Value::Opaque(name)) => Ok(Value::Opaque(name)),
                (op, other) => Err(type_error(format!(
                    "cannot apply {op:?} to {}",
                    other.type_name()
                ))),
            },
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                if self.truthy(condition)? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, EvalError> {
        // Short-circuit before evaluating the right side.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = self.truthy(lhs)?;
            if (op == BinaryOp::And) != left {
                return Ok(Value::Bool(left));
            }
            return self.truthy(rhs).map(Value::Bool);
        }

        let lhs = self.eval(lhs)?;
        let rhs = self.eval(rhs)?;
        if let (Value::Opaque(name), _) | (_, Value::Opaque(name)) = (&lhs, &rhs) {
            if !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                return Ok(Value::Opaque(name.clone()));
            }
        }
        match op {
            BinaryOp::Add => add(lhs, rhs),
            BinaryOp::Div => match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => Ok(Value::Str(join_path(&a, &b))),
                (Value::Int(_), Value::Int(0)) => Err(type_error("division by zero")),
                (Value::Int(a), Value::Int(b)) => checked_int(a.checked_div(b)),
                (a, b) => Err(mismatch("/", &a, &b)),
            },
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => match op {
                    BinaryOp::Sub => checked_int(a.checked_sub(b)),
                    BinaryOp::Mul => checked_int(a.checked_mul(b)),
                    _ if b == 0 => Err(type_error("modulo by zero")),
                    _ => checked_int(a.checked_rem(b)),
                },
                (a, b) => Err(mismatch(&format!("{op:?}"), &a, &b)),
            },
            BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
            BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = match (&lhs, &rhs) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(b),
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    (a, b) => return Err(mismatch(&format!("{op:?}"), a, b)),
                };
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
            BinaryOp::In | BinaryOp::NotIn => {
                let found = match (&lhs, &rhs) {
                    (needle, Value::Array(items)) => items.contains(needle),
                    (Value::Str(key), Value::Dict(map)) => map.contains_key(key),
                    (Value::Str(needle), Value::Str(hay)) => hay.contains(needle.as_str()),
                    (a, b) => return Err(mismatch("in", a, b)),
                };
                Ok(Value::Bool(found == (op == BinaryOp::In)))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn call(&mut self, name: &str, args: &Args) -> Result<Value, EvalError> {
        match name {
            "files" => {
                let mut files = Vec::new();
                for arg in &args.positional {
                    let value = self.eval(arg)?;
                    for file in self.source_files(value)? {
                        files.push(Value::File(file));
                    }
                }
                Ok(Value::Array(files))
            }
            "install_headers" => {
                let mut headers = Vec::new();
                for arg in &args.positional {
                    let value = self.eval(arg)?;
                    headers.extend(self.source_files(value)?);
                }
                let install_dir = self.optional_string(args, "install_dir")?;
                let subdir = self.optional_string(args, "subdir")?;
                let preserve_path = match args.keyword("preserve_path") {
                    Some(expr) => self.truthy(expr)?,
                    None => false,
                };
                Ok(Value::Headers(HeaderInstall {
                    headers,
                    install_dir,
                    subdir,
                    preserve_path,
                }))
            }
            "join_paths" => {
                let mut joined = String::new();
                for arg in &args.positional {
                    match self.eval(arg)? {
                        Value::Str(part) => joined = join_path(&joined, &part),
                        other => {
                            return Err(type_error(format!(
                                "join_paths() takes strings, got {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Ok(Value::Str(joined))
            }
            "get_option" => match args.positional.first().map(|a| self.eval(a)).transpose()? {
                Some(Value::Str(option)) => Ok(builtin_option(&option)
                    .map(|v| Value::Str(v.to_string()))
                    .unwrap_or(Value::Opaque(format!("get_option('{option}')")))),
                _ => Err(type_error("get_option() takes an option name")),
            },
            // Everything else is a build action we have no reason to model.
            other => Ok(Value::Opaque(format!("{other}()"))),
        }
    }

    fn optional_string(&mut self, args: &Args, keyword: &str) -> Result<Option<String>, EvalError> {
        match args.keyword(keyword) {
            None => Ok(None),
            Some(expr) => match self.eval(expr)? {
                Value::Str(s) => Ok(Some(s)),
                other => Err(type_error(format!(
                    "{keyword}: expects a string, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    /// Flatten strings, files and arrays of them into source files.
    fn source_files(&self, value: Value) -> Result<Vec<SourceFile>, EvalError> {
        match value {
            Value::Str(name) => {
                let relative = PathBuf::from(&name);
                Ok(vec![SourceFile {
                    path: self.source_dir.join(&relative),
                    relative,
                }])
            }
            Value::File(file) => Ok(vec![file]),
            Value::Array(items) => {
                let mut files = Vec::new();
                for item in items {
                    files.extend(self.source_files(item)?);
                }
                Ok(files)
            }
            other => Err(type_error(format!(
                "expected a file or string, got {}",
                other
            ))),
        }
    }

    fn method(&mut self, receiver: Value, name: &str, args: &Args) -> Result<Value, EvalError> {
        let mut positional = Vec::with_capacity(args.positional.len());
        for arg in &args.positional {
            positional.push(self.eval(arg)?);
        }
        let arg = |i: usize| positional.get(i).cloned();

        match (receiver, name) {
            (Value::Opaque(object), "current_source_dir" | "project_source_root" | "source_root")
                if object == "meson" =>
            {
                Ok(Value::Str(self.source_dir.display().to_string()))
            }
            (Value::Opaque(object), _) => Ok(Value::Opaque(format!("{object}.{name}()"))),

            (Value::Str(s), "format") => {
                let mut out = s;
                for (i, value) in positional.iter().enumerate() {
                    out = out.replace(&format!("@{i}@"), &value.to_string());
                }
                Ok(Value::Str(out))
            }
            (Value::Str(s), "to_upper") => Ok(Value::Str(s.to_uppercase())),
            (Value::Str(s), "to_lower") => Ok(Value::Str(s.to_lowercase())),
            (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
            (Value::Str(s), "underscorify") => Ok(Value::Str(
                s.chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                    .collect(),
            )),
            (Value::Str(s), "split") => {
                let parts: Vec<Value> = match arg(0) {
                    Some(Value::Str(sep)) => s.split(sep.as_str()).map(|p| Value::Str(p.to_string())).collect(),
                    _ => s.split_whitespace().map(|p| Value::Str(p.to_string())).collect(),
                };
                Ok(Value::Array(parts))
            }
            (Value::Str(sep), "join") => {
                let parts: Vec<String> = positional
                    .iter()
                    .flat_map(|v| match v {
                        Value::Array(items) => items.iter().map(|i| i.to_string()).collect(),
                        other => vec![other.to_string()],
                    })
                    .collect();
                Ok(Value::Str(parts.join(&sep)))
            }
            (Value::Str(s), "replace") => match (arg(0), arg(1)) {
                (Some(Value::Str(from)), Some(Value::Str(to))) => {
                    Ok(Value::Str(s.replace(&from, &to)))
                }
                _ => Err(type_error("replace() takes two strings")),
            },
            (Value::Str(s), "startswith" | "endswith" | "contains") => match arg(0) {
                Some(Value::Str(needle)) => Ok(Value::Bool(match name {
                    "startswith" => s.starts_with(&needle),
                    "endswith" => s.ends_with(&needle),
                    _ => s.contains(&needle),
                })),
                _ => Err(type_error(format!("{name}() takes a string"))),
            },
            (Value::Array(items), "length") => Ok(Value::Int(items.len() as i64)),
            (Value::Array(items), "contains") => {
                Ok(Value::Bool(arg(0).is_some_and(|v| items.contains(&v))))
            }
            (Value::Array(items), "get") => match arg(0) {
                Some(index) => subscript(Value::Array(items), index).or_else(|e| arg(1).ok_or(e)),
                None => Err(type_error("get() takes an index")),
            },
            (Value::Dict(map), "get") => match arg(0) {
                Some(Value::Str(key)) => match map.get(&key) {
                    Some(value) => Ok(value.clone()),
                    None => arg(1).ok_or_else(|| type_error(format!("no key '{key}'"))),
                },
                _ => Err(type_error("get() takes a key")),
            },
            (Value::Dict(map), "has_key") => match arg(0) {
                Some(Value::Str(key)) => Ok(Value::Bool(map.contains_key(&key))),
                _ => Err(type_error("has_key() takes a key")),
            },
            (Value::Dict(map), "keys") => Ok(Value::Array(
                map.into_keys().map(Value::Str).collect(),
            )),
            (Value::Int(n), "to_string") => Ok(Value::Str(n.to_string())),
            (Value::Int(n), "is_even") => Ok(Value::Bool(n % 2 == 0)),
            (Value::Int(n), "is_odd") => Ok(Value::Bool(n % 2 != 0)),
            (Value::Bool(b), "to_string") => Ok(Value::Str(b.to_string())),
            (Value::Bool(b), "to_int") => Ok(Value::Int(i64::from(b))),
            (receiver, _) => Err(EvalError::Unsupported(format!(
                "{}.{name}()",
                receiver.type_name()
            ))),
        }
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Value::Int(a), Value::Int(b)) => checked_int(a.checked_add(b)),
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::Array(mut a), item) => {
            a.push(item);
            Ok(Value::Array(a))
        }
        (Value::Dict(mut a), Value::Dict(b)) => {
            a.extend(b);
            Ok(Value::Dict(a))
        }
        (Value::Opaque(name), _) => Ok(Value::Opaque(name)),
        (a, b) => Err(mismatch("+", &a, &b)),
    }
}

fn subscript(target: Value, index: Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::Array(items), Value::Int(i)) => {
            let len = items.len() as i64;
            let at = if i < 0 { len + i } else { i };
            usize::try_from(at)
                .ok()
                .and_then(|at| items.into_iter().nth(at))
                .ok_or_else(|| type_error(format!("index {i} out of range")))
        }
        (Value::Dict(map), Value::Str(key)) => map
            .get(&key)
            .cloned()
            .ok_or_else(|| type_error(format!("no key '{key}'"))),
        (Value::Opaque(name), _) => Ok(Value::Opaque(name)),
        (a, b) => Err(mismatch("[]", &a, &b)),
    }
}

fn mismatch(op: &str, lhs: &Value, rhs: &Value) -> EvalError {
    type_error(format!(
        "unsupported operand types for {op}: {} and {}",
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Meson's `/` operator: an absolute right side replaces the left.
fn join_path(lhs: &str, rhs: &str) -> String {
    if lhs.is_empty() {
        return rhs.to_string();
    }
    Path::new(lhs).join(rhs).display().to_string()
}

/// Install locations, relative to the staged root's `/`.
fn builtin_option(name: &str) -> Option<&'static str> {
    Some(match name {
        "prefix" => "/usr",
        "includedir" => "include",
        "libdir" => "lib",
        "bindir" => "bin",
        "datadir" => "share",
        _ => return None,
    })
}
