//! Statement-level AST nodes and source descriptors.
//!
//! Execution position is tracked at statement granularity: compiled code
//! records which `AstStmt` is active at every instruction, and tracebacks
//! resolve statements back to file/line/column through the owning
//! `SourceFunction` and its `SourceModule`.

use std::sync::Arc;

/// Statement kinds tracked by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtKind {
    Expr,
    Assign,
    AugAssign,
    Return,
    If,
    While,
    For,
    FuncDef,
    ClassDef,
    Raise,
    Pass,
}

/// One source statement.
///
/// Nodes are allocated once per compilation unit and shared by reference;
/// compiled code embeds their addresses, so they must never move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstStmt {
    pub kind: StmtKind,
    /// 1-based source line.
    pub lineno: u32,
    /// 0-based source column.
    pub col_offset: u32,
}

impl AstStmt {
    #[inline]
    pub fn new(kind: StmtKind, lineno: u32, col_offset: u32) -> Self {
        Self {
            kind,
            lineno,
            col_offset,
        }
    }
}

/// A source module: the unit a file compiles to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceModule {
    pub name: Arc<str>,
    pub filename: Arc<str>,
}

impl SourceModule {
    pub fn new(name: &str, filename: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            filename: filename.into(),
        })
    }
}

/// Identity of one source function: its name, the module it belongs to,
/// and the statements of its body.
#[derive(Debug, Clone)]
pub struct SourceFunction {
    pub name: Arc<str>,
    pub module: Arc<SourceModule>,
    pub body: Vec<Arc<AstStmt>>,
}

impl SourceFunction {
    pub fn new(name: &str, module: Arc<SourceModule>, body: Vec<Arc<AstStmt>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            module,
            body,
        })
    }

    /// Filename of the module this function was compiled from.
    #[inline]
    pub fn filename(&self) -> &Arc<str> {
        &self.module.filename
    }
}
