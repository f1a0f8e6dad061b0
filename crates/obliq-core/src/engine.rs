//! Operators and the engine abstraction.
//!
//! The engine is a black box that reads one integer-record file and writes
//! `<stem>_output.txt` next to it. Everything this crate needs to know about
//! an operator (how its input header looks, which fields get relabeled, what
//! its output rows mean) is described by [`OperatorKind`].

use crate::relabel::FieldRole;
use crate::stage::StageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A primitive operator exposed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// General equi-join.
    Join,
    /// Join where one side's key references the other side's unique id.
    FkJoin,
    /// Filter with projection.
    Filter,
    /// Group aggregate.
    Aggregate,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 4] = [
        OperatorKind::Join,
        OperatorKind::FkJoin,
        OperatorKind::Filter,
        OperatorKind::Aggregate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OperatorKind::Join => "join",
            OperatorKind::FkJoin => "fk_join",
            OperatorKind::Filter => "filter",
            OperatorKind::Aggregate => "aggregate",
        }
    }

    /// Directory of the operator's build tree, relative to the engine root.
    pub fn default_dir(self) -> &'static str {
        match self {
            OperatorKind::Join => "join",
            OperatorKind::FkJoin => "fk_join",
            OperatorKind::Filter => "operator_1",
            OperatorKind::Aggregate => "operator_2",
        }
    }

    /// Whether the operator consumes two tables.
    pub fn is_binary(self) -> bool {
        matches!(self, OperatorKind::Join | OperatorKind::FkJoin)
    }

    pub fn header_convention(self) -> HeaderConvention {
        match self {
            OperatorKind::Aggregate => HeaderConvention::Single,
            _ => HeaderConvention::Pair,
        }
    }

    /// Relabel roles for the fields of one input row.
    pub fn input_roles(self) -> Vec<FieldRole> {
        match self {
            OperatorKind::Join | OperatorKind::FkJoin => {
                vec![FieldRole::Relabel, FieldRole::Relabel]
            }
            OperatorKind::Filter => vec![FieldRole::Passthrough, FieldRole::Relabel],
            OperatorKind::Aggregate => vec![
                FieldRole::Relabel,
                FieldRole::Passthrough,
                FieldRole::Relabel,
            ],
        }
    }

    pub fn output_shape(self) -> OutputShape {
        match self {
            OperatorKind::Join | OperatorKind::FkJoin => OutputShape::JoinPair,
            OperatorKind::Filter => OutputShape::KeyPayload,
            OperatorKind::Aggregate => OutputShape::KeyAggregatesPayload,
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for unknown operator names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operator '{0}': expected one of join, fk_join, filter, aggregate")]
pub struct UnknownOperator(pub String);

impl FromStr for OperatorKind {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "join" | "nfk_join" => Ok(OperatorKind::Join),
            "fk_join" => Ok(OperatorKind::FkJoin),
            "filter" | "operator_1" => Ok(OperatorKind::Filter),
            "aggregate" | "operator_2" => Ok(OperatorKind::Aggregate),
            _ => Err(UnknownOperator(s.to_string())),
        }
    }
}

/// How the count header of an input file is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderConvention {
    /// `"<count1> <count2>"`, second count is `0` for single-table input.
    Pair,
    /// `"<count>"`.
    Single,
}

impl HeaderConvention {
    pub fn header(self, count1: usize, count2: usize) -> String {
        match self {
            HeaderConvention::Pair => format!("{count1} {count2}"),
            HeaderConvention::Single => format!("{}", count1 + count2),
        }
    }
}

/// Meaning of the fields in one engine output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// `key payload`
    KeyPayload,
    /// `key agg1 [agg2] payload`, aggregates are passthrough numbers.
    KeyAggregatesPayload,
    /// `key_b payload_b key_a payload_a`
    JoinPair,
}

impl OutputShape {
    /// Field counts this shape accepts.
    pub fn arities(self) -> &'static [usize] {
        match self {
            OutputShape::KeyPayload => &[2],
            OutputShape::KeyAggregatesPayload => &[3, 4],
            OutputShape::JoinPair => &[4],
        }
    }
}

/// Comparison applied by the filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Comparator {
    Lt,
    Gt,
    Eq,
    Le,
    Ge,
    Ne,
}

/// Error for comparator tokens outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "invalid comparator '{0}': expected one of < > == <= >= != (quote '<' and '>' in a shell)"
)]
pub struct InvalidComparator(pub String);

impl Comparator {
    pub const ALL: [Comparator; 6] = [
        Comparator::Lt,
        Comparator::Gt,
        Comparator::Eq,
        Comparator::Le,
        Comparator::Ge,
        Comparator::Ne,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Gt => ">",
            Comparator::Eq => "==",
            Comparator::Le => "<=",
            Comparator::Ge => ">=",
            Comparator::Ne => "!=",
        }
    }

    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Ne => lhs != rhs,
        }
    }
}

impl FromStr for Comparator {
    type Err = InvalidComparator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Comparator::ALL
            .into_iter()
            .find(|c| c.symbol() == s.trim())
            .ok_or_else(|| InvalidComparator(s.to_string()))
    }
}

impl TryFrom<String> for Comparator {
    type Error = InvalidComparator;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Comparator> for String {
    fn from(c: Comparator) -> Self {
        c.symbol().to_string()
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// `key <comparator> threshold`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub comparator: Comparator,
    pub threshold: i64,
}

impl FilterPredicate {
    pub fn new(comparator: Comparator, threshold: i64) -> Self {
        Self {
            comparator,
            threshold,
        }
    }

    pub fn matches(&self, key: i64) -> bool {
        self.comparator.evaluate(key, self.threshold)
    }
}

impl fmt::Display for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {} {}", self.comparator, self.threshold)
    }
}

/// One invocation of an operator.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub operator: OperatorKind,
    /// Absolute path of the relabeled input file.
    pub input: PathBuf,
    pub predicate: Option<FilterPredicate>,
}

/// What the engine process reported.
#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A backend able to run one operator against the file contract.
pub trait Engine: Send + Sync {
    /// Short identifier shown in logs and `obliq engines`.
    fn name(&self) -> &str;

    /// The operator this engine implements.
    fn operator(&self) -> OperatorKind;

    /// Run the operator. Exit code interpretation is left to the caller.
    fn execute(&self, request: &EngineRequest) -> Result<EngineRun, StageError>;
}
