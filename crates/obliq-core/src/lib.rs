//! Obliq: relational queries over an integer-only oblivious engine.
//!
//! The engine runs join, filter, and group-aggregate over records of small
//! integers. Obliq formats relational CSV into that shape, relabels every
//! value to a dense id, runs the engine, maps ids back, and rebuilds CSV.
//! Stages compose into plans such as join then filter, or filter then a
//! newest-first sort expressed as an aggregate.

mod engine;
mod external;
mod format;
mod patch;
mod pipeline;
mod reconstruct;
mod reference;
mod registry;
mod relabel;
mod reverse;
mod sort_key;
mod stage;
mod workflow;

pub use engine::{
    Comparator, Engine, EngineRequest, EngineRun, FilterPredicate, HeaderConvention,
    InvalidComparator, OperatorKind, OutputShape, UnknownOperator,
};
pub use external::{
    EngineSettings, ExternalEngine, FilterInjection, build, build_all, set_payload_sizes,
};
pub use format::{
    CsvSource, EMPTY_PAYLOAD, FormatError, KeySource, PAYLOAD_DELIMITER, RecordFormatter,
    StageInput, StageInputRow, TableSpec, csv_header, join_payload,
};
pub use patch::{
    FILTER_SOURCE, PAYLOAD_HEADER, PatchError, Placeholder, SourcePatch, filter_substitutions,
    set_payload_size,
};
pub use pipeline::{
    AggregateSpec, Cleanup, FilterSpec, JoinSpec, Pipeline, PipelineError, PipelineOptions,
    PipelineRun, RunReport, ScratchDir, SortColumns, SortSpec, StageReport, SymmetricJoinSpec,
    TimingLedger, qualify_column,
};
pub use reconstruct::{
    CsvReconstructor, HeaderSpec, ReconstructError, ReconstructStats, union_csvs,
};
pub use reference::ReferenceEngine;
pub use registry::EngineRegistry;
pub use relabel::{
    FieldRole, RelabelError, RelabelStats, Resolved, ReverseMap, Strictness, UNMAPPED_PREFIX,
    ValueMap, ValueRelabeler,
};
pub use reverse::{INTERMEDIATE_DELIMITER, ReverseRelabeler, ReverseStats};
pub use sort_key::{
    MAX_ID, MAX_TIMESTAMP, SortKeyError, composite_key, parse_timestamp, sort_key_for,
};
pub use stage::{
    ErrorCategory, OUTPUT_SUFFIX, StageError, StageOutput, StageRunner, expected_output_path,
    parse_elapsed, read_timing, timing_path, write_timing,
};
pub use workflow::{Operation, STEP_REF, Step, TableRef, Workflow, WorkflowError};
