pub mod conflict;
pub mod dispatcher;
pub mod executor;
pub mod filter;
pub mod operation;
pub mod renamer;
pub mod rule;

pub use conflict::{ConflictOutcome, ConflictPolicy, ConflictResolver};
pub use dispatcher::{OperationDispatcher, TaskRunner};
pub use executor::ActionExecutor;
pub use filter::{should_skip, AttributeFilterFactory, FilterSpec};
pub use operation::{ExecutionReport, OperationMode, OperationParameters};
pub use renamer::{RenameCounter, RenameTemplateEngine};
pub use rule::{compile as compile_rule, expand_group_rule, FilterItem, PathPredicate, Rule, RuleKind};
