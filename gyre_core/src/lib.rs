pub mod config;
pub mod corpus;
pub mod coverage;
pub mod ei;
pub mod executor;
pub mod feedback;
pub mod guidance;
pub mod input;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod preround;
pub mod probe;
pub mod scheduler;
pub mod stream;

pub use config::{Engine, GyreConfig, SessionConfig};
pub use corpus::{Corpus, CorpusEntry, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use coverage::{CoverageMap, Signature};
pub use ei::{ExecutionIndex, ExecutionIndexer, IndexCapability, NoIndex};
pub use executor::{Executor, Failure, InProcessExecutor, Invalid, RunContext, RunResult};
pub use feedback::{CoverageFeedback, Feedback, FeedbackError};
pub use guidance::{Guidance, GuidanceError, SessionSummary, TerminationReason};
pub use input::{InputOrigin, Seed};
pub use mutator::{HavocMutator, Mutator};
pub use observer::Observer;
pub use oracle::{BugReport, CrashOracle, FailureArchive, Oracle};
pub use probe::{ProbeError, ProbeId};
pub use scheduler::{EnergyScheduler, Scheduler, SchedulerError};
pub use stream::InputStream;
