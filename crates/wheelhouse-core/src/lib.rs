//! Wheelhouse - multi-platform wheel build and release orchestration
//!
//! Maps a trigger event (pull request, push, release) onto a matrix of
//! platform × interpreter × architecture jobs and drives each job through:
//! - dependency resolution
//! - a platform-specific build
//! - the lint gate and test suite, where configured
//! - artifact collection
//! - event-gated publication (archive, package index, object store)

pub mod builder;
pub mod cancel;
pub mod collector;
pub mod command;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod event;
pub mod events;
pub mod fakes;
pub mod gate;
pub mod job;
pub mod lint;
pub mod matrix;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod publish;
pub mod resolver;
pub mod retry;
pub mod telemetry;
pub mod test_runner;

// Re-export key types
pub use builder::{BuilderRegistry, CompiledExtension, PlatformBuilder};
pub use cancel::CancelHandle;
pub use collector::{Artifact, ArtifactCollector, ArtifactKind};
pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use config::PipelineConfig;
pub use credentials::{CredentialSource, Credentials, EnvCredentialSource, Secret};
pub use error::{Result, StageError, StageResult, WheelhouseError};
pub use event::{EventContext, TriggerEvent};
pub use events::{EventKind, EventRecorder, PipelineEvent};
pub use gate::{GateVerdict, RunGate};
pub use job::{Job, JobOutcome, JobStatus, StageKind};
pub use lint::{LintGates, LinterGate};
pub use matrix::{Architecture, BuildCell, InterpreterVersion, MatrixSpec, Platform};
pub use orchestrator::{expand, ExpansionPolicy, Orchestrator, RunReport};
pub use publish::{PublicationController, PublishAction, PublishReport};
pub use retry::RetryPolicy;
pub use test_runner::{TestReport, TestRunner};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
