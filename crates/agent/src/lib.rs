//! kiln-agent
//!
//! Build execution agent for kiln. One agent process runs one build job and
//! streams its progress to the controller. This crate handles:
//! - Cache restore, partitioned by trust level
//! - Checking out the exact commit under test
//! - Loading the build image into the container runtime
//! - Compiling the job's steps into a script and running it
//! - Turning build output into section and output messages
//! - Delivering those messages over the controller connection

use std::sync::Arc;

use futures::{Sink, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::info;

pub mod batcher;
pub mod build;
pub mod cache;
pub mod config;
pub mod error;
pub mod git;
pub mod image;
pub mod marshal;
pub mod orchestrator;
pub mod report;
pub mod script;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use batcher::MessageBatcher;
pub use build::{BuildOutcome, BuildPlan, BuildRunner, Mount};
pub use cache::{CacheManager, CacheSource, ResolvedCache};
pub use config::{AgentConfig, Sandbox, TrustLevel};
pub use error::{AgentError, AgentResult};
pub use git::{RefKind, RemoteRef, RepoSynchronizer};
pub use image::{ImageProvisioner, ImageSource};
pub use marshal::{parse_control, ControlEvent, OutputMarshaller};
pub use orchestrator::{AgentPhases, Orchestrator, PhaseRunner};
pub use report::Reporter;
pub use script::{ConfigResolver, ResolvedJob, CONTROL_SENTINEL};
pub use state::{BuildPhase, RunState};
pub use transport::{ConnectionState, TransportChannel, TransportSettings, TransportStats};

/// Outcome of a complete agent run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: bool,
    pub transport: TransportStats,
}

/// Main Agent structure that runs one build against a controller
pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    /// Create a new agent, rejecting configuration that cannot work
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect to the controller and run the build
    ///
    /// A failed connection is returned as an error, since there is nowhere
    /// to report it. Everything after that is reported to the controller.
    pub async fn run(self) -> AgentResult<RunSummary> {
        let url = self.config.controller_url()?;
        let socket = transport::connect(&url).await?;
        let phases = AgentPhases::new(self.config.clone())?;

        drive(socket, phases, TransportSettings::from(self.config.as_ref())).await
    }
}

/// Run the phases in `runner` while streaming their messages over `socket`
///
/// Returns once the orchestrator has finished and the connection is closed.
pub async fn drive<S, R>(socket: S, runner: R, settings: TransportSettings) -> AgentResult<RunSummary>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
    R: PhaseRunner + 'static,
{
    let queue = Arc::new(MessageBatcher::new());
    let state = Arc::new(RunState::new());
    let reporter = Reporter::new(queue.clone(), state.clone());

    let orchestrator = tokio::spawn(Orchestrator::new(runner, reporter).run());
    let transport = TransportChannel::new(socket, queue, state.clone(), settings)
        .run()
        .await;
    orchestrator.await?;
    let transport = transport?;

    let succeeded = state.is_finished() && !state.has_failed();
    info!(succeeded, "Agent run complete");
    Ok(RunSummary {
        succeeded,
        transport,
    })
}
