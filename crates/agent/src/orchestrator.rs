//! Build phase sequencing
//!
//! The orchestrator runs the work phases in order and owns the failure
//! policy: an error in any phase is reported to the controller as build
//! output, the open section is closed as failed, a failed final status is
//! sent, and a stop is requested. Errors never propagate past `run`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::build::{BuildPlan, BuildRunner, Mount};
use crate::cache::{CacheManager, CacheSource};
use crate::config::{AgentConfig, Sandbox};
use crate::error::{AgentError, AgentResult};
use crate::git::RepoSynchronizer;
use crate::image::{ImageProvisioner, ImageSource};
use crate::marshal::OutputMarshaller;
use crate::report::Reporter;
use crate::script::ConfigResolver;
use crate::state::BuildPhase;

/// Section wrapping job resolution, before the step sections start
pub const PREPARE_SECTION: &str = "Preparing build";

/// The work done in each phase
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    async fn setup_cache(&self, reporter: &Reporter) -> AgentResult<()>;

    async fn sync_repo(&self, reporter: &Reporter) -> AgentResult<()>;

    async fn provision_image(&self, reporter: &Reporter) -> AgentResult<()>;

    /// Resolve the job and run it. Step sections are reported by the runner.
    async fn run_build(&self, reporter: &Reporter) -> AgentResult<()>;
}

/// Runs the phases of one build in order
pub struct Orchestrator<R> {
    runner: R,
    reporter: Reporter,
}

impl<R: PhaseRunner> Orchestrator<R> {
    pub fn new(runner: R, reporter: Reporter) -> Self {
        Self { runner, reporter }
    }

    /// Run every phase, then report the final status and request a stop
    pub async fn run(self) {
        let state = self.reporter.state().clone();
        let started = Utc::now();

        for phase in BuildPhase::WORK {
            if state.stop_requested() {
                self.cancel(phase);
                return;
            }
            if !state.advance(phase) {
                warn!("Skipping phase {}", phase);
                continue;
            }

            let phase_started = Utc::now();
            info!(phase = %phase, "{}", phase.label());
            if let Err(e) = self.run_phase(phase).await {
                self.fail(phase, &e);
                return;
            }
            debug!(
                phase = %phase,
                elapsed_ms = (Utc::now() - phase_started).num_milliseconds(),
                "Phase finished"
            );
        }

        state.advance(BuildPhase::Finalize);
        let succeeded = !state.has_failed();
        self.reporter.final_status(succeeded);
        state.request_stop();
        state.advance(BuildPhase::Done);

        info!(
            succeeded,
            elapsed_s = (Utc::now() - started).num_seconds(),
            "Build finished"
        );
    }

    async fn run_phase(&self, phase: BuildPhase) -> AgentResult<()> {
        // The build phase reports its own sections
        let bracketed = phase != BuildPhase::BuildRun;
        if bracketed {
            self.reporter.section_start(phase.label());
        }

        match phase {
            BuildPhase::CacheSetup => self.runner.setup_cache(&self.reporter).await?,
            BuildPhase::RepoClone => self.runner.sync_repo(&self.reporter).await?,
            BuildPhase::ImageSetup => self.runner.provision_image(&self.reporter).await?,
            BuildPhase::BuildRun => self.runner.run_build(&self.reporter).await?,
            BuildPhase::Finalize | BuildPhase::Done => {}
        }

        if bracketed {
            self.reporter.section_end(true);
        }
        Ok(())
    }

    fn fail(&self, phase: BuildPhase, err: &AgentError) {
        error!(phase = %phase, "Phase failed: {}", err);
        let state = self.reporter.state();

        // The error always lands inside a section that is then closed as failed
        if !state.section_open() {
            self.reporter.section_start(phase.label());
        }
        self.reporter
            .line(format!("Error while {}: {}", phase.label().to_lowercase(), err));
        self.reporter.close_open_section();
        self.reporter.final_status(false);
        state.request_stop();
        state.advance(BuildPhase::Done);
    }

    fn cancel(&self, phase: BuildPhase) {
        let state = self.reporter.state();
        if !state.is_finished() {
            warn!(phase = %phase, "Stop requested, cancelling build");
            self.reporter.line(format!(
                "Build cancelled before {}",
                phase.label().to_lowercase()
            ));
            self.reporter.final_status(false);
        }
        state.advance(BuildPhase::Done);
    }
}

/// The production phases
pub struct AgentPhases {
    config: Arc<AgentConfig>,
    caches: CacheManager,
    repo: RepoSynchronizer,
    images: ImageProvisioner,
    builder: BuildRunner,
    cache_root: Mutex<Option<PathBuf>>,
}

impl AgentPhases {
    pub fn new(config: Arc<AgentConfig>) -> AgentResult<Self> {
        Ok(Self {
            caches: CacheManager::new(config.cache_dir()),
            repo: RepoSynchronizer::new(config.clone_url.clone()),
            images: ImageProvisioner::new(config.runtime.clone())?,
            builder: BuildRunner::new(config.runtime.clone(), config.sandbox, config.build_timeout),
            cache_root: Mutex::new(None),
            config,
        })
    }

    fn mounts(&self, job_cache: &kiln_common::CacheConfig) -> AgentResult<Vec<Mount>> {
        let options = self.config.cache_config()?;
        let trust = self.config.trust_level();

        // Host-provided entries take precedence over the job's own
        let mut shared = job_cache.shared.clone();
        shared.extend(options.shared);
        let mut system = job_cache.system.clone();
        system.extend(options.system);

        let mut mounts = Vec::with_capacity(shared.len() + system.len());
        for (name, path) in &shared {
            mounts.push(Mount {
                host: self.caches.shared_dir(trust, name)?,
                container: path.display().to_string(),
                read_only: false,
            });
        }
        for (name, path) in &system {
            mounts.push(Mount {
                host: self.caches.system_dir(trust, name)?,
                container: path.display().to_string(),
                read_only: true,
            });
        }
        Ok(mounts)
    }
}

#[async_trait]
impl PhaseRunner for AgentPhases {
    async fn setup_cache(&self, reporter: &Reporter) -> AgentResult<()> {
        let options = self.config.cache_config()?;
        let trust = self.config.trust_level();
        let branch = self.config.remote_ref().cache_key();
        let caches = self.caches.clone();

        let resolved = tokio::task::spawn_blocking(move || {
            caches.resolve_cache_root(&options, trust, &branch)
        })
        .await??;

        match resolved {
            None => reporter.line("No cache configured"),
            Some(resolved) => {
                match &resolved.source {
                    CacheSource::Existing => {
                        reporter.line(format!("Using cache {}", resolved.root.display()))
                    }
                    CacheSource::CopiedFrom(from) => reporter.line(format!(
                        "Cache {} restored from {}",
                        resolved.root.display(),
                        from.display()
                    )),
                    CacheSource::Cold => reporter.line("No existing cache found, starting cold"),
                }
                *self.cache_root.lock() = Some(resolved.root);
            }
        }
        Ok(())
    }

    async fn sync_repo(&self, reporter: &Reporter) -> AgentResult<()> {
        let repo = self.repo.clone();
        let checkout = self.config.checkout_dir();
        let remote_ref = self.config.remote_ref();
        let commit = self.config.commit.clone();

        reporter.line(format!("Fetching {}", remote_ref.refname()));
        let refname = remote_ref.refname().to_string();
        let short = commit.chars().take(12).collect::<String>();
        tokio::task::spawn_blocking(move || repo.sync_to(&checkout, &remote_ref, &commit))
            .await??;

        reporter.line(format!("Checked out {} at {}", refname, short));
        Ok(())
    }

    async fn provision_image(&self, reporter: &Reporter) -> AgentResult<()> {
        if self.config.sandbox == Sandbox::Host {
            reporter.line("Running on the host, no image needed");
            return Ok(());
        }

        let source = self
            .images
            .ensure_image(
                &self.config.image_name,
                &self.config.image_url,
                &self.config.image_archive(),
            )
            .await?;

        match source {
            ImageSource::Cached => {
                reporter.line(format!("Loaded cached image {}", self.config.image_name))
            }
            ImageSource::Downloaded { bytes } => reporter.line(format!(
                "Downloaded and loaded image {} ({} bytes)",
                self.config.image_name, bytes
            )),
        }
        Ok(())
    }

    async fn run_build(&self, reporter: &Reporter) -> AgentResult<()> {
        reporter.section_start(PREPARE_SECTION);

        let checkout = self.config.checkout_dir();
        let resolver = ConfigResolver::new(self.builder.build_dir(&checkout));
        let resolved = resolver.resolve(&self.config.config_path(), &self.config.job)?;

        if !resolved.job.image.is_empty() && resolved.job.image != self.config.image_name {
            warn!(
                requested = %resolved.job.image,
                provided = %self.config.image_name,
                "Job image differs from the provisioned image"
            );
            reporter.line(format!(
                "Note: job `{}` asks for image `{}`, running in `{}`",
                self.config.job, resolved.job.image, self.config.image_name
            ));
        }

        let plan = BuildPlan {
            script: resolved.script,
            checkout,
            image: self.config.image_name.clone(),
            cache_root: self.cache_root.lock().clone(),
            mounts: self.mounts(&resolved.job.cache)?,
        };
        reporter.line(format!(
            "Running job `{}` ({} steps)",
            self.config.job,
            resolved.job.steps.len()
        ));

        // The preparation section is closed by the runner once the process is up
        let marshaller = OutputMarshaller::new(reporter.clone());
        let outcome = self.builder.run(&plan, &marshaller).await?;
        if !outcome.success() {
            reporter.state().mark_failed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::MessageBatcher;
    use crate::state::RunState;
    use kiln_common::Message;

    #[derive(Default)]
    struct FakePhases {
        fail_in: Option<BuildPhase>,
        stop_after: Option<BuildPhase>,
        calls: Arc<Mutex<Vec<BuildPhase>>>,
    }

    impl FakePhases {
        fn step(&self, phase: BuildPhase, reporter: &Reporter) -> AgentResult<()> {
            self.calls.lock().push(phase);
            if self.stop_after == Some(phase) {
                reporter.state().request_stop();
            }
            if self.fail_in == Some(phase) {
                return Err(AgentError::CommandFailed {
                    command: format!("{:?}", phase),
                    code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PhaseRunner for FakePhases {
        async fn setup_cache(&self, reporter: &Reporter) -> AgentResult<()> {
            self.step(BuildPhase::CacheSetup, reporter)
        }

        async fn sync_repo(&self, reporter: &Reporter) -> AgentResult<()> {
            self.step(BuildPhase::RepoClone, reporter)
        }

        async fn provision_image(&self, reporter: &Reporter) -> AgentResult<()> {
            self.step(BuildPhase::ImageSetup, reporter)
        }

        async fn run_build(&self, reporter: &Reporter) -> AgentResult<()> {
            self.step(BuildPhase::BuildRun, reporter)?;
            reporter.section_start("Compile");
            reporter.line("ok");
            reporter.section_end(true);
            Ok(())
        }
    }

    fn reporter() -> (Reporter, Arc<MessageBatcher>, Arc<RunState>) {
        let queue = Arc::new(MessageBatcher::new());
        let state = Arc::new(RunState::new());
        (Reporter::new(queue.clone(), state.clone()), queue, state)
    }

    fn phase_pair(phase: BuildPhase) -> Vec<Message> {
        vec![
            Message::section_start(phase.label()),
            Message::section_end(true),
        ]
    }

    #[tokio::test]
    async fn test_successful_run() {
        let (reporter, queue, state) = reporter();
        Orchestrator::new(FakePhases::default(), reporter).run().await;

        let mut expected = Vec::new();
        expected.extend(phase_pair(BuildPhase::CacheSetup));
        expected.extend(phase_pair(BuildPhase::RepoClone));
        expected.extend(phase_pair(BuildPhase::ImageSetup));
        expected.extend([
            Message::section_start("Compile"),
            Message::output("ok\n"),
            Message::section_end(true),
            Message::final_status(true),
        ]);

        assert_eq!(queue.drain(), expected);
        assert!(state.stop_requested());
        assert_eq!(state.phase(), Some(BuildPhase::Done));
    }

    #[tokio::test]
    async fn test_failure_in_each_phase() {
        for failing in BuildPhase::WORK {
            let (reporter, queue, state) = reporter();
            let phases = FakePhases {
                fail_in: Some(failing),
                ..Default::default()
            };
            let orchestrator = Orchestrator::new(phases, reporter);
            orchestrator.run().await;

            let messages = queue.drain();
            let n = messages.len();
            assert!(n >= 2, "{:?}: {:?}", failing, messages);
            assert_eq!(messages[n - 1], Message::final_status(false), "{:?}", failing);
            assert_eq!(messages[n - 2], Message::section_end(false), "{:?}", failing);
            assert!(
                matches!(&messages[n - 3], Message::BuildOutput { output } if output.contains("boom")),
                "{:?}: {:?}",
                failing,
                messages
            );
            let finals = messages
                .iter()
                .filter(|m| matches!(m, Message::FinalStatus { .. }))
                .count();
            assert_eq!(finals, 1);
            assert!(state.stop_requested());
            assert!(state.has_failed());
        }
    }

    #[tokio::test]
    async fn test_build_failure_outside_a_section_is_wrapped() {
        let (reporter, queue, _) = reporter();
        let phases = FakePhases {
            fail_in: Some(BuildPhase::BuildRun),
            ..Default::default()
        };
        Orchestrator::new(phases, reporter).run().await;

        let messages = queue.drain();
        let tail = &messages[messages.len() - 4..];
        assert_eq!(tail[0], Message::section_start(BuildPhase::BuildRun.label()));
        assert!(matches!(&tail[1], Message::BuildOutput { output } if output.starts_with("Error while running build")));
        assert_eq!(tail[2], Message::section_end(false));
        assert_eq!(tail[3], Message::final_status(false));
    }

    #[tokio::test]
    async fn test_failure_skips_later_phases() {
        let (reporter, queue, _) = reporter();
        let phases = FakePhases {
            fail_in: Some(BuildPhase::RepoClone),
            ..Default::default()
        };
        let calls = phases.calls.clone();
        Orchestrator::new(phases, reporter).run().await;

        assert_eq!(
            *calls.lock(),
            vec![BuildPhase::CacheSetup, BuildPhase::RepoClone]
        );
        let messages = queue.drain();
        assert_eq!(messages[2], Message::section_start(BuildPhase::RepoClone.label()));
        assert!(matches!(&messages[3], Message::BuildOutput { output } if output.contains("checking out source")));
        assert_eq!(messages[4], Message::section_end(false));
        assert_eq!(messages[5], Message::final_status(false));
        assert_eq!(messages.len(), 6);
    }

    #[tokio::test]
    async fn test_stop_request_cancels_remaining_phases() {
        let (reporter, queue, state) = reporter();
        let phases = FakePhases {
            stop_after: Some(BuildPhase::RepoClone),
            ..Default::default()
        };
        Orchestrator::new(phases, reporter).run().await;

        let messages = queue.drain();
        assert_eq!(messages.last(), Some(&Message::final_status(false)));
        assert!(messages.iter().any(
            |m| matches!(m, Message::BuildOutput { output } if output.contains("cancelled"))
        ));
        assert!(!messages.contains(&Message::section_start(BuildPhase::ImageSetup.label())));
        assert_eq!(state.phase(), Some(BuildPhase::Done));
    }

    #[tokio::test]
    async fn test_failed_step_fails_the_build() {
        let (reporter, queue, _) = reporter();

        struct FailingStep;

        #[async_trait]
        impl PhaseRunner for FailingStep {
            async fn setup_cache(&self, _: &Reporter) -> AgentResult<()> {
                Ok(())
            }
            async fn sync_repo(&self, _: &Reporter) -> AgentResult<()> {
                Ok(())
            }
            async fn provision_image(&self, _: &Reporter) -> AgentResult<()> {
                Ok(())
            }
            async fn run_build(&self, reporter: &Reporter) -> AgentResult<()> {
                reporter.section_start("Test");
                reporter.section_end(false);
                reporter.section_start("Package");
                reporter.section_end(true);
                Ok(())
            }
        }

        Orchestrator::new(FailingStep, reporter).run().await;
        let messages = queue.drain();
        assert_eq!(messages.last(), Some(&Message::final_status(false)));
        assert!(messages.contains(&Message::section_start("Package")));
    }
}
