//! Build script generation
//!
//! Turns a job from the repository's configuration file into a single bash
//! script. Each step runs in its own `set -e` subshell and is bracketed by
//! control lines that the output marshaller turns into section messages.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::Path;

use kiln_common::{BuildJobConfig, JobConfig, JobConfigError, Step, When};
use tracing::debug;

/// Prefix marking a line of build output as a control event
pub const CONTROL_SENTINEL: &str = "##[kiln-control]";

/// Opcode opening a section; operand is the section name
pub const OP_SECTION_START: &str = "SectionStart";

/// Opcode closing a section; operand is the step's exit code
pub const OP_SECTION_END: &str = "SectionEnd";

/// A job together with the script that runs it
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub job: JobConfig,
    pub script: String,
}

/// Compiles job configurations into build scripts
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    build_dir: String,
}

impl ConfigResolver {
    /// `build_dir` is where the checkout is visible to the script
    pub fn new(build_dir: impl Into<String>) -> Self {
        Self {
            build_dir: build_dir.into(),
        }
    }

    /// Load `config_path` and compile the job named `job_name`
    pub fn resolve(&self, config_path: &Path, job_name: &str) -> Result<ResolvedJob, JobConfigError> {
        let config = BuildJobConfig::from_path(config_path)?;
        let job = config.job(job_name)?.clone();
        let script = self.render(&job);

        debug!(
            job = job_name,
            steps = job.steps.len(),
            "Compiled build script ({} bytes)",
            script.len()
        );

        Ok(ResolvedJob { job, script })
    }

    /// Compile a job into a bash script
    pub fn render(&self, job: &JobConfig) -> String {
        let dir = quote(&self.build_dir);
        let mut script = String::new();

        script.push_str("exec 2>&1\n");
        let _ = writeln!(
            script,
            "cd {dir} || {{ echo {}; exit 1; }}",
            quote(&format!(
                "Build directory {} does not exist",
                self.build_dir
            ))
        );
        script.push_str("kiln_failed=0\n");

        for step in &job.steps {
            render_step(&mut script, step);
        }

        script.push_str("exit \"$kiln_failed\"\n");
        script
    }
}

fn render_step(script: &mut String, step: &Step) {
    let _ = writeln!(
        script,
        "echo {}",
        quote(&control_line(OP_SECTION_START, step.name.trim()))
    );

    let guard = match step.when {
        When::Always => None,
        When::Success => Some(("-eq", "an earlier step failed")),
        When::Failure => Some(("-ne", "no earlier step failed")),
    };

    if let Some((test, reason)) = guard {
        let _ = writeln!(script, "if [ \"$kiln_failed\" {} 0 ]; then", test);
        render_subshell(script, &step.command);
        script.push_str("else\n");
        let _ = writeln!(
            script,
            "echo {}",
            quote(&format!("Skipping step: {}", reason))
        );
        script.push_str("fi\n");
    } else {
        render_subshell(script, &step.command);
    }

    script.push_str("kiln_status=$?\n");
    let _ = writeln!(
        script,
        "echo \"{} {} $kiln_status\"",
        CONTROL_SENTINEL, OP_SECTION_END
    );
    script.push_str("[ \"$kiln_status\" -eq 0 ] || kiln_failed=1\n");
}

// Steps read from /dev/null so they cannot swallow the rest of the script on stdin.
fn render_subshell(script: &mut String, command: &str) {
    script.push_str("(\nset -e\n");
    script.push_str(command);
    if !command.ends_with('\n') {
        script.push('\n');
    }
    script.push_str(") < /dev/null\n");
}

/// Format a control line as the marshaller expects to read it
pub fn control_line(opcode: &str, operand: &str) -> String {
    format!("{} {} {}", CONTROL_SENTINEL, opcode, operand)
}

fn quote(value: &str) -> String {
    shell_escape::escape(Cow::Borrowed(value)).into_owned()
}
