//! Executable invocation conventions for the supported cores.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

const XRAY_VERSION_PATTERN: &str = r"^Xray (\d+\.\d+\.\d+)";
const SING_BOX_VERSION_PATTERN: &str = r"version\s+(\d+\.\d+\.\d+)";

/// How to run one core: program, run-from-stdin arguments, working
/// directory, extra environment and how to ask it for its version.
#[derive(Clone, Debug)]
pub struct CoreLauncher {
    program: PathBuf,
    run_args: Vec<String>,
    version_args: Vec<String>,
    working_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    version_pattern: Option<Regex>,
}

impl CoreLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        run_args: Vec<String>,
        version_args: Vec<String>,
        version_pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            program: program.into(),
            run_args,
            version_args,
            working_dir: None,
            envs: Vec::new(),
            version_pattern: Some(Regex::new(version_pattern)?),
        })
    }

    /// `xray run -config stdin:` with the asset directory exported.
    pub fn xray(executable: impl Into<PathBuf>, assets_path: &Path) -> Self {
        Self {
            program: executable.into(),
            run_args: vec!["run".to_string(), "-config".to_string(), "stdin:".to_string()],
            version_args: vec!["version".to_string()],
            working_dir: None,
            envs: vec![(
                "XRAY_LOCATION_ASSET".to_string(),
                assets_path.display().to_string(),
            )],
            version_pattern: XRAY_VERSION.clone(),
        }
    }

    /// `sing-box run -c stdin` from inside its working directory.
    pub fn sing_box(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: executable.into(),
            run_args: vec!["run".to_string(), "-c".to_string(), "stdin".to_string()],
            version_args: vec!["version".to_string()],
            working_dir: Some(working_dir.into()),
            envs: Vec::new(),
            version_pattern: SING_BOX_VERSION.clone(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Command for a run: all three standard streams piped, own process
    /// group so signals reach helpers the core forks.
    pub(crate) fn run_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.run_args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Runs the executable with its version flag and extracts `x.y.z`.
    ///
    /// Returns `None` when the executable is missing, exits non-zero or
    /// prints nothing matching the version pattern.
    pub async fn probe_version(&self) -> Option<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.version_args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(err) => {
                debug!(event = "version_probe_failed", program = %self.program.display(), error = %err);
                return None;
            }
        };
        if !output.status.success() {
            debug!(event = "version_probe_status", program = %self.program.display(), status = %output.status);
            return None;
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        self.match_version(&text)
    }

    fn match_version(&self, output: &str) -> Option<String> {
        let pattern = self.version_pattern.as_ref()?;
        output.lines().find_map(|line| {
            pattern
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
    }
}

static XRAY_VERSION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(XRAY_VERSION_PATTERN).ok());
static SING_BOX_VERSION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(SING_BOX_VERSION_PATTERN).ok());
