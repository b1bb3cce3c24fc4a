//! Sandboxed build executor: runs a full project build (install + build
//! script) either natively or inside a resource-capped container.
//!
//! Per invocation: detect tooling -> install -> (optional one-shot repair)
//! -> run build script. One wall-clock deadline spans the whole sequence;
//! on expiry the spawned process group is force-killed.

use crate::error::{PipelineError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Characters of stderr kept on a failure error.
const STDERR_TAIL_LEN: usize = 2000;

/// Bundler config files that signal a vite project.
const VITE_CONFIG_CANDIDATES: &[&str] = &[
    "vite.config.ts",
    "vite.config.js",
    "vite.config.mjs",
    "vite.config.cjs",
];

// ============================================================================
// Tool detection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Npm,
    Yarn,
}

impl PackageManager {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Pnpm => "pnpm",
            Self::Npm => "npm",
            Self::Yarn => "yarn",
        }
    }

    pub fn build_args(&self) -> Vec<String> {
        match self {
            Self::Yarn => vec!["build".into()],
            Self::Npm | Self::Pnpm => vec!["run".into(), "build".into()],
        }
    }

    pub fn add_dev_args(&self, package: &str) -> Vec<String> {
        match self {
            Self::Yarn | Self::Pnpm => vec!["add".into(), "-D".into(), package.into()],
            Self::Npm => vec!["install".into(), "-D".into(), package.into()],
        }
    }
}

/// Detected install tooling for a project directory.
#[derive(Debug, Clone)]
pub struct Tooling {
    pub manager: PackageManager,
    pub install_args: Vec<String>,
    /// Human-readable justification, logged so the precedence is auditable.
    pub reason: String,
}

/// Deterministic package-manager detection by lockfile presence, in fixed
/// precedence: pnpm lockfile > npm lockfile > yarn lockfile > manifest
/// `packageManager` field > npm default. The precedence decides which
/// install command (and flags) run, so it must never be ambient.
pub fn detect_tooling(project_dir: &Path) -> Tooling {
    if project_dir.join("pnpm-lock.yaml").is_file() {
        return Tooling {
            manager: PackageManager::Pnpm,
            install_args: vec!["install".into(), "--frozen-lockfile".into()],
            reason: "pnpm-lock.yaml detected".into(),
        };
    }
    if project_dir.join("package-lock.json").is_file() {
        return Tooling {
            manager: PackageManager::Npm,
            install_args: vec!["ci".into()],
            reason: "package-lock.json detected".into(),
        };
    }
    if project_dir.join("yarn.lock").is_file() {
        return Tooling {
            manager: PackageManager::Yarn,
            install_args: vec!["install".into(), "--frozen-lockfile".into()],
            reason: "yarn.lock detected".into(),
        };
    }
    if let Some(field) = read_package_manager_field(project_dir) {
        let manager = if field.starts_with("pnpm") {
            Some(PackageManager::Pnpm)
        } else if field.starts_with("yarn") {
            Some(PackageManager::Yarn)
        } else if field.starts_with("npm") {
            Some(PackageManager::Npm)
        } else {
            None
        };
        if let Some(manager) = manager {
            return Tooling {
                manager,
                install_args: vec!["install".into()],
                reason: format!("packageManager={field}"),
            };
        }
    }
    Tooling {
        manager: PackageManager::Npm,
        install_args: vec!["install".into()],
        reason: "no lockfile detected -> defaulting to npm".into(),
    }
}

fn read_package_manager_field(project_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(project_dir.join("package.json")).ok()?;
    let pkg: serde_json::Value = serde_json::from_str(&raw).ok()?;
    pkg.get("packageManager")?.as_str().map(str::to_string)
}

fn read_build_script(project_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(project_dir.join("package.json")).ok()?;
    let pkg: serde_json::Value = serde_json::from_str(&raw).ok()?;
    pkg.get("scripts")?.get("build")?.as_str().map(str::to_string)
}

// ============================================================================
// Execution strategy
// ============================================================================

/// Requested execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Native,
    Container,
}

/// Strategy actually used, selected once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Native,
    Container,
}

/// Pure mapping from (requested mode, runtime probe) to strategy. Container
/// mode silently degrades to native when the runtime is unavailable.
pub fn select_strategy(mode: ExecMode, container_available: bool) -> ExecutionStrategy {
    match (mode, container_available) {
        (ExecMode::Container, true) => ExecutionStrategy::Container,
        _ => ExecutionStrategy::Native,
    }
}

/// Probe the container runtime.
pub async fn probe_container() -> bool {
    Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Arguments for the resource-capped container invocation: capability-dropped,
/// read-only root filesystem, writable scratch under /tmp only.
pub fn container_args(project_dir: &Path, allow_scripts: bool, image: &str) -> Vec<String> {
    vec![
        "run".into(),
        "--rm".into(),
        "--memory=2g".into(),
        "--cpus=1.5".into(),
        "--pids-limit=256".into(),
        "--cap-drop=ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--read-only".into(),
        "--tmpfs".into(),
        "/tmp:exec,mode=1777".into(),
        "-e".into(),
        format!("IGNORE_SCRIPTS={}", if allow_scripts { "0" } else { "1" }),
        "-v".into(),
        format!("{}:/workspace", project_dir.display()),
        image.into(),
    ]
}

// ============================================================================
// One-shot repair
// ============================================================================

/// Bounded repair applied at most once before retrying a failed build.
///
/// Keyed on heuristic content sniffing (config file presence, build-script
/// text, binary presence) rather than a declared dependency; best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    InstallBundler { package: &'static str },
}

/// Detect whether the project references vite without having its binary
/// installed.
pub fn detect_repair(project_dir: &Path) -> Option<RepairAction> {
    let has_config = VITE_CONFIG_CANDIDATES
        .iter()
        .any(|f| project_dir.join(f).is_file());
    let mentions_vite = read_build_script(project_dir)
        .map(|s| s.split_whitespace().any(|w| w == "vite"))
        .unwrap_or(false);
    let bin = project_dir.join("node_modules").join(".bin").join("vite");
    if (has_config || mentions_vite) && !bin.exists() {
        Some(RepairAction::InstallBundler { package: "vite" })
    } else {
        None
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs install + build for one project directory under a single wall-clock
/// timeout.
#[derive(Debug, Clone)]
pub struct BuildExecutor {
    pub timeout: Duration,
    pub container_image: String,
}

impl BuildExecutor {
    pub fn new(timeout: Duration, container_image: impl Into<String>) -> Self {
        Self {
            timeout,
            container_image: container_image.into(),
        }
    }

    /// Execute the full sequence. The captured install+build output is
    /// appended to `log` regardless of outcome so the caller can persist it.
    pub async fn execute(
        &self,
        project_dir: &Path,
        mode: ExecMode,
        allow_scripts: bool,
        log: &mut String,
    ) -> Result<ExecutionStrategy> {
        let deadline = Instant::now() + self.timeout;
        let available = match mode {
            ExecMode::Container => probe_container().await,
            ExecMode::Native => false,
        };
        let strategy = select_strategy(mode, available);
        if mode == ExecMode::Container && strategy == ExecutionStrategy::Native {
            let line = "[executor] container runtime not available, falling back to native build";
            warn!("{line}");
            log.push_str(line);
            log.push('\n');
        }

        match strategy {
            ExecutionStrategy::Native => {
                self.run_native(project_dir, allow_scripts, deadline, log)
                    .await?
            }
            ExecutionStrategy::Container => {
                self.run_container(project_dir, allow_scripts, deadline, log)
                    .await?
            }
        }
        Ok(strategy)
    }

    async fn run_native(
        &self,
        project_dir: &Path,
        allow_scripts: bool,
        deadline: Instant,
        log: &mut String,
    ) -> Result<()> {
        if !project_dir.join("package.json").is_file() {
            return Err(PipelineError::BuildFailed {
                stderr_tail: "package.json not found".into(),
            });
        }
        let tooling = detect_tooling(project_dir);
        let cmd = tooling.manager.command();

        let mut install_env = vec![
            ("NODE_ENV".to_string(), "development".to_string()),
            ("npm_config_production".to_string(), "false".to_string()),
        ];
        let mut install_args = tooling.install_args.clone();
        if !allow_scripts {
            // Supply-chain mitigation: lifecycle scripts are disabled for the
            // install step only; the build script below always runs.
            install_args.push("--ignore-scripts".into());
            install_env.push(("npm_config_ignore_scripts".into(), "true".into()));
            install_env.push(("YARN_IGNORE_DEPENDENCY_SCRIPTS".into(), "1".into()));
        }
        let build_env = vec![
            ("NODE_ENV".to_string(), "development".to_string()),
            ("npm_config_production".to_string(), "false".to_string()),
        ];

        let line = format!("[executor] {} -> {cmd} {}", tooling.reason, install_args.join(" "));
        info!("{line}");
        log.push_str(&line);
        log.push('\n');

        run_command(cmd, &install_args, project_dir, &install_env, deadline, self.timeout, log).await?;

        let mut repair_applied = false;
        if let Some(RepairAction::InstallBundler { package }) = detect_repair(project_dir) {
            self.apply_repair(&tooling, package, project_dir, &build_env, deadline, log)
                .await?;
            repair_applied = true;
        }

        let build_args = tooling.manager.build_args();
        match run_command(cmd, &build_args, project_dir, &build_env, deadline, self.timeout, log).await {
            Ok(()) => Ok(()),
            Err(err @ PipelineError::Timeout(_)) => Err(err),
            Err(err) => {
                // One bounded repair, then retry exactly once.
                if !repair_applied {
                    if let Some(RepairAction::InstallBundler { package }) = detect_repair(project_dir) {
                        self.apply_repair(&tooling, package, project_dir, &build_env, deadline, log)
                            .await?;
                        return run_command(
                            cmd, &build_args, project_dir, &build_env, deadline, self.timeout, log,
                        )
                        .await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn apply_repair(
        &self,
        tooling: &Tooling,
        package: &str,
        project_dir: &Path,
        env: &[(String, String)],
        deadline: Instant,
        log: &mut String,
    ) -> Result<()> {
        let line = format!("[executor] {package} missing -> installing devDependency");
        info!("{line}");
        log.push_str(&line);
        log.push('\n');
        let args = tooling.manager.add_dev_args(package);
        run_command(
            tooling.manager.command(),
            &args,
            project_dir,
            env,
            deadline,
            self.timeout,
            log,
        )
        .await
    }

    async fn run_container(
        &self,
        project_dir: &Path,
        allow_scripts: bool,
        deadline: Instant,
        log: &mut String,
    ) -> Result<()> {
        let args = container_args(project_dir, allow_scripts, &self.container_image);
        let line = format!("[executor] docker {}", args.join(" "));
        info!("{line}");
        log.push_str(&line);
        log.push('\n');
        run_command("docker", &args, project_dir, &[], deadline, self.timeout, log).await
    }
}

/// Spawn one command with captured output and a hard deadline.
///
/// The child is placed in its own process group; on timeout the entire group
/// is SIGKILLed so build-tool grandchildren do not outlive the invocation.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    envs: &[(String, String)],
    deadline: Instant,
    total_timeout: Duration,
    log: &mut String,
) -> Result<()> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(PipelineError::Timeout(total_timeout));
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in envs {
        cmd.env(k, v);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| PipelineError::BuildFailed {
        stderr_tail: format!("failed to spawn {program}: {e}"),
    })?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = match tokio::time::timeout(remaining, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(PipelineError::BuildFailed {
                stderr_tail: format!("failed to wait for {program}: {e}"),
            });
        }
        Err(_) => {
            kill_process_group(&child);
            let _ = child.start_kill();
            let _ = child.wait().await;
            if let (Ok(out), Ok(err)) = (out_task.await, err_task.await) {
                log.push_str(&String::from_utf8_lossy(&out));
                log.push_str(&String::from_utf8_lossy(&err));
            }
            return Err(PipelineError::Timeout(total_timeout));
        }
    };

    let out = out_task.await.unwrap_or_default();
    let err = err_task.await.unwrap_or_default();
    let stderr_text = String::from_utf8_lossy(&err).into_owned();
    log.push_str(&String::from_utf8_lossy(&out));
    log.push_str(&stderr_text);

    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::BuildFailed {
            stderr_tail: tail(&stderr_text, STDERR_TAIL_LEN),
        })
    }
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
