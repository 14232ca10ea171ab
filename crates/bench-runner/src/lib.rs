use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const RUN_COMMAND: &str = "run.sh";
pub const STRESS_CATEGORY: &str = "stress";
pub const SWEEP_TOKEN: &str = "n";

/// Entries that belong to the workspace baseline rather than to any case.
/// The workspace doubles as the backing root of the passthrough/tracer mounts
/// and as a container bind source, so it permanently carries an OS subtree plus
/// the tracer's own log and readiness marker. These survive every cleanup and
/// are never collected into the results tree.
pub const WORKSPACE_BASELINE: &[&str] = &[
    "bin", "boot", "dev", "etc", "home", "lib", "lib32", "lib64", "libx32", "media", "mnt", "opt",
    "proc", "root", "run", "sbin", "srv", "sys", "tmp", "usr", "var", "tracer.log",
    ".cairn-fuse-ready",
];

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("case discovery failed: {reason}")]
    Discovery { reason: String },
    #[error("staging {case} failed: {reason}")]
    Staging { case: String, reason: String },
    #[error("measuring {case} under {strategy} failed: {reason}")]
    Measurement {
        case: String,
        strategy: &'static str,
        reason: String,
    },
    #[error("result collection failed: {reason}")]
    Collection { reason: String },
    #[error("invalid invocation: {reason}")]
    Invocation { reason: String },
    #[error("bad configuration: {reason}")]
    Config { reason: String },
}

impl HarnessError {
    fn discovery(reason: impl Into<String>) -> Self {
        HarnessError::Discovery {
            reason: reason.into(),
        }
    }

    fn collection(reason: impl Into<String>) -> Self {
        HarnessError::Collection {
            reason: reason.into(),
        }
    }

    fn invocation(reason: impl Into<String>) -> Self {
        HarnessError::Invocation {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SweepRange {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl Default for SweepRange {
    fn default() -> Self {
        SweepRange {
            start: 1,
            end: 10,
            step: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub commands_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub benchmarks_dir: PathBuf,
    pub tool: String,
    pub warmup: u32,
    pub sweep: SweepRange,
    pub tracer_container: String,
    pub fs_container: String,
    pub container_workdir: String,
    pub fuse_mount: String,
    pub fuse_lowlevel_mount: String,
    pub tracer_mount: String,
    pub tracer_root: String,
    pub tracer_bin: String,
    pub report_script: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            commands_dir: PathBuf::from("commands"),
            workspace_dir: PathBuf::from("workspace"),
            benchmarks_dir: PathBuf::from("benchmarks"),
            tool: "hyperfine".to_string(),
            warmup: 3,
            sweep: SweepRange::default(),
            tracer_container: "cairn-dev".to_string(),
            fs_container: "fuse-dev".to_string(),
            container_workdir: "/bench".to_string(),
            fuse_mount: "/mnt/fuse".to_string(),
            fuse_lowlevel_mount: "/mnt/fuse-ll".to_string(),
            tracer_mount: "/mnt/cairn".to_string(),
            tracer_root: "/opt/cairn/root".to_string(),
            tracer_bin: "fsatrace".to_string(),
            report_script: None,
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let raw = fs::read_to_string(path).map_err(|e| HarnessError::Config {
            reason: format!("{}: {}", path.display(), e),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| HarnessError::Config {
            reason: format!("{}: {}", path.display(), e),
        })
    }

    /// Resolves the harness directories against the current working
    /// directory. The benchmarking tool is spawned with the workspace as its
    /// cwd, so a relative export path would resolve against the workspace
    /// instead of where the harness expects it.
    pub fn absolutized(&self) -> Result<Self, HarnessError> {
        let cwd = std::env::current_dir().map_err(|e| HarnessError::Config {
            reason: format!("resolving working directory: {}", e),
        })?;
        let mut cfg = self.clone();
        cfg.commands_dir = absolutize(&cwd, &cfg.commands_dir);
        cfg.workspace_dir = absolutize(&cwd, &cfg.workspace_dir);
        cfg.benchmarks_dir = absolutize(&cwd, &cfg.benchmarks_dir);
        Ok(cfg)
    }
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
}

impl Session {
    pub fn begin() -> Self {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let rev = source_revision().unwrap_or_else(|| "nogit".to_string());
        Session {
            id: format!("{}_{}", stamp, rev),
        }
    }
}

fn source_revision() -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if rev.is_empty() {
        None
    } else {
        Some(rev)
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkCase {
    pub category: String,
    pub name: String,
    pub dir: PathBuf,
    pub aux_tool: Option<PathBuf>,
}

impl BenchmarkCase {
    pub fn id(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    pub fn sweeps(&self) -> bool {
        self.category == STRESS_CATEGORY
    }
}

pub struct CaseRepository {
    root: PathBuf,
}

impl CaseRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CaseRepository { root: root.into() }
    }

    pub fn list_cases(&self) -> Result<Vec<BenchmarkCase>, HarnessError> {
        if !self.root.is_dir() {
            return Err(HarnessError::discovery(format!(
                "case root not found: {}",
                self.root.display()
            )));
        }
        let mut categories = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| HarnessError::discovery(e.to_string()))?
        {
            let entry = entry.map_err(|e| HarnessError::discovery(e.to_string()))?;
            if entry
                .file_type()
                .map_err(|e| HarnessError::discovery(e.to_string()))?
                .is_dir()
            {
                categories.push(entry.path());
            }
        }
        categories.sort();

        let mut cases = Vec::new();
        for category_dir in categories {
            let category = category_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut case_dirs = Vec::new();
            let mut aux_files = Vec::new();
            for entry in
                fs::read_dir(&category_dir).map_err(|e| HarnessError::discovery(e.to_string()))?
            {
                let entry = entry.map_err(|e| HarnessError::discovery(e.to_string()))?;
                let file_type = entry
                    .file_type()
                    .map_err(|e| HarnessError::discovery(e.to_string()))?;
                if file_type.is_dir() {
                    case_dirs.push(entry.path());
                } else if file_type.is_file() && category == STRESS_CATEGORY {
                    aux_files.push(entry.path());
                }
            }
            if case_dirs.is_empty() {
                warn!("category {} has no cases, skipping", category);
                continue;
            }
            case_dirs.sort();
            aux_files.sort();
            let aux_tool = aux_files.into_iter().next();
            for dir in case_dirs {
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                cases.push(BenchmarkCase {
                    category: category.clone(),
                    name,
                    dir,
                    aux_tool: aux_tool.clone(),
                });
            }
        }
        if cases.is_empty() {
            return Err(HarnessError::discovery(format!(
                "no benchmark cases under {}",
                self.root.display()
            )));
        }
        Ok(cases)
    }
}

pub struct WorkspaceManager {
    dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, HarnessError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| HarnessError::Config {
            reason: format!("workspace {}: {}", dir.display(), e),
        })?;
        Ok(WorkspaceManager { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Removes everything staged or produced since the last baseline, keeping
    /// the allow-listed host subtrees that the mounts depend on.
    pub fn restore(&self) -> io::Result<()> {
        restore_baseline(&self.dir)
    }

    pub fn stage(&self, case: &BenchmarkCase) -> Result<StagedWorkspace<'_>, HarnessError> {
        // Guard first: a half-staged workspace must still be torn down.
        let staged = StagedWorkspace { dir: &self.dir };
        let fail = |reason: String| HarnessError::Staging {
            case: case.id(),
            reason,
        };
        copy_dir_filtered(&case.dir, &self.dir, &[]).map_err(|e| fail(e.to_string()))?;
        if case.category == STRESS_CATEGORY {
            if let Some(tool) = &case.aux_tool {
                let file_name = tool
                    .file_name()
                    .ok_or_else(|| fail(format!("bad auxiliary tool path: {}", tool.display())))?;
                let dest = self.dir.join(file_name);
                fs::copy(tool, &dest).map_err(|e| fail(e.to_string()))?;
                make_executable(&dest).map_err(|e| fail(e.to_string()))?;
            }
        }
        let run = self.dir.join(RUN_COMMAND);
        if !run.is_file() {
            return Err(fail(format!("{} missing", RUN_COMMAND)));
        }
        make_executable(&run)
            .map_err(|e| fail(format!("cannot mark {} executable: {}", RUN_COMMAND, e)))?;
        Ok(staged)
    }
}

#[derive(Debug)]
pub struct StagedWorkspace<'a> {
    dir: &'a Path,
}

impl StagedWorkspace<'_> {
    pub fn dir(&self) -> &Path {
        self.dir
    }
}

impl Drop for StagedWorkspace<'_> {
    fn drop(&mut self) {
        if let Err(e) = restore_baseline(self.dir) {
            warn!("workspace cleanup failed: {}", e);
        }
    }
}

fn restore_baseline(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if WORKSPACE_BASELINE.contains(&name.as_ref()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Local,
    Containerized,
    FuseMounted,
    FuseLowLevel,
    ChrootWrapped,
    DirectTrace,
    TracerPassive,
    TracerActive,
}

impl Strategy {
    pub const ALL: [Strategy; 8] = [
        Strategy::Local,
        Strategy::Containerized,
        Strategy::FuseMounted,
        Strategy::FuseLowLevel,
        Strategy::ChrootWrapped,
        Strategy::DirectTrace,
        Strategy::TracerPassive,
        Strategy::TracerActive,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Strategy::Local => "local",
            Strategy::Containerized => "docker",
            Strategy::FuseMounted => "fuse",
            Strategy::FuseLowLevel => "fuse_ll",
            Strategy::ChrootWrapped => "chroot",
            Strategy::DirectTrace => "fsatrace",
            Strategy::TracerPassive => "cairn_notrace",
            Strategy::TracerActive => "cairn_trace",
        }
    }

    pub fn invocation(
        self,
        cfg: &BenchConfig,
        sweep: Option<SweepRange>,
    ) -> Result<Invocation, HarnessError> {
        let run = match sweep {
            Some(_) => format!("./{} {{{}}}", RUN_COMMAND, SWEEP_TOKEN),
            None => format!("./{}", RUN_COMMAND),
        };
        let workspace = cfg.workspace_dir.clone();
        let workspace_str = cfg.workspace_dir.display().to_string();
        let builder = match self {
            Strategy::Local => InvocationBuilder::new(run, workspace),
            Strategy::Containerized => {
                // Inputs are copied into the long-lived container, executed
                // there, and purged afterwards; produced artifacts come back
                // to the workspace for collection.
                let exec = format!(
                    "docker exec {} sh -c 'cd {} && {}'",
                    cfg.tracer_container, cfg.container_workdir, run
                );
                InvocationBuilder::new(exec, workspace)
                    .prepare(ShellStep::new(
                        "docker",
                        &[
                            "exec",
                            cfg.tracer_container.as_str(),
                            "mkdir",
                            "-p",
                            cfg.container_workdir.as_str(),
                        ],
                    ))
                    .prepare(ShellStep::new(
                        "docker",
                        &[
                            "cp",
                            &format!("{}/.", workspace_str),
                            &format!("{}:{}", cfg.tracer_container, cfg.container_workdir),
                        ],
                    ))
                    .conclude(ShellStep::new(
                        "docker",
                        &[
                            "cp",
                            &format!("{}:{}/.", cfg.tracer_container, cfg.container_workdir),
                            workspace_str.as_str(),
                        ],
                    ))
                    .conclude(ShellStep::new(
                        "docker",
                        &[
                            "exec",
                            cfg.tracer_container.as_str(),
                            "rm",
                            "-rf",
                            cfg.container_workdir.as_str(),
                        ],
                    ))
            }
            Strategy::FuseMounted => {
                let exec = format!(
                    "docker exec {} sh -c 'cd {} && {}'",
                    cfg.fs_container, cfg.fuse_mount, run
                );
                InvocationBuilder::new(exec, workspace)
            }
            Strategy::FuseLowLevel => {
                let exec = format!(
                    "docker exec {} sh -c 'cd {} && {}'",
                    cfg.fs_container, cfg.fuse_lowlevel_mount, run
                );
                InvocationBuilder::new(exec, workspace)
            }
            Strategy::ChrootWrapped => {
                // Pivoting the root onto the mount isolates path resolution
                // from the container's own exec overhead.
                let exec = format!(
                    "docker exec {} chroot {} sh -c 'cd / && {}'",
                    cfg.fs_container, cfg.fuse_mount, run
                );
                InvocationBuilder::new(exec, workspace)
            }
            Strategy::DirectTrace => {
                let exec = format!("{} rwmdq tracer.log -- {}", cfg.tracer_bin, run);
                InvocationBuilder::new(exec, workspace)
            }
            Strategy::TracerPassive => {
                let exec = format!(
                    "docker exec {} sh -c 'cd {} && {}'",
                    cfg.tracer_container, cfg.tracer_root, run
                );
                InvocationBuilder::new(exec, workspace)
            }
            Strategy::TracerActive => {
                let exec = format!(
                    "docker exec {} sh -c 'cd {} && {}'",
                    cfg.tracer_container, cfg.tracer_mount, run
                );
                InvocationBuilder::new(exec, workspace)
            }
        };
        let builder = match sweep {
            Some(range) => builder.sweep(range),
            None => builder,
        };
        builder.build()
    }
}

#[derive(Debug, Clone)]
pub struct ShellStep {
    program: String,
    args: Vec<String>,
}

impl ShellStep {
    fn new(program: &str, args: &[&str]) -> Self {
        ShellStep {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    fn run(&self) -> Result<(), String> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .map_err(|e| format!("{}: {}", self.describe(), e))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {}", self.describe(), status))
        }
    }
}

/// One fully materialized (case, strategy) execution: the command string the
/// benchmarking tool measures, where to spawn it, and the setup/teardown steps
/// that frame the measurement.
#[derive(Debug)]
pub struct Invocation {
    pub command: String,
    pub workdir: PathBuf,
    pub prepare: Vec<ShellStep>,
    pub conclude: Vec<ShellStep>,
    pub sweep: Option<SweepRange>,
}

pub struct InvocationBuilder {
    command: String,
    workdir: PathBuf,
    prepare: Vec<ShellStep>,
    conclude: Vec<ShellStep>,
    sweep: Option<SweepRange>,
}

impl InvocationBuilder {
    fn new(command: impl Into<String>, workdir: PathBuf) -> Self {
        InvocationBuilder {
            command: command.into(),
            workdir,
            prepare: Vec::new(),
            conclude: Vec::new(),
            sweep: None,
        }
    }

    fn prepare(mut self, step: ShellStep) -> Self {
        self.prepare.push(step);
        self
    }

    fn conclude(mut self, step: ShellStep) -> Self {
        self.conclude.push(step);
        self
    }

    fn sweep(mut self, range: SweepRange) -> Self {
        self.sweep = Some(range);
        self
    }

    fn build(self) -> Result<Invocation, HarnessError> {
        if self.command.trim().is_empty() {
            return Err(HarnessError::invocation("empty command"));
        }
        let token = format!("{{{}}}", SWEEP_TOKEN);
        match (self.sweep, self.command.contains(&token)) {
            (Some(_), false) => {
                return Err(HarnessError::invocation(format!(
                    "sweep configured but command lacks {}",
                    token
                )));
            }
            (None, true) => {
                return Err(HarnessError::invocation(format!(
                    "command references {} without a sweep",
                    token
                )));
            }
            _ => {}
        }
        if let Some(range) = self.sweep {
            if range.step <= 0 || range.end < range.start {
                return Err(HarnessError::invocation(format!(
                    "bad sweep range {}..{} step {}",
                    range.start, range.end, range.step
                )));
            }
        }
        Ok(Invocation {
            command: self.command,
            workdir: self.workdir,
            prepare: self.prepare,
            conclude: self.conclude,
            sweep: self.sweep,
        })
    }
}

pub struct MeasurementRunner {
    tool: String,
    warmup: u32,
}

impl MeasurementRunner {
    pub fn new(cfg: &BenchConfig) -> Self {
        MeasurementRunner {
            tool: cfg.tool.clone(),
            warmup: cfg.warmup,
        }
    }

    pub fn export_name(strategy: Strategy, session: &Session) -> String {
        format!("{}_{}.json", strategy.prefix(), session.id)
    }

    pub fn measure(
        &self,
        case: &BenchmarkCase,
        strategy: Strategy,
        invocation: &Invocation,
        export: &Path,
    ) -> Result<(), HarnessError> {
        let mut failure: Option<String> = None;
        for step in &invocation.prepare {
            if let Err(reason) = step.run() {
                failure = Some(reason);
                break;
            }
        }
        if failure.is_none() {
            let args = measurement_args(self.warmup, invocation.sweep, export, &invocation.command);
            match Command::new(&self.tool)
                .args(&args)
                .current_dir(&invocation.workdir)
                .status()
            {
                Ok(status) if status.success() => {}
                Ok(status) => failure = Some(format!("{} exited with {}", self.tool, status)),
                Err(e) => failure = Some(format!("{}: {}", self.tool, e)),
            }
        }
        // Teardown always runs, even after a failed prepare step or
        // measurement, so the container copy never leaks into the next pair.
        for step in &invocation.conclude {
            if let Err(reason) = step.run() {
                warn!("conclude step failed: {}", reason);
            }
        }
        match failure {
            Some(reason) => Err(HarnessError::Measurement {
                case: case.id(),
                strategy: strategy.prefix(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

fn measurement_args(
    warmup: u32,
    sweep: Option<SweepRange>,
    export: &Path,
    command: &str,
) -> Vec<String> {
    let mut args = vec!["--warmup".to_string(), warmup.to_string()];
    if let Some(range) = sweep {
        args.push("--parameter-scan".to_string());
        args.push(SWEEP_TOKEN.to_string());
        args.push(range.start.to_string());
        args.push(range.end.to_string());
        args.push("-D".to_string());
        args.push(range.step.to_string());
    }
    args.push("--export-json".to_string());
    args.push(export.to_string_lossy().to_string());
    args.push(command.to_string());
    args
}

pub struct ResultCollector {
    root: PathBuf,
}

impl ResultCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ResultCollector { root: root.into() }
    }

    pub fn collect(
        &self,
        workspace: &Path,
        category: &str,
        name: &str,
    ) -> Result<(), HarnessError> {
        let dest = self.root.join(category).join(name);
        fs::create_dir_all(&dest).map_err(|e| HarnessError::collection(e.to_string()))?;
        for entry in fs::read_dir(workspace).map_err(|e| HarnessError::collection(e.to_string()))?
        {
            let entry = entry.map_err(|e| HarnessError::collection(e.to_string()))?;
            let file_name = entry.file_name();
            let printable = file_name.to_string_lossy();
            if WORKSPACE_BASELINE.contains(&printable.as_ref()) {
                continue;
            }
            let target = dest.join(&file_name);
            let file_type = entry
                .file_type()
                .map_err(|e| HarnessError::collection(e.to_string()))?;
            if file_type.is_symlink() {
                let link = fs::read_link(entry.path())
                    .map_err(|e| HarnessError::collection(e.to_string()))?;
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target)
                        .map_err(|e| HarnessError::collection(e.to_string()))?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&link, &target)
                    .map_err(|e| HarnessError::collection(e.to_string()))?;
                #[cfg(not(unix))]
                {
                    let _ = link;
                    warn!("skipping symlink {}", printable);
                }
            } else if file_type.is_dir() {
                if target.exists() {
                    fs::remove_dir_all(&target)
                        .map_err(|e| HarnessError::collection(e.to_string()))?;
                }
                copy_dir_filtered(&entry.path(), &target, &[])
                    .map_err(|e| HarnessError::collection(e.to_string()))?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &target)
                    .map_err(|e| HarnessError::collection(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub session: String,
    pub archive: PathBuf,
    pub cases: usize,
    pub measurements: usize,
    pub failures: usize,
}

pub struct RunCoordinator {
    cfg: BenchConfig,
}

impl RunCoordinator {
    pub fn new(cfg: BenchConfig) -> Self {
        RunCoordinator { cfg }
    }

    pub fn run(&self) -> Result<SessionOutcome, HarnessError> {
        let cfg = self.cfg.absolutized()?;
        let cases = CaseRepository::new(&cfg.commands_dir).list_cases()?;
        let session = Session::begin();
        info!("session {} starting with {} cases", session.id, cases.len());

        let tree = cfg.benchmarks_dir.join(&session.id);
        fs::create_dir_all(&tree).map_err(|e| {
            HarnessError::collection(format!("results tree {}: {}", tree.display(), e))
        })?;
        let manager = WorkspaceManager::new(&cfg.workspace_dir)?;
        let runner = MeasurementRunner::new(&cfg);
        let collector = ResultCollector::new(&tree);

        let mut measurements = 0usize;
        let mut failures = 0usize;
        for case in &cases {
            let sweep = if case.sweeps() { Some(cfg.sweep) } else { None };
            for strategy in Strategy::ALL {
                info!("{} under {}", case.id(), strategy.prefix());
                let staged = match manager.stage(case) {
                    Ok(staged) => staged,
                    Err(e) => {
                        // A case that cannot stage once cannot stage for any
                        // strategy; skip the whole case.
                        warn!("{}", e);
                        failures += 1;
                        break;
                    }
                };
                let export = staged
                    .dir()
                    .join(MeasurementRunner::export_name(strategy, &session));
                let measured = strategy
                    .invocation(&cfg, sweep)
                    .and_then(|invocation| runner.measure(case, strategy, &invocation, &export));
                match measured {
                    Ok(()) => measurements += 1,
                    Err(e) => {
                        // The export stays absent for this pair; the matrix
                        // keeps going.
                        warn!("{}", e);
                        failures += 1;
                    }
                }
                if let Err(e) = collector.collect(staged.dir(), &case.category, &case.name) {
                    warn!("{}", e);
                    failures += 1;
                }
            }
        }

        if let Err(e) = write_session_manifest(&tree, &session, cfg.warmup) {
            warn!("{}", e);
        }
        self.generate_reports(&tree);

        let archive = cfg.benchmarks_dir.join(format!("{}.zip", session.id));
        archive_results(&tree, &archive)?;
        fs::remove_dir_all(&tree).map_err(|e| {
            HarnessError::collection(format!("discarding {}: {}", tree.display(), e))
        })?;
        info!("session {} archived to {}", session.id, archive.display());

        Ok(SessionOutcome {
            session: session.id.clone(),
            archive,
            cases: cases.len(),
            measurements,
            failures,
        })
    }

    fn generate_reports(&self, tree: &Path) {
        let Some(script) = &self.cfg.report_script else {
            return;
        };
        // Full tree first, then the stress subtree for the scaling plots.
        for target in [tree.to_path_buf(), tree.join(STRESS_CATEGORY)] {
            if !target.is_dir() {
                continue;
            }
            match Command::new(script).arg(&target).status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(
                    "report generator exited with {} for {}",
                    status,
                    target.display()
                ),
                Err(e) => warn!("report generator failed: {}", e),
            }
        }
    }
}

fn write_session_manifest(tree: &Path, session: &Session, warmup: u32) -> Result<(), HarnessError> {
    let suffix = format!("{}.json", session.id);
    let mut exports = Vec::new();
    for entry in WalkDir::new(tree).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(&suffix) {
            continue;
        }
        let digest =
            sha256_file(entry.path()).map_err(|e| HarnessError::collection(e.to_string()))?;
        let rel = entry.path().strip_prefix(tree).unwrap_or(entry.path());
        exports.push(json!({
            "path": rel.to_string_lossy(),
            "sha256": digest,
        }));
    }
    let manifest = json!({
        "schema_version": "bench_session_v1",
        "session": session.id,
        "warmup": warmup,
        "created_at": Utc::now().to_rfc3339(),
        "exports": exports,
    });
    let bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| HarnessError::collection(e.to_string()))?;
    atomic_write(&tree.join("manifest.json"), &bytes)
        .map_err(|e| HarnessError::collection(e.to_string()))
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

pub fn archive_results(tree: &Path, dest: &Path) -> Result<PathBuf, HarnessError> {
    let fail = |reason: String| HarnessError::Collection { reason };
    let file = fs::File::create(dest).map_err(|e| fail(format!("{}: {}", dest.display(), e)))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for entry in WalkDir::new(tree) {
        let entry = entry.map_err(|e| fail(e.to_string()))?;
        let rel = match entry.path().strip_prefix(tree) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|e| fail(e.to_string()))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(name, options)
                .map_err(|e| fail(e.to_string()))?;
            let mut src = fs::File::open(entry.path()).map_err(|e| fail(e.to_string()))?;
            io::copy(&mut src, &mut writer).map_err(|e| fail(e.to_string()))?;
        }
    }
    writer.finish().map_err(|e| fail(e.to_string()))?;
    Ok(dest.to_path_buf())
}

fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        rel.as_os_str().is_empty() || !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    for entry in walker {
        let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.exists() {
                let _ = fs::remove_file(&target);
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            let _ = link;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
